// SPDX-License-Identifier: Apache-2.0
//! The system: a mixture, a rule list, named expressions, and the Gillespie
//! direct-method scheduler.
//!
//! One step (`update`) advances the clock by an exponential waiting time at
//! the total reactivity, picks a rule weighted by per-rule reactivity, asks
//! it for an update, and applies it. Per-rule reactivities are cached and
//! invalidated only when the mixture actually changes, so a run of null
//! events costs no recounting.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::Exp;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::warn;

use crate::algebra::{AlgebraError, Env, Expr, Value};
use crate::mixture::{Mixture, MixtureError};
use crate::pattern::Component;
use crate::rule::{Rule, RuleError};

/// Errors from system construction and stepping.
#[derive(Debug, Error)]
pub enum SystemError {
    /// An expression referenced a name that is neither a variable nor an
    /// observable.
    #[error("expression references undefined name: {0}")]
    UndefinedName(String),
    /// Two declarations share a name.
    #[error("duplicate declaration name: {0}")]
    DuplicateName(String),
    /// A lookup referred to a name that was never declared.
    #[error("no observable or variable named: {0}")]
    UnknownName(String),
    /// An observable count was requested for a component with no tracked
    /// isomorph.
    #[error("no tracked component isomorphic to the requested observable")]
    UnknownObservable,
    /// Rule construction failed.
    #[error(transparent)]
    Rule(#[from] RuleError),
    /// A mixture edit failed.
    #[error(transparent)]
    Mixture(#[from] MixtureError),
    /// Expression evaluation failed.
    #[error(transparent)]
    Algebra(#[from] AlgebraError),
    /// Rule reactivities could not be sampled (non-finite weights).
    #[error("rule reactivities are not sampleable")]
    InvalidReactivities,
}

/// Application/failure counters for one rule.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct RuleTally {
    /// Successful applications.
    pub applied: u64,
    /// Null events (selection produced no update).
    pub failed: u64,
}

/// What one scheduler step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// A rule fired and the mixture changed.
    Applied {
        /// Index of the rule that fired.
        rule: usize,
    },
    /// A rule was chosen but its selection collided; the clock advanced,
    /// the mixture did not change.
    Null {
        /// Index of the rule that was chosen.
        rule: usize,
    },
    /// Total reactivity was zero; nothing happened.
    Stalled,
}

/// Records observable values over time.
#[derive(Debug, Default)]
pub struct Monitor {
    names: Vec<String>,
    times: Vec<f64>,
    rows: Vec<Vec<f64>>,
}

impl Monitor {
    fn new(names: Vec<String>) -> Self {
        Self {
            names,
            times: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn record(&mut self, time: f64, row: Vec<f64>) {
        debug_assert_eq!(row.len(), self.names.len());
        self.times.push(time);
        self.rows.push(row);
    }

    /// The observable names, in recording order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The recorded time points.
    #[must_use]
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Number of recorded snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True if nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// The recorded series of one observable.
    #[must_use]
    pub fn series(&self, name: &str) -> Option<Vec<f64>> {
        let ix = self.names.iter().position(|n| n == name)?;
        Some(self.rows.iter().map(|row| row[ix]).collect())
    }
}

/// Evaluation environment over a system's mixture and name tables.
struct EvalCtx<'a> {
    mixture: &'a Mixture,
    variables: &'a BTreeMap<String, Expr>,
    observables: &'a BTreeMap<String, Expr>,
}

impl Env for EvalCtx<'_> {
    fn named(&self, name: &str) -> Option<&Expr> {
        self.variables
            .get(name)
            .or_else(|| self.observables.get(name))
    }

    fn component_count(&self, component: &Component) -> Option<f64> {
        self.mixture.embedding_count(component).map(|n| n as f64)
    }
}

/// Fluent constructor for [`System`].
///
/// `build()` performs every construction-time validation: name resolution,
/// duplicate detection, rule legality (already checked per rule), component
/// tracking, and initial instantiation.
#[derive(Default)]
pub struct SystemBuilder {
    rules: Vec<Rule>,
    variables: Vec<(String, Expr)>,
    observables: Vec<(String, Expr)>,
    inits: Vec<(crate::pattern::Pattern, usize)>,
    seed: Option<u64>,
    monitored: bool,
    max_consecutive_nulls: u32,
}

impl SystemBuilder {
    /// A builder with no rules, names, or initial mixture contents.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_consecutive_nulls: 100,
            ..Self::default()
        }
    }

    /// Adds a rule.
    #[must_use]
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Adds several rules.
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Declares a named variable.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.variables.push((name.into(), expr.into()));
        self
    }

    /// Declares a named observable.
    #[must_use]
    pub fn observable(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.observables.push((name.into(), expr.into()));
        self
    }

    /// Schedules `count` copies of `pattern` in the initial mixture.
    #[must_use]
    pub fn init(mut self, pattern: crate::pattern::Pattern, count: usize) -> Self {
        self.inits.push((pattern, count));
        self
    }

    /// Seeds the PRNG for a reproducible trajectory.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Enables per-step observable recording.
    #[must_use]
    pub fn monitored(mut self, monitored: bool) -> Self {
        self.monitored = monitored;
        self
    }

    /// Number of consecutive null events tolerated before a warning is
    /// logged.
    #[must_use]
    pub fn max_consecutive_nulls(mut self, max: u32) -> Self {
        self.max_consecutive_nulls = max;
        self
    }

    /// Validates and assembles the system.
    pub fn build(self) -> Result<System, SystemError> {
        let mut variables = BTreeMap::new();
        for (name, expr) in self.variables {
            if variables.insert(name.clone(), expr).is_some() {
                return Err(SystemError::DuplicateName(name));
            }
        }
        let mut observables = BTreeMap::new();
        for (name, expr) in self.observables {
            if variables.contains_key(&name)
                || observables.insert(name.clone(), expr).is_some()
            {
                return Err(SystemError::DuplicateName(name));
            }
        }

        let defined: FxHashSet<&str> = variables
            .keys()
            .chain(observables.keys())
            .map(String::as_str)
            .collect();
        let all_exprs = variables
            .values()
            .chain(observables.values())
            .chain(self.rules.iter().map(Rule::rate));
        for expr in all_exprs.clone() {
            for name in expr.names() {
                if !defined.contains(name) {
                    return Err(SystemError::UndefinedName(name.to_owned()));
                }
            }
        }

        let mut mixture = Mixture::new();
        track_all(&mut mixture, &self.rules, all_exprs)?;
        for (pattern, count) in &self.inits {
            mixture.instantiate(pattern, *count)?;
        }

        let monitor = self
            .monitored
            .then(|| Monitor::new(observables.keys().cloned().collect()));
        let tallies = vec![RuleTally::default(); self.rules.len()];
        let rng = self
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        Ok(System {
            mixture,
            rules: self.rules,
            tallies,
            variables,
            observables,
            time: 0.0,
            rng,
            reactivities: None,
            monitor,
            max_consecutive_nulls: self.max_consecutive_nulls,
            consecutive_nulls: 0,
        })
    }
}

/// Tracks every component the rules and expressions mention.
fn track_all<'a>(
    mixture: &mut Mixture,
    rules: &[Rule],
    exprs: impl Iterator<Item = &'a Expr>,
) -> Result<(), MixtureError> {
    for rule in rules {
        for component in rule.left().components() {
            mixture.track_component(component)?;
        }
    }
    for expr in exprs {
        for component in expr.components() {
            mixture.track_component(component)?;
        }
    }
    Ok(())
}

/// A stochastic simulation: mixture, rules, named expressions, clock,
/// tallies, and the scheduler.
pub struct System {
    mixture: Mixture,
    rules: Vec<Rule>,
    tallies: Vec<RuleTally>,
    variables: BTreeMap<String, Expr>,
    observables: BTreeMap<String, Expr>,
    time: f64,
    rng: SmallRng,
    reactivities: Option<Vec<f64>>,
    monitor: Option<Monitor>,
    max_consecutive_nulls: u32,
    consecutive_nulls: u32,
}

impl System {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> SystemBuilder {
        SystemBuilder::new()
    }

    /// The live mixture.
    #[must_use]
    pub fn mixture(&self) -> &Mixture {
        &self.mixture
    }

    /// The simulated time.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// The rule list.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Per-rule application/failure tallies, indexed like
    /// [`System::rules`].
    #[must_use]
    pub fn tallies(&self) -> &[RuleTally] {
        &self.tallies
    }

    /// The monitor, when recording is enabled.
    #[must_use]
    pub fn monitor(&self) -> Option<&Monitor> {
        self.monitor.as_ref()
    }

    /// Adds `count` copies of `pattern` to the mixture.
    pub fn instantiate(
        &mut self,
        pattern: &crate::pattern::Pattern,
        count: usize,
    ) -> Result<(), SystemError> {
        self.mixture.instantiate(pattern, count)?;
        self.reactivities = None;
        Ok(())
    }

    /// Evaluates the named observable or variable.
    pub fn value(&self, name: &str) -> Result<Value, SystemError> {
        let ctx = self.ctx();
        let expr = ctx
            .named(name)
            .ok_or_else(|| SystemError::UnknownName(name.to_owned()))?;
        Ok(expr.evaluate(&ctx)?)
    }

    /// The embedding count of an observable component, resolving through
    /// isomorphism when the exact component is not tracked.
    pub fn observable_count(&self, component: &Component) -> Result<usize, SystemError> {
        self.mixture
            .embedding_count(component)
            .ok_or(SystemError::UnknownObservable)
    }

    /// The per-rule reactivities, recomputing them if stale.
    pub fn rule_reactivities(&mut self) -> Result<&[f64], SystemError> {
        self.refresh_reactivities()?;
        match &self.reactivities {
            Some(values) => Ok(values),
            None => Ok(&[]),
        }
    }

    /// The total reactivity.
    pub fn reactivity(&mut self) -> Result<f64, SystemError> {
        Ok(self.rule_reactivities()?.iter().sum())
    }

    /// Advances the clock by an exponential waiting time at the total
    /// reactivity, returning the increment. With zero total reactivity the
    /// clock is left unchanged (and a warning is logged).
    pub fn wait(&mut self) -> Result<f64, SystemError> {
        let total = self.reactivity()?;
        if total <= 0.0 || !total.is_finite() {
            warn!(total, "system has no reactivity: infinite wait time");
            return Ok(0.0);
        }
        let Ok(exp) = Exp::new(total) else {
            return Err(SystemError::InvalidReactivities);
        };
        let dt = exp.sample(&mut self.rng);
        self.time += dt;
        Ok(dt)
    }

    /// Chooses a rule index weighted by reactivity, or `None` when every
    /// weight is zero (logged as a warning).
    pub fn choose_rule(&mut self) -> Result<Option<usize>, SystemError> {
        self.refresh_reactivities()?;
        let Some(weights) = &self.reactivities else {
            return Ok(None);
        };
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SystemError::InvalidReactivities);
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            warn!("system has no reactivity: no rule applied");
            return Ok(None);
        }
        let Ok(index) = WeightedIndex::new(weights.iter().copied()) else {
            return Err(SystemError::InvalidReactivities);
        };
        Ok(Some(index.sample(&mut self.rng)))
    }

    /// Asks rule `rule` for a selection and applies it. Returns `true` when
    /// the mixture changed, `false` on a null event.
    pub fn apply_rule(&mut self, rule: usize) -> Result<bool, SystemError> {
        let Some(chosen) = self.rules.get(rule) else {
            return Ok(false);
        };
        match chosen.select(&self.mixture, &mut self.rng) {
            Some(update) => {
                self.mixture.apply_update(update)?;
                self.tallies[rule].applied += 1;
                self.reactivities = None;
                self.consecutive_nulls = 0;
                Ok(true)
            }
            None => {
                self.tallies[rule].failed += 1;
                self.consecutive_nulls += 1;
                if self.consecutive_nulls == self.max_consecutive_nulls {
                    warn!(
                        count = self.consecutive_nulls,
                        "many consecutive null events"
                    );
                }
                Ok(false)
            }
        }
    }

    /// One Gillespie step: wait, choose, apply, snapshot.
    pub fn update(&mut self) -> Result<StepOutcome, SystemError> {
        let dt = self.wait()?;
        let outcome = if dt == 0.0 {
            StepOutcome::Stalled
        } else {
            match self.choose_rule()? {
                None => StepOutcome::Stalled,
                Some(rule) => {
                    if self.apply_rule(rule)? {
                        StepOutcome::Applied { rule }
                    } else {
                        StepOutcome::Null { rule }
                    }
                }
            }
        };
        self.snapshot()?;
        Ok(outcome)
    }

    /// Replaces the mixture wholesale (re-tracking every component the
    /// rules and expressions mention) and advances the clock by `dt`. The
    /// handoff half of an external-simulator round-trip.
    pub fn replace_mixture(&mut self, mut mixture: Mixture, dt: f64) -> Result<(), SystemError> {
        let exprs = self
            .variables
            .values()
            .chain(self.observables.values())
            .chain(self.rules.iter().map(Rule::rate));
        track_all(&mut mixture, &self.rules, exprs)?;
        self.mixture = mixture;
        self.time += dt;
        self.reactivities = None;
        Ok(())
    }

    /// The canonical textual dump: variables, rules, observables, then
    /// `%init:` lines grouping the live complexes by isomorphism.
    #[must_use]
    pub fn kappa_str(&self) -> String {
        let mut out = String::new();
        for (name, expr) in &self.variables {
            out.push_str(&format!("%var: '{name}' {expr}\n"));
        }
        for rule in &self.rules {
            out.push_str(&format!("{rule}\n"));
        }
        for (name, expr) in &self.observables {
            out.push_str(&format!("%obs: '{name}' {expr}\n"));
        }
        for (component, count) in self.mixture.census() {
            out.push_str(&format!("%init: {count} {component}\n"));
        }
        out
    }

    fn ctx(&self) -> EvalCtx<'_> {
        EvalCtx {
            mixture: &self.mixture,
            variables: &self.variables,
            observables: &self.observables,
        }
    }

    fn refresh_reactivities(&mut self) -> Result<(), SystemError> {
        if self.reactivities.is_some() {
            return Ok(());
        }
        let ctx = EvalCtx {
            mixture: &self.mixture,
            variables: &self.variables,
            observables: &self.observables,
        };
        let mut values = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            values.push(rule.reactivity(&self.mixture, &ctx)?);
        }
        self.reactivities = Some(values);
        Ok(())
    }

    fn snapshot(&mut self) -> Result<(), SystemError> {
        if self.monitor.is_none() {
            return Ok(());
        }
        let ctx = EvalCtx {
            mixture: &self.mixture,
            variables: &self.variables,
            observables: &self.observables,
        };
        let mut row = Vec::with_capacity(self.observables.len());
        for expr in self.observables.values() {
            row.push(expr.evaluate(&ctx)?.as_number());
        }
        let time = self.time;
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.record(time, row);
        }
        Ok(())
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("time", &self.time)
            .field("rules", &self.rules.len())
            .field("mixture", &self.mixture)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::algebra::BinaryOp;
    use crate::pattern::{AgentPattern, Pattern, SitePattern};

    fn unbind_rule() -> Rule {
        let left = Pattern::new(vec![
            AgentPattern::new("A", [SitePattern::new("a").bond(1)]),
            AgentPattern::new("B", [SitePattern::new("b").bond(1)]),
        ])
        .unwrap();
        let right = Pattern::new(vec![
            AgentPattern::new("A", [SitePattern::new("a").empty()]),
            AgentPattern::new("B", [SitePattern::new("b").empty()]),
        ])
        .unwrap();
        Rule::new(left, right, 1.0).unwrap()
    }

    fn dimer_pattern() -> Pattern {
        Pattern::new(vec![
            AgentPattern::new("A", [SitePattern::new("a").bond(1)]),
            AgentPattern::new("B", [SitePattern::new("b").bond(1)]),
        ])
        .unwrap()
    }

    #[test]
    fn variables_chain_through_the_environment() {
        let system = System::builder()
            .variable("x", 0.03)
            .variable("k_on", Expr::binary(BinaryOp::Mul, Expr::var("x"), Expr::num(10.0)))
            .variable(
                "g_on",
                Expr::binary(BinaryOp::Div, Expr::var("k_on"), Expr::num(100.0)),
            )
            .build()
            .unwrap();
        let g_on = system.value("g_on").unwrap().as_number();
        assert!((g_on - 0.003).abs() < 1e-12);
    }

    #[test]
    fn undefined_names_fail_construction() {
        let err = System::builder().variable("x", Expr::var("missing")).build();
        assert!(matches!(err, Err(SystemError::UndefinedName(name)) if name == "missing"));
    }

    #[test]
    fn duplicate_names_fail_construction() {
        let err = System::builder()
            .variable("x", 1.0)
            .observable("x", 2.0)
            .build();
        assert!(matches!(err, Err(SystemError::DuplicateName(name)) if name == "x"));
    }

    #[test]
    fn observables_count_embeddings() {
        let obs = dimer_pattern().into_component().unwrap();
        let system = System::builder()
            .rule(unbind_rule())
            .observable("pairs", Expr::count(obs))
            .init(dimer_pattern(), 10)
            .seed(1)
            .build()
            .unwrap();
        assert_eq!(system.value("pairs").unwrap().as_number(), 10.0);
    }

    #[test]
    fn stalled_system_leaves_time_unchanged() {
        let mut system = System::builder().seed(3).build().unwrap();
        let outcome = system.update().unwrap();
        assert_eq!(outcome, StepOutcome::Stalled);
        assert_eq!(system.time(), 0.0);
    }

    #[test]
    fn unbinding_runs_to_completion() {
        let obs = dimer_pattern().into_component().unwrap();
        let mut system = System::builder()
            .rule(unbind_rule())
            .observable("pairs", Expr::count(obs))
            .init(dimer_pattern(), 10)
            .seed(42)
            .monitored(true)
            .build()
            .unwrap();

        let mut last = 10.0;
        for _ in 0..10 {
            let outcome = system.update().unwrap();
            assert!(matches!(outcome, StepOutcome::Applied { rule: 0 }));
            let pairs = system.value("pairs").unwrap().as_number();
            assert!(pairs < last);
            last = pairs;
        }
        assert_eq!(last, 0.0);
        assert_eq!(system.tallies()[0].applied, 10);
        assert_eq!(system.tallies()[0].failed, 0);
        assert!(system.time() > 0.0);

        // Fully unbound: no reactivity left.
        assert_eq!(system.update().unwrap(), StepOutcome::Stalled);
        let monitor = system.monitor().unwrap();
        let series = monitor.series("pairs").unwrap();
        assert_eq!(series.first().copied(), Some(9.0));
        assert_eq!(series.last().copied(), Some(0.0));
    }

    #[test]
    fn dump_lists_declarations_and_census() {
        let obs = dimer_pattern().into_component().unwrap();
        let system = System::builder()
            .rule(unbind_rule())
            .variable("k", 2.5)
            .observable("pairs", Expr::count(obs))
            .init(dimer_pattern(), 3)
            .seed(0)
            .build()
            .unwrap();
        let dump = system.kappa_str();
        assert!(dump.contains("%var: 'k' 2.5"));
        assert!(dump.contains("%obs: 'pairs' |A(a[1]), B(b[1])|"));
        assert!(dump.contains("%init: 3 A(a[1]), B(b[1])"));
        assert!(dump.contains("-> A(a[.]), B(b[.]) @ 1"));
    }
}
