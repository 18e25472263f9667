// SPDX-License-Identifier: Apache-2.0
//! Rewrite rules: a left pattern, a right pattern of equal slot count, and a
//! rate expression.
//!
//! A rule's reactivity is `n_embeddings × rate`. The three molecularity
//! variants differ only in how embeddings are counted and sampled:
//!
//! - **default** — the product of the per-component embedding counts;
//!   components are sampled independently (over-counting image collisions,
//!   which surface as null events, matching mass-action kinetics);
//! - **unimolecular** — all components must embed inside one mixture
//!   complex; complexes are weighted by their per-complex products;
//! - **bimolecular** — exactly two components, which must embed into two
//!   *distinct* complexes.
//!
//! Selection translates a sampled embedding into a [`MixtureUpdate`] by
//! walking the paired left/right slots; rules never mutate the mixture
//! directly.

use std::cell::RefCell;
use std::fmt;

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::algebra::{AlgebraError, Env, Expr};
use crate::edge::{AgentRef, PendingSiteRef, SiteRef};
use crate::ident::{AgentId, ComplexId};
use crate::mixture::{Embedding, Mixture, MixtureUpdate};
use crate::pattern::{AgentPattern, Component, Pattern};
use crate::sample::rejection_sample;
use crate::state::{InternalState, LinkPattern};

/// Errors raised while constructing a rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    /// Left and right patterns must pair up slot by slot.
    #[error("left pattern has {left} slots but right pattern has {right}")]
    SlotCountMismatch {
        /// Left slot count.
        left: usize,
        /// Right slot count.
        right: usize,
    },
    /// A bimolecular left pattern must consist of exactly two components.
    #[error("bimolecular rule needs exactly 2 left components, found {0}")]
    BimolecularArity(usize),
    /// Right-hand sites may only be bonded, free, or left alone.
    #[error("illegal link predicate on right-hand site {agent}.{site}")]
    IllegalRightLink {
        /// Agent type carrying the site.
        agent: String,
        /// Site label.
        site: String,
    },
    /// Right-hand internal states may only be concrete or left alone.
    #[error("illegal internal-state predicate on right-hand site {agent}.{site}")]
    IllegalRightState {
        /// Agent type carrying the site.
        agent: String,
        /// Site label.
        site: String,
    },
}

/// How a rule constrains the complexes its components embed into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Molecularity {
    /// Components sampled independently across the whole mixture.
    Default,
    /// Every component inside one mixture complex.
    Unimolecular,
    /// Two components in two distinct mixture complexes.
    Bimolecular,
}

/// A rewrite rule.
pub struct Rule {
    left: Pattern,
    right: Pattern,
    rate: Expr,
    molecularity: Molecularity,
    // Per-complex weights cached by `n_embeddings` for the uni/bimolecular
    // variants; `select` consumes them. Stale weights surface as null
    // events, never as panics.
    complex_weights: RefCell<Vec<(ComplexId, u64)>>,
}

impl Rule {
    /// A default-molecularity rule.
    pub fn new(left: Pattern, right: Pattern, rate: impl Into<Expr>) -> Result<Self, RuleError> {
        Self::with_molecularity(left, right, rate, Molecularity::Default)
    }

    /// A unimolecular rule.
    pub fn unimolecular(
        left: Pattern,
        right: Pattern,
        rate: impl Into<Expr>,
    ) -> Result<Self, RuleError> {
        Self::with_molecularity(left, right, rate, Molecularity::Unimolecular)
    }

    /// A bimolecular rule; the left pattern must have exactly two
    /// components.
    pub fn bimolecular(
        left: Pattern,
        right: Pattern,
        rate: impl Into<Expr>,
    ) -> Result<Self, RuleError> {
        Self::with_molecularity(left, right, rate, Molecularity::Bimolecular)
    }

    /// Builds a rule, validating slot pairing and right-hand legality.
    pub fn with_molecularity(
        left: Pattern,
        right: Pattern,
        rate: impl Into<Expr>,
        molecularity: Molecularity,
    ) -> Result<Self, RuleError> {
        if left.len() != right.len() {
            return Err(RuleError::SlotCountMismatch {
                left: left.len(),
                right: right.len(),
            });
        }
        for agent in right.slots().flatten() {
            validate_right_agent(agent)?;
        }
        if molecularity == Molecularity::Bimolecular && left.components().len() != 2 {
            return Err(RuleError::BimolecularArity(left.components().len()));
        }
        Ok(Self {
            left,
            right,
            rate: rate.into(),
            molecularity,
            complex_weights: RefCell::new(Vec::new()),
        })
    }

    /// The forward/reverse pair of a `<->` declaration.
    pub fn reversible(
        left: Pattern,
        right: Pattern,
        forward: impl Into<Expr>,
        reverse: impl Into<Expr>,
    ) -> Result<(Self, Self), RuleError> {
        Ok((
            Self::new(left.clone(), right.clone(), forward)?,
            Self::new(right, left, reverse)?,
        ))
    }

    /// The rule pair of an ambiguous-molecularity declaration
    /// `@ bi {uni}`: a bimolecular rule at the plain rate and a unimolecular
    /// rule at the brace rate. A literal-zero rate omits that variant.
    pub fn molecularity_split(
        left: Pattern,
        right: Pattern,
        bi_rate: impl Into<Expr>,
        uni_rate: impl Into<Expr>,
    ) -> Result<Vec<Self>, RuleError> {
        let bi_rate = bi_rate.into();
        let uni_rate = uni_rate.into();
        let mut rules = Vec::new();
        if !bi_rate.is_zero() {
            rules.push(Self::bimolecular(left.clone(), right.clone(), bi_rate)?);
        }
        if !uni_rate.is_zero() {
            rules.push(Self::unimolecular(left, right, uni_rate)?);
        }
        Ok(rules)
    }

    /// The left pattern.
    #[must_use]
    pub fn left(&self) -> &Pattern {
        &self.left
    }

    /// The right pattern.
    #[must_use]
    pub fn right(&self) -> &Pattern {
        &self.right
    }

    /// The rate expression.
    #[must_use]
    pub fn rate(&self) -> &Expr {
        &self.rate
    }

    /// The molecularity variant.
    #[must_use]
    pub fn molecularity(&self) -> Molecularity {
        self.molecularity
    }

    /// The stochastic rate under the given environment.
    pub fn rate_value(&self, env: &dyn Env) -> Result<f64, AlgebraError> {
        Ok(self.rate.evaluate(env)?.as_number())
    }

    /// `n_embeddings × rate`: the rule's propensity.
    pub fn reactivity(&self, mixture: &Mixture, env: &dyn Env) -> Result<f64, AlgebraError> {
        Ok(self.n_embeddings(mixture) as f64 * self.rate_value(env)?)
    }

    /// The number of ways the left pattern embeds in the mixture, under this
    /// rule's molecularity. Also refreshes the per-complex weight cache for
    /// the uni/bimolecular variants.
    #[must_use]
    pub fn n_embeddings(&self, mixture: &Mixture) -> u64 {
        match self.molecularity {
            Molecularity::Default => self
                .left
                .components()
                .iter()
                .map(|c| mixture.embedding_count(c).unwrap_or(0) as u64)
                .product(),
            Molecularity::Unimolecular => {
                let mut weights = self.complex_weights.borrow_mut();
                weights.clear();
                let mut total = 0u64;
                for (complex, _) in mixture.complexes() {
                    let weight: u64 = self
                        .left
                        .components()
                        .iter()
                        .map(|c| mixture.count_in_complex(c, complex) as u64)
                        .product();
                    if weight > 0 {
                        weights.push((complex, weight));
                        total += weight;
                    }
                }
                total
            }
            Molecularity::Bimolecular => {
                let (first, second) = match self.left.components() {
                    [first, second] => (first, second),
                    _ => return 0,
                };
                let outside_total = mixture.embedding_count(second).unwrap_or(0) as u64;
                let mut weights = self.complex_weights.borrow_mut();
                weights.clear();
                let mut total = 0u64;
                for (complex, _) in mixture.complexes() {
                    let inside_first = mixture.count_in_complex(first, complex) as u64;
                    if inside_first == 0 {
                        continue;
                    }
                    let inside_second = mixture.count_in_complex(second, complex) as u64;
                    let weight = inside_first * outside_total.saturating_sub(inside_second);
                    if weight > 0 {
                        weights.push((complex, weight));
                        total += weight;
                    }
                }
                total
            }
        }
    }

    /// Samples one embedding of the left pattern and translates it into an
    /// update.
    ///
    /// Returns `None` for a null event: the sampled component images
    /// collided, or the cached per-complex weights pointed at a choice the
    /// current mixture no longer offers. For the uni/bimolecular variants,
    /// [`Rule::n_embeddings`] must have run since the mixture last changed.
    pub fn select<R: Rng + ?Sized>(&self, mixture: &Mixture, rng: &mut R) -> Option<MixtureUpdate> {
        let mut images: FxHashMap<usize, AgentId> = FxHashMap::default();
        let mut used: FxHashSet<AgentId> = FxHashSet::default();
        match self.molecularity {
            Molecularity::Default => {
                for component in self.left.components() {
                    let set = mixture.embeddings(component)?;
                    let embedding = set.random(rng)?;
                    if !merge_images(component, embedding, &mut images, &mut used) {
                        return None;
                    }
                }
            }
            Molecularity::Unimolecular => {
                let complex = self.choose_complex(rng)?;
                for component in self.left.components() {
                    let bucket = mixture.embeddings_in_complex(component, complex)?;
                    let embedding = bucket.random(rng)?;
                    if !merge_images(component, embedding, &mut images, &mut used) {
                        return None;
                    }
                }
            }
            Molecularity::Bimolecular => {
                let complex = self.choose_complex(rng)?;
                let (first, second) = match self.left.components() {
                    [first, second] => (first, second),
                    _ => return None,
                };
                let inside = mixture.embeddings_in_complex(first, complex)?;
                let e1 = inside.random(rng)?.clone();
                let population = mixture.embeddings(second)?;
                let excluded = mixture.embeddings_in_complex(second, complex);
                let e2 = rejection_sample(population, excluded, rng)?.clone();
                if !merge_images(first, &e1, &mut images, &mut used)
                    || !merge_images(second, &e2, &mut images, &mut used)
                {
                    return None;
                }
            }
        }
        self.produce_update(&images, mixture)
    }

    fn choose_complex<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ComplexId> {
        let weights = self.complex_weights.borrow();
        let total: u64 = weights.iter().map(|(_, w)| w).sum();
        if total == 0 {
            return None;
        }
        let mut x = rng.gen_range(0..total);
        for (complex, weight) in weights.iter() {
            if x < *weight {
                return Some(*complex);
            }
            x -= weight;
        }
        None
    }

    /// Builds the update for a concrete left-to-mixture selection by walking
    /// the paired slots, then wiring every bond the right pattern mentions.
    fn produce_update(
        &self,
        images: &FxHashMap<usize, AgentId>,
        mixture: &Mixture,
    ) -> Option<MixtureUpdate> {
        let mut update = MixtureUpdate::new();
        let mut new_selection: Vec<Option<AgentRef>> = vec![None; self.left.len()];

        for i in 0..self.left.len() {
            match (self.left.slot(i), self.right.slot(i)) {
                (None, None) => {}
                (None, Some(created)) => {
                    new_selection[i] = Some(update.create_agent(created).ok()?);
                }
                (Some(_), None) => {
                    update.remove_agent(mixture, *images.get(&i)?).ok()?;
                }
                (Some(l), Some(r)) => {
                    let host = *images.get(&i)?;
                    if l.ty() == r.ty() {
                        let host_agent = mixture.agent(host)?;
                        for r_site in r.sites() {
                            if !matches!(r_site.internal, InternalState::Tag(_)) {
                                continue;
                            }
                            let unchanged = l
                                .site(&r_site.label)
                                .is_some_and(|(_, l_site)| l_site.internal == r_site.internal);
                            if unchanged {
                                continue;
                            }
                            let (s_ix, _) = host_agent.site(&r_site.label)?;
                            update.set_internal_state(
                                SiteRef {
                                    agent: host,
                                    site: s_ix,
                                },
                                r_site.internal.clone(),
                            );
                        }
                        new_selection[i] = Some(AgentRef::Existing(host));
                    } else {
                        update.remove_agent(mixture, host).ok()?;
                        new_selection[i] = Some(update.create_agent(r).ok()?);
                    }
                }
            }
        }

        for i in 0..self.right.len() {
            let Some(r) = self.right.slot(i) else { continue };
            let me = new_selection.get(i).copied().flatten()?;
            for (p_ix, r_site) in r.sites().iter().enumerate() {
                match &r_site.link {
                    LinkPattern::Site(partner) => {
                        let partner_pattern = self.right.slot(partner.slot)?;
                        let partner_site = partner_pattern.sites().get(partner.site)?;
                        let my_ref = site_ref(mixture, me, p_ix, &r_site.label)?;
                        let partner_sel = new_selection.get(partner.slot).copied().flatten()?;
                        let partner_ref =
                            site_ref(mixture, partner_sel, partner.site, &partner_site.label)?;
                        update.connect_sites(mixture, my_ref, partner_ref);
                    }
                    LinkPattern::Empty => {
                        if let AgentRef::Existing(id) = me {
                            if let Some((s_ix, _)) = mixture.agent(id)?.site(&r_site.label) {
                                update.disconnect_site(
                                    mixture,
                                    SiteRef {
                                        agent: id,
                                        site: s_ix,
                                    },
                                );
                            }
                        }
                    }
                    LinkPattern::Undetermined => {}
                    // Ruled out by construction-time validation.
                    LinkPattern::Wildcard
                    | LinkPattern::Bound
                    | LinkPattern::SiteType { .. }
                    | LinkPattern::Label(_) => return None,
                }
            }
        }
        Some(update)
    }
}

/// Resolves the update-time address of a right-hand site on either an
/// existing host agent (looked up by label) or an agent created by the same
/// update (positional).
fn site_ref(
    mixture: &Mixture,
    agent: AgentRef,
    pattern_site: usize,
    label: &str,
) -> Option<PendingSiteRef> {
    match agent {
        AgentRef::Existing(id) => {
            let (s_ix, _) = mixture.agent(id)?.site(label)?;
            Some(PendingSiteRef {
                agent: AgentRef::Existing(id),
                site: s_ix,
            })
        }
        AgentRef::New(ix) => Some(PendingSiteRef {
            agent: AgentRef::New(ix),
            site: pattern_site,
        }),
    }
}

/// Merges one component embedding into the running slot→agent selection,
/// failing on an image collision.
fn merge_images(
    component: &Component,
    embedding: &Embedding,
    images: &mut FxHashMap<usize, AgentId>,
    used: &mut FxHashSet<AgentId>,
) -> bool {
    for (member, agent) in embedding.images().iter().enumerate() {
        if !used.insert(*agent) {
            return false;
        }
        images.insert(component.slot_of(member), *agent);
    }
    true
}

fn validate_right_agent(agent: &AgentPattern) -> Result<(), RuleError> {
    for site in agent.sites() {
        if matches!(site.internal, InternalState::Wildcard) {
            return Err(RuleError::IllegalRightState {
                agent: agent.ty().to_owned(),
                site: site.label.clone(),
            });
        }
        match site.link {
            LinkPattern::Site(_) | LinkPattern::Empty | LinkPattern::Undetermined => {}
            LinkPattern::Wildcard
            | LinkPattern::Bound
            | LinkPattern::SiteType { .. }
            | LinkPattern::Label(_) => {
                return Err(RuleError::IllegalRightLink {
                    agent: agent.ty().to_owned(),
                    site: site.label.clone(),
                });
            }
        }
    }
    Ok(())
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} @ ", self.left, self.right)?;
        match self.molecularity {
            Molecularity::Default => write!(f, "{}", self.rate),
            Molecularity::Unimolecular => write!(f, "0 {{{}}}", self.rate),
            Molecularity::Bimolecular => write!(f, "{} {{0}}", self.rate),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("left", &self.left.to_string())
            .field("right", &self.right.to_string())
            .field("molecularity", &self.molecularity)
            .finish_non_exhaustive()
    }
}
