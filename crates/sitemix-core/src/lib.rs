// SPDX-License-Identifier: Apache-2.0
//! sitemix-core: a stochastic simulator for rule-based site-graph rewriting
//! models.
//!
//! A model declares typed agents with named sites, an initial mixture of
//! agent instances wired by bonds, rewrite rules (left pattern → right
//! pattern at a rate), and observables. The engine runs a continuous-time
//! Markov chain over the mixture with the Gillespie direct method, keeping a
//! live embedding index per tracked pattern component so each step costs
//! roughly the rule's reach rather than the mixture size.
//!
//! The three load-bearing subsystems:
//!
//! - the **pattern layer** ([`pattern`], [`state`]) — immutable site/agent
//!   templates with predicate-valued states, embedding enumeration, and
//!   isomorphism;
//! - the **mixture** ([`mixture`], [`indexed_set`]) — the live graph, its
//!   complex partition, and the incrementally maintained embedding sets;
//! - the **rewrite engine and scheduler** ([`rule`], [`system`]) — sampling
//!   rules by propensity (with unimolecular/bimolecular refinement),
//!   translating selections into graph deltas, and applying them atomically.
//!
//! # Example
//!
//! Ten A–B dimers unbinding to completion:
//!
//! ```rust
//! use sitemix_core::{
//!     AgentPattern, Expr, Pattern, Rule, SitePattern, StepOutcome, System,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bound = Pattern::new(vec![
//!     AgentPattern::new("A", [SitePattern::new("a").bond(1)]),
//!     AgentPattern::new("B", [SitePattern::new("b").bond(1)]),
//! ])?;
//! let free = Pattern::new(vec![
//!     AgentPattern::new("A", [SitePattern::new("a").empty()]),
//!     AgentPattern::new("B", [SitePattern::new("b").empty()]),
//! ])?;
//!
//! let mut system = System::builder()
//!     .rule(Rule::new(bound.clone(), free, 1.0)?)
//!     .observable("pairs", Expr::count(bound.clone().into_component()?))
//!     .init(bound, 10)
//!     .seed(7)
//!     .build()?;
//!
//! while !matches!(system.update()?, StepOutcome::Stalled) {}
//! assert_eq!(system.value("pairs")?.as_number(), 0.0);
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

/// Algebraic expressions for rates, variables, and observables.
pub mod algebra;
/// Chemistry constants and rate conversion helpers.
pub mod chem;
/// Bond endpoints and the unordered edge key.
pub mod edge;
/// Typed identifiers.
pub mod ident;
/// The indexed-set container.
pub mod indexed_set;
/// The live mixture and its update machinery.
pub mod mixture;
/// Patterns, components, and the embedding matcher.
pub mod pattern;
/// Rewrite rules.
pub mod rule;
/// Rejection sampling.
pub mod sample;
/// Site-state domains and predicate semantics.
pub mod state;
/// The system and scheduler.
pub mod system;

pub use algebra::{AlgebraError, Env, Expr, Value};
pub use edge::{AgentRef, Edge, PendingSiteRef, SiteRef};
pub use ident::{AgentId, ComplexId, ComponentId};
pub use indexed_set::{IndexedSet, IndexedSetError, Property};
pub use mixture::{
    Agent, Embedding, EmbeddingKey, EmbeddingSet, LinkState, Mixture, MixtureError, MixtureUpdate,
    Site,
};
pub use pattern::{AgentPattern, Component, Pattern, PatternError, PatternSiteRef, SitePattern};
pub use rule::{Molecularity, Rule, RuleError};
pub use state::{InternalState, LinkPattern};
pub use system::{Monitor, RuleTally, StepOutcome, System, SystemBuilder, SystemError};
