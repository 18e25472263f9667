// SPDX-License-Identifier: Apache-2.0
//! Typed identifiers for mixture agents, mixture complexes, and pattern
//! components.
//!
//! Identity here is allocation order, not content: two structurally equal
//! components are still distinct observables, and a mixture agent keeps its
//! id for its whole lifetime. Dedicated wrappers prevent accidental mixing of
//! the three id spaces.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a concrete agent owned by a
/// [`Mixture`](crate::mixture::Mixture).
///
/// Allocated by the mixture when an agent is instantiated or created by a
/// rule application; never reused within one mixture.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AgentId(pub u64);

/// Identifier of a connected component of the live mixture (a "complex").
///
/// Complexes are created by agent addition and by bond removal that splits a
/// complex, and destroyed by agent removal and by merges. Ids are never
/// reused within one mixture.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ComplexId(pub u64);

/// Identifier of a pattern [`Component`](crate::pattern::Component).
///
/// Every constructed component gets a fresh id, which is what the mixture's
/// embedding index is keyed by. Structural equality is a separate notion
/// (isomorphism) and is checked explicitly where needed.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ComponentId(pub u64);

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(0);

impl ComponentId {
    /// Allocates a process-unique component id.
    pub(crate) fn fresh() -> Self {
        Self(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}
