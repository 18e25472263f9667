// SPDX-License-Identifier: Apache-2.0
//! Bond endpoints and the unordered edge key.
//!
//! Live bonds are not separately owned structures; they exist as reciprocal
//! partner references on the two sites. [`Edge`] is the *key* form of a bond
//! used inside [`MixtureUpdate`](crate::mixture::MixtureUpdate) sets: an
//! unordered pair of endpoints, normalized at construction so that the same
//! bond hashes identically whichever way round it was named.

use crate::ident::AgentId;

/// A concrete site address: an agent in the mixture plus the position of the
/// site in that agent's interface.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SiteRef {
    /// Owning agent.
    pub agent: AgentId,
    /// Index of the site within the agent's interface.
    pub site: usize,
}

/// An agent named by a [`MixtureUpdate`](crate::mixture::MixtureUpdate):
/// either one already in the mixture, or the `i`-th agent the update itself
/// creates.
///
/// Ids for created agents are allocated only when the update is applied, so
/// edges that wire a new agent refer to it by its position in the update's
/// creation list.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum AgentRef {
    /// An agent already present in the mixture.
    Existing(AgentId),
    /// The `i`-th agent created by the same update.
    New(usize),
}

/// A site address usable inside an update: the agent part may be pending.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PendingSiteRef {
    /// Owning agent, possibly created by the same update.
    pub agent: AgentRef,
    /// Index of the site within the agent's interface.
    pub site: usize,
}

impl PendingSiteRef {
    /// Endpoint for a site of an agent already in the mixture.
    #[must_use]
    pub fn existing(site: SiteRef) -> Self {
        Self {
            agent: AgentRef::Existing(site.agent),
            site: site.site,
        }
    }
}

/// An unordered pair of bond endpoints, usable as a hash-map/set key.
///
/// `Edge::new(a, b)` and `Edge::new(b, a)` construct equal values.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Edge {
    lo: PendingSiteRef,
    hi: PendingSiteRef,
}

impl Edge {
    /// Builds the canonical form of the edge between `a` and `b`.
    #[must_use]
    pub fn new(a: PendingSiteRef, b: PendingSiteRef) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }

    /// The two endpoints, in canonical order.
    #[must_use]
    pub fn endpoints(&self) -> (PendingSiteRef, PendingSiteRef) {
        (self.lo, self.hi)
    }
}
