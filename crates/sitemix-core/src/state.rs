// SPDX-License-Identifier: Apache-2.0
//! Site-state domains: internal states and link (partner) states, in both
//! their concrete and predicate forms.
//!
//! A site carries two independent facets: an *internal* state (a tag from a
//! finite domain) and a *link* state (its bond partner). Patterns may use
//! predicate forms for either facet; the live mixture only ever holds
//! concrete forms. `embeds_in` defines the predicate semantics used by the
//! matcher; it is a pure function over these enums.

use std::fmt;

use crate::pattern::PatternSiteRef;

/// Internal state of a site.
///
/// `Tag` is the concrete form. `Undetermined` doubles as a concrete sentinel
/// ("no particular state") and as a pattern predicate equivalent to
/// [`InternalState::Wildcard`] in rules and observables. `Wildcard` is
/// pattern-only and never appears on a live mixture site.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum InternalState {
    /// A concrete tag, e.g. `{u}` or `{p}`.
    Tag(String),
    /// `{#}` — matches any internal state. Pattern-only.
    Wildcard,
    /// Unmentioned or `{?}` — no constraint when matching; the sentinel
    /// state when concrete.
    Undetermined,
}

impl InternalState {
    /// Concrete tag constructor.
    pub fn tag(name: impl Into<String>) -> Self {
        Self::Tag(name.into())
    }

    /// True if this state, read as a pattern predicate, accepts the concrete
    /// state `other`.
    #[must_use]
    pub fn embeds_in(&self, other: &Self) -> bool {
        match self {
            Self::Wildcard | Self::Undetermined => true,
            Self::Tag(tag) => matches!(other, Self::Tag(t) if t == tag),
        }
    }

    /// True if the state places no constraint at all.
    #[must_use]
    pub fn is_undetermined(&self) -> bool {
        matches!(self, Self::Undetermined)
    }
}

/// Link (partner) state of a pattern site.
///
/// `Label` exists only while a pattern is being assembled: construction
/// resolves every bond label into a pair of [`LinkPattern::Site`]
/// cross-references, and patterns holding unresolved labels are rejected.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum LinkPattern {
    /// `[.]` — the site must be free.
    Empty,
    /// `[#]` — no constraint on the link.
    Wildcard,
    /// Unmentioned — no constraint when matching; free when instantiated.
    Undetermined,
    /// `[_]` — the site must be bound, to anything.
    Bound,
    /// `[site.Agent]` — the site must be bound to a site with the given
    /// label on an agent of the given type.
    SiteType {
        /// Required label of the partner site.
        site: String,
        /// Required type of the partner's agent.
        agent: String,
    },
    /// `[n]` — unresolved bond label; pattern-assembly only.
    Label(u32),
    /// Resolved cross-reference to the partner site within the same pattern.
    Site(PatternSiteRef),
}

impl LinkPattern {
    /// True if the link places no constraint at all.
    #[must_use]
    pub fn is_undetermined(&self) -> bool {
        matches!(self, Self::Undetermined)
    }

    /// True if this form may appear in a pattern used for matching (i.e. the
    /// pattern has been fully resolved).
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Label(_))
    }
}

impl fmt::Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, "{{{tag}}}"),
            Self::Wildcard => f.write_str("{#}"),
            Self::Undetermined => Ok(()),
        }
    }
}
