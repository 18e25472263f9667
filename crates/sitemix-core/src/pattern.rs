// SPDX-License-Identifier: Apache-2.0
//! The pattern layer: site/agent templates, connected components, patterns
//! with null slots, and the embedding matcher.
//!
//! Patterns are immutable once built. Construction resolves integer bond
//! labels into reciprocal site cross-references and splits the non-null
//! slots into connected [`Component`]s; everything downstream (tracking,
//! counting, rewriting) works per component.
//!
//! Matching walks a component breadth-first from its first agent: for every
//! host agent of the root's type, the bond structure forces at most one
//! candidate image, which is accepted iff every site predicate embeds in the
//! corresponding host site. `exact` mode tightens every check to equality
//! and is the basis of isomorphism.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::ident::ComponentId;
use crate::state::{InternalState, LinkPattern};

/// Errors raised while assembling a pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// A bond label must appear on exactly two sites of the same pattern.
    #[error("bond label {label} appears on {count} sites, expected exactly 2")]
    BondLabel {
        /// The offending label.
        label: u32,
        /// How many sites carried it.
        count: usize,
    },
    /// A single connected component was required.
    #[error("expected exactly one connected component, found {0}")]
    NotSingleComponent(usize),
}

/// Address of a site inside a pattern: slot index plus site index within the
/// slot's agent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PatternSiteRef {
    /// Pattern slot holding the owning agent.
    pub slot: usize,
    /// Index of the site within the agent's interface.
    pub site: usize,
}

/// A site template: label plus internal-state and link predicates.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SitePattern {
    /// Site label, unique within its agent.
    pub label: String,
    /// Internal-state predicate.
    pub internal: InternalState,
    /// Link predicate.
    pub link: LinkPattern,
}

impl SitePattern {
    /// A site with both facets undetermined.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            internal: InternalState::Undetermined,
            link: LinkPattern::Undetermined,
        }
    }

    /// Sets a concrete internal state, `{tag}`.
    #[must_use]
    pub fn state(mut self, tag: impl Into<String>) -> Self {
        self.internal = InternalState::Tag(tag.into());
        self
    }

    /// Sets the internal-state wildcard, `{#}`.
    #[must_use]
    pub fn state_wildcard(mut self) -> Self {
        self.internal = InternalState::Wildcard;
        self
    }

    /// Requires the site to be free, `[.]`.
    #[must_use]
    pub fn empty(mut self) -> Self {
        self.link = LinkPattern::Empty;
        self
    }

    /// Places no constraint on the link, `[#]`.
    #[must_use]
    pub fn link_wildcard(mut self) -> Self {
        self.link = LinkPattern::Wildcard;
        self
    }

    /// Requires the site to be bound to anything, `[_]`.
    #[must_use]
    pub fn bound(mut self) -> Self {
        self.link = LinkPattern::Bound;
        self
    }

    /// Declares a bond with the site sharing the label `n`, `[n]`.
    #[must_use]
    pub fn bond(mut self, n: u32) -> Self {
        self.link = LinkPattern::Label(n);
        self
    }

    /// Requires a bond to a site `site` on an agent of type `agent`,
    /// `[site.Agent]`.
    #[must_use]
    pub fn site_type(mut self, site: impl Into<String>, agent: impl Into<String>) -> Self {
        self.link = LinkPattern::SiteType {
            site: site.into(),
            agent: agent.into(),
        };
        self
    }

    /// True if neither facet constrains anything; such a site is
    /// interchangeable with an unmentioned one.
    #[must_use]
    pub fn is_undetermined(&self) -> bool {
        self.internal.is_undetermined() && self.link.is_undetermined()
    }

    /// True if this site's predicates accept the host site, compared form
    /// by form.
    ///
    /// Bond-target constraints (site-type predicates and resolved
    /// cross-references) are checked for bond *presence* only here; far-end
    /// agreement needs the whole component and is enforced by
    /// [`Component::embeddings`].
    #[must_use]
    pub fn embeds_in(&self, host: &Self) -> bool {
        if !self.internal.embeds_in(&host.internal) {
            return false;
        }
        match &self.link {
            LinkPattern::Wildcard | LinkPattern::Undetermined => true,
            LinkPattern::Empty => matches!(host.link, LinkPattern::Empty),
            LinkPattern::Bound
            | LinkPattern::SiteType { .. }
            | LinkPattern::Site(_)
            | LinkPattern::Label(_) => matches!(host.link, LinkPattern::Site(_)),
        }
    }
}

/// An agent template: a type name and an ordered interface of site
/// templates.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct AgentPattern {
    ty: String,
    sites: Vec<SitePattern>,
}

impl AgentPattern {
    /// Builds an agent template from its type and sites.
    pub fn new(ty: impl Into<String>, sites: impl IntoIterator<Item = SitePattern>) -> Self {
        Self {
            ty: ty.into(),
            sites: sites.into_iter().collect(),
        }
    }

    /// The agent type name.
    #[must_use]
    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// The ordered interface.
    #[must_use]
    pub fn sites(&self) -> &[SitePattern] {
        &self.sites
    }

    /// Finds a site by label.
    #[must_use]
    pub fn site(&self, label: &str) -> Option<(usize, &SitePattern)> {
        self.sites
            .iter()
            .enumerate()
            .find(|(_, s)| s.label == label)
    }

    /// True if this agent template, viewed in isolation, accepts the host
    /// agent: equal type, and every mentioned site embeds in the host's
    /// same-labeled site (a site the host lacks must be fully
    /// undetermined). The host may carry extra sites.
    ///
    /// Bond far-ends are not followed; see [`SitePattern::embeds_in`].
    #[must_use]
    pub fn embeds_in(&self, host: &Self) -> bool {
        self.ty == host.ty
            && self.sites.iter().all(|site| match host.site(&site.label) {
                Some((_, host_site)) => site.embeds_in(host_site),
                None => site.is_undetermined(),
            })
    }
}

/// Shared immutable slot storage viewed by a pattern and its components.
#[derive(Debug)]
pub(crate) struct PatternInner {
    pub(crate) slots: Vec<Option<AgentPattern>>,
}

impl PatternInner {
    fn agent(&self, slot: usize) -> &AgentPattern {
        match self.slots.get(slot).and_then(Option::as_ref) {
            Some(agent) => agent,
            // Components only ever index non-null slots they were built from.
            None => unreachable!("component member refers to a null slot"),
        }
    }
}

/// An ordered list of slots, each an agent template or an explicit hole,
/// with bond labels resolved and connected components precomputed.
///
/// Null slots exist for rewrite rules that create or delete agents at a
/// fixed position; they never participate in matching.
#[derive(Clone, Debug)]
pub struct Pattern {
    inner: Rc<PatternInner>,
    components: Vec<Component>,
}

impl Pattern {
    /// Builds a pattern from agent templates (no null slots).
    pub fn new(agents: impl IntoIterator<Item = AgentPattern>) -> Result<Self, PatternError> {
        Self::from_slots(agents.into_iter().map(Some).collect())
    }

    /// Builds a pattern from explicit slots, `None` marking a hole.
    ///
    /// Every integer bond label must appear on exactly two sites; the pair
    /// is replaced by reciprocal cross-references.
    pub fn from_slots(mut slots: Vec<Option<AgentPattern>>) -> Result<Self, PatternError> {
        resolve_bond_labels(&mut slots)?;
        let inner = Rc::new(PatternInner { slots });
        let components = split_components(&inner);
        Ok(Self { inner, components })
    }

    /// Number of slots, counting holes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    /// True if the pattern has no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// The agent at slot `i`, or `None` for a hole or out-of-range index.
    #[must_use]
    pub fn slot(&self, i: usize) -> Option<&AgentPattern> {
        self.inner.slots.get(i).and_then(Option::as_ref)
    }

    /// Iterates the slots in order.
    pub fn slots(&self) -> impl Iterator<Item = Option<&AgentPattern>> {
        self.inner.slots.iter().map(Option::as_ref)
    }

    /// The connected components over the non-null slots.
    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// True if any site carries a predicate that rules out instantiation
    /// (internal wildcard; wildcard, bound or site-type link).
    #[must_use]
    pub fn underspecified(&self) -> bool {
        self.slots().flatten().any(|agent| {
            agent.sites().iter().any(|site| {
                matches!(site.internal, InternalState::Wildcard)
                    || matches!(
                        site.link,
                        LinkPattern::Wildcard | LinkPattern::Bound | LinkPattern::SiteType { .. }
                    )
            })
        })
    }

    /// Depth-first traversal over the bond relation starting at `start`,
    /// returning slot indices in visit order. An empty result means `start`
    /// is a hole.
    #[must_use]
    pub fn depth_first_traversal(&self, start: usize) -> Vec<usize> {
        if self.slot(start).is_none() {
            return Vec::new();
        }
        let mut visited = FxHashSet::default();
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(slot) = stack.pop() {
            if !visited.insert(slot) {
                continue;
            }
            order.push(slot);
            if let Some(agent) = self.slot(slot) {
                for site in agent.sites() {
                    if let LinkPattern::Site(partner) = &site.link {
                        stack.push(partner.slot);
                    }
                }
            }
        }
        order
    }

    /// Consumes a single-component pattern, yielding its component.
    pub fn into_component(self) -> Result<Component, PatternError> {
        let mut components = self.components;
        if components.len() == 1 {
            Ok(components.swap_remove(0))
        } else {
            Err(PatternError::NotSingleComponent(components.len()))
        }
    }
}

fn resolve_bond_labels(slots: &mut [Option<AgentPattern>]) -> Result<(), PatternError> {
    let mut by_label: FxHashMap<u32, Vec<PatternSiteRef>> = FxHashMap::default();
    for (slot, agent) in slots.iter().enumerate() {
        let Some(agent) = agent else { continue };
        for (site, sp) in agent.sites.iter().enumerate() {
            if let LinkPattern::Label(n) = sp.link {
                by_label.entry(n).or_default().push(PatternSiteRef { slot, site });
            }
        }
    }
    for (label, ends) in by_label {
        let &[a, b] = ends.as_slice() else {
            return Err(PatternError::BondLabel {
                label,
                count: ends.len(),
            });
        };
        if let Some(agent) = slots[a.slot].as_mut() {
            agent.sites[a.site].link = LinkPattern::Site(b);
        }
        if let Some(agent) = slots[b.slot].as_mut() {
            agent.sites[b.site].link = LinkPattern::Site(a);
        }
    }
    Ok(())
}

fn split_components(inner: &Rc<PatternInner>) -> Vec<Component> {
    let mut seen = FxHashSet::default();
    let mut components = Vec::new();
    for slot in 0..inner.slots.len() {
        if inner.slots[slot].is_none() || seen.contains(&slot) {
            continue;
        }
        let mut members = Vec::new();
        let mut stack = vec![slot];
        while let Some(s) = stack.pop() {
            if !seen.insert(s) {
                continue;
            }
            members.push(s);
            for site in inner.agent(s).sites() {
                if let LinkPattern::Site(partner) = &site.link {
                    stack.push(partner.slot);
                }
            }
        }
        members.sort_unstable();
        components.push(Component::from_members(Rc::clone(inner), members));
    }
    components
}

/// A non-empty connected set of pattern agents.
///
/// Components are the unit of tracking, counting and observation. Each
/// constructed component has a fresh [`ComponentId`]; cloning preserves the
/// id (the clone *is* the same observable), while building an equal
/// component from scratch does not.
#[derive(Clone, Debug)]
pub struct Component {
    id: ComponentId,
    inner: Rc<PatternInner>,
    members: Vec<usize>,
    member_of_slot: FxHashMap<usize, usize>,
    by_type: FxHashMap<String, Vec<usize>>,
    diameter: usize,
}

impl Component {
    fn from_members(inner: Rc<PatternInner>, members: Vec<usize>) -> Self {
        let member_of_slot: FxHashMap<usize, usize> = members
            .iter()
            .enumerate()
            .map(|(m, slot)| (*slot, m))
            .collect();
        let mut by_type: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        for (m, slot) in members.iter().enumerate() {
            by_type
                .entry(inner.agent(*slot).ty.clone())
                .or_default()
                .push(m);
        }
        let mut component = Self {
            id: ComponentId::fresh(),
            inner,
            members,
            member_of_slot,
            by_type,
            diameter: 0,
        };
        component.diameter = component.compute_diameter();
        component
    }

    /// The component's identity.
    #[must_use]
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// Number of member agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Components are non-empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The member agent at index `m`.
    #[must_use]
    pub fn agent(&self, m: usize) -> &AgentPattern {
        self.inner.agent(self.members[m])
    }

    /// The pattern slot the member `m` came from.
    #[must_use]
    pub fn slot_of(&self, m: usize) -> usize {
        self.members[m]
    }

    /// The member index of a pattern slot, if that slot belongs to this
    /// component.
    #[must_use]
    pub fn member_of_slot(&self, slot: usize) -> Option<usize> {
        self.member_of_slot.get(&slot).copied()
    }

    /// Iterates the member agents in slot order.
    pub fn agents(&self) -> impl Iterator<Item = &AgentPattern> {
        self.members.iter().map(|slot| self.inner.agent(*slot))
    }

    /// The agent-type multiset of the component.
    #[must_use]
    pub fn composition(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for agent in self.agents() {
            *counts.entry(agent.ty()).or_insert(0) += 1;
        }
        counts
    }

    /// The longest shortest path between two members, in bond hops.
    #[must_use]
    pub fn diameter(&self) -> usize {
        self.diameter
    }

    fn compute_diameter(&self) -> usize {
        let n = self.members.len();
        let mut best = 0;
        for start in 0..n {
            let mut dist = vec![usize::MAX; n];
            dist[start] = 0;
            let mut queue = std::collections::VecDeque::from([start]);
            while let Some(m) = queue.pop_front() {
                for next in self.neighbors(m) {
                    if dist[next] == usize::MAX {
                        dist[next] = dist[m] + 1;
                        queue.push_back(next);
                    }
                }
            }
            best = best.max(dist.iter().copied().filter(|d| *d != usize::MAX).max().unwrap_or(0));
        }
        best
    }

    fn neighbors(&self, m: usize) -> impl Iterator<Item = usize> + '_ {
        self.agent(m).sites().iter().filter_map(|site| {
            if let LinkPattern::Site(partner) = &site.link {
                self.member_of_slot(partner.slot)
            } else {
                None
            }
        })
    }

    /// True if `self` and `other` match each other exactly, agent for agent.
    #[must_use]
    pub fn isomorphic(&self, other: &Self) -> bool {
        self.members.len() == other.members.len()
            && !self
                .enumerate_into(&ComponentTarget(other), true, true)
                .is_empty()
    }

    /// All embeddings of `self` into `other`, as member→member maps.
    ///
    /// With `exact`, site states must be equal rather than merely embed, and
    /// host sites not mentioned by the pattern must be undetermined; combined
    /// with an equal agent count this enumerates isomorphisms (and, against
    /// `self`, automorphisms).
    #[must_use]
    pub fn embeddings(&self, other: &Self, exact: bool) -> Vec<Vec<usize>> {
        self.enumerate_into(&ComponentTarget(other), exact, false)
    }

    /// Enumerates embeddings of this component into an arbitrary host.
    pub(crate) fn enumerate_into<T: MatchTarget>(
        &self,
        target: &T,
        exact: bool,
        first_only: bool,
    ) -> Vec<Vec<T::Node>> {
        let mut results = Vec::new();
        let root_ty = self.agent(0).ty();
        for b_root in target.candidates(root_ty) {
            if let Some(image) = self.try_embed(target, b_root, exact) {
                results.push(image);
                if first_only {
                    break;
                }
            }
        }
        results
    }

    /// Attempts the unique embedding rooted at `b_root`, if any.
    fn try_embed<T: MatchTarget>(
        &self,
        target: &T,
        b_root: T::Node,
        exact: bool,
    ) -> Option<Vec<T::Node>> {
        let n = self.members.len();
        let mut image: Vec<Option<T::Node>> = vec![None; n];
        let mut used: FxHashSet<T::Node> = FxHashSet::default();
        image[0] = Some(b_root);
        used.insert(b_root);
        let mut frontier = vec![0usize];

        while let Some(a_ix) = frontier.pop() {
            let b = image[a_ix]?;
            let a = self.agent(a_ix);
            if a.ty() != target.agent_type(b) {
                return None;
            }
            if exact && !self.extra_host_sites_undetermined(target, a, b) {
                return None;
            }
            for a_site in a.sites() {
                let Some(b_site) = target.site(b, &a_site.label) else {
                    if a_site.is_undetermined() {
                        continue;
                    }
                    return None;
                };
                let internal_ok = if exact {
                    a_site.internal == *b_site.internal
                } else {
                    a_site.internal.embeds_in(b_site.internal)
                };
                if !internal_ok {
                    return None;
                }
                match self.check_link(&a_site.link, &b_site.link, exact)? {
                    LinkCheck::Ok => {}
                    LinkCheck::Follow(b_partner) => {
                        let Some(a_partner) = self.partner_member(&a_site.link) else {
                            return None;
                        };
                        match image[a_partner] {
                            Some(existing) if existing == b_partner => {}
                            Some(_) => return None,
                            None => {
                                if !target.admits(b_partner) || !used.insert(b_partner) {
                                    return None;
                                }
                                image[a_partner] = Some(b_partner);
                                frontier.push(a_partner);
                            }
                        }
                    }
                }
            }
        }
        image.into_iter().collect()
    }

    /// In exact mode, every host site whose label the pattern agent does not
    /// mention must itself be fully undetermined.
    fn extra_host_sites_undetermined<T: MatchTarget>(
        &self,
        target: &T,
        a: &AgentPattern,
        b: T::Node,
    ) -> bool {
        for s_ix in 0..target.site_count(b) {
            let label = target.site_label(b, s_ix);
            if a.site(label).is_some() {
                continue;
            }
            let Some(view) = target.site(b, label) else {
                continue;
            };
            if !view.internal.is_undetermined() || !matches!(view.link, LinkView::Undetermined) {
                return false;
            }
        }
        true
    }

    /// Checks a link predicate against a host link, yielding `None` on
    /// mismatch and the partner to follow for resolved bonds.
    fn check_link<N: Copy>(
        &self,
        p: &LinkPattern,
        host: &LinkView<'_, N>,
        exact: bool,
    ) -> Option<LinkCheck<N>> {
        if exact {
            return match (p, host) {
                (LinkPattern::Empty, LinkView::Empty)
                | (LinkPattern::Wildcard, LinkView::Wildcard)
                | (LinkPattern::Undetermined, LinkView::Undetermined)
                | (LinkPattern::Bound, LinkView::Bound) => Some(LinkCheck::Ok),
                (
                    LinkPattern::SiteType { site, agent },
                    LinkView::SiteType {
                        site: h_site,
                        agent: h_agent,
                    },
                ) if site == h_site && agent == h_agent => Some(LinkCheck::Ok),
                (LinkPattern::Site(_), LinkView::Partner { .. }) => {
                    self.check_partner_link(p, host)
                }
                _ => None,
            };
        }
        match p {
            LinkPattern::Wildcard | LinkPattern::Undetermined => Some(LinkCheck::Ok),
            LinkPattern::Empty => matches!(host, LinkView::Empty).then_some(LinkCheck::Ok),
            LinkPattern::Bound => {
                matches!(host, LinkView::Partner { .. }).then_some(LinkCheck::Ok)
            }
            LinkPattern::SiteType { site, agent } => match host {
                LinkView::Partner {
                    label, agent_ty, ..
                } if label == site && agent_ty == agent => Some(LinkCheck::Ok),
                _ => None,
            },
            LinkPattern::Site(_) => self.check_partner_link(p, host),
            LinkPattern::Label(_) => {
                debug_assert!(false, "matching against an unresolved bond label");
                None
            }
        }
    }

    /// A resolved pattern bond requires a host bond whose far end agrees
    /// with the pattern partner's label and agent type.
    fn check_partner_link<N: Copy>(
        &self,
        p: &LinkPattern,
        host: &LinkView<'_, N>,
    ) -> Option<LinkCheck<N>> {
        let LinkPattern::Site(pref) = p else {
            return None;
        };
        let LinkView::Partner {
            node,
            label,
            agent_ty,
        } = host
        else {
            return None;
        };
        let partner_agent = self.inner.agent(pref.slot);
        let partner_site = partner_agent.sites().get(pref.site)?;
        if partner_site.label == *label && partner_agent.ty() == *agent_ty {
            Some(LinkCheck::Follow(*node))
        } else {
            None
        }
    }

    fn partner_member(&self, link: &LinkPattern) -> Option<usize> {
        if let LinkPattern::Site(pref) = link {
            self.member_of_slot(pref.slot)
        } else {
            None
        }
    }
}

enum LinkCheck<N> {
    Ok,
    Follow(N),
}

/// A read-only view of one host site during matching.
pub(crate) struct SiteView<'a, N> {
    /// The host site's internal state (concrete, or a predicate when the
    /// host is itself a pattern).
    pub(crate) internal: &'a InternalState,
    /// The host site's link.
    pub(crate) link: LinkView<'a, N>,
}

/// A read-only view of one host link during matching.
pub(crate) enum LinkView<'a, N> {
    /// Free site.
    Empty,
    /// Pattern-host wildcard.
    Wildcard,
    /// Pattern-host undetermined link.
    Undetermined,
    /// Pattern-host bound-to-anything predicate.
    Bound,
    /// Pattern-host site-type predicate.
    SiteType {
        /// Required partner site label.
        site: &'a str,
        /// Required partner agent type.
        agent: &'a str,
    },
    /// A concrete bond to `node`, whose bound site is `label` on an agent of
    /// type `agent_ty`.
    Partner {
        /// Host partner node.
        node: N,
        /// Label of the partner site.
        label: &'a str,
        /// Type of the partner's agent.
        agent_ty: &'a str,
    },
}

/// A host a component can be embedded into: the live mixture, a restricted
/// region of it, or another pattern component.
pub(crate) trait MatchTarget {
    /// Host agent handle.
    type Node: Copy + Eq + Hash;

    /// Host agents of the given type that may serve as the image of the
    /// pattern root.
    fn candidates(&self, ty: &str) -> Vec<Self::Node>;

    /// True if `node` lies inside the (possibly restricted) host.
    fn admits(&self, node: Self::Node) -> bool;

    /// The type of a host agent.
    fn agent_type(&self, node: Self::Node) -> &str;

    /// Number of sites on a host agent.
    fn site_count(&self, node: Self::Node) -> usize;

    /// Label of the `ix`-th site of a host agent.
    fn site_label(&self, node: Self::Node, ix: usize) -> &str;

    /// View of a host site by label.
    fn site(&self, node: Self::Node, label: &str) -> Option<SiteView<'_, Self::Node>>;
}

/// A pattern component acting as a match host.
pub(crate) struct ComponentTarget<'a>(pub(crate) &'a Component);

impl MatchTarget for ComponentTarget<'_> {
    type Node = usize;

    fn candidates(&self, ty: &str) -> Vec<usize> {
        self.0.by_type.get(ty).cloned().unwrap_or_default()
    }

    fn admits(&self, _node: usize) -> bool {
        true
    }

    fn agent_type(&self, node: usize) -> &str {
        self.0.agent(node).ty()
    }

    fn site_count(&self, node: usize) -> usize {
        self.0.agent(node).sites().len()
    }

    fn site_label(&self, node: usize, ix: usize) -> &str {
        &self.0.agent(node).sites()[ix].label
    }

    fn site(&self, node: usize, label: &str) -> Option<SiteView<'_, usize>> {
        let (_, sp) = self.0.agent(node).site(label)?;
        let link = match &sp.link {
            LinkPattern::Empty => LinkView::Empty,
            LinkPattern::Wildcard => LinkView::Wildcard,
            LinkPattern::Undetermined => LinkView::Undetermined,
            LinkPattern::Bound => LinkView::Bound,
            LinkPattern::SiteType { site, agent } => LinkView::SiteType { site, agent },
            LinkPattern::Label(_) => LinkView::Undetermined,
            LinkPattern::Site(pref) => {
                let partner_member = self.0.member_of_slot(pref.slot)?;
                let partner_agent = self.0.agent(partner_member);
                LinkView::Partner {
                    node: partner_member,
                    label: &partner_agent.sites().get(pref.site)?.label,
                    agent_ty: partner_agent.ty(),
                }
            }
        };
        Some(SiteView {
            internal: &sp.internal,
            link,
        })
    }
}

// ── Rendering ───────────────────────────────────────────────────────

/// Renders agents in kappa text, assigning numeric bond labels in order of
/// first appearance. `slots` pairs each agent with its pattern slot index so
/// bond endpoints can be keyed; `None` entries render as the null slot `.`.
fn fmt_agents<'a>(
    f: &mut fmt::Formatter<'_>,
    slots: impl Iterator<Item = (usize, Option<&'a AgentPattern>)>,
) -> fmt::Result {
    let mut bond_numbers: FxHashMap<(PatternSiteRef, PatternSiteRef), u32> = FxHashMap::default();
    let mut next_bond = 1u32;
    let mut first = true;
    for (slot, agent) in slots {
        if !first {
            f.write_str(", ")?;
        }
        first = false;
        let Some(agent) = agent else {
            f.write_str(".")?;
            continue;
        };
        write!(f, "{}(", agent.ty())?;
        for (s_ix, site) in agent.sites().iter().enumerate() {
            if s_ix > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&site.label)?;
            match &site.link {
                LinkPattern::Empty => f.write_str("[.]")?,
                LinkPattern::Wildcard => f.write_str("[#]")?,
                LinkPattern::Bound => f.write_str("[_]")?,
                LinkPattern::Undetermined => {}
                LinkPattern::SiteType { site, agent } => write!(f, "[{site}.{agent}]")?,
                LinkPattern::Label(n) => write!(f, "[{n}]")?,
                LinkPattern::Site(partner) => {
                    let here = PatternSiteRef { slot, site: s_ix };
                    let key = if here <= *partner {
                        (here, *partner)
                    } else {
                        (*partner, here)
                    };
                    let n = *bond_numbers.entry(key).or_insert_with(|| {
                        let n = next_bond;
                        next_bond += 1;
                        n
                    });
                    write!(f, "[{n}]")?;
                }
            }
            write!(f, "{}", site.internal)?;
        }
        f.write_str(")")?;
    }
    Ok(())
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_agents(
            f,
            self.inner
                .slots
                .iter()
                .enumerate()
                .map(|(slot, agent)| (slot, agent.as_ref())),
        )
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_agents(
            f,
            self.members
                .iter()
                .map(|slot| (*slot, Some(self.inner.agent(*slot)))),
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn agent(ty: &str, sites: Vec<SitePattern>) -> AgentPattern {
        AgentPattern::new(ty, sites)
    }

    fn component(agents: Vec<AgentPattern>) -> Component {
        Pattern::new(agents).unwrap().into_component().unwrap()
    }

    #[test]
    fn bond_labels_resolve_pairwise() {
        let p = Pattern::new(vec![
            agent("A", vec![SitePattern::new("a").bond(1)]),
            agent("B", vec![SitePattern::new("b").bond(1)]),
        ])
        .unwrap();
        let a = p.slot(0).unwrap();
        assert_eq!(
            a.sites()[0].link,
            LinkPattern::Site(PatternSiteRef { slot: 1, site: 0 })
        );
        assert_eq!(p.components().len(), 1);
    }

    #[test]
    fn unpaired_bond_label_is_rejected() {
        let err = Pattern::new(vec![agent("A", vec![SitePattern::new("a").bond(3)])]);
        assert_eq!(
            err.err(),
            Some(PatternError::BondLabel { label: 3, count: 1 })
        );
    }

    #[test]
    fn triple_bond_label_is_rejected() {
        let err = Pattern::new(vec![
            agent("A", vec![SitePattern::new("a").bond(1)]),
            agent("B", vec![SitePattern::new("b").bond(1)]),
            agent("C", vec![SitePattern::new("c").bond(1)]),
        ]);
        assert_eq!(
            err.err(),
            Some(PatternError::BondLabel { label: 1, count: 3 })
        );
    }

    #[test]
    fn unbonded_agents_form_separate_components() {
        let p = Pattern::new(vec![
            agent("A", vec![SitePattern::new("a")]),
            agent("B", vec![SitePattern::new("b")]),
        ])
        .unwrap();
        assert_eq!(p.components().len(), 2);
    }

    #[test]
    fn null_slots_are_skipped() {
        let p = Pattern::from_slots(vec![
            Some(agent("A", vec![SitePattern::new("a")])),
            None,
        ])
        .unwrap();
        assert_eq!(p.len(), 2);
        assert!(p.slot(1).is_none());
        assert_eq!(p.components().len(), 1);
        assert_eq!(p.to_string(), "A(a), .");
    }

    #[test]
    fn diameter_of_a_chain() {
        let chain = component(vec![
            agent("A", vec![SitePattern::new("r").bond(1)]),
            agent("A", vec![SitePattern::new("l").bond(1), SitePattern::new("r").bond(2)]),
            agent("A", vec![SitePattern::new("l").bond(2)]),
        ]);
        assert_eq!(chain.diameter(), 2);
        let single = component(vec![agent("A", vec![])]);
        assert_eq!(single.diameter(), 0);
    }

    #[test]
    fn underspecified_detection() {
        let ok = Pattern::new(vec![agent(
            "A",
            vec![SitePattern::new("a").empty().state("u")],
        )])
        .unwrap();
        assert!(!ok.underspecified());
        let wild = Pattern::new(vec![agent("A", vec![SitePattern::new("a").link_wildcard()])])
            .unwrap();
        assert!(wild.underspecified());
        let bound = Pattern::new(vec![agent("A", vec![SitePattern::new("a").bound()])]).unwrap();
        assert!(bound.underspecified());
    }

    // ── isomorphism table, after the original test suite ────────────

    fn iso(a: &Component, b: &Component) -> bool {
        let ab = a.isomorphic(b);
        let ba = b.isomorphic(a);
        assert_eq!(ab, ba, "isomorphism must be symmetric");
        ab
    }

    #[test]
    fn isomorphism_on_singletons() {
        let a1 = component(vec![agent("A", vec![SitePattern::new("a").empty().state("u")])]);
        let a2 = component(vec![agent("A", vec![SitePattern::new("a").empty().state("u")])]);
        let a3 = component(vec![agent("A", vec![SitePattern::new("a").empty().state("p")])]);
        assert!(iso(&a1, &a2));
        assert!(!iso(&a1, &a3));
    }

    #[test]
    fn wildcards_only_match_wildcards_exactly() {
        let wild = component(vec![agent(
            "A",
            vec![SitePattern::new("a").link_wildcard().state_wildcard()],
        )]);
        let wild2 = component(vec![agent(
            "A",
            vec![SitePattern::new("a").link_wildcard().state_wildcard()],
        )]);
        let empty_link = component(vec![agent(
            "A",
            vec![SitePattern::new("a").empty().state_wildcard()],
        )]);
        let tagged = component(vec![agent(
            "A",
            vec![SitePattern::new("a").link_wildcard().state("u")],
        )]);
        assert!(iso(&wild, &wild2));
        assert!(!iso(&wild, &empty_link));
        assert!(!iso(&wild, &tagged));
    }

    #[test]
    fn unmentioned_sites_must_be_undetermined() {
        let bare = component(vec![agent("A", vec![])]);
        let stated = component(vec![agent("A", vec![SitePattern::new("a").state("u")])]);
        let undetermined = component(vec![agent("A", vec![SitePattern::new("a")])]);
        assert!(!iso(&bare, &stated));
        assert!(iso(&bare, &undetermined));
    }

    #[test]
    fn missing_state_is_not_equal_to_stated() {
        let stated = component(vec![agent("A", vec![SitePattern::new("a").empty().state("u")])]);
        let unstated = component(vec![agent("A", vec![SitePattern::new("a").empty()])]);
        assert!(!iso(&stated, &unstated));
    }

    #[test]
    fn bonded_pairs_respect_agent_types() {
        let aa = component(vec![
            agent("A", vec![SitePattern::new("a").bond(1).state("u")]),
            agent("A", vec![SitePattern::new("a").bond(1)]),
        ]);
        let ab = component(vec![
            agent("A", vec![SitePattern::new("a").bond(1).state("u")]),
            agent("B", vec![SitePattern::new("a").bond(1)]),
        ]);
        assert!(!iso(&aa, &ab));
    }

    #[test]
    fn triangle_isomorphism_is_order_independent() {
        let t1 = component(vec![
            agent(
                "A",
                vec![SitePattern::new("a1").bond(1).state("u"), SitePattern::new("a2").bond(3)],
            ),
            agent("B", vec![SitePattern::new("b1").bond(1), SitePattern::new("b2").bond(2)]),
            agent("C", vec![SitePattern::new("c1").bond(2), SitePattern::new("c2").bond(3)]),
        ]);
        let t2 = component(vec![
            agent(
                "A",
                vec![SitePattern::new("a1").bond(1).state("u"), SitePattern::new("a2").bond(3)],
            ),
            agent("C", vec![SitePattern::new("c1").bond(2), SitePattern::new("c2").bond(3)]),
            agent("B", vec![SitePattern::new("b1").bond(1), SitePattern::new("b2").bond(2)]),
        ]);
        assert!(iso(&t1, &t2));
    }

    #[test]
    fn extra_sites_break_isomorphism() {
        let small = component(vec![
            agent("A", vec![SitePattern::new("a1").bond(1).state("u")]),
            agent("B", vec![SitePattern::new("b1").bond(1), SitePattern::new("b2").bond(2)]),
            agent("C", vec![SitePattern::new("c1").bond(2)]),
        ]);
        let big = component(vec![
            agent(
                "A",
                vec![SitePattern::new("a1").bond(1).state("u"), SitePattern::new("a2").bond(3)],
            ),
            agent("B", vec![SitePattern::new("b1").bond(1), SitePattern::new("b2").bond(2)]),
            agent("C", vec![SitePattern::new("c1").bond(2), SitePattern::new("c2").bond(3)]),
        ]);
        assert!(!iso(&small, &big));
    }

    #[test]
    fn ring_wiring_differences_are_detected() {
        let ring = |b3: u32, c3: u32| {
            component(vec![
                agent(
                    "A",
                    vec![
                        SitePattern::new("a1").bond(1),
                        SitePattern::new("a2").bond(2),
                        SitePattern::new("a3").bond(5),
                    ],
                ),
                agent(
                    "B",
                    vec![
                        SitePattern::new("b1").bond(2),
                        SitePattern::new("b2").bond(3),
                        SitePattern::new("b3").bond(b3),
                    ],
                ),
                agent(
                    "C",
                    vec![
                        SitePattern::new("c1").bond(3),
                        SitePattern::new("c2").bond(4),
                        SitePattern::new("c3").bond(c3),
                    ],
                ),
                agent(
                    "D",
                    vec![
                        SitePattern::new("d1").bond(4),
                        SitePattern::new("d2").bond(1),
                        SitePattern::new("d3").bond(6),
                    ],
                ),
            ])
        };
        let r1 = ring(6, 5);
        let r2 = ring(5, 6);
        assert!(!iso(&r1, &r2));
    }

    // ── automorphisms ───────────────────────────────────────────────

    #[test]
    fn automorphism_counts() {
        let symmetric_dimer = component(vec![
            agent("A", vec![SitePattern::new("a1").bond(1)]),
            agent("A", vec![SitePattern::new("a1").bond(1)]),
        ]);
        assert!(symmetric_dimer.isomorphic(&symmetric_dimer));
        assert_eq!(symmetric_dimer.embeddings(&symmetric_dimer, true).len(), 2);

        let asymmetric_dimer = component(vec![
            agent("A", vec![SitePattern::new("a1").bond(1)]),
            agent("A", vec![SitePattern::new("a2").bond(1)]),
        ]);
        assert_eq!(asymmetric_dimer.embeddings(&asymmetric_dimer, true).len(), 1);

        let rotating_trimer = component(vec![
            agent("A", vec![SitePattern::new("a1").bond(3), SitePattern::new("a2").bond(1)]),
            agent("A", vec![SitePattern::new("a1").bond(1), SitePattern::new("a2").bond(2)]),
            agent("A", vec![SitePattern::new("a1").bond(2), SitePattern::new("a2").bond(3)]),
        ]);
        assert_eq!(rotating_trimer.embeddings(&rotating_trimer, true).len(), 3);
    }

    // ── non-exact embeddings ────────────────────────────────────────

    #[test]
    fn pattern_embeds_in_richer_component() {
        let pattern = component(vec![agent("A", vec![SitePattern::new("a").bound()])]);
        let host = component(vec![
            agent("A", vec![SitePattern::new("a").bond(1), SitePattern::new("x").empty()]),
            agent("B", vec![SitePattern::new("b").bond(1)]),
        ]);
        assert_eq!(pattern.embeddings(&host, false).len(), 1);
    }

    #[test]
    fn site_type_predicate_checks_label_and_agent() {
        let to_b = component(vec![agent("A", vec![SitePattern::new("a").site_type("b", "B")])]);
        let wrong_site = component(vec![agent(
            "A",
            vec![SitePattern::new("a").site_type("c", "B")],
        )]);
        let host = component(vec![
            agent("A", vec![SitePattern::new("a").bond(1)]),
            agent("B", vec![SitePattern::new("b").bond(1)]),
        ]);
        assert_eq!(to_b.embeddings(&host, false).len(), 1);
        assert_eq!(wrong_site.embeddings(&host, false).len(), 0);
    }

    #[test]
    fn shallow_agent_embedding() {
        let loose = agent("A", vec![SitePattern::new("a").bound()]);
        let host = agent(
            "A",
            vec![SitePattern::new("a").bond(1), SitePattern::new("x").empty()],
        );
        let other = agent("B", vec![SitePattern::new("b").bond(1)]);
        let p = Pattern::new(vec![host, other]).unwrap();
        let bonded_a = p.slot(0).unwrap();
        assert!(loose.embeds_in(bonded_a));

        let wants_state = agent("A", vec![SitePattern::new("a").state("u")]);
        assert!(!wants_state.embeds_in(bonded_a));

        let wants_missing = agent("A", vec![SitePattern::new("z").empty()]);
        assert!(!wants_missing.embeds_in(bonded_a));
        let mentions_missing = agent("A", vec![SitePattern::new("z")]);
        assert!(mentions_missing.embeds_in(bonded_a));
    }

    #[test]
    fn rendering_assigns_bond_numbers() {
        let c = component(vec![
            agent("A", vec![SitePattern::new("a").bond(7).state("u")]),
            agent("B", vec![SitePattern::new("b").bond(7)]),
        ]);
        assert_eq!(c.to_string(), "A(a[1]{u}), B(b[1])");
    }
}
