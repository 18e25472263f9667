// SPDX-License-Identifier: Apache-2.0
//! The live mixture: concrete agents wired by bonds, the connected-complex
//! partition, and the incrementally maintained embedding index.
//!
//! All mutation funnels through [`Mixture::apply_update`]. A
//! [`MixtureUpdate`] *describes* edits (agents to add/remove, bonds to
//! add/remove, internal-state writes); applying it runs the invariant-
//! preserving pipeline:
//!
//! 1. invalidate every tracked embedding touching an agent the update
//!    disturbs,
//! 2. apply the primitive edits in order (remove bonds, remove agents, add
//!    agents, add bonds, write states), splitting and merging complexes as
//!    bonds change,
//! 3. re-enumerate embeddings inside the `max_embedding_width`-neighborhood
//!    of the touched agents on the post-update graph.
//!
//! An embedding whose image touches no disturbed agent cannot have been
//! created or destroyed, and the diameter bound guarantees the rescan region
//! covers every embedding that could have been; this keeps the steady-state
//! cost of a step proportional to the rule's reach, not the mixture size.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::edge::{AgentRef, Edge, PendingSiteRef, SiteRef};
use crate::ident::{AgentId, ComplexId, ComponentId};
use crate::indexed_set::{IndexedSet, IndexedSetError, Property};
use crate::pattern::{
    AgentPattern, Component, LinkView, MatchTarget, Pattern, PatternSiteRef, SitePattern, SiteView,
};
use crate::state::{InternalState, LinkPattern};

/// Errors from mixture operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MixtureError {
    /// The pattern carries predicates that rule out instantiation.
    #[error("pattern is not specific enough to be instantiated")]
    Underspecified,
    /// An operation referred to an agent the mixture does not hold.
    #[error("unknown agent: {0:?}")]
    UnknownAgent(AgentId),
    /// An operation referred to a site index past the agent's interface.
    #[error("agent {agent:?} has no site index {site}")]
    UnknownSite {
        /// The agent.
        agent: AgentId,
        /// The out-of-range site index.
        site: usize,
    },
    /// An edge removal named two sites that do not share a bond.
    #[error("sites are not bonded: {a:?} and {b:?}")]
    MissingBond {
        /// First endpoint.
        a: SiteRef,
        /// Second endpoint.
        b: SiteRef,
    },
    /// An edge addition named a site that is still bound.
    #[error("site is already bound: {0:?}")]
    SiteOccupied(SiteRef),
    /// An agent was removed while holding bonds the update does not remove.
    #[error("agent {0:?} still holds bonds not scheduled for removal")]
    AgentNotDetached(AgentId),
    /// An edge referred to a created agent index past the creation list.
    #[error("pending agent index {0} out of range")]
    PendingOutOfRange(usize),
    /// An edge endpoint refers to an agent the same update removes.
    #[error("edge endpoint on removed agent: {0:?}")]
    RemovedEndpoint(AgentId),
    /// Internal index bookkeeping failed; state is inconsistent.
    #[error("internal index inconsistency: {0}")]
    Index(#[from] IndexedSetError),
}

/// Concrete link state of a live site.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    /// The site is free.
    Empty,
    /// The site is bound to the given site.
    Bound(SiteRef),
}

/// A live site: label, concrete internal state, concrete link.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Site {
    label: String,
    state: InternalState,
    link: LinkState,
}

impl Site {
    /// The site label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The internal state (a tag or the undetermined sentinel).
    #[must_use]
    pub fn state(&self) -> &InternalState {
        &self.state
    }

    /// The link state.
    #[must_use]
    pub fn link(&self) -> LinkState {
        self.link
    }
}

/// A live agent: type name plus ordered interface.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Agent {
    ty: String,
    sites: Vec<Site>,
}

impl Agent {
    /// Instantiates a detached agent from a template.
    ///
    /// Undetermined internal states become the undetermined sentinel;
    /// undetermined and cross-reference links become free sites (bonds are
    /// recreated separately). Wildcards and bound/site-type predicates make
    /// the template uninstantiable.
    pub fn instantiate(template: &AgentPattern) -> Result<Self, MixtureError> {
        let mut sites = Vec::with_capacity(template.sites().len());
        for sp in template.sites() {
            let state = match &sp.internal {
                InternalState::Tag(tag) => InternalState::Tag(tag.clone()),
                InternalState::Undetermined => InternalState::Undetermined,
                InternalState::Wildcard => return Err(MixtureError::Underspecified),
            };
            match sp.link {
                LinkPattern::Empty | LinkPattern::Undetermined | LinkPattern::Site(_) => {}
                LinkPattern::Wildcard
                | LinkPattern::Bound
                | LinkPattern::SiteType { .. }
                | LinkPattern::Label(_) => return Err(MixtureError::Underspecified),
            }
            sites.push(Site {
                label: sp.label.clone(),
                state,
                link: LinkState::Empty,
            });
        }
        Ok(Self {
            ty: template.ty().to_owned(),
            sites,
        })
    }

    /// The agent type name.
    #[must_use]
    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// The ordered interface.
    #[must_use]
    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    /// Finds a site by label.
    #[must_use]
    pub fn site(&self, label: &str) -> Option<(usize, &Site)> {
        self.sites.iter().enumerate().find(|(_, s)| s.label == label)
    }

    /// True if every site is free.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.sites.iter().all(|s| s.link == LinkState::Empty)
    }
}

/// Element of the by-type agent index: id plus type, hashed by id.
#[derive(Clone, Debug)]
struct AgentEntry {
    id: AgentId,
    ty: String,
}

impl PartialEq for AgentEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AgentEntry {}

impl Hash for AgentEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A recorded match of a tracked component into the mixture.
///
/// `images[m]` is the mixture agent the component's member `m` maps to.
/// Equality and hashing cover the component identity and the image vector;
/// the containing complex is mutable bookkeeping excluded from both (the
/// index removes, mutates, and re-adds when it changes).
#[derive(Debug)]
pub struct Embedding {
    component: ComponentId,
    images: Box<[AgentId]>,
    complex: Cell<ComplexId>,
}

impl Embedding {
    fn new(component: ComponentId, images: Vec<AgentId>, complex: ComplexId) -> Self {
        debug_assert!(!images.is_empty());
        Self {
            component,
            images: images.into_boxed_slice(),
            complex: Cell::new(complex),
        }
    }

    /// The tracked component this embedding matches.
    #[must_use]
    pub fn component(&self) -> ComponentId {
        self.component
    }

    /// The image agents, indexed by component member.
    #[must_use]
    pub fn images(&self) -> &[AgentId] {
        &self.images
    }

    /// The image of the component's root member.
    #[must_use]
    pub fn root(&self) -> AgentId {
        self.images[0]
    }

    /// The mixture complex currently containing the image.
    #[must_use]
    pub fn complex(&self) -> ComplexId {
        self.complex.get()
    }

    fn set_complex(&self, complex: ComplexId) {
        self.complex.set(complex);
    }
}

impl PartialEq for Embedding {
    fn eq(&self, other: &Self) -> bool {
        self.component == other.component && self.images == other.images
    }
}

impl Eq for Embedding {}

impl Hash for Embedding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.component.hash(state);
        self.images.hash(state);
    }
}

/// Key space for the secondary indices on an embedding set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EmbeddingKey {
    /// An embedding touches this mixture agent.
    Agent(AgentId),
    /// An embedding lies inside this mixture complex.
    Complex(ComplexId),
}

/// The set type holding the current embeddings of one tracked component.
pub type EmbeddingSet = IndexedSet<Rc<Embedding>, EmbeddingKey>;

struct TrackedComponent {
    component: Component,
    set: EmbeddingSet,
}

fn new_embedding_set() -> Result<EmbeddingSet, IndexedSetError> {
    let mut set = EmbeddingSet::new();
    set.create_index(
        "agent",
        Property::set(|e: &Rc<Embedding>| {
            e.images().iter().copied().map(EmbeddingKey::Agent).collect()
        }),
    )?;
    set.create_index(
        "complex",
        Property::new(|e: &Rc<Embedding>| EmbeddingKey::Complex(e.complex())),
    )?;
    Ok(set)
}

/// The live site graph and its indices.
pub struct Mixture {
    agents: FxHashMap<AgentId, Agent>,
    by_type: IndexedSet<AgentEntry, String>,
    complexes: FxHashMap<ComplexId, FxHashSet<AgentId>>,
    complex_of: FxHashMap<AgentId, ComplexId>,
    embeddings: FxHashMap<ComponentId, TrackedComponent>,
    max_embedding_width: usize,
    agent_nonce: u64,
    complex_nonce: u64,
}

impl Default for Mixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Mixture {
    /// Creates an empty mixture.
    #[must_use]
    pub fn new() -> Self {
        let mut by_type = IndexedSet::new();
        let created = by_type.create_index("type", Property::new(|e: &AgentEntry| e.ty.clone()));
        debug_assert!(created.is_ok());
        Self {
            agents: FxHashMap::default(),
            by_type,
            complexes: FxHashMap::default(),
            complex_of: FxHashMap::default(),
            embeddings: FxHashMap::default(),
            max_embedding_width: 0,
            agent_nonce: 0,
            complex_nonce: 0,
        }
    }

    // ── read access ─────────────────────────────────────────────────

    /// The agent with the given id, if present.
    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(&id)
    }

    /// Number of agents in the mixture.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// True if the mixture holds no agents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Iterates all agents.
    pub fn agents(&self) -> impl Iterator<Item = (AgentId, &Agent)> {
        self.agents.iter().map(|(id, agent)| (*id, agent))
    }

    /// Ids of all agents of the given type.
    #[must_use]
    pub fn agents_of_type(&self, ty: &str) -> Vec<AgentId> {
        self.by_type
            .lookup("type", &ty.to_owned())
            .map(|bucket| bucket.iter().map(|e| e.id).collect())
            .unwrap_or_default()
    }

    /// The partner currently bound to `site`, if any.
    #[must_use]
    pub fn partner(&self, site: SiteRef) -> Option<SiteRef> {
        match self.agents.get(&site.agent)?.sites.get(site.site)?.link {
            LinkState::Bound(p) => Some(p),
            LinkState::Empty => None,
        }
    }

    /// Number of complexes (connected components) in the mixture.
    #[must_use]
    pub fn complex_count(&self) -> usize {
        self.complexes.len()
    }

    /// Iterates the complexes and their member sets.
    pub fn complexes(&self) -> impl Iterator<Item = (ComplexId, &FxHashSet<AgentId>)> {
        self.complexes.iter().map(|(id, members)| (*id, members))
    }

    /// The complex containing the given agent.
    #[must_use]
    pub fn complex_of(&self, agent: AgentId) -> Option<ComplexId> {
        self.complex_of.get(&agent).copied()
    }

    /// The member agents of a complex.
    #[must_use]
    pub fn complex_members(&self, id: ComplexId) -> Option<&FxHashSet<AgentId>> {
        self.complexes.get(&id)
    }

    /// Depth-first traversal over the bond relation starting at `start`.
    #[must_use]
    pub fn depth_first_traversal(&self, start: AgentId) -> Vec<AgentId> {
        if !self.agents.contains_key(&start) {
            return Vec::new();
        }
        let mut visited = FxHashSet::default();
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            order.push(id);
            stack.extend(self.neighbors(id));
        }
        order
    }

    fn neighbors(&self, id: AgentId) -> impl Iterator<Item = AgentId> + '_ {
        self.agents
            .get(&id)
            .into_iter()
            .flat_map(|agent| agent.sites.iter())
            .filter_map(|site| match site.link {
                LinkState::Bound(p) => Some(p.agent),
                LinkState::Empty => None,
            })
    }

    // ── tracking and embedding lookup ───────────────────────────────

    /// Starts maintaining the embedding set of `component`.
    ///
    /// Current embeddings are enumerated once; from then on the set is kept
    /// up to date incrementally by [`Mixture::apply_update`]. Tracking the
    /// same component twice is a no-op.
    pub fn track_component(&mut self, component: &Component) -> Result<(), MixtureError> {
        if self.embeddings.contains_key(&component.id()) {
            return Ok(());
        }
        let mut set = new_embedding_set()?;
        for images in self.find_embeddings(component) {
            let complex = self
                .complex_of(images[0])
                .ok_or(MixtureError::UnknownAgent(images[0]))?;
            set.add(Rc::new(Embedding::new(component.id(), images, complex)))?;
        }
        self.max_embedding_width = self.max_embedding_width.max(component.diameter());
        self.embeddings.insert(
            component.id(),
            TrackedComponent {
                component: component.clone(),
                set,
            },
        );
        Ok(())
    }

    /// Enumerates the embeddings of `component` from scratch, ignoring the
    /// incremental index. `images[m]` is the mixture agent member `m` maps
    /// to.
    ///
    /// The index is authoritative during simulation; this exists for
    /// tracking setup and for checking the index against ground truth.
    #[must_use]
    pub fn find_embeddings(&self, component: &Component) -> Vec<Vec<AgentId>> {
        let target = MixtureTarget {
            mixture: self,
            restrict: None,
        };
        component.enumerate_into(&target, false, false)
    }

    /// True if the exact component (by identity) is tracked.
    #[must_use]
    pub fn is_tracked(&self, component: &Component) -> bool {
        self.embeddings.contains_key(&component.id())
    }

    /// Iterates the tracked components.
    pub fn tracked_components(&self) -> impl Iterator<Item = &Component> {
        self.embeddings.values().map(|t| &t.component)
    }

    /// The tracked component isomorphic to `component`, if any.
    #[must_use]
    pub fn tracked_isomorphic(&self, component: &Component) -> Option<&Component> {
        if let Some(tracked) = self.embeddings.get(&component.id()) {
            return Some(&tracked.component);
        }
        self.tracked_components()
            .find(|c| c.isomorphic(component))
    }

    /// The current embedding set of a tracked component (by identity).
    #[must_use]
    pub fn embeddings(&self, component: &Component) -> Option<&EmbeddingSet> {
        self.embeddings.get(&component.id()).map(|t| &t.set)
    }

    /// The number of embeddings of `component`, falling back to a tracked
    /// isomorphic component when `component` itself is not tracked.
    #[must_use]
    pub fn embedding_count(&self, component: &Component) -> Option<usize> {
        if let Some(tracked) = self.embeddings.get(&component.id()) {
            return Some(tracked.set.len());
        }
        let iso = self.tracked_isomorphic(component)?;
        self.embeddings.get(&iso.id()).map(|t| t.set.len())
    }

    /// The embeddings of a tracked component that lie inside the given
    /// complex, or `None` if there are none.
    #[must_use]
    pub fn embeddings_in_complex(
        &self,
        component: &Component,
        complex: ComplexId,
    ) -> Option<&EmbeddingSet> {
        self.embeddings
            .get(&component.id())?
            .set
            .lookup("complex", &EmbeddingKey::Complex(complex))
    }

    /// Count of embeddings of a tracked component inside the given complex.
    #[must_use]
    pub fn count_in_complex(&self, component: &Component, complex: ComplexId) -> usize {
        self.embeddings_in_complex(component, complex)
            .map_or(0, EmbeddingSet::len)
    }

    /// The widest tracked component's diameter; the rescan radius.
    #[must_use]
    pub fn max_embedding_width(&self) -> usize {
        self.max_embedding_width
    }

    // ── construction ────────────────────────────────────────────────

    /// Adds `n` copies of `pattern` to the mixture, one update per connected
    /// component per copy.
    pub fn instantiate(&mut self, pattern: &Pattern, n: usize) -> Result<(), MixtureError> {
        if pattern.underspecified() {
            return Err(MixtureError::Underspecified);
        }
        for _ in 0..n {
            for component in pattern.components() {
                let mut update = MixtureUpdate::new();
                for m in 0..component.len() {
                    update.create_agent(component.agent(m))?;
                }
                for m in 0..component.len() {
                    for (s_ix, site) in component.agent(m).sites().iter().enumerate() {
                        if let LinkPattern::Site(partner) = &site.link {
                            let Some(partner_member) = component.member_of_slot(partner.slot)
                            else {
                                continue;
                            };
                            update.push_edge(Edge::new(
                                PendingSiteRef {
                                    agent: AgentRef::New(m),
                                    site: s_ix,
                                },
                                PendingSiteRef {
                                    agent: AgentRef::New(partner_member),
                                    site: partner.site,
                                },
                            ));
                        }
                    }
                }
                self.apply_update(update)?;
            }
        }
        Ok(())
    }

    // ── update application ──────────────────────────────────────────

    /// Applies a described update atomically, maintaining every index.
    pub fn apply_update(&mut self, update: MixtureUpdate) -> Result<(), MixtureError> {
        self.validate_update(&update)?;

        // 1. Invalidate embeddings through every disturbed agent.
        for agent in update.touched_before() {
            self.invalidate_agent(agent)?;
        }

        // 2. Primitive edits: bonds out, agents out, agents in, bonds in.
        for edge in &update.edges_to_remove {
            let (a, b) = resolve_existing(edge)?;
            self.unbind(a, b)?;
        }
        for id in &update.agents_to_remove {
            self.remove_detached_agent(*id)?;
        }
        let mut new_ids = Vec::with_capacity(update.agents_to_add.len());
        for agent in &update.agents_to_add {
            new_ids.push(self.add_detached_agent(agent.clone()));
        }
        for edge in &update.edges_to_add {
            let (a, b) = resolve_pending(edge, &new_ids)?;
            self.bind(a, b)?;
        }
        for (site, state) in &update.state_changes {
            self.write_state(*site, state.clone())?;
        }

        // 3. Rescan the neighborhood of everything that changed.
        let after = update.touched_after(&new_ids);
        let region = self.neighborhood(&after, self.max_embedding_width);
        self.rescan(&region)
    }

    fn validate_update(&self, update: &MixtureUpdate) -> Result<(), MixtureError> {
        let removed: FxHashSet<AgentId> = update.agents_to_remove.iter().copied().collect();
        for id in &update.agents_to_remove {
            let agent = self.agents.get(id).ok_or(MixtureError::UnknownAgent(*id))?;
            for (s_ix, site) in agent.sites.iter().enumerate() {
                if let LinkState::Bound(partner) = site.link {
                    let edge = Edge::new(
                        PendingSiteRef::existing(SiteRef {
                            agent: *id,
                            site: s_ix,
                        }),
                        PendingSiteRef::existing(partner),
                    );
                    if !update.edges_to_remove.contains(&edge) {
                        return Err(MixtureError::AgentNotDetached(*id));
                    }
                }
            }
        }
        for edge in &update.edges_to_remove {
            let (a, b) = resolve_existing(edge)?;
            if self.partner(a) != Some(b) || self.partner(b) != Some(a) {
                return Err(MixtureError::MissingBond { a, b });
            }
        }
        for agent in &update.agents_to_add {
            debug_assert!(agent.is_detached(), "created agents must be detached");
        }
        for edge in &update.edges_to_add {
            let (a, b) = edge.endpoints();
            for end in [a, b] {
                match end.agent {
                    AgentRef::Existing(id) => {
                        if removed.contains(&id) {
                            return Err(MixtureError::RemovedEndpoint(id));
                        }
                        let agent =
                            self.agents.get(&id).ok_or(MixtureError::UnknownAgent(id))?;
                        if end.site >= agent.sites.len() {
                            return Err(MixtureError::UnknownSite {
                                agent: id,
                                site: end.site,
                            });
                        }
                    }
                    AgentRef::New(ix) => {
                        let agent = update
                            .agents_to_add
                            .get(ix)
                            .ok_or(MixtureError::PendingOutOfRange(ix))?;
                        if end.site >= agent.sites.len() {
                            return Err(MixtureError::PendingOutOfRange(ix));
                        }
                    }
                }
            }
        }
        for (site, _) in &update.state_changes {
            if removed.contains(&site.agent) {
                return Err(MixtureError::RemovedEndpoint(site.agent));
            }
            let agent = self
                .agents
                .get(&site.agent)
                .ok_or(MixtureError::UnknownAgent(site.agent))?;
            if site.site >= agent.sites.len() {
                return Err(MixtureError::UnknownSite {
                    agent: site.agent,
                    site: site.site,
                });
            }
        }
        Ok(())
    }

    fn invalidate_agent(&mut self, agent: AgentId) -> Result<(), MixtureError> {
        for tracked in self.embeddings.values_mut() {
            let hits: Vec<Rc<Embedding>> = tracked
                .set
                .lookup("agent", &EmbeddingKey::Agent(agent))
                .map(|bucket| bucket.iter().cloned().collect())
                .unwrap_or_default();
            for embedding in hits {
                tracked.set.remove(&embedding)?;
            }
        }
        Ok(())
    }

    fn unbind(&mut self, a: SiteRef, b: SiteRef) -> Result<(), MixtureError> {
        self.set_link(a, LinkState::Empty)?;
        self.set_link(b, LinkState::Empty)?;

        let old = self
            .complex_of(a.agent)
            .ok_or(MixtureError::UnknownAgent(a.agent))?;
        debug_assert_eq!(self.complex_of(b.agent), Some(old));

        let reachable = self.connected_set(a.agent);
        if reachable.contains(&b.agent) {
            return Ok(());
        }
        // The complex split: move the half around `a` into a fresh complex.
        let new = self.fresh_complex();
        for id in &reachable {
            self.complex_of.insert(*id, new);
            if let Some(members) = self.complexes.get_mut(&old) {
                members.remove(id);
            }
        }
        self.complexes.insert(new, reachable.clone());
        self.rekey_embeddings_of_agents(&reachable, new)
    }

    fn bind(&mut self, a: SiteRef, b: SiteRef) -> Result<(), MixtureError> {
        if self.partner(a).is_some() {
            return Err(MixtureError::SiteOccupied(a));
        }
        if self.partner(b).is_some() {
            return Err(MixtureError::SiteOccupied(b));
        }
        self.set_link(a, LinkState::Bound(b))?;
        self.set_link(b, LinkState::Bound(a))?;

        let ca = self
            .complex_of(a.agent)
            .ok_or(MixtureError::UnknownAgent(a.agent))?;
        let cb = self
            .complex_of(b.agent)
            .ok_or(MixtureError::UnknownAgent(b.agent))?;
        if ca == cb {
            return Ok(());
        }
        // Merge the smaller complex into the larger.
        let size = |id: ComplexId| self.complexes.get(&id).map_or(0, FxHashSet::len);
        let (surviving, removed) = if size(ca) >= size(cb) { (ca, cb) } else { (cb, ca) };
        let moved = self.complexes.remove(&removed).unwrap_or_default();
        for id in &moved {
            self.complex_of.insert(*id, surviving);
        }
        if let Some(members) = self.complexes.get_mut(&surviving) {
            members.extend(moved.iter().copied());
        }
        self.rekey_complex(removed, surviving)
    }

    fn remove_detached_agent(&mut self, id: AgentId) -> Result<(), MixtureError> {
        let agent = self.agents.remove(&id).ok_or(MixtureError::UnknownAgent(id))?;
        if !agent.is_detached() {
            // Defensive: validation guarantees all bonds were removed first.
            self.agents.insert(id, agent);
            return Err(MixtureError::AgentNotDetached(id));
        }
        self.by_type.remove(&AgentEntry { id, ty: agent.ty })?;
        if let Some(complex) = self.complex_of.remove(&id) {
            let emptied = match self.complexes.get_mut(&complex) {
                Some(members) => {
                    members.remove(&id);
                    members.is_empty()
                }
                None => false,
            };
            debug_assert!(emptied, "a detached agent must be alone in its complex");
            if emptied {
                self.complexes.remove(&complex);
            }
        }
        Ok(())
    }

    fn add_detached_agent(&mut self, agent: Agent) -> AgentId {
        debug_assert!(agent.is_detached());
        let id = AgentId(self.agent_nonce);
        self.agent_nonce += 1;
        let added = self.by_type.add(AgentEntry {
            id,
            ty: agent.ty.clone(),
        });
        debug_assert!(added.is_ok());
        self.agents.insert(id, agent);
        let complex = self.fresh_complex();
        self.complexes.insert(complex, FxHashSet::from_iter([id]));
        self.complex_of.insert(id, complex);
        id
    }

    fn write_state(&mut self, site: SiteRef, state: InternalState) -> Result<(), MixtureError> {
        let agent = self
            .agents
            .get_mut(&site.agent)
            .ok_or(MixtureError::UnknownAgent(site.agent))?;
        let slot = agent.sites.get_mut(site.site).ok_or(MixtureError::UnknownSite {
            agent: site.agent,
            site: site.site,
        })?;
        slot.state = state;
        Ok(())
    }

    fn set_link(&mut self, site: SiteRef, link: LinkState) -> Result<(), MixtureError> {
        let agent = self
            .agents
            .get_mut(&site.agent)
            .ok_or(MixtureError::UnknownAgent(site.agent))?;
        let slot = agent.sites.get_mut(site.site).ok_or(MixtureError::UnknownSite {
            agent: site.agent,
            site: site.site,
        })?;
        slot.link = link;
        Ok(())
    }

    fn fresh_complex(&mut self) -> ComplexId {
        let id = ComplexId(self.complex_nonce);
        self.complex_nonce += 1;
        id
    }

    fn connected_set(&self, start: AgentId) -> FxHashSet<AgentId> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            stack.extend(self.neighbors(id));
        }
        seen
    }

    /// Agents within `radius` bond hops of any of `starts`, on the current
    /// graph.
    fn neighborhood(&self, starts: &FxHashSet<AgentId>, radius: usize) -> FxHashSet<AgentId> {
        let mut region = FxHashSet::default();
        let mut queue = VecDeque::new();
        for id in starts {
            if self.agents.contains_key(id) && region.insert(*id) {
                queue.push_back((*id, 0usize));
            }
        }
        while let Some((id, depth)) = queue.pop_front() {
            if depth == radius {
                continue;
            }
            for next in self.neighbors(id).collect::<Vec<_>>() {
                if region.insert(next) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        region
    }

    fn rekey_embeddings_of_agents(
        &mut self,
        agents: &FxHashSet<AgentId>,
        complex: ComplexId,
    ) -> Result<(), MixtureError> {
        for tracked in self.embeddings.values_mut() {
            let mut moved: FxHashSet<Rc<Embedding>> = FxHashSet::default();
            for agent in agents {
                if let Some(bucket) = tracked.set.lookup("agent", &EmbeddingKey::Agent(*agent)) {
                    moved.extend(bucket.iter().filter(|e| e.complex() != complex).cloned());
                }
            }
            for embedding in moved {
                tracked.set.remove(&embedding)?;
                embedding.set_complex(complex);
                tracked.set.add(embedding)?;
            }
        }
        Ok(())
    }

    fn rekey_complex(&mut self, from: ComplexId, to: ComplexId) -> Result<(), MixtureError> {
        for tracked in self.embeddings.values_mut() {
            let moved: Vec<Rc<Embedding>> = tracked
                .set
                .lookup("complex", &EmbeddingKey::Complex(from))
                .map(|bucket| bucket.iter().cloned().collect())
                .unwrap_or_default();
            for embedding in moved {
                tracked.set.remove(&embedding)?;
                embedding.set_complex(to);
                tracked.set.add(embedding)?;
            }
        }
        Ok(())
    }

    fn rescan(&mut self, region: &FxHashSet<AgentId>) -> Result<(), MixtureError> {
        if region.is_empty() || self.embeddings.is_empty() {
            return Ok(());
        }
        let mut found: Vec<(ComponentId, Vec<AgentId>)> = Vec::new();
        {
            let target = MixtureTarget {
                mixture: self,
                restrict: Some(region),
            };
            for tracked in self.embeddings.values() {
                for images in tracked.component.enumerate_into(&target, false, false) {
                    found.push((tracked.component.id(), images));
                }
            }
        }
        for (component, images) in found {
            let complex = self
                .complex_of(images[0])
                .ok_or(MixtureError::UnknownAgent(images[0]))?;
            let embedding = Rc::new(Embedding::new(component, images, complex));
            if let Some(tracked) = self.embeddings.get_mut(&component) {
                if !tracked.set.contains(&embedding) {
                    tracked.set.add(embedding)?;
                }
            }
        }
        Ok(())
    }

    // ── dumping ─────────────────────────────────────────────────────

    /// Rebuilds a pattern component mirroring the live complex `id`.
    #[must_use]
    pub fn complex_component(&self, id: ComplexId) -> Option<Component> {
        let members = self.complexes.get(&id)?;
        let mut ordered: Vec<AgentId> = members.iter().copied().collect();
        ordered.sort_unstable();
        let slot_of: FxHashMap<AgentId, usize> = ordered
            .iter()
            .enumerate()
            .map(|(slot, id)| (*id, slot))
            .collect();
        let mut slots = Vec::with_capacity(ordered.len());
        for agent_id in &ordered {
            let agent = self.agents.get(agent_id)?;
            let sites = agent.sites.iter().map(|site| SitePattern {
                label: site.label.clone(),
                internal: site.state.clone(),
                link: match site.link {
                    LinkState::Empty => LinkPattern::Empty,
                    LinkState::Bound(partner) => LinkPattern::Site(PatternSiteRef {
                        slot: *slot_of.get(&partner.agent).unwrap_or(&0),
                        site: partner.site,
                    }),
                },
            });
            slots.push(Some(AgentPattern::new(agent.ty.clone(), sites)));
        }
        let pattern = Pattern::from_slots(slots).ok()?;
        pattern.into_component().ok()
    }

    /// Groups the live complexes by isomorphism, yielding one representative
    /// component per class with its multiplicity.
    #[must_use]
    pub fn census(&self) -> Vec<(Component, usize)> {
        let mut ids: Vec<ComplexId> = self.complexes.keys().copied().collect();
        ids.sort_unstable();
        let mut groups: Vec<(Component, usize)> = Vec::new();
        // Pre-bucket by agent-type multiset so isomorphism checks only run
        // within plausible classes.
        let mut by_composition: FxHashMap<Vec<(String, usize)>, Vec<usize>> = FxHashMap::default();
        for id in ids {
            let Some(component) = self.complex_component(id) else {
                continue;
            };
            let key: Vec<(String, usize)> = component
                .composition()
                .into_iter()
                .map(|(ty, n)| (ty.to_owned(), n))
                .collect();
            let candidates = by_composition.entry(key).or_default();
            let mut matched = false;
            for group_ix in candidates.iter() {
                if groups[*group_ix].0.isomorphic(&component) {
                    groups[*group_ix].1 += 1;
                    matched = true;
                    break;
                }
            }
            if !matched {
                candidates.push(groups.len());
                groups.push((component, 1));
            }
        }
        groups
    }
}

impl fmt::Debug for Mixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mixture")
            .field("agents", &self.agents.len())
            .field("complexes", &self.complexes.len())
            .field("tracked", &self.embeddings.len())
            .finish_non_exhaustive()
    }
}

/// The mixture (optionally restricted to an agent region) as a match host.
pub(crate) struct MixtureTarget<'a> {
    pub(crate) mixture: &'a Mixture,
    pub(crate) restrict: Option<&'a FxHashSet<AgentId>>,
}

impl MatchTarget for MixtureTarget<'_> {
    type Node = AgentId;

    fn candidates(&self, ty: &str) -> Vec<AgentId> {
        match self.restrict {
            Some(region) => region
                .iter()
                .copied()
                .filter(|id| self.mixture.agent(*id).is_some_and(|a| a.ty() == ty))
                .collect(),
            None => self.mixture.agents_of_type(ty),
        }
    }

    fn admits(&self, node: AgentId) -> bool {
        self.restrict.map_or(true, |region| region.contains(&node))
    }

    fn agent_type(&self, node: AgentId) -> &str {
        self.mixture.agent(node).map_or("", Agent::ty)
    }

    fn site_count(&self, node: AgentId) -> usize {
        self.mixture.agent(node).map_or(0, |a| a.sites.len())
    }

    fn site_label(&self, node: AgentId, ix: usize) -> &str {
        self.mixture
            .agent(node)
            .and_then(|a| a.sites.get(ix))
            .map_or("", Site::label)
    }

    fn site(&self, node: AgentId, label: &str) -> Option<SiteView<'_, AgentId>> {
        let agent = self.mixture.agent(node)?;
        let (_, site) = agent.site(label)?;
        let link = match site.link {
            LinkState::Empty => LinkView::Empty,
            LinkState::Bound(partner) => {
                let partner_agent = self.mixture.agent(partner.agent)?;
                let partner_site = partner_agent.sites.get(partner.site)?;
                LinkView::Partner {
                    node: partner.agent,
                    label: &partner_site.label,
                    agent_ty: partner_agent.ty(),
                }
            }
        };
        Some(SiteView {
            internal: &site.state,
            link,
        })
    }
}

// ── updates ─────────────────────────────────────────────────────────

/// A description of edits to perform on the mixture.
///
/// Rules produce updates instead of mutating the mixture directly; the
/// mixture applies them atomically and keeps its indices consistent.
#[derive(Debug, Default)]
pub struct MixtureUpdate {
    agents_to_add: Vec<Agent>,
    agents_to_remove: Vec<AgentId>,
    edges_to_add: FxHashSet<Edge>,
    edges_to_remove: FxHashSet<Edge>,
    state_changes: Vec<(SiteRef, InternalState)>,
}

impl MixtureUpdate {
    /// An empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the update describes no edits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents_to_add.is_empty()
            && self.agents_to_remove.is_empty()
            && self.edges_to_add.is_empty()
            && self.edges_to_remove.is_empty()
            && self.state_changes.is_empty()
    }

    /// Schedules the creation of a detached instance of `template`,
    /// returning the handle edges may use to reach it.
    pub fn create_agent(&mut self, template: &AgentPattern) -> Result<AgentRef, MixtureError> {
        let agent = Agent::instantiate(template)?;
        self.agents_to_add.push(agent);
        Ok(AgentRef::New(self.agents_to_add.len() - 1))
    }

    /// Schedules the removal of `id` along with every bond it holds.
    pub fn remove_agent(&mut self, mixture: &Mixture, id: AgentId) -> Result<(), MixtureError> {
        let agent = mixture.agent(id).ok_or(MixtureError::UnknownAgent(id))?;
        for (s_ix, site) in agent.sites().iter().enumerate() {
            if let LinkState::Bound(partner) = site.link {
                self.push_edge_removal(Edge::new(
                    PendingSiteRef::existing(SiteRef {
                        agent: id,
                        site: s_ix,
                    }),
                    PendingSiteRef::existing(partner),
                ));
            }
        }
        self.agents_to_remove.push(id);
        Ok(())
    }

    /// Schedules a bond between two sites, first scheduling the removal of
    /// any conflicting bond either site currently holds. A bond that already
    /// exists between exactly these two sites is left untouched.
    pub fn connect_sites(&mut self, mixture: &Mixture, a: PendingSiteRef, b: PendingSiteRef) {
        let existing = |end: PendingSiteRef| match end.agent {
            AgentRef::Existing(id) => Some(SiteRef {
                agent: id,
                site: end.site,
            }),
            AgentRef::New(_) => None,
        };
        if let (Some(sa), Some(sb)) = (existing(a), existing(b)) {
            if mixture.partner(sa) == Some(sb) {
                return;
            }
        }
        for end in [a, b] {
            if let Some(site) = existing(end) {
                self.disconnect_site(mixture, site);
            }
        }
        self.push_edge(Edge::new(a, b));
    }

    /// Schedules the removal of the bond `site` currently holds, if any.
    pub fn disconnect_site(&mut self, mixture: &Mixture, site: SiteRef) {
        if let Some(partner) = mixture.partner(site) {
            self.push_edge_removal(Edge::new(
                PendingSiteRef::existing(site),
                PendingSiteRef::existing(partner),
            ));
        }
    }

    /// Schedules an internal-state write on an existing site.
    pub fn set_internal_state(&mut self, site: SiteRef, state: InternalState) {
        self.state_changes.push((site, state));
    }

    pub(crate) fn push_edge(&mut self, edge: Edge) {
        self.edges_to_add.insert(edge);
    }

    fn push_edge_removal(&mut self, edge: Edge) {
        self.edges_to_remove.insert(edge);
    }

    /// The agents scheduled for creation.
    #[must_use]
    pub fn created_agents(&self) -> &[Agent] {
        &self.agents_to_add
    }

    /// The agents scheduled for removal.
    #[must_use]
    pub fn removed_agents(&self) -> &[AgentId] {
        &self.agents_to_remove
    }

    /// The bonds scheduled for creation.
    #[must_use]
    pub fn edges_to_add(&self) -> &FxHashSet<Edge> {
        &self.edges_to_add
    }

    /// The bonds scheduled for removal.
    #[must_use]
    pub fn edges_to_remove(&self) -> &FxHashSet<Edge> {
        &self.edges_to_remove
    }

    /// The scheduled internal-state writes.
    #[must_use]
    pub fn state_changes(&self) -> &[(SiteRef, InternalState)] {
        &self.state_changes
    }

    /// Agents whose embedding coverage must be invalidated before the update
    /// is applied: removals, state writes, and both endpoints of every bond
    /// edit (a *new* bond can break an empty-site match just as a removed
    /// one breaks a bond match).
    #[must_use]
    pub fn touched_before(&self) -> FxHashSet<AgentId> {
        let mut touched = FxHashSet::default();
        touched.extend(self.agents_to_remove.iter().copied());
        touched.extend(self.state_changes.iter().map(|(site, _)| site.agent));
        for edge in self.edges_to_remove.iter().chain(&self.edges_to_add) {
            let (a, b) = edge.endpoints();
            for end in [a, b] {
                if let AgentRef::Existing(id) = end.agent {
                    touched.insert(id);
                }
            }
        }
        touched
    }

    /// Agents whose neighborhoods must be rescanned after the update:
    /// everything in [`MixtureUpdate::touched_before`] that survived, plus
    /// the created agents.
    pub(crate) fn touched_after(&self, new_ids: &[AgentId]) -> FxHashSet<AgentId> {
        let removed: FxHashSet<AgentId> = self.agents_to_remove.iter().copied().collect();
        let mut touched = FxHashSet::default();
        touched.extend(new_ids.iter().copied());
        touched.extend(self.state_changes.iter().map(|(site, _)| site.agent));
        for edge in self.edges_to_remove.iter().chain(&self.edges_to_add) {
            let (a, b) = edge.endpoints();
            for end in [a, b] {
                match end.agent {
                    AgentRef::Existing(id) => {
                        touched.insert(id);
                    }
                    AgentRef::New(ix) => {
                        if let Some(id) = new_ids.get(ix) {
                            touched.insert(*id);
                        }
                    }
                }
            }
        }
        touched.retain(|id| !removed.contains(id));
        touched
    }
}

fn resolve_existing(edge: &Edge) -> Result<(SiteRef, SiteRef), MixtureError> {
    let (a, b) = edge.endpoints();
    let resolve = |end: PendingSiteRef| match end.agent {
        AgentRef::Existing(id) => Ok(SiteRef {
            agent: id,
            site: end.site,
        }),
        AgentRef::New(ix) => Err(MixtureError::PendingOutOfRange(ix)),
    };
    Ok((resolve(a)?, resolve(b)?))
}

fn resolve_pending(edge: &Edge, new_ids: &[AgentId]) -> Result<(SiteRef, SiteRef), MixtureError> {
    let (a, b) = edge.endpoints();
    let resolve = |end: PendingSiteRef| -> Result<SiteRef, MixtureError> {
        let agent = match end.agent {
            AgentRef::Existing(id) => id,
            AgentRef::New(ix) => *new_ids.get(ix).ok_or(MixtureError::PendingOutOfRange(ix))?,
        };
        Ok(SiteRef {
            agent,
            site: end.site,
        })
    };
    Ok((resolve(a)?, resolve(b)?))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn ab_dimer() -> Pattern {
        Pattern::new(vec![
            AgentPattern::new("A", [SitePattern::new("a").bond(1)]),
            AgentPattern::new("B", [SitePattern::new("b").bond(1)]),
        ])
        .unwrap()
    }

    fn free_a() -> Pattern {
        Pattern::new(vec![AgentPattern::new("A", [SitePattern::new("a").empty()])]).unwrap()
    }

    #[test]
    fn instantiate_builds_agents_and_bonds() {
        let mut mixture = Mixture::new();
        mixture.instantiate(&ab_dimer(), 3).unwrap();
        assert_eq!(mixture.agent_count(), 6);
        assert_eq!(mixture.complex_count(), 3);
        assert_eq!(mixture.agents_of_type("A").len(), 3);
        for id in mixture.agents_of_type("A") {
            let partner = mixture.partner(SiteRef { agent: id, site: 0 }).unwrap();
            assert_eq!(mixture.agent(partner.agent).unwrap().ty(), "B");
        }
    }

    #[test]
    fn instantiate_rejects_underspecified_patterns() {
        let mut mixture = Mixture::new();
        let wild = Pattern::new(vec![AgentPattern::new(
            "A",
            [SitePattern::new("a").link_wildcard()],
        )])
        .unwrap();
        assert_eq!(mixture.instantiate(&wild, 1), Err(MixtureError::Underspecified));
    }

    #[test]
    fn tracked_counts_follow_unbinding() {
        let mut mixture = Mixture::new();
        mixture.instantiate(&ab_dimer(), 2).unwrap();
        let bonded = ab_dimer().into_component().unwrap();
        let free = free_a().into_component().unwrap();
        mixture.track_component(&bonded).unwrap();
        mixture.track_component(&free).unwrap();
        assert_eq!(mixture.embedding_count(&bonded), Some(2));
        assert_eq!(mixture.embedding_count(&free), Some(0));

        // Remove one A–B bond through an update.
        let a = mixture.agents_of_type("A")[0];
        let mut update = MixtureUpdate::new();
        update.disconnect_site(&mixture, SiteRef { agent: a, site: 0 });
        mixture.apply_update(update).unwrap();

        assert_eq!(mixture.embedding_count(&bonded), Some(1));
        assert_eq!(mixture.embedding_count(&free), Some(1));
        assert_eq!(mixture.complex_count(), 3);
    }

    #[test]
    fn binding_merges_complexes_and_rekeys_embeddings() {
        let mut mixture = Mixture::new();
        let a_free = free_a();
        let b_free =
            Pattern::new(vec![AgentPattern::new("B", [SitePattern::new("b").empty()])]).unwrap();
        mixture.instantiate(&a_free, 1).unwrap();
        mixture.instantiate(&b_free, 1).unwrap();
        let bonded = ab_dimer().into_component().unwrap();
        mixture.track_component(&bonded).unwrap();
        assert_eq!(mixture.embedding_count(&bonded), Some(0));

        let a = mixture.agents_of_type("A")[0];
        let b = mixture.agents_of_type("B")[0];
        let mut update = MixtureUpdate::new();
        update.connect_sites(
            &mixture,
            PendingSiteRef::existing(SiteRef { agent: a, site: 0 }),
            PendingSiteRef::existing(SiteRef { agent: b, site: 0 }),
        );
        mixture.apply_update(update).unwrap();

        assert_eq!(mixture.complex_count(), 1);
        assert_eq!(mixture.embedding_count(&bonded), Some(1));
        let complex = mixture.complex_of(a).unwrap();
        assert_eq!(mixture.count_in_complex(&bonded, complex), 1);
    }

    #[test]
    fn removed_agents_leave_no_embeddings_behind() {
        let mut mixture = Mixture::new();
        mixture.instantiate(&ab_dimer(), 2).unwrap();
        let bonded = ab_dimer().into_component().unwrap();
        mixture.track_component(&bonded).unwrap();

        let a = mixture.agents_of_type("A")[0];
        let mut update = MixtureUpdate::new();
        update.remove_agent(&mixture, a).unwrap();
        mixture.apply_update(update).unwrap();

        assert_eq!(mixture.agent_count(), 3);
        assert_eq!(mixture.embedding_count(&bonded), Some(1));
        assert_eq!(mixture.complex_count(), 2);
    }

    #[test]
    fn state_writes_update_matches() {
        let mut mixture = Mixture::new();
        let u = Pattern::new(vec![AgentPattern::new(
            "A",
            [SitePattern::new("a").empty().state("u")],
        )])
        .unwrap();
        mixture.instantiate(&u, 1).unwrap();
        let wants_p = Pattern::new(vec![AgentPattern::new("A", [SitePattern::new("a").state("p")])])
            .unwrap()
            .into_component()
            .unwrap();
        mixture.track_component(&wants_p).unwrap();
        assert_eq!(mixture.embedding_count(&wants_p), Some(0));

        let a = mixture.agents_of_type("A")[0];
        let mut update = MixtureUpdate::new();
        update.set_internal_state(SiteRef { agent: a, site: 0 }, InternalState::tag("p"));
        mixture.apply_update(update).unwrap();
        assert_eq!(mixture.embedding_count(&wants_p), Some(1));
    }

    #[test]
    fn removing_a_missing_bond_is_rejected() {
        let mut mixture = Mixture::new();
        mixture.instantiate(&free_a(), 2).unwrap();
        let ids = mixture.agents_of_type("A");
        let mut update = MixtureUpdate::new();
        update.push_edge_removal(Edge::new(
            PendingSiteRef::existing(SiteRef {
                agent: ids[0],
                site: 0,
            }),
            PendingSiteRef::existing(SiteRef {
                agent: ids[1],
                site: 0,
            }),
        ));
        assert!(matches!(
            mixture.apply_update(update),
            Err(MixtureError::MissingBond { .. })
        ));
    }

    #[test]
    fn census_groups_isomorphic_complexes() {
        let mut mixture = Mixture::new();
        mixture.instantiate(&ab_dimer(), 3).unwrap();
        mixture.instantiate(&free_a(), 2).unwrap();
        let census = mixture.census();
        assert_eq!(census.len(), 2);
        let mut counts: Vec<usize> = census.iter().map(|(_, n)| *n).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![2, 3]);
    }

    #[test]
    fn isomorphic_fallback_finds_tracked_component() {
        let mut mixture = Mixture::new();
        mixture.instantiate(&ab_dimer(), 4).unwrap();
        let tracked = ab_dimer().into_component().unwrap();
        mixture.track_component(&tracked).unwrap();
        let lookalike = ab_dimer().into_component().unwrap();
        assert_ne!(tracked.id(), lookalike.id());
        assert_eq!(mixture.embedding_count(&lookalike), Some(4));
    }
}
