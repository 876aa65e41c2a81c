//! The engine: node arena, structural edits under the locking discipline,
//! and the render/evaluate entry points.
//!
//! Every structural edit follows the same shape: take the scoped node locks
//! it needs, mutate under the short inner locks, assert invariants, release,
//! then emit notifications. Inner locks are always taken in the order
//! topology, nodes, lending, instances, and never held while a node renders
//! or evaluates. Slot construction (`init_state`) is the one piece of node
//! code run under a node's instances lock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::borrow;
use crate::chunk::Chunk;
use crate::dependency::{DependencyGraph, NodeId, SignalKind};
use crate::error::GraphError;
use crate::invariant_ppt::{
    assert_invariant, BORROWER_ATTACHED, BORROWER_DETACHED, EDGE_ADMITTED, EDGE_REJECTED,
    GRAPH_ACYCLIC, NODE_SEVERED,
};
use crate::lock::{Access, LockGuard, RecursiveRwLock};
use crate::multiplicity::{Instances, Key, Multiplicity, TimeDomain};
use crate::node::{
    EvalContext, NumberSource, NumberSourceDyn, Pure, RenderContext, SoundSource, SoundSourceDyn,
    Stateful, StatefulNumberSource,
};
use crate::signal::{BorrowEvent, DependencyEvent, GraphSignals, KeyEvent, ValueEvent};
use crate::states::{StateCell, StateIds};
use crate::table::{BorrowerId, StateTable};
use crate::EngineConfig;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

struct SoundNode {
    source: Arc<dyn SoundSourceDyn>,
    multiplicity: Multiplicity,
    time_domain: TimeDomain,
    instances: RwLock<Instances>,
}

struct NumberNode {
    source: Arc<dyn NumberSourceDyn>,
}

enum NodeBody {
    Sound(SoundNode),
    Number(NumberNode),
}

struct NodeEntry {
    name: Option<String>,
    lock: Arc<RecursiveRwLock>,
    body: NodeBody,
}

impl NodeEntry {
    fn sound(&self) -> Option<&SoundNode> {
        match &self.body {
            NodeBody::Sound(sound) => Some(sound),
            NodeBody::Number(_) => None,
        }
    }

    fn number(&self) -> Option<&NumberNode> {
        match &self.body {
            NodeBody::Number(number) => Some(number),
            NodeBody::Sound(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lending {
    lender: NodeId,
    borrower: BorrowerId,
}

/// A graph of sound and number nodes with per-context state.
///
/// `Graph` is shared between a render thread and any number of control
/// threads through an `Arc`; every method takes `&self`.
pub struct Graph {
    config: EngineConfig,
    topology: RwLock<DependencyGraph>,
    nodes: RwLock<Vec<Option<Arc<NodeEntry>>>>,
    lending: RwLock<HashMap<NodeId, Lending>>,
    ids: StateIds,
    signals: GraphSignals,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            topology: RwLock::new(DependencyGraph::new()),
            nodes: RwLock::new(Vec::new()),
            lending: RwLock::new(HashMap::new()),
            ids: StateIds::new(),
            signals: GraphSignals::default(),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Change notifications.
    pub fn signals(&self) -> &GraphSignals {
        &self.signals
    }

    fn entry(&self, id: NodeId) -> Option<Arc<NodeEntry>> {
        self.nodes.read().get(id.0).cloned().flatten()
    }

    fn try_entry(&self, id: NodeId) -> Result<Arc<NodeEntry>, GraphError> {
        self.entry(id).ok_or(GraphError::InvalidNode(id))
    }

    fn insert_node(&self, kind: SignalKind, name: Option<String>, make: impl FnOnce(NodeId) -> NodeBody) -> NodeId {
        let mut topology = self.topology.write();
        let id = topology.add_node(kind);
        let entry = Arc::new(NodeEntry {
            name,
            lock: Arc::new(RecursiveRwLock::new()),
            body: make(id),
        });
        let mut nodes = self.nodes.write();
        if nodes.len() <= id.0 {
            nodes.resize(id.0 + 1, None);
        }
        nodes[id.0] = Some(entry);
        tracing::debug!("graph_add: {id} ({kind:?})");
        id
    }

    // ---- node creation -------------------------------------------------

    /// Add a sound node.
    pub fn add_sound<S: SoundSource>(&self, source: S) -> NodeId {
        self.add_sound_inner(None, source)
    }

    /// Add a sound node with a display name.
    pub fn add_sound_named<S: SoundSource>(&self, name: impl Into<String>, source: S) -> NodeId {
        self.add_sound_inner(Some(name.into()), source)
    }

    fn add_sound_inner<S: SoundSource>(&self, name: Option<String>, source: S) -> NodeId {
        let source: Arc<dyn SoundSourceDyn> = Arc::new(source);
        let multiplicity = source.multiplicity();
        let time_domain = source.time_domain();
        self.insert_node(SignalKind::Sound, name, |id| {
            let table = StateTable::new(id, source.clone().state_allocator());
            let instances = Instances::new(multiplicity, table, &self.ids);
            NodeBody::Sound(SoundNode {
                source,
                multiplicity,
                time_domain,
                instances: RwLock::new(instances),
            })
        })
    }

    /// Add a pure number node.
    pub fn add_number<N: NumberSource>(&self, source: N) -> NodeId {
        self.add_number_inner(None, Arc::new(Pure(source)))
    }

    /// Add a pure number node with a display name.
    pub fn add_number_named<N: NumberSource>(&self, name: impl Into<String>, source: N) -> NodeId {
        self.add_number_inner(Some(name.into()), Arc::new(Pure(source)))
    }

    /// Add a number node that borrows state from a sound node once attached
    /// with [`borrow_from`](Self::borrow_from).
    pub fn add_stateful_number<N: StatefulNumberSource>(&self, source: N) -> NodeId {
        self.add_number_inner(None, Arc::new(Stateful(source)))
    }

    /// Add a stateful number node with a display name.
    pub fn add_stateful_number_named<N: StatefulNumberSource>(
        &self,
        name: impl Into<String>,
        source: N,
    ) -> NodeId {
        self.add_number_inner(Some(name.into()), Arc::new(Stateful(source)))
    }

    fn add_number_inner(&self, name: Option<String>, source: Arc<dyn NumberSourceDyn>) -> NodeId {
        self.insert_node(SignalKind::Number, name, |_| NodeBody::Number(NumberNode { source }))
    }

    // ---- locking -------------------------------------------------------

    /// Lock plan: `writes` and the transitive dependencies of `cascade` are
    /// written, every other transitive dependency of `writes` is read.
    /// Dependencies come first.
    fn lock_plan(&self, writes: &[NodeId], cascade: &[NodeId]) -> Result<Vec<(NodeId, Access)>, GraphError> {
        let topology = self.topology.read();
        let mut access: BTreeMap<NodeId, Access> = BTreeMap::new();
        for &node in writes {
            if !topology.contains(node) {
                return Err(GraphError::InvalidNode(node));
            }
            access.insert(node, Access::Write);
        }
        for &node in cascade {
            for dependency in topology.transitive_dependencies(node) {
                access.insert(dependency, Access::Write);
            }
        }
        for &node in writes {
            for dependency in topology.transitive_dependencies(node) {
                access.entry(dependency).or_insert(Access::Read);
            }
        }
        let ranks = topology.ranks();
        let mut plan: Vec<(NodeId, Access)> = access.into_iter().collect();
        plan.sort_by_key(|(id, _)| (ranks[id.0], *id));
        Ok(plan)
    }

    fn acquire(&self, writes: &[NodeId], cascade: &[NodeId]) -> Result<LockGuard, GraphError> {
        loop {
            let plan = self.lock_plan(writes, cascade)?;
            let locks = plan
                .iter()
                .filter_map(|(id, access)| self.entry(*id).map(|e| (e.lock.clone(), *access)))
                .collect();
            let guard = LockGuard::acquire(locks);
            if self.lock_plan(writes, cascade)? == plan {
                return Ok(guard);
            }
            tracing::trace!("lock plan changed while acquiring, retrying");
        }
    }

    fn acquire_read(&self, root: NodeId) -> Result<LockGuard, GraphError> {
        loop {
            let plan = self.read_plan(root)?;
            let locks = plan
                .iter()
                .filter_map(|id| self.entry(*id).map(|e| (e.lock.clone(), Access::Read)))
                .collect();
            let guard = LockGuard::acquire(locks);
            if self.read_plan(root)? == plan {
                return Ok(guard);
            }
        }
    }

    fn read_plan(&self, root: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let topology = self.topology.read();
        if !topology.contains(root) {
            return Err(GraphError::InvalidNode(root));
        }
        let ranks = topology.ranks();
        let mut plan = topology.transitive_dependencies(root);
        plan.push(root);
        plan.sort_by_key(|id| (ranks[id.0], *id));
        Ok(plan)
    }

    /// Scoped lock: write on `node`, read on everything it transitively
    /// depends on. Structural edits made while holding it re-enter it; an
    /// edit that writes one of those dependencies upgrades its read lock.
    pub fn lock(&self, node: NodeId) -> Result<LockGuard, GraphError> {
        self.acquire(&[node], &[])
    }

    // ---- edges ---------------------------------------------------------

    /// Make `dependent` pull from `dependency`.
    ///
    /// Fails with `Cycle` if `dependency` already reaches `dependent`,
    /// `Multiplicity` if `dependency` is uncontrolled and already has another
    /// sound dependent, `Policy` if a borrowed state would become
    /// unreachable, and `KindMismatch` if a number node would pull sound.
    pub fn add_dependency(&self, dependent: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        let guard = self.acquire(&[dependent, dependency], &[])?;
        let result = self.add_dependency_locked(dependent, dependency);
        drop(guard);
        match &result {
            Ok(()) => {
                tracing::debug!("graph_connect: {dependent} → {dependency}");
                self.signals.dependency_added.emit(&DependencyEvent { dependent, dependency });
            }
            Err(err) => tracing::debug!("graph_connect rejected: {err}"),
        }
        result
    }

    fn add_dependency_locked(&self, dependent: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        let dependency_entry = self.try_entry(dependency)?;
        let mut topology = self.topology.write();

        if let Some(sound) = dependency_entry.sound() {
            if sound.multiplicity == Multiplicity::Uncontrolled
                && topology.kind(dependent) == Some(SignalKind::Sound)
            {
                let existing = topology
                    .dependents(dependency)
                    .iter()
                    .copied()
                    .find(|d| *d != dependent && topology.kind(*d) == Some(SignalKind::Sound));
                if let Some(existing) = existing {
                    return Err(GraphError::Multiplicity {
                        node: dependency,
                        existing,
                    });
                }
            }
        }

        let edges_before = topology.dependencies(dependent).len();
        let lending = self.lending.read();
        let lenders = |n: NodeId| lending.get(&n).map(|l| l.lender);
        let result = topology.add_dependency_with(dependent, dependency, |g| {
            if g.kind(dependency) == Some(SignalKind::Number) {
                borrow::admit_edge(g, &lenders, dependent, dependency)
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                assert_invariant(
                    GRAPH_ACYCLIC,
                    !topology.depends_on(dependency, dependent),
                    "dependency does not reach its dependent",
                    None,
                );
                assert_invariant(EDGE_ADMITTED, topology.has_edge(dependent, dependency), "edge present", None);
            }
            Err(GraphError::DuplicateEdge { .. }) => {}
            Err(_) => {
                assert_invariant(
                    EDGE_REJECTED,
                    !topology.has_edge(dependent, dependency)
                        && topology.dependencies(dependent).len() == edges_before,
                    "rejected edge leaves the graph unchanged",
                    None,
                );
            }
        }
        result
    }

    /// Stop `dependent` pulling from `dependency`. Slots the dependency kept
    /// for the dependent's states are torn down, recursively.
    pub fn remove_dependency(&self, dependent: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        let guard = self.acquire(&[dependent, dependency], &[dependency])?;
        self.topology.write().remove_dependency(dependent, dependency)?;
        if let Some(sound) = self.entry(dependency).as_deref().and_then(NodeEntry::sound) {
            let erased = sound.instances.write().release_owner(dependent);
            self.teardown(dependency, erased);
        }
        drop(guard);
        tracing::debug!("graph_disconnect: {dependent} → {dependency}");
        self.signals
            .dependency_removed
            .emit(&DependencyEvent { dependent, dependency });
        Ok(())
    }

    fn sound_dependencies(&self, node: NodeId) -> Vec<NodeId> {
        let topology = self.topology.read();
        topology
            .dependencies(node)
            .iter()
            .copied()
            .filter(|d| topology.kind(*d) == Some(SignalKind::Sound))
            .collect()
    }

    /// Release every slot created for `erased` in the sound dependencies of
    /// `node`, and recursively below them.
    fn teardown(&self, node: NodeId, erased: Vec<Arc<StateCell>>) {
        if erased.is_empty() {
            return;
        }
        self.teardown_into(&self.sound_dependencies(node), erased);
    }

    fn teardown_into(&self, dependencies: &[NodeId], erased: Vec<Arc<StateCell>>) {
        if erased.is_empty() {
            return;
        }
        for &dependency in dependencies {
            let Some(entry) = self.entry(dependency) else {
                continue;
            };
            let Some(sound) = entry.sound() else {
                continue;
            };
            let released: Vec<Arc<StateCell>> = {
                let mut instances = sound.instances.write();
                erased
                    .iter()
                    .flat_map(|cell| instances.release_context(cell.id()))
                    .collect()
            };
            if !released.is_empty() {
                tracing::trace!("teardown: {} slots of {dependency}", released.len());
            }
            self.teardown(dependency, released);
        }
    }

    // ---- keys ----------------------------------------------------------

    /// Add `key` to a divergent node: every dependent context gains a slot.
    pub fn add_key(&self, node: NodeId, key: Key) -> Result<(), GraphError> {
        let guard = self.acquire(&[node], &[])?;
        let entry = self.try_entry(node)?;
        let sound = entry.sound().ok_or(GraphError::NotSound(node))?;
        let created = sound.instances.write().add_key(&self.ids, key)?;
        drop(guard);
        tracing::debug!("key_add: {node} {key} ({} slots)", created.len());
        self.signals.key_added.emit(&KeyEvent { node, key });
        Ok(())
    }

    /// Remove `key` from a divergent node, tearing down its slots and every
    /// slot created for them below.
    pub fn remove_key(&self, node: NodeId, key: Key) -> Result<(), GraphError> {
        let guard = self.acquire(&[node], &[node])?;
        let entry = self.try_entry(node)?;
        let sound = entry.sound().ok_or(GraphError::NotSound(node))?;
        let erased = sound.instances.write().remove_key(key)?;
        let count = erased.len();
        self.teardown(node, erased);
        drop(guard);
        tracing::debug!("key_remove: {node} {key} ({count} slots)");
        self.signals.key_removed.emit(&KeyEvent { node, key });
        Ok(())
    }

    /// Keys of a divergent node, ascending. Empty for other nodes.
    pub fn keys(&self, node: NodeId) -> Vec<Key> {
        self.entry(node)
            .as_deref()
            .and_then(NodeEntry::sound)
            .map(|s| s.instances.read().keys().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn key_count(&self, node: NodeId) -> usize {
        self.entry(node)
            .as_deref()
            .and_then(NodeEntry::sound)
            .map_or(0, |s| s.instances.read().keys().len())
    }

    pub(crate) fn key_at(&self, node: NodeId, index: usize) -> Option<Key> {
        let entry = self.entry(node)?;
        let key = entry.sound()?.instances.read().keys().get(index).copied();
        key
    }

    // ---- borrowing -----------------------------------------------------

    /// Attach `borrower` to `lender`, move it to a new lender, or detach it
    /// with `None`. Detaching a node that was never attached does nothing.
    pub fn borrow_from(&self, borrower: NodeId, lender: Option<NodeId>) -> Result<(), GraphError> {
        let entry = self.try_entry(borrower)?;
        let number = entry.number().ok_or(GraphError::NotNumber(borrower))?;
        if self.lender_of(borrower) == lender {
            return Ok(());
        }
        if !number.source.is_stateful() {
            return Err(GraphError::Stateless(borrower));
        }

        // The current lender is part of the write set, so it must not change
        // between planning and holding the locks.
        let (guard, previous) = loop {
            let previous = self.lender_of(borrower);
            let mut writes = vec![borrower];
            writes.extend(previous);
            writes.extend(lender);
            let guard = self.acquire(&writes, &[])?;
            if self.lender_of(borrower) == previous {
                break (guard, previous);
            }
            drop(guard);
            tracing::trace!("lender of {borrower} changed while acquiring, retrying");
        };
        if previous == lender {
            return Ok(());
        }

        let new_lender = match lender {
            Some(l) => {
                let lender_entry = self.try_entry(l)?;
                if lender_entry.sound().is_none() {
                    return Err(GraphError::NotSound(l));
                }
                let topology = self.topology.read();
                let lending = self.lending.read();
                let lenders = |n: NodeId| {
                    if n == borrower {
                        Some(l)
                    } else {
                        lending.get(&n).map(|x| x.lender)
                    }
                };
                borrow::admit_lender(&topology, &lenders, borrower)?;
                Some(lender_entry)
            }
            None => None,
        };

        let old = self.lending.write().remove(&borrower);
        if let Some(old) = old {
            self.detach_from(old);
        }
        if let (Some(lender_entry), Some(lender)) = (new_lender, lender) {
            let allocator = number.source.clone().state_allocator();
            if let (Some(sound), Some(allocator)) = (lender_entry.sound(), allocator) {
                let id = {
                    let mut instances = sound.instances.write();
                    let id = instances.table_mut().add_borrower_allocator(allocator);
                    let table = instances.table();
                    assert_invariant(
                        BORROWER_ATTACHED,
                        table.borrowed_index(id).is_some_and(|index| {
                            table.slots().iter().all(|cell| cell.substate_count() > index)
                        }),
                        "borrowed sub-state present in every lender slot",
                        None,
                    );
                    id
                };
                self.lending.write().insert(
                    borrower,
                    Lending {
                        lender,
                        borrower: id,
                    },
                );
                tracing::debug!("borrow_attach: {borrower} ← {lender}");
            }
        }
        drop(guard);

        self.signals.borrow_changed.emit(&BorrowEvent {
            borrower,
            previous,
            current: self.lender_of(borrower),
        });
        Ok(())
    }

    fn detach_from(&self, lending: Lending) {
        let Some(entry) = self.entry(lending.lender) else {
            return;
        };
        let Some(sound) = entry.sound() else {
            return;
        };
        let mut instances = sound.instances.write();
        let removed = instances.table_mut().remove_borrower_allocator(lending.borrower);
        assert_invariant(
            BORROWER_DETACHED,
            removed && instances.table().borrowed_index(lending.borrower).is_none(),
            "borrower removed from lender table",
            None,
        );
        tracing::debug!("borrow_detach: from {}", lending.lender);
    }

    /// The node `borrower` borrows from.
    pub fn lender_of(&self, borrower: NodeId) -> Option<NodeId> {
        self.lending.read().get(&borrower).map(|l| l.lender)
    }

    /// Nodes borrowing from `lender`, ascending.
    pub fn borrowers_of(&self, lender: NodeId) -> Vec<NodeId> {
        let mut borrowers: Vec<NodeId> = self
            .lending
            .read()
            .iter()
            .filter(|(_, l)| l.lender == lender)
            .map(|(b, _)| *b)
            .collect();
        borrowers.sort_unstable();
        borrowers
    }

    // ---- removal -------------------------------------------------------

    /// Remove a node. Its edges are severed first, then borrowers it lends
    /// to are detached, then its slots and every slot created for them are
    /// torn down.
    pub fn remove_node(&self, node: NodeId) -> Result<(), GraphError> {
        let (guard, entry) = loop {
            let writes = self.removal_writes(node)?;
            let guard = self.acquire(&writes, &[node])?;
            if self.removal_writes(node)? == writes {
                break (guard, self.try_entry(node)?);
            }
        };

        let dependencies = self.sound_dependencies(node);
        let severed = self.topology.write().remove_node(node)?;
        assert_invariant(
            NODE_SEVERED,
            severed
                .iter()
                .all(|(a, b)| !self.topology.read().has_edge(*a, *b)),
            "removed node keeps no edges",
            None,
        );

        let mut detached = Vec::new();
        let own = self.lending.write().remove(&node);
        if let Some(own) = own {
            self.detach_from(own);
            detached.push(BorrowEvent {
                borrower: node,
                previous: Some(own.lender),
                current: None,
            });
        }
        let lent: Vec<NodeId> = {
            let mut lending = self.lending.write();
            let lent: Vec<NodeId> = lending
                .iter()
                .filter(|(_, l)| l.lender == node)
                .map(|(b, _)| *b)
                .collect();
            for borrower in &lent {
                lending.remove(borrower);
            }
            lent
        };
        detached.extend(lent.into_iter().map(|borrower| BorrowEvent {
            borrower,
            previous: Some(node),
            current: None,
        }));

        if let Some(sound) = entry.sound() {
            let erased = sound.instances.write().clear();
            self.teardown_into(&dependencies, erased);
        }
        if let Some(slot) = self.nodes.write().get_mut(node.0) {
            *slot = None;
        }
        drop(guard);

        tracing::debug!("graph_remove: {node} ({} edges severed)", severed.len());
        for (dependent, dependency) in severed {
            self.signals
                .dependency_removed
                .emit(&DependencyEvent { dependent, dependency });
        }
        for event in &detached {
            self.signals.borrow_changed.emit(event);
        }
        self.signals.node_removed.emit(&node);
        Ok(())
    }

    fn removal_writes(&self, node: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let topology = self.topology.read();
        if !topology.contains(node) {
            return Err(GraphError::InvalidNode(node));
        }
        let mut writes = vec![node];
        writes.extend_from_slice(topology.dependents(node));
        drop(topology);
        writes.extend(self.lender_of(node));
        writes.extend(self.borrowers_of(node));
        Ok(writes)
    }

    // ---- render / evaluate ---------------------------------------------

    /// Render one chunk of `root` as the root of a render: its slot has no
    /// dependent context. Holds read locks on `root` and everything it
    /// depends on for the duration. Returns false, with `out` silent, if
    /// nothing could be rendered.
    pub fn render_chunk(&self, root: NodeId, out: &mut Chunk) -> bool {
        self.render_chunk_keyed(root, None, out)
    }

    /// [`render_chunk`](Self::render_chunk) for a divergent root.
    pub fn render_chunk_keyed(&self, root: NodeId, key: Option<Key>, out: &mut Chunk) -> bool {
        let Ok(_guard) = self.acquire_read(root) else {
            out.silence();
            return false;
        };
        self.render_node(root, None, key, out)
    }

    pub(crate) fn render_node(
        &self,
        node: NodeId,
        context: Option<&Arc<StateCell>>,
        key: Option<Key>,
        out: &mut Chunk,
    ) -> bool {
        let Some(entry) = self.entry(node) else {
            out.silence();
            return false;
        };
        let Some(sound) = entry.sound() else {
            out.silence();
            return false;
        };
        let found = sound.instances.read().lookup(context, key);
        let cell = match found {
            Some(cell) => cell,
            None => match sound.instances.write().resolve(&self.ids, context, key) {
                Some(cell) => cell,
                None => {
                    out.silence();
                    return false;
                }
            },
        };

        cell.begin_chunk();
        let ctx = RenderContext::new(self, node, sound.time_domain, &cell);
        let rendered = cell
            .with_substate(0, |state| sound.source.render_next_chunk(out, state, &ctx))
            .is_some();
        if !rendered {
            out.silence();
        }
        rendered
    }

    /// Evaluate a number node outside any render. Stateful nodes have no
    /// context here and return their neutral value.
    pub fn evaluate(&self, node: NodeId) -> f64 {
        match self.acquire_read(node) {
            Ok(_guard) => self.evaluate_in(node, None),
            Err(_) => 0.0,
        }
    }

    /// Evaluate a number node in the context of a sound node's state.
    pub fn evaluate_with(&self, node: NodeId, context: &Arc<StateCell>) -> f64 {
        match self.acquire_read(node) {
            Ok(_guard) => self.evaluate_in(node, Some(context)),
            Err(_) => 0.0,
        }
    }

    pub(crate) fn evaluate_in(&self, node: NodeId, context: Option<&Arc<StateCell>>) -> f64 {
        let Some(entry) = self.entry(node) else {
            return 0.0;
        };
        let Some(number) = entry.number() else {
            return 0.0;
        };
        let ctx = EvalContext::new(self, node, context);
        if !number.source.is_stateful() {
            return number.source.evaluate(&ctx);
        }

        let neutral = number.source.neutral();
        let lending = self.lending.read().get(&node).copied();
        let Some(lending) = lending else {
            return neutral;
        };
        let Some(cell) = context.and_then(|c| c.find_ancestor(lending.lender)) else {
            return neutral;
        };
        let index = self
            .entry(lending.lender)
            .as_deref()
            .and_then(NodeEntry::sound)
            .and_then(|s| s.instances.read().table().borrowed_index(lending.borrower));
        let Some(index) = index else {
            return neutral;
        };
        cell.with_substate(index, |state| number.source.evaluate_with(state, &ctx))
            .unwrap_or(neutral)
    }

    /// Change a settable number node's value.
    pub fn set_value(&self, node: NodeId, value: f64) -> Result<(), GraphError> {
        let guard = self.acquire(&[node], &[])?;
        let entry = self.try_entry(node)?;
        let number = entry.number().ok_or(GraphError::NotNumber(node))?;
        if !number.source.set_value(value) {
            return Err(GraphError::NotSettable(node));
        }
        drop(guard);
        self.signals.value_changed.emit(&ValueEvent { node, value });
        Ok(())
    }

    // ---- state queries -------------------------------------------------

    /// The slot of `node` serving `(context, key)`, created if needed.
    /// `None` for unknown nodes, number nodes, and missing keys.
    pub fn state_for(&self, node: NodeId, context: Option<&Arc<StateCell>>, key: Option<Key>) -> Option<Arc<StateCell>> {
        let _guard = self.acquire_read(node).ok()?;
        let entry = self.entry(node)?;
        let sound = entry.sound()?;
        let found = sound.instances.read().lookup(context, key);
        found.or_else(|| sound.instances.write().resolve(&self.ids, context, key))
    }

    /// Every slot of `node`, in table order.
    pub fn states(&self, node: NodeId) -> Vec<Arc<StateCell>> {
        self.entry(node)
            .as_deref()
            .and_then(NodeEntry::sound)
            .map(|s| s.instances.read().table().slots().to_vec())
            .unwrap_or_default()
    }

    /// Number of slots of `node`.
    pub fn state_count(&self, node: NodeId) -> usize {
        self.entry(node)
            .as_deref()
            .and_then(NodeEntry::sound)
            .map_or(0, |s| s.instances.read().table().size())
    }

    /// Bytes per slot of `node`, borrowed sub-states included.
    pub fn slot_size(&self, node: NodeId) -> Option<usize> {
        let entry = self.entry(node)?;
        let size = entry.sound()?.instances.read().table().slot_size();
        Some(size)
    }

    // ---- topology queries ----------------------------------------------

    pub(crate) fn input(&self, node: NodeId, kind: SignalKind, index: usize) -> Option<NodeId> {
        self.topology.read().nth_dependency(node, kind, index)
    }

    pub(crate) fn count_inputs(&self, node: NodeId, kind: SignalKind) -> usize {
        self.topology.read().count_dependencies(node, kind)
    }

    /// Direct dependencies of `node`, in connection order.
    pub fn dependencies(&self, node: NodeId) -> Vec<NodeId> {
        self.topology.read().dependencies(node).to_vec()
    }

    /// Direct dependents of `node`, in connection order.
    pub fn dependents(&self, node: NodeId) -> Vec<NodeId> {
        self.topology.read().dependents(node).to_vec()
    }

    /// Everything `node` transitively depends on.
    pub fn transitive_dependencies(&self, node: NodeId) -> Vec<NodeId> {
        self.topology.read().transitive_dependencies(node)
    }

    /// Everything that transitively depends on `node`.
    pub fn transitive_dependents(&self, node: NodeId) -> Vec<NodeId> {
        self.topology.read().transitive_dependents(node)
    }

    /// True if `node` transitively depends on `target`.
    pub fn depends_on(&self, node: NodeId, target: NodeId) -> bool {
        self.topology.read().depends_on(node, target)
    }

    /// Signal kind of `node`.
    pub fn kind(&self, node: NodeId) -> Option<SignalKind> {
        self.topology.read().kind(node)
    }

    /// Multiplicity of a sound node.
    pub fn multiplicity(&self, node: NodeId) -> Option<Multiplicity> {
        self.entry(node)?.sound().map(|s| s.multiplicity)
    }

    /// Time domain of a sound node.
    pub fn time_domain(&self, node: NodeId) -> Option<TimeDomain> {
        self.entry(node)?.sound().map(|s| s.time_domain)
    }

    /// Display name given at creation.
    pub fn name(&self, node: NodeId) -> Option<String> {
        self.entry(node)?.name.clone()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.topology.read().len()
    }

    /// Ids of live nodes, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.topology.read().node_ids().collect()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("config", &self.config)
            .field("nodes", &self.node_count())
            .field("borrowers", &self.lending.read().len())
            .finish()
    }
}
