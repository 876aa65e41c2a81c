//! How many state instances a sound node keeps, and for whom.
//!
//! The multiplicity policy is fixed when the node is created. [`Instances`]
//! pairs the policy with the node's [`StateTable`] and maps a request
//! `(dependent context, key)` onto a slot, creating it on first use.

use crate::dependency::NodeId;
use crate::error::GraphError;
use crate::invariant_ppt::{
    assert_invariant, CONTEXT_TEARDOWN, DIVERGENT_GRID, UNCONTROLLED_SINGLE_SLOT,
};
use crate::states::{StateCell, StateId, StateIds};
use crate::table::StateTable;
use std::fmt;
use std::sync::Arc;

/// Instance policy of a sound node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Multiplicity {
    /// One state per dependent context.
    Singular,
    /// One state per dependent context per key.
    Divergent,
    /// Exactly one state, shared by the single permitted dependent.
    Uncontrolled,
}

/// How a sound node's time relates to its dependent's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeDomain {
    /// Lockstep with the dependent; speed is always 1.0.
    Realtime,
    /// The node reports its own speed.
    OutOfSync,
}

/// Application-chosen index of a divergent instance, e.g. a voice id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub u32);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

fn context_id(context: Option<&Arc<StateCell>>) -> Option<StateId> {
    context.map(|c| c.id())
}

/// A sound node's slots under its multiplicity policy.
#[derive(Debug)]
pub struct Instances {
    node: NodeId,
    policy: Multiplicity,
    keys: Vec<Key>,
    contexts: Vec<Option<Arc<StateCell>>>,
    table: StateTable,
}

impl Instances {
    /// Wrap `table`. An uncontrolled node gets its single slot immediately.
    pub fn new(policy: Multiplicity, table: StateTable, ids: &StateIds) -> Self {
        let node = table.owner();
        let mut instances = Self {
            node,
            policy,
            keys: Vec::new(),
            contexts: Vec::new(),
            table,
        };
        if policy == Multiplicity::Uncontrolled {
            let cell = Arc::new(StateCell::new(ids.next_id(), node, None, None));
            instances.table.insert_slot(0, cell);
            assert_invariant(
                UNCONTROLLED_SINGLE_SLOT,
                instances.table.size() == 1,
                "uncontrolled node holds one slot",
                None,
            );
        }
        instances
    }

    /// Policy.
    pub fn policy(&self) -> Multiplicity {
        self.policy
    }

    /// Keys in ascending order. Always empty unless divergent.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// The underlying table.
    pub fn table(&self) -> &StateTable {
        &self.table
    }

    /// The underlying table, for borrower attachment.
    pub fn table_mut(&mut self) -> &mut StateTable {
        &mut self.table
    }

    /// Number of distinct dependent contexts registered on a divergent node.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Existing slot for `(context, key)`, without creating one.
    pub fn lookup(&self, context: Option<&Arc<StateCell>>, key: Option<Key>) -> Option<Arc<StateCell>> {
        let index = match self.policy {
            Multiplicity::Uncontrolled => return self.table.slots().first().cloned(),
            Multiplicity::Singular => self.table.search(context_id(context), None).ok()?,
            Multiplicity::Divergent => self.table.search(context_id(context), Some(key?)).ok()?,
        };
        Some(self.table.get_state(index).clone())
    }

    /// Slot for `(context, key)`, created on first request. Divergent nodes
    /// register the context and create a slot for every key at once. `None`
    /// if a divergent node is asked for a missing key.
    pub fn resolve(
        &mut self,
        ids: &StateIds,
        context: Option<&Arc<StateCell>>,
        key: Option<Key>,
    ) -> Option<Arc<StateCell>> {
        if let Some(found) = self.lookup(context, key) {
            return Some(found);
        }
        match self.policy {
            Multiplicity::Uncontrolled => None,
            Multiplicity::Singular => {
                let index = self.table.search(context_id(context), None).err()?;
                let cell = Arc::new(StateCell::new(ids.next_id(), self.node, None, context.cloned()));
                tracing::trace!(node = %self.node, "slot created lazily");
                Some(self.table.insert_slot(index, cell).clone())
            }
            Multiplicity::Divergent => {
                let key = key?;
                if self.keys.binary_search(&key).is_err() {
                    return None;
                }
                self.register_context(ids, context.cloned());
                self.lookup(context, Some(key))
            }
        }
    }

    fn register_context(&mut self, ids: &StateIds, context: Option<Arc<StateCell>>) {
        let id = context.as_ref().map(|c| c.id());
        if self.contexts.iter().any(|c| c.as_ref().map(|c| c.id()) == id) {
            return;
        }
        tracing::trace!(node = %self.node, keys = self.keys.len(), "divergent context registered");
        for key in self.keys.clone() {
            self.insert_keyed(ids, context.clone(), key);
        }
        self.contexts.push(context);
    }

    fn insert_keyed(&mut self, ids: &StateIds, context: Option<Arc<StateCell>>, key: Key) -> Arc<StateCell> {
        let at = match self.table.search(context_id(context.as_ref()), Some(key)) {
            Ok(existing) => return self.table.get_state(existing).clone(),
            Err(at) => at,
        };
        let cell = Arc::new(StateCell::new(ids.next_id(), self.node, Some(key), context));
        self.table.insert_slot(at, cell).clone()
    }

    fn assert_grid(&self, message: &str) {
        assert_invariant(
            DIVERGENT_GRID,
            self.table.size() == self.keys.len() * self.contexts.len(),
            message,
            Some(self.node.to_string().as_str()),
        );
    }

    /// Add `key`, creating its slot in every registered context. Returns the
    /// new slots.
    pub fn add_key(&mut self, ids: &StateIds, key: Key) -> Result<Vec<Arc<StateCell>>, GraphError> {
        if self.policy != Multiplicity::Divergent {
            return Err(GraphError::NotDivergent(self.node));
        }
        let Err(at) = self.keys.binary_search(&key) else {
            return Err(GraphError::DuplicateKey { node: self.node, key });
        };
        self.keys.insert(at, key);
        let contexts = self.contexts.clone();
        let created = contexts
            .into_iter()
            .map(|context| self.insert_keyed(ids, context, key))
            .collect();
        self.assert_grid("one slot per context per key after add");
        Ok(created)
    }

    /// Remove `key`, erasing its slot in every context. Returns the erased
    /// slots so their own dependencies can be torn down.
    pub fn remove_key(&mut self, key: Key) -> Result<Vec<Arc<StateCell>>, GraphError> {
        if self.policy != Multiplicity::Divergent {
            return Err(GraphError::NotDivergent(self.node));
        }
        let Ok(at) = self.keys.binary_search(&key) else {
            return Err(GraphError::KeyNotFound { node: self.node, key });
        };
        self.keys.remove(at);
        let erased = self.erase_where(|cell| cell.key() == Some(key));
        self.assert_grid("one slot per context per key after remove");
        Ok(erased)
    }

    /// Erase every slot created for the dependent state `context`.
    /// Uncontrolled nodes keep their slot.
    pub fn release_context(&mut self, context: StateId) -> Vec<Arc<StateCell>> {
        if self.policy == Multiplicity::Uncontrolled {
            return Vec::new();
        }
        self.contexts
            .retain(|c| c.as_ref().map(|c| c.id()) != Some(context));
        let erased = self.erase_where(|cell| cell.context().map(|c| c.id()) == Some(context));
        assert_invariant(
            CONTEXT_TEARDOWN,
            self.table
                .slots()
                .iter()
                .all(|cell| cell.context().map(|c| c.id()) != Some(context)),
            "no slot outlives its context",
            None,
        );
        erased
    }

    /// Erase every slot whose context belongs to `owner`.
    pub fn release_owner(&mut self, owner: NodeId) -> Vec<Arc<StateCell>> {
        let doomed: Vec<StateId> = self
            .table
            .slots()
            .iter()
            .filter_map(|cell| cell.context())
            .filter(|c| c.owner() == owner)
            .map(|c| c.id())
            .collect();
        let mut erased = Vec::new();
        for context in doomed {
            erased.extend(self.release_context(context));
        }
        self.contexts
            .retain(|c| c.as_ref().map_or(true, |c| c.owner() != owner));
        erased
    }

    /// Erase every slot. Uncontrolled nodes lose their slot too; only node
    /// removal does this.
    pub fn clear(&mut self) -> Vec<Arc<StateCell>> {
        self.contexts.clear();
        self.table.clear()
    }

    fn erase_where(&mut self, doomed: impl Fn(&StateCell) -> bool) -> Vec<Arc<StateCell>> {
        let mut erased = Vec::new();
        let mut index = 0;
        while index < self.table.size() {
            let cell: &StateCell = self.table.get_state(index);
            if doomed(cell) {
                erased.push(self.table.erase_slot(index));
            } else {
                index += 1;
            }
        }
        erased
    }
}
