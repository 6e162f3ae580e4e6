// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Process-global state and the single lock that guards it: the handle
//! table, the process namespace, the thread registry and the class/property
//! registry. Everything behind one mutex, scoped as tightly as the callers
//! can manage.

use crate::envelope::Envelope;
use crate::handles::{HandleRoot, Oix, TreeId};
use crate::object::Payload;
use crate::props::PropertySet;
use crate::rbtree::RbTree;
use ahash::AHashMap;
use arbor_common::ClassId;
use arbor_var::Var;
use once_cell::sync::Lazy;
use std::sync::{Mutex, MutexGuard};

/// One process-namespace registration: the named object's identity and the
/// tree (thread) it lives in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PnsEntry {
    pub oix: Oix,
    pub ucnt: u32,
    pub tree: TreeId,
}

pub type PayloadFactory = fn() -> Payload;

/// A running thread reachable through the registry: its envelope queue plus
/// the root object the thread itself answers as.
#[derive(Clone)]
pub struct ThreadPeer {
    pub tx: flume::Sender<Envelope>,
    pub root: Oix,
}

#[derive(Default)]
pub struct ClassRegistry {
    property_sets: AHashMap<ClassId, PropertySet>,
    factories: AHashMap<ClassId, PayloadFactory>,
}

impl ClassRegistry {
    pub fn property_set(&self, cls: ClassId) -> Option<&PropertySet> {
        self.property_sets.get(&cls)
    }

    pub fn property_set_mut(&mut self, cls: ClassId) -> &mut PropertySet {
        self.property_sets.entry(cls).or_default()
    }

    pub fn register_factory(&mut self, cls: ClassId, factory: PayloadFactory) {
        self.factories.insert(cls, factory);
    }

    pub fn factory(&self, cls: ClassId) -> Option<PayloadFactory> {
        self.factories.get(&cls).copied()
    }
}

pub struct ProcessState {
    pub handles: HandleRoot,
    /// The process namespace: name value to registration, ordered by
    /// variable comparison, ties in insertion order.
    pub ns: RbTree<Var, PnsEntry>,
    /// Live thread message queues by owning tree.
    pub threads: AHashMap<TreeId, ThreadPeer>,
    pub classes: ClassRegistry,
    next_tree_id: TreeId,
}

impl ProcessState {
    fn new() -> Self {
        ProcessState {
            handles: HandleRoot::new(),
            ns: RbTree::new(),
            threads: AHashMap::new(),
            classes: ClassRegistry::default(),
            next_tree_id: 1,
        }
    }

    pub fn next_tree_id(&mut self) -> TreeId {
        let id = self.next_tree_id;
        self.next_tree_id += 1;
        id
    }
}

static PROCESS: Lazy<Mutex<ProcessState>> = Lazy::new(|| {
    let mut state = ProcessState::new();
    crate::props::register_builtin_classes(&mut state.classes);
    Mutex::new(state)
});

/// Take the process lock. Poisoning is shrugged off; the state itself is
/// kept consistent by the lock's critical sections.
pub fn process() -> MutexGuard<'static, ProcessState> {
    PROCESS.lock().unwrap_or_else(|e| e.into_inner())
}

/// Register a user class: a payload factory for deserialization plus its
/// property schema. Call during startup, before threads fan out.
pub fn register_class(cls: ClassId, factory: PayloadFactory) {
    let mut state = process();
    state.classes.register_factory(cls, factory);
}
