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

//! A per-thread object tree. Nodes live in an arena keyed by their handle
//! index; each node carries a red-black index of its children keyed by
//! signed oid. The tree also plays the root helper role: it owns the
//! thread-private handle free list and the identity of the owning thread.

use crate::handles::{Oix, TreeId};
use crate::name::{split_ns_prefix, Mapped, NameFlags, NameRec, NsKind};
use crate::namespace::NsRec;
use crate::object::{ObjectBehavior, Payload};
use crate::process::{self, PnsEntry};
use crate::rbtree::RbTree;
use ahash::AHashMap;
use arbor_common::{classid, oid, ClassId, ObjFlags, Oid, Status};
use arbor_var::{v_str, ObjRef, Var};
use tracing::{debug, warn};

const NO_SLOT: usize = usize::MAX;

/// Private free-list refill growth: 4, 16, then doubling up to the cap.
const RESERVE_CAP: u32 = 128;

pub struct Node {
    pub oix: Oix,
    pub ucnt: u32,
    pub oid: Oid,
    pub class_id: ClassId,
    pub flags: ObjFlags,
    pub parent: Option<Oix>,
    pub(crate) children: RbTree<Oid, Oix>,
    /// This node's slot in its parent's child index.
    pub(crate) index_slot: usize,
    pub payload: Payload,
}

impl Node {
    pub fn objref(&self) -> ObjRef {
        ObjRef::new(self.oix, self.ucnt)
    }

    pub fn is_attachment(&self) -> bool {
        self.flags.contains(ObjFlags::ATTACHMENT)
    }
}

pub struct Tree {
    id: TreeId,
    nodes: AHashMap<Oix, Node>,
    root: Oix,
    free: Vec<Oix>,
    reserve_at_once: u32,
    /// Set when the thread owning this tree was asked to exit.
    pub(crate) exit_requested: bool,
}

/// Which namespace a resolution step landed on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NsRef {
    Tree(Oix),
    Process,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NsInfo {
    pub process: bool,
    /// The namespace's owner sits strictly above the checkpoint object.
    pub above_checkpoint: bool,
}

/// Namespace selector, parsed from an identifier string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NsSel {
    Process,
    ThreadLocal,
    This,
    Parent,
    Id(String),
}

impl NsSel {
    pub fn from_id(id: Option<&str>) -> NsSel {
        match id {
            None => NsSel::Parent,
            Some("/") => NsSel::Process,
            Some("") => NsSel::ThreadLocal,
            Some(".") => NsSel::This,
            Some("..") => NsSel::Parent,
            Some(other) => NsSel::Id(other.to_string()),
        }
    }

    pub fn from_kind(kind: &NsKind) -> NsSel {
        match kind {
            NsKind::Parent => NsSel::Parent,
            NsKind::Process => NsSel::Process,
            NsKind::Thread => NsSel::ThreadLocal,
            NsKind::This => NsSel::This,
            NsKind::Specified(id) => NsSel::Id(id.clone()),
        }
    }
}

impl Tree {
    /// Build a new tree whose root is an object of `class_id` with the given
    /// payload. The root gets the tree-root oid.
    pub fn new(class_id: ClassId, payload: Payload) -> Tree {
        let mut state = process::process();
        let id = state.next_tree_id();
        drop(state);

        let mut tree = Tree {
            id,
            nodes: AHashMap::new(),
            root: 0,
            free: Vec::new(),
            reserve_at_once: 1,
            exit_requested: false,
        };
        let (oix, ucnt) = tree
            .alloc_handle()
            .expect("handle table exhausted at tree creation");
        tree.root = oix;
        tree.nodes.insert(
            oix,
            Node {
                oix,
                ucnt,
                oid: oid::RITEM,
                class_id,
                flags: ObjFlags::default(),
                parent: None,
                children: RbTree::new(),
                index_slot: NO_SLOT,
                payload,
            },
        );
        tree
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn root(&self) -> Oix {
        self.root
    }

    pub fn node(&self, oix: Oix) -> Option<&Node> {
        self.nodes.get(&oix)
    }

    pub fn node_mut(&mut self, oix: Oix) -> Option<&mut Node> {
        self.nodes.get_mut(&oix)
    }

    pub fn contains(&self, oix: Oix) -> bool {
        self.nodes.contains_key(&oix)
    }

    pub fn objref(&self, oix: Oix) -> Option<ObjRef> {
        self.node(oix).map(Node::objref)
    }

    /// `@oix_ucnt` token naming this node across the address space.
    pub fn oix_token(&self, oix: Oix) -> String {
        self.objref(oix).map(|r| r.to_string()).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Handle allocation: the root helper's private free list.
    // ------------------------------------------------------------------

    fn alloc_handle(&mut self) -> Result<(Oix, u32), Status> {
        if self.free.is_empty() {
            self.reserve_at_once = match self.reserve_at_once {
                0..=3 => 4,
                4..=15 => 16,
                n => (n * 2).min(RESERVE_CAP),
            };
            let mut state = process::process();
            let batch = state.handles.reserve(self.reserve_at_once)?;
            self.free.extend(batch);
        }
        let oix = self.free.pop().ok_or(Status::Failed)?;
        let mut state = process::process();
        let ucnt = state.handles.activate(oix, self.id);
        Ok((oix, ucnt))
    }

    fn free_handles(&mut self, handles: &[Oix]) {
        let mut state = process::process();
        for &oix in handles {
            state.handles.deactivate(oix);
        }
        drop(state);
        self.free.extend_from_slice(handles);
        if self.free.len() as u32 > 2 * self.reserve_at_once {
            let keep = self.free.len() - self.reserve_at_once as usize;
            let returned = self.free.split_off(keep);
            process::process().handles.release(returned);
        }
    }

    // ------------------------------------------------------------------
    // Construction.
    // ------------------------------------------------------------------

    pub(crate) fn add_node(
        &mut self,
        parent: Oix,
        oid_: Oid,
        flags: ObjFlags,
        class_id: ClassId,
        payload: Payload,
    ) -> Result<Oix, Status> {
        if !self.contains(parent) {
            return Err(Status::Failed);
        }
        let (oix, ucnt) = self.alloc_handle()?;
        let mut node = Node {
            oix,
            ucnt,
            oid: oid_,
            class_id,
            flags,
            parent: Some(parent),
            children: RbTree::new(),
            index_slot: NO_SLOT,
            payload,
        };
        let slot = self
            .node_mut(parent)
            .expect("parent checked above")
            .children
            .insert(oid_, oix);
        node.index_slot = slot;
        self.nodes.insert(oix, node);
        Ok(oix)
    }

    pub fn add_container(&mut self, parent: Oix, oid_: Oid, flags: ObjFlags) -> Result<Oix, Status> {
        self.add_node(parent, oid_, flags, classid::CONTAINER, Payload::Container)
    }

    pub fn add_variable(&mut self, parent: Oix, oid_: Oid, flags: ObjFlags) -> Result<Oix, Status> {
        self.add_node(
            parent,
            oid_,
            flags,
            classid::VARIABLE,
            Payload::Variable(Var::new()),
        )
    }

    pub fn add_custom(
        &mut self,
        parent: Oix,
        oid_: Oid,
        flags: ObjFlags,
        class_id: ClassId,
        behavior: Box<dyn ObjectBehavior>,
    ) -> Result<Oix, Status> {
        self.add_node(parent, oid_, flags, class_id, Payload::Custom(behavior))
    }

    // ------------------------------------------------------------------
    // Traversal.
    // ------------------------------------------------------------------

    fn filter_admits(&self, child: Oix, filter: Oid) -> bool {
        match filter {
            oid::ALL => true,
            oid::CHILD => self.node(child).is_some_and(|n| !n.is_attachment()),
            k => self.node(child).is_some_and(|n| n.oid == k),
        }
    }

    /// First child admitted by `filter`: CHILD skips attachments, ALL admits
    /// everything, any other value matches that exact oid.
    pub fn first_child(&self, parent: Oix, filter: Oid) -> Option<Oix> {
        let p = self.node(parent)?;
        let mut slot = match filter {
            oid::ALL | oid::CHILD => p.children.first(),
            k => p.children.find_first(&k),
        };
        while let Some(s) = slot {
            let child = p.children.value(s);
            if self.filter_admits(child, filter) {
                return Some(child);
            }
            if !matches!(filter, oid::ALL | oid::CHILD) && *p.children.key(s) != filter {
                return None;
            }
            slot = p.children.next(s);
        }
        None
    }

    pub fn last_child(&self, parent: Oix, filter: Oid) -> Option<Oix> {
        let p = self.node(parent)?;
        let mut slot = p.children.last();
        while let Some(s) = slot {
            let child = p.children.value(s);
            if self.filter_admits(child, filter) {
                return Some(child);
            }
            slot = p.children.prev(s);
        }
        None
    }

    pub fn next_sibling(&self, child: Oix, filter: Oid) -> Option<Oix> {
        let c = self.node(child)?;
        let p = self.node(c.parent?)?;
        let mut slot = p.children.next(c.index_slot);
        while let Some(s) = slot {
            let sib = p.children.value(s);
            if !matches!(filter, oid::ALL | oid::CHILD) && *p.children.key(s) != filter {
                return None;
            }
            if self.filter_admits(sib, filter) {
                return Some(sib);
            }
            slot = p.children.next(s);
        }
        None
    }

    pub fn prev_sibling(&self, child: Oix, filter: Oid) -> Option<Oix> {
        let c = self.node(child)?;
        let p = self.node(c.parent?)?;
        let mut slot = p.children.prev(c.index_slot);
        while let Some(s) = slot {
            let sib = p.children.value(s);
            if !matches!(filter, oid::ALL | oid::CHILD) && *p.children.key(s) != filter {
                return None;
            }
            if self.filter_admits(sib, filter) {
                return Some(sib);
            }
            slot = p.children.prev(s);
        }
        None
    }

    pub fn childcount(&self, parent: Oix, filter: Oid) -> usize {
        let mut count = 0;
        let mut cur = self.first_child(parent, filter);
        while let Some(c) = cur {
            count += 1;
            cur = self.next_sibling(c, filter);
        }
        count
    }

    /// Children in iteration order as a collected list.
    pub fn children(&self, parent: Oix, filter: Oid) -> Vec<Oix> {
        let mut out = Vec::new();
        let mut cur = self.first_child(parent, filter);
        while let Some(c) = cur {
            out.push(c);
            cur = self.next_sibling(c, filter);
        }
        out
    }

    /// First child of exact oid and class, for well-known attachments.
    pub fn attachment(&self, parent: Oix, oid_: Oid) -> Option<Oix> {
        self.first_child(parent, oid_)
    }

    // ------------------------------------------------------------------
    // Deletion.
    // ------------------------------------------------------------------

    /// Delete an object and its whole subtree, depth first. The condemned
    /// descendants get the fast-delete flag: their child indexes are dropped
    /// wholesale and bindings go quietly. The deleted node itself still
    /// messages its peers (a live binding sends its unbind).
    pub fn delete(&mut self, target: Oix) {
        if !self.contains(target) {
            return;
        }
        // The top node disconnects loudly unless the caller already marked
        // the subtree condemned.
        let quiet = self
            .node(target)
            .is_some_and(|n| n.flags.contains(ObjFlags::FAST_DELETE));
        if !quiet {
            crate::binding::disconnect_if_binding(self, target);
            // The goodbye message can bounce straight back and take the
            // node down re-entrantly.
            if !self.contains(target) {
                return;
            }
        }

        // Collect the subtree, marking fast-delete as we go.
        let mut subtree = Vec::new();
        self.collect_subtree(target, &mut subtree);
        for &oix in &subtree {
            if let Some(n) = self.node_mut(oix) {
                n.flags |= ObjFlags::FAST_DELETE;
            }
        }

        // Names detach themselves on destruction.
        for &oix in &subtree {
            self.unmap_name(oix);
        }

        // Unlink the top node from its parent's index.
        if let Some(parent) = self.node(target).and_then(|n| n.parent) {
            let slot = self.node(target).map(|n| n.index_slot).unwrap_or(NO_SLOT);
            if slot != NO_SLOT {
                if let Some(p) = self.node_mut(parent) {
                    p.children.remove_at(slot);
                }
            }
        }

        for &oix in &subtree {
            self.nodes.remove(&oix);
        }
        self.free_handles(&subtree);
    }

    /// Delete all children (attachments included), keeping the object.
    pub fn delete_children(&mut self, parent: Oix) {
        let children = self.children(parent, oid::ALL);
        for child in children {
            if let Some(n) = self.node_mut(child) {
                n.flags |= ObjFlags::FAST_DELETE;
            }
            self.delete(child);
        }
    }

    fn collect_subtree(&self, top: Oix, out: &mut Vec<Oix>) {
        let mut cur = self.first_child(top, oid::ALL);
        while let Some(c) = cur {
            self.collect_subtree(c, out);
            cur = self.next_sibling(c, oid::ALL);
        }
        out.push(top);
    }

    // ------------------------------------------------------------------
    // Adoption.
    // ------------------------------------------------------------------

    /// Move `child` under `new_parent` within this tree. Names mapped to
    /// namespaces above the child are detached first and remapped after,
    /// unless `no_map`.
    pub fn adopt(&mut self, child: Oix, new_parent: Oix, oid_: Oid, no_map: bool) {
        if !self.contains(child) || !self.contains(new_parent) {
            warn!("adopt: no such object");
            return;
        }
        self.map_subtree(child, false, Some(child));

        // Detach from the old parent index.
        let (old_parent, slot) = {
            let c = self.node(child).expect("checked above");
            (c.parent, c.index_slot)
        };
        if let Some(p) = old_parent.and_then(|p| self.node_mut(p)) {
            if slot != NO_SLOT {
                p.children.remove_at(slot);
            }
        }

        let new_oid = if oid_ == oid::CHILD {
            self.node(child).expect("checked above").oid
        } else {
            oid_
        };
        let new_slot = self
            .node_mut(new_parent)
            .expect("checked above")
            .children
            .insert(new_oid, child);
        {
            let c = self.node_mut(child).expect("checked above");
            c.parent = Some(new_parent);
            c.oid = new_oid;
            c.index_slot = new_slot;
        }

        if !no_map {
            self.map_subtree(child, true, None);
        }
    }

    /// Move a subtree from one tree to another. Every descendant handle is
    /// re-tagged to the destination tree.
    pub fn adopt_across(
        src: &mut Tree,
        child: Oix,
        dst: &mut Tree,
        new_parent: Oix,
        oid_: Oid,
        no_map: bool,
    ) {
        if !src.contains(child) || !dst.contains(new_parent) {
            warn!("adopt_across: no such object");
            return;
        }
        src.map_subtree(child, false, Some(child));

        let (old_parent, slot) = {
            let c = src.node(child).expect("checked above");
            (c.parent, c.index_slot)
        };
        if let Some(p) = old_parent.and_then(|p| src.node_mut(p)) {
            if slot != NO_SLOT {
                p.children.remove_at(slot);
            }
        }

        // Move the nodes and re-tag their handles under one lock.
        let mut moved = Vec::new();
        src.collect_subtree(child, &mut moved);
        {
            let mut state = process::process();
            for &oix in &moved {
                state.handles.retag(oix, dst.id);
            }
        }
        for &oix in &moved {
            if let Some(node) = src.nodes.remove(&oix) {
                dst.nodes.insert(oix, node);
            }
        }

        let new_oid = if oid_ == oid::CHILD {
            dst.node(child).expect("moved above").oid
        } else {
            oid_
        };
        let new_slot = dst
            .node_mut(new_parent)
            .expect("checked above")
            .children
            .insert(new_oid, child);
        {
            let c = dst.node_mut(child).expect("moved above");
            c.parent = Some(new_parent);
            c.oid = new_oid;
            c.index_slot = new_slot;
        }

        if !no_map {
            dst.map_subtree(child, true, None);
        }
    }

    // ------------------------------------------------------------------
    // Namespaces and names.
    // ------------------------------------------------------------------

    /// Create a namespace attachment on `obj`, replacing any existing one
    /// with a different identifier.
    pub fn create_namespace(&mut self, obj: Oix, id: Option<&str>) -> Result<Oix, Status> {
        if let Some(existing) = self.attachment(obj, oid::NAMESPACE) {
            let same = self
                .node(existing)
                .and_then(|n| n.payload.as_namespace())
                .is_some_and(|ns| ns.id.as_deref() == id);
            if same {
                return Ok(existing);
            }
            self.delete(existing);
        }
        let ns = self.add_node(
            obj,
            oid::NAMESPACE,
            ObjFlags::ATTACHMENT,
            classid::NAMESPACE,
            Payload::Namespace(NsRec::new(id)),
        )?;
        if let Some(n) = self.node_mut(obj) {
            n.flags |= ObjFlags::HAS_NAMESPACE;
        }
        Ok(ns)
    }

    pub fn delete_namespace(&mut self, obj: Oix) {
        if let Some(ns) = self.attachment(obj, oid::NAMESPACE) {
            self.delete(ns);
        }
        if let Some(n) = self.node_mut(obj) {
            n.flags.remove(ObjFlags::HAS_NAMESPACE);
        }
    }

    /// Resolve a namespace selector walking from `start`. `checkpoint`
    /// feeds the above-checkpoint bit used when names detach on adoption.
    pub fn find_namespace(
        &self,
        start: Oix,
        sel: &NsSel,
        checkpoint: Option<Oix>,
    ) -> Option<(NsRef, NsInfo)> {
        match sel {
            NsSel::Process => Some((
                NsRef::Process,
                NsInfo {
                    process: true,
                    above_checkpoint: true,
                },
            )),
            NsSel::ThreadLocal => {
                let ns = self.attachment(self.root, oid::NAMESPACE)?;
                Some((
                    NsRef::Tree(ns),
                    NsInfo {
                        process: false,
                        above_checkpoint: true,
                    },
                ))
            }
            NsSel::This => {
                let node = self.node(start)?;
                if !node.flags.contains(ObjFlags::HAS_NAMESPACE) {
                    return None;
                }
                let ns = self.attachment(start, oid::NAMESPACE)?;
                Some((NsRef::Tree(ns), NsInfo::default()))
            }
            NsSel::Parent => {
                let from = self.node(start)?.parent?;
                self.walk_up_for_namespace(from, None, checkpoint)
            }
            NsSel::Id(id) => self.walk_up_for_namespace(start, Some(id.as_str()), checkpoint),
        }
    }

    /// Walk ancestors from `from` (inclusive) looking for a namespace. With
    /// `match_id` only namespaces carrying that identifier qualify; without,
    /// the first namespace wins. The above-checkpoint bit is set once the
    /// walk has passed the checkpoint object.
    fn walk_up_for_namespace(
        &self,
        from: Oix,
        match_id: Option<&str>,
        checkpoint: Option<Oix>,
    ) -> Option<(NsRef, NsInfo)> {
        let mut info = NsInfo::default();
        let mut cur = Some(from);
        while let Some(h) = cur {
            let node = self.node(h)?;
            if node.flags.contains(ObjFlags::HAS_NAMESPACE) {
                let mut ns_child = self.first_child(h, oid::NAMESPACE);
                while let Some(ns) = ns_child {
                    let matches = match match_id {
                        None => true,
                        Some(want) => self
                            .node(ns)
                            .and_then(|n| n.payload.as_namespace())
                            .is_some_and(|rec| rec.id.as_deref() == Some(want)),
                    };
                    if matches {
                        return Some((NsRef::Tree(ns), info));
                    }
                    ns_child = self.next_sibling(ns, oid::NAMESPACE);
                }
            }
            if checkpoint == Some(h) {
                info.above_checkpoint = true;
            }
            cur = node.parent;
        }
        None
    }

    /// Name an object. The name string may carry a namespace prefix which
    /// overrides both `flags` and `ns_id`. Returns the name node.
    pub fn add_name(
        &mut self,
        obj: Oix,
        name: &str,
        flags: NameFlags,
        ns_id: Option<&str>,
    ) -> Result<Oix, Status> {
        let mut obj_flags = ObjFlags::ATTACHMENT;
        if flags.contains(NameFlags::TEMPORARY) {
            obj_flags |= ObjFlags::NOT_CLONABLE | ObjFlags::NOT_SERIALIZABLE;
        }

        let (kind, bare) = if flags.contains(NameFlags::PROCESS_NS) {
            (NsKind::Process, name)
        } else if flags.contains(NameFlags::THREAD_NS) {
            (NsKind::Thread, name)
        } else if flags.contains(NameFlags::THIS_NS) {
            (NsKind::This, name)
        } else if flags.contains(NameFlags::PARENT_NS) {
            (NsKind::Parent, name)
        } else if let (Some(prefix_kind), rest) = split_ns_prefix(name) {
            (prefix_kind, rest)
        } else {
            (NsKind::from_id(ns_id), name)
        };

        let rec = NameRec::new(v_str(bare), kind);
        let name_oix = self.add_node(obj, oid::NAME, obj_flags, classid::NAME, Payload::Name(rec))?;

        if !flags.contains(NameFlags::NO_MAP) {
            if let Err(e) = self.map_name(name_oix) {
                debug!("mapping name {bare:?} failed: {e}");
            }
        }
        Ok(name_oix)
    }

    /// Map a name into its target namespace. Already-mapped names are left
    /// alone.
    pub fn map_name(&mut self, name_oix: Oix) -> Result<(), Status> {
        let (kind, value, owner) = {
            let node = self.node(name_oix).ok_or(Status::Failed)?;
            let rec = node.payload.as_name().ok_or(Status::Failed)?;
            if rec.is_mapped() {
                return Err(Status::NameAlreadyMapped);
            }
            (
                rec.kind.clone(),
                rec.value.clone(),
                node.parent.ok_or(Status::NameMappingFailed)?,
            )
        };

        // `This` resolves against the named object; the walking kinds start
        // from the name node so the named object's own namespace is the
        // first candidate.
        let found = match kind {
            NsKind::This => self.find_namespace(owner, &NsSel::This, None),
            ref other => self.find_namespace(name_oix, &NsSel::from_kind(other), None),
        };
        let Some((ns_ref, _)) = found else {
            return Err(Status::NameMappingFailed);
        };
        self.map_name_into(name_oix, value, ns_ref, owner)
    }

    pub(crate) fn map_name_into(
        &mut self,
        name_oix: Oix,
        value: Var,
        ns_ref: NsRef,
        owner: Oix,
    ) -> Result<(), Status> {
        match ns_ref {
            NsRef::Tree(ns_oix) => {
                let slot = self
                    .node_mut(ns_oix)
                    .and_then(|n| n.payload.as_namespace_mut())
                    .ok_or(Status::NameMappingFailed)?
                    .index
                    .insert(value, name_oix);
                if let Some(rec) = self.node_mut(name_oix).and_then(|n| n.payload.as_name_mut()) {
                    rec.mapped = Mapped::Tree { ns_oix, slot };
                }
                Ok(())
            }
            NsRef::Process => {
                let entry = PnsEntry {
                    oix: owner,
                    ucnt: self.node(owner).map(|n| n.ucnt).unwrap_or(0),
                    tree: self.id,
                };
                let slot = process::process().ns.insert(value, entry);
                if let Some(rec) = self.node_mut(name_oix).and_then(|n| n.payload.as_name_mut()) {
                    rec.mapped = Mapped::Process { slot };
                }
                Ok(())
            }
        }
    }

    /// Detach a name from whatever namespace it is mapped into. A no-op for
    /// unmapped names and non-name nodes.
    pub fn unmap_name(&mut self, name_oix: Oix) {
        let mapped = match self.node_mut(name_oix).and_then(|n| n.payload.as_name_mut()) {
            Some(rec) => std::mem::replace(&mut rec.mapped, Mapped::No),
            None => return,
        };
        match mapped {
            Mapped::No => {}
            Mapped::Tree { ns_oix, slot } => {
                // The namespace may already be gone in teardown order.
                if let Some(ns) = self.node_mut(ns_oix).and_then(|n| n.payload.as_namespace_mut()) {
                    ns.index.remove_at(slot);
                }
            }
            Mapped::Process { slot } => {
                process::process().ns.remove_at(slot);
            }
        }
    }

    /// Walk a subtree attaching (`attach`) or detaching its names. On
    /// detach, only names whose namespace lies above `checkpoint` are
    /// touched, which is what adoption across roots needs.
    pub fn map_subtree(&mut self, top: Oix, attach: bool, checkpoint: Option<Oix>) {
        let mut names = Vec::new();
        self.collect_names(top, &mut names);
        for name_oix in names {
            if attach {
                match self.map_name(name_oix) {
                    Ok(()) | Err(Status::NameAlreadyMapped) => {}
                    Err(e) => debug!("remapping name failed: {e}"),
                }
            } else {
                let is_mapped = self
                    .node(name_oix)
                    .and_then(|n| n.payload.as_name())
                    .is_some_and(NameRec::is_mapped);
                if !is_mapped {
                    continue;
                }
                let above = self.name_target_above_checkpoint(name_oix, checkpoint);
                if above {
                    self.unmap_name(name_oix);
                }
            }
        }
    }

    fn name_target_above_checkpoint(&self, name_oix: Oix, checkpoint: Option<Oix>) -> bool {
        let Some(rec) = self.node(name_oix).and_then(|n| n.payload.as_name()) else {
            return false;
        };
        match &rec.mapped {
            Mapped::Process { .. } => true,
            Mapped::Tree { ns_oix, .. } => {
                let Some(checkpoint) = checkpoint else {
                    return true;
                };
                // The namespace's owner must be an ancestor above the
                // checkpoint for the name to leave the moving subtree.
                let Some(owner) = self.node(*ns_oix).and_then(|n| n.parent) else {
                    return true;
                };
                let mut cur = self.node(checkpoint).and_then(|n| n.parent);
                while let Some(h) = cur {
                    if h == owner {
                        return true;
                    }
                    cur = self.node(h).and_then(|n| n.parent);
                }
                false
            }
            Mapped::No => false,
        }
    }

    fn collect_names(&self, top: Oix, out: &mut Vec<Oix>) {
        if self.node(top).is_some_and(|n| n.oid == oid::NAME) {
            out.push(top);
        }
        let mut cur = self.first_child(top, oid::ALL);
        while let Some(c) = cur {
            self.collect_names(c, out);
            cur = self.next_sibling(c, oid::ALL);
        }
    }

    /// Look `name` up in this object's own namespace; first match's owner.
    pub fn byname(&self, obj: Oix, name: &str) -> Option<Oix> {
        let ns = self.attachment(obj, oid::NAMESPACE)?;
        let rec = self.node(ns)?.payload.as_namespace()?;
        let slot = rec.find_first(Some(&v_str(name)))?;
        let name_oix = rec.index.value(slot);
        self.node(name_oix)?.parent
    }

    /// First name in a tree namespace matching `value` (all names when
    /// None). Returns the name node.
    pub fn ns_first(&self, ns_oix: Oix, value: Option<&Var>) -> Option<Oix> {
        let rec = self.node(ns_oix)?.payload.as_namespace()?;
        let slot = rec.find_first(value)?;
        Some(rec.index.value(slot))
    }

    /// Next name in namespace order. With `name_match`, stop when the value
    /// changes so callers can enumerate one name's owners.
    pub fn ns_next(&self, name_oix: Oix, name_match: bool) -> Option<Oix> {
        let rec = self.node(name_oix)?.payload.as_name()?;
        let Mapped::Tree { ns_oix, slot } = rec.mapped else {
            return None;
        };
        let ns = self.node(ns_oix)?.payload.as_namespace()?;
        let next = ns.index.next(slot)?;
        if name_match && ns.index.key(next).compare(&rec.value) != std::cmp::Ordering::Equal {
            return None;
        }
        Some(ns.index.value(next))
    }

    /// Run `f` with the node's payload temporarily taken out, so the hook
    /// can get `&mut Tree` alongside it. If `f` deletes the node the payload
    /// is dropped instead of restored.
    pub(crate) fn with_taken_payload<R>(
        &mut self,
        oix: Oix,
        f: impl FnOnce(&mut Tree, &mut Payload) -> R,
    ) -> Option<R> {
        let mut payload = {
            let node = self.node_mut(oix)?;
            std::mem::replace(&mut node.payload, Payload::Taken)
        };
        let r = f(self, &mut payload);
        if let Some(node) = self.node_mut(oix) {
            if matches!(node.payload, Payload::Taken) {
                node.payload = payload;
            }
        }
        Some(r)
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        // Names in the process namespace must not outlive the tree.
        let all: Vec<Oix> = self.nodes.keys().copied().collect();
        for &oix in &all {
            let is_process_name = self
                .node(oix)
                .and_then(|n| n.payload.as_name())
                .is_some_and(|rec| matches!(rec.mapped, Mapped::Process { .. }));
            if is_process_name {
                self.unmap_name(oix);
            }
        }
        let mut state = process::process();
        state.handles.release(self.free.drain(..));
        state.handles.release(all);
        state.threads.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::oid::{ALL, CHILD, ITEM};
    use pretty_assertions::assert_eq;

    fn tree() -> Tree {
        Tree::new(classid::CONTAINER, Payload::Container)
    }

    #[test]
    fn children_iterate_in_oid_order_with_stable_ties() {
        let mut t = tree();
        let root = t.root();
        let a = t.add_container(root, 5, ObjFlags::default()).unwrap();
        let b = t.add_container(root, 3, ObjFlags::default()).unwrap();
        let c = t.add_container(root, 5, ObjFlags::default()).unwrap();
        let d = t.add_container(root, 4, ObjFlags::default()).unwrap();

        assert_eq!(t.children(root, CHILD), vec![b, d, a, c]);
        assert_eq!(t.children(root, 5), vec![a, c]);
        assert_eq!(t.childcount(root, CHILD), 4);
        assert_eq!(t.childcount(root, 5), 2);
    }

    #[test]
    fn child_filter_skips_attachments() {
        let mut t = tree();
        let root = t.root();
        let plain = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        let attached = t
            .add_container(root, oid::NAME, ObjFlags::ATTACHMENT)
            .unwrap();

        assert_eq!(t.children(root, CHILD), vec![plain]);
        let all = t.children(root, ALL);
        assert!(all.contains(&plain) && all.contains(&attached));
    }

    #[test]
    fn delete_subtree_recycles_handles() {
        let mut t = tree();
        let root = t.root();
        let mid = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        let leaf = t.add_container(mid, ITEM, ObjFlags::default()).unwrap();
        let leaf_ref = t.objref(leaf).unwrap();

        t.delete(mid);
        assert!(!t.contains(mid));
        assert!(!t.contains(leaf));
        assert_eq!(t.childcount(root, ALL), 0);

        // The freed identity no longer resolves.
        let state = process::process();
        assert!(state.handles.resolve(leaf_ref.oix, leaf_ref.ucnt).is_none());
    }

    #[test]
    fn adopt_moves_between_parents() {
        let mut t = tree();
        let root = t.root();
        let a = t.add_container(root, 1, ObjFlags::default()).unwrap();
        let b = t.add_container(root, 2, ObjFlags::default()).unwrap();
        let child = t.add_container(a, 7, ObjFlags::default()).unwrap();

        t.adopt(child, b, oid::CHILD, false);
        assert_eq!(t.children(a, ALL), Vec::<Oix>::new());
        assert_eq!(t.children(b, CHILD), vec![child]);
        assert_eq!(t.node(child).unwrap().parent, Some(b));
        // oid::CHILD keeps the old identifier.
        assert_eq!(t.node(child).unwrap().oid, 7);
    }

    #[test]
    fn names_map_and_find() {
        let mut t = tree();
        let root = t.root();
        t.create_namespace(root, None).unwrap();
        let child = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        t.add_name(child, "gadget", NameFlags::default(), None).unwrap();

        assert_eq!(t.byname(root, "gadget"), Some(child));
        assert_eq!(t.byname(root, "missing"), None);
    }

    #[test]
    fn duplicate_names_enumerate_in_insertion_order() {
        let mut t = tree();
        let root = t.root();
        t.create_namespace(root, None).unwrap();
        let c1 = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        let c2 = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        t.add_name(c1, "log", NameFlags::default(), None).unwrap();
        t.add_name(c2, "log", NameFlags::default(), None).unwrap();

        let ns = t.attachment(root, oid::NAMESPACE).unwrap();
        let first = t.ns_first(ns, Some(&v_str("log"))).unwrap();
        let owners: Vec<Oix> = {
            let mut out = vec![t.node(first).unwrap().parent.unwrap()];
            let mut cur = first;
            while let Some(next) = t.ns_next(cur, true) {
                out.push(t.node(next).unwrap().parent.unwrap());
                cur = next;
            }
            out
        };
        assert_eq!(owners, vec![c1, c2]);
    }

    #[test]
    fn adoption_detaches_names_mapped_above() {
        let mut t = tree();
        let root = t.root();
        t.create_namespace(root, None).unwrap();
        let a = t.add_container(root, 1, ObjFlags::default()).unwrap();
        let b = t.add_container(root, 2, ObjFlags::default()).unwrap();
        let child = t.add_container(a, ITEM, ObjFlags::default()).unwrap();
        let name = t.add_name(child, "thing", NameFlags::default(), None).unwrap();

        // Mapped into the root namespace, which is above the moving child.
        assert_eq!(t.byname(root, "thing"), Some(child));
        t.adopt(child, b, oid::CHILD, false);
        // Remapped back into the same root namespace afterwards.
        assert_eq!(t.byname(root, "thing"), Some(child));
        assert!(t
            .node(name)
            .unwrap()
            .payload
            .as_name()
            .unwrap()
            .is_mapped());
    }

    #[test]
    fn namespace_id_walk() {
        let mut t = tree();
        let root = t.root();
        t.create_namespace(root, Some("station")).unwrap();
        let mid = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        let leaf = t.add_container(mid, ITEM, ObjFlags::default()).unwrap();

        let (ns, _) = t
            .find_namespace(leaf, &NsSel::Id("station".into()), None)
            .unwrap();
        assert_eq!(ns, NsRef::Tree(t.attachment(root, oid::NAMESPACE).unwrap()));
        assert!(t
            .find_namespace(leaf, &NsSel::Id("elsewhere".into()), None)
            .is_none());
    }
}
