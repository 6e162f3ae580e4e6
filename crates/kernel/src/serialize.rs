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

//! Whole-object-tree serialization: class id, oid, masked flags, class
//! content, then serializable children recursively, each framed in a
//! begin/end block. User classes join in through their registered payload
//! factory and content hooks.

use crate::handles::Oix;
use crate::name::{Mapped, NameRec, NsKind};
use crate::namespace::NsRec;
use crate::object::Payload;
use crate::process;
use crate::set::ValueSet;
use crate::tree::Tree;
use crate::wire;
use arbor_common::{classid, oid, ObjFlags, Status};
use arbor_stream::{Ctrl, QChar, Queue, QueueMode};

const OBJ_VERSION: u8 = 0;

/// Namespace kind tags in serialized names.
const NSK_PARENT: i64 = 0;
const NSK_PROCESS: i64 = 1;
const NSK_THREAD: i64 = 2;
const NSK_THIS: i64 = 3;
const NSK_SPECIFIED: i64 = 4;

impl Tree {
    /// Serialize `top` and its serializable children onto an encoding queue.
    pub fn write_obj(&self, top: Oix, q: &mut Queue) -> Result<(), Status> {
        let node = self.node(top).ok_or(Status::WritingObjFailed)?;
        q.write_ctrl(Ctrl::Begin(OBJ_VERSION));
        wire::put_long(q, node.class_id as i64);
        wire::put_long(q, node.oid as i64);
        wire::put_long(q, node.flags.serialized_bits() as i64);

        match &node.payload {
            Payload::Container => {}
            Payload::Variable(v) => wire::put_var(q, v)?,
            Payload::Name(rec) => {
                wire::put_var(q, &rec.value)?;
                let (tag, id) = match &rec.kind {
                    NsKind::Parent => (NSK_PARENT, None),
                    NsKind::Process => (NSK_PROCESS, None),
                    NsKind::Thread => (NSK_THREAD, None),
                    NsKind::This => (NSK_THIS, None),
                    NsKind::Specified(id) => (NSK_SPECIFIED, Some(id.as_str())),
                };
                wire::put_long(q, tag);
                if let Some(id) = id {
                    wire::put_str(q, id);
                }
            }
            Payload::Namespace(ns) => match &ns.id {
                Some(id) => {
                    wire::put_long(q, 1);
                    wire::put_str(q, id);
                }
                None => wire::put_long(q, 0),
            },
            Payload::Set(s) => {
                wire::put_long(q, s.len() as i64);
                for (id, v) in s.iter() {
                    wire::put_long(q, id as i64);
                    wire::put_var(q, v)?;
                }
            }
            Payload::Custom(b) => b.write_content(q)?,
            Payload::Binding(_) | Payload::Taken => return Err(Status::WritingObjFailed),
        }

        let children: Vec<Oix> = self
            .children(top, oid::ALL)
            .into_iter()
            .filter(|&c| {
                self.node(c)
                    .is_some_and(|n| !n.flags.contains(ObjFlags::NOT_SERIALIZABLE))
            })
            .collect();
        wire::put_long(q, children.len() as i64);
        for child in children {
            self.write_obj(child, q)?;
        }
        q.write_ctrl(Ctrl::End);
        Ok(())
    }

    /// Read one serialized object as a new child of `parent`. Names come
    /// back detached and are remapped once the whole subtree is in place.
    pub fn read_obj(&mut self, parent: Oix, q: &mut Queue) -> Result<Oix, Status> {
        let top = self.read_obj_inner(parent, q)?;
        self.map_subtree(top, true, None);
        Ok(top)
    }

    fn read_obj_inner(&mut self, parent: Oix, q: &mut Queue) -> Result<Oix, Status> {
        match q.read_char() {
            QChar::Ctrl(Ctrl::Begin(OBJ_VERSION)) => {}
            _ => return Err(Status::ReadingObjFailed),
        }
        let class_id = wire::get_long(q)? as i32;
        let oid_ = wire::get_long(q)? as i32;
        let flags = ObjFlags::from_bits_truncate(wire::get_long(q)? as u32);

        let payload = match class_id {
            classid::CONTAINER => Payload::Container,
            classid::VARIABLE => Payload::Variable(wire::get_var(q)?),
            classid::NAME => {
                let value = wire::get_var(q)?;
                let kind = match wire::get_long(q)? {
                    NSK_PARENT => NsKind::Parent,
                    NSK_PROCESS => NsKind::Process,
                    NSK_THREAD => NsKind::Thread,
                    NSK_THIS => NsKind::This,
                    NSK_SPECIFIED => NsKind::Specified(wire::get_str(q)?),
                    _ => return Err(Status::ReadingObjFailed),
                };
                Payload::Name(NameRec::new(value, kind))
            }
            classid::NAMESPACE => {
                let id = if wire::get_long(q)? != 0 {
                    Some(wire::get_str(q)?)
                } else {
                    None
                };
                Payload::Namespace(NsRec::new(id.as_deref()))
            }
            classid::SET => {
                let count = wire::get_long(q)?;
                let mut set = ValueSet::new();
                for _ in 0..count {
                    let id = wire::get_long(q)? as i32;
                    set.set(id, Some(&wire::get_var(q)?));
                }
                Payload::Set(set)
            }
            other => {
                let factory = process::process().classes.factory(other);
                match factory {
                    Some(factory) => {
                        let mut payload = factory();
                        if let Payload::Custom(b) = &mut payload {
                            b.read_content(q)?;
                        }
                        payload
                    }
                    None => {
                        tracing::debug!("no class factory for {other}, cannot read object");
                        return Err(Status::ReadingObjFailed);
                    }
                }
            }
        };

        let new_oix = self.add_node(parent, oid_, flags, class_id, payload)?;
        let count = wire::get_long(q)?;
        for _ in 0..count {
            self.read_obj_inner(new_oix, q)?;
        }
        match q.read_char() {
            QChar::Ctrl(Ctrl::End) => Ok(new_oix),
            _ => Err(Status::ReadingObjFailed),
        }
    }

    /// Serialized form as raw bytes; also the structural identity used by
    /// equality checks.
    pub fn obj_to_bytes(&self, top: Oix) -> Result<Vec<u8>, Status> {
        let mut q = Queue::new(QueueMode::encode_out());
        self.write_obj(top, &mut q)?;
        q.complete_last_write();
        let mut bytes = vec![0u8; q.bytes()];
        let n = q.read(&mut bytes);
        bytes.truncate(n);
        Ok(bytes)
    }

    /// Rebuild an object from `obj_to_bytes` output as a child of `parent`.
    pub fn obj_from_bytes(&mut self, parent: Oix, bytes: &[u8]) -> Result<Oix, Status> {
        let mut q = Queue::new(QueueMode::decode_in());
        q.write(bytes);
        self.read_obj(parent, &mut q)
    }
}

/// Structural equality of two subtrees: same class ids, oids, flags in the
/// serialization mask, payload content and children order.
pub fn obj_equal(a: &Tree, a_top: Oix, b: &Tree, b_top: Oix) -> bool {
    match (a.obj_to_bytes(a_top), b.obj_to_bytes(b_top)) {
        (Ok(ab), Ok(bb)) => ab == bb,
        _ => false,
    }
}

/// Double-check helper for tests and debug assertions: a name is mapped
/// into exactly the namespace its record says, and variables round-trip.
pub fn name_is_consistent(tree: &Tree, name_oix: Oix) -> bool {
    let Some(rec) = tree.node(name_oix).and_then(|n| n.payload.as_name()) else {
        return false;
    };
    match &rec.mapped {
        Mapped::No => true,
        Mapped::Process { slot } => {
            let state = process::process();
            state.ns.key(*slot).compare(&rec.value) == std::cmp::Ordering::Equal
        }
        Mapped::Tree { ns_oix, slot } => tree
            .node(*ns_oix)
            .and_then(|n| n.payload.as_namespace())
            .is_some_and(|ns| ns.index.value(*slot) == name_oix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::NameFlags;
    use crate::props::varp;
    use arbor_common::oid::ITEM;
    use arbor_var::{v_double, v_str};

    fn sample_tree() -> (Tree, Oix) {
        let mut t = Tree::new(classid::CONTAINER, Payload::Container);
        let root = t.root();
        let top = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        t.create_namespace(top, Some("plant")).unwrap();

        let v = t.add_variable(top, 7, ObjFlags::default()).unwrap();
        t.set_property(v, varp::VALUE, &v_double(21.5), None).unwrap();
        t.add_name(v, "boiler", NameFlags::default(), None).unwrap();

        let w = t.add_variable(top, 7, ObjFlags::default()).unwrap();
        t.set_property(w, varp::VALUE, &v_str("idle"), None).unwrap();

        (t, top)
    }

    #[test]
    fn round_trip_preserves_structure() {
        let (t, top) = sample_tree();
        let bytes = t.obj_to_bytes(top).unwrap();

        let mut t2 = Tree::new(classid::CONTAINER, Payload::Container);
        let root2 = t2.root();
        let copy = t2.obj_from_bytes(root2, &bytes).unwrap();

        assert!(obj_equal(&t, top, &t2, copy));

        // The name came back and mapped into the copied namespace.
        assert!(t2.byname(copy, "boiler").is_some());
    }

    #[test]
    fn equality_detects_differences() {
        let (t, top) = sample_tree();
        let (mut t2, top2) = sample_tree();
        assert!(obj_equal(&t, top, &t2, top2));

        let v = t2.byname(top2, "boiler").unwrap();
        t2.set_property(v, varp::VALUE, &v_double(99.0), None).unwrap();
        assert!(!obj_equal(&t, top, &t2, top2));
    }

    #[test]
    fn temporary_names_stay_behind() {
        let mut t = Tree::new(classid::CONTAINER, Payload::Container);
        let root = t.root();
        let top = t.add_container(root, ITEM, ObjFlags::default()).unwrap();
        t.create_namespace(top, None).unwrap();
        let child = t.add_container(top, ITEM, ObjFlags::default()).unwrap();
        t.add_name(child, "fleeting", NameFlags::TEMPORARY, None)
            .unwrap();

        let bytes = t.obj_to_bytes(top).unwrap();
        let mut t2 = Tree::new(classid::CONTAINER, Payload::Container);
        let root2 = t2.root();
        let copy = t2.obj_from_bytes(root2, &bytes).unwrap();
        assert!(t2.byname(copy, "fleeting").is_none());
    }
}
