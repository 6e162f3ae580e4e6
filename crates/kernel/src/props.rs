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

//! The property system. Each class registers a schema once at startup: one
//! definition per property with a default value. Objects store only
//! non-default, non-simple values in an attached value set; everything else
//! reads through to the class the object belongs to.

use crate::command::Command;
use crate::envelope::Envelope;
use crate::envelope::MsgFlags;
use crate::handles::Oix;
use crate::name::{NameRec, NsKind};
use crate::namespace::NsRec;
use crate::object::{ObjCtx, Payload};
use crate::process::{self, ClassRegistry};
use crate::set::ValueSet;
use crate::tree::Tree;
use arbor_common::{classid, oid, ClassId, ObjFlags, Status};
use arbor_var::{v_double, v_long, v_str, Var};
use bitflags::bitflags;
use tracing::error;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct PropFlags: u32 {
        /// Value is saved when the object is serialized.
        const PERSISTENT = 0x01;
        /// Saved only when metadata is saved too.
        const METADATA = 0x02;
        /// The class stores the value itself; nothing goes in the override
        /// store.
        const SIMPLE = 0x04;
        /// Skip the on-change hook for this property.
        const NOONPRCH = 0x08;
        /// Not packed into transferred property sets.
        const NOPACK = 0x10;
    }
}

/// Property numbers of the Variable class. The value property is named `x`,
/// its metadata hangs off it as sub-properties.
pub mod varp {
    pub const VALUE: i32 = 1;
    pub const DIGS: i32 = 4;
    pub const TEXT: i32 = 6;
    pub const UNIT: i32 = 8;
    pub const MIN: i32 = 10;
    pub const MAX: i32 = 12;
    pub const TYPE: i32 = 14;
    pub const ATTR: i32 = 16;
    pub const DEFAULT: i32 = 18;
}

#[derive(Clone)]
pub struct PropDef {
    pub nr: i32,
    pub name: String,
    pub flags: PropFlags,
    pub default: Var,
    /// For a head property: names of its `head.tail` sub-properties, filled
    /// in by `propertyset_done`.
    pub conf: Vec<String>,
}

/// A class's property schema: definitions ordered by number with a name
/// index.
#[derive(Default)]
pub struct PropertySet {
    defs: Vec<PropDef>,
    by_name: ahash::AHashMap<String, i32>,
}

impl PropertySet {
    pub fn add(&mut self, nr: i32, name: &str, flags: PropFlags, default: Var) {
        let def = PropDef {
            nr,
            name: name.to_string(),
            flags,
            default,
            conf: Vec::new(),
        };
        match self.defs.binary_search_by_key(&nr, |d| d.nr) {
            Ok(i) => self.defs[i] = def,
            Err(i) => self.defs.insert(i, def),
        }
        self.by_name.insert(name.to_string(), nr);
    }

    pub fn get(&self, nr: i32) -> Option<&PropDef> {
        self.defs
            .binary_search_by_key(&nr, |d| d.nr)
            .ok()
            .map(|i| &self.defs[i])
    }

    pub fn nr_of(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropDef> {
        self.defs.iter()
    }

    /// Link `head.tail` property names to their head property.
    pub fn done(&mut self) {
        let mut links: Vec<(i32, String)> = Vec::new();
        for def in &self.defs {
            if let Some((head, _)) = def.name.split_once('.') {
                if let Some(head_nr) = self.by_name.get(head).copied() {
                    links.push((head_nr, def.name.clone()));
                }
            }
        }
        for (head_nr, sub) in links {
            if let Ok(i) = self.defs.binary_search_by_key(&head_nr, |d| d.nr) {
                if !self.defs[i].conf.contains(&sub) {
                    self.defs[i].conf.push(sub);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Registration entry points. Startup-time; each takes the process lock.
// ----------------------------------------------------------------------

pub fn add_property(cls: ClassId, nr: i32, name: &str, flags: PropFlags, default: Var) {
    let mut state = process::process();
    state.classes.property_set_mut(cls).add(nr, name, flags, default);
}

pub fn add_property_long(cls: ClassId, nr: i32, name: &str, flags: PropFlags, x: i64) {
    add_property(cls, nr, name, flags, v_long(x));
}

pub fn add_property_double(cls: ClassId, nr: i32, name: &str, flags: PropFlags, x: f64, digs: u8) {
    let mut v = v_double(x);
    v.set_digs(digs);
    add_property(cls, nr, name, flags, v);
}

pub fn add_property_str(cls: ClassId, nr: i32, name: &str, flags: PropFlags, x: &str) {
    add_property(cls, nr, name, flags, v_str(x));
}

/// Complete a class's property set: links sub-property names of the form
/// `head.tail` to their head property.
pub fn propertyset_done(cls: ClassId) {
    let mut state = process::process();
    state.classes.property_set_mut(cls).done();
}

pub fn property_nr(cls: ClassId, name: &str) -> Option<i32> {
    process::process()
        .classes
        .property_set(cls)
        .and_then(|set| set.nr_of(name))
}

pub fn property_name(cls: ClassId, nr: i32) -> Option<String> {
    process::process()
        .classes
        .property_set(cls)
        .and_then(|set| set.get(nr))
        .map(|def| def.name.clone())
}

/// Built-in classes: payload factories for deserialization plus the Variable
/// schema. Runs once while the process state is first built.
pub(crate) fn register_builtin_classes(reg: &mut ClassRegistry) {
    reg.register_factory(classid::CONTAINER, || Payload::Container);
    reg.register_factory(classid::VARIABLE, || Payload::Variable(Var::new()));
    reg.register_factory(classid::SET, || Payload::Set(ValueSet::new()));
    reg.register_factory(classid::NAME, || {
        Payload::Name(NameRec::new(Var::new(), NsKind::Parent))
    });
    reg.register_factory(classid::NAMESPACE, || Payload::Namespace(NsRec::new(None)));

    let set = reg.property_set_mut(classid::VARIABLE);
    set.add(
        varp::TEXT,
        "x.text",
        PropFlags::METADATA | PropFlags::NOONPRCH,
        Var::new(),
    );
    set.add(
        varp::TYPE,
        "x.type",
        PropFlags::METADATA | PropFlags::NOONPRCH,
        Var::new(),
    );
    set.add(
        varp::VALUE,
        "x",
        PropFlags::PERSISTENT | PropFlags::SIMPLE,
        Var::new(),
    );
    set.add(
        varp::DEFAULT,
        "x.default",
        PropFlags::METADATA | PropFlags::NOONPRCH,
        Var::new(),
    );
    set.add(varp::DIGS, "x.digs", PropFlags::METADATA | PropFlags::SIMPLE, v_long(2));
    set.add(
        varp::UNIT,
        "x.unit",
        PropFlags::METADATA | PropFlags::NOONPRCH,
        Var::new(),
    );
    set.add(
        varp::MIN,
        "x.min",
        PropFlags::METADATA | PropFlags::NOONPRCH,
        Var::new(),
    );
    set.add(
        varp::MAX,
        "x.max",
        PropFlags::METADATA | PropFlags::NOONPRCH,
        Var::new(),
    );
    set.add(
        varp::ATTR,
        "x.attr",
        PropFlags::METADATA | PropFlags::NOONPRCH,
        Var::new(),
    );
    set.done();
}

// ----------------------------------------------------------------------
// Per-object property operations.
// ----------------------------------------------------------------------

impl Tree {
    /// Set a property. Unchanged values are dropped without side effects;
    /// otherwise the change hook runs (unless suppressed), the override
    /// store is updated with default elision, and the change is forwarded to
    /// every property binding except `source`.
    pub fn set_property(
        &mut self,
        oix: Oix,
        nr: i32,
        x: &Var,
        source: Option<Oix>,
    ) -> Result<(), Status> {
        let class_id = self.node(oix).ok_or(Status::Failed)?.class_id;
        let (pflags, default) = {
            let state = process::process();
            let Some(set) = state.classes.property_set(class_id) else {
                error!("set_property: class {class_id} has no property support");
                return Err(Status::NoClassPropertySupport);
            };
            let Some(def) = set.get(nr) else {
                error!("set_property: property {nr} is not valid for class {class_id}");
                return Err(Status::NoClassPropertySupport);
            };
            (def.flags, def.default.clone())
        };

        if pflags.contains(PropFlags::SIMPLE) {
            let mut current = Var::new();
            if self.simple_property_of(oix, nr, &mut current).is_ok() && current == *x {
                return Ok(());
            }
            if !pflags.contains(PropFlags::NOONPRCH) {
                self.run_property_change_hook(oix, nr, x);
            }
        } else {
            let store = self.attachment(oix, oid::PROPERTIES);
            let current = store
                .and_then(|s| self.node(s))
                .and_then(|n| n.payload.as_set())
                .and_then(|set| set.get(nr))
                .cloned()
                .unwrap_or_default();
            if current == *x {
                return Ok(());
            }
            if !pflags.contains(PropFlags::NOONPRCH) {
                self.run_property_change_hook(oix, nr, x);
            }

            let store = match self.attachment(oix, oid::PROPERTIES) {
                Some(s) => s,
                None => self.add_node(
                    oix,
                    oid::PROPERTIES,
                    ObjFlags::ATTACHMENT,
                    classid::SET,
                    Payload::Set(ValueSet::new()),
                )?,
            };
            if let Some(set) = self.node_mut(store).and_then(|n| n.payload.as_set_mut()) {
                if *x == default {
                    set.set(nr, None);
                } else {
                    set.set(nr, Some(x));
                }
            }
        }

        self.forward_property(oix, nr, x, source);
        Ok(())
    }

    /// Get a property: override store first, then the class's own simple
    /// storage, then the schema default.
    pub fn get_property(&self, oix: Oix, nr: i32, x: &mut Var) -> Result<(), Status> {
        if let Some(stored) = self
            .attachment(oix, oid::PROPERTIES)
            .and_then(|s| self.node(s))
            .and_then(|n| n.payload.as_set())
            .and_then(|set| set.get(nr))
        {
            x.set_var(stored);
            return Ok(());
        }
        if self.simple_property_of(oix, nr, x).is_ok() {
            return Ok(());
        }

        let class_id = self.node(oix).ok_or(Status::Failed)?.class_id;
        let state = process::process();
        let Some(def) = state
            .classes
            .property_set(class_id)
            .and_then(|set| set.get(nr))
        else {
            x.clear();
            return Err(Status::NoClassPropertySupport);
        };
        x.set_var(&def.default);
        Ok(())
    }

    pub fn set_property_by_name(
        &mut self,
        oix: Oix,
        name: &str,
        x: &Var,
        source: Option<Oix>,
    ) -> Result<(), Status> {
        let class_id = self.node(oix).ok_or(Status::Failed)?.class_id;
        let nr = property_nr(class_id, name).ok_or(Status::NoClassPropertySupport)?;
        self.set_property(oix, nr, x, source)
    }

    pub fn get_property_by_name(&self, oix: Oix, name: &str, x: &mut Var) -> Result<(), Status> {
        let class_id = self.node(oix).ok_or(Status::Failed)?.class_id;
        let nr = property_nr(class_id, name).ok_or(Status::NoClassPropertySupport)?;
        self.get_property(oix, nr, x)
    }

    /// Run the change hook for every non-simple, non-suppressed property so
    /// subclass state derived from property values starts out right.
    pub fn initialize_properties(&mut self, oix: Oix) {
        let Some(class_id) = self.node(oix).map(|n| n.class_id) else {
            return;
        };
        let inits: Vec<(i32, Var)> = {
            let state = process::process();
            let Some(set) = state.classes.property_set(class_id) else {
                error!("initialize_properties: class {class_id} has no property support");
                return;
            };
            set.iter()
                .filter(|d| !d.flags.intersects(PropFlags::SIMPLE | PropFlags::NOONPRCH))
                .map(|d| (d.nr, d.default.clone()))
                .collect()
        };
        for (nr, default) in inits {
            self.run_property_change_hook(oix, nr, &default);
        }
    }

    /// Current value of a property the class stores itself.
    pub fn simple_property_of(&self, oix: Oix, nr: i32, x: &mut Var) -> Result<(), Status> {
        let node = self.node(oix).ok_or(Status::NoSimpleProperty)?;
        match &node.payload {
            Payload::Variable(v) => match nr {
                varp::VALUE => {
                    x.set_var(v);
                    Ok(())
                }
                varp::DIGS => {
                    x.set_long(v.digs() as i64);
                    Ok(())
                }
                _ => Err(Status::NoSimpleProperty),
            },
            Payload::Custom(b) => b.simple_property(nr, x),
            _ => Err(Status::NoSimpleProperty),
        }
    }

    fn run_property_change_hook(&mut self, oix: Oix, nr: i32, x: &Var) {
        self.with_taken_payload(oix, |tree, payload| match payload {
            Payload::Variable(v) => match nr {
                varp::VALUE => v.set_var(x),
                varp::DIGS => v.set_digs(x.get_long().clamp(0, 31) as u8),
                _ => {}
            },
            Payload::Custom(b) => {
                let mut ctx = ObjCtx::new(tree, oix);
                b.on_property_change(&mut ctx, nr, x);
            }
            _ => {}
        });
    }

    /// Forward a property change to every property binding of the object
    /// except the one that caused it.
    fn forward_property(&mut self, oix: Oix, nr: i32, x: &Var, source: Option<Oix>) {
        let Some(bindings) = self.attachment(oix, oid::BINDINGS) else {
            return;
        };
        for b in self.children(bindings, oid::CHILD) {
            if Some(b) == source {
                continue;
            }
            if self
                .node(b)
                .is_some_and(|n| n.class_id == classid::PROPERTY_BINDING)
            {
                crate::binding::changed(self, b, nr, x);
            }
        }
    }

    /// Fire-and-forget remote property set. When the path carries no
    /// `/_p/` component the plain value property is addressed.
    pub fn set_property_msg(
        &mut self,
        from: Oix,
        remote_path: &str,
        x: &Var,
        propertyname: Option<&str>,
    ) {
        let path = match propertyname {
            Some(p) => format!("{remote_path}/_p/{p}"),
            None if remote_path.contains("/_p/") => remote_path.to_string(),
            None => format!("{remote_path}/_p/x"),
        };
        let env = Envelope::new(Command::SET_PROPERTY)
            .with_target(&path)
            .with_flags(MsgFlags::NO_REPLY)
            .with_value(x.clone());
        self.send(from, env);
    }

    /// Attribute list (sub-property names) of a property, for bindings that
    /// mirror metadata.
    pub(crate) fn property_attr_list(&self, oix: Oix, nr: i32) -> Option<Var> {
        let class_id = self.node(oix)?.class_id;
        let state = process::process();
        let def = state.classes.property_set(class_id)?.get(nr)?;
        if def.conf.is_empty() {
            return None;
        }
        let mut v = Var::new();
        v.set_str(&def.conf.join(","));
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBehavior;
    use crate::tree::Tree;
    use arbor_common::oid::ITEM;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    const CLS_GAUGE: ClassId = classid::USER_BASE + 1;
    const GAUGE_TEMP: i32 = 1;
    const GAUGE_LABEL: i32 = 2;

    fn register_gauge() {
        add_property_double(CLS_GAUGE, GAUGE_TEMP, "temp", PropFlags::PERSISTENT, 20.0, 2);
        add_property_str(CLS_GAUGE, GAUGE_LABEL, "label", PropFlags::PERSISTENT, "");
        propertyset_done(CLS_GAUGE);
    }

    struct Gauge {
        changes: Arc<AtomicI64>,
    }

    impl ObjectBehavior for Gauge {
        fn on_property_change(&mut self, _ctx: &mut ObjCtx<'_>, propertynr: i32, _x: &Var) {
            if propertynr == GAUGE_TEMP {
                self.changes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn gauge_tree() -> (Tree, Oix, Arc<AtomicI64>) {
        register_gauge();
        let mut t = Tree::new(classid::CONTAINER, Payload::Container);
        let changes = Arc::new(AtomicI64::new(0));
        let g = t
            .add_custom(
                t.root(),
                ITEM,
                ObjFlags::default(),
                CLS_GAUGE,
                Box::new(Gauge {
                    changes: changes.clone(),
                }),
            )
            .unwrap();
        (t, g, changes)
    }

    #[test]
    fn defaults_read_through() {
        let (t, g, _) = gauge_tree();
        let mut v = Var::new();
        t.get_property(g, GAUGE_TEMP, &mut v).unwrap();
        assert_eq!(v.get_double(), 20.0);
        // Nothing stored for a default.
        assert!(t.attachment(g, oid::PROPERTIES).is_none());
    }

    #[test]
    fn set_stores_override_and_fires_hook_once() {
        let (mut t, g, changes) = gauge_tree();
        t.set_property(g, GAUGE_TEMP, &v_double(40.0), None).unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        let mut v = Var::new();
        t.get_property(g, GAUGE_TEMP, &mut v).unwrap();
        assert_eq!(v.get_double(), 40.0);
        assert!(t.attachment(g, oid::PROPERTIES).is_some());
    }

    #[test]
    fn setting_same_value_is_silent() {
        let (mut t, g, changes) = gauge_tree();
        t.set_property(g, GAUGE_TEMP, &v_double(40.0), None).unwrap();
        t.set_property(g, GAUGE_TEMP, &v_double(40.0), None).unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn returning_to_default_removes_override() {
        let (mut t, g, _) = gauge_tree();
        t.set_property(g, GAUGE_TEMP, &v_double(40.0), None).unwrap();
        t.set_property(g, GAUGE_TEMP, &v_double(20.0), None).unwrap();
        let store = t.attachment(g, oid::PROPERTIES).unwrap();
        let set = t.node(store).unwrap().payload.as_set().unwrap();
        assert!(set.get(GAUGE_TEMP).is_none());
    }

    #[test]
    fn property_by_name() {
        let (mut t, g, _) = gauge_tree();
        t.set_property_by_name(g, "label", &v_str("boiler"), None)
            .unwrap();
        let mut v = Var::new();
        t.get_property_by_name(g, "label", &mut v).unwrap();
        assert_eq!(v.as_str(), "boiler");
        assert!(t
            .set_property_by_name(g, "nosuch", &v_long(0), None)
            .is_err());
    }

    #[test]
    fn unknown_class_reports_no_property_support() {
        let mut t = Tree::new(classid::CONTAINER, Payload::Container);
        let root = t.root();
        let mut v = Var::new();
        assert_eq!(
            t.set_property(root, 1, &v_long(1), None).unwrap_err(),
            Status::NoClassPropertySupport
        );
        assert_eq!(
            t.get_property(root, 1, &mut v).unwrap_err(),
            Status::NoClassPropertySupport
        );
    }

    #[test]
    fn variable_simple_properties() {
        let mut t = Tree::new(classid::CONTAINER, Payload::Container);
        let v_oix = t.add_variable(t.root(), ITEM, ObjFlags::default()).unwrap();
        t.set_property(v_oix, varp::VALUE, &v_double(3.5), None)
            .unwrap();

        let mut out = Var::new();
        t.get_property(v_oix, varp::VALUE, &mut out).unwrap();
        assert_eq!(out.get_double(), 3.5);

        t.set_property(v_oix, varp::DIGS, &v_long(4), None).unwrap();
        assert_eq!(
            t.node(v_oix).unwrap().payload.as_variable().unwrap().digs(),
            4
        );
        // Simple values never land in the override store.
        assert!(t.attachment(v_oix, oid::PROPERTIES).is_none());
    }

    #[test]
    fn variable_subproperties_linked() {
        let state = process::process();
        let set = state.classes.property_set(classid::VARIABLE).unwrap();
        let value = set.get(varp::VALUE).unwrap();
        assert!(value.conf.iter().any(|s| s == "x.min"));
        assert!(value.conf.iter().any(|s| s == "x.digs"));
        assert_eq!(set.nr_of("x"), Some(varp::VALUE));
    }

    #[test]
    fn initialize_properties_runs_hooks() {
        let (mut t, g, changes) = gauge_tree();
        t.initialize_properties(g);
        // temp and label both fire, but only temp is counted by the gauge.
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }
}
