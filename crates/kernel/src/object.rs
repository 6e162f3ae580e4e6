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

use crate::binding::PropertyBinding;
use crate::envelope::Envelope;
use crate::handles::Oix;
use crate::name::NameRec;
use crate::namespace::NsRec;
use crate::set::ValueSet;
use crate::tree::Tree;
use arbor_common::Status;
use arbor_stream::Queue;
use arbor_var::Var;

/// Hooks a user class implements to take part in messaging, the property
/// system and serialization. All have do-nothing defaults.
///
/// A hook runs with its own payload temporarily removed from the node, so
/// reading the object's own simple properties through the context fails
/// inside a hook; keep class state in the implementing struct instead.
pub trait ObjectBehavior: Send {
    /// A message reached this object with an exhausted target path. Return
    /// whether it was handled.
    fn on_message(&mut self, ctx: &mut ObjCtx<'_>, env: &Envelope) -> bool {
        let _ = (ctx, env);
        false
    }

    /// A property of this object changed. Runs unless the property schema
    /// suppresses it.
    fn on_property_change(&mut self, ctx: &mut ObjCtx<'_>, propertynr: i32, x: &Var) {
        let _ = (ctx, propertynr, x);
    }

    /// Produce the current value of a property the class stores itself.
    fn simple_property(&self, propertynr: i32, x: &mut Var) -> Result<(), Status> {
        let _ = (propertynr, x);
        Err(Status::NoSimpleProperty)
    }

    /// Class-specific serialization payload.
    fn write_content(&self, q: &mut Queue) -> Result<(), Status> {
        let _ = q;
        Ok(())
    }

    fn read_content(&mut self, q: &mut Queue) -> Result<(), Status> {
        let _ = q;
        Ok(())
    }
}

/// What a node actually is. Built-in classes are closed variants the kernel
/// handles directly; user classes hang off `Custom`.
pub enum Payload {
    Container,
    Variable(Var),
    Name(NameRec),
    Namespace(NsRec),
    Set(ValueSet),
    Binding(Box<PropertyBinding>),
    Custom(Box<dyn ObjectBehavior>),
    /// Transient marker while a hook borrows the payload.
    Taken,
}

impl Payload {
    pub fn as_variable(&self) -> Option<&Var> {
        match self {
            Payload::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variable_mut(&mut self) -> Option<&mut Var> {
        match self {
            Payload::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&ValueSet> {
        match self {
            Payload::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut ValueSet> {
        match self {
            Payload::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&NameRec> {
        match self {
            Payload::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_name_mut(&mut self) -> Option<&mut NameRec> {
        match self {
            Payload::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&NsRec> {
        match self {
            Payload::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    pub fn as_namespace_mut(&mut self) -> Option<&mut NsRec> {
        match self {
            Payload::Namespace(ns) => Some(ns),
            _ => None,
        }
    }
}

/// Context handed to behavior hooks: the owning tree plus the hook target's
/// own node.
pub struct ObjCtx<'a> {
    pub tree: &'a mut Tree,
    pub oix: Oix,
}

impl<'a> ObjCtx<'a> {
    pub fn new(tree: &'a mut Tree, oix: Oix) -> Self {
        ObjCtx { tree, oix }
    }

    /// Set a property on this object.
    pub fn set_property(&mut self, propertynr: i32, x: &Var) -> Result<(), Status> {
        self.tree.set_property(self.oix, propertynr, x, None)
    }

    /// Get a property of this object.
    pub fn get_property(&mut self, propertynr: i32, x: &mut Var) -> Result<(), Status> {
        self.tree.get_property(self.oix, propertynr, x)
    }

    /// Send an envelope from this object.
    pub fn send(&mut self, env: Envelope) {
        self.tree.send(self.oix, env);
    }
}
