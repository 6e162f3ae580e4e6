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

//! Property bindings: paired client/server attachment objects that mirror
//! one property across the address space with acknowledged flow control.
//! The client half lives under the bound object's bindings container and
//! drives BIND/REBIND; the server half is created on demand when a BIND
//! lands on an object.

use crate::command::Command;
use crate::envelope::{Content, Envelope, MsgFlags};
use crate::handles::Oix;
use crate::object::Payload;
use crate::set::ValueSet;
use crate::tree::Tree;
use arbor_common::{classid, oid, ObjFlags, Status};
use arbor_var::Var;
use bitflags::bitflags;
use tracing::debug;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct BindFlags: u32 {
        /// The client's value initializes the pair, not the server's.
        const CLIENTINIT = 0x01;
        /// No flow control: forward every change regardless of pending acks.
        const NOFLOWCLT = 0x02;
        /// Mirror metadata too.
        const METADATA = 0x04;
        /// Transfer the attribute (sub-property) list on bind.
        const ATTR = 0x08;
        /// Binding is neither cloned nor serialized.
        const TEMPORARY = 0x10;

        /// This is the client half.
        const CLIENT = 0x100;
        /// The pair spans threads; forwards are acknowledged.
        const INTERTHREAD = 0x200;
        /// Local value changed and has not been forwarded yet.
        const CHANGED = 0x400;
    }
}

impl BindFlags {
    /// Bits that travel in the BIND parameter set.
    pub const SER_MASK: BindFlags = BindFlags::CLIENTINIT
        .union(BindFlags::NOFLOWCLT)
        .union(BindFlags::METADATA)
        .union(BindFlags::ATTR);
}

/// Parameter set keys used by BIND and BIND_REPLY.
pub mod bindprm {
    pub const FLAGS: i32 = 1;
    pub const PROPERTYNAME: i32 = 2;
    pub const VALUE: i32 = 3;
    pub const ATTRLIST: i32 = 4;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindState {
    Unused,
    BindingNow,
    Ok,
}

pub struct PropertyBinding {
    pub state: BindState,
    pub flags: BindFlags,
    /// Forwards sent and not yet acknowledged.
    pub ack_count: i32,
    /// Remote object path, kept across disconnects for REBIND.
    pub obj_path: Option<String>,
    /// Peer binding's address, learned from the bind handshake.
    pub bind_path: Option<String>,
    pub local_nr: i32,
    pub remote_prop: Option<String>,
}

impl PropertyBinding {
    fn new(flags: BindFlags) -> Self {
        PropertyBinding {
            state: BindState::Unused,
            flags,
            ack_count: 0,
            obj_path: None,
            bind_path: None,
            local_nr: -1,
            remote_prop: None,
        }
    }

    fn forward_now(&self) -> bool {
        self.state == BindState::Ok
            && self.flags.contains(BindFlags::CHANGED)
            && (self.flags.contains(BindFlags::NOFLOWCLT)
                || !self.flags.contains(BindFlags::INTERTHREAD)
                || self.ack_count == 0)
    }
}

impl Tree {
    /// Bind a local property to a remote one. The remote path may carry the
    /// property as a `/_p/name` suffix; without one the plain value property
    /// is assumed. Returns the client binding object.
    pub fn bind(
        &mut self,
        obj: Oix,
        local_nr: i32,
        remote_path: &str,
        remote_prop: Option<&str>,
        bflags: BindFlags,
    ) -> Result<Oix, Status> {
        let (path, prop) = match remote_prop {
            Some(p) => (remote_path.to_string(), p.to_string()),
            None => match remote_path.split_once("/_p/") {
                Some((head, tail)) => (head.to_string(), tail.to_string()),
                None => (remote_path.to_string(), "x".to_string()),
            },
        };

        let bindings = self.bindings_container(obj)?;
        // Bindings are neither cloneable nor serializable; a restored tree
        // re-binds instead of resurrecting handshake state.
        let node_flags = ObjFlags::NOT_CLONABLE | ObjFlags::NOT_SERIALIZABLE;
        let mut binding = PropertyBinding::new((bflags & BindFlags::SER_MASK) | BindFlags::CLIENT);
        binding.local_nr = local_nr;
        binding.remote_prop = Some(prop);
        binding.obj_path = Some(path);
        let b_oix = self.add_node(
            bindings,
            oid::ITEM,
            node_flags,
            classid::PROPERTY_BINDING,
            Payload::Binding(Box::new(binding)),
        )?;

        bind_send(self, b_oix);
        Ok(b_oix)
    }

    fn bindings_container(&mut self, obj: Oix) -> Result<Oix, Status> {
        match self.attachment(obj, oid::BINDINGS) {
            Some(c) => Ok(c),
            None => self.add_container(obj, oid::BINDINGS, ObjFlags::ATTACHMENT),
        }
    }
}

/// (Re)issue the BIND message for a client binding, using its stored remote
/// path and parameters.
fn bind_send(tree: &mut Tree, b_oix: Oix) {
    let Some((params, path)) = tree.with_taken_payload(b_oix, |tree, payload| {
        let Payload::Binding(b) = payload else {
            return None;
        };
        // A rebind starts from a clean slate but keeps the remote path.
        b.bind_path = None;
        b.ack_count = 0;
        b.flags.remove(BindFlags::INTERTHREAD);

        let mut params = ValueSet::new();
        params.set_long(bindprm::FLAGS, (b.flags & BindFlags::SER_MASK).bits() as i64);
        if let Some(prop) = &b.remote_prop {
            params.set_str(bindprm::PROPERTYNAME, prop);
        }
        if b.flags.contains(BindFlags::CLIENTINIT) {
            let mut x = Var::new();
            if binding_get_property(tree, b_oix, b.local_nr, &mut x).is_err() {
                debug!("bind: unknown local property {}", b.local_nr);
                return None;
            }
            params.set(bindprm::VALUE, Some(&x));
        }
        if b.flags.contains(BindFlags::ATTR) {
            if let Some(owner) = binding_owner(tree, b_oix) {
                if let Some(attrs) = tree.property_attr_list(owner, b.local_nr) {
                    params.set(bindprm::ATTRLIST, Some(&attrs));
                }
            }
        }
        b.state = BindState::BindingNow;
        b.obj_path.clone().map(|p| (params, p))
    }).flatten() else {
        return;
    };

    let env = Envelope::new(Command::BIND)
        .with_target(&path)
        .with_content(Content::Set(params));
    tree.send(b_oix, env);
}

/// A BIND landed on an object: create the server half, adopt or reply with
/// the initial value, answer BIND_REPLY.
pub(crate) fn srv_bind(tree: &mut Tree, obj: Oix, env: Envelope) {
    let Some(params) = env.content.as_ref().and_then(Content::as_set) else {
        debug!("srv_bind failed: no parameter set");
        tree.no_target(obj, env);
        return;
    };
    let Some(prop_name) = params.get(bindprm::PROPERTYNAME).map(|v| v.to_text().into_owned())
    else {
        debug!("srv_bind failed: property name missing");
        tree.no_target(obj, env);
        return;
    };
    let Some(class_id) = tree.node(obj).map(|n| n.class_id) else {
        return;
    };
    let Some(local_nr) = crate::props::property_nr(class_id, &prop_name) else {
        debug!("srv_bind failed: property name {prop_name:?} unknown");
        tree.no_target(obj, env);
        return;
    };

    let mut flags = BindFlags::from_bits_truncate(params.get_long(bindprm::FLAGS) as u32)
        & BindFlags::SER_MASK;
    if env.flags.contains(MsgFlags::INTERTHREAD) {
        flags |= BindFlags::INTERTHREAD;
    }

    let Ok(bindings) = tree.bindings_container(obj) else {
        return;
    };
    let mut binding = PropertyBinding::new(flags);
    binding.local_nr = local_nr;
    binding.remote_prop = Some(prop_name);
    binding.bind_path = Some(env.source.as_str().to_string());
    binding.state = BindState::Ok;
    let Ok(b_oix) = tree.add_node(
        bindings,
        oid::ITEM,
        ObjFlags::NOT_CLONABLE | ObjFlags::NOT_SERIALIZABLE,
        classid::PROPERTY_BINDING,
        Payload::Binding(Box::new(binding)),
    ) else {
        return;
    };

    // Initial value: the server's unless the client claimed initialization.
    let mut reply = ValueSet::new();
    if flags.contains(BindFlags::CLIENTINIT) {
        if let Some(x) = params.get(bindprm::VALUE) {
            let x = x.clone();
            binding_set_property(tree, b_oix, local_nr, &x);
        }
    } else {
        let mut x = Var::new();
        if binding_get_property(tree, b_oix, local_nr, &mut x).is_ok() {
            reply.set(bindprm::VALUE, Some(&x));
        }
    }

    let target = env.source.as_str().to_string();
    let reply_env = Envelope::new(Command::BIND_REPLY)
        .with_target(&target)
        .with_content(Content::Set(reply));
    tree.send(b_oix, reply_env);
}

/// Commands addressed at a binding object itself.
pub(crate) fn on_binding_message(tree: &mut Tree, b_oix: Oix, env: Envelope) {
    match env.command {
        Command::BIND_REPLY => cbindok(tree, b_oix, env),
        Command::UNBIND | Command::SRV_UNBIND | Command::NO_TARGET => {
            let is_client = tree
                .node(b_oix)
                .and_then(|n| match &n.payload {
                    Payload::Binding(b) => Some(b.flags.contains(BindFlags::CLIENT)),
                    _ => None,
                })
                .unwrap_or(false);
            if is_client {
                // Keep the remote path; a REBIND can revive the pair.
                disconnect(tree, b_oix, true);
            } else {
                tree.delete(b_oix);
            }
        }
        Command::FWRD => update(tree, b_oix, env),
        Command::ACK => {
            tree.with_taken_payload(b_oix, |_, payload| {
                if let Payload::Binding(b) = payload {
                    b.ack_count -= 1;
                }
            });
            forward(tree, b_oix, None);
        }
        Command::REBIND => bind_send(tree, b_oix),
        other => debug!("binding ignores {other}"),
    }
}

/// BIND_REPLY reached the client half: adopt the server's value unless the
/// client initialized, learn the peer address, go live.
fn cbindok(tree: &mut Tree, b_oix: Oix, env: Envelope) {
    let (client_init, local_nr) = match tree.node(b_oix).and_then(|n| match &n.payload {
        Payload::Binding(b) => Some((b.flags.contains(BindFlags::CLIENTINIT), b.local_nr)),
        _ => None,
    }) {
        Some(x) => x,
        None => return,
    };

    if !client_init {
        if let Some(x) = env
            .content
            .as_ref()
            .and_then(Content::as_set)
            .and_then(|s| s.get(bindprm::VALUE))
        {
            let x = x.clone();
            binding_set_property(tree, b_oix, local_nr, &x);
        }
    }

    let interthread = env.flags.contains(MsgFlags::INTERTHREAD);
    let source = env.source.as_str().to_string();
    tree.with_taken_payload(b_oix, |_, payload| {
        if let Payload::Binding(b) = payload {
            b.bind_path = Some(source.clone());
            if interthread {
                b.flags |= BindFlags::INTERTHREAD;
            }
            b.state = BindState::Ok;
            if !b.flags.contains(BindFlags::CLIENTINIT) {
                // The server's value just arrived; anything marked before is
                // stale.
                b.flags.remove(BindFlags::CHANGED);
            }
        }
    });
    if client_init {
        forward(tree, b_oix, None);
    }
}

/// The bound property changed locally. Mark and forward when flow control
/// allows.
pub(crate) fn changed(tree: &mut Tree, b_oix: Oix, propertynr: i32, x: &Var) {
    let relevant = tree
        .node(b_oix)
        .and_then(|n| match &n.payload {
            Payload::Binding(b) => Some(b.local_nr == propertynr),
            _ => None,
        })
        .unwrap_or(false);
    if !relevant {
        return;
    }
    tree.with_taken_payload(b_oix, |_, payload| {
        if let Payload::Binding(b) = payload {
            b.flags |= BindFlags::CHANGED;
        }
    });
    forward(tree, b_oix, Some(x));
}

/// Send the property value through the binding if flow control allows.
fn forward(tree: &mut Tree, b_oix: Oix, x: Option<&Var>) {
    let plan = tree
        .node(b_oix)
        .and_then(|n| match &n.payload {
            Payload::Binding(b) => Some((b.forward_now(), b.local_nr, b.bind_path.clone())),
            _ => None,
        });
    let Some((go, local_nr, Some(bind_path))) = plan else {
        return;
    };
    if !go {
        return;
    }

    let value = match x {
        Some(v) => v.clone(),
        None => {
            let mut v = Var::new();
            if binding_get_property(tree, b_oix, local_nr, &mut v).is_err() {
                return;
            }
            v
        }
    };

    tree.with_taken_payload(b_oix, |_, payload| {
        if let Payload::Binding(b) = payload {
            b.flags.remove(BindFlags::CHANGED);
            if b.flags.contains(BindFlags::INTERTHREAD) && !b.flags.contains(BindFlags::NOFLOWCLT) {
                b.ack_count += 1;
            }
        }
    });
    let env = Envelope::new(Command::FWRD)
        .with_target(&bind_path)
        .with_content(Content::Value(value));
    tree.send(b_oix, env);
}

/// A forwarded value arrived: apply it with this binding as the source so it
/// does not echo straight back, then acknowledge if the pair spans threads.
fn update(tree: &mut Tree, b_oix: Oix, env: Envelope) {
    let Some(Content::Value(x)) = &env.content else {
        debug!("FWRD without value content");
        return;
    };
    let local_nr = match tree.node(b_oix).and_then(|n| match &n.payload {
        Payload::Binding(b) => Some(b.local_nr),
        _ => None,
    }) {
        Some(nr) => nr,
        None => return,
    };
    let x = x.clone();
    binding_set_property(tree, b_oix, local_nr, &x);
    send_ack(tree, b_oix);
}

fn send_ack(tree: &mut Tree, b_oix: Oix) {
    let plan = tree.with_taken_payload(b_oix, |_, payload| {
        let Payload::Binding(b) = payload else {
            return None;
        };
        let ack_target = if b.flags.contains(BindFlags::INTERTHREAD) {
            b.bind_path.clone()
        } else {
            None
        };
        // A server with forwards in flight saw a crossing update; resend
        // once the ack drains.
        if !b.flags.contains(BindFlags::CLIENT) && b.ack_count != 0 {
            b.flags |= BindFlags::CHANGED;
        }
        ack_target
    });
    if let Some(Some(target)) = plan {
        let env = Envelope::new(Command::ACK).with_target(&target);
        tree.send(b_oix, env);
    }
}

/// Tear a binding down. With `keep_objpath` the remote path survives so the
/// binding can be reactivated later; without it the peer is told first.
pub(crate) fn disconnect(tree: &mut Tree, b_oix: Oix, keep_objpath: bool) {
    let notify = tree.with_taken_payload(b_oix, |_, payload| {
        let Payload::Binding(b) = payload else {
            return None;
        };
        let notify = if keep_objpath {
            None
        } else {
            match b.state {
                BindState::Unused => None,
                BindState::BindingNow => b
                    .obj_path
                    .clone()
                    .map(|p| (Command::UNBIND, p, MsgFlags::NO_ERRORS)),
                BindState::Ok => b.bind_path.clone().map(|p| {
                    (
                        if b.flags.contains(BindFlags::CLIENT) {
                            Command::UNBIND
                        } else {
                            Command::SRV_UNBIND
                        },
                        p,
                        MsgFlags::NO_ERRORS | MsgFlags::NO_RESOLVE,
                    )
                }),
            }
        };
        if !keep_objpath {
            b.obj_path = None;
        }
        b.bind_path = None;
        b.state = BindState::Unused;
        b.flags.remove(BindFlags::CHANGED | BindFlags::INTERTHREAD);
        b.ack_count = 0;
        notify
    });
    if let Some(Some((command, path, flags))) = notify {
        let env = Envelope::new(command).with_target(&path).with_flags(flags);
        tree.send(b_oix, env);
    }
}

/// Called when a node is deleted directly: a live binding says goodbye to
/// its peer. Condemned subtrees skip this through the fast-delete flag.
pub(crate) fn disconnect_if_binding(tree: &mut Tree, oix: Oix) {
    let live = tree
        .node(oix)
        .and_then(|n| match &n.payload {
            Payload::Binding(b) => Some(b.state != BindState::Unused),
            _ => None,
        })
        .unwrap_or(false);
    if live {
        disconnect(tree, oix, false);
    }
}

/// An UNBIND addressed at a bound object rather than a binding: find the
/// binding whose peer sent it and hand it over.
pub(crate) fn unbind_at_object(tree: &mut Tree, obj: Oix, env: Envelope) {
    let Some(bindings) = tree.attachment(obj, oid::BINDINGS) else {
        return;
    };
    let source = env.source.as_str().to_string();
    for b in tree.children(bindings, oid::CHILD) {
        let matches = tree
            .node(b)
            .and_then(|n| match &n.payload {
                Payload::Binding(rec) => Some(rec.bind_path.as_deref() == Some(source.as_str())),
                _ => None,
            })
            .unwrap_or(false);
        if matches {
            on_binding_message(tree, b, env);
            return;
        }
    }
    debug!("UNBIND with no matching binding, dropped");
}

/// The object a binding mirrors: its grandparent (bindings container's
/// parent).
fn binding_owner(tree: &Tree, b_oix: Oix) -> Option<Oix> {
    let container = tree.node(b_oix)?.parent?;
    tree.node(container)?.parent
}

fn binding_get_property(
    tree: &Tree,
    b_oix: Oix,
    nr: i32,
    x: &mut Var,
) -> Result<(), Status> {
    let owner = binding_owner(tree, b_oix).ok_or(Status::Failed)?;
    tree.get_property(owner, nr, x)
}

fn binding_set_property(tree: &mut Tree, b_oix: Oix, nr: i32, x: &Var) {
    let Some(owner) = binding_owner(tree, b_oix) else {
        return;
    };
    if let Err(e) = tree.set_property(owner, nr, x, Some(b_oix)) {
        debug!("binding set property failed: {e}");
    }
}
