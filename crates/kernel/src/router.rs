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

//! Envelope routing. `send` resolves the head of the target path (process
//! namespace, thread namespace, object index token, this/parent namespace or
//! a named namespace) and either walks the local tree or queues on another
//! thread. `dispatch_at` is the receive side: it keeps consuming the target
//! until the envelope lands on an object.

use crate::command::Command;
use crate::envelope::{Content, Envelope, MsgFlags};
use crate::handles::Oix;
use crate::object::{ObjCtx, Payload};
use crate::process::{self, ThreadPeer};
use crate::tree::{NsRef, NsSel, Tree};
use arbor_common::oid;
use arbor_var::{v_str, ObjRef};
use tracing::{debug, error};

impl Tree {
    /// Build and send a message from `from`.
    #[allow(clippy::too_many_arguments)]
    pub fn message(
        &mut self,
        from: Oix,
        command: Command,
        target: &str,
        source: Option<&str>,
        content: Option<Content>,
        flags: MsgFlags,
        context: Option<Content>,
    ) {
        let mut env = Envelope::new(command).with_target(target).with_flags(flags);
        if let Some(source) = source {
            env.source.set(source);
        }
        env.content = content;
        env.context = context;
        self.send(from, env);
    }

    /// Send an envelope from `from`, dispatching on the head of its target
    /// path.
    pub fn send(&mut self, from: Oix, mut env: Envelope) {
        env.flags |= MsgFlags::NO_RESOLVE;

        // Stamp the sender's identity onto the source path on the first hop
        // so replies can find their way back.
        if !env
            .flags
            .intersects(MsgFlags::NO_REPLY | MsgFlags::NO_NEW_SOURCE_OIX)
        {
            let token = self.oix_token(from);
            if !token.is_empty() {
                env.source.prepend_token(&token);
            }
            env.flags |= MsgFlags::NO_NEW_SOURCE_OIX;
        }

        let target = env.target.as_str();
        match target.as_bytes().first() {
            Some(b'/') => {
                if target.as_bytes().get(1) == Some(&b'/') {
                    env.target.skip(2);
                    self.send_process_ns(from, env);
                } else {
                    env.target.skip(1);
                    self.send_within(from, env, NsSel::ThreadLocal);
                }
            }
            Some(b'@') => self.send_oix(from, env),
            Some(b'.') => {
                let rest = &target.as_bytes()[1..];
                if rest.first() == Some(&b'.') && matches!(rest.get(1), None | Some(b'/')) {
                    env.target.consume(2);
                    self.send_within(from, env, NsSel::Parent);
                } else if matches!(rest.first(), None | Some(b'/')) {
                    env.target.consume(1);
                    self.send_within(from, env, NsSel::This);
                } else {
                    // A name that merely starts with a dot.
                    let ns_id = env.target.take_token();
                    self.send_within(from, env, NsSel::Id(ns_id));
                }
            }
            None => self.dispatch_at(from, env),
            _ => {
                // Leading name selects a namespace by identifier.
                let ns_id = env.target.take_token();
                self.send_within(from, env, NsSel::Id(ns_id));
            }
        }
    }

    /// Deliver within this thread through a namespace: resolve the
    /// namespace, look up the next path token there, hand the envelope to
    /// the named object.
    fn send_within(&mut self, from: Oix, mut env: Envelope, sel: NsSel) {
        let Some((NsRef::Tree(ns_oix), _)) = self.find_namespace(from, &sel, None) else {
            debug_or_error(&env, "message failed: namespace not found within thread");
            self.no_target(from, env);
            return;
        };
        let token = env.target.take_token();
        let Some(name_oix) = self.ns_first(ns_oix, Some(&v_str(&token))) else {
            debug_or_error(&env, "message failed: name not found within thread");
            self.no_target(from, env);
            return;
        };
        let Some(owner) = self.node(name_oix).and_then(|n| n.parent) else {
            self.no_target(from, env);
            return;
        };
        self.dispatch_at(owner, env);
    }

    /// Deliver through the process namespace. The name may map in several
    /// threads; the envelope is cloned per extra thread. Targets are
    /// rewritten to the named object's oix token unless the named object is
    /// the receiving thread itself.
    fn send_process_ns(&mut self, from: Oix, mut env: Envelope) {
        if env.target.as_str().starts_with('@') {
            self.send_oix(from, env);
            return;
        }
        let token = env.target.take_token();
        if token.is_empty() {
            debug!("message to empty process path discarded");
            self.no_target(from, env);
            return;
        }

        let key = v_str(&token);
        let mut local: Vec<(Oix, Envelope)> = Vec::new();
        let mut found = false;
        {
            let state = process::process();
            let mut hits = Vec::new();
            let mut slot = state.ns.find_first(&key);
            while let Some(s) = slot {
                if state.ns.key(s).compare(&key) != std::cmp::Ordering::Equal {
                    break;
                }
                hits.push(state.ns.value(s));
                slot = state.ns.next(s);
            }
            if !hits.is_empty() {
                found = true;
                let last = hits.len() - 1;
                for (i, entry) in hits.iter().enumerate() {
                    let mut one = if i == last {
                        std::mem::replace(&mut env, Envelope::new(Command(0)))
                    } else {
                        env.clone_for_fanout()
                    };
                    match state.threads.get(&entry.tree) {
                        Some(peer) => {
                            if entry.oix != peer.root {
                                one.target
                                    .prepend_token(&ObjRef::new(entry.oix, entry.ucnt).to_string());
                            }
                            // Queued while the lock is held: cross-thread
                            // ordering is the lock acquisition order.
                            if peer.tx.send(one).is_err() {
                                debug!("thread queue closed for process name {token:?}");
                            }
                        }
                        None if entry.tree == self.id() => {
                            local.push((entry.oix, one));
                        }
                        None => {
                            debug!("process name {token:?} maps into a tree with no thread");
                        }
                    }
                }
            }
        }

        if !found {
            debug_or_error(&env, "message failed: name not found in process namespace");
            self.no_target(from, env);
            return;
        }
        // Same-tree hits dispatch outside the lock.
        for (oix, one) in local {
            self.dispatch_at(oix, one);
        }
    }

    /// Deliver to an `@oix[_ucnt]` token: direct call within the same tree,
    /// queue on the owning thread otherwise.
    fn send_oix(&mut self, from: Oix, mut env: Envelope) {
        let Some((objref, consumed)) = ObjRef::parse(env.target.as_str()) else {
            debug_or_error(&env, "message failed: bad object index token");
            self.no_target(from, env);
            return;
        };

        enum OixPlan {
            Local,
            Queue(ThreadPeer, bool),
            Stale,
        }
        let plan = {
            let state = process::process();
            match state.handles.resolve(objref.oix, objref.ucnt) {
                None => OixPlan::Stale,
                Some(tree) if tree == self.id() => OixPlan::Local,
                Some(tree) => match state.threads.get(&tree) {
                    Some(peer) => {
                        let to_thread_itself = peer.root == objref.oix;
                        OixPlan::Queue(peer.clone(), to_thread_itself)
                    }
                    None => OixPlan::Stale,
                },
            }
        };

        match plan {
            OixPlan::Stale => {
                debug_or_error(&env, "message failed: target object has been deleted");
                self.no_target(from, env);
            }
            OixPlan::Local => {
                env.target.consume(consumed);
                if self.contains(objref.oix) {
                    self.dispatch_at(objref.oix, env);
                } else {
                    self.no_target(from, env);
                }
            }
            OixPlan::Queue(peer, to_thread_itself) => {
                if to_thread_itself {
                    env.target.consume(consumed);
                }
                if peer.tx.send(env).is_err() {
                    debug!("thread queue closed for oix target");
                }
            }
        }
    }

    /// Receive-side routing: consume the target until it is exhausted, then
    /// deliver.
    pub fn dispatch_at(&mut self, oix: Oix, mut env: Envelope) {
        let target = env.target.as_str();
        match target.as_bytes().first() {
            None => self.deliver(oix, env),
            Some(b'@') => {
                let Some((objref, consumed)) = ObjRef::parse(target) else {
                    debug_or_error(&env, "onmessage failed: bad object index token");
                    self.no_target(oix, env);
                    return;
                };
                let live = self
                    .node(objref.oix)
                    .is_some_and(|n| n.ucnt == objref.ucnt);
                if !live {
                    debug_or_error(&env, "onmessage failed: target object has been deleted");
                    self.no_target(oix, env);
                    return;
                }
                env.target.consume(consumed);
                self.dispatch_at(objref.oix, env);
            }
            Some(b'_') if target.starts_with("_p/") && env.command == Command::SET_PROPERTY => {
                env.target.skip(3);
                let prop = env.target.take_token();
                let Some(Content::Value(value)) = env.content else {
                    debug!("SET_PROPERTY without value content");
                    return;
                };
                if let Err(e) = self.set_property_by_name(oix, &prop, &value, None) {
                    debug!("SET_PROPERTY {prop:?} failed: {e}");
                }
            }
            _ => {
                // Named children, fanning out over every owner of the name.
                let token = env.target.take_token();
                let Some(ns_oix) = self.attachment(oix, oid::NAMESPACE) else {
                    debug_or_error(&env, "onmessage failed: target not found");
                    self.no_target(oix, env);
                    return;
                };
                let key = v_str(&token);
                let mut owners = Vec::new();
                let mut cur = self.ns_first(ns_oix, Some(&key));
                while let Some(name_oix) = cur {
                    if let Some(owner) = self.node(name_oix).and_then(|n| n.parent) {
                        owners.push(owner);
                    }
                    cur = self.ns_next(name_oix, true);
                }
                if owners.is_empty() {
                    debug_or_error(&env, "onmessage failed: target not found");
                    self.no_target(oix, env);
                    return;
                }
                let last = owners.len() - 1;
                for (i, owner) in owners.iter().enumerate() {
                    let one = if i == last {
                        std::mem::replace(&mut env, Envelope::new(Command(0)))
                    } else {
                        env.clone_for_fanout()
                    };
                    self.dispatch_at(*owner, one);
                }
            }
        }
    }

    /// The envelope reached its object. Built-in commands route to the
    /// binding machinery or the thread flag; everything else is offered to a
    /// custom behavior hook.
    fn deliver(&mut self, oix: Oix, env: Envelope) {
        if self
            .node(oix)
            .is_some_and(|n| matches!(n.payload, Payload::Binding(_)))
        {
            crate::binding::on_binding_message(self, oix, env);
            return;
        }

        match env.command {
            Command::BIND => crate::binding::srv_bind(self, oix, env),
            Command::UNBIND => crate::binding::unbind_at_object(self, oix, env),
            Command::EXIT_THREAD => {
                if oix == self.root() {
                    self.exit_requested = true;
                }
            }
            Command::SET_PROPERTY => {
                // Property value of the object itself.
                if let Some(Content::Value(value)) = env.content {
                    if let Err(e) = self.set_property(oix, crate::props::varp::VALUE, &value, None)
                    {
                        debug!("SET_PROPERTY failed: {e}");
                    }
                }
            }
            Command::TIMER => {}
            _ => {
                let handled = self
                    .with_taken_payload(oix, |tree, payload| match payload {
                        Payload::Custom(b) => {
                            let mut ctx = ObjCtx::new(tree, oix);
                            b.on_message(&mut ctx, &env)
                        }
                        _ => false,
                    })
                    .unwrap_or(false);
                if !handled && !env.flags.contains(MsgFlags::NO_ERRORS) {
                    debug!(
                        "onmessage: {} to class {} not processed",
                        env.command,
                        self.node(oix).map(|n| n.class_id).unwrap_or(0)
                    );
                }
            }
        }
    }

    /// Reply toward the failed envelope's source with NO_TARGET, carrying
    /// its context so the sender can correlate. Honors NO_REPLY.
    pub(crate) fn no_target(&mut self, from: Oix, mut env: Envelope) {
        if env.flags.contains(MsgFlags::NO_REPLY) {
            return;
        }
        if env.source.is_empty() {
            return;
        }
        let mut reply = Envelope::new(Command::NO_TARGET)
            .with_target(env.source.as_str())
            .with_source(env.target.as_str())
            // A failing failure reply must not echo back and forth.
            .with_flags(MsgFlags::NO_REPLY | MsgFlags::NO_ERRORS);
        reply.context = env.context.take();
        self.send(from, reply);
    }
}

fn debug_or_error(env: &Envelope, text: &str) {
    if env.flags.contains(MsgFlags::NO_ERRORS) {
        debug!("{text}");
    } else {
        error!("{text}");
    }
}
