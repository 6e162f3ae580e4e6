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

//! Threads. Each `ObjThread` owns one object tree and one envelope queue;
//! the channel doubles as the trigger event. Within a thread message
//! handling is strictly sequential: `alive` drains the queue and runs every
//! handler to completion before the next envelope.

use crate::command::Command;
use crate::envelope::{Envelope, MsgFlags};
use crate::name::NameFlags;
use crate::object::{ObjectBehavior, Payload};
use crate::process::{self, ThreadPeer};
use crate::tree::Tree;
use arbor_common::{classid, ClassId, Status};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// How `alive` waits for the trigger.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AliveWait {
    /// Block until a message arrives.
    WaitForEvent,
    /// Drain whatever is queued and return.
    ReturnImmediately,
}

pub struct ObjThread {
    pub tree: Tree,
    rx: flume::Receiver<Envelope>,
}

impl ObjThread {
    /// A plain thread whose root object is a container with a thread-local
    /// namespace.
    pub fn new() -> ObjThread {
        Self::with_root(classid::THREAD, Payload::Container)
    }

    /// A thread whose root object is a user class; messages with an
    /// exhausted target reach its `on_message`.
    pub fn with_behavior(class_id: ClassId, behavior: Box<dyn ObjectBehavior>) -> ObjThread {
        Self::with_root(class_id, Payload::Custom(behavior))
    }

    pub(crate) fn with_root(class_id: ClassId, payload: Payload) -> ObjThread {
        let mut tree = Tree::new(class_id, payload);
        let root = tree.root();
        tree.create_namespace(root, None)
            .expect("thread namespace on fresh root");

        let (tx, rx) = flume::unbounded();
        {
            let mut state = process::process();
            state.threads.insert(tree.id(), ThreadPeer { tx, root });
        }
        ObjThread { tree, rx }
    }

    pub fn root(&self) -> crate::handles::Oix {
        self.tree.root()
    }

    /// The thread's unique process-wide address, its root's oix token.
    pub fn addr(&self) -> String {
        self.tree.oix_token(self.tree.root())
    }

    /// Register the thread under a name in the process namespace.
    pub fn add_process_name(&mut self, name: &str) -> Result<(), Status> {
        let root = self.tree.root();
        self.tree
            .add_name(root, name, NameFlags::PROCESS_NS, None)
            .map(|_| ())
    }

    /// Drain the queue: adopt each envelope into this thread (marking it
    /// interthread), route it, and free it. With `WaitForEvent` the call
    /// blocks on the trigger until something arrives.
    pub fn alive(&mut self, wait: AliveWait) {
        let first = match wait {
            AliveWait::WaitForEvent => self.rx.recv().ok(),
            AliveWait::ReturnImmediately => self.rx.try_recv().ok(),
        };
        let Some(mut env) = first else {
            return;
        };
        loop {
            self.dispatch(env);
            match self.rx.try_recv() {
                Ok(next) => env = next,
                Err(_) => break,
            }
        }
    }

    /// Route one queued envelope into the tree.
    pub fn dispatch(&mut self, mut env: Envelope) {
        env.flags |= MsgFlags::INTERTHREAD;
        let root = self.tree.root();
        self.tree.dispatch_at(root, env);
    }

    /// Wait up to `timeout` for one queued envelope. Used by run loops that
    /// watch other event sources besides the trigger.
    pub fn poll_queue(&self, timeout: Duration) -> Option<Envelope> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_queue(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn exit_requested(&self) -> bool {
        self.tree.exit_requested
    }

    /// The run loop: block on the trigger, drain, repeat, until EXIT_THREAD.
    pub fn run(&mut self) {
        while !self.exit_requested() {
            self.alive(AliveWait::WaitForEvent);
        }
        debug!("thread {} leaving run loop", self.addr());
    }

    /// Move onto an OS thread and run. The handle joins and addresses the
    /// thread from outside.
    pub fn spawn(mut self) -> ThreadHandle {
        let addr = self.addr();
        let tx = {
            let state = process::process();
            state
                .threads
                .get(&self.tree.id())
                .map(|p| p.tx.clone())
                .expect("thread registered at construction")
        };
        let join = std::thread::spawn(move || {
            self.run();
        });
        ThreadHandle { join, addr, tx }
    }
}

impl Default for ObjThread {
    fn default() -> Self {
        ObjThread::new()
    }
}

/// Join handle plus the unique name other threads use to address the thread.
pub struct ThreadHandle {
    join: JoinHandle<()>,
    addr: String,
    tx: flume::Sender<Envelope>,
}

impl ThreadHandle {
    pub(crate) fn new(join: JoinHandle<()>, addr: String, tx: flume::Sender<Envelope>) -> Self {
        ThreadHandle { join, addr, tx }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Ask the thread to leave its run loop after the current message.
    pub fn request_exit(&self) {
        let env = Envelope::new(Command::EXIT_THREAD).with_flags(MsgFlags::NO_REPLY);
        if self.tx.send(env).is_err() {
            debug!("exit request to finished thread {}", self.addr);
        }
    }

    pub fn join(self) {
        if self.join.join().is_err() {
            debug!("thread {} panicked", self.addr);
        }
    }

    /// Request exit and wait for the thread to finish.
    pub fn terminate(self) {
        self.request_exit();
        self.join();
    }
}
