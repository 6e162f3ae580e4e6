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

//! A connection is a thread that shovels envelopes between the local
//! address space and one socket peer. Outbound envelopes are serialized
//! into an encoding queue and flushed once the message queue drains; inbound
//! bytes decode into envelopes gated by the flush counter. Binding traffic
//! passing through is memorized so bindings can be re-established when the
//! socket comes back.

use crate::command::Command;
use crate::envelope::{Envelope, MsgFlags};
use crate::object::Payload;
use crate::process;
use crate::thread::{ObjThread, ThreadHandle};
use ahash::AHashSet;
use arbor_common::{classid, Status};
use arbor_stream::{Ctrl, Queue, QueueMode, SocketStream};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct ConnConfig {
    /// Peer address, "host:port". Empty for accepted-mode connections.
    pub addr: String,
    /// Retry interval while the socket is down.
    pub reconnect: Duration,
    /// Idle interval after which a keepalive goes out.
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            addr: String::new(),
            reconnect: Duration::from_secs(3),
            keepalive: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl ConnConfig {
    pub fn to(addr: &str) -> Self {
        ConnConfig {
            addr: addr.to_string(),
            ..Default::default()
        }
    }
}

/// Poll granularity of the run loop when watching both the trigger and the
/// socket.
const TICK: Duration = Duration::from_millis(40);

pub struct Connection {
    thread: ObjThread,
    cfg: ConnConfig,
    stream: Option<SocketStream>,
    in_q: Queue,
    out_q: Queue,
    connected: bool,
    failed_once: bool,
    new_writes: bool,
    /// Accepted-mode connections die instead of reconnecting.
    delete_on_error: bool,
    /// Envelopes held until the socket first comes up.
    init_buffer: Vec<Envelope>,
    client_binds: AHashSet<String>,
    server_binds: AHashSet<String>,
    last_send: Instant,
    last_try: Option<Instant>,
}

impl Connection {
    fn new(cfg: ConnConfig) -> Connection {
        Connection {
            thread: ObjThread::with_root(classid::CONNECTION, Payload::Container),
            cfg,
            stream: None,
            in_q: Queue::new(QueueMode::decode_in()),
            out_q: Queue::new(QueueMode::encode_out()),
            connected: false,
            failed_once: false,
            new_writes: false,
            delete_on_error: false,
            init_buffer: Vec::new(),
            client_binds: AHashSet::new(),
            server_binds: AHashSet::new(),
            last_send: Instant::now(),
            last_try: None,
        }
    }

    /// Start a connecting (client-side) connection thread. `process_name`
    /// registers it in the process namespace so paths like
    /// `//name//remote/...` route through it.
    pub fn spawn(cfg: ConnConfig, process_name: Option<&str>) -> ThreadHandle {
        let mut conn = Connection::new(cfg);
        if let Some(name) = process_name {
            if let Err(e) = conn.thread.add_process_name(name) {
                warn!("connection name registration failed: {e}");
            }
        }
        conn.run_detached()
    }

    /// Start a connection thread over an already-accepted peer socket. It
    /// exits instead of reconnecting when the socket goes down.
    pub fn spawn_accepted(stream: SocketStream, process_name: Option<&str>) -> ThreadHandle {
        let mut conn = Connection::new(ConnConfig::default());
        if let Some(name) = process_name {
            if let Err(e) = conn.thread.add_process_name(name) {
                warn!("connection name registration failed: {e}");
            }
        }
        conn.delete_on_error = true;
        conn.stream = Some(stream);
        conn.on_connected();
        conn.run_detached()
    }

    fn run_detached(mut self) -> ThreadHandle {
        let addr = self.thread.addr();
        let tx = {
            let state = process::process();
            state
                .threads
                .get(&self.thread.tree.id())
                .map(|p| p.tx.clone())
                .expect("connection thread registered at construction")
        };
        let join = std::thread::spawn(move || self.run());
        ThreadHandle::new(join, addr, tx)
    }

    /// The connection run loop: reopen, drain the trigger queue, move
    /// socket bytes both ways, keep the peer alive.
    fn run(&mut self) {
        while !self.thread.exit_requested() {
            if self.stream.is_none() {
                if self.failed_once && self.delete_on_error {
                    break;
                }
                self.try_open();
            }

            if let Some(env) = self.thread.poll_queue(TICK) {
                let mut next = Some(env);
                while let Some(e) = next.take() {
                    self.handle_envelope(e);
                    next = self.thread.try_queue();
                }
                // The message queue went empty: flush what accumulated.
                if self.connected && self.new_writes && self.thread.queue_is_empty() {
                    self.flush_writes();
                }
            }

            self.pump_socket();

            if self.connected && self.last_send.elapsed() >= self.cfg.keepalive {
                self.out_q.write_ctrl(Ctrl::Keepalive);
                self.flush_writes();
            }
        }
        self.close();
    }

    /// One envelope off the thread queue: messages addressed at the
    /// connection itself are handled here, everything else goes to the peer.
    fn handle_envelope(&mut self, env: Envelope) {
        let target = env.target.as_str();
        let local = target.is_empty() || target.starts_with('_');
        if !local {
            if self.connected {
                self.monitor_binds(&env);
                if self.write_envelope(&env).is_err() {
                    self.close();
                }
            } else if !self.failed_once {
                self.init_buffer.push(env);
            } else {
                self.monitor_binds(&env);
                self.notarget(env);
            }
            return;
        }

        if target.is_empty() && env.command == Command::TIMER {
            // Periodic nudge from a timer collaborator: reopen or keep the
            // peer alive, same as the loop's own deadlines.
            if !self.connected {
                self.try_open();
            } else if self.last_send.elapsed() >= self.cfg.keepalive {
                self.out_q.write_ctrl(Ctrl::Keepalive);
                self.flush_writes();
            }
            return;
        }
        self.thread.dispatch(env);
    }

    fn write_envelope(&mut self, env: &Envelope) -> Result<(), Status> {
        env.write(&mut self.out_q)?;
        self.new_writes = true;
        Ok(())
    }

    fn flush_writes(&mut self) {
        self.out_q.write_ctrl(Ctrl::Flush);
        self.out_q.complete_last_write();
        if let Some(stream) = &mut self.stream {
            if stream.write_from(&mut self.out_q).is_err() {
                self.close();
                return;
            }
        }
        self.last_send = Instant::now();
        self.new_writes = false;
    }

    /// Read available socket bytes and route every whole envelope that the
    /// flush counter admits.
    fn pump_socket(&mut self) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        match stream.read_into(&mut self.in_q) {
            Ok(_) => {}
            Err(Status::StreamEnd) => {
                info!("peer closed connection");
                self.close();
                return;
            }
            Err(_) => {
                self.close();
                return;
            }
        }
        while self.in_q.flush_count() > 0 {
            match Envelope::read(&mut self.in_q) {
                Ok(env) => self.ingress(env),
                Err(Status::NoWholeMessagesToRead) => break,
                Err(e) => {
                    debug!("envelope read failed: {e}");
                    self.close();
                    return;
                }
            }
        }
    }

    /// An envelope arrived from the peer: make its target absolute again
    /// (`T1/srv` becomes `//T1/srv`, resolving in this process's namespace),
    /// extend its source with this connection so replies route back, and
    /// send it through normal routing.
    fn ingress(&mut self, mut env: Envelope) {
        env.target.prepend_token("/");
        if !env.flags.contains(MsgFlags::NO_REPLY) {
            env.source.prepend_token(&self.thread.addr());
        }
        env.flags |= MsgFlags::NO_NEW_SOURCE_OIX;
        let root = self.thread.root();
        self.thread.tree.send(root, env);
    }

    fn try_open(&mut self) {
        if self.cfg.addr.is_empty() {
            return;
        }
        if let Some(t) = self.last_try {
            if t.elapsed() < self.cfg.reconnect {
                return;
            }
        }
        self.last_try = Some(Instant::now());
        match SocketStream::connect(&self.cfg.addr, self.cfg.connect_timeout) {
            Ok(stream) => {
                info!("connected to {}", self.cfg.addr);
                self.stream = Some(stream);
                self.on_connected();
            }
            Err(_) => {
                debug!("connect to {} failed, retrying", self.cfg.addr);
            }
        }
    }

    /// The socket just came up: tell memorized client bindings they can
    /// rebind, then drain the init-send buffer in order.
    fn on_connected(&mut self) {
        let root = self.thread.root();
        let rebinds: Vec<String> = self.client_binds.iter().cloned().collect();
        for path in rebinds {
            let env = Envelope::new(Command::REBIND)
                .with_target(&path)
                .with_flags(MsgFlags::NO_ERRORS);
            self.thread.tree.send(root, env);
        }

        let buffered = std::mem::take(&mut self.init_buffer);
        for env in buffered {
            self.monitor_binds(&env);
            if self.write_envelope(&env).is_err() {
                self.close();
                return;
            }
        }
        self.connected = true;
        if self.new_writes {
            self.flush_writes();
        }
    }

    /// Drop the socket. An orderly close says goodbye with a disconnect
    /// control; either way the bindings hear about it.
    fn close(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if self.connected {
            self.out_q.write_ctrl(Ctrl::Disconnect);
            self.out_q.write_ctrl(Ctrl::Flush);
            self.out_q.complete_last_write();
            if let Some(stream) = &mut self.stream {
                stream.write_from(&mut self.out_q).ok();
            }
        }
        self.on_disconnected();
        self.stream = None;
        self.in_q = Queue::new(QueueMode::decode_in());
        self.out_q = Queue::new(QueueMode::encode_out());
        self.new_writes = false;
    }

    /// Bindings bound through a dead socket: client halves fall back to
    /// unused (keeping their remote path for the rebind), server halves are
    /// taken down.
    fn on_disconnected(&mut self) {
        let buffered = std::mem::take(&mut self.init_buffer);
        for env in buffered {
            self.monitor_binds(&env);
            self.notarget(env);
        }

        let root = self.thread.root();
        for path in self.client_binds.iter().cloned().collect::<Vec<_>>() {
            let env = Envelope::new(Command::SRV_UNBIND)
                .with_target(&path)
                .with_flags(MsgFlags::NO_ERRORS);
            self.thread.tree.send(root, env);
        }
        for path in self.server_binds.iter().cloned().collect::<Vec<_>>() {
            let env = Envelope::new(Command::UNBIND)
                .with_target(&path)
                .with_flags(MsgFlags::NO_ERRORS);
            self.thread.tree.send(root, env);
        }

        self.connected = false;
        self.failed_once = true;
    }

    /// Track binding traffic through this connection, keyed by the envelope
    /// source path. This is what makes rebind-on-reconnect possible.
    fn monitor_binds(&mut self, env: &Envelope) {
        let set = match env.command {
            Command::BIND | Command::UNBIND => &mut self.client_binds,
            Command::BIND_REPLY | Command::SRV_UNBIND => &mut self.server_binds,
            _ => return,
        };
        let source = env.source.as_str();
        if source.is_empty() {
            return;
        }
        match env.command {
            Command::BIND | Command::BIND_REPLY => {
                set.insert(source.to_string());
            }
            _ => {
                set.remove(source);
            }
        }
    }

    /// The peer is unreachable for good: bounce the envelope back as
    /// NO_TARGET so the sender can tell.
    fn notarget(&mut self, mut env: Envelope) {
        if env.flags.contains(MsgFlags::NO_REPLY) {
            return;
        }
        let root = self.thread.root();
        let mut reply = Envelope::new(Command::NO_TARGET)
            .with_target(env.source.as_str())
            .with_flags(MsgFlags::NO_REPLY);
        reply.context = env.context.take();
        self.thread.tree.send(root, reply);
    }
}
