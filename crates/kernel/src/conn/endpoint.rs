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

use crate::conn::Connection;
use crate::object::Payload;
use crate::process;
use crate::thread::{ObjThread, ThreadHandle};
use arbor_common::{classid, Status};
use arbor_stream::SocketListener;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

const TICK: Duration = Duration::from_millis(40);

/// A listening end point: accepts TCP peers and starts an accepted-mode
/// connection thread for each. Going down takes the accepted connections
/// with it.
pub struct EndPoint {
    thread: ObjThread,
    listener: SocketListener,
    accepted: Vec<ThreadHandle>,
}

impl EndPoint {
    /// Bind and start the accept loop. Returns the thread handle and the
    /// actually bound address (useful with port 0).
    pub fn spawn(addr: &str, process_name: Option<&str>) -> Result<(ThreadHandle, SocketAddr), Status> {
        let listener = SocketListener::bind(addr)?;
        let bound = listener.local_addr().ok_or(Status::Failed)?;

        let mut thread = ObjThread::with_root(classid::ENDPOINT, Payload::Container);
        if let Some(name) = process_name {
            thread.add_process_name(name)?;
        }
        let mut ep = EndPoint {
            thread,
            listener,
            accepted: Vec::new(),
        };

        let handle_addr = ep.thread.addr();
        let tx = {
            let state = process::process();
            state
                .threads
                .get(&ep.thread.tree.id())
                .map(|p| p.tx.clone())
                .expect("endpoint thread registered at construction")
        };
        let join = std::thread::spawn(move || ep.run());
        info!("end point listening on {bound}");
        Ok((ThreadHandle::new(join, handle_addr, tx), bound))
    }

    fn run(&mut self) {
        while !self.thread.exit_requested() {
            if let Some(env) = self.thread.poll_queue(TICK) {
                self.thread.dispatch(env);
            }
            match self.listener.accept() {
                Ok(stream) => {
                    info!("accepted connection from {}", stream.peer());
                    self.accepted
                        .push(Connection::spawn_accepted(stream, None));
                }
                Err(Status::NoNewConnection) => {}
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
        for conn in self.accepted.drain(..) {
            conn.terminate();
        }
    }
}
