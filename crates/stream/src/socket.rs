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

use crate::queue::Queue;
use arbor_common::Status;
use socket2::{Domain, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// A connected TCP stream in nonblocking mode, moving bytes between the
/// socket and queue buffers.
pub struct SocketStream {
    stream: TcpStream,
    peer: String,
}

impl SocketStream {
    /// Connect to `addr` ("host:port"), waiting at most `timeout`. The
    /// stream comes back in nonblocking mode with Nagle disabled, the way a
    /// connection thread drives it.
    pub fn connect(addr: &str, timeout: Duration) -> Result<SocketStream, Status> {
        let sockaddr = resolve(addr)?;
        let socket = Socket::new(Domain::for_address(sockaddr), Type::STREAM, None)
            .map_err(|_| Status::Failed)?;
        let sa = socket2::SockAddr::from(sockaddr);
        socket.connect_timeout(&sa, timeout).map_err(|e| {
            debug!("connect to {addr} failed: {e}");
            Status::Failed
        })?;
        let stream: TcpStream = socket.into();
        Self::setup(stream, addr.to_string())
    }

    fn setup(stream: TcpStream, peer: String) -> Result<SocketStream, Status> {
        stream.set_nonblocking(true).map_err(|_| Status::Failed)?;
        stream.set_nodelay(true).ok();
        Ok(SocketStream { stream, peer })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Pull whatever the socket has into the incoming queue. Returns the
    /// number of bytes moved; a closed peer reports `StreamEnd`, an error
    /// `Failed`.
    pub fn read_into(&mut self, q: &mut Queue) -> Result<usize, Status> {
        let mut total = 0;
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return if total > 0 {
                        // Deliver what arrived; the close surfaces next call.
                        Ok(total)
                    } else {
                        Err(Status::StreamEnd)
                    };
                }
                Ok(n) => {
                    q.write(&buf[..n]);
                    total += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("socket read from {} failed: {e}", self.peer);
                    return Err(Status::Failed);
                }
            }
        }
    }

    /// Push buffered outgoing bytes to the socket until the queue drains or
    /// the socket stops accepting. Returns bytes written.
    pub fn write_from(&mut self, q: &mut Queue) -> Result<usize, Status> {
        let mut total = 0;
        loop {
            let mut result: Result<usize, Status> = Ok(0);
            let moved = q.consume_front(|bytes| match self.stream.write(bytes) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
                Err(e) => {
                    debug!("socket write to {} failed: {e}", self.peer);
                    result = Err(Status::Failed);
                    0
                }
            });
            result?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    pub fn flush(&mut self) -> Result<(), Status> {
        self.stream.flush().map_err(|_| Status::Failed)
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, Status> {
    addr.to_socket_addrs()
        .map_err(|_| Status::Failed)?
        .next()
        .ok_or(Status::Failed)
}

/// Listening socket for an end point. Nonblocking; `accept` either hands
/// back a connected peer stream or reports that nothing is pending.
pub struct SocketListener {
    listener: TcpListener,
}

impl SocketListener {
    /// Bind with address reuse so an end point can come back on the same
    /// port right after going down.
    pub fn bind(addr: &str) -> Result<SocketListener, Status> {
        let sockaddr = resolve(addr)?;
        let socket = Socket::new(Domain::for_address(sockaddr), Type::STREAM, None)
            .map_err(|_| Status::Failed)?;
        socket.set_reuse_address(true).ok();
        let sa = socket2::SockAddr::from(sockaddr);
        socket.bind(&sa).map_err(|e| {
            debug!("bind {addr} failed: {e}");
            Status::Failed
        })?;
        socket.listen(128).map_err(|_| Status::Failed)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true).map_err(|_| Status::Failed)?;
        Ok(SocketListener { listener })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub fn accept(&self) -> Result<SocketStream, Status> {
        match self.listener.accept() {
            Ok((stream, peer)) => SocketStream::setup(stream, peer.to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Status::NoNewConnection),
            Err(e) => {
                debug!("accept failed: {e}");
                Err(Status::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueMode;

    #[test]
    fn loopback_round_trip() {
        let listener = SocketListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut client = SocketStream::connect(&addr, Duration::from_secs(2)).unwrap();
        let mut server = loop {
            match listener.accept() {
                Ok(s) => break s,
                Err(Status::NoNewConnection) => std::thread::yield_now(),
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let mut out = Queue::new(QueueMode::plain());
        out.write(b"over the wire");
        while !out.is_empty() {
            client.write_from(&mut out).unwrap();
        }

        let mut inq = Queue::new(QueueMode::plain());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while inq.bytes() < 13 {
            server.read_into(&mut inq).unwrap();
            assert!(std::time::Instant::now() < deadline, "timed out");
        }
        let mut buf = [0u8; 32];
        let n = inq.read(&mut buf);
        assert_eq!(&buf[..n], b"over the wire");
    }

    #[test]
    fn accept_without_peer_reports_no_new_connection() {
        let listener = SocketListener::bind("127.0.0.1:0").unwrap();
        assert!(matches!(listener.accept(), Err(Status::NoNewConnection)));
    }
}
