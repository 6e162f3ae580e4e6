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

use std::fmt::{Display, Formatter};

/// Envelope command code. The framework commands are fixed numbers below
/// `USER_BASE`; applications put their own codes above it. Numbers are part
/// of the wire format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Command(pub i32);

impl Command {
    /// Reply: the addressed target could not be resolved.
    pub const NO_TARGET: Command = Command(1);
    /// Periodic tick from the timer collaborator.
    pub const TIMER: Command = Command(5);
    /// Ask a thread to leave its run loop.
    pub const EXIT_THREAD: Command = Command(9);

    pub const BIND: Command = Command(10);
    pub const BIND_REPLY: Command = Command(11);
    pub const UNBIND: Command = Command(12);
    pub const SRV_UNBIND: Command = Command(13);
    pub const REBIND: Command = Command(14);
    pub const FWRD: Command = Command(15);
    pub const ACK: Command = Command(16);

    /// Set a property on a remote object, fire and forget.
    pub const SET_PROPERTY: Command = Command(20);

    /// First command code free for applications.
    pub const USER_BASE: Command = Command(64);
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Command::NO_TARGET => "NO_TARGET",
            Command::TIMER => "TIMER",
            Command::EXIT_THREAD => "EXIT_THREAD",
            Command::BIND => "BIND",
            Command::BIND_REPLY => "BIND_REPLY",
            Command::UNBIND => "UNBIND",
            Command::SRV_UNBIND => "SRV_UNBIND",
            Command::REBIND => "REBIND",
            Command::FWRD => "FWRD",
            Command::ACK => "ACK",
            Command::SET_PROPERTY => "SET_PROPERTY",
            Command(n) => return write!(f, "CMD({n})"),
        };
        f.write_str(name)
    }
}
