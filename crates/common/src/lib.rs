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

//! Definitions shared by every arbor crate: status codes, object and class
//! identifiers, object flags and the packed integer/float codec all
//! serialization is built on.

mod defs;
mod intser;
mod status;

pub use defs::{classid, oid, ClassId, ObjFlags, Oid};
pub use intser::{
    pack_double, pack_long, unpack_double, unpack_long, PackReader, PackWriter,
    FIRST_MORE_BIT, INTSER_MAX_BYTES, NEXT_MORE_BIT,
};
pub use status::Status;
