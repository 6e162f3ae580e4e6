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

use thiserror::Error;

/// Failure kinds reported across the system. Success is `Ok(..)`; everything
/// here travels in the `Err` arm.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum Status {
    /// Unidentified failure.
    #[error("operation failed")]
    Failed,

    /// Properties are not supported for the class (class was never
    /// registered).
    #[error("class has no property support")]
    NoClassPropertySupport,

    /// Writing an object to a stream failed.
    #[error("writing object to stream failed")]
    WritingObjFailed,

    /// Reading an object from a stream failed.
    #[error("reading object from stream failed")]
    ReadingObjFailed,

    /// Mapping a name into a namespace failed (no such namespace).
    #[error("name mapping failed")]
    NameMappingFailed,

    /// The name is already mapped; remapping was skipped.
    #[error("name already mapped")]
    NameAlreadyMapped,

    /// The class stores no such simple property.
    #[error("no simple property with that number")]
    NoSimpleProperty,

    /// Reading a packed float from a stream failed.
    #[error("stream float error")]
    StreamFloatError,

    /// No new incoming connection was accepted.
    #[error("no new connection")]
    NoNewConnection,

    /// A flush marker brought the buffered whole-message count to zero;
    /// the reader should yield until more data arrives.
    #[error("no whole messages to read")]
    NoWholeMessagesToRead,

    /// No more data available from the stream.
    #[error("end of stream")]
    StreamEnd,
}
