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

//! The message unit: command, flags, a consumable target path, a growable
//! source path, and optional content/context payloads. Also the wire codec
//! that moves envelopes through an encoded queue.

use crate::command::Command;
use crate::path::Path;
use crate::set::ValueSet;
use crate::wire;
use arbor_common::{classid, Status};
use arbor_stream::{Ctrl, QChar, Queue};
use arbor_var::Var;
use bitflags::bitflags;

/// Wire format version written in the begin-block control.
const ENVELOPE_VERSION: u8 = 0;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct MsgFlags: u32 {
        /// Failures are silent; no NO_TARGET replies, and no source is
        /// serialized.
        const NO_REPLY = 0x01;
        /// Downgrade resolution failures from error to debug logging.
        const NO_ERRORS = 0x02;
        /// Path already resolved (set on envelopes read from a connection).
        const NO_RESOLVE = 0x04;
        /// The envelope crossed a thread boundary on its way here.
        const INTERTHREAD = 0x08;
        /// Source already carries the sending object's oix token.
        const NO_NEW_SOURCE_OIX = 0x10;
        /// Serialized envelope carries a content object.
        const HAS_CONTENT = 0x20;
        /// Serialized envelope carries a context object.
        const HAS_CONTEXT = 0x40;
        /// The sender is done with the envelope; a queueing thread may take
        /// it instead of cloning.
        const CAN_BE_ADOPTED = 0x80;
    }
}

impl MsgFlags {
    /// The only sender flags that travel across a connection.
    const PASS_MASK: MsgFlags = MsgFlags::NO_REPLY.union(MsgFlags::NO_ERRORS);
}

/// Payload carried in an envelope's content or context slot.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    Value(Var),
    Set(ValueSet),
}

impl Content {
    pub fn as_value(&self) -> Option<&Var> {
        match self {
            Content::Value(v) => Some(v),
            Content::Set(_) => None,
        }
    }

    pub fn as_set(&self) -> Option<&ValueSet> {
        match self {
            Content::Set(s) => Some(s),
            Content::Value(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Envelope {
    pub command: Command,
    pub flags: MsgFlags,
    pub target: Path,
    pub source: Path,
    pub content: Option<Content>,
    pub context: Option<Content>,
}

impl Envelope {
    pub fn new(command: Command) -> Self {
        Envelope {
            command,
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target.set(target);
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source.set(source);
        self
    }

    pub fn with_flags(mut self, flags: MsgFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_value(self, v: Var) -> Self {
        self.with_content(Content::Value(v))
    }

    pub fn with_context(mut self, context: Content) -> Self {
        self.context = Some(context);
        self
    }

    /// Serialize onto an encoded queue: begin block, command, passed flags,
    /// target, source unless replies are off, content and context objects,
    /// end block.
    pub fn write(&self, q: &mut Queue) -> Result<(), Status> {
        q.write_ctrl(Ctrl::Begin(ENVELOPE_VERSION));
        wire::put_long(q, self.command.0 as i64);

        let mut flags = self.flags & MsgFlags::PASS_MASK;
        if self.content.is_some() {
            flags |= MsgFlags::HAS_CONTENT;
        }
        if self.context.is_some() {
            flags |= MsgFlags::HAS_CONTEXT;
        }
        wire::put_long(q, flags.bits() as i64);

        wire::put_str(q, self.target.as_str());
        if !self.flags.contains(MsgFlags::NO_REPLY) {
            wire::put_str(q, self.source.as_str());
        }
        if let Some(content) = &self.content {
            write_content(q, content)?;
        }
        if let Some(context) = &self.context {
            write_content(q, context)?;
        }
        q.write_ctrl(Ctrl::End);
        Ok(())
    }

    /// Read one envelope off a decoding queue. A flush marker in front of
    /// the version tag drops the buffered whole-message count; when that
    /// count hits zero the reader yields with `NoWholeMessagesToRead` so the
    /// socket loop can wait for more bytes.
    pub fn read(q: &mut Queue) -> Result<Envelope, Status> {
        let mut c = q.read_char();
        if c == QChar::Ctrl(Ctrl::Flush) {
            if q.flush_count() <= 0 {
                return Err(Status::NoWholeMessagesToRead);
            }
            c = q.read_char();
        }
        match c {
            QChar::Ctrl(Ctrl::Begin(ENVELOPE_VERSION)) => {}
            QChar::Ctrl(Ctrl::Disconnect) => return Err(Status::StreamEnd),
            QChar::EndOfData => return Err(Status::NoWholeMessagesToRead),
            _ => return Err(Status::ReadingObjFailed),
        }

        let command = Command(wire::get_long(q)? as i32);
        let raw_flags = wire::get_long(q)? as u32;
        let wire_flags = MsgFlags::from_bits_truncate(raw_flags);
        let mut env = Envelope::new(command);
        env.flags = (wire_flags & MsgFlags::PASS_MASK) | MsgFlags::NO_RESOLVE;

        env.target.set(&wire::get_str(q)?);
        if !env.flags.contains(MsgFlags::NO_REPLY) {
            env.source.set(&wire::get_str(q)?);
        }
        if wire_flags.contains(MsgFlags::HAS_CONTENT) {
            env.content = Some(read_content(q)?);
        }
        if wire_flags.contains(MsgFlags::HAS_CONTEXT) {
            env.context = Some(read_content(q)?);
        }
        match q.read_char() {
            QChar::Ctrl(Ctrl::End) => Ok(env),
            _ => Err(Status::ReadingObjFailed),
        }
    }

    /// Copy for fan-out delivery.
    pub fn clone_for_fanout(&self) -> Envelope {
        Envelope {
            command: self.command,
            flags: self.flags,
            target: self.target.clone(),
            source: self.source.clone(),
            content: self.content.clone(),
            context: self.context.clone(),
        }
    }
}

fn write_content(q: &mut Queue, content: &Content) -> Result<(), Status> {
    q.write_ctrl(Ctrl::Begin(0));
    match content {
        Content::Value(v) => {
            wire::put_long(q, classid::VARIABLE as i64);
            wire::put_var(q, v)?;
        }
        Content::Set(s) => {
            wire::put_long(q, classid::SET as i64);
            wire::put_long(q, s.len() as i64);
            for (id, v) in s.iter() {
                wire::put_long(q, id as i64);
                wire::put_var(q, v)?;
            }
        }
    }
    q.write_ctrl(Ctrl::End);
    Ok(())
}

fn read_content(q: &mut Queue) -> Result<Content, Status> {
    match q.read_char() {
        QChar::Ctrl(Ctrl::Begin(_)) => {}
        _ => return Err(Status::ReadingObjFailed),
    }
    let cls = wire::get_long(q)? as i32;
    let content = match cls {
        classid::VARIABLE | classid::NAME => Content::Value(wire::get_var(q)?),
        classid::SET => {
            let count = wire::get_long(q)?;
            let mut set = ValueSet::new();
            for _ in 0..count {
                let id = wire::get_long(q)? as i32;
                set.set(id, Some(&wire::get_var(q)?));
            }
            Content::Set(set)
        }
        other => {
            tracing::debug!("unsupported content class {other} in envelope");
            return Err(Status::ReadingObjFailed);
        }
    };
    match q.read_char() {
        QChar::Ctrl(Ctrl::End) => Ok(content),
        _ => Err(Status::ReadingObjFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_stream::QueueMode;
    use arbor_var::{v_double, v_long};
    use pretty_assertions::assert_eq;

    fn over_the_wire(envelopes: &[Envelope]) -> Queue {
        let mut wq = Queue::new(QueueMode::encode_out());
        for env in envelopes {
            env.write(&mut wq).unwrap();
            wq.write_ctrl(Ctrl::Flush);
        }
        wq.complete_last_write();
        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);

        let mut rq = Queue::new(QueueMode::decode_in());
        rq.write(&raw);
        rq
    }

    #[test]
    fn round_trip_with_content_and_context() {
        let env = Envelope::new(Command::FWRD)
            .with_target("T1/A/_p/temp")
            .with_source("@12_3")
            .with_value(v_double(30.0));

        let mut rq = over_the_wire(std::slice::from_ref(&env));
        assert_eq!(rq.flush_count(), 1);
        let back = Envelope::read(&mut rq).unwrap();

        assert_eq!(back.command, Command::FWRD);
        assert_eq!(back.target.as_str(), "T1/A/_p/temp");
        assert_eq!(back.source.as_str(), "@12_3");
        assert_eq!(back.content, Some(Content::Value(v_double(30.0))));
        assert!(back.context.is_none());
        assert!(back.flags.contains(MsgFlags::NO_RESOLVE));
    }

    #[test]
    fn no_reply_omits_source() {
        let env = Envelope::new(Command::SET_PROPERTY)
            .with_target("x")
            .with_source("should/not/travel")
            .with_flags(MsgFlags::NO_REPLY)
            .with_value(v_long(1));

        let mut rq = over_the_wire(std::slice::from_ref(&env));
        let back = Envelope::read(&mut rq).unwrap();
        assert!(back.source.is_empty());
        assert!(back.flags.contains(MsgFlags::NO_REPLY));
    }

    #[test]
    fn set_content_round_trips() {
        let mut params = ValueSet::new();
        params.set_long(1, 0x5);
        params.set_str(2, "temp");
        params.set(3, Some(&v_double(20.0)));

        let env = Envelope::new(Command::BIND)
            .with_target("srv")
            .with_content(Content::Set(params.clone()));
        let mut rq = over_the_wire(std::slice::from_ref(&env));
        let back = Envelope::read(&mut rq).unwrap();
        assert_eq!(back.content, Some(Content::Set(params)));
    }

    #[test]
    fn reader_yields_without_whole_message() {
        // Flush marker with no following envelope: the flush count falls to
        // zero and the reader reports there is nothing whole to read.
        let mut wq = Queue::new(QueueMode::encode_out());
        wq.write_ctrl(Ctrl::Flush);
        wq.complete_last_write();
        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);
        let mut rq = Queue::new(QueueMode::decode_in());
        rq.write(&raw);

        assert_eq!(
            Envelope::read(&mut rq).unwrap_err(),
            Status::NoWholeMessagesToRead
        );
    }

    #[test]
    fn several_envelopes_in_sequence() {
        let envs = vec![
            Envelope::new(Command::ACK).with_target("a").with_source("b"),
            Envelope::new(Command::TIMER)
                .with_target("c")
                .with_flags(MsgFlags::NO_REPLY),
        ];
        let mut rq = over_the_wire(&envs);
        assert_eq!(rq.flush_count(), 2);

        let first = Envelope::read(&mut rq).unwrap();
        assert_eq!(first.command, Command::ACK);
        // The flush marker between the envelopes is consumed in front of the
        // second one.
        let second = Envelope::read(&mut rq).unwrap();
        assert_eq!(second.command, Command::TIMER);
        assert_eq!(
            Envelope::read(&mut rq).unwrap_err(),
            Status::NoWholeMessagesToRead
        );
    }
}
