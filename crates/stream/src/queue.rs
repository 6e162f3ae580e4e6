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

//! Queue buffers data, typically between envelope serialization and a
//! socket. Besides plain buffering it can encode the stream so that control
//! codes (begin/end of block, disconnect, flush, keepalive) travel in-band,
//! and it run-length-compresses repeated bytes on the fly.

use std::collections::VecDeque;

/// Escape byte. A data byte of this value is sent as the two byte sequence
/// ctrl, ctrl-in-data.
pub const CTRL_CHAR: u8 = 0xE9;

/// High three bits select the control code; zero there means the byte is a
/// repeat count.
const CTRLCH_MASK: u8 = 0xE0;
/// Low five bits carry a version (begin block) or a repeat count.
const COUNT_MASK: u8 = 0x1F;

const CTRLCH_BEGIN_BLOCK: u8 = 0x20;
const CTRLCH_END_BLOCK: u8 = 0x40;
const CTRLCH_DISCONNECT: u8 = 0x60;
const CTRLCH_FLUSH: u8 = 0x80;
const CTRLCH_KEEPALIVE: u8 = 0xA0;
const CTRLCH_IN_DATA: u8 = 0xC0;

/// Longest run one count byte can carry beyond the first occurrence.
const MAX_REPEAT: u8 = 31;

const BLOCK_SZ: usize = 512;

/// Control codes that can be written to, and surface from, an encoded queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ctrl {
    /// Begin an object block. Carries a 5-bit version.
    Begin(u8),
    End,
    Disconnect,
    Flush,
    Keepalive,
    /// An escaped control byte appeared in the data stream.
    CtrlInData,
}

impl Ctrl {
    fn code(self) -> u8 {
        match self {
            Ctrl::Begin(version) => CTRLCH_BEGIN_BLOCK | (version & COUNT_MASK),
            Ctrl::End => CTRLCH_END_BLOCK,
            Ctrl::Disconnect => CTRLCH_DISCONNECT,
            Ctrl::Flush => CTRLCH_FLUSH,
            Ctrl::Keepalive => CTRLCH_KEEPALIVE,
            Ctrl::CtrlInData => CTRLCH_IN_DATA,
        }
    }

    fn from_code(code: u8) -> Ctrl {
        match code & CTRLCH_MASK {
            CTRLCH_BEGIN_BLOCK => Ctrl::Begin(code & COUNT_MASK),
            CTRLCH_END_BLOCK => Ctrl::End,
            CTRLCH_DISCONNECT => Ctrl::Disconnect,
            CTRLCH_FLUSH => Ctrl::Flush,
            CTRLCH_KEEPALIVE => Ctrl::Keepalive,
            _ => Ctrl::CtrlInData,
        }
    }
}

/// One character read from the queue: either a byte of data or a control
/// code, kept distinct so callers can never confuse the two.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QChar {
    Data(u8),
    Ctrl(Ctrl),
    EndOfData,
}

/// Read and write behavior of a queue. The two sides are independent: an
/// outgoing socket queue encodes on write and passes through on read, an
/// incoming one does the reverse and counts flush markers as raw bytes come
/// in from the socket.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueMode {
    pub encode_on_write: bool,
    pub decode_on_read: bool,
    pub count_flushes_on_write: bool,
}

impl QueueMode {
    /// Envelope serialization into an outgoing socket.
    pub fn encode_out() -> Self {
        QueueMode {
            encode_on_write: true,
            decode_on_read: false,
            count_flushes_on_write: false,
        }
    }

    /// Raw socket bytes in, decoded envelope reads out.
    pub fn decode_in() -> Self {
        QueueMode {
            encode_on_write: false,
            decode_on_read: true,
            count_flushes_on_write: true,
        }
    }

    /// Plain pass-through both ways.
    pub fn plain() -> Self {
        QueueMode::default()
    }
}

struct Block {
    data: Box<[u8; BLOCK_SZ]>,
    head: usize,
    tail: usize,
}

impl Block {
    fn new() -> Self {
        Block {
            data: Box::new([0; BLOCK_SZ]),
            head: 0,
            tail: 0,
        }
    }
}

/// Decoder position in the control-code grammar.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RdState {
    Idle,
    /// Control byte seen, waiting for the code or count byte.
    SeenCtrl,
    /// Control byte plus count byte seen, waiting for the byte to repeat.
    SeenCount(u8),
}

pub struct Queue {
    blocks: VecDeque<Block>,
    mode: QueueMode,

    // Write-side lookahead for run length encoding.
    wr_prev: Option<u8>,
    wr_count: u8,

    // Read-side decoder state.
    rd_state: RdState,
    rd_repeat_char: u8,
    rd_repeat_count: u8,

    // Last raw byte of the previous plain write, for flush markers split
    // across writes.
    flushctrl_last: Option<u8>,
    flush_count: i32,

    bytes: usize,
}

impl Queue {
    pub fn new(mode: QueueMode) -> Self {
        Queue {
            blocks: VecDeque::new(),
            mode,
            wr_prev: None,
            wr_count: 0,
            rd_state: RdState::Idle,
            rd_repeat_char: 0,
            rd_repeat_count: 0,
            flushctrl_last: None,
            flush_count: 0,
            bytes: 0,
        }
    }

    /// Number of whole-message flush markers currently buffered.
    pub fn flush_count(&self) -> i32 {
        self.flush_count
    }

    /// Bytes currently buffered, the in-progress write lookahead included.
    pub fn bytes(&self) -> usize {
        let pending = match self.wr_prev {
            Some(_) => 1 + self.wr_count as usize,
            None => 0,
        };
        self.bytes + pending
    }

    pub fn is_empty(&self) -> bool {
        self.bytes() == 0
    }

    fn put(&mut self, c: u8) {
        let need_block = match self.blocks.back() {
            Some(b) => b.head == BLOCK_SZ,
            None => true,
        };
        if need_block {
            self.blocks.push_back(Block::new());
        }
        let b = self.blocks.back_mut().unwrap();
        b.data[b.head] = c;
        b.head += 1;
        self.bytes += 1;
    }

    fn take(&mut self) -> Option<u8> {
        loop {
            let b = self.blocks.front_mut()?;
            if b.tail < b.head {
                let c = b.data[b.tail];
                b.tail += 1;
                self.bytes -= 1;
                if b.tail == b.head && b.head == BLOCK_SZ {
                    self.blocks.pop_front();
                }
                return Some(c);
            }
            // Fully drained block.
            self.blocks.pop_front();
        }
    }

    /// Append data. Encoded or pass-through depending on the write mode.
    pub fn write(&mut self, buf: &[u8]) {
        if self.mode.encode_on_write {
            self.write_encoded(buf);
        } else {
            self.write_plain(buf);
        }
    }

    fn write_encoded(&mut self, buf: &[u8]) {
        for &c in buf {
            if Some(c) == self.wr_prev && self.wr_count < MAX_REPEAT {
                self.wr_count += 1;
                continue;
            }
            self.complete_last_write();
            if c == CTRL_CHAR {
                self.put(CTRL_CHAR);
                self.put(CTRLCH_IN_DATA);
            } else {
                self.wr_prev = Some(c);
            }
        }
    }

    fn write_plain(&mut self, buf: &[u8]) {
        if self.mode.count_flushes_on_write && !buf.is_empty() {
            // A flush marker may be split across two writes; the carried
            // last byte covers that seam.
            if self.flushctrl_last == Some(CTRL_CHAR) && buf[0] & CTRLCH_MASK == CTRLCH_FLUSH {
                self.flush_count += 1;
            }
            for w in buf.windows(2) {
                if w[0] == CTRL_CHAR && w[1] & CTRLCH_MASK == CTRLCH_FLUSH {
                    self.flush_count += 1;
                }
            }
            self.flushctrl_last = Some(buf[buf.len() - 1]);
        }
        for &c in buf {
            self.put(c);
        }
    }

    /// Flush the write lookahead into the buffer so every byte written so
    /// far is really stored.
    pub fn complete_last_write(&mut self) {
        let Some(prev) = self.wr_prev.take() else {
            return;
        };
        match self.wr_count {
            0 => self.put(prev),
            1 => {
                self.put(prev);
                self.put(prev);
            }
            n => {
                self.put(CTRL_CHAR);
                self.put(n);
                self.put(prev);
            }
        }
        self.wr_count = 0;
    }

    /// Write a control code. Only meaningful on an encoding queue.
    pub fn write_ctrl(&mut self, ctrl: Ctrl) {
        debug_assert!(self.mode.encode_on_write);
        self.complete_last_write();
        self.put(CTRL_CHAR);
        self.put(ctrl.code());
    }

    /// Read data bytes into `buf`, decoding if the read mode says so.
    /// Control codes other than escaped data bytes are skipped. Returns the
    /// number of bytes produced.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.complete_last_write();
        if !self.mode.decode_on_read {
            return self.read_plain(buf);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.next_decoded() {
                Some(QChar::Data(c)) => {
                    buf[n] = c;
                    n += 1;
                }
                Some(QChar::Ctrl(_)) => continue,
                _ => break,
            }
        }
        n
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.take() {
                Some(c) => {
                    buf[n] = c;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Read one character or control code.
    pub fn read_char(&mut self) -> QChar {
        self.complete_last_write();
        if !self.mode.decode_on_read {
            return match self.take() {
                Some(c) => QChar::Data(c),
                None => QChar::EndOfData,
            };
        }
        loop {
            match self.next_decoded() {
                Some(QChar::Ctrl(Ctrl::Keepalive)) => continue,
                Some(qc) => return qc,
                None => return QChar::EndOfData,
            }
        }
    }

    /// Decoder core: produce the next data byte or control code, or None at
    /// end of buffered data. Keepalives are surfaced here and filtered by
    /// the caller.
    fn next_decoded(&mut self) -> Option<QChar> {
        if self.rd_repeat_count > 0 {
            self.rd_repeat_count -= 1;
            return Some(QChar::Data(self.rd_repeat_char));
        }
        loop {
            let c = self.take()?;
            match self.rd_state {
                RdState::Idle => {
                    if c == CTRL_CHAR {
                        self.rd_state = RdState::SeenCtrl;
                        continue;
                    }
                    return Some(QChar::Data(c));
                }
                RdState::SeenCtrl => {
                    if c & CTRLCH_MASK == 0 {
                        // Repeat count; the repeated byte follows.
                        self.rd_state = RdState::SeenCount(c);
                        continue;
                    }
                    self.rd_state = RdState::Idle;
                    let ctrl = Ctrl::from_code(c);
                    match ctrl {
                        Ctrl::CtrlInData => {
                            self.rd_repeat_char = CTRL_CHAR;
                            self.rd_repeat_count = c & COUNT_MASK;
                            return Some(QChar::Ctrl(Ctrl::CtrlInData));
                        }
                        Ctrl::Flush => {
                            self.flush_count -= 1;
                            return Some(QChar::Ctrl(ctrl));
                        }
                        _ => return Some(QChar::Ctrl(ctrl)),
                    }
                }
                RdState::SeenCount(count) => {
                    self.rd_state = RdState::Idle;
                    self.rd_repeat_char = c;
                    self.rd_repeat_count = count;
                    return Some(QChar::Data(c));
                }
            }
        }
    }

    /// Hand the oldest stored bytes to `f` without decoding; `f` returns how
    /// many it consumed. Used to drain an encoded queue into a socket.
    pub fn consume_front<F: FnOnce(&[u8]) -> usize>(&mut self, f: F) -> usize {
        self.complete_last_write();
        loop {
            let Some(b) = self.blocks.front_mut() else {
                return 0;
            };
            if b.tail == b.head {
                self.blocks.pop_front();
                continue;
            }
            let consumed = f(&b.data[b.tail..b.head]);
            let consumed = consumed.min(b.head - b.tail);
            b.tail += consumed;
            self.bytes -= consumed;
            if b.tail == b.head {
                self.blocks.pop_front();
            }
            return consumed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode_decode(data: &[u8]) -> Vec<u8> {
        let mut wq = Queue::new(QueueMode::encode_out());
        wq.write(data);
        wq.complete_last_write();

        // Drain the encoded form out as raw bytes...
        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);

        // ...and push it through a decoding queue.
        let mut rq = Queue::new(QueueMode::decode_in());
        rq.write(&raw);
        let mut out = vec![0u8; data.len() + 16];
        let n = rq.read(&mut out);
        out.truncate(n);
        out
    }

    #[test]
    fn round_trip_arbitrary_bytes() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0],
            b"hello world".to_vec(),
            vec![CTRL_CHAR],
            vec![CTRL_CHAR, CTRL_CHAR, CTRL_CHAR],
            (0..=255u8).collect(),
            vec![7; 100],
            vec![1, 1, 2, 2, 2, 3, 3, 3, 3, CTRL_CHAR, 3, 3],
        ];
        for data in cases {
            assert_eq!(encode_decode(&data), data, "case {data:?}");
        }
    }

    #[test]
    fn run_lengths_one_through_upper_bound() {
        for len in 1..=33usize {
            let data = vec![b'A'; len];
            assert_eq!(encode_decode(&data), data, "run of {len}");
        }
    }

    #[test]
    fn rle_actually_compresses() {
        let mut q = Queue::new(QueueMode::encode_out());
        q.write(&[b'A'; 20]);
        q.complete_last_write();
        // ctrl + count + byte
        assert_eq!(q.bytes(), 3);
    }

    #[test]
    fn five_repeats_then_ctrl_byte() {
        let mut wq = Queue::new(QueueMode::encode_out());
        wq.write(&[b'A', b'A', b'A', b'A', b'A', CTRL_CHAR]);
        wq.complete_last_write();

        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);

        let mut rq = Queue::new(QueueMode::decode_in());
        rq.write(&raw);
        for _ in 0..5 {
            assert_eq!(rq.read_char(), QChar::Data(b'A'));
        }
        assert_eq!(rq.read_char(), QChar::Ctrl(Ctrl::CtrlInData));
        assert_eq!(rq.read_char(), QChar::EndOfData);
    }

    #[test]
    fn control_codes_surface_as_ctrl() {
        let mut wq = Queue::new(QueueMode::encode_out());
        wq.write(b"ab");
        wq.write_ctrl(Ctrl::Begin(3));
        wq.write(b"cd");
        wq.write_ctrl(Ctrl::End);
        wq.write_ctrl(Ctrl::Flush);
        wq.complete_last_write();

        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);

        let mut rq = Queue::new(QueueMode::decode_in());
        rq.write(&raw);
        assert_eq!(rq.flush_count(), 1);

        assert_eq!(rq.read_char(), QChar::Data(b'a'));
        assert_eq!(rq.read_char(), QChar::Data(b'b'));
        assert_eq!(rq.read_char(), QChar::Ctrl(Ctrl::Begin(3)));
        assert_eq!(rq.read_char(), QChar::Data(b'c'));
        assert_eq!(rq.read_char(), QChar::Data(b'd'));
        assert_eq!(rq.read_char(), QChar::Ctrl(Ctrl::End));
        assert_eq!(rq.read_char(), QChar::Ctrl(Ctrl::Flush));
        assert_eq!(rq.flush_count(), 0);
        assert_eq!(rq.read_char(), QChar::EndOfData);
    }

    #[test]
    fn keepalive_is_invisible_to_read_char() {
        let mut wq = Queue::new(QueueMode::encode_out());
        wq.write(b"x");
        wq.write_ctrl(Ctrl::Keepalive);
        wq.write(b"y");
        wq.complete_last_write();

        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);

        let mut rq = Queue::new(QueueMode::decode_in());
        rq.write(&raw);
        assert_eq!(rq.read_char(), QChar::Data(b'x'));
        assert_eq!(rq.read_char(), QChar::Data(b'y'));
        assert_eq!(rq.read_char(), QChar::EndOfData);
    }

    #[test]
    fn flush_count_across_split_writes() {
        let mut wq = Queue::new(QueueMode::encode_out());
        wq.write_ctrl(Ctrl::Flush);
        wq.write_ctrl(Ctrl::Flush);
        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);
        assert_eq!(raw.len(), 4);

        let mut rq = Queue::new(QueueMode::decode_in());
        // Split right between the ctrl byte and the flush code.
        rq.write(&raw[..1]);
        assert_eq!(rq.flush_count(), 0);
        rq.write(&raw[1..3]);
        assert_eq!(rq.flush_count(), 1);
        rq.write(&raw[3..]);
        assert_eq!(rq.flush_count(), 2);
    }

    #[test]
    fn bytes_includes_lookahead() {
        let mut q = Queue::new(QueueMode::encode_out());
        q.write(b"zz");
        // Both z's still sit in the lookahead pair.
        assert_eq!(q.bytes(), 2);
        q.complete_last_write();
        assert_eq!(q.bytes(), 2);
    }

    #[test]
    fn blocks_span_transparently() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let mut q = Queue::new(QueueMode::plain());
        q.write(&data);
        assert_eq!(q.bytes(), data.len());
        let mut out = vec![0u8; data.len()];
        let n = q.read(&mut out);
        assert_eq!(n, data.len());
        assert_eq!(out, data);
        assert_eq!(q.bytes(), 0);
    }

    #[test]
    fn consume_front_partial() {
        let mut q = Queue::new(QueueMode::plain());
        q.write(b"abcdef");
        let consumed = q.consume_front(|bytes| {
            assert_eq!(&bytes[..3], b"abc");
            3
        });
        assert_eq!(consumed, 3);
        let mut out = [0u8; 8];
        let n = q.read(&mut out);
        assert_eq!(&out[..n], b"def");
    }
}
