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

//! Packed values over a `Queue`: the glue between the codec in arbor-common
//! and the control-code stream in arbor-stream. Everything written here goes
//! through the queue's data path and so gets escaped and run-length encoded
//! like any other payload byte.

use arbor_common::{
    pack_double, pack_long, Status, FIRST_MORE_BIT, INTSER_MAX_BYTES, NEXT_MORE_BIT,
};
use arbor_stream::{QChar, Queue};
use arbor_var::{ObjRef, Var, VarType, Variant};

pub fn put_long(q: &mut Queue, x: i64) {
    let mut buf = Vec::with_capacity(INTSER_MAX_BYTES);
    pack_long(&mut buf, x);
    q.write(&buf);
}

pub fn put_double(q: &mut Queue, x: f64) -> Result<(), Status> {
    let mut buf = Vec::with_capacity(2 * INTSER_MAX_BYTES);
    pack_double(&mut buf, x)?;
    q.write(&buf);
    Ok(())
}

pub fn put_str(q: &mut Queue, s: &str) {
    put_long(q, s.len() as i64);
    q.write(s.as_bytes());
}

fn next_data_byte(q: &mut Queue) -> Result<u8, Status> {
    match q.read_char() {
        QChar::Data(b) => Ok(b),
        QChar::Ctrl(_) => Err(Status::ReadingObjFailed),
        QChar::EndOfData => Err(Status::StreamEnd),
    }
}

/// Read one packed integer byte-at-a-time off the queue.
pub fn get_long(q: &mut Queue) -> Result<i64, Status> {
    let mut buf = Vec::with_capacity(INTSER_MAX_BYTES);
    let first = next_data_byte(q)?;
    buf.push(first);
    let mut more = first & FIRST_MORE_BIT != 0;
    while more {
        let b = next_data_byte(q)?;
        buf.push(b);
        more = b & NEXT_MORE_BIT != 0;
    }
    arbor_common::unpack_long(&buf).map(|(v, _)| v)
}

pub fn get_double(q: &mut Queue) -> Result<f64, Status> {
    let m = get_long(q)?;
    if m == 0 {
        return Ok(0.0);
    }
    let e = get_long(q).map_err(|_| Status::StreamFloatError)?;
    let e = i32::try_from(e).map_err(|_| Status::StreamFloatError)?;
    // Round-trip through the packed form to reuse the exact scaling rules.
    let mut bytes = Vec::with_capacity(2 * INTSER_MAX_BYTES);
    pack_long(&mut bytes, m);
    pack_long(&mut bytes, e as i64);
    arbor_common::unpack_double(&bytes).map(|(v, _)| v)
}

pub fn get_str(q: &mut Queue) -> Result<String, Status> {
    let n = get_long(q)?;
    let n = usize::try_from(n).map_err(|_| Status::ReadingObjFailed)?;
    let mut bytes = vec![0u8; n];
    let got = q.read(&mut bytes);
    if got != n {
        return Err(Status::StreamEnd);
    }
    String::from_utf8(bytes).map_err(|_| Status::ReadingObjFailed)
}

/// Serialize a value: type code, then the type-specific payload. Pointer
/// tokens are process-local and travel as undefined.
pub fn put_var(q: &mut Queue, v: &Var) -> Result<(), Status> {
    match v.variant() {
        Variant::Undefined | Variant::Ptr(_) => {
            put_long(q, VarType::Undefined as i64);
        }
        Variant::Long(x) => {
            put_long(q, VarType::Long as i64);
            put_long(q, *x);
        }
        Variant::Double { value, digs } => {
            put_long(q, VarType::Double as i64);
            put_long(q, *digs as i64);
            put_double(q, *value)?;
        }
        Variant::Str(s) => {
            put_long(q, VarType::Str as i64);
            put_str(q, s.as_str());
        }
        Variant::Obj(o) => {
            put_long(q, VarType::Obj as i64);
            put_long(q, o.oix as i64);
            put_long(q, o.ucnt as i64);
        }
    }
    Ok(())
}

pub fn get_var(q: &mut Queue) -> Result<Var, Status> {
    let code = get_long(q)?;
    let code = u8::try_from(code)
        .ok()
        .and_then(VarType::from_repr)
        .ok_or(Status::ReadingObjFailed)?;
    let mut v = Var::new();
    match code {
        VarType::Undefined | VarType::Ptr => {}
        VarType::Long => v.set_long(get_long(q)?),
        VarType::Double => {
            let digs = get_long(q)?;
            v.set_double(get_double(q)?);
            v.set_digs(digs.clamp(0, arbor_var::MAX_DIGS as i64) as u8);
        }
        VarType::Str => v.set_str(&get_str(q)?),
        VarType::Obj => {
            let oix = get_long(q)?;
            let ucnt = get_long(q)?;
            v.set_obj(ObjRef::new(
                u32::try_from(oix).map_err(|_| Status::ReadingObjFailed)?,
                u32::try_from(ucnt).map_err(|_| Status::ReadingObjFailed)?,
            ));
        }
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_stream::QueueMode;
    use arbor_var::{v_double, v_long, v_str};
    use pretty_assertions::assert_eq;

    fn pipe(f: impl FnOnce(&mut Queue)) -> Queue {
        // Encode through one queue, carry raw bytes into a decoding one, the
        // way bytes travel over a socket.
        let mut wq = Queue::new(QueueMode::encode_out());
        f(&mut wq);
        wq.complete_last_write();
        let mut raw = vec![0u8; wq.bytes()];
        let n = wq.read(&mut raw);
        raw.truncate(n);
        let mut rq = Queue::new(QueueMode::decode_in());
        rq.write(&raw);
        rq
    }

    #[test]
    fn longs_and_strings_round_trip() {
        let mut q = pipe(|q| {
            put_long(q, -123456789);
            put_str(q, "name/with/slashes");
            put_long(q, 0);
        });
        assert_eq!(get_long(&mut q).unwrap(), -123456789);
        assert_eq!(get_str(&mut q).unwrap(), "name/with/slashes");
        assert_eq!(get_long(&mut q).unwrap(), 0);
    }

    #[test]
    fn vars_round_trip() {
        let mut dv = v_double(1.25);
        dv.set_digs(5);
        let cases = vec![
            arbor_var::v_empty(),
            v_long(99),
            dv,
            v_str("text"),
            arbor_var::v_obj(ObjRef::new(12, 34)),
        ];
        for v in cases {
            let mut q = pipe(|q| put_var(q, &v).unwrap());
            let back = get_var(&mut q).unwrap();
            assert_eq!(back, v);
            assert_eq!(back.digs(), v.digs());
        }
    }

    #[test]
    fn ptr_travels_as_undefined() {
        let mut v = Var::new();
        v.set_ptr(0xdead);
        let mut q = pipe(|q| put_var(q, &v).unwrap());
        let back = get_var(&mut q).unwrap();
        assert!(back.is_empty());
    }
}
