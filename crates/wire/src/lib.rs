//! The typed wire format carrying values between worker VMs.
//!
//! This is a private codec between VMs of the same build, not a persistence
//! format: a tag byte per value, little-endian fixed-width scalars, and
//! length-prefixed strings and tables. Payloads live in ownership-
//! transferable arenas (`arena::TransferBuf`) so that the thread which
//! deserializes a message also frees it.

use arena::{TransferBuf, TransferWriter};

mod value;
pub use value::{OpaqueKind, Value};

/// Tables nested beyond this depth fail to serialize rather than recurse
/// without bound.
pub const MAX_DEPTH: usize = 100;

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_TABLE: u8 = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot serialize a {0} value across workers")]
    Unserializable(OpaqueKind),

    #[error("table nesting exceeds the serialization depth limit of {MAX_DEPTH}")]
    DepthExceeded,

    #[error("truncated message: needed {needed} more bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown wire tag {0:#04x}")]
    UnknownTag(u8),

    #[error("message has {0} undecoded trailing bytes")]
    TrailingBytes(usize),

    #[error("string payload is not valid UTF-8")]
    BadString(#[from] std::str::Utf8Error),
}

/// Serialize `value` into a fresh transferable arena.
pub fn serialize(value: &Value) -> Result<TransferBuf, Error> {
    let mut w = TransferWriter::new();
    write_value(&mut w, value, 0)?;
    Ok(w.finish())
}

/// Decode exactly one value from `bytes`. Trailing garbage is an error:
/// every queue message carries a single value.
pub fn deserialize(bytes: &[u8]) -> Result<Value, Error> {
    let mut r = Reader::new(bytes);
    let value = r.read_value(0)?;
    if r.remaining() != 0 {
        return Err(Error::TrailingBytes(r.remaining()));
    }
    Ok(value)
}

fn write_value(w: &mut TransferWriter, value: &Value, depth: usize) -> Result<(), Error> {
    match value {
        Value::Nil => w.push(TAG_NIL),
        Value::Bool(b) => {
            w.push(TAG_BOOL);
            w.push(*b as u8);
        }
        Value::Int(i) => {
            w.push(TAG_INT);
            w.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            w.push(TAG_FLOAT);
            w.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            w.push(TAG_STRING);
            w.extend_from_slice(&(s.len() as u32).to_le_bytes());
            w.extend_from_slice(s.as_bytes());
        }
        Value::Table(entries) => {
            if depth >= MAX_DEPTH {
                return Err(Error::DepthExceeded);
            }
            w.push(TAG_TABLE);
            w.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key, value) in entries {
                write_value(w, key, depth + 1)?;
                write_value(w, value, depth + 1)?;
            }
        }
        Value::Opaque(kind) => return Err(Error::Unserializable(*kind)),
    }
    Ok(())
}

/// Bounds-checked cursor over a serialized byte range.
pub struct Reader<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    pub fn new(bytes: &'b [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn read_value(&mut self, depth: usize) -> Result<Value, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthExceeded);
        }
        match self.read_u8()? {
            TAG_NIL => Ok(Value::Nil),
            TAG_BOOL => Ok(Value::Bool(self.read_u8()? != 0)),
            TAG_INT => Ok(Value::Int(i64::from_le_bytes(self.read_array()?))),
            TAG_FLOAT => Ok(Value::Float(f64::from_le_bytes(self.read_array()?))),
            TAG_STRING => {
                let len = u32::from_le_bytes(self.read_array()?) as usize;
                let bytes = self.read_bytes(len)?;
                Ok(Value::Str(std::str::from_utf8(bytes)?.to_owned()))
            }
            TAG_TABLE => {
                let count = u32::from_le_bytes(self.read_array()?) as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let key = self.read_value(depth + 1)?;
                    let value = self.read_value(depth + 1)?;
                    entries.push((key, value));
                }
                Ok(Value::Table(entries))
            }
            other => Err(Error::UnknownTag(other)),
        }
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let b = self.read_bytes(1)?;
        Ok(b[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let bytes = self.read_bytes(N)?;
        Ok(bytes.try_into().expect("read_bytes returns N bytes"))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'b [u8], Error> {
        if self.remaining() < len {
            return Err(Error::Truncated {
                needed: len - self.remaining(),
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(value: Value) -> Value {
        let buf = serialize(&value).unwrap();
        deserialize(buf.as_slice()).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        for value in [
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Float(3.5),
            Value::Float(f64::NEG_INFINITY),
            Value::Str(String::new()),
            Value::Str("snowman ☃".to_owned()),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn numbers_keep_their_type() {
        // An integer 1 and a float 1.0 are distinct values on the wire.
        assert_eq!(round_trip(Value::Int(1)), Value::Int(1));
        assert_eq!(round_trip(Value::Float(1.0)), Value::Float(1.0));
    }

    #[test]
    fn tables_round_trip_structurally() {
        let table = Value::Table(vec![
            (Value::Str("answer".into()), Value::Int(42)),
            (Value::Int(1), Value::Str("first".into())),
            (
                Value::Str("inner".into()),
                Value::Table(vec![(Value::Bool(true), Value::Float(0.5))]),
            ),
        ]);
        assert_eq!(round_trip(table.clone()), table);
    }

    #[test]
    fn depth_cap_is_enforced() {
        let mut value = Value::Int(0);
        for _ in 0..MAX_DEPTH + 1 {
            value = Value::Table(vec![(Value::Int(1), value)]);
        }
        assert!(matches!(serialize(&value), Err(Error::DepthExceeded)));

        // One level under the cap is fine.
        let mut value = Value::Int(0);
        for _ in 0..MAX_DEPTH - 1 {
            value = Value::Table(vec![(Value::Int(1), value)]);
        }
        assert!(serialize(&value).is_ok());
    }

    #[test]
    fn opaque_values_do_not_serialize() {
        let err = serialize(&Value::Opaque(OpaqueKind::Function)).unwrap_err();
        assert!(matches!(err, Error::Unserializable(OpaqueKind::Function)));
        assert_eq!(
            err.to_string(),
            "cannot serialize a function value across workers"
        );
    }

    #[test]
    fn truncated_and_malformed_input_is_rejected() {
        let buf = serialize(&Value::Str("hello".into())).unwrap();
        let bytes = buf.as_slice();
        for cut in 0..bytes.len() {
            assert!(
                deserialize(&bytes[..cut]).is_err(),
                "prefix of {cut} bytes must not decode"
            );
        }

        assert!(matches!(deserialize(&[0xAB]), Err(Error::UnknownTag(0xAB))));
        assert!(matches!(
            deserialize(&[TAG_NIL, TAG_NIL]),
            Err(Error::TrailingBytes(1))
        ));
    }
}
