//! Canonical wire serialization for consensus objects.
//!
//! Every chain object has exactly one byte representation: integers are
//! big-endian at their declared width, sequences are length-prefixed (8-byte
//! lengths inside block and transaction bodies, 2-byte lengths in peer
//! messages), and body elements appear in strict hash order. Deserialization
//! rejects trailing bytes, oversized sequences, and non-canonical ordering so
//! that `deserialize(serialize(x)) == x` and re-serialization is byte-equal.

use thiserror::Error;

/// Hard cap on 8-byte length prefixes inside bodies. Anything larger is a
/// crafted length, not a real sequence.
pub const MAX_SEQUENCE_LEN: u64 = 1_000_000;

/// Errors from canonical serialization.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SerError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("{0} trailing bytes after deserialization")]
    TrailingBytes(usize),
    #[error("sequence length {got} exceeds limit {max}")]
    LimitExceeded { got: u64, max: u64 },
    #[error("elements out of order or duplicated")]
    NotCanonical,
    #[error("invalid encoding: {0}")]
    Corrupted(&'static str),
}

/// Objects that can write themselves canonically.
pub trait Writeable {
    fn write(&self, writer: &mut Writer);
}

/// Objects that can read themselves canonically.
pub trait Readable: Sized {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError>;
}

/// An append-only byte sink producing the canonical encoding.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Raw bytes with no length prefix; the type must imply the width.
    pub fn write_fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes behind an 8-byte length prefix (body sequences).
    pub fn write_bytes_long(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.write_fixed(bytes);
    }

    /// Bytes behind a 2-byte length prefix (peer messages).
    pub fn write_bytes_short(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.write_u16(bytes.len() as u16);
        self.write_fixed(bytes);
    }
}

/// A bounds-checked cursor over the canonical encoding.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SerError> {
        if self.remaining() < n {
            return Err(SerError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, SerError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, SerError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, SerError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, SerError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, SerError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_fixed(&mut self, n: usize) -> Result<&'a [u8], SerError> {
        self.take(n)
    }

    pub fn read_fixed_32(&mut self) -> Result<[u8; 32], SerError> {
        Ok(self.take(32)?.try_into().unwrap())
    }

    /// Bytes behind an 8-byte length prefix, bounded by `max`.
    pub fn read_bytes_long(&mut self, max: u64) -> Result<Vec<u8>, SerError> {
        let len = self.read_u64()?;
        if len > max {
            return Err(SerError::LimitExceeded { got: len, max });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Bytes behind a 2-byte length prefix, bounded by `max`.
    pub fn read_bytes_short(&mut self, max: u16) -> Result<Vec<u8>, SerError> {
        let len = self.read_u16()?;
        if len > max {
            return Err(SerError::LimitExceeded {
                got: len as u64,
                max: max as u64,
            });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// A sequence count from an 8-byte prefix, bounded by `max`.
    pub fn read_count_long(&mut self, max: u64) -> Result<u64, SerError> {
        let count = self.read_u64()?;
        if count > max {
            return Err(SerError::LimitExceeded { got: count, max });
        }
        Ok(count)
    }

    /// A sequence count from a 2-byte prefix, bounded by `max`.
    pub fn read_count_short(&mut self, max: u16) -> Result<u16, SerError> {
        let count = self.read_u16()?;
        if count > max {
            return Err(SerError::LimitExceeded {
                got: count as u64,
                max: max as u64,
            });
        }
        Ok(count)
    }

    /// Succeeds only if the whole input has been consumed.
    pub fn expect_eof(&self) -> Result<(), SerError> {
        if self.remaining() > 0 {
            return Err(SerError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

/// Serialize to a fresh byte vector.
pub fn ser_vec<T: Writeable>(value: &T) -> Vec<u8> {
    let mut writer = Writer::new();
    value.write(&mut writer);
    writer.into_vec()
}

/// Deserialize an entire buffer, rejecting trailing bytes.
pub fn deser<T: Readable>(bytes: &[u8]) -> Result<T, SerError> {
    let mut reader = Reader::new(bytes);
    let value = T::read(&mut reader)?;
    reader.expect_eof()?;
    Ok(value)
}

impl Writeable for Vec<u8> {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes_long(self);
    }
}

impl Writeable for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }
}

impl Readable for u64 {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        reader.read_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Pair {
        a: u32,
        b: Vec<u8>,
    }

    impl Writeable for Pair {
        fn write(&self, writer: &mut Writer) {
            writer.write_u32(self.a);
            writer.write_bytes_long(&self.b);
        }
    }

    impl Readable for Pair {
        fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
            let a = reader.read_u32()?;
            let b = reader.read_bytes_long(MAX_SEQUENCE_LEN)?;
            Ok(Pair { a, b })
        }
    }

    #[test]
    fn integers_are_big_endian() {
        let mut w = Writer::new();
        w.write_u16(0x0102);
        w.write_u32(0x03040506);
        w.write_u64(0x0708090a0b0c0d0e);
        assert_eq!(
            w.into_vec(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]
        );
    }

    #[test]
    fn roundtrip_and_byte_equality() {
        let p = Pair {
            a: 7,
            b: vec![1, 2, 3],
        };
        let bytes = ser_vec(&p);
        let p2: Pair = deser(&bytes).unwrap();
        assert_eq!(p2.a, 7);
        assert_eq!(p2.b, vec![1, 2, 3]);
        assert_eq!(ser_vec(&p2), bytes);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let p = Pair { a: 1, b: vec![] };
        let mut bytes = ser_vec(&p);
        bytes.push(0xFF);
        match deser::<Pair>(&bytes) {
            Err(SerError::TrailingBytes(1)) => {}
            other => panic!("expected TrailingBytes, got {other:?}"),
        }
    }

    #[test]
    fn truncated_input_rejected() {
        let p = Pair {
            a: 1,
            b: vec![9; 10],
        };
        let bytes = ser_vec(&p);
        assert!(matches!(
            deser::<Pair>(&bytes[..bytes.len() - 1]),
            Err(SerError::UnexpectedEof)
        ));
    }

    #[test]
    fn oversized_sequence_rejected() {
        let mut w = Writer::new();
        w.write_u32(1);
        w.write_u64(MAX_SEQUENCE_LEN + 1);
        let bytes = w.into_vec();
        match deser::<Pair>(&bytes) {
            Err(SerError::LimitExceeded { got, max }) => {
                assert_eq!(got, MAX_SEQUENCE_LEN + 1);
                assert_eq!(max, MAX_SEQUENCE_LEN);
            }
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn short_prefix_cap() {
        let mut w = Writer::new();
        w.write_u16(500);
        w.write_fixed(&[0u8; 500]);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.read_bytes_short(100),
            Err(SerError::LimitExceeded { got: 500, max: 100 })
        ));
    }
}
