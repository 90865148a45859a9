//! Wire value codec
//!
//! Values are serialized as instructions for a stack machine. Scalars push
//! one item. Containers first emit their children, then a container opcode
//! followed by the child count, which pops that many items and pushes the
//! container. A final stop opcode ends the stream; at that point exactly one
//! item must be on the stack.
//!
//! ## Format
//!
//! ```text
//! 'N'                      null
//! 'T' / 'F'                true / false
//! 'b' i8                   small integer
//! 'i' i32                  medium integer
//! 'l' i64                  large integer
//! 'd' f64                  float
//! 'c' f64 f64              complex (re, im)
//! 'y' u32 bytes            byte string
//! 's' u32 bytes            UTF-8 string
//! 'L' u32                  sequence, pops count items in order
//! 'M' u32                  mapping, pops 2*count items (k0 v0 k1 v1 ...)
//! 'S' u32                  set, pops count items
//! 'O' u32                  ordered set, pops count items in order
//! '.'                      stop
//! ```
//!
//! All multi-byte numbers are big-endian. Decoding is iterative, but values
//! are dropped, frozen and encoded recursively, so both directions refuse
//! containers nested deeper than [`MAX_DEPTH`].

use crate::value::{Complex, Mapping, OrderedSet, Sequence, Set, Value};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

const NULL: u8 = b'N';
const TRUE: u8 = b'T';
const FALSE: u8 = b'F';
const INT8: u8 = b'b';
const INT32: u8 = b'i';
const INT64: u8 = b'l';
const FLOAT: u8 = b'd';
const COMPLEX: u8 = b'c';
const BYTES: u8 = b'y';
const STR: u8 = b's';
const SEQ: u8 = b'L';
const MAP: u8 = b'M';
const SET: u8 = b'S';
const ORDERED_SET: u8 = b'O';
const STOP: u8 = b'.';

/// Deepest container nesting accepted by the encoder and decoder
///
/// Scalars have depth 0; a container is one deeper than its deepest child.
pub const MAX_DEPTH: usize = 512;

/// Codec failure
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before the stop opcode
    #[error("input truncated")]
    Truncated,

    /// Byte is not a known opcode
    #[error("unknown opcode 0x{opcode:02x}")]
    UnknownOpcode {
        /// Offending byte
        opcode: u8,
    },

    /// Container opcode asked for more items than the stack holds
    #[error("opcode {:?} needs {needed} items, stack holds {available}", *opcode as char)]
    StackUnderflow {
        /// Container opcode
        opcode: u8,
        /// Items required
        needed: usize,
        /// Items on the stack
        available: usize,
    },

    /// Stop reached with a stack depth other than one
    #[error("stop reached with {depth} items on the stack")]
    BadStackAtStop {
        /// Stack depth at stop
        depth: usize,
    },

    /// String payload is not UTF-8
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Mapping payload repeats a key
    #[error("mapping contains a duplicate key")]
    DuplicateKey,

    /// Bytes remain after the stop opcode
    #[error("{remaining} trailing bytes after stop")]
    TrailingBytes {
        /// Unconsumed bytes
        remaining: usize,
    },

    /// Length or count does not fit the format
    #[error("length {len} exceeds the format limit")]
    TooLarge {
        /// Requested length
        len: usize,
    },

    /// Containers nested past [`MAX_DEPTH`]
    #[error("containers nested deeper than {max}")]
    TooDeep {
        /// Depth limit
        max: usize,
    },

    /// Underlying reader or writer failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn read_err(e: io::Error) -> CodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Truncated
    } else {
        CodecError::Io(e)
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a value into a new buffer
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value)?;
    Ok(buf)
}

/// Encode a value, including the stop opcode, into `writer`
pub fn encode_into<W: Write>(writer: &mut W, value: &Value) -> Result<(), CodecError> {
    write_value(writer, value, 0)?;
    writer.write_u8(STOP)?;
    Ok(())
}

/// Encoded size of `value`, or `None` once it would exceed `max`
///
/// Stops serializing as soon as the limit is passed, so checking a large
/// value against a small limit is cheap.
pub fn encoded_len(value: &Value, max: Option<usize>) -> Option<usize> {
    let mut counter = LenCounter {
        count: 0,
        max: max.unwrap_or(usize::MAX),
    };
    encode_into(&mut counter, value).ok()?;
    Some(counter.count)
}

struct LenCounter {
    count: usize,
    max: usize,
}

impl Write for LenCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count = self.count.saturating_add(buf.len());
        if self.count > self.max {
            return Err(io::Error::new(io::ErrorKind::Other, "limit exceeded"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_len<W: Write>(writer: &mut W, len: usize) -> Result<(), CodecError> {
    let len32 = u32::try_from(len).map_err(|_| CodecError::TooLarge { len })?;
    writer.write_u32::<BigEndian>(len32)?;
    Ok(())
}

fn write_int<W: Write>(writer: &mut W, i: i64) -> Result<(), CodecError> {
    if let Ok(small) = i8::try_from(i) {
        writer.write_u8(INT8)?;
        writer.write_i8(small)?;
    } else if let Ok(medium) = i32::try_from(i) {
        writer.write_u8(INT32)?;
        writer.write_i32::<BigEndian>(medium)?;
    } else {
        writer.write_u8(INT64)?;
        writer.write_i64::<BigEndian>(i)?;
    }
    Ok(())
}

fn write_value<W: Write>(writer: &mut W, value: &Value, depth: usize) -> Result<(), CodecError> {
    if value.is_container() && depth >= MAX_DEPTH {
        return Err(CodecError::TooDeep { max: MAX_DEPTH });
    }
    let depth = depth + 1;
    match value {
        Value::Null => writer.write_u8(NULL)?,
        Value::Bool(true) => writer.write_u8(TRUE)?,
        Value::Bool(false) => writer.write_u8(FALSE)?,
        Value::Int(i) => write_int(writer, *i)?,
        Value::Float(f) => {
            writer.write_u8(FLOAT)?;
            writer.write_f64::<BigEndian>(*f)?;
        }
        Value::Complex(c) => {
            writer.write_u8(COMPLEX)?;
            writer.write_f64::<BigEndian>(c.re)?;
            writer.write_f64::<BigEndian>(c.im)?;
        }
        Value::Bytes(b) => {
            writer.write_u8(BYTES)?;
            write_len(writer, b.len())?;
            writer.write_all(b)?;
        }
        Value::Str(s) => {
            writer.write_u8(STR)?;
            write_len(writer, s.len())?;
            writer.write_all(s.as_bytes())?;
        }
        Value::Seq(seq) => {
            for item in seq {
                write_value(writer, item, depth)?;
            }
            writer.write_u8(SEQ)?;
            write_len(writer, seq.len())?;
        }
        Value::Map(map) => {
            for (k, v) in map {
                write_value(writer, k, depth)?;
                write_value(writer, v, depth)?;
            }
            writer.write_u8(MAP)?;
            write_len(writer, map.len())?;
        }
        Value::Set(set) => {
            for item in set {
                write_value(writer, item, depth)?;
            }
            writer.write_u8(SET)?;
            write_len(writer, set.len())?;
        }
        Value::OrderedSet(set) => {
            for item in set {
                write_value(writer, item, depth)?;
            }
            writer.write_u8(ORDERED_SET)?;
            write_len(writer, set.len())?;
        }
    }
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode exactly one value from `bytes`
///
/// Bytes after the stop opcode are an error.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut reader = bytes;
    let value = decode_from(&mut reader)?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: reader.len(),
        });
    }
    Ok(value)
}

/// Decode one value from `reader`, consuming through the stop opcode
pub fn decode_from<R: Read>(reader: &mut R) -> Result<Value, CodecError> {
    let mut stack = DecodeStack::default();
    loop {
        let opcode = reader.read_u8().map_err(read_err)?;
        match opcode {
            NULL => stack.push_scalar(Value::Null),
            TRUE => stack.push_scalar(Value::Bool(true)),
            FALSE => stack.push_scalar(Value::Bool(false)),
            INT8 => stack.push_scalar(Value::Int(i64::from(reader.read_i8().map_err(read_err)?))),
            INT32 => stack.push_scalar(Value::Int(i64::from(
                reader.read_i32::<BigEndian>().map_err(read_err)?,
            ))),
            INT64 => stack.push_scalar(Value::Int(
                reader.read_i64::<BigEndian>().map_err(read_err)?,
            )),
            FLOAT => stack.push_scalar(Value::Float(
                reader.read_f64::<BigEndian>().map_err(read_err)?,
            )),
            COMPLEX => {
                let re = reader.read_f64::<BigEndian>().map_err(read_err)?;
                let im = reader.read_f64::<BigEndian>().map_err(read_err)?;
                stack.push_scalar(Value::Complex(Complex::new(re, im)));
            }
            BYTES => {
                let len = read_len(reader)?;
                stack.push_scalar(Value::Bytes(read_payload(reader, len)?));
            }
            STR => {
                let len = read_len(reader)?;
                let raw = read_payload(reader, len)?;
                let s = String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                stack.push_scalar(Value::Str(s));
            }
            SEQ => {
                let count = read_len(reader)?;
                let (items, depth) = stack.pop_children(opcode, count)?;
                stack.push_container(Value::Seq(Sequence::from_vec(items)), depth);
            }
            MAP => {
                let count = read_len(reader)?;
                let needed = count
                    .checked_mul(2)
                    .ok_or(CodecError::TooLarge { len: count })?;
                let (items, depth) = stack.pop_children(opcode, needed)?;
                let mut map = Mapping::new();
                let mut it = items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    if !map.try_insert_unique(k, v) {
                        return Err(CodecError::DuplicateKey);
                    }
                }
                stack.push_container(Value::Map(map), depth);
            }
            SET => {
                let count = read_len(reader)?;
                let (items, depth) = stack.pop_children(opcode, count)?;
                stack.push_container(Value::Set(items.into_iter().collect::<Set>()), depth);
            }
            ORDERED_SET => {
                let count = read_len(reader)?;
                let (items, depth) = stack.pop_children(opcode, count)?;
                stack.push_container(
                    Value::OrderedSet(items.into_iter().collect::<OrderedSet>()),
                    depth,
                );
            }
            STOP => return stack.finish(),
            other => return Err(CodecError::UnknownOpcode { opcode: other }),
        }
    }
}

fn read_len<R: Read>(reader: &mut R) -> Result<usize, CodecError> {
    let len = reader.read_u32::<BigEndian>().map_err(read_err)?;
    usize::try_from(len).map_err(|_| CodecError::TooLarge { len: usize::MAX })
}

fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, CodecError> {
    // Grow with the data actually read so a bogus length cannot force a huge allocation.
    let mut buf = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(CodecError::Truncated);
    }
    Ok(buf)
}

/// Decoder stack, with the nesting depth of every item alongside it
#[derive(Default)]
struct DecodeStack {
    values: Vec<Value>,
    depths: Vec<usize>,
}

impl DecodeStack {
    fn push_scalar(&mut self, value: Value) {
        self.values.push(value);
        self.depths.push(0);
    }

    fn push_container(&mut self, value: Value, depth: usize) {
        self.values.push(value);
        self.depths.push(depth);
    }

    /// Pop `count` items and return them with the depth of their new parent
    fn pop_children(
        &mut self,
        opcode: u8,
        count: usize,
    ) -> Result<(Vec<Value>, usize), CodecError> {
        let available = self.values.len();
        if count > available {
            return Err(CodecError::StackUnderflow {
                opcode,
                needed: count,
                available,
            });
        }
        let deepest = self.depths.drain(available - count..).max().unwrap_or(0);
        if deepest >= MAX_DEPTH {
            return Err(CodecError::TooDeep { max: MAX_DEPTH });
        }
        Ok((self.values.split_off(available - count), deepest + 1))
    }

    fn finish(mut self) -> Result<Value, CodecError> {
        if self.values.len() != 1 {
            return Err(CodecError::BadStackAtStop {
                depth: self.values.len(),
            });
        }
        self.values
            .pop()
            .ok_or(CodecError::BadStackAtStop { depth: 0 })
    }
}
