//! Deterministic binary encoding for every on-disk structure.
//!
//! WAL records, manifest events and snapshots, and SSTable blocks are all
//! written through the [`Encode`] and [`Decode`] traits defined here. The
//! format is owned by BurstDB, so a dependency upgrade can never change the
//! bytes on disk.
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u16`/`u32`/`u64`  | 2/4/8 bytes, little-endian                   |
//! | `bool`             | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `[u8; N]`          | `N` raw bytes                                |
//! | `Vec<u8>`          | `[u32 len][bytes]`                           |
//! | `String`           | `[u32 len][utf-8 bytes]`                     |
//! | `Option<T>`        | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | `Vec<T>`           | `[u32 count][T₁][T₂]…` via [`encode_vec`]    |
//! | `enum`             | `[u32 tag][fields…]` (hand-written)          |
//!
//! Decoding goes through a [`ByteReader`] cursor. Byte strings can be
//! borrowed straight out of the input with [`ByteReader::read_bytes`], which
//! is how SSTable lookups avoid copying keys out of the mapped file.
//!
//! # Limits
//!
//! Decoded lengths are capped by [`MAX_BYTE_LEN`] and element counts by
//! [`MAX_VEC_ELEMENTS`], so a corrupt length field fails fast instead of
//! triggering a huge allocation.


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Limits
// ------------------------------------------------------------------------------------------------

/// Maximum decoded length of a single byte string (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Maximum decoded element count of a `Vec<T>` (16 M).
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof { needed: usize, available: usize },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count exceeded its limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Bytes were left over after a value that must fill its buffer.
    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` by appending to a byte buffer.
///
/// The same logical value must always produce the same bytes.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a [`ByteReader`], advancing its cursor.
pub trait Decode: Sized {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError>;
}

/// Encode a value into a fresh `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the start of `buf`, returning it with the number of
/// bytes consumed.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    let mut reader = ByteReader::new(buf);
    let value = T::decode(&mut reader)?;
    Ok((value, reader.position()))
}

/// Decode a value that must occupy all of `buf`.
pub fn decode_exact<T: Decode>(buf: &[u8]) -> Result<T, EncodingError> {
    let mut reader = ByteReader::new(buf);
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

/// Append a length-prefixed byte string without requiring an owned `Vec`.
pub fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(bytes.len())?.encode_to(buf)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Encode a slice of `T` as `[u32 count][T₁][T₂]…`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a `Vec<T>` written by [`encode_vec`].
pub fn decode_vec<T: Decode>(reader: &mut ByteReader<'_>) -> Result<Vec<T>, EncodingError> {
    let count = reader.read_u32()?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "vector element count {count} exceeds {MAX_VEC_ELEMENTS}"
        )));
    }
    // Each element takes at least one byte, so a count larger than the
    // remaining input is corrupt regardless of `T`.
    let count = count as usize;
    if count > reader.remaining() {
        return Err(EncodingError::UnexpectedEof {
            needed: count,
            available: reader.remaining(),
        });
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::decode(reader)?);
    }
    Ok(items)
}

#[inline]
pub(crate) fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// ByteReader
// ------------------------------------------------------------------------------------------------

/// Forward-only cursor over a borrowed byte slice.
///
/// Every read is bounds-checked and returns [`EncodingError::UnexpectedEof`]
/// instead of panicking.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnexpectedEof {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, EncodingError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, EncodingError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, EncodingError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Borrow a `[u32 len][bytes]` byte string without copying.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], EncodingError> {
        let len = self.read_u32()?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte string length {len} exceeds {MAX_BYTE_LEN}"
            )));
        }
        self.take(len as usize)
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<(), EncodingError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(EncodingError::TrailingBytes(n)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Primitive implementations
// ------------------------------------------------------------------------------------------------

macro_rules! impl_le_int {
    ($ty:ty, $read:ident) => {
        impl Encode for $ty {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
                reader.$read()
            }
        }
    };
}

impl_le_int!(u8, read_u8);
impl_le_int!(u16, read_u16);
impl_le_int!(u32, read_u32);
impl_le_int!(u64, read_u64);

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        match reader.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        reader.take_array()
    }
}

// ------------------------------------------------------------------------------------------------
// Byte strings
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self, buf)
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(reader.read_bytes()?.to_vec())
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl Decode for String {
    #[inline]
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(String::from_utf8(reader.read_bytes()?.to_vec())?)
    }
}

// ------------------------------------------------------------------------------------------------
// Option<T>
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => buf.push(0),
            Some(val) => {
                buf.push(1);
                val.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        match reader.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(reader)?)),
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "Option<T>",
            }),
        }
    }
}
