use byteorder::{ByteOrder, NetworkEndian};
use glam::{IVec3, Vec3};

/// Upper bound for any length prefix read off the wire.
pub const MAX_SEQUENCE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    TruncatedMessage { needed: usize, remaining: usize },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl CodecError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload(reason.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

enum Buffer<'a> {
    Read { data: &'a [u8], cursor: usize },
    Write(Vec<u8>),
}

/// A byte stream that either consumes or produces the wire form of a value.
///
/// The same [`Serialize`] implementation drives both directions: in
/// [`Mode::Read`] every call overwrites the referenced value with the next
/// field from the buffer, in [`Mode::Write`] it appends the value.
pub struct Stream<'a> {
    buffer: Buffer<'a>,
}

impl<'a> Stream<'a> {
    pub fn reader(data: &'a [u8]) -> Self {
        Self {
            buffer: Buffer::Read { data, cursor: 0 },
        }
    }

    pub fn writer() -> Stream<'static> {
        Stream {
            buffer: Buffer::Write(Vec::with_capacity(64)),
        }
    }

    pub fn mode(&self) -> Mode {
        match self.buffer {
            Buffer::Read { .. } => Mode::Read,
            Buffer::Write(_) => Mode::Write,
        }
    }

    pub fn is_reading(&self) -> bool {
        self.mode() == Mode::Read
    }

    pub fn remaining(&self) -> usize {
        match &self.buffer {
            Buffer::Read { data, cursor } => data.len() - cursor,
            Buffer::Write(_) => 0,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self.buffer {
            Buffer::Read { data, cursor } => data[cursor..].to_vec(),
            Buffer::Write(bytes) => bytes,
        }
    }

    /// Runs `value` through the stream and returns the stream for chaining.
    pub fn io<T: Serialize>(&mut self, value: &mut T) -> Result<&mut Self, CodecError> {
        value.serialize(self)?;
        Ok(self)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        match &mut self.buffer {
            Buffer::Read { data, cursor } => {
                let remaining = data.len() - *cursor;
                if len > remaining {
                    return Err(CodecError::TruncatedMessage {
                        needed: len,
                        remaining,
                    });
                }
                let data: &'a [u8] = *data;
                let slice = &data[*cursor..*cursor + len];
                *cursor += len;
                Ok(slice)
            }
            Buffer::Write(_) => Err(CodecError::malformed("read on a write stream")),
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        if let Buffer::Write(out) = &mut self.buffer {
            out.extend_from_slice(bytes);
        }
    }

    /// Reads or writes a `u32` length prefix, rejecting anything over
    /// [`MAX_SEQUENCE_LEN`].
    pub fn length(&mut self, len: &mut usize) -> Result<(), CodecError> {
        let mut raw = *len as u32;
        raw.serialize(self)?;
        if raw as usize > MAX_SEQUENCE_LEN {
            return Err(CodecError::malformed(format!("length {raw} exceeds limit")));
        }
        *len = raw as usize;
        Ok(())
    }

    /// Fails if a read stream still holds unconsumed bytes.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::malformed(format!("{n} trailing bytes"))),
        }
    }
}

pub trait Serialize {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError>;
}

macro_rules! impl_numeric {
    ($ty:ty, $len:expr, $read:path, $write:path) => {
        impl Serialize for $ty {
            fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
                if stream.is_reading() {
                    *self = $read(stream.take($len)?);
                } else {
                    let mut buf = [0u8; $len];
                    $write(&mut buf, *self);
                    stream.put(&buf);
                }
                Ok(())
            }
        }
    };
}

impl_numeric!(u16, 2, NetworkEndian::read_u16, NetworkEndian::write_u16);
impl_numeric!(u32, 4, NetworkEndian::read_u32, NetworkEndian::write_u32);
impl_numeric!(u64, 8, NetworkEndian::read_u64, NetworkEndian::write_u64);
impl_numeric!(i16, 2, NetworkEndian::read_i16, NetworkEndian::write_i16);
impl_numeric!(i32, 4, NetworkEndian::read_i32, NetworkEndian::write_i32);
impl_numeric!(i64, 8, NetworkEndian::read_i64, NetworkEndian::write_i64);
impl_numeric!(f32, 4, NetworkEndian::read_f32, NetworkEndian::write_f32);
impl_numeric!(f64, 8, NetworkEndian::read_f64, NetworkEndian::write_f64);

impl Serialize for u8 {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        if stream.is_reading() {
            *self = stream.take(1)?[0];
        } else {
            stream.put(&[*self]);
        }
        Ok(())
    }
}

impl Serialize for i8 {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut raw = *self as u8;
        raw.serialize(stream)?;
        *self = raw as i8;
        Ok(())
    }
}

impl Serialize for bool {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut raw = *self as u8;
        raw.serialize(stream)?;
        *self = match raw {
            0 => false,
            1 => true,
            other => return Err(CodecError::malformed(format!("invalid bool byte {other}"))),
        };
        Ok(())
    }
}

// Length, raw UTF-8, then a zero terminator kept for parity with the
// null-terminated strings elsewhere in the protocol.
impl Serialize for String {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut len = self.len();
        stream.length(&mut len)?;

        if stream.is_reading() {
            let bytes = stream.take(len)?;
            let text = std::str::from_utf8(bytes)
                .map_err(|e| CodecError::malformed(format!("invalid utf-8: {e}")))?;
            *self = text.to_owned();
        } else {
            stream.put(self.as_bytes());
        }

        let mut terminator = 0u8;
        terminator.serialize(stream)?;
        if terminator != 0 {
            return Err(CodecError::malformed("missing string terminator"));
        }
        Ok(())
    }
}

impl<T: Serialize + Default> Serialize for Vec<T> {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut len = self.len();
        stream.length(&mut len)?;

        if stream.is_reading() {
            self.clear();
            for _ in 0..len {
                let mut item = T::default();
                item.serialize(stream)?;
                self.push(item);
            }
        } else {
            for item in self.iter_mut() {
                item.serialize(stream)?;
            }
        }
        Ok(())
    }
}

impl Serialize for Vec3 {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream.io(&mut self.x)?.io(&mut self.y)?.io(&mut self.z)?;
        Ok(())
    }
}

impl Serialize for IVec3 {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream.io(&mut self.x)?.io(&mut self.y)?.io(&mut self.z)?;
        Ok(())
    }
}

pub fn encode<T: Serialize>(value: &mut T) -> Result<Vec<u8>, CodecError> {
    let mut stream = Stream::writer();
    value.serialize(&mut stream)?;
    Ok(stream.into_bytes())
}

/// Decodes a complete message; trailing bytes are rejected.
pub fn decode<T: Serialize + Default>(data: &[u8]) -> Result<T, CodecError> {
    let mut stream = Stream::reader(data);
    let mut value = T::default();
    value.serialize(&mut stream)?;
    stream.finish()?;
    Ok(value)
}
