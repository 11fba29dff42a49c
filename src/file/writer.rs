//! Append-only writer producing module images, the counterpart of [`crate::file::parser::Parser`].

use crate::{
    file::io::{write_le, ImageIO},
    Result,
};

/// Largest value representable as an ECMA-335 compressed unsigned integer.
pub const MAX_COMPRESSED_UINT: u32 = 0x1FFF_FFFF;

/// A growable output buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Writer::default()
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends a little-endian primitive.
    pub fn write_le<T: ImageIO>(&mut self, value: T) {
        write_le(&mut self.buffer, value);
    }

    /// Appends a one byte flag.
    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Appends a compressed unsigned integer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `value` exceeds [`MAX_COMPRESSED_UINT`].
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        match value {
            0..=0x7F => self.buffer.push(value as u8),
            0x80..=0x3FFF => {
                self.buffer.push(0x80 | (value >> 8) as u8);
                self.buffer.push(value as u8);
            }
            0x4000..=MAX_COMPRESSED_UINT => {
                self.buffer.push(0xC0 | (value >> 24) as u8);
                self.buffer.push((value >> 16) as u8);
                self.buffer.push((value >> 8) as u8);
                self.buffer.push(value as u8);
            }
            _ => {
                return Err(malformed_error!(
                    "Value {} cannot be encoded as compressed integer",
                    value
                ))
            }
        }
        Ok(())
    }

    /// Appends a compressed signed integer, sign in the least significant bit.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the encoded value does not fit.
    #[allow(clippy::cast_sign_loss)]
    pub fn write_compressed_int(&mut self, value: i32) -> Result<()> {
        let encoded = if value >= 0 {
            (value as u32) << 1
        } else {
            (((-(i64::from(value)) - 1) as u32) << 1) | 1
        };
        self.write_compressed_uint(encoded)
    }

    /// Appends an element count.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for counts beyond [`MAX_COMPRESSED_UINT`].
    pub fn write_count(&mut self, count: usize) -> Result<()> {
        let value = u32::try_from(count)
            .map_err(|_| malformed_error!("Element count {} too large", count))?;
        self.write_compressed_uint(value)
    }

    /// Appends a length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for strings longer than [`MAX_COMPRESSED_UINT`].
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_count(value.len())?;
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Consumes the writer and returns the bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::parser::Parser;

    #[test]
    fn compressed_boundaries() -> Result<()> {
        let mut writer = Writer::new();
        for value in [0u32, 0x7F, 0x80, 0x3FFF, 0x4000, MAX_COMPRESSED_UINT] {
            writer.write_compressed_uint(value)?;
        }
        for value in [0i32, 10, -5, -1, i32::from(i16::MIN)] {
            writer.write_compressed_int(value)?;
        }
        let bytes = writer.into_inner();
        assert_eq!(&bytes[..3], &[0x00, 0x7F, 0x80]);

        let mut parser = Parser::new(&bytes);
        for value in [0u32, 0x7F, 0x80, 0x3FFF, 0x4000, MAX_COMPRESSED_UINT] {
            assert_eq!(parser.read_compressed_uint()?, value);
        }
        for value in [0i32, 10, -5, -1, i32::from(i16::MIN)] {
            assert_eq!(parser.read_compressed_int()?, value);
        }
        Ok(())
    }

    #[test]
    fn rejects_unencodable() {
        let mut writer = Writer::new();
        assert!(writer.write_compressed_uint(0x2000_0000).is_err());
    }
}
