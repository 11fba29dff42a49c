//! Cursor based reader for module images.
//!
//! [`Parser`] keeps a position inside a byte slice and offers bounds checked reads of
//! primitives, ECMA-335 compressed integers and length-prefixed strings. Every read either
//! succeeds and advances, or fails with [`crate::Error::OutOfBounds`] /
//! [`crate::Error::Malformed`].
//!
//! # Examples
//!
//! ```rust
//! use dotbind::file::parser::Parser;
//!
//! let data = [0x01, 0x02, 0x81, 0x00, 0x03, b'a', b'b', b'c'];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_le::<u16>()?, 0x0201);
//! assert_eq!(parser.read_compressed_uint()?, 0x100);
//! assert_eq!(parser.read_string()?, "abc");
//! assert!(!parser.has_more_data());
//! # Ok::<(), dotbind::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, ImageIO},
    Result,
};

/// A bounds checked reader over a byte slice.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Creates a parser positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Length of the underlying buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` while unread bytes remain.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Current position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Reads a little-endian primitive.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit in the remaining bytes.
    pub fn read_le<T: ImageIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Reads a single byte flag; any value other than 0 and 1 is rejected.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for values other than 0 and 1.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_le::<u8>()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(malformed_error!("Invalid boolean - {}", other)),
        }
    }

    /// Reads a compressed unsigned integer as defined in ECMA-335 II.23.2.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input or [`crate::Error::Malformed`]
    /// for an invalid leading byte.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            return Ok(((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte));
        }

        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            return Ok(((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Reads a compressed signed integer.
    ///
    /// The sign is carried in the least significant bit, the magnitude in the remaining bits.
    ///
    /// # Errors
    /// See [`Parser::read_compressed_uint`].
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let unsigned = self.read_compressed_uint()?;

        #[allow(clippy::cast_possible_wrap)]
        let signed = if (unsigned & 1) == 0 {
            (unsigned >> 1) as i32
        } else {
            -((unsigned >> 1) as i32) - 1
        };
        Ok(signed)
    }

    /// Reads a compressed length used as a count of following elements.
    ///
    /// Counts larger than the remaining bytes are rejected up front, so a damaged length never
    /// turns into a huge allocation.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the count exceeds the remaining input.
    pub fn read_count(&mut self) -> Result<usize> {
        let count = self.read_compressed_uint()? as usize;
        if count > self.remaining() {
            return Err(malformed_error!(
                "Element count {} exceeds remaining {} bytes at offset {}",
                count,
                self.remaining(),
                self.position
            ));
        }
        Ok(count)
    }

    /// Reads `length` raw bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `length` bytes remain.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(length)
            .ok_or(out_of_bounds_error!())?;
        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Reads a compressed-length prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input or [`crate::Error::Malformed`]
    /// for invalid UTF-8.
    pub fn read_string(&mut self) -> Result<String> {
        let length = self.read_compressed_uint()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                start + length,
                e.utf8_error()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn compressed_uint_encodings() -> Result<()> {
        let cases: [(&[u8], u32); 6] = [
            (&[0x03], 0x03),
            (&[0x7F], 0x7F),
            (&[0x80, 0x80], 0x80),
            (&[0xAE, 0x57], 0x2E57),
            (&[0xBF, 0xFF], 0x3FFF),
            (&[0xC0, 0x00, 0x40, 0x00], 0x4000),
        ];
        for (input, expected) in cases {
            assert_eq!(Parser::new(input).read_compressed_uint()?, expected);
        }
        assert!(matches!(
            Parser::new(&[0xFF]).read_compressed_uint(),
            Err(Error::Malformed { .. })
        ));
        Ok(())
    }

    #[test]
    fn compressed_int_sign() -> Result<()> {
        assert_eq!(Parser::new(&[20]).read_compressed_int()?, 10);
        assert_eq!(Parser::new(&[9]).read_compressed_int()?, -5);
        assert_eq!(Parser::new(&[1]).read_compressed_int()?, -1);
        Ok(())
    }

    #[test]
    fn truncated_string_is_out_of_bounds() {
        let mut parser = Parser::new(&[0x05, b'a', b'b']);
        assert!(matches!(
            parser.read_string(),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut parser = Parser::new(&[0x40, 0xff, 0x00]);
        assert!(parser.read_count().is_err());
    }
}
