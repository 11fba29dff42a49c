//! Endian-aware primitive reads and writes on byte buffers.
//!
//! The [`ImageIO`] trait abstracts over the fixed size byte representation of the primitive
//! types stored in a module image. Reads are bounds checked and report
//! [`crate::Error::OutOfBounds`] instead of panicking; writes append to a growable buffer.

use crate::Result;

/// Fixed size little-endian conversion of a primitive.
pub trait ImageIO: Sized + Copy {
    /// Byte array of the encoded value.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decodes from little-endian bytes.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encodes into little-endian bytes.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_image_io {
    ($($ty:ty => $n:literal),* $(,)?) => {
        $(
            impl ImageIO for $ty {
                type Bytes = [u8; $n];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_image_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
}

/// Reads a `T` at `offset` and advances the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
///
/// # Examples
///
/// ```rust,ignore
/// let data = [0x01, 0x00, 0x02, 0x00];
/// let mut offset = 0;
/// assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 1);
/// assert_eq!(offset, 2);
/// ```
pub fn read_le_at<T: ImageIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Appends the little-endian encoding of `value`.
pub fn write_le<T: ImageIO>(buffer: &mut Vec<u8>, value: T) {
    buffer.extend_from_slice(value.to_le_bytes().as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn read_sequence() -> Result<()> {
        let data = [0x01, 0x02, 0x03, 0x04, 0xff];
        let mut offset = 0;
        assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 0x0201);
        assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 0x0403);
        assert_eq!(read_le_at::<i8>(&data, &mut offset)?, -1);
        assert!(matches!(
            read_le_at::<u8>(&data, &mut offset),
            Err(Error::OutOfBounds { .. })
        ));
        Ok(())
    }

    #[test]
    fn write_is_little_endian() {
        let mut buffer = Vec::new();
        write_le(&mut buffer, 0x1234_5678_u32);
        write_le(&mut buffer, 1.5f32);
        assert_eq!(&buffer[..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(buffer.len(), 8);
    }
}
