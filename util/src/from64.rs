use std::convert::TryFrom;

/// Lossless-by-assertion conversions from 64-bit values on platforms where
/// usize is at least 64 bits. Panics on truncation rather than wrapping.
pub trait From64<T> {
    fn from64(value: T) -> Self;
}

impl From64<u64> for usize {
    fn from64(value: u64) -> usize {
        usize::try_from(value).unwrap()
    }
}

impl From64<i64> for usize {
    fn from64(value: i64) -> usize {
        usize::try_from(value).unwrap()
    }
}
