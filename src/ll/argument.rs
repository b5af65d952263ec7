//! Decomposition of request payload bytes.
//!
//! After the common header, a request carries a sequence of fixed-layout
//! structs, NUL-terminated names, and trailing data. `ArgReader` pulls them
//! off the front of the slice one at a time.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use zerocopy::error::ConvertError;
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub(crate) struct ArgReader<'a> {
    data: &'a [u8],
}

impl<'a> ArgReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> ArgReader<'a> {
        ArgReader { data }
    }

    /// Bytes not yet consumed.
    pub(crate) fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Consume and return everything left.
    pub(crate) fn take_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    /// Pull one fixed-layout struct off the front. `None` on short data.
    pub(crate) fn take<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Option<&'a T> {
        match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            // The device buffer is aligned for fuse_in_header and every
            // argument struct has compatible alignment, so this indicates a
            // caller bug rather than bad input.
            Err(ConvertError::Alignment(_)) => panic!("unaligned request buffer"),
            Err(ConvertError::Size(_)) => None,
            Err(ConvertError::Validity(infallible)) => match infallible {},
            Ok((x, rest)) => {
                self.data = rest;
                Some(zerocopy::Ref::<&[u8], T>::into_ref(x))
            }
        }
    }

    /// Pull `count` consecutive structs off the front. `None` on short data.
    pub(crate) fn take_slice<T: FromBytes + Immutable>(&mut self, count: usize) -> Option<&'a [T]> {
        match zerocopy::Ref::<_, [T]>::from_prefix_with_elems(self.data, count) {
            Err(ConvertError::Alignment(_)) => panic!("unaligned request buffer"),
            Err(ConvertError::Size(_)) => None,
            Err(ConvertError::Validity(infallible)) => match infallible {},
            Ok((x, rest)) => {
                self.data = rest;
                Some(zerocopy::Ref::<&[u8], [T]>::into_ref(x))
            }
        }
    }

    /// Pull a NUL-terminated name off the front (possibly non-UTF-8).
    /// `None` when no terminator is present in the remaining data.
    pub(crate) fn take_name(&mut self) -> Option<&'a OsStr> {
        let len = memchr::memchr(0, self.data)?;
        let (name, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(name))
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::{FromBytes, Immutable, KnownLayout};

    use super::super::test::AlignedData;
    use super::*;

    const DATA: AlignedData<[u8; 12]> = AlignedData([
        0x61, 0x00, 0x62, 0x63, 0x00, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44,
    ]);

    #[repr(C)]
    #[derive(FromBytes, KnownLayout, Immutable)]
    struct Pair {
        a: u16,
        b: u16,
    }

    #[test]
    fn names_then_rest() {
        let mut r = ArgReader::new(&*DATA);
        assert_eq!(r.take_name().unwrap(), "a");
        assert_eq!(r.take_name().unwrap(), "bc");
        assert_eq!(r.remaining(), 7);
    }

    #[test]
    fn typed_struct() {
        let mut r = ArgReader::new(&*DATA);
        let p: &Pair = r.take().unwrap();
        assert_eq!(p.a, 0x0061);
        assert_eq!(p.b, 0x6362);
        assert_eq!(r.remaining(), 8);
    }

    #[test]
    fn typed_slice() {
        let mut r = ArgReader::new(&*DATA);
        let s: &[Pair] = r.take_slice(3).unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s[2].a, 0x2211);
        assert!(r.take_slice::<Pair>(2).is_none());
    }

    #[test]
    fn short_data() {
        let mut r = ArgReader::new(&*DATA);
        r.take::<u64>().unwrap();
        assert!(r.take::<u64>().is_none());
        assert_eq!(r.remaining(), 4);
        assert_eq!(r.take_rest(), [0x11, 0x22, 0x33, 0x44]);
        assert!(r.take_name().is_none());
    }
}
