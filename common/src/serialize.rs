//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Allows the serialization of datastructures to Vec<u8>.

pub trait Writer {
    fn written_len(&self) -> usize;
    fn write(&self, out: &mut dyn Writable);
    fn to_vec(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(self.written_len());
        self.write(&mut vec);
        vec
    }
}

// Like std::io::Write but can't fail or only do partial writes.
pub trait Writable {
    fn write(&mut self, input: &[u8]);
}

impl Writable for Vec<u8> {
    fn write(&mut self, input: &[u8]) {
        self.extend_from_slice(input);
    }
}

impl<T: Writer> Writer for Option<T> {
    fn written_len(&self) -> usize {
        match self {
            None => 0,
            Some(writer) => writer.written_len(),
        }
    }
    fn write(&self, out: &mut dyn Writable) {
        if let Some(writer) = self {
            writer.write(out);
        }
    }
}

// We don't impl u8 directly so as to avoid a conflict between [u8] and [T: Writer]
impl<const N: usize> Writer for [u8; N] {
    fn written_len(&self) -> usize {
        self.len()
    }
    fn write(&self, out: &mut dyn Writable) {
        out.write(&self[..]);
    }
}

impl Writer for [u8] {
    fn written_len(&self) -> usize {
        self.len()
    }
    fn write(&self, out: &mut dyn Writable) {
        out.write(self);
    }
}

impl Writer for Vec<u8> {
    fn written_len(&self) -> usize {
        self.len()
    }
    fn write(&self, out: &mut dyn Writable) {
        out.write(&self[..]);
    }
}

impl Writer for u16 {
    fn written_len(&self) -> usize {
        2
    }
    fn write(&self, out: &mut dyn Writable) {
        self.to_be_bytes().write(out)
    }
}

impl Writer for u32 {
    fn written_len(&self) -> usize {
        4
    }
    fn write(&self, out: &mut dyn Writable) {
        self.to_be_bytes().write(out)
    }
}

macro_rules! impl_writer_tuple {
    ($($name:ident)+) => (
    impl<$($name: Writer),+> Writer for ($($name,)+) {
        #[allow(non_snake_case)]
        fn written_len(&self) -> usize {
            let ($(ref $name,)+) = *self;
            let mut len = 0;
            $(len += $name.written_len();)+
            len
        }
        #[allow(non_snake_case)]
        fn write(&self, out: &mut dyn Writable) {
            let ($(ref $name,)+) = *self;
            $($name.write(out);)+
        }
    });
}

impl_writer_tuple! { A B }
impl_writer_tuple! { A B C }
impl_writer_tuple! { A B C D }
impl_writer_tuple! { A B C D E }
impl_writer_tuple! { A B C D E F }

impl<T: Writer> Writer for Vec<T> {
    fn written_len(&self) -> usize {
        self.iter().map(|writable| writable.written_len()).sum()
    }
    fn write(&self, out: &mut dyn Writable) {
        for writable in self {
            writable.write(out);
        }
    }
}

// Necessary for composition with other impls (such as tuples).
impl<T: Writer + ?Sized> Writer for &T {
    fn written_len(&self) -> usize {
        T::written_len(self)
    }

    fn write(&self, out: &mut dyn Writable) {
        T::write(self, out)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(hex!("0064").to_vec(), 100u16.to_vec());
        assert_eq!(hex!("7e8a6925").to_vec(), 2_123_000_101u32.to_vec());
        assert_eq!(4, 100u32.written_len());
    }

    #[test]
    fn tuple_and_option_concatenate() {
        let none: Option<u16> = None;
        let written = (1u16, [0xAAu8, 0xBB], none, Some(2u32)).to_vec();
        assert_eq!(hex!("0001 AABB 00000002").to_vec(), written);
        assert_eq!(8, (1u16, [0xAAu8, 0xBB], none, Some(2u32)).written_len());
    }

    #[test]
    fn vec_of_writers() {
        let items = vec![(1u16, 2u16), (3u16, 4u16)];
        assert_eq!(hex!("0001 0002 0003 0004").to_vec(), items.to_vec());
    }
}
