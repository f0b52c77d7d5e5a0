//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Fixed-capacity pools for packet and frame buffers, sized when a channel opens.
//!
//! Running dry is a reported condition, not an error: callers get `None` and decide how to
//! shed work.

/// Something that can be reset to a reusable state before going back into its pool.
pub trait Recycle {
    fn recycle(&mut self);
}

#[derive(Debug)]
pub struct Pool<T> {
    free: Vec<T>,
    capacity: usize,
}

impl<T: Recycle> Pool<T> {
    pub fn new(capacity: usize, mut make: impl FnMut() -> T) -> Self {
        Self {
            free: (0..capacity).map(|_| make()).collect(),
            capacity,
        }
    }

    pub fn take(&mut self) -> Option<T> {
        self.free.pop()
    }

    pub fn give_back(&mut self, mut item: T) {
        item.recycle();
        if self.free.len() < self.capacity {
            self.free.push(item);
        } else {
            debug_assert!(false, "returned more items than the pool was created with");
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Item(Vec<u8>);

    impl Recycle for Item {
        fn recycle(&mut self) {
            self.0.clear();
        }
    }

    #[test]
    fn take_until_exhausted() {
        let mut pool = Pool::new(2, Item::default);
        assert_eq!(2, pool.available());
        let mut first = pool.take().unwrap();
        let _second = pool.take().unwrap();
        assert!(pool.is_exhausted());
        assert!(pool.take().is_none());

        first.0.extend_from_slice(b"abc");
        pool.give_back(first);
        assert_eq!(1, pool.available());
        assert!(pool.take().unwrap().0.is_empty());
        assert_eq!(2, pool.capacity());
    }
}
