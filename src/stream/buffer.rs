// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::{
    ErrorKind,
    Fail,
};
use ::std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A lock-free, single writer and single reader, fixed-size circular
/// buffer. One slot is kept empty to distinguish full from empty, so the
/// backing storage holds `capacity + 1` slots. The producer commits a
/// write with a release store on `back`, which the consumer's acquire load
/// pairs with; this is the happens-before edge between a produced item and
/// its consumption.
pub(crate) struct Buffer<T> {
    /// Indexes the first empty slot after the item in the back of the buffer.
    back: AtomicUsize,
    /// Indexes the first item in the front of the buffer.
    front: AtomicUsize,
    /// Underlying storage.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> Buffer<T> {
    /// Creates a buffer holding up to `capacity` items. Zero capacity is
    /// rejected.
    pub fn new(capacity: usize) -> Result<Buffer<T>, Fail> {
        if capacity == 0 {
            return Err(Fail::new(ErrorKind::Inval, "cannot create a buffer with zero capacity"));
        }

        let slots: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..capacity + 1)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Ok(Buffer {
            back: AtomicUsize::new(0),
            front: AtomicUsize::new(0),
            slots,
        })
    }

    /// Returns the number of items the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Peeks the buffer and checks if it is empty.
    pub fn is_empty(&self) -> bool {
        self.back.load(Ordering::Acquire) == self.front.load(Ordering::Acquire)
    }

    /// Peeks the buffer and checks if it is full.
    pub fn is_full(&self) -> bool {
        let back: usize = self.back.load(Ordering::Acquire);
        let front: usize = self.front.load(Ordering::Acquire);
        (back + 1) % self.slots.len() == front
    }

    /// Returns the number of items currently buffered.
    pub fn count(&self) -> usize {
        let back: usize = self.back.load(Ordering::Acquire);
        let front: usize = self.front.load(Ordering::Acquire);
        (back + self.slots.len() - front) % self.slots.len()
    }

    /// Attempts to insert an item at the back of the buffer. Only the
    /// single producer may call this.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        let back: usize = self.back.load(Ordering::Relaxed);
        let next: usize = (back + 1) % self.slots.len();

        // Check if the buffer is full.
        if next == self.front.load(Ordering::Acquire) {
            return Err(item);
        }

        // Write.
        unsafe { (*self.slots[back].get()).write(item) };

        // Commit the write.
        self.back.store(next, Ordering::Release);

        Ok(())
    }

    /// Attempts to remove the item at the front of the buffer. Only the
    /// single consumer may call this.
    pub fn try_get(&self) -> Option<T> {
        let front: usize = self.front.load(Ordering::Relaxed);

        // Check if the buffer is empty.
        if front == self.back.load(Ordering::Acquire) {
            return None;
        }

        // Read.
        let item: T = unsafe { (*self.slots[front].get()).assume_init_read() };

        // Commit the read.
        self.front.store((front + 1) % self.slots.len(), Ordering::Release);

        Some(item)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Send trait implementation.
unsafe impl<T: Send> Send for Buffer<T> {}

/// Sync trait implementation.
unsafe impl<T: Send> Sync for Buffer<T> {}

/// Drop trait implementation. Initialized slots between front and back
/// still hold items that must be dropped.
impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        while self.try_get().is_some() {}
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Buffer;
    use ::std::thread;

    /// Capacity for test buffers.
    const BUFFER_CAPACITY: usize = 64;

    #[test]
    fn new() {
        let buffer: Buffer<u32> = match Buffer::new(BUFFER_CAPACITY) {
            Ok(buffer) => buffer,
            Err(e) => panic!("creating a buffer with valid capacity should be possible: {:?}", e),
        };
        assert_eq!(buffer.capacity(), BUFFER_CAPACITY);
        assert!(buffer.is_empty());
        assert_eq!(buffer.is_full(), false);
        assert_eq!(buffer.count(), 0);
    }

    #[test]
    fn bad_new() {
        match Buffer::<u32>::new(0) {
            Ok(_) => panic!("creating a buffer with zero capacity should fail"),
            Err(_) => {},
        };
    }

    #[test]
    fn put_get_sequential() {
        let buffer: Buffer<u32> = Buffer::new(BUFFER_CAPACITY).unwrap();

        // Fill the buffer.
        for i in 0..buffer.capacity() {
            assert!(buffer.try_put(i as u32).is_ok());
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.count(), BUFFER_CAPACITY);

        // A full buffer rejects further items.
        assert!(buffer.try_put(99).is_err());

        // Drain the buffer in FIFO order.
        for i in 0..buffer.capacity() {
            assert_eq!(buffer.try_get(), Some(i as u32));
        }
        assert!(buffer.is_empty());
        assert!(buffer.try_get().is_none());
    }

    #[test]
    fn wraps_around() {
        let buffer: Buffer<u32> = Buffer::new(2).unwrap();

        // Cycle items through the two-slot buffer to cross the wrap point.
        for i in 0..10 {
            assert!(buffer.try_put(i).is_ok());
            assert_eq!(buffer.try_get(), Some(i));
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn drops_unconsumed_items() {
        let buffer: Buffer<String> = Buffer::new(4).unwrap();
        assert!(buffer.try_put("left in the buffer".to_string()).is_ok());
        assert!(buffer.try_put("also left".to_string()).is_ok());
        // Dropping the buffer must drop the two queued strings.
    }

    #[test]
    fn put_get_concurrent() {
        let buffer: Buffer<u32> = Buffer::new(BUFFER_CAPACITY).unwrap();
        const ITEMS: u32 = 100_000;

        thread::scope(|s| {
            let writer: thread::ScopedJoinHandle<()> = s.spawn(|| {
                for i in 0..ITEMS {
                    loop {
                        if buffer.try_put(i).is_ok() {
                            break;
                        }
                    }
                }
            });
            let reader: thread::ScopedJoinHandle<()> = s.spawn(|| {
                for i in 0..ITEMS {
                    loop {
                        if let Some(item) = buffer.try_get() {
                            assert_eq!(item, i);
                            break;
                        }
                    }
                }
            });

            writer.join().unwrap();
            reader.join().unwrap();
        });
    }
}
