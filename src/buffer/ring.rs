use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Largest alignment a slot can be requested with.
pub const MAX_ALIGN: usize = 64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring buffer cleared with {read_cursor} bytes of reads outstanding")]
    ReadsOutstanding { read_cursor: usize },
}

#[repr(C, align(64))]
struct Chunk([MaybeUninit<u8>; MAX_ALIGN]);

/// A reserved byte region of a [`RingBuffer`].
///
/// Slots stay valid until the ring is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub len: usize,
}

/// Fixed-capacity circular byte arena with lock-free cursors.
///
/// Cursors only grow; physical offsets are taken modulo the capacity, so
/// `write - read` is always the number of bytes in use, skipped tail bytes
/// included. The arena base is 64-byte aligned, which makes any slot offset
/// aligned to `align <= 64` land on a properly aligned address.
pub struct RingBuffer {
    arena: Box<[UnsafeCell<Chunk>]>,
    capacity: usize,
    write: AtomicUsize,
    read: AtomicUsize,
}

// Slots handed out by `request` are disjoint; callers synchronize access to
// the bytes of each slot themselves.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a ring holding exactly `capacity` bytes (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let chunks = capacity.div_ceil(MAX_ALIGN);
        let arena = (0..chunks)
            .map(|_| UnsafeCell::new(Chunk([MaybeUninit::uninit(); MAX_ALIGN])))
            .collect();

        Self {
            arena,
            capacity,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes between the read and write cursors.
    pub fn count(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        self.write.load(Ordering::Acquire).saturating_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn write_cursor(&self) -> usize {
        self.write.load(Ordering::Acquire)
    }

    pub fn read_cursor(&self) -> usize {
        self.read.load(Ordering::Acquire)
    }

    /// Reserves `n` bytes aligned to `align`.
    ///
    /// A region that would cross the physical end either starts over at
    /// offset 0, leaving the tail unused (`wrap`), or fails. Also fails when
    /// the ring lacks `n` free bytes, when `n == 0`, or when `align` is not
    /// a power of two no larger than [`MAX_ALIGN`].
    pub fn request(&self, n: usize, align: usize, wrap: bool) -> Option<Slot> {
        if n == 0 || n > self.capacity || !valid_align(align) {
            return None;
        }

        loop {
            let write = self.write.load(Ordering::Acquire);
            let read = self.read.load(Ordering::Acquire);

            let start = self.place(write, n, align, wrap)?;
            let end = start + n;
            if end - read > self.capacity {
                return None;
            }

            if self
                .write
                .compare_exchange_weak(write, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Slot {
                    offset: start % self.capacity,
                    len: n,
                });
            }
        }
    }

    /// Consumes the next `n` bytes aligned to `align`, mirroring the layout
    /// a matching [`RingBuffer::request`] with `wrap = true` produced.
    pub fn retrieve(&self, n: usize, align: usize) -> Option<Slot> {
        if n == 0 || n > self.capacity || !valid_align(align) {
            return None;
        }

        loop {
            let read = self.read.load(Ordering::Acquire);
            let write = self.write.load(Ordering::Acquire);
            if read >= write {
                return None;
            }

            let start = self.place(read, n, align, true)?;
            let end = start + n;
            if end > write {
                return None;
            }

            if self
                .read
                .compare_exchange_weak(read, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Slot {
                    offset: start % self.capacity,
                    len: n,
                });
            }
        }
    }

    /// Logical start of an `n`-byte region placed after `cursor`.
    fn place(&self, cursor: usize, n: usize, align: usize, wrap: bool) -> Option<usize> {
        let offset = cursor % self.capacity;
        let aligned = offset.next_multiple_of(align);
        if aligned + n <= self.capacity {
            return Some(cursor + (aligned - offset));
        }
        if !wrap {
            return None;
        }
        Some(cursor + (self.capacity - offset))
    }

    /// Resets both cursors. Fails while reads are outstanding.
    pub fn clear(&self) -> Result<(), RingError> {
        let read_cursor = self.read.load(Ordering::Acquire);
        if read_cursor != 0 {
            return Err(RingError::ReadsOutstanding { read_cursor });
        }
        self.write.store(0, Ordering::Release);
        Ok(())
    }

    /// Non-failing form of [`RingBuffer::clear`]; returns whether it cleared.
    pub fn try_clear(&self) -> bool {
        self.clear().is_ok()
    }

    /// Resets both cursors regardless of outstanding reads.
    ///
    /// Callers must guarantee nothing still references retrieved slots.
    pub fn reset(&self) {
        self.read.store(0, Ordering::Release);
        self.write.store(0, Ordering::Release);
    }

    /// Raw pointer to the first byte of `slot`.
    pub fn slot_ptr(&self, slot: Slot) -> *mut u8 {
        debug_assert!(slot.offset + slot.len <= self.capacity);
        let base = UnsafeCell::raw_get(self.arena.as_ptr()).cast::<u8>();
        // In bounds: offset + len never exceeds capacity, which never
        // exceeds the arena length in bytes.
        unsafe { base.add(slot.offset) }
    }

    /// Writes `value` into `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must come from this ring's `request` since the last clear,
    /// be at least `size_of::<T>()` long, aligned for `T`, and not be
    /// accessed concurrently.
    pub unsafe fn write<T: Copy>(&self, slot: Slot, value: T) {
        debug_assert!(slot.len >= std::mem::size_of::<T>());
        self.slot_ptr(slot).cast::<T>().write(value);
    }

    /// Reads back a value previously written into `slot`.
    ///
    /// # Safety
    ///
    /// A `T` must have been written into `slot` since the last clear.
    pub unsafe fn read<T: Copy>(&self, slot: Slot) -> T {
        self.slot_ptr(slot).cast::<T>().read()
    }

    /// Borrows a value previously written into `slot`.
    ///
    /// # Safety
    ///
    /// A `T` must have been written into `slot` since the last clear, and
    /// nothing may write to the slot while the reference lives.
    pub unsafe fn get<T>(&self, slot: Slot) -> &T {
        &*self.slot_ptr(slot).cast::<T>()
    }
}

fn valid_align(align: usize) -> bool {
    align.is_power_of_two() && align <= MAX_ALIGN
}
