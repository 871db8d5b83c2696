use std::any::TypeId;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::warn;

use super::ring::{RingBuffer, Slot, MAX_ALIGN};

/// Smallest number of bytes one record occupies in the ring.
///
/// Bounds the header array at `capacity / MIN_RECORD_SIZE` entries.
pub const MIN_RECORD_SIZE: usize = 8;

/// Values that can be stored in a record buffer.
///
/// `Copy` means clearing a buffer never has to run destructors.
pub trait Record: Copy + Send + Sync + 'static {}

impl<T: Copy + Send + Sync + 'static> Record for T {}

/// Tag and payload location of one stored record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub category: u32,
    pub kind: u32,
    payload: Option<Payload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Payload {
    slot: Slot,
    type_id: TypeId,
}

impl RecordHeader {
    fn is_populated(&self) -> bool {
        self.category != 0 || self.payload.is_some()
    }
}

/// A stored record, borrowed for the duration of a drain.
#[derive(Clone, Copy)]
pub struct RecordRef<'a> {
    header: RecordHeader,
    ring: &'a RingBuffer,
}

impl<'a> RecordRef<'a> {
    pub fn category(&self) -> u32 {
        self.header.category
    }

    pub fn kind(&self) -> u32 {
        self.header.kind
    }

    /// Whether the payload was stored as a `T`.
    pub fn is<T: Record>(&self) -> bool {
        matches!(self.header.payload, Some(p) if p.type_id == TypeId::of::<T>())
    }

    /// The payload, if it was stored as a `T`.
    pub fn payload<T: Record>(&self) -> Option<&'a T> {
        if !self.is::<T>() {
            return None;
        }
        let payload = self.header.payload?;
        // The slot was written with a `T` by `emplace` and the exclusive
        // drain gate keeps writers out while this reference lives.
        Some(unsafe { self.ring.get::<T>(payload.slot) })
    }
}

impl std::fmt::Debug for RecordRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRef")
            .field("category", &self.header.category)
            .field("kind", &self.header.kind)
            .finish()
    }
}

/// A [`RingBuffer`] paired with one header per stored record.
///
/// Any number of threads may `emplace` concurrently. Reserving ring space
/// happens under the exclusive side of an internal lock, which is then
/// downgraded to shared for constructing the value and its header; each
/// emplacer owns a distinct header slot through an atomic index. Draining
/// takes the exclusive side for its whole duration; [`RecordHeaderBuffer::try_emplace`]
/// gives up instead of waiting for it.
pub struct RecordHeaderBuffer {
    ring: RingBuffer,
    headers: Box<[UnsafeCell<RecordHeader>]>,
    next_header: AtomicUsize,
    in_flight: AtomicU64,
    lock: RwLock<()>,
    gate_state: Mutex<GateState>,
    /// Threads holding or waiting for the exclusive gate.
    gated: AtomicUsize,
}

/// Thread holding the exclusive gate and how many times it took it.
#[derive(Debug, Default)]
struct GateState {
    owner: Option<ThreadId>,
    depth: usize,
}

// Header cells are written only at an index owned by one emplacer, under the
// shared lock, and read only under the exclusive lock.
unsafe impl Sync for RecordHeaderBuffer {}

impl RecordHeaderBuffer {
    pub fn new(capacity: usize) -> Self {
        let ring = RingBuffer::new(capacity);
        let max_records = ring.capacity().div_ceil(MIN_RECORD_SIZE);
        let headers = (0..max_records)
            .map(|_| UnsafeCell::new(RecordHeader::default()))
            .collect();

        Self {
            ring,
            headers,
            next_header: AtomicUsize::new(0),
            in_flight: AtomicU64::new(0),
            lock: RwLock::new(()),
            gate_state: Mutex::new(GateState::default()),
            gated: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes currently reserved, alignment padding included.
    pub fn count(&self) -> usize {
        self.ring.count()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Records stored since the last clear.
    pub fn len(&self) -> usize {
        self.next_header.load(Ordering::Acquire).min(self.headers.len())
    }

    /// Emplace calls currently between reservation and completion.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Whether a `T` could ever fit in this buffer.
    pub fn can_hold<T: Record>(&self) -> bool {
        record_size::<T>() <= self.ring.capacity() && mem::align_of::<T>() <= MAX_ALIGN
    }

    /// Stores `value` tagged with `category` and `kind`.
    ///
    /// Returns `false` when the buffer has no room; the caller decides
    /// whether to drop or retry.
    pub fn emplace<T: Record>(&self, category: u32, kind: u32, value: T) -> bool {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let stored = self.store(self.lock.write(), category, kind, value);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        stored
    }

    /// Like [`RecordHeaderBuffer::emplace`], but returns `false` instead of
    /// waiting while a drain holds or wants the gate.
    ///
    /// Only other emplacers are waited for, and only while they reserve
    /// space or write their value.
    pub fn try_emplace<T: Record>(&self, category: u32, kind: u32, value: T) -> bool {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let stored = loop {
            if self.gated.load(Ordering::SeqCst) > 0 {
                break false;
            }
            if let Some(exclusive) = self.lock.try_write() {
                break self.store(exclusive, category, kind, value);
            }
            std::hint::spin_loop();
        };
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        stored
    }

    fn store<T: Record>(
        &self,
        exclusive: RwLockWriteGuard<'_, ()>,
        category: u32,
        kind: u32,
        value: T,
    ) -> bool {
        let Some(slot) = self
            .ring
            .request(record_size::<T>(), mem::align_of::<T>(), false)
        else {
            return false;
        };
        let _shared = RwLockWriteGuard::downgrade(exclusive);

        let index = self.next_header.fetch_add(1, Ordering::AcqRel);
        let Some(cell) = self.headers.get(index) else {
            // Unreachable while every record takes at least MIN_RECORD_SIZE
            // bytes; the slot is simply leaked until the next clear.
            return false;
        };

        // The slot is ours alone: `request` hands out disjoint regions and a
        // drain cannot start while we hold the shared lock.
        unsafe {
            self.ring.write(slot, value);
            *cell.get() = RecordHeader {
                category,
                kind,
                payload: Some(Payload {
                    slot,
                    type_id: TypeId::of::<T>(),
                }),
            };
        }
        true
    }

    /// Runs `callback` over every stored record under the exclusive gate,
    /// then clears the buffer if `clear_after` is set.
    ///
    /// This is the only point where records are read; no emplace can make
    /// progress while it runs.
    pub fn process_record_headers<R>(
        &self,
        clear_after: bool,
        callback: impl FnOnce(&[RecordRef<'_>]) -> R,
    ) -> R {
        let _gate = self.gate();

        let records: Vec<RecordRef<'_>> = self.headers[..self.len()]
            .iter()
            // The gate excludes every writer.
            .map(|cell| unsafe { *cell.get() })
            .filter(RecordHeader::is_populated)
            .map(|header| RecordRef {
                header,
                ring: &self.ring,
            })
            .collect();

        let out = callback(&records);
        drop(records);

        if clear_after {
            self.clear_locked();
        }
        out
    }

    /// Drops every stored record.
    pub fn clear(&self) {
        let _gate = self.gate();
        self.clear_locked();
    }

    fn clear_locked(&self) {
        for cell in &self.headers[..self.len()] {
            unsafe { *cell.get() = RecordHeader::default() };
        }
        self.next_header.store(0, Ordering::Release);
        if !self.ring.try_clear() {
            self.ring.reset();
        }
    }

    /// Takes the exclusive gate.
    ///
    /// Reentrant on the owning thread, where nested calls only count. Other
    /// threads block until the owner releases its last level. Emplacing
    /// while holding the gate deadlocks.
    pub fn lock(&self) {
        let me = thread::current().id();
        {
            let mut state = self.gate_state.lock();
            if state.owner == Some(me) {
                state.depth += 1;
                return;
            }
        }

        self.gated.fetch_add(1, Ordering::SeqCst);
        mem::forget(self.lock.write());
        let mut state = self.gate_state.lock();
        state.owner = Some(me);
        state.depth = 1;
    }

    /// Releases one [`RecordHeaderBuffer::lock`] taken by this thread; the
    /// last one unlocks.
    pub fn unlock(&self) {
        let mut state = self.gate_state.lock();
        if state.owner != Some(thread::current().id()) || state.depth == 0 {
            warn!("Unbalanced record buffer unlock ignored");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            // Held by this thread since its outermost `lock`.
            unsafe { self.lock.force_unlock_write() };
            self.gated.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Scoped [`RecordHeaderBuffer::lock`].
    pub fn gate(&self) -> Gate<'_> {
        self.lock();
        Gate {
            buffer: self,
            _not_send: PhantomData,
        }
    }
}

/// Holds the exclusive gate of a [`RecordHeaderBuffer`] until dropped.
///
/// Bound to the thread that took it.
pub struct Gate<'a> {
    buffer: &'a RecordHeaderBuffer,
    _not_send: PhantomData<*const ()>,
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.buffer.unlock();
    }
}

fn record_size<T>() -> usize {
    mem::size_of::<T>().max(MIN_RECORD_SIZE)
}
