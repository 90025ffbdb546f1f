//! Queue serials and the watermark ledger.
//!
//! Every unit of submitted work is stamped with a [`QueueSerial`]: a strictly
//! increasing counter scoped to a [`SerialIndex`]. The [`SerialLedger`] keeps
//! four per-index counters:
//!
//! - the allocation counter handed out by [`SerialLedger::reserve_next`],
//! - the enqueued watermark (work handed to the async worker),
//! - the submitted watermark (work handed to the native queue),
//! - the completed watermark (work whose fence has been observed signaled).
//!
//! For every index `completed <= submitted <= enqueued` holds at all times.
//! Watermarks are plain atomics so that "has this finished" queries never
//! contend with the submission path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter value within one serial index. `Serial::ZERO` is never
/// handed out and means "nothing yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(u64);

impl Serial {
    pub const ZERO: Serial = Serial(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logically independent submission context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SerialIndex(u32);

impl SerialIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SerialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A serial together with the index it belongs to. Two queue serials are only
/// comparable when they share an index, so no ordering is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueueSerial {
    pub index: SerialIndex,
    pub serial: Serial,
}

impl QueueSerial {
    pub const fn new(index: SerialIndex, serial: Serial) -> Self {
        Self { index, serial }
    }

    pub fn is_valid(&self) -> bool {
        self.serial != Serial::ZERO
    }
}

impl fmt::Display for QueueSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.serial)
    }
}

/// Highest serial, per index, at which a resource was referenced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUse {
    serials: Vec<Serial>,
}

impl ResourceUse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reference at `queue_serial`, keeping the highest serial seen
    /// for its index.
    pub fn set_queue_serial(&mut self, queue_serial: QueueSerial) {
        let slot = queue_serial.index.slot();
        if self.serials.len() <= slot {
            self.serials.resize(slot + 1, Serial::ZERO);
        }
        if self.serials[slot] < queue_serial.serial {
            self.serials[slot] = queue_serial.serial;
        }
    }

    pub fn serial(&self, index: SerialIndex) -> Serial {
        self.serials.get(index.slot()).copied().unwrap_or(Serial::ZERO)
    }

    /// Non-zero entries only.
    pub fn iter(&self) -> impl Iterator<Item = QueueSerial> + '_ {
        self.serials
            .iter()
            .enumerate()
            .filter(|(_, serial)| **serial != Serial::ZERO)
            .map(|(slot, serial)| QueueSerial::new(SerialIndex::new(slot as u32), *serial))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl From<QueueSerial> for ResourceUse {
    fn from(queue_serial: QueueSerial) -> Self {
        let mut use_ = ResourceUse::new();
        use_.set_queue_serial(queue_serial);
        use_
    }
}

/// Fixed-size array of atomic watermarks, one per serial index.
struct Watermarks(Box<[AtomicU64]>);

impl Watermarks {
    fn new(count: usize) -> Self {
        Self((0..count).map(|_| AtomicU64::new(0)).collect())
    }

    /// `Serial::ZERO` for indices the ledger does not track.
    fn load(&self, index: SerialIndex) -> Serial {
        self.0
            .get(index.slot())
            .map_or(Serial::ZERO, |value| Serial(value.load(Ordering::Acquire)))
    }

    /// Raise the watermark to `serial`, returning the previous value. Untracked
    /// indices are ignored.
    fn advance(&self, index: SerialIndex, serial: Serial) -> Serial {
        self.0
            .get(index.slot())
            .map_or(Serial::ZERO, |value| Serial(value.fetch_max(serial.0, Ordering::AcqRel)))
    }

    fn covers(&self, use_: &ResourceUse) -> bool {
        use_.iter()
            .all(|qs| qs.index.slot() < self.0.len() && qs.serial <= self.load(qs.index))
    }
}

/// Per-index serial allocator and lifecycle watermarks. Owned explicitly and
/// shared through an `Arc`; there is no process-wide instance.
pub struct SerialLedger {
    next: Watermarks,
    enqueued: Watermarks,
    submitted: Watermarks,
    completed: Watermarks,
}

impl SerialLedger {
    pub fn new(index_count: usize) -> Self {
        Self {
            next: Watermarks::new(index_count),
            enqueued: Watermarks::new(index_count),
            submitted: Watermarks::new(index_count),
            completed: Watermarks::new(index_count),
        }
    }

    pub fn index_count(&self) -> usize {
        self.next.0.len()
    }

    pub fn contains(&self, index: SerialIndex) -> bool {
        index.slot() < self.index_count()
    }

    /// Allocate the next serial for `index`. Other threads can observe the
    /// pending work (via the enqueued/submitted watermarks) only once the
    /// serial has been advanced through them.
    ///
    /// An index outside the ledger yields an invalid serial (`Serial::ZERO`),
    /// which every submission path rejects.
    pub fn reserve_next(&self, index: SerialIndex) -> QueueSerial {
        match self.next.0.get(index.slot()) {
            Some(next) => QueueSerial::new(index, Serial(next.fetch_add(1, Ordering::AcqRel) + 1)),
            None => QueueSerial::new(index, Serial::ZERO),
        }
    }

    pub fn advance_enqueued(&self, queue_serial: QueueSerial) {
        let prev = self.enqueued.advance(queue_serial.index, queue_serial.serial);
        debug_assert!(
            prev <= queue_serial.serial,
            "enqueued watermark for {} moved backwards: {} -> {}",
            queue_serial.index,
            prev,
            queue_serial.serial
        );
    }

    /// Mark `queue_serial` as handed to the native queue. Submission implies
    /// enqueue, so the enqueued watermark is raised along with it.
    pub fn advance_submitted(&self, queue_serial: QueueSerial) {
        self.enqueued.advance(queue_serial.index, queue_serial.serial);
        let prev = self.submitted.advance(queue_serial.index, queue_serial.serial);
        debug_assert!(
            prev <= queue_serial.serial,
            "submitted watermark for {} moved backwards: {} -> {}",
            queue_serial.index,
            prev,
            queue_serial.serial
        );
    }

    pub fn advance_completed(&self, queue_serial: QueueSerial) {
        debug_assert!(
            queue_serial.serial <= self.submitted.load(queue_serial.index),
            "completed {} ahead of submitted watermark",
            queue_serial
        );
        let prev = self.completed.advance(queue_serial.index, queue_serial.serial);
        debug_assert!(
            prev <= queue_serial.serial,
            "completed watermark for {} moved backwards: {} -> {}",
            queue_serial.index,
            prev,
            queue_serial.serial
        );
    }

    pub fn last_reserved(&self, index: SerialIndex) -> Serial {
        self.next.load(index)
    }

    pub fn last_enqueued(&self, index: SerialIndex) -> Serial {
        self.enqueued.load(index)
    }

    pub fn last_submitted(&self, index: SerialIndex) -> Serial {
        self.submitted.load(index)
    }

    pub fn last_completed(&self, index: SerialIndex) -> Serial {
        self.completed.load(index)
    }

    pub fn is_enqueued(&self, use_: &ResourceUse) -> bool {
        self.enqueued.covers(use_)
    }

    pub fn is_submitted(&self, use_: &ResourceUse) -> bool {
        self.submitted.covers(use_)
    }

    pub fn is_finished(&self, use_: &ResourceUse) -> bool {
        self.completed.covers(use_)
    }

    pub fn is_serial_submitted(&self, queue_serial: QueueSerial) -> bool {
        self.contains(queue_serial.index)
            && queue_serial.serial <= self.submitted.load(queue_serial.index)
    }

    pub fn is_serial_finished(&self, queue_serial: QueueSerial) -> bool {
        self.contains(queue_serial.index)
            && queue_serial.serial <= self.completed.load(queue_serial.index)
    }

    /// The most recently submitted serial of every index.
    pub fn submitted_snapshot(&self) -> ResourceUse {
        let mut use_ = ResourceUse::new();
        for slot in 0..self.index_count() {
            let index = SerialIndex::new(slot as u32);
            use_.set_queue_serial(QueueSerial::new(index, self.submitted.load(index)));
        }
        use_
    }

    /// Device-lost path: pretend everything that was ever enqueued got
    /// submitted and completed, so no waiter blocks forever.
    pub fn force_complete_all(&self) {
        for slot in 0..self.index_count() {
            let index = SerialIndex::new(slot as u32);
            let enqueued = self.enqueued.load(index);
            self.submitted.advance(index, enqueued);
            let submitted = self.submitted.load(index);
            self.completed.advance(index, submitted);
        }
        tracing::warn!("serial ledger forced to completion for {} indices", self.index_count());
    }
}

impl fmt::Debug for SerialLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for slot in 0..self.index_count() {
            let index = SerialIndex::new(slot as u32);
            list.entry(&(
                index,
                self.last_completed(index),
                self.last_submitted(index),
                self.last_enqueued(index),
            ));
        }
        list.finish()
    }
}
