//! # Sampling Buffer Manager
//!
//! Ring buffer of overflow snapshots, shared read-only with the session
//! owner. The wire layout is bit-exact: a fixed header {format version,
//! entry size, live entry count} followed by fixed-size entries, each a
//! [`SampleEntry`] plus a register-snapshot tail whose length is fixed at
//! buffer creation by the recorded-register set.
//!
//! Slots are claimed with an atomic fetch-and-add so overflow handlers on
//! different CPUs can append without an external lock; the price is that
//! the "was that the last slot" check happens after the claim.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use static_assertions::const_assert_eq;

use crate::error::{PmuError, Result};
use crate::regset::RegSet;

/// Sample format version, `major.minor` packed 16.16.
pub const SAMPLE_FORMAT_VERSION: u32 = 1 << 16;

/// Hard cap on requested buffer entries.
pub const MAX_SAMPLE_ENTRIES: usize = 1 << 16;

// =============================================================================
// Wire Layout
// =============================================================================

/// User-visible buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SampleHeader {
    /// Format version of the entries that follow.
    pub version: u32,
    /// Size in bytes of one entry, tail included.
    pub entry_size: u32,
    /// Number of live entries.
    pub count: u32,
    pub _reserved: u32,
}

/// Fixed head of one sample entry; followed on the wire by one `u64` per
/// recorded register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SampleEntry {
    /// Pid of the monitored task.
    pub pid: u32,
    /// CPU the overflow was handled on.
    pub cpu: u32,
    /// Last reset value of the first overflowed counter.
    pub last_reset: u64,
    /// Instruction pointer at interrupt time.
    pub ip: u64,
    /// Mask of counting registers that overflowed.
    pub ovfl_regs: u64,
    /// Monotonic per-CPU timestamp.
    pub tstamp: u64,
    /// Reserved sampling-period field.
    pub period: u64,
}

const_assert_eq!(core::mem::size_of::<SampleHeader>(), 16);
const_assert_eq!(core::mem::size_of::<SampleEntry>(), 48);

/// Words per entry head. The register tail follows at this offset.
const ENTRY_HEAD_WORDS: usize = core::mem::size_of::<SampleEntry>() / 8;

// =============================================================================
// Buffer
// =============================================================================

/// Outcome of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Record written; `filled` when it landed in the last free slot.
    Recorded { filled: bool },
    /// No free slot; the sample is lost.
    Dropped,
}

/// One decoded sample record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub entry: SampleEntry,
    pub values: Vec<u64>,
}

/// Ring buffer of overflow samples.
///
/// Reference-counted: the creating context, any context that inherited it
/// across fork, and outstanding [`SampleView`]s all hold an `Arc`. The
/// memory goes away only when every reference is gone — the two-sided
/// teardown condition (no owner *and* no mapping).
#[derive(Debug)]
pub struct SampleBuffer {
    entries: usize,
    entry_words: usize,
    recorded: RegSet,
    data: UnsafeCell<Box<[u64]>>,
    write_idx: AtomicU64,
    count: AtomicU32,
    /// Buffer filled while a notification was outstanding; the reset is
    /// deferred to the explicit restart.
    pending_reset: AtomicBool,
    full_events: AtomicU64,
}

// Safety: slots are written only by the claimant of their index (the
// atomic fetch-and-add hands each index to exactly one producer), and
// readers only look below `count`, which is published after the write.
unsafe impl Sync for SampleBuffer {}

impl SampleBuffer {
    /// Allocate a buffer of `entries` slots recording the registers in
    /// `recorded`.
    pub fn new(entries: usize, recorded: RegSet) -> Result<Arc<Self>> {
        if entries == 0 || entries > MAX_SAMPLE_ENTRIES {
            return Err(PmuError::InvalidArgument);
        }
        let entry_words = ENTRY_HEAD_WORDS + recorded.count();
        let words = entries.checked_mul(entry_words).ok_or(PmuError::ResourceExhausted)?;
        Ok(Arc::new(Self {
            entries,
            entry_words,
            recorded,
            data: UnsafeCell::new(vec![0u64; words].into_boxed_slice()),
            write_idx: AtomicU64::new(0),
            count: AtomicU32::new(0),
            pending_reset: AtomicBool::new(false),
            full_events: AtomicU64::new(0),
        }))
    }

    /// Number of slots.
    #[inline]
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Registers recorded in each entry's tail.
    #[inline]
    pub fn recorded(&self) -> RegSet {
        self.recorded
    }

    /// Entry size in bytes, tail included.
    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_words * 8
    }

    /// Snapshot of the user-visible header.
    pub fn header(&self) -> SampleHeader {
        SampleHeader {
            version: SAMPLE_FORMAT_VERSION,
            entry_size: self.entry_size() as u32,
            count: self.count.load(Ordering::Acquire),
            _reserved: 0,
        }
    }

    /// Times the buffer has gone full.
    pub fn full_events(&self) -> u64 {
        self.full_events.load(Ordering::Relaxed)
    }

    /// Is a deferred reset outstanding?
    pub(crate) fn reset_pending(&self) -> bool {
        self.pending_reset.load(Ordering::Acquire)
    }

    /// Defer the post-full reset to the next explicit restart.
    pub(crate) fn defer_reset(&self) {
        self.pending_reset.store(true, Ordering::Release);
    }

    /// Drop all recorded entries and start over at slot zero.
    pub(crate) fn reset(&self) {
        self.count.store(0, Ordering::Release);
        self.write_idx.store(0, Ordering::Release);
        self.pending_reset.store(false, Ordering::Release);
    }

    /// Claim the next slot and write one record into it.
    ///
    /// `values` must hold one snapshot per recorded register, in register
    /// order.
    pub(crate) fn append(&self, entry: SampleEntry, values: &[u64]) -> Append {
        debug_assert_eq!(values.len(), self.recorded.count());

        let idx = self.write_idx.fetch_add(1, Ordering::AcqRel);
        if idx >= self.entries as u64 {
            return Append::Dropped;
        }

        let base = idx as usize * self.entry_words;
        // Safety: `idx` was claimed exclusively above and is in bounds;
        // the written range belongs to this producer alone.
        unsafe {
            let words = (*self.data.get()).as_mut_ptr();
            let slot = words.add(base) as *mut SampleEntry;
            slot.write(entry);
            let tail = words.add(base + ENTRY_HEAD_WORDS);
            for (i, value) in values.iter().enumerate() {
                tail.add(i).write(*value);
            }
        }
        self.count.fetch_add(1, Ordering::Release);

        Append::Recorded {
            filled: idx as usize == self.entries - 1,
        }
    }

    /// Note that an append filled the buffer.
    pub(crate) fn note_full(&self) {
        self.full_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Decode live entry `idx`.
    pub fn record(&self, idx: usize) -> Option<SampleRecord> {
        if idx >= self.count.load(Ordering::Acquire) as usize {
            return None;
        }
        let base = idx * self.entry_words;
        // Safety: entries below `count` are fully written and published.
        unsafe {
            let words = (*self.data.get()).as_ptr();
            let entry = (words.add(base) as *const SampleEntry).read();
            let tail = words.add(base + ENTRY_HEAD_WORDS);
            let values = (0..self.recorded.count()).map(|i| tail.add(i).read()).collect();
            Some(SampleRecord { entry, values })
        }
    }
}

// =============================================================================
// Read-Only View
// =============================================================================

/// Read-only handle to a sample buffer, standing in for the user-space
/// mapping. Keeps the buffer alive independently of the owning session.
#[derive(Debug, Clone)]
pub struct SampleView {
    buffer: Arc<SampleBuffer>,
}

impl SampleView {
    pub(crate) fn new(buffer: Arc<SampleBuffer>) -> Self {
        Self { buffer }
    }

    /// The user-visible header.
    pub fn header(&self) -> SampleHeader {
        self.buffer.header()
    }

    /// Decode live entry `idx`.
    pub fn record(&self, idx: usize) -> Option<SampleRecord> {
        self.buffer.record(idx)
    }

    /// Number of slots.
    pub fn entries(&self) -> usize {
        self.buffer.entries()
    }
}
