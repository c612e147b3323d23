//! The frame ledger: physical frame allocation and reference counting.
//!
//! The ledger keeps one byte per physical frame. Bit 7 marks the frame as
//! in use (allocated or permanently reserved); bits 0..7 hold a saturating
//! reference count with a maximum of 127. A frame whose byte is zero is
//! available; a frame with the in-use bit set and a zero count is
//! permanently reserved (firmware regions, holes, the ledger's own backing).
//!
//! The ledger is a singleton service in the kernel, but it is an ordinary
//! object here: the boot importer constructs one over the physical range it
//! discovered and injects it into the paging layer, and every test builds a
//! fresh one. All operations serialize through a single internal lock, with
//! interrupts suppressed while it is held, because interrupt handlers may
//! themselves need frames.

use spin::Mutex;

use crate::{
    HumanSize, PAGE_SIZE, PhysicalAddress,
    address::PhysAccess,
    arch,
    numbers::FrameNumber,
};

/// Largest reference count a frame can carry. Increments beyond this are
/// reported as [`LedgerError::RefOverflow`], never wrapped or silently
/// saturated, because unmap correctness depends on accurate counts.
pub const MAX_REFCOUNT: u8 = 0x7F;

/// In-use marker, bit 7 of a ledger byte.
const IN_USE: u8 = 0x80;

/// Reference-count mask, bits 0..7 of a ledger byte.
const COUNT_MASK: u8 = 0x7F;

/// Errors that can occur during ledger operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    /// No run of free frames long enough to satisfy the request.
    Exhausted,
    /// A frame in the requested range is already reserved or referenced.
    InUse,
    /// A frame in the requested range carries no references.
    Unallocated,
    /// A frame's reference count is already at [`MAX_REFCOUNT`].
    RefOverflow,
    /// The requested range is outside the frames the ledger tracks.
    OutOfRange,
}

/// Represents a single entry in a boot-time physical memory map.
///
/// Implement this trait on the bootloader's memory map entry type to let
/// [`FrameLedger::import_boot_map`] mark reserved and usable regions.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains usable memory.
    ///
    /// Usable memory can be freely allocated. Non-usable memory (firmware
    /// tables, device windows, holes) must return `false`.
    fn is_usable(&self) -> bool;
}

/// The byte table and its bounds. Lives behind the ledger's lock.
struct Table {
    /// Pointer to the byte table, one byte per tracked frame.
    bytes: *mut u8,
    /// First frame index the ledger tracks.
    first: usize,
    /// Number of tracked frames.
    len: usize,
    /// Frame range occupied by the table itself (inclusive bounds), kept so
    /// boot-map import cannot release the ledger's own backing.
    own: (usize, usize),
}

// SAFETY: the ledger exclusively owns the memory behind `bytes` for its
// lifetime, and every access goes through the enclosing Mutex.
unsafe impl Send for Table {}

impl Table {
    fn index(&self, frame: FrameNumber) -> Result<usize, LedgerError> {
        let f = frame.as_usize();
        if f >= self.first && f < self.first + self.len {
            Ok(f - self.first)
        } else {
            Err(LedgerError::OutOfRange)
        }
    }

    /// Validates `[first, first + count)` and returns the starting table
    /// index.
    fn range(&self, first: FrameNumber, count: usize) -> Result<usize, LedgerError> {
        if count == 0 {
            return Err(LedgerError::OutOfRange);
        }
        let start = self.index(first)?;
        if start + count > self.len {
            return Err(LedgerError::OutOfRange);
        }
        Ok(start)
    }

    fn get(&self, idx: usize) -> u8 {
        debug_assert!(idx < self.len);
        // SAFETY: idx is validated against the table length.
        unsafe { *self.bytes.add(idx) }
    }

    fn set(&mut self, idx: usize, value: u8) {
        debug_assert!(idx < self.len);
        // SAFETY: idx is validated against the table length.
        unsafe { *self.bytes.add(idx) = value }
    }

    /// Re-marks the frames holding the table itself, plus frame 0, as
    /// permanently reserved.
    fn reserve_self(&mut self) {
        let (own_first, own_last) = self.own;
        for f in own_first..=own_last {
            if f >= self.first && f < self.first + self.len {
                let idx = f - self.first;
                self.set(idx, self.get(idx) | IN_USE);
            }
        }
        if self.first == 0 && self.len > 0 {
            self.set(0, self.get(0) | IN_USE);
        }
    }
}

/// Allocation state and reference counts for a range of physical frames.
pub struct FrameLedger {
    inner: Mutex<Table>,
}

impl FrameLedger {
    /// Initializes a ledger tracking `frame_count` frames starting at
    /// `first`, with its byte table stored at physical address `table`.
    ///
    /// The table is zeroed, then the frames it occupies are immediately
    /// reserved: the ledger describes its own backing and must never hand it
    /// out. Frame 0 is reserved as well; it doubles as the "no frame"
    /// sentinel throughout the kernel and is never allocatable.
    ///
    /// # Safety
    ///
    /// `table` must point to `frame_count` bytes of physical memory that are
    /// reachable through the current [`PhysAccess`] and exclusively owned by
    /// the ledger for its lifetime.
    pub unsafe fn init(
        table: PhysicalAddress,
        first: FrameNumber,
        frame_count: usize,
    ) -> FrameLedger {
        let bytes = PhysAccess::current().ptr::<u8>(table);
        // SAFETY: the caller guarantees `frame_count` bytes at `table`.
        unsafe { core::ptr::write_bytes(bytes, 0, frame_count) };

        let own_first = table.as_usize() / PAGE_SIZE;
        let own_last = (table.as_usize() + frame_count - 1) / PAGE_SIZE;
        let mut inner = Table {
            bytes,
            first: first.as_usize(),
            len: frame_count,
            own: (own_first, own_last),
        };
        inner.reserve_self();

        log::info!(
            "frame ledger tracking {} frames ({}) from frame {}",
            frame_count,
            HumanSize(frame_count * PAGE_SIZE),
            first,
        );

        FrameLedger {
            inner: Mutex::new(inner),
        }
    }

    /// Runs `f` with the table locked and interrupts suppressed.
    fn with<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        let _irq = arch::InterruptGuard::enter();
        let mut table = self.inner.lock();
        f(&mut table)
    }

    /// Bulk-marks a frame range as permanently reserved or available.
    ///
    /// Used while importing the boot memory map, before any allocation has
    /// happened; frames in the range must not carry references.
    pub fn set_flags(
        &self,
        first: FrameNumber,
        count: usize,
        reserved: bool,
    ) -> Result<(), LedgerError> {
        self.with(|t| {
            let start = t.range(first, count)?;
            for idx in start..start + count {
                debug_assert!(
                    t.get(idx) & COUNT_MASK == 0,
                    "set_flags over a referenced frame"
                );
                t.set(idx, if reserved { IN_USE } else { 0 });
            }
            Ok(())
        })
    }

    /// Imports a boot-time memory map, marking usable regions available and
    /// everything else reserved. Later entries take precedence, matching the
    /// order firmware reports overlaps in. The ledger's own backing frames
    /// and frame 0 stay reserved regardless of what the map says.
    pub fn import_boot_map<R: BootMemoryRegion>(&self, boot_map: &[R]) {
        self.with(|t| {
            for region in boot_map {
                let base = region.base().as_usize();
                let end = base + region.size();
                // Usable regions only count whole frames; reserved regions
                // taint every frame they touch.
                let (first, last) = if region.is_usable() {
                    (base.div_ceil(PAGE_SIZE), end / PAGE_SIZE)
                } else {
                    (base / PAGE_SIZE, end.div_ceil(PAGE_SIZE))
                };
                for f in first..last {
                    if f >= t.first && f < t.first + t.len {
                        let idx = f - t.first;
                        t.set(idx, if region.is_usable() { 0 } else { IN_USE });
                    }
                }
            }
            t.reserve_self();
        });
    }

    /// Allocates `count` consecutive frames.
    ///
    /// Scans from frame 1 upward for the first run of available frames. On
    /// success every frame in the run has a reference count of exactly 1.
    pub fn alloc(&self, count: usize) -> Result<FrameNumber, LedgerError> {
        debug_assert!(count > 0, "zero-length allocation");
        self.with(|t| {
            let lo = t.first.max(1);
            let hi = t.first + t.len;
            let mut run_start = lo;
            let mut run = 0;
            for f in lo..hi {
                if t.get(f - t.first) == 0 {
                    if run == 0 {
                        run_start = f;
                    }
                    run += 1;
                    if run == count {
                        for g in run_start..run_start + count {
                            t.set(g - t.first, IN_USE | 1);
                        }
                        log::trace!("allocated {count} frame(s) at {run_start}");
                        return Ok(FrameNumber::new(run_start));
                    }
                } else {
                    run = 0;
                }
            }
            Err(LedgerError::Exhausted)
        })
    }

    /// Allocates `count` consecutive frames at a caller-chosen start.
    ///
    /// Fails without side effects if any frame in the range is already
    /// reserved or referenced.
    pub fn alloc_at(&self, first: FrameNumber, count: usize) -> Result<(), LedgerError> {
        self.with(|t| {
            let start = t.range(first, count)?;
            for idx in start..start + count {
                if t.get(idx) != 0 {
                    return Err(LedgerError::InUse);
                }
            }
            for idx in start..start + count {
                t.set(idx, IN_USE | 1);
            }
            log::trace!("allocated {count} frame(s) at fixed {first}");
            Ok(())
        })
    }

    /// Asserts ownership of frames that are already known to be in use, such
    /// as a device memory window or the identity-mapped kernel image, by
    /// incrementing each frame's reference count.
    ///
    /// Fails without side effects if any frame in the range is already at
    /// [`MAX_REFCOUNT`]. The range is validated in full before any count is
    /// touched, so a failure never leaves partial increments behind.
    pub fn claim(&self, first: FrameNumber, count: usize) -> Result<(), LedgerError> {
        self.with(|t| {
            let start = t.range(first, count)?;
            for idx in start..start + count {
                if t.get(idx) & COUNT_MASK >= MAX_REFCOUNT {
                    return Err(LedgerError::RefOverflow);
                }
            }
            for idx in start..start + count {
                t.set(idx, IN_USE | ((t.get(idx) & COUNT_MASK) + 1));
            }
            Ok(())
        })
    }

    /// Increments the reference count of each frame in the range.
    ///
    /// Fails without side effects if any frame carries no references (refs
    /// only track frames that were allocated or claimed) or is already at
    /// [`MAX_REFCOUNT`]. The range is validated in full before any count is
    /// touched, so a failure never leaves partial increments behind.
    pub fn ref_range(&self, first: FrameNumber, count: usize) -> Result<(), LedgerError> {
        self.with(|t| {
            let start = t.range(first, count)?;
            for idx in start..start + count {
                let refs = t.get(idx) & COUNT_MASK;
                if refs == 0 {
                    return Err(LedgerError::Unallocated);
                }
                if refs >= MAX_REFCOUNT {
                    return Err(LedgerError::RefOverflow);
                }
            }
            for idx in start..start + count {
                t.set(idx, IN_USE | ((t.get(idx) & COUNT_MASK) + 1));
            }
            Ok(())
        })
    }

    /// Decrements the reference count of each frame in the range. A frame
    /// whose count reaches zero becomes available for allocation again.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds or any frame carries no
    /// references; unbalanced unref is a caller bug, not a runtime
    /// condition.
    pub fn unref_range(&self, first: FrameNumber, count: usize) {
        self.with(|t| {
            let start = t
                .range(first, count)
                .expect("unref of frames outside the ledger");
            for idx in start..start + count {
                let refs = t.get(idx) & COUNT_MASK;
                assert!(refs > 0, "unref of unreferenced frame {}", first + (idx - start));
                if refs == 1 {
                    t.set(idx, 0);
                } else {
                    t.set(idx, IN_USE | (refs - 1));
                }
            }
        })
    }

    /// Returns the reference count of a frame, or zero for frames outside
    /// the tracked range.
    pub fn refcount(&self, frame: FrameNumber) -> u8 {
        self.with(|t| match t.index(frame) {
            Ok(idx) => t.get(idx) & COUNT_MASK,
            Err(_) => 0,
        })
    }

    /// Returns whether a frame is available for allocation.
    pub fn is_available(&self, frame: FrameNumber) -> bool {
        self.with(|t| match t.index(frame) {
            Ok(idx) => t.get(idx) == 0,
            Err(_) => false,
        })
    }

    /// Returns the number of frames currently available for allocation.
    pub fn free_frames(&self) -> usize {
        self.with(|t| (0..t.len).filter(|&idx| t.get(idx) == 0).count())
    }

    /// Returns the number of frames the ledger tracks.
    pub fn total_frames(&self) -> usize {
        self.with(|t| t.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::EmulatedMemory;

    /// Test implementation of BootMemoryRegion.
    struct TestRegion {
        base: PhysicalAddress,
        size: usize,
        usable: bool,
    }

    impl TestRegion {
        fn usable(base: usize, size: usize) -> Self {
            Self {
                base: PhysicalAddress::new(base),
                size,
                usable: true,
            }
        }

        fn reserved(base: usize, size: usize) -> Self {
            Self {
                base: PhysicalAddress::new(base),
                size,
                usable: false,
            }
        }
    }

    impl BootMemoryRegion for TestRegion {
        fn base(&self) -> PhysicalAddress {
            self.base
        }

        fn size(&self) -> usize {
            self.size
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    /// Builds a fresh ledger over frames [0, frames) with its table at
    /// physical address 0.
    fn setup(frames: usize) -> FrameLedger {
        if PhysAccess::try_current().is_none() {
            PhysAccess::set_current(PhysAccess::Emulated(EmulatedMemory::new(frames)));
        }
        // SAFETY: the emulated memory covers the table and nothing else uses it.
        unsafe { FrameLedger::init(PhysicalAddress::new(0), FrameNumber::new(0), frames) }
    }

    #[test]
    fn init_reserves_own_backing_and_frame_zero() {
        let ledger = setup(1024);
        // The 1024-byte table lives in frame 0, which is also the sentinel.
        assert!(!ledger.is_available(FrameNumber::new(0)));
        assert_eq!(ledger.refcount(FrameNumber::new(0)), 0);
        assert!(ledger.is_available(FrameNumber::new(1)));
    }

    #[test]
    fn alloc_skips_frame_zero() {
        let ledger = setup(1024);
        let run = ledger.alloc(4).unwrap();
        assert_eq!(run, FrameNumber::new(1));
        for i in 0..4 {
            assert_eq!(ledger.refcount(run + i), 1);
        }
    }

    #[test]
    fn exhausted_alloc_leaves_ledger_untouched() {
        let ledger = setup(1024);
        let run = ledger.alloc(4).unwrap();

        let free_before = ledger.free_frames();
        assert_eq!(ledger.alloc(1024), Err(LedgerError::Exhausted));
        assert_eq!(ledger.free_frames(), free_before);
        assert_eq!(ledger.refcount(run), 1);
    }

    #[test]
    fn unref_returns_frames_for_reuse() {
        let ledger = setup(1024);
        let run = ledger.alloc(4).unwrap();
        ledger.ref_range(run, 4).unwrap();
        assert_eq!(ledger.refcount(run), 2);

        ledger.unref_range(run, 4);
        assert_eq!(ledger.refcount(run), 1);
        ledger.unref_range(run, 4);
        assert!(ledger.is_available(run));

        // The freed run is the first fit again.
        assert_eq!(ledger.alloc(2).unwrap(), run);
    }

    #[test]
    fn alloc_finds_gap_after_occupied_run() {
        let ledger = setup(64);
        ledger.alloc_at(FrameNumber::new(2), 2).unwrap();
        // Frame 1 is free but too short for a 3-frame run; 4..7 fits.
        assert_eq!(ledger.alloc(3).unwrap(), FrameNumber::new(4));
    }

    #[test]
    fn alloc_at_rejects_overlap() {
        let ledger = setup(64);
        ledger.alloc_at(FrameNumber::new(5), 3).unwrap();
        assert_eq!(
            ledger.alloc_at(FrameNumber::new(7), 2),
            Err(LedgerError::InUse)
        );
        // The failed call did not touch frame 8.
        assert!(ledger.is_available(FrameNumber::new(8)));
    }

    #[test]
    fn ref_of_unallocated_frame_fails_without_side_effects() {
        let ledger = setup(64);
        let run = ledger.alloc(2).unwrap();

        // Range covers one allocated and one free frame; the free frame makes
        // the whole call fail and the allocated frame's count must not move.
        assert_eq!(
            ledger.ref_range(run + 1, 2),
            Err(LedgerError::Unallocated)
        );
        assert_eq!(ledger.refcount(run + 1), 1);
    }

    #[test]
    fn ref_overflow_is_reported() {
        let ledger = setup(64);
        let frame = ledger.alloc(1).unwrap();
        for _ in 1..MAX_REFCOUNT {
            ledger.ref_range(frame, 1).unwrap();
        }
        assert_eq!(ledger.refcount(frame), MAX_REFCOUNT);
        assert_eq!(ledger.ref_range(frame, 1), Err(LedgerError::RefOverflow));
        assert_eq!(ledger.refcount(frame), MAX_REFCOUNT);
    }

    #[test]
    fn claim_increments_reserved_frames() {
        let ledger = setup(64);
        ledger.set_flags(FrameNumber::new(10), 4, true).unwrap();
        assert_eq!(ledger.refcount(FrameNumber::new(10)), 0);

        ledger.claim(FrameNumber::new(10), 4).unwrap();
        assert_eq!(ledger.refcount(FrameNumber::new(10)), 1);

        // A frame whose count reaches zero is available again.
        ledger.unref_range(FrameNumber::new(10), 4);
        assert!(ledger.is_available(FrameNumber::new(10)));
    }

    #[test]
    #[should_panic(expected = "unref of unreferenced frame")]
    fn unbalanced_unref_panics() {
        let ledger = setup(64);
        ledger.unref_range(FrameNumber::new(3), 1);
    }

    #[test]
    fn out_of_range_operations_fail() {
        let ledger = setup(64);
        assert_eq!(
            ledger.alloc_at(FrameNumber::new(60), 8),
            Err(LedgerError::OutOfRange)
        );
        assert_eq!(
            ledger.ref_range(FrameNumber::new(64), 1),
            Err(LedgerError::OutOfRange)
        );
    }

    #[test]
    fn boot_map_import_reserves_and_releases() {
        let ledger = setup(64);
        let map = [
            TestRegion::usable(0, 64 * PAGE_SIZE),
            TestRegion::reserved(16 * PAGE_SIZE, 8 * PAGE_SIZE),
        ];
        ledger.import_boot_map(&map);

        assert!(ledger.is_available(FrameNumber::new(15)));
        assert!(!ledger.is_available(FrameNumber::new(16)));
        assert!(!ledger.is_available(FrameNumber::new(23)));
        assert!(ledger.is_available(FrameNumber::new(24)));
        // The ledger's own backing (frame 0) stays reserved even though the
        // usable region covers it.
        assert!(!ledger.is_available(FrameNumber::new(0)));
    }

    #[test]
    fn boot_map_import_rounds_partial_frames() {
        let ledger = setup(64);
        ledger.set_flags(FrameNumber::new(0), 64, true).unwrap();
        // A usable region that starts mid-frame must not free the frames it
        // only straddles.
        let map = [TestRegion::usable(30 * PAGE_SIZE + 100, 4 * PAGE_SIZE)];
        ledger.import_boot_map(&map);
        assert!(!ledger.is_available(FrameNumber::new(30)));
        assert!(ledger.is_available(FrameNumber::new(31)));
        assert!(ledger.is_available(FrameNumber::new(33)));
        assert!(!ledger.is_available(FrameNumber::new(34)));
    }

    #[test]
    fn end_to_end_scenario() {
        // The canonical boot-shaped sequence: a 1024-frame ledger, frame 0
        // implicitly reserved, a small allocation from the bottom, then an
        // impossible allocation that must leave no trace.
        let ledger = setup(1024);

        let run = ledger.alloc(4).unwrap();
        assert_eq!(run, FrameNumber::new(1));
        for i in 0..4 {
            assert_eq!(ledger.refcount(run + i), 1);
        }

        let free_before = ledger.free_frames();
        assert_eq!(ledger.alloc(1024), Err(LedgerError::Exhausted));
        assert_eq!(ledger.free_frames(), free_before);
    }
}
