//! Page tables: the lower level of the two-level translation hierarchy.

use crate::{
    entry::{PageEntry, PageFlags},
    ledger::{FrameLedger, LedgerError},
    numbers::FrameNumber,
};

/// Number of entries in a page table or page directory.
pub const ENTRY_COUNT: usize = 1024;

/// A page table: 1024 entries, each mapping one 4 KiB page.
///
/// A page table occupies exactly one physical frame and is refcounted by the
/// frame ledger like any other frame. The struct is laid out so that a
/// pointer into the backing frame can be used as a `PageTable` directly;
/// mutating operations keep frame reference counts correct through the
/// ledger passed to them.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Creates an empty page table by value. Tables that back real mappings
    /// live inside physical frames; this constructor exists for tests.
    pub const fn empty() -> Self {
        Self {
            entries: [PageEntry::EMPTY; ENTRY_COUNT],
        }
    }

    /// Clears every entry. Used to initialize a freshly allocated frame in
    /// place before it is installed as a page table.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    /// Returns the entry at the given slot.
    ///
    /// # Panics
    /// Panics if slot >= 1024.
    pub fn entry(&self, slot: usize) -> PageEntry {
        assert!(slot < ENTRY_COUNT, "page table slot out of bounds");
        self.entries[slot]
    }

    /// Returns a mutable reference to the entry at the given slot.
    ///
    /// # Panics
    /// Panics if slot >= 1024.
    pub fn entry_mut(&mut self, slot: usize) -> &mut PageEntry {
        assert!(slot < ENTRY_COUNT, "page table slot out of bounds");
        &mut self.entries[slot]
    }

    /// Maps `frame` at `slot` with the given flags (present is implied).
    ///
    /// The new frame's reference is taken *before* the displaced frame (if
    /// any) is released: a frame must never sit at refcount zero while an
    /// entry still names it, or a concurrent release could recycle it.
    pub fn map(
        &mut self,
        ledger: &FrameLedger,
        slot: usize,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), LedgerError> {
        ledger.ref_range(frame, 1)?;
        if let Some(previous) = self.entry(slot).frame() {
            ledger.unref_range(previous, 1);
        }
        let mut flags = flags;
        flags.set_present(true);
        *self.entry_mut(slot) = PageEntry::new(frame, flags);
        Ok(())
    }

    /// Unmaps whatever `slot` currently maps, releasing its frame reference.
    /// Unmapping an absent slot is a no-op.
    pub fn unmap(&mut self, ledger: &FrameLedger, slot: usize) {
        if let Some(previous) = self.entry(slot).frame() {
            ledger.unref_range(previous, 1);
        }
        self.entry_mut(slot).clear();
    }

    /// Maps `count` consecutive frames at consecutive slots.
    ///
    /// Applies [`PageTable::map`] slot by slot and stops at the first
    /// failure, leaving the prior slots mapped. Callers that need
    /// all-or-nothing behavior unwind with [`PageTable::unmap_range`].
    pub fn map_range(
        &mut self,
        ledger: &FrameLedger,
        first_slot: usize,
        first_frame: FrameNumber,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), LedgerError> {
        for i in 0..count {
            self.map(ledger, first_slot + i, first_frame + i, flags)?;
        }
        Ok(())
    }

    /// Unmaps `count` consecutive slots.
    pub fn unmap_range(&mut self, ledger: &FrameLedger, first_slot: usize, count: usize) {
        for i in 0..count {
            self.unmap(ledger, first_slot + i);
        }
    }
}
