//! Page directories: the upper level of the two-level translation hierarchy.

use crate::{
    entry::{PageEntry, PageFlags},
    ledger::{FrameLedger, LedgerError},
    numbers::FrameNumber,
    table::ENTRY_COUNT,
};

/// A page directory: 1024 entries, each either empty, pointing at a page
/// table's frame, or (large bit) mapping 4 MiB directly.
///
/// Like a page table, a directory occupies exactly one physical frame and
/// participates in frame refcounting. The entry holding a page table keeps
/// one reference to the table's frame; when two address spaces share a
/// directory entry they each hold one.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageDirectory {
    /// Creates an empty directory by value. Directories that back real
    /// address spaces live inside physical frames; this constructor exists
    /// for tests.
    pub const fn empty() -> Self {
        Self {
            entries: [PageEntry::EMPTY; ENTRY_COUNT],
        }
    }

    /// Clears every entry. Used to initialize a freshly allocated frame in
    /// place before it becomes a directory.
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
        assert!(slot < ENTRY_COUNT, "page directory slot out of bounds");
        self.entries[slot]
    }

    /// Returns a mutable reference to the entry at the given slot.
    ///
    /// # Panics
    /// Panics if slot >= 1024.
    pub fn entry_mut(&mut self, slot: usize) -> &mut PageEntry {
        assert!(slot < ENTRY_COUNT, "page directory slot out of bounds");
        &mut self.entries[slot]
    }

    /// Returns the frame of the page table installed at `slot`, or None if
    /// the slot is empty or maps a large page.
    pub fn table_frame(&self, slot: usize) -> Option<FrameNumber> {
        let entry = self.entry(slot);
        if entry.is_large() {
            return None;
        }
        entry.frame()
    }

    /// Installs the page table in `table` at `slot` (present is implied, the
    /// large bit is cleared).
    ///
    /// As with page-table mapping, the new table's reference is taken before
    /// a displaced table's reference is released.
    pub fn install_table(
        &mut self,
        ledger: &FrameLedger,
        slot: usize,
        table: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), LedgerError> {
        ledger.ref_range(table, 1)?;
        if let Some(previous) = self.entry(slot).frame() {
            ledger.unref_range(previous, 1);
        }
        let mut flags = flags;
        flags.set_present(true);
        flags.set_large(false);
        *self.entry_mut(slot) = PageEntry::new(table, flags);
        Ok(())
    }

    /// Removes the page table installed at `slot`, releasing its frame
    /// reference. Removing an empty slot is a no-op.
    ///
    /// The table's own mappings are untouched; the caller is responsible for
    /// unmapping them first if this directory held their last reference.
    pub fn remove_table(&mut self, ledger: &FrameLedger, slot: usize) {
        if let Some(previous) = self.entry(slot).frame() {
            ledger.unref_range(previous, 1);
        }
        self.entry_mut(slot).clear();
    }

    /// Copies `entry` into `slot` verbatim, adjusting table-frame references
    /// only: the adopted entry's frame gains a reference, a displaced
    /// entry's frame loses one. Adopting an absent entry clears the slot.
    ///
    /// This is how globally shared regions propagate between address spaces:
    /// both directories end up naming the same page table, so no page-level
    /// accounting is involved.
    pub fn adopt_entry(
        &mut self,
        ledger: &FrameLedger,
        slot: usize,
        entry: PageEntry,
    ) -> Result<(), LedgerError> {
        if let Some(frame) = entry.frame() {
            ledger.ref_range(frame, 1)?;
        }
        if let Some(previous) = self.entry(slot).frame() {
            ledger.unref_range(previous, 1);
        }
        *self.entry_mut(slot) = entry;
        Ok(())
    }
}
