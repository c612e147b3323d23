//! Address spaces.
//!
//! An address space owns one page directory and a lock, and ties the rest of
//! the crate together: frame allocation, empty-range search, mapping,
//! cross-address-space mapping, and sharing of global regions.
//!
//! # Lifecycle
//!
//! The kernel's address space is built by [`AddressSpace::bootstrap`] before
//! the paging bit is set. In that window nothing can be addressed except
//! physically, so the bootstrap path edits directories and tables in place,
//! relying on the identity mapping of low memory. [`AddressSpace::activate`]
//! loads the directory and enables paging; the transition is one-way.
//!
//! Once paging is on, a page table's frame is not necessarily reachable
//! through any virtual address — least of all a table belonging to another
//! address space. Every regular-phase operation therefore goes through the
//! temporary-mapping window: a reserved virtual region whose backing page
//! table was installed at bootstrap and is shared by every address space.
//! [`TempMapping`] borrows a slot in that window for the lifetime of the
//! guard, so an arbitrary frame can be read or written no matter which
//! address space is active, and the slot cannot leak on an error path.
//!
//! Task address spaces are created from the kernel's with
//! [`AddressSpace::derive`], which shares every global area by copying
//! directory entries, and are torn down with [`AddressSpace::destroy`].

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    address::PhysAccess,
    arch,
    directory::PageDirectory,
    entry::PageFlags,
    layout::{self, AreaFlags, AreaName, LAYOUT},
    ledger::{FrameLedger, LedgerError},
    numbers::{FrameNumber, PageNumber},
    table::{ENTRY_COUNT, PageTable},
};

/// Paging mode of an address space.
///
/// The mode selects the translation structure format. Only the classic
/// two-level 32-bit format is implemented; `Pae` names the three-level
/// 36-bit format so that callers and configuration can already speak of it,
/// and is rejected at construction until it is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Two-level paging with 32-bit entries.
    Legacy32,
    /// Physical-address extension (unimplemented).
    Pae,
}

/// Lifecycle phase of an address space.
///
/// The full lifecycle is: not yet constructed, bootstrap, active, torn
/// down. The first and last states have no representation here because they
/// correspond to the object not existing — construction yields a space in
/// `Bootstrap` (or directly `Active`, for derived spaces) and
/// [`AddressSpace::destroy`] consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Paging structures are edited in place through the identity mapping;
    /// regular-phase operations are forbidden.
    Bootstrap,
    /// Paging is enabled; all regular-phase operations are valid and
    /// structure access goes through the temporary-mapping window.
    Active,
}

/// Errors that can occur during address-space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame ledger rejected an allocation or reference change.
    Ledger(LedgerError),
    /// The page is not mapped.
    NotMapped,
    /// No free virtual range of the requested length exists in the bounds.
    NoVirtualRange,
    /// Every slot of the temporary-mapping window is in use.
    WindowExhausted,
    /// The requested paging mode is not implemented.
    UnsupportedPagingMode,
}

impl From<LedgerError> for MapError {
    fn from(err: LedgerError) -> Self {
        Self::Ledger(err)
    }
}

/// The temporary-mapping window registration: the frame of the window's
/// page table, installed once during kernel bootstrap. The table lives in
/// identity-mapped low memory and is shared by every address space, which is
/// what makes the window usable no matter which directory is loaded.
#[derive(Clone, Copy)]
struct TempWindow {
    table: FrameNumber,
}

#[cfg(not(any(test, feature = "software-emulation")))]
static TEMP_WINDOW: spin::Once<TempWindow> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static TEMP_WINDOW: spin::Once<TempWindow> = spin::Once::new();
}

/// Registers the window's page table. Called once from kernel bootstrap.
///
/// # Panics
///
/// Panics if a window is already registered.
fn register_window(table: FrameNumber) {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        if TEMP_WINDOW.get().is_some() {
            panic!("temporary-mapping window already registered");
        }
        TEMP_WINDOW.call_once(|| TempWindow { table });
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        TEMP_WINDOW.with(|w| {
            if w.get().is_some() {
                panic!("temporary-mapping window already registered");
            }
            w.call_once(|| TempWindow { table });
        });
    }
}

/// Returns the registered window.
///
/// # Panics
///
/// Panics if no kernel address space has been bootstrapped yet.
fn window() -> TempWindow {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        *TEMP_WINDOW
            .get()
            .expect("temporary-mapping window not registered; bootstrap the kernel address space first")
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        TEMP_WINDOW.with(|w| {
            *w.get().expect(
                "temporary-mapping window not registered; bootstrap the kernel address space first",
            )
        })
    }
}

/// Returns a pointer to the contents of an identity-reachable frame.
fn frame_ptr<T>(frame: FrameNumber) -> *mut T {
    PhysAccess::current().ptr(frame.start())
}

/// A transient mapping of one physical frame into the temporary-mapping
/// window of the currently active address space.
///
/// Construction finds a free window slot, takes a reference on the target
/// frame, installs a present+writable entry and flushes the translation for
/// the chosen page. Dropping the guard issues a write barrier (so stores
/// through the mapping complete before the translation disappears), unmaps
/// the slot and flushes again. Because the mapping is a guard, it cannot be
/// forgotten on an error path.
///
/// Interrupts are suppressed while the window table is edited: an interrupt
/// handler may itself need a temporary mapping and must not observe a
/// half-installed slot.
pub struct TempMapping<'l> {
    ledger: &'l FrameLedger,
    page: PageNumber,
    frame: FrameNumber,
}

impl<'l> TempMapping<'l> {
    /// Maps `frame` into a free window slot.
    ///
    /// The frame must carry at least one reference (anything reachable from
    /// a paging structure does).
    pub fn new(ledger: &'l FrameLedger, frame: FrameNumber) -> Result<Self, MapError> {
        let area = layout::area(AreaName::TempMap);
        let slots = area.page_count.min(ENTRY_COUNT);

        let _irq = arch::InterruptGuard::enter();
        // SAFETY: the window table lives in identity-mapped low memory and
        // is owned by the paging layer.
        let table = unsafe { &mut *frame_ptr::<PageTable>(window().table) };

        let slot = (0..slots)
            .find(|&slot| !table.entry(slot).is_present())
            .ok_or(MapError::WindowExhausted)?;

        let mut flags = PageFlags::empty();
        flags.set_writable(true);
        table.map(ledger, slot, frame, flags)?;

        let page = area.first_page + slot;
        arch::flush_page(page.start());
        Ok(Self {
            ledger,
            page,
            frame,
        })
    }

    /// Returns the window page this mapping occupies.
    pub fn virtual_page(&self) -> PageNumber {
        self.page
    }

    /// Returns a pointer to the mapped frame's contents.
    pub fn ptr<T>(&self) -> *mut T {
        match PhysAccess::current() {
            // On hardware the mapping itself is what makes the frame
            // addressable: the pointer is the window page.
            PhysAccess::Identity => self.page.start().as_usize() as *mut T,
            // Under emulation every frame is host-addressable; the window
            // bookkeeping above is still exercised for fidelity.
            #[cfg(any(test, feature = "software-emulation"))]
            PhysAccess::Emulated(_) => PhysAccess::current().ptr(self.frame.start()),
        }
    }
}

impl Drop for TempMapping<'_> {
    fn drop(&mut self) {
        debug_assert!(
            layout::area(AreaName::TempMap).contains(self.page),
            "temporary mapping outside the window"
        );
        let _irq = arch::InterruptGuard::enter();
        arch::write_barrier();
        // SAFETY: same table the constructor edited.
        let table = unsafe { &mut *frame_ptr::<PageTable>(window().table) };
        table.unmap(self.ledger, self.page.table_index());
        arch::flush_page(self.page.start());
        arch::flush_all();
    }
}

/// How to reach a frame holding a paging structure.
#[derive(Clone, Copy)]
enum Access {
    /// Dereference the physical address directly. Valid during bootstrap,
    /// when physical and virtual addressing coincide.
    Direct,
    /// Borrow a slot in the temporary-mapping window.
    Windowed,
}

fn access_for(phase: Phase) -> Access {
    match phase {
        Phase::Bootstrap => Access::Direct,
        Phase::Active => Access::Windowed,
    }
}

/// A scoped view of a frame holding a paging structure, either direct or
/// through the window. Dropping the view releases the window slot, if any.
enum FrameView<'l> {
    Direct(FrameNumber),
    Windowed(TempMapping<'l>),
}

impl<'l> FrameView<'l> {
    fn new(ledger: &'l FrameLedger, frame: FrameNumber, access: Access) -> Result<Self, MapError> {
        match access {
            Access::Direct => Ok(Self::Direct(frame)),
            Access::Windowed => Ok(Self::Windowed(TempMapping::new(ledger, frame)?)),
        }
    }

    fn ptr<T>(&self) -> *mut T {
        match self {
            Self::Direct(frame) => frame_ptr(*frame),
            Self::Windowed(mapping) => mapping.ptr(),
        }
    }
}

/// The lock-protected state of an address space.
struct Inner {
    /// Frame holding the page directory.
    directory: FrameNumber,
    /// Lifecycle phase.
    phase: Phase,
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// A virtual address space: one page directory plus a mutual-exclusion
/// lock over all operations that read or mutate it.
///
/// Lookups serialize with mutations as well, because resolving a page may
/// race with page-table installation otherwise. Operations spanning two
/// address spaces acquire both locks in ascending `id` order, so concurrent
/// cross-mappings in opposite directions cannot deadlock.
pub struct AddressSpace {
    id: usize,
    mode: PagingMode,
    inner: Mutex<Inner>,
}

impl AddressSpace {
    /// Builds the kernel address space before paging is enabled.
    ///
    /// Installs one page table per covered directory slot of every
    /// PAGETABLES area, identity-maps every IDENTITY area (claiming the
    /// backing frames), backs every POPULATE area with freshly allocated
    /// frames, and registers the temporary-mapping window's table. On any
    /// failure, every structure and mapping created so far is released.
    ///
    /// The returned space is in the bootstrap phase; nothing is addressable
    /// through it until [`AddressSpace::activate`].
    pub fn bootstrap(ledger: &FrameLedger, mode: PagingMode) -> Result<Self, MapError> {
        match mode {
            PagingMode::Legacy32 => {}
            PagingMode::Pae => return Err(MapError::UnsupportedPagingMode),
        }

        let directory = ledger.alloc(1)?;
        let space = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            inner: Mutex::new(Inner {
                directory,
                phase: Phase::Bootstrap,
            }),
        };

        if let Err(cause) = space.build_kernel_mappings(ledger) {
            // No other space exists yet, so even the globally shared tables
            // are this space's to tear down.
            if let Err(e) = Self::release_directory(ledger, directory, Access::Direct, true) {
                log::error!("failed to unwind aborted bootstrap: {e:?}");
            }
            return Err(cause);
        }
        Ok(space)
    }

    /// The no-paging construction pass. Physical and virtual addressing
    /// coincide for low memory here, so structures are edited in place.
    fn build_kernel_mappings(&self, ledger: &FrameLedger) -> Result<(), MapError> {
        let inner = self.inner.lock();
        let low_limit = layout::area(AreaName::LowKernel).end_page().as_usize();

        debug_assert!(
            inner.directory.as_usize() < low_limit,
            "bootstrap structures must come from identity-mapped memory"
        );
        // SAFETY: the directory frame was just allocated and is identity-reachable.
        let dir = unsafe { &mut *frame_ptr::<PageDirectory>(inner.directory) };
        dir.reset();

        // Page tables first: areas that are identity-mapped or populated
        // below rely on their tables existing.
        for area in &LAYOUT {
            if !area.flags.contains(AreaFlags::PAGETABLES) {
                continue;
            }
            let mut pde_flags = PageFlags::empty();
            pde_flags.set_writable(true);
            for slot in area.directory_slots() {
                if dir.table_frame(slot).is_some() {
                    continue;
                }
                let table_frame = ledger.alloc(1)?;
                debug_assert!(
                    table_frame.as_usize() < low_limit,
                    "bootstrap structures must come from identity-mapped memory"
                );
                // SAFETY: freshly allocated, identity-reachable frame.
                unsafe { (*frame_ptr::<PageTable>(table_frame)).reset() };
                let installed = dir.install_table(ledger, slot, table_frame, pde_flags);
                // The allocation reference is handed over; the directory
                // slot's reference is the one that keeps the table alive.
                ledger.unref_range(table_frame, 1);
                installed?;
            }
        }

        for area in &LAYOUT {
            if !area.flags.contains(AreaFlags::IDENTITY) {
                continue;
            }
            // The frames of an identity area are in use by definition (the
            // kernel image and the structures above live there); claim them,
            // then let the mappings take their own references.
            ledger.claim(FrameNumber::new(area.first_page.as_usize()), area.page_count)?;

            let mut flags = PageFlags::empty();
            flags.set_writable(true);
            flags.set_global(area.flags.contains(AreaFlags::GLOBAL));

            let mut done = 0;
            while done < area.page_count {
                let page = area.first_page + done;
                let chunk = (ENTRY_COUNT - page.table_index()).min(area.page_count - done);
                let table_frame = dir
                    .table_frame(page.directory_index())
                    .expect("identity area carries its page tables");
                // SAFETY: installed above, identity-reachable.
                let table = unsafe { &mut *frame_ptr::<PageTable>(table_frame) };
                table.map_range(
                    ledger,
                    page.table_index(),
                    FrameNumber::new(page.as_usize()),
                    chunk,
                    flags,
                )?;
                done += chunk;
            }
            log::trace!("identity-mapped {:?}: {} pages", area.name, area.page_count);
        }

        for area in &LAYOUT {
            if !area.flags.contains(AreaFlags::POPULATE) {
                continue;
            }
            let mut flags = PageFlags::empty();
            flags.set_writable(true);
            flags.set_global(area.flags.contains(AreaFlags::GLOBAL));

            let mut done = 0;
            while done < area.page_count {
                let page = area.first_page + done;
                let chunk = (ENTRY_COUNT - page.table_index()).min(area.page_count - done);
                let table_frame = dir
                    .table_frame(page.directory_index())
                    .expect("populated area carries its page tables");
                // SAFETY: installed above, identity-reachable.
                let table = unsafe { &mut *frame_ptr::<PageTable>(table_frame) };
                for i in 0..chunk {
                    let frame = ledger.alloc(1)?;
                    let mapped = table.map(ledger, page.table_index() + i, frame, flags);
                    // Hand the allocation reference to the mapping; on
                    // failure this returns the frame instead.
                    ledger.unref_range(frame, 1);
                    mapped?;
                }
                done += chunk;
            }
            log::trace!("populated {:?}: {} pages", area.name, area.page_count);
        }

        let window_area = layout::area(AreaName::TempMap);
        let window_table = dir
            .table_frame(window_area.first_page.directory_index())
            .expect("window table installed above");
        register_window(window_table);

        log::info!(
            "kernel address space {} built, directory at frame {}",
            self.id,
            inner.directory
        );
        Ok(())
    }

    /// Loads this address space's directory and enables paging. One-way:
    /// after this call the space is active for the rest of its life.
    ///
    /// # Panics
    ///
    /// Panics if the space is not in the bootstrap phase.
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        assert!(
            matches!(inner.phase, Phase::Bootstrap),
            "activate requires a bootstrap-phase address space"
        );
        // SAFETY: bootstrap identity-mapped low memory, including the code
        // executing this function.
        unsafe { arch::enable_paging(inner.directory.start()) };
        inner.phase = Phase::Active;
        log::info!(
            "address space {} active, directory at frame {}",
            self.id,
            inner.directory
        );
    }

    /// Creates a task address space from this one.
    ///
    /// The new space starts with an empty directory and then shares every
    /// GLOBAL area from the parent: directory entries are copied verbatim,
    /// so both spaces use the same page tables for those regions and a
    /// mapping added in one is immediately visible in the other. The new
    /// space is created active, since paging is already enabled system-wide.
    pub fn derive(&self, ledger: &FrameLedger) -> Result<AddressSpace, MapError> {
        {
            let inner = self.inner.lock();
            Self::assert_active(&inner);
        }

        let directory = ledger.alloc(1)?;
        {
            let view = match FrameView::new(ledger, directory, Access::Windowed) {
                Ok(view) => view,
                Err(e) => {
                    ledger.unref_range(directory, 1);
                    return Err(e);
                }
            };
            // SAFETY: freshly allocated frame, exclusively ours.
            unsafe { (*view.ptr::<PageDirectory>()).reset() };
        }

        let child = AddressSpace {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            mode: self.mode,
            inner: Mutex::new(Inner {
                directory,
                phase: Phase::Active,
            }),
        };

        for area in &LAYOUT {
            if !area.flags.contains(AreaFlags::GLOBAL) {
                continue;
            }
            if let Err(cause) = child.share_region(ledger, self, area.first_page, area.page_count) {
                if let Err(e) = child.destroy(ledger) {
                    log::error!("failed to unwind aborted derivation: {e:?}");
                }
                return Err(cause);
            }
        }

        log::info!("derived address space from {}", self.id);
        Ok(child)
    }

    /// Tears the address space down, releasing every resource it holds:
    /// page mappings and page tables of private areas, the per-space
    /// references to shared page tables, and the directory frame itself.
    ///
    /// Releasing continues past individual failures so that one bad table
    /// cannot leak everything behind it; the first error is reported after
    /// the walk finishes.
    pub fn destroy(self, ledger: &FrameLedger) -> Result<(), MapError> {
        let inner = self.inner.into_inner();
        log::trace!("destroying address space {}", self.id);
        Self::release_directory(ledger, inner.directory, access_for(inner.phase), false)
    }

    /// Returns this space's ordering identity.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns this space's paging mode.
    pub fn paging_mode(&self) -> PagingMode {
        self.mode
    }

    /// Returns this space's lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Maps `count` caller-owned frames, starting at `first_frame`, at the
    /// pages starting at `first_page`. The frames must already be allocated
    /// or claimed; each mapping takes its own reference on top.
    ///
    /// All-or-nothing: on failure, pages mapped by this call are unmapped
    /// again before the error is returned. Page tables created on the way
    /// are kept; an empty table is harmless and the next mapping in the
    /// region will use it.
    pub fn alloc_frames(
        &self,
        ledger: &FrameLedger,
        first_frame: FrameNumber,
        first_page: PageNumber,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let inner = self.inner.lock();
        Self::assert_active(&inner);
        let result = Self::map_span(ledger, &inner, first_page, count, flags, |_, i| {
            Ok((first_frame + i, false))
        });
        Self::finish_span(ledger, &inner, first_page, result)
    }

    /// Maps `count` freshly allocated frames at the pages starting at
    /// `first_page`. The allocation reference is handed to the mapping, so
    /// unmapping the page is what frees the frame.
    ///
    /// All-or-nothing, like [`AddressSpace::alloc_frames`].
    pub fn alloc_pages(
        &self,
        ledger: &FrameLedger,
        first_page: PageNumber,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let inner = self.inner.lock();
        Self::assert_active(&inner);
        let result = Self::map_span(ledger, &inner, first_page, count, flags, |ledger, _| {
            Ok((ledger.alloc(1)?, true))
        });
        Self::finish_span(ledger, &inner, first_page, result)
    }

    /// Maps `count` pages of `src`, starting at `src_page`, into this space
    /// at the pages starting at `dst_page`, with the given flags. The
    /// backing frames are shared: this is the page-transfer primitive used
    /// for cross-address-space communication.
    ///
    /// Both spaces' locks are taken in identity order; when `src` is this
    /// space the lock is taken once. All-or-nothing on the destination,
    /// like [`AddressSpace::alloc_frames`].
    pub fn map_pages(
        &self,
        ledger: &FrameLedger,
        dst_page: PageNumber,
        src: &AddressSpace,
        src_page: PageNumber,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let (dst_guard, src_guard) = Self::lock_two(self, src);
        let src_inner: &Inner = match &src_guard {
            Some(guard) => guard,
            None => &dst_guard,
        };
        Self::assert_active(&dst_guard);
        Self::assert_active(src_inner);

        let result = Self::map_span(ledger, &dst_guard, dst_page, count, flags, |ledger, i| {
            let frame = Self::lookup_locked(ledger, src_inner, src_page + i)?;
            Ok((frame, false))
        });
        Self::finish_span(ledger, &dst_guard, dst_page, result)
    }

    /// Resolves a page to its backing frame without modifying anything.
    pub fn lookup_frame(
        &self,
        ledger: &FrameLedger,
        page: PageNumber,
    ) -> Result<FrameNumber, MapError> {
        let inner = self.inner.lock();
        Self::assert_active(&inner);
        Self::lookup_locked(ledger, &inner, page)
    }

    /// Returns the length of the run of unmapped pages starting at
    /// `first_page`, up to `count`.
    pub fn check_empty(
        &self,
        ledger: &FrameLedger,
        first_page: PageNumber,
        count: usize,
    ) -> Result<usize, MapError> {
        let inner = self.inner.lock();
        Self::assert_active(&inner);
        Self::check_empty_locked(ledger, &inner, first_page, count)
    }

    /// Finds the lowest `count`-page run of unmapped pages within
    /// `[low, high)`. First-fit: ties break toward the lowest address.
    pub fn find_empty(
        &self,
        ledger: &FrameLedger,
        count: usize,
        low: PageNumber,
        high: PageNumber,
    ) -> Result<PageNumber, MapError> {
        debug_assert!(count > 0, "zero-length search");
        let inner = self.inner.lock();
        Self::assert_active(&inner);

        let mut probe = low;
        while probe.as_usize() + count <= high.as_usize() {
            let run = Self::check_empty_locked(ledger, &inner, probe, count)?;
            if run >= count {
                return Ok(probe);
            }
            // The page that cut the run short is occupied; resume past it.
            probe = probe + run + 1;
        }
        Err(MapError::NoVirtualRange)
    }

    /// Copies page-directory entries covering `count` pages at `first_page`
    /// verbatim from `src` into this space.
    ///
    /// Sharing happens at directory granularity: both spaces end up naming
    /// the same page tables, so only table-frame references change hands —
    /// no page-level accounting is involved. A slot that is absent in the
    /// source is cleared in the destination. Sharing a space with itself is
    /// a no-op.
    pub fn share_region(
        &self,
        ledger: &FrameLedger,
        src: &AddressSpace,
        first_page: PageNumber,
        page_count: usize,
    ) -> Result<(), MapError> {
        debug_assert!(page_count > 0, "zero-length share");
        if self.id == src.id {
            return Ok(());
        }

        let (dst_guard, src_guard) = Self::lock_two(self, src);
        let src_inner = src_guard.as_ref().expect("distinct spaces have two locks");
        Self::assert_active(&dst_guard);
        Self::assert_active(src_inner);

        let src_view = FrameView::new(ledger, src_inner.directory, Access::Windowed)?;
        let dst_view = FrameView::new(ledger, dst_guard.directory, Access::Windowed)?;
        // SAFETY: both views map directory frames owned by the locked spaces.
        let src_dir = unsafe { &*src_view.ptr::<PageDirectory>() };
        let dst_dir = unsafe { &mut *dst_view.ptr::<PageDirectory>() };

        let first_slot = first_page.directory_index();
        let last_slot = (first_page + (page_count - 1)).directory_index();
        for slot in first_slot..=last_slot {
            dst_dir.adopt_entry(ledger, slot, src_dir.entry(slot))?;
        }
        Ok(())
    }

    fn assert_active(inner: &Inner) {
        assert!(
            matches!(inner.phase, Phase::Active),
            "operation requires an active address space"
        );
    }

    /// Locks `a` and `b` in ascending identity order, returning `a`'s guard
    /// and, when the spaces are distinct, `b`'s.
    fn lock_two<'a>(
        a: &'a AddressSpace,
        b: &'a AddressSpace,
    ) -> (spin::MutexGuard<'a, Inner>, Option<spin::MutexGuard<'a, Inner>>) {
        if a.id == b.id {
            (a.inner.lock(), None)
        } else if a.id < b.id {
            let guard_a = a.inner.lock();
            let guard_b = b.inner.lock();
            (guard_a, Some(guard_b))
        } else {
            let guard_b = b.inner.lock();
            let guard_a = a.inner.lock();
            (guard_a, Some(guard_b))
        }
    }

    /// Resolves a page through the locked space's directory.
    fn lookup_locked(
        ledger: &FrameLedger,
        inner: &Inner,
        page: PageNumber,
    ) -> Result<FrameNumber, MapError> {
        let access = access_for(inner.phase);
        let dir_view = FrameView::new(ledger, inner.directory, access)?;
        // SAFETY: the view maps the locked space's directory.
        let dir = unsafe { &*dir_view.ptr::<PageDirectory>() };

        let entry = dir.entry(page.directory_index());
        if !entry.is_present() {
            return Err(MapError::NotMapped);
        }
        if entry.is_large() {
            let base = entry.frame().expect("present entry has a frame");
            return Ok(base + page.table_index());
        }

        let table_frame = entry.frame().expect("present entry has a frame");
        let table_view = FrameView::new(ledger, table_frame, access)?;
        // SAFETY: the view maps a page table owned by the locked space.
        let table = unsafe { &*table_view.ptr::<PageTable>() };
        table
            .entry(page.table_index())
            .frame()
            .ok_or(MapError::NotMapped)
    }

    /// Measures the unmapped run starting at `first_page`. Whole absent
    /// tables are skipped in one step.
    fn check_empty_locked(
        ledger: &FrameLedger,
        inner: &Inner,
        first_page: PageNumber,
        count: usize,
    ) -> Result<usize, MapError> {
        debug_assert!(
            first_page.as_usize() + count <= crate::LINEAR_PAGES,
            "page range beyond the linear address space"
        );
        let dir_view = FrameView::new(ledger, inner.directory, access_for(inner.phase))?;
        // SAFETY: the view maps the locked space's directory.
        let dir = unsafe { &*dir_view.ptr::<PageDirectory>() };

        let mut run = 0;
        while run < count {
            let page = first_page + run;
            let entry = dir.entry(page.directory_index());
            if !entry.is_present() {
                run += (ENTRY_COUNT - page.table_index()).min(count - run);
                continue;
            }
            if entry.is_large() {
                break;
            }

            let table_frame = entry.frame().expect("present entry has a frame");
            let table_view = FrameView::new(ledger, table_frame, access_for(inner.phase))?;
            // SAFETY: the view maps a page table owned by the locked space.
            let table = unsafe { &*table_view.ptr::<PageTable>() };
            let chunk = (ENTRY_COUNT - page.table_index()).min(count - run);
            let mut advanced = chunk;
            for i in 0..chunk {
                if table.entry(page.table_index() + i).is_present() {
                    advanced = i;
                    break;
                }
            }
            run += advanced;
            if advanced < chunk {
                break;
            }
        }
        Ok(run)
    }

    /// Maps `count` pages starting at `first_page`, drawing each frame from
    /// `source`. `source` returns the frame for the i-th page and whether
    /// its allocation reference should be handed to the mapping. On error,
    /// returns how many pages were fully mapped.
    fn map_span(
        ledger: &FrameLedger,
        inner: &Inner,
        first_page: PageNumber,
        count: usize,
        flags: PageFlags,
        mut source: impl FnMut(&FrameLedger, usize) -> Result<(FrameNumber, bool), MapError>,
    ) -> Result<(), (usize, MapError)> {
        let dir_view =
            FrameView::new(ledger, inner.directory, Access::Windowed).map_err(|e| (0, e))?;
        // SAFETY: the view maps the locked space's directory.
        let dir = unsafe { &mut *dir_view.ptr::<PageDirectory>() };

        let mut done = 0;
        while done < count {
            let page = first_page + done;
            let chunk = (ENTRY_COUNT - page.table_index()).min(count - done);
            let table_frame = match dir.table_frame(page.directory_index()) {
                Some(frame) => frame,
                None => Self::install_fresh_table(ledger, dir, page).map_err(|e| (done, e))?,
            };
            let table_view =
                FrameView::new(ledger, table_frame, Access::Windowed).map_err(|e| (done, e))?;
            // SAFETY: the view maps a page table owned by the locked space.
            let table = unsafe { &mut *table_view.ptr::<PageTable>() };

            for i in 0..chunk {
                let (frame, transfer) = source(ledger, done).map_err(|e| (done, e))?;
                let mapped = table.map(ledger, page.table_index() + i, frame, flags);
                if transfer {
                    // Hand the allocation reference to the mapping; if the
                    // mapping failed this returns the frame instead.
                    ledger.unref_range(frame, 1);
                }
                mapped.map_err(|e| (done, MapError::from(e)))?;
                done += 1;
            }
        }
        Ok(())
    }

    /// Completes an all-or-nothing span operation: on error, unmaps the
    /// prefix that was already mapped.
    fn finish_span(
        ledger: &FrameLedger,
        inner: &Inner,
        first_page: PageNumber,
        result: Result<(), (usize, MapError)>,
    ) -> Result<(), MapError> {
        match result {
            Ok(()) => Ok(()),
            Err((done, cause)) => {
                if let Err(e) = Self::unmap_span(ledger, inner, first_page, done) {
                    log::error!("failed to roll back partial mapping: {e:?}");
                }
                Err(cause)
            }
        }
    }

    /// Unmaps `count` pages starting at `first_page`. Chunks without a page
    /// table are skipped.
    fn unmap_span(
        ledger: &FrameLedger,
        inner: &Inner,
        first_page: PageNumber,
        count: usize,
    ) -> Result<(), MapError> {
        if count == 0 {
            return Ok(());
        }
        let dir_view = FrameView::new(ledger, inner.directory, Access::Windowed)?;
        // SAFETY: the view maps the locked space's directory.
        let dir = unsafe { &*dir_view.ptr::<PageDirectory>() };

        let mut done = 0;
        while done < count {
            let page = first_page + done;
            let chunk = (ENTRY_COUNT - page.table_index()).min(count - done);
            if let Some(table_frame) = dir.table_frame(page.directory_index()) {
                let table_view = FrameView::new(ledger, table_frame, Access::Windowed)?;
                // SAFETY: the view maps a page table owned by the locked space.
                let table = unsafe { &mut *table_view.ptr::<PageTable>() };
                table.unmap_range(ledger, page.table_index(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Allocates, zeroes and installs a page table for the chunk containing
    /// `page`. Tables covering the user area are user-accessible at the
    /// directory level; page entries decide the rest.
    fn install_fresh_table(
        ledger: &FrameLedger,
        dir: &mut PageDirectory,
        page: PageNumber,
    ) -> Result<FrameNumber, MapError> {
        let table_frame = ledger.alloc(1)?;
        {
            let view = match FrameView::new(ledger, table_frame, Access::Windowed) {
                Ok(view) => view,
                Err(e) => {
                    ledger.unref_range(table_frame, 1);
                    return Err(e);
                }
            };
            // SAFETY: freshly allocated frame, exclusively ours.
            unsafe { (*view.ptr::<PageTable>()).reset() };
        }

        let mut flags = PageFlags::empty();
        flags.set_writable(true);
        let user = layout::area_containing(page).is_some_and(|area| area.name == AreaName::User);
        flags.set_user(user);

        let installed = dir.install_table(ledger, page.directory_index(), table_frame, flags);
        ledger.unref_range(table_frame, 1);
        installed?;
        Ok(table_frame)
    }

    /// Releases everything a directory holds: page mappings and tables of
    /// private areas, one table-frame reference per shared slot, and the
    /// directory frame itself. With `owns_shared` the globally shared areas
    /// are treated as private too — only valid while no other space can
    /// reference their tables, i.e. when unwinding a failed kernel
    /// bootstrap. Keeps going past per-table failures and reports the first
    /// one at the end.
    fn release_directory(
        ledger: &FrameLedger,
        directory: FrameNumber,
        access: Access,
        owns_shared: bool,
    ) -> Result<(), MapError> {
        let mut result = Ok(());
        {
            let dir_view = match FrameView::new(ledger, directory, access) {
                Ok(view) => view,
                Err(e) => {
                    // The directory's contents are unreachable; dropping the
                    // directory frame is still better than leaking it too.
                    ledger.unref_range(directory, 1);
                    return Err(e);
                }
            };
            // SAFETY: the view maps the directory being torn down; its owner
            // has been consumed, so nothing else can reach it.
            let dir = unsafe { &mut *dir_view.ptr::<PageDirectory>() };

            for slot in 0..ENTRY_COUNT {
                let entry = dir.entry(slot);
                if !entry.is_present() {
                    continue;
                }
                let shared = !owns_shared
                    && layout::area_containing(PageNumber::new(slot * ENTRY_COUNT))
                        .map(|area| area.flags.contains(AreaFlags::GLOBAL))
                        .unwrap_or(false);
                if !shared && !entry.is_large() {
                    let table_frame = entry.frame().expect("present entry has a frame");
                    match FrameView::new(ledger, table_frame, access) {
                        Ok(table_view) => {
                            // SAFETY: the view maps a private page table of
                            // the directory being torn down.
                            let table = unsafe { &mut *table_view.ptr::<PageTable>() };
                            table.unmap_range(ledger, 0, ENTRY_COUNT);
                        }
                        Err(e) => result = Err(e),
                    }
                }
                if let Some(frame) = entry.frame() {
                    ledger.unref_range(frame, 1);
                }
                dir.entry_mut(slot).clear();
            }
        }
        ledger.unref_range(directory, 1);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PhysicalAddress, arch::EmulatedMemory};

    const FRAMES: usize = 2048;

    fn setup_ledger() -> FrameLedger {
        if PhysAccess::try_current().is_none() {
            PhysAccess::set_current(PhysAccess::Emulated(EmulatedMemory::new(FRAMES)));
        }
        // SAFETY: the emulated memory covers the table and nothing else uses it.
        unsafe { FrameLedger::init(PhysicalAddress::new(0), FrameNumber::new(0), FRAMES) }
    }

    /// Bootstraps and activates a kernel address space, the way the kernel
    /// does at boot.
    fn boot() -> (FrameLedger, AddressSpace) {
        let ledger = setup_ledger();
        let kernel = AddressSpace::bootstrap(&ledger, PagingMode::Legacy32).unwrap();
        kernel.activate();
        (ledger, kernel)
    }

    fn rw() -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_writable(true);
        flags
    }

    fn user_page(n: usize) -> PageNumber {
        layout::area(AreaName::User).first_page + n
    }

    #[test]
    fn pae_mode_is_rejected() {
        let ledger = setup_ledger();
        let free_before = ledger.free_frames();
        assert_eq!(
            AddressSpace::bootstrap(&ledger, PagingMode::Pae).err(),
            Some(MapError::UnsupportedPagingMode)
        );
        assert_eq!(ledger.free_frames(), free_before);
    }

    #[test]
    fn identity_mapping_survives_activation() {
        let (ledger, kernel) = boot();
        assert_eq!(kernel.phase(), Phase::Active);

        for page in [0usize, 1, 511, 1023] {
            let frame = kernel
                .lookup_frame(&ledger, PageNumber::new(page))
                .unwrap();
            assert_eq!(frame.as_usize(), page);
        }
    }

    #[test]
    fn populated_area_is_backed() {
        let (ledger, kernel) = boot();
        let area = layout::area(AreaName::HighKernel);
        let first = kernel.lookup_frame(&ledger, area.first_page).unwrap();
        let last = kernel
            .lookup_frame(&ledger, area.first_page + (area.page_count - 1))
            .unwrap();
        // Populated frames come from outside the identity region.
        assert!(first.as_usize() >= ENTRY_COUNT);
        assert!(last.as_usize() >= ENTRY_COUNT);
    }

    #[test]
    #[should_panic(expected = "requires an active address space")]
    fn regular_operation_before_activation_panics() {
        let ledger = setup_ledger();
        let kernel = AddressSpace::bootstrap(&ledger, PagingMode::Legacy32).unwrap();
        let _ = kernel.check_empty(&ledger, user_page(0), 1);
    }

    #[test]
    #[should_panic(expected = "requires a bootstrap-phase address space")]
    fn double_activation_panics() {
        let (_ledger, kernel) = boot();
        kernel.activate();
    }

    #[test]
    fn temp_mapping_window_round_trip() {
        let (ledger, _kernel) = boot();
        let frame = ledger.alloc(1).unwrap();
        assert_eq!(ledger.refcount(frame), 1);

        {
            let mapping = TempMapping::new(&ledger, frame).unwrap();
            assert!(layout::area(AreaName::TempMap).contains(mapping.virtual_page()));
            assert_eq!(ledger.refcount(frame), 2);

            // SAFETY: the mapping grants access to the frame's contents.
            unsafe {
                mapping.ptr::<u32>().write(0xDEAD_BEEF);
                assert_eq!(mapping.ptr::<u32>().read(), 0xDEAD_BEEF);
            }
        }
        assert_eq!(ledger.refcount(frame), 1);
    }

    #[test]
    fn window_slots_are_recycled() {
        let (ledger, _kernel) = boot();
        let frame_a = ledger.alloc(1).unwrap();
        let frame_b = ledger.alloc(1).unwrap();

        let first = TempMapping::new(&ledger, frame_a).unwrap();
        let second = TempMapping::new(&ledger, frame_b).unwrap();
        assert_ne!(first.virtual_page(), second.virtual_page());

        let freed = first.virtual_page();
        drop(first);
        let third = TempMapping::new(&ledger, frame_a).unwrap();
        assert_eq!(third.virtual_page(), freed);
    }

    #[test]
    fn alloc_pages_then_lookup() {
        let (ledger, kernel) = boot();
        kernel.alloc_pages(&ledger, user_page(0), 4, rw()).unwrap();

        let mut frames = [FrameNumber::new(0); 4];
        for i in 0..4 {
            frames[i] = kernel.lookup_frame(&ledger, user_page(i)).unwrap();
            // The mapping holds the only reference.
            assert_eq!(ledger.refcount(frames[i]), 1);
        }
        assert_eq!(
            kernel.lookup_frame(&ledger, user_page(4)),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn alloc_pages_rolls_back_on_exhaustion() {
        let (ledger, kernel) = boot();
        let free_before = ledger.free_frames();

        // More pages than there are free frames; the span cannot complete.
        let result = kernel.alloc_pages(&ledger, user_page(0), free_before + 8, rw());
        assert_eq!(result, Err(MapError::Ledger(LedgerError::Exhausted)));

        // Every page mapped before the failure was unmapped again. The page
        // table created for the chunk is kept, so exactly one frame moved.
        assert_eq!(
            kernel.lookup_frame(&ledger, user_page(0)),
            Err(MapError::NotMapped)
        );
        assert_eq!(ledger.free_frames(), free_before - 1);
    }

    #[test]
    fn alloc_frames_maps_claimed_frames() {
        let (ledger, kernel) = boot();

        // A device-style window: frames marked reserved by the boot map,
        // then claimed by their driver.
        let device = FrameNumber::new(1900);
        ledger.set_flags(device, 2, true).unwrap();
        ledger.claim(device, 2).unwrap();

        kernel
            .alloc_frames(&ledger, device, user_page(100), 2, rw())
            .unwrap();
        assert_eq!(kernel.lookup_frame(&ledger, user_page(100)), Ok(device));
        assert_eq!(kernel.lookup_frame(&ledger, user_page(101)), Ok(device + 1));
        assert_eq!(ledger.refcount(device), 2);
    }

    #[test]
    fn check_empty_and_find_empty() {
        let (ledger, kernel) = boot();
        kernel.alloc_pages(&ledger, user_page(0), 4, rw()).unwrap();

        // A whole absent table is skipped in one step.
        let far = PageNumber::new(2 * ENTRY_COUNT);
        assert_eq!(kernel.check_empty(&ledger, far, 100).unwrap(), 100);

        // The run starting under the mapped pages is zero.
        assert_eq!(kernel.check_empty(&ledger, user_page(0), 8).unwrap(), 0);
        assert_eq!(kernel.check_empty(&ledger, user_page(4), 8).unwrap(), 8);

        // First fit lands right after the occupied run.
        let found = kernel
            .find_empty(&ledger, 2, user_page(0), user_page(1000))
            .unwrap();
        assert_eq!(found, user_page(4));
        assert_eq!(kernel.check_empty(&ledger, found, 2).unwrap(), 2);

        // A fully occupied bound reports failure.
        assert_eq!(
            kernel.find_empty(&ledger, 1, user_page(0), user_page(4)),
            Err(MapError::NoVirtualRange)
        );
    }

    #[test]
    fn derived_space_shares_global_areas() {
        let (ledger, kernel) = boot();
        let child = kernel.derive(&ledger).unwrap();
        assert_eq!(child.phase(), Phase::Active);

        // Identity area resolves identically in both spaces.
        let page = PageNumber::new(123);
        assert_eq!(
            child.lookup_frame(&ledger, page).unwrap(),
            kernel.lookup_frame(&ledger, page).unwrap()
        );

        // Populated kernel memory is the same physical memory.
        let high = layout::area(AreaName::HighKernel).first_page;
        assert_eq!(
            child.lookup_frame(&ledger, high).unwrap(),
            kernel.lookup_frame(&ledger, high).unwrap()
        );

        // The user area is not shared.
        kernel.alloc_pages(&ledger, user_page(0), 1, rw()).unwrap();
        assert_eq!(
            child.lookup_frame(&ledger, user_page(0)),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn mapping_in_shared_chunk_is_visible_without_further_calls() {
        let (ledger, kernel) = boot();
        let child = kernel.derive(&ledger).unwrap();

        // This page is outside the HighKernel area but inside the directory
        // chunk its shared table covers.
        let page = layout::area(AreaName::HighKernel).end_page();
        kernel.alloc_pages(&ledger, page, 1, rw()).unwrap();

        assert_eq!(
            child.lookup_frame(&ledger, page).unwrap(),
            kernel.lookup_frame(&ledger, page).unwrap()
        );
    }

    #[test]
    fn map_pages_across_spaces() {
        let (ledger, kernel) = boot();
        let child = kernel.derive(&ledger).unwrap();

        let mut user_flags = rw();
        user_flags.set_user(true);
        child
            .alloc_pages(&ledger, user_page(0), 2, user_flags)
            .unwrap();

        // Map the child's pages into the kernel space, read-only.
        let dst = kernel
            .find_empty(&ledger, 2, user_page(0), user_page(1000))
            .unwrap();
        kernel
            .map_pages(&ledger, dst, &child, user_page(0), 2, PageFlags::empty())
            .unwrap();

        for i in 0..2 {
            let frame = child.lookup_frame(&ledger, user_page(i)).unwrap();
            assert_eq!(kernel.lookup_frame(&ledger, dst + i), Ok(frame));
            // One reference per mapping.
            assert_eq!(ledger.refcount(frame), 2);
        }
    }

    #[test]
    fn map_pages_of_unmapped_source_fails_cleanly() {
        let (ledger, kernel) = boot();
        let child = kernel.derive(&ledger).unwrap();
        child.alloc_pages(&ledger, user_page(0), 1, rw()).unwrap();

        // Second source page is unmapped; the destination must end up with
        // nothing.
        let result = kernel.map_pages(
            &ledger,
            user_page(500),
            &child,
            user_page(0),
            2,
            PageFlags::empty(),
        );
        assert_eq!(result, Err(MapError::NotMapped));
        assert_eq!(
            kernel.lookup_frame(&ledger, user_page(500)),
            Err(MapError::NotMapped)
        );

        let frame = child.lookup_frame(&ledger, user_page(0)).unwrap();
        assert_eq!(ledger.refcount(frame), 1);
    }

    #[test]
    fn destroy_releases_private_memory_only() {
        let (ledger, kernel) = boot();
        let free_before_child = ledger.free_frames();

        let child = kernel.derive(&ledger).unwrap();
        child.alloc_pages(&ledger, user_page(0), 3, rw()).unwrap();
        assert!(ledger.free_frames() < free_before_child);

        child.destroy(&ledger).unwrap();
        assert_eq!(ledger.free_frames(), free_before_child);

        // The kernel space is untouched: shared tables survive and identity
        // mappings still resolve.
        assert_eq!(
            kernel
                .lookup_frame(&ledger, PageNumber::new(123))
                .unwrap()
                .as_usize(),
            123
        );
    }

    #[test]
    fn derived_spaces_have_distinct_identities() {
        let (ledger, kernel) = boot();
        let a = kernel.derive(&ledger).unwrap();
        let b = kernel.derive(&ledger).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.paging_mode(), PagingMode::Legacy32);

        a.destroy(&ledger).unwrap();
        b.destroy(&ledger).unwrap();
    }
}
