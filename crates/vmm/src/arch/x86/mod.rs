//! x86 (32-bit protected mode) hardware port.

use core::sync::atomic::{Ordering, fence};

use x86::controlregs::{self, Cr0};

use crate::{PhysicalAddress, VirtualAddress};

/// Invalidates the translation-cache entry for a single virtual address.
pub fn flush_page(addr: VirtualAddress) {
    // SAFETY: invlpg has no effect other than discarding a cached translation.
    unsafe { x86::tlb::flush(addr.as_usize()) }
}

/// Invalidates the entire translation cache (global pages excepted).
pub fn flush_all() {
    // SAFETY: reloading CR3 discards cached translations and nothing else.
    unsafe { x86::tlb::flush_all() }
}

/// Orders all prior memory accesses before any later ones.
///
/// Used before tearing down a temporary mapping, so that stores issued
/// through the mapping are complete before the translation disappears.
pub fn write_barrier() {
    fence(Ordering::SeqCst);
}

/// Loads the given page directory and sets the paging-enable bit.
///
/// # Safety
///
/// The directory must identity-map the currently executing code and data;
/// otherwise the instruction after enabling paging faults. Must be called at
/// most once per processor.
pub unsafe fn enable_paging(directory: PhysicalAddress) {
    // SAFETY: Caller guarantees the directory is valid and identity-maps the
    // active code.
    unsafe {
        controlregs::cr3_write(directory.as_usize() as u64);
        let mut cr0 = controlregs::cr0();
        cr0.insert(Cr0::CR0_ENABLE_PAGING);
        controlregs::cr0_write(cr0);
    }
}

/// Suppresses maskable interrupts for the guard's lifetime, restoring the
/// previous interrupt state on every exit path.
pub struct InterruptGuard {
    restore: bool,
}

impl InterruptGuard {
    /// Disables interrupts, remembering whether they were enabled.
    pub fn enter() -> Self {
        let enabled = x86::bits32::eflags::read().contains(x86::bits32::eflags::EFlags::FLAGS_IF);
        // SAFETY: disabling interrupts is always permitted at ring 0.
        unsafe { x86::irq::disable() };
        Self { restore: enabled }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.restore {
            // SAFETY: interrupts were enabled when the guard was entered.
            unsafe { x86::irq::enable() };
        }
    }
}
