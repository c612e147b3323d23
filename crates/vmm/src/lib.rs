#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Meridian Virtual Memory Manager (VMM)
//!
//! The Meridian Virtual Memory Manager is the physical-frame and paging core of
//! the Meridian kernel, a small 32-bit protected-mode operating system. It
//! provides:
//!
//! - Physical frame ownership tracking with per-frame reference counts.
//! - Two-level page table and page directory manipulation.
//! - A static layout of named virtual-memory areas with mapping policies.
//! - Per-task address spaces, including safe editing of paging structures that
//!   are not currently active, and the no-paging bootstrap path.
//! - Software emulation for testing outside the kernel.
//!
//! Scheduling, IPC semantics, device I/O, and loading of task images are the
//! business of other kernel subsystems; they consume this crate's API.

mod address;
mod address_space;
mod arch;
mod directory;
mod entry;
mod fault;
mod human_size;
mod layout;
mod ledger;
mod numbers;
mod table;

pub use address::{PhysAccess, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, MapError, PagingMode, Phase, TempMapping};
pub use directory::PageDirectory;
pub use entry::{PageEntry, PageFlags};
pub use fault::{FaultCode, report_page_fault, report_protection_fault};
pub use human_size::HumanSize;
pub use layout::{AreaFlags, AreaName, LAYOUT, VmArea, area, area_containing};
pub use ledger::{BootMemoryRegion, FrameLedger, LedgerError, MAX_REFCOUNT};
pub use numbers::{FrameNumber, PageNumber};
pub use table::{ENTRY_COUNT, PageTable};

/// Size of a physical frame and of a virtual page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages in the 4 GiB linear address space.
pub const LINEAR_PAGES: usize = 1 << 20;
