//! The virtual-memory area table.
//!
//! The 4 GiB linear address space is partitioned into named, non-overlapping
//! areas with different mapping policies. The table is fixed at compile
//! time; areas never move or resize, and no locking is needed to query them.

use crate::{numbers::PageNumber, table::ENTRY_COUNT};

/// Policy flags for a virtual-memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaFlags(u32);

impl AreaFlags {
    /// No policy.
    pub const NONE: Self = Self(0);

    /// Every page in the area maps the physical frame of the same index.
    pub const IDENTITY: Self = Self(1 << 0);

    /// The area is backed with freshly allocated frames when the kernel
    /// address space is bootstrapped.
    pub const POPULATE: Self = Self(1 << 1);

    /// The area's page tables are installed eagerly at bootstrap, so they
    /// exist before any mapping into the area is requested.
    pub const PAGETABLES: Self = Self(1 << 2);

    /// The area's page tables are shared by reference with every address
    /// space in the system rather than copied.
    pub const GLOBAL: Self = Self(1 << 3);

    /// Combines two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns whether every flag in `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Names of the fixed virtual-memory areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaName {
    /// Identity-mapped low memory: kernel image, frame ledger, bootstrap
    /// page tables.
    LowKernel = 0,
    /// Task code, data, heap and stacks.
    User = 1,
    /// The temporary-mapping window (see `TempMapping`).
    TempMap = 2,
    /// Eagerly backed kernel working memory above the window.
    HighKernel = 3,
}

/// A virtual-memory area: an immutable descriptor of one named region.
#[derive(Debug, Clone, Copy)]
pub struct VmArea {
    /// The area's name, matching its position in [`LAYOUT`].
    pub name: AreaName,
    /// First page of the area.
    pub first_page: PageNumber,
    /// Number of pages in the area.
    pub page_count: usize,
    /// Mapping policy.
    pub flags: AreaFlags,
}

impl VmArea {
    /// Returns the first page past the end of the area.
    pub const fn end_page(&self) -> PageNumber {
        PageNumber::new(self.first_page.as_usize() + self.page_count)
    }

    /// Returns whether the area contains the given page.
    pub fn contains(&self, page: PageNumber) -> bool {
        self.first_page <= page && page < self.end_page()
    }

    /// Returns the inclusive range of page-directory slots whose page
    /// tables cover this area.
    pub fn directory_slots(&self) -> core::ops::RangeInclusive<usize> {
        let first = self.first_page.directory_index();
        let last = (self.first_page + (self.page_count - 1)).directory_index();
        first..=last
    }
}

/// The fixed area table.
///
/// Pages 0x0_0000..0x0_0400 —  0..4 MiB, identity-mapped kernel low memory.
/// Pages 0x0_0400..0xC_0000 —  4 MiB..3 GiB, user space.
/// Pages 0xC_0000..0xC_0400 —  3 GiB..+4 MiB, temporary-mapping window.
/// Pages 0xC_0400..0xC_0500 —  +4 MiB..+5 MiB, eager kernel working memory.
///
/// The gap above HighKernel is intentionally unassigned.
pub static LAYOUT: [VmArea; 4] = [
    VmArea {
        name: AreaName::LowKernel,
        first_page: PageNumber::new(0),
        page_count: ENTRY_COUNT,
        flags: AreaFlags::IDENTITY
            .union(AreaFlags::PAGETABLES)
            .union(AreaFlags::GLOBAL),
    },
    VmArea {
        name: AreaName::User,
        first_page: PageNumber::new(ENTRY_COUNT),
        page_count: 0xC_0000 - ENTRY_COUNT,
        flags: AreaFlags::NONE,
    },
    VmArea {
        name: AreaName::TempMap,
        first_page: PageNumber::new(0xC_0000),
        page_count: ENTRY_COUNT,
        flags: AreaFlags::PAGETABLES.union(AreaFlags::GLOBAL),
    },
    VmArea {
        name: AreaName::HighKernel,
        first_page: PageNumber::new(0xC_0400),
        page_count: 256,
        flags: AreaFlags::PAGETABLES
            .union(AreaFlags::GLOBAL)
            .union(AreaFlags::POPULATE),
    },
];

/// Returns the area with the given name.
pub fn area(name: AreaName) -> &'static VmArea {
    let found = &LAYOUT[name as usize];
    debug_assert!(found.name == name, "LAYOUT order does not match AreaName");
    found
}

/// Returns the area containing the given page, if any.
pub fn area_containing(page: PageNumber) -> Option<&'static VmArea> {
    LAYOUT.iter().find(|area| area.contains(page))
}
