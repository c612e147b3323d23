//! Frame and page number types.
//!
//! Physical frames and virtual pages are both 4 KiB units identified by an
//! integer index, and mixing the two up is an easy mistake that the type
//! system can rule out entirely. This module provides a distinct newtype for
//! each; conversions to and from addresses are explicit.

use crate::{
    PAGE_SIZE,
    address::{PhysicalAddress, VirtualAddress},
    table::ENTRY_COUNT,
};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define the functionality shared by frame and page numbers.
macro_rules! impl_unit_number {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new number from a raw index.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw index.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_unit_number!(
    FrameNumber,
    "A physical page frame number.\n\n\
     Identifies one 4 KiB frame of physical memory. Frame 0 is never handed\n\
     out by the frame ledger and is reserved at initialization."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / PAGE_SIZE)
    }
}

impl_unit_number!(
    PageNumber,
    "A virtual page number.\n\n\
     Identifies one 4 KiB page of the linear address space. The two-level\n\
     translation indices for the page are derived with [`PageNumber::directory_index`]\n\
     and [`PageNumber::table_index`]."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * PAGE_SIZE)
    }

    /// Returns the page-directory slot whose page table covers this page.
    #[inline]
    pub const fn directory_index(self) -> usize {
        self.0 / ENTRY_COUNT
    }

    /// Returns the slot for this page within its page table.
    #[inline]
    pub const fn table_index(self) -> usize {
        self.0 % ENTRY_COUNT
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() / PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_start_address() {
        assert_eq!(FrameNumber::new(3).start().as_usize(), 3 * PAGE_SIZE);
    }

    #[test]
    fn frame_from_physical_address() {
        let addr = PhysicalAddress::new(5 * PAGE_SIZE + 17);
        assert_eq!(FrameNumber::from(addr), FrameNumber::new(5));
    }

    #[test]
    fn page_translation_indices() {
        let page = PageNumber::new(3 * ENTRY_COUNT + 7);
        assert_eq!(page.directory_index(), 3);
        assert_eq!(page.table_index(), 7);
    }

    #[test]
    fn page_round_trip() {
        let page = PageNumber::new(42);
        assert_eq!(PageNumber::from(page.start()), page);
    }

    #[test]
    fn arithmetic() {
        let frame = FrameNumber::new(10);
        assert_eq!((frame + 5).as_usize(), 15);
        assert_eq!((frame - 3).as_usize(), 7);
        assert_eq!(frame - FrameNumber::new(4), 6);
    }

    #[test]
    fn frame_and_page_are_distinct_types() {
        // A frame number and a page number with the same index are not
        // comparable; this is a compile-time property, so just exercise the
        // explicit conversions.
        let frame = FrameNumber::new(9);
        let page = PageNumber::new(frame.as_usize());
        assert_eq!(page.as_usize(), 9);
    }
}
