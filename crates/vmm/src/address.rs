//! Address types and raw physical-memory access.
//!
//! This module provides wrappers for physical and virtual addresses, and the
//! [`PhysAccess`] service used to obtain a pointer to the contents of a
//! physical frame. In the kernel the low region of physical memory is
//! identity-mapped, so access is a cast; under test the "physical memory" is
//! an in-process buffer provided by the software-emulation arch.

use core::fmt;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Macro to define the functionality shared by the two address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#010x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses identify locations in machine memory and are only\n\
     dereferenceable through [`PhysAccess`] (or, transiently, through a\n\
     temporary mapping once paging is enabled)."
);

impl_address_common!(
    VirtualAddress,
    "A virtual (linear) memory address.\n\n\
     Virtual addresses are interpreted through the currently active page\n\
     directory once paging is enabled."
);

/// Access to the contents of physical memory.
///
/// Two modes are supported:
/// - `Identity`: physical addresses are usable as pointers. Valid for the
///   identity-mapped low kernel region, and for all of memory during the
///   no-paging bootstrap phase.
/// - `Emulated`: physical memory is a buffer inside the host process,
///   provided by the software-emulation arch (test mode).
pub enum PhysAccess {
    /// The target region of physical memory is identity-mapped.
    Identity,
    /// Physical memory is simulated by an in-process buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl PhysAccess {
    /// Sets the global physical-memory accessor.
    ///
    /// This function must be called exactly once during initialization.
    ///
    /// # Panics
    ///
    /// Panics if the accessor has already been set.
    pub fn set_current(access: PhysAccess) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if PHYS_ACCESS.get().is_some() {
                panic!("physical-memory accessor already set");
            }
            PHYS_ACCESS.call_once(|| access);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            PHYS_ACCESS.with(|a| {
                if a.get().is_some() {
                    panic!("physical-memory accessor already set");
                }
                a.call_once(|| access);
            });
        }
    }

    /// Returns a reference to the current global physical-memory accessor.
    ///
    /// # Panics
    ///
    /// Panics if the accessor has not been set yet.
    pub fn current() -> &'static PhysAccess {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            PHYS_ACCESS.get().expect(
                "physical-memory accessor not set; call PhysAccess::set_current during initialization",
            )
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            PHYS_ACCESS.with(|a| {
                // SAFETY: We leak the reference to make it 'static. This is safe because:
                // 1. In test mode, each thread has its own PHYS_ACCESS
                // 2. Once set, it's never modified (spin::Once guarantees this)
                // 3. The thread-local lives for the entire duration of the thread
                unsafe {
                    &*(a.get().expect(
                        "physical-memory accessor not set; call PhysAccess::set_current during initialization",
                    ) as *const PhysAccess)
                }
            })
        }
    }

    /// Returns the current global accessor if it has been set.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static PhysAccess> {
        PHYS_ACCESS.with(|a| {
            a.get().map(|access| {
                // SAFETY: Same reasoning as current() - we leak the reference for
                // 'static lifetime
                unsafe { &*(access as *const PhysAccess) }
            })
        })
    }

    /// Translates a physical address to a typed pointer.
    ///
    /// In `Identity` mode the caller is responsible for only translating
    /// addresses that really are identity-mapped in the active address space.
    pub fn ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Identity => phys.as_usize() as *mut T,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys).cast(),
        }
    }
}

/// Global physical-memory accessor.
///
/// Initialized once during kernel startup (with the Identity variant). In
/// test/software-emulation mode this is thread-local so that every test gets
/// its own emulated physical memory.
#[cfg(not(any(test, feature = "software-emulation")))]
static PHYS_ACCESS: spin::Once<PhysAccess> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static PHYS_ACCESS: spin::Once<PhysAccess> = spin::Once::new();
}
