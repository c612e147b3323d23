//! Architecture port layer.
//!
//! The paging-entry format and table geometry are fixed by the 32-bit
//! protected-mode design and live in the core modules; what varies per
//! architecture is the handful of privileged operations around them:
//! translation-cache maintenance, turning paging on, and interrupt
//! suppression. This module conditionally selects the x86 hardware port or
//! the software no-op port used for testing and emulation.

// Use the x86 hardware port when we're on x86 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86")]
mod x86;
#[cfg(all(target_arch = "x86", not(test), not(feature = "software-emulation")))]
pub use x86::*;

// Use the software port ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
