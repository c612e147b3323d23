//! Default fault reporting.
//!
//! The interrupt layer decodes a page fault or general protection fault and
//! hands it here. This crate has no recovery policy — no demand paging, no
//! swap — so the default handlers only describe what happened. A kernel
//! that grows recovery installs its own handlers in the interrupt layer and
//! falls back to these.

use core::fmt;

use crate::{VirtualAddress, layout, numbers::PageNumber};

/// Decoded page-fault error code, as pushed by the processor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FaultCode(u32);

impl FaultCode {
    const PROTECTION: u32 = 1 << 0;
    const WRITE: u32 = 1 << 1;
    const USER: u32 = 1 << 2;
    const RESERVED: u32 = 1 << 3;
    const FETCH: u32 = 1 << 4;

    /// Wraps a raw error code.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw error code.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// True for a permission violation, false for a non-present page.
    pub fn is_protection_violation(self) -> bool {
        self.0 & Self::PROTECTION != 0
    }

    /// True if the faulting access was a write.
    pub fn is_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// True if the fault was raised from user mode.
    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    /// True if a reserved bit was set in a paging entry.
    pub fn is_reserved_bit(self) -> bool {
        self.0 & Self::RESERVED != 0
    }

    /// True if the faulting access was an instruction fetch.
    pub fn is_instruction_fetch(self) -> bool {
        self.0 & Self::FETCH != 0
    }
}

impl fmt::Debug for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            if self.is_user() { "user" } else { "kernel" },
            if self.is_instruction_fetch() {
                "fetch"
            } else if self.is_write() {
                "write"
            } else {
                "read"
            },
            if self.is_protection_violation() {
                "protection-violation"
            } else {
                "non-present"
            },
        )?;
        if self.is_reserved_bit() {
            write!(f, " reserved-bit")?;
        }
        Ok(())
    }
}

/// Reports a page fault. This is the default handler: it logs the fault and
/// returns; whether the faulting task survives is its caller's decision.
pub fn report_page_fault(address: VirtualAddress, code: FaultCode, instruction: VirtualAddress) {
    let area = layout::area_containing(PageNumber::from(address));
    match area {
        Some(area) => log::error!(
            "page fault at {address} ({code:?}) in {:?} area, eip={instruction}",
            area.name
        ),
        None => log::error!(
            "page fault at {address} ({code:?}) outside any area, eip={instruction}"
        ),
    }
}

/// Reports a general protection fault. The error code is the faulting
/// selector index when the fault is segment-related, zero otherwise.
pub fn report_protection_fault(error_code: u32, instruction: VirtualAddress) {
    log::error!("general protection fault (error code {error_code:#x}), eip={instruction}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_bits() {
        let code = FaultCode::from_raw(0b00110);
        assert!(!code.is_protection_violation());
        assert!(code.is_write());
        assert!(code.is_user());
        assert!(!code.is_reserved_bit());
        assert!(!code.is_instruction_fetch());
    }

    #[test]
    fn formats_kernel_read_of_missing_page() {
        let code = FaultCode::from_raw(0);
        assert_eq!(format!("{code:?}"), "kernel read non-present");
    }

    #[test]
    fn formats_user_write_violation() {
        let code = FaultCode::from_raw(0b0111);
        assert_eq!(format!("{code:?}"), "user write protection-violation");
    }

    #[test]
    fn raw_round_trip() {
        let code = FaultCode::from_raw(0x1F);
        assert_eq!(code.to_raw(), 0x1F);
    }

    #[test]
    fn reporting_does_not_panic() {
        report_page_fault(
            VirtualAddress::new(0xC000_1000),
            FaultCode::from_raw(2),
            VirtualAddress::new(0x0010_0000),
        );
        report_protection_fault(0, VirtualAddress::new(0x0010_0000));
    }
}
