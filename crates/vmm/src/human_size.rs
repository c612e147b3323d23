//! Human-readable size formatting for log output.

use core::fmt;

/// Wraps a size in bytes and formats it with binary SI prefixes.
///
/// Values divide by 1024 per unit and are shown with at most one decimal
/// place, omitted when the value is whole. Memory-management log lines deal
/// in frame counts and region lengths, which are always whole multiples of
/// small powers of two, so one decimal is plenty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl HumanSize {
    /// Creates a new human-readable size from bytes.
    #[inline]
    pub const fn new(bytes: usize) -> Self {
        Self(bytes)
    }

    /// Returns the raw byte count.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.0
    }
}

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];

        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }

        let mut whole = self.0;
        let mut unit = 0;
        while whole >= 1024 && unit < UNITS.len() - 1 {
            whole /= 1024;
            unit += 1;
        }

        // Tenths of the chosen unit, rounded down. Widened so the scaling
        // cannot overflow a 32-bit usize.
        let tenths = ((self.0 as u64 * 10) >> (10 * unit)) as usize;
        if tenths % 10 == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else {
            write!(f, "{}.{}{}", tenths / 10, tenths % 10, UNITS[unit])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format!("{}", HumanSize(0)), "0B");
        assert_eq!(format!("{}", HumanSize(512)), "512B");
        assert_eq!(format!("{}", HumanSize(1023)), "1023B");
    }

    #[test]
    fn formats_kibibytes() {
        assert_eq!(format!("{}", HumanSize(1024)), "1KiB");
        assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", HumanSize(10240)), "10KiB");
    }

    #[test]
    fn formats_mebibytes() {
        assert_eq!(format!("{}", HumanSize(1 << 20)), "1MiB");
        assert_eq!(format!("{}", HumanSize(3 << 19)), "1.5MiB");
    }

    #[test]
    fn formats_gibibytes() {
        assert_eq!(format!("{}", HumanSize(1 << 30)), "1GiB");
    }
}
