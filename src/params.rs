//! This module defines the `CcvParams` struct, which holds the window-size range
//! used to build complete composition vectors. Counting always covers
//! `[start - 2, end]` so that pi-values can be computed for every window in
//! `[start, end]`. Parameters are validated on construction and can be checked
//! for compatibility when an existing vector set is extended.

use serde::{Deserialize, Serialize};

use crate::error::{CcvError, Result};

pub const DEFAULT_START: usize = 3;
pub const DEFAULT_END: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcvParams {
    start: usize,
    end: usize,
}

impl Default for CcvParams {
    fn default() -> Self {
        CcvParams {
            start: DEFAULT_START,
            end: DEFAULT_END,
        }
    }
}

impl CcvParams {
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start <= 2 || end < start {
            return Err(CcvError::InvalidWindowRange { start, end });
        }

        Ok(CcvParams { start, end })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Smallest window size that is counted.
    pub fn count_start(&self) -> usize {
        self.start - 2
    }

    /// Window sizes with pi-values, `[start, end]`.
    pub fn windows(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }

    /// Window sizes with counts, `[start - 2, end]`.
    pub fn count_windows(&self) -> std::ops::RangeInclusive<usize> {
        self.count_start()..=self.end
    }

    /// Return true if parameters are identical.
    pub fn check_compatibility(&self, other: &CcvParams) -> Result<bool> {
        if self.start != other.start || self.end != other.end {
            return Err(CcvError::format(
                "vector set",
                format!(
                    "window range [{}, {}] does not match existing range [{}, {}]",
                    self.start, self.end, other.start, other.end
                ),
            ));
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_validation() {
        assert!(CcvParams::new(3, 9).is_ok());
        assert!(CcvParams::new(5, 5).is_ok());
        assert!(matches!(
            CcvParams::new(2, 9),
            Err(CcvError::InvalidWindowRange { start: 2, end: 9 })
        ));
        assert!(matches!(
            CcvParams::new(6, 5),
            Err(CcvError::InvalidWindowRange { .. })
        ));
    }

    #[test]
    fn test_count_windows() {
        let params = CcvParams::new(3, 4).unwrap();
        assert_eq!(params.count_windows().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(params.windows().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_compatibility() {
        let a = CcvParams::new(3, 9).unwrap();
        let b = CcvParams::new(3, 8).unwrap();
        assert!(a.check_compatibility(&a).unwrap());
        assert!(a.check_compatibility(&b).is_err());
    }
}
