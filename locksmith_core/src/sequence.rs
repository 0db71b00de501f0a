//! Lock number sequencing for batch provisioning.
//!
//! The sequencer holds no state between calls: a batch is driven by feeding
//! each result back in as the next `current`.

use crate::SequenceError;
use serde::{Deserialize, Serialize};

/// What happens at the top of the range when wrapping is not requested
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Overflow {
    #[default]
    Fail,
    Saturate,
}

/// Range and overflow policy for issuing lock numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockNumberSequencer {
    pub min: u16,
    pub max: u16,
    pub on_overflow: Overflow,
}

impl Default for LockNumberSequencer {
    fn default() -> Self {
        Self {
            min: 1,
            max: u16::MAX,
            on_overflow: Overflow::Fail,
        }
    }
}

impl LockNumberSequencer {
    pub fn new(min: u16, max: u16, on_overflow: Overflow) -> Result<Self, SequenceError> {
        let sequencer = Self {
            min,
            max,
            on_overflow,
        };
        sequencer.validate()?;
        Ok(sequencer)
    }

    /// A usable range has at least two numbers, so `next` never returns its input
    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.min >= self.max {
            return Err(SequenceError::EmptyRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Lock number following `current`
    pub fn next(&self, current: u16, wrap: bool) -> Result<u16, SequenceError> {
        self.validate()?;

        if current < self.max {
            return Ok(current + 1);
        }

        if wrap {
            tracing::debug!("Lock number {} reached maximum, wrapping to {}", current, self.min);
            return Ok(self.min);
        }

        match self.on_overflow {
            Overflow::Fail => Err(SequenceError::Exhausted {
                current,
                max: self.max,
            }),
            Overflow::Saturate => Ok(self.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increments_below_max() {
        let seq = LockNumberSequencer::default();
        assert_eq!(seq.next(41, true).unwrap(), 42);
        assert_eq!(seq.next(0, false).unwrap(), 1);
        assert_eq!(seq.next(65534, false).unwrap(), 65535);
    }

    #[test]
    fn test_wraps_to_minimum() {
        let seq = LockNumberSequencer::new(1, 100, Overflow::Fail).unwrap();
        assert_eq!(seq.next(100, true).unwrap(), 1);
        assert_eq!(seq.next(250, true).unwrap(), 1);
    }

    #[test]
    fn test_never_returns_current_when_wrapping() {
        let seq = LockNumberSequencer::new(10, 20, Overflow::Fail).unwrap();
        for n in 0..=u16::MAX {
            assert_ne!(seq.next(n, true).unwrap(), n);
        }
    }

    #[test]
    fn test_fails_at_max_without_wrap() {
        let seq = LockNumberSequencer::default();
        assert_eq!(
            seq.next(u16::MAX, false),
            Err(SequenceError::Exhausted {
                current: u16::MAX,
                max: u16::MAX
            })
        );
    }

    #[test]
    fn test_saturate_holds_at_max() {
        let seq = LockNumberSequencer::new(1, 50, Overflow::Saturate).unwrap();
        assert_eq!(seq.next(80, false).unwrap(), 50);
        assert_eq!(seq.next(50, false).unwrap(), 50);
    }

    #[test]
    fn test_empty_range_rejected() {
        assert_eq!(
            LockNumberSequencer::new(5, 5, Overflow::Fail),
            Err(SequenceError::EmptyRange { min: 5, max: 5 })
        );
    }
}
