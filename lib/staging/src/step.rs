// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Step lifecycle.
//!
//! `Closed → Opened → StepActive → StepDrained → (StepActive …) → Closed`
//!
//! [`StepController`] only tracks state and the step counter; the engine does
//! the I/O around each transition.

use std::fmt;

use crate::error::{Result, StagingError};

/// Lifecycle state of a writer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StepState {
    /// Not opened, or closed.
    #[default]
    Closed,
    /// Opened, no step begun yet.
    Opened,
    /// A step buffer is live and accepts puts.
    StepActive,
    /// The last step was drained; the next `begin_step` may follow.
    StepDrained,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepState::Closed => "closed",
            StepState::Opened => "opened",
            StepState::StepActive => "step-active",
            StepState::StepDrained => "step-drained",
        };
        f.write_str(name)
    }
}

/// Step advance mode. Accepted for symmetry with readers; writers always
/// advance to the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    #[allow(missing_docs)]
    Append,
    #[allow(missing_docs)]
    Update,
    #[allow(missing_docs)]
    NextAvailable,
    #[allow(missing_docs)]
    LatestAvailable,
}

/// Result of `begin_step`. The writer only ever reports [`StepStatus::Ok`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// More steps may follow.
    Ok,
    /// No step is ready yet (reader side).
    NotReady,
    /// The stream has ended (reader side).
    EndOfStream,
    #[allow(missing_docs)]
    OtherError,
}

/// Put flavor. Both flavors append into the step buffer immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    #[default]
    #[allow(missing_docs)]
    Sync,
    #[allow(missing_docs)]
    Deferred,
}

/// State machine and step counter of one session.
#[derive(Debug, Default)]
pub struct StepController {
    state: StepState,
    current: Option<u64>,
}

impl StepController {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Step number of the most recent `begin_step`, `None` before the first.
    pub fn current_step(&self) -> Option<u64> {
        self.current
    }

    /// `Closed → Opened`.
    pub fn open(&mut self) -> Result<()> {
        self.expect("open", &[StepState::Closed])?;
        self.state = StepState::Opened;
        Ok(())
    }

    /// `Opened | StepDrained → StepActive`; returns the new step number.
    pub fn begin(&mut self) -> Result<u64> {
        self.expect("begin_step", &[StepState::Opened, StepState::StepDrained])?;
        let next = match self.current {
            None => 0,
            Some(step) => step + 1,
        };
        self.current = Some(next);
        self.state = StepState::StepActive;
        Ok(next)
    }

    /// Puts are only legal inside an active step.
    pub fn check_put(&self) -> Result<u64> {
        self.active_step("put")
    }

    /// `end_step` is only legal inside an active step; returns its number.
    pub fn check_end(&self) -> Result<u64> {
        self.active_step("end_step")
    }

    /// `StepActive → StepDrained`.
    pub fn drain(&mut self) -> Result<()> {
        self.expect("end_step", &[StepState::StepActive])?;
        self.state = StepState::StepDrained;
        Ok(())
    }

    /// Any state `→ Closed`, forgetting the step counter so the next session
    /// numbers from 0 again. Returns the state that was left.
    pub fn close(&mut self) -> StepState {
        std::mem::take(self).state
    }

    fn active_step(&self, operation: &'static str) -> Result<u64> {
        self.expect(operation, &[StepState::StepActive])?;
        self.current.ok_or(StagingError::InvalidState {
            operation,
            state: self.state,
        })
    }

    fn expect(&self, operation: &'static str, allowed: &[StepState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StagingError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_start_at_zero_and_increase() {
        let mut steps = StepController::new();
        steps.open().unwrap();
        assert_eq!(steps.current_step(), None);

        for expected in 0..5 {
            assert_eq!(steps.begin().unwrap(), expected);
            assert_eq!(steps.current_step(), Some(expected));
            assert_eq!(steps.check_end().unwrap(), expected);
            steps.drain().unwrap();
        }
        assert_eq!(steps.state(), StepState::StepDrained);
    }

    #[test]
    fn test_begin_while_active_is_rejected() {
        let mut steps = StepController::new();
        steps.open().unwrap();
        steps.begin().unwrap();
        let err = steps.begin().unwrap_err();
        assert!(matches!(
            err,
            StagingError::InvalidState {
                operation: "begin_step",
                state: StepState::StepActive
            }
        ));
        assert_eq!(steps.current_step(), Some(0));
    }

    #[test]
    fn test_put_outside_step_is_rejected() {
        let mut steps = StepController::new();
        assert!(steps.check_put().is_err());
        steps.open().unwrap();
        assert!(steps.check_put().is_err());
        steps.begin().unwrap();
        assert_eq!(steps.check_put().unwrap(), 0);
        steps.drain().unwrap();
        assert!(steps.check_put().is_err());
        assert!(steps.check_end().is_err());
    }

    #[test]
    fn test_close_from_any_state() {
        let mut steps = StepController::new();
        assert_eq!(steps.close(), StepState::Closed);
        steps.open().unwrap();
        steps.begin().unwrap();
        assert_eq!(steps.close(), StepState::StepActive);
        assert_eq!(steps.state(), StepState::Closed);
        assert!(steps.begin().is_err());
    }

    #[test]
    fn test_close_restarts_numbering() {
        let mut steps = StepController::new();
        steps.open().unwrap();
        for _ in 0..3 {
            steps.begin().unwrap();
            steps.drain().unwrap();
        }
        assert_eq!(steps.current_step(), Some(2));

        assert_eq!(steps.close(), StepState::StepDrained);
        assert_eq!(steps.current_step(), None);
        steps.open().unwrap();
        assert_eq!(steps.current_step(), None);
        assert_eq!(steps.begin().unwrap(), 0);
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let mut steps = StepController::new();
        steps.open().unwrap();
        assert!(steps.open().is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(StepState::StepActive.to_string(), "step-active");
        assert_eq!(StepState::StepDrained.to_string(), "step-drained");
    }
}
