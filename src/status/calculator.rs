//! Derives a parent's desired status from the multiset of its children's
//! statuses.
//!
//! The function is pure: it only counts children by state, so the same
//! multiset always yields the same answer regardless of order or how many
//! times it is evaluated.

use super::{StepStatus, TaskStatus};

/// A child's status reduced to what the calculator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Created,
    Active,
    Success,
    Fail,
    Canceled,
}

impl ChildState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChildState::Success | ChildState::Fail | ChildState::Canceled
        )
    }
}

impl From<TaskStatus> for ChildState {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Created => ChildState::Created,
            TaskStatus::Preparing | TaskStatus::Running => ChildState::Active,
            TaskStatus::Success => ChildState::Success,
            TaskStatus::Fail => ChildState::Fail,
            TaskStatus::Canceled => ChildState::Canceled,
        }
    }
}

impl From<StepStatus> for ChildState {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Created => ChildState::Created,
            StepStatus::Running => ChildState::Active,
            StepStatus::Success => ChildState::Success,
            StepStatus::Fail => ChildState::Fail,
            StepStatus::Canceled => ChildState::Canceled,
        }
    }
}

/// Parent status proposed by [`calculate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derived {
    Created,
    Running,
    Success,
    Fail,
    Canceled,
}

#[derive(Default)]
struct Tally {
    total: usize,
    active: usize,
    terminal: usize,
    success: usize,
    fail: usize,
    canceled: usize,
}

/// Tie-breaks, in order:
/// 1. any child running or preparing → `Running`
/// 2. all children terminal and any failed → `Fail`
/// 3. all children canceled → `Canceled`
/// 4. all children succeeded → `Success`
/// 5. otherwise → `Created`
///
/// A parent without children stays `Created`.
pub fn calculate<I, S>(children: I) -> Derived
where
    I: IntoIterator<Item = S>,
    S: Into<ChildState>,
{
    let mut tally = Tally::default();
    for child in children {
        let state = child.into();
        tally.total += 1;
        if state.is_terminal() {
            tally.terminal += 1;
        }
        match state {
            ChildState::Active => tally.active += 1,
            ChildState::Success => tally.success += 1,
            ChildState::Fail => tally.fail += 1,
            ChildState::Canceled => tally.canceled += 1,
            ChildState::Created => {}
        }
    }

    if tally.total == 0 {
        return Derived::Created;
    }
    if tally.active > 0 {
        Derived::Running
    } else if tally.terminal == tally.total && tally.fail > 0 {
        Derived::Fail
    } else if tally.canceled == tally.total {
        Derived::Canceled
    } else if tally.success == tally.total {
        Derived::Success
    } else {
        Derived::Created
    }
}
