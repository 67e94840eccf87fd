//! Progress computation
//!
//! The first and last steps (welcome and thank-you) don't count.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    /// Rounded down; 0 when there is nothing to count
    pub percentage: u8,
}

pub fn compute(step_count: usize, current_index: usize, done: bool) -> Progress {
    let total = step_count.saturating_sub(2);
    let completed = if done { total } else { current_index.min(total) };
    let percentage = if total == 0 {
        0
    } else {
        (completed * 100 / total) as u8
    };

    Progress {
        completed,
        total,
        percentage,
    }
}
