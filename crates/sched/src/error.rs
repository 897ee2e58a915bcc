use thiserror::Error;

/// Failures while saving or restoring task state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaveError {
    #[error("task is not live")]
    DeadTask,
    #[error("task is suspended inside a nested call (level {level})")]
    NestedFrames { level: i32 },
    #[error("saved data ends early: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("saved locals take {size} bytes, stack blocks hold {max}")]
    SliceTooLarge { size: usize, max: usize },
    #[error("unknown next-tick kind {0}")]
    BadNextTickKind(u8),
}
