use std::time::Duration;

/// Sizing and pacing of a [`crate::Scheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    /// Number of task slots.
    pub task_capacity: usize,
    /// Number of stack blocks. At most one per task is ever in use.
    pub stack_capacity: usize,
    /// Size in bytes of each stack block, shared by all levels of a task.
    pub stack_block_size: usize,
    /// Minimum wall-clock time between two admitted [`crate::Scheduler::run`]
    /// invocations. `None` runs every invocation.
    pub min_frame_interval: Option<Duration>,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            task_capacity: 1024,
            stack_capacity: 1024,
            stack_block_size: 512,
            min_frame_interval: None,
        }
    }
}

impl SchedConfig {
    pub fn with_task_capacity(mut self, capacity: usize) -> Self {
        self.task_capacity = capacity;
        self
    }

    pub fn with_stack_capacity(mut self, capacity: usize) -> Self {
        self.stack_capacity = capacity;
        self
    }

    pub fn with_stack_block_size(mut self, size: usize) -> Self {
        self.stack_block_size = size;
        self
    }

    pub fn with_min_frame_interval(mut self, interval: Option<Duration>) -> Self {
        self.min_frame_interval = interval;
        self
    }
}
