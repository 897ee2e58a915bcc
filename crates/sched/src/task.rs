use smol_str::SmolStr;

use crate::context::Context;
use crate::{LocalHandler, Tick};

slotmap::new_key_type! {
    /// Handle of a live task. Handles of freed tasks never resolve again.
    pub struct TaskId;
}

/// Messages a task function or local handler can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    /// Regular resumption by the frame driver.
    Run,
    /// The task is about to be freed.
    Free,
    /// Collaborator-defined notification.
    Local(u32),
}

/// When a task becomes ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextTick {
    At(Tick),
    /// Not ready until woken with [`crate::Scheduler::wake`].
    Asleep,
}

impl NextTick {
    pub fn is_due(self, now: Tick) -> bool {
        match self {
            NextTick::At(tick) => tick <= now,
            NextTick::Asleep => false,
        }
    }
}

/// Opaque handle a collaborator associates with a task, e.g. the game object
/// the task drives. The scheduler never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserData(pub u64);

/// One end of a main-ring link: either another task or the ring's sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Root,
    Task(TaskId),
}

/// Where a task sits in the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Links {
    /// Member of the main ring. `subtask_next` heads the chain of attached
    /// sub-tasks.
    Main {
        prev: Link,
        next: Link,
        subtask_next: Option<TaskId>,
    },
    /// Member of the sub-task chain of `subtask_parent`. The chain runs from
    /// the newest sub-task at its head to the oldest at its tail;
    /// `subtask_prev` is the newer neighbour and `subtask_next` the older one.
    Sub {
        subtask_parent: TaskId,
        subtask_prev: Option<TaskId>,
        subtask_next: Option<TaskId>,
    },
}

pub(crate) struct Task {
    pub(crate) name: SmolStr,
    pub(crate) framebreak: bool,
    pub(crate) links: Links,
    /// Set while the task runs on behalf of [`crate::Scheduler::run_and_return`].
    pub(crate) ret_task: Option<TaskId>,
    pub(crate) user_data: Option<UserData>,
    pub(crate) local_handler: Option<LocalHandler>,
    pub(crate) context: Context,
    pub(crate) next_tick: NextTick,
    /// Number of the last scheduling pass that visited this task.
    pub(crate) last_pass: u64,
}

impl Task {
    pub(crate) fn new(
        name: SmolStr,
        context: Context,
        links: Links,
        framebreak: bool,
        local_handler: Option<LocalHandler>,
        now: Tick,
    ) -> Self {
        Task {
            name,
            framebreak,
            links,
            ret_task: None,
            user_data: None,
            local_handler,
            context,
            next_tick: NextTick::At(now),
            last_pass: 0,
        }
    }

    pub(crate) fn is_sub_task(&self) -> bool {
        matches!(self.links, Links::Sub { .. })
    }

    /// Head of the sub-task chain (main tasks) or next sibling (sub-tasks).
    pub(crate) fn subtask_next(&self) -> Option<TaskId> {
        match self.links {
            Links::Main { subtask_next, .. } | Links::Sub { subtask_next, .. } => subtask_next,
        }
    }

    pub(crate) fn set_subtask_next(&mut self, to: Option<TaskId>) {
        match &mut self.links {
            Links::Main { subtask_next, .. } | Links::Sub { subtask_next, .. } => {
                *subtask_next = to
            }
        }
    }

    /// Newer sibling of a sub-task; `None` for the chain head and for main
    /// tasks.
    pub(crate) fn subtask_prev(&self) -> Option<TaskId> {
        match self.links {
            Links::Sub { subtask_prev, .. } => subtask_prev,
            Links::Main { .. } => None,
        }
    }

    pub(crate) fn set_subtask_prev(&mut self, to: Option<TaskId>) {
        match &mut self.links {
            Links::Sub { subtask_prev, .. } => *subtask_prev = to,
            Links::Main { .. } => panic!("main task `{}` has no sub-task predecessor", self.name),
        }
    }

    pub(crate) fn subtask_parent(&self) -> Option<TaskId> {
        match self.links {
            Links::Sub { subtask_parent, .. } => Some(subtask_parent),
            Links::Main { .. } => None,
        }
    }

    pub(crate) fn is_ready(&self, now: Tick) -> bool {
        self.next_tick.is_due(now)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("framebreak", &self.framebreak)
            .field("links", &self.links)
            .field("next_tick", &self.next_tick)
            .field("level", &self.context.level())
            .finish()
    }
}
