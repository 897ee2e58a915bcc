//! Cooperative, tick-driven task scheduler.
//!
//! Game logic runs as *tasks*: plain functions that are resumed once per
//! scheduling pass and suspend only where they choose to, by returning the
//! [`Flow`] produced by a suspension primitive on [`TaskCx`]. A task function
//! is a small state machine: it dispatches on [`TaskCx::resume_point`] and
//! records the point to continue from when it suspends.
//!
//! ```
//! use cotask_sched::{Flow, Message, SchedConfig, Scheduler, TaskCx, START};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! const AGAIN: u32 = 1;
//!
//! fn blink(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
//!     match cx.resume_point() {
//!         START | AGAIN => cx.yield_for(10, AGAIN),
//!         _ => unreachable!(),
//!     }
//! }
//!
//! let clock = Rc::new(Cell::new(0));
//! let mut sched = Scheduler::new(SchedConfig::default(), clock.clone());
//! let task = sched.create_task("blink", blink, false, None);
//! sched.run();
//! assert_eq!(sched.next_tick(task), Some(cotask_sched::NextTick::At(10)));
//! ```

pub mod config;
pub mod context;
pub mod cx;
pub mod error;
pub mod save;
pub mod sched;
pub mod task;
pub mod time;

#[cfg(test)]
mod test;

use std::ops::ControlFlow;

pub use config::SchedConfig;
pub use context::Context;
pub use cx::TaskCx;
pub use error::SaveError;
pub use sched::Scheduler;
pub use task::{Message, NextTick, TaskId, UserData};
pub use time::{RateLimiter, TickSource};

/// A discrete simulation time unit.
pub type Tick = u64;

/// Token naming the place inside a task function to continue from.
pub type ResumePoint = u32;

/// Resume point of a function that has not run yet.
pub const START: ResumePoint = 0;

/// Maximum nesting depth of [`TaskCx::call`] inside one task, including the
/// task's own entry function.
pub const MAX_LEVELS: usize = 8;

/// Proof that a task function recorded a resume point and handed control
/// back. Only the suspension primitives can create one.
#[must_use = "a suspended task function must return its `Suspend`"]
#[derive(Debug)]
pub struct Suspend(());

/// What a task function returns. `Continue(())` means the function ran off
/// its end; `Break` means it suspended.
pub type Flow = ControlFlow<Suspend>;

/// Signature of every task function.
pub type TaskFn = fn(&mut TaskCx<'_>, Message) -> Flow;

/// Immediate, non-suspending notification handler of a task. It receives
/// [`Message::Free`] right before the task is torn down, and whatever a
/// collaborator sends through [`Scheduler::run_local_handler`].
pub type LocalHandler = fn(&mut Scheduler, TaskId, Message);

pub(crate) fn suspended() -> Flow {
    ControlFlow::Break(Suspend(()))
}
