//! The per-frame driver: picks ready tasks and executes them until a
//! frame-break task is reached or nothing is left to run.

use std::ops::ControlFlow;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::context::Unwind;
use crate::cx::TaskCx;
use crate::{Message, TaskId};

use super::Scheduler;

impl Scheduler {
    /// Run one frame of game logic. Returns `false` if the rate limiter
    /// skipped this invocation.
    pub fn run(&mut self) -> bool {
        self.run_at(Instant::now())
    }

    /// [`Scheduler::run`] with an explicit wall-clock reading.
    pub fn run_at(&mut self, wall: Instant) -> bool {
        if !self.limiter.admit(wall) {
            trace!("frame skipped by rate limiter");
            return false;
        }
        self.sample_clock();
        self.pass += 1;

        if self.paused {
            if let Some(exempt) = self.exempt {
                if self.tasks[exempt].is_ready(self.now) {
                    self.running = Some(exempt);
                    self.execute(exempt, Message::Run);
                    self.running = None;
                }
            }
            return true;
        }

        while let Some(id) = self.current {
            let pass = self.pass;
            let task = &mut self.tasks[id];
            if task.last_pass == pass {
                // went all the way around the ring
                break;
            }
            task.last_pass = pass;
            let framebreak = task.framebreak;

            if task.is_ready(self.now) {
                self.running = Some(id);
                self.execute(id, Message::Run);
                self.running = None;
            } else if !self.select_next() && !framebreak {
                break;
            }

            if framebreak {
                trace!(tick = self.now, "frame break");
                break;
            }
        }
        true
    }

    /// Move the traversal cursor to the next task that is ready or carries
    /// the frame-break flag. Returns `false` if a whole cycle found none, in
    /// which case the cursor falls back to the first allocated task.
    pub(crate) fn select_next(&mut self) -> bool {
        let start = match self.current.or_else(|| self.first_task()) {
            Some(start) => start,
            None => return false,
        };
        let mut cursor = start;
        for _ in 0..self.tasks.len() {
            cursor = self.successor(cursor);
            let task = &self.tasks[cursor];
            if task.is_ready(self.now) || task.framebreak {
                self.current = Some(cursor);
                return true;
            }
        }
        self.current = self.fallback_task();
        false
    }

    /// Invoke the active function of `id` and drive delayed returns until
    /// the task suspends, completes, or frees itself.
    pub(crate) fn execute(&mut self, id: TaskId, message: Message) {
        trace!(task = %self.tasks[id].name, ?message, "execute");
        self.tasks[id].context.begin();
        let mut message = message;
        loop {
            let func = self.tasks[id].context.active_fn();
            let flow = func(&mut TaskCx::new(self, id), message);
            if !self.tasks.contains(id) {
                return;
            }
            match flow {
                ControlFlow::Break(_) => break,
                ControlFlow::Continue(()) => match self.ctx_return(id) {
                    Unwind::Finished => return,
                    Unwind::Resume => message = Message::Run,
                    Unwind::Sync => unreachable!("synchronous return without a native caller"),
                },
            }
        }
        self.tasks[id].context.end();
    }

    /// Pop the innermost level of `id`. A task whose entry function returns
    /// is complete and gets freed.
    pub(crate) fn ctx_return(&mut self, id: TaskId) -> Unwind {
        let task = &mut self.tasks[id];
        let unwind = task.context.pop(&mut self.stacks);
        if unwind == Unwind::Finished {
            debug!(task = %task.name, "task finished");
            self.free_task(id);
        }
        unwind
    }

    /// Execute `task` right now, on behalf of the running task. If `task`
    /// yields, control comes straight back here instead of moving the
    /// traversal cursor.
    ///
    /// A target that never yields (it runs off its end or frees itself)
    /// cannot hand control back; the caller is restored as the running task
    /// regardless.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a running task.
    pub fn run_and_return(&mut self, task: TaskId, message: Message) {
        let caller = match self.running {
            Some(caller) => caller,
            None => panic!("run_and_return outside of a running task"),
        };
        assert_ne!(caller, task, "task ran itself with run_and_return");
        self.tasks[task].ret_task = Some(caller);
        self.running = Some(task);
        self.execute(task, message);

        if self.running != Some(caller) {
            warn!(
                ?caller,
                ?task,
                running = ?self.running,
                "run-and-return target did not hand control back, restoring caller"
            );
            self.running = Some(caller);
        }
        if let Some(record) = self.tasks.get_mut(task) {
            record.ret_task = None;
        }
    }
}
