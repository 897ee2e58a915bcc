//! The yield/call protocol available to task functions.

use std::ops::ControlFlow;

use bytemuck::Pod;
use cotask_arena::STACK_ALIGN;
use smol_str::SmolStr;
use tracing::trace;

use crate::context::Unwind;
use crate::task::NextTick;
use crate::{
    suspended, Flow, LocalHandler, Message, ResumePoint, Scheduler, TaskFn, TaskId, Tick,
    UserData,
};

/// Handle a task function uses to talk to the scheduler while it runs.
pub struct TaskCx<'s> {
    sched: &'s mut Scheduler,
    task: TaskId,
}

impl<'s> TaskCx<'s> {
    pub(crate) fn new(sched: &'s mut Scheduler, task: TaskId) -> Self {
        TaskCx { sched, task }
    }

    /// The task this function runs for.
    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn name(&self) -> &str {
        &self.sched.tasks[self.task].name
    }

    /// Tick of the frame being run.
    pub fn tick(&self) -> Tick {
        self.sched.now
    }

    pub fn level(&self) -> i32 {
        self.sched.tasks[self.task].context.level()
    }

    /// Where the running function should continue from.
    pub fn resume_point(&self) -> ResumePoint {
        self.sched.tasks[self.task].context.resume_point()
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.sched.tasks[self.task].user_data
    }

    /// The scheduler, for operations on other tasks.
    pub fn scheduler(&mut self) -> &mut Scheduler {
        self.sched
    }

    /// Reserve `size` zeroed bytes of persistent locals for the running
    /// level. A no-op if the level already owns its slice.
    pub fn allocate(&mut self, size: usize) {
        let sched = &mut *self.sched;
        sched.tasks[self.task]
            .context
            .allocate(&mut sched.stacks, size);
    }

    /// The running level's locals slice; empty until [`TaskCx::allocate`].
    pub fn local_bytes(&mut self) -> &mut [u8] {
        let sched = &mut *self.sched;
        let context = &sched.tasks[self.task].context;
        let level = context.level().max(0) as usize;
        context.level_bytes_mut(&mut sched.stacks, level)
    }

    /// Typed persistent locals of the running level, zeroed on first access.
    /// They survive suspension and are released when the level returns.
    pub fn locals<L: Pod>(&mut self) -> &mut L {
        assert!(
            std::mem::align_of::<L>() <= STACK_ALIGN,
            "locals need at most {}-byte alignment",
            STACK_ALIGN
        );
        let size = std::mem::size_of::<L>();
        self.allocate(size);
        bytemuck::from_bytes_mut(&mut self.local_bytes()[..size])
    }

    /// Suspend for `delay` ticks, continuing at `resume`. A delay of zero
    /// makes the task ready again on the next pass.
    pub fn yield_for(&mut self, delay: Tick, resume: ResumePoint) -> Flow {
        let at = self.sched.now + delay;
        self.sched.yield_task(self.task, NextTick::At(at), resume)
    }

    /// Suspend until another task calls [`Scheduler::wake`], continuing at
    /// `resume`.
    pub fn sleep(&mut self, resume: ResumePoint) -> Flow {
        self.sched.yield_task(self.task, NextTick::Asleep, resume)
    }

    /// Call `func` as a nested level of this task. If `func` runs off its end
    /// the caller continues right away at `resume`; if it suspends, so does
    /// the caller, and it is re-entered at `resume` once `func` returns.
    ///
    /// Use with `?` so suspension propagates:
    ///
    /// ```ignore
    /// cx.call(walk, msg, AFTER_WALK)?;
    /// ```
    pub fn call(&mut self, func: TaskFn, message: Message, resume: ResumePoint) -> Flow {
        let id = self.task;
        let caller = self.sched.tasks[id].context.push(func);
        trace!(task = %self.sched.tasks[id].name, level = caller + 1, "call");

        let flow = func(self, message);

        let sched = &mut *self.sched;
        let task = match sched.tasks.get_mut(id) {
            Some(task) => task,
            // freed from inside the callee
            None => return suspended(),
        };
        match flow {
            ControlFlow::Continue(()) => {
                let unwind = task.context.pop(&mut sched.stacks);
                assert_eq!(unwind, Unwind::Sync, "call returned through the driver");
                task.context.finish_call(caller, resume, false);
                ControlFlow::Continue(())
            }
            ControlFlow::Break(suspend) => {
                task.context.finish_call(caller, resume, true);
                ControlFlow::Break(suspend)
            }
        }
    }

    /// Free this task and suspend for good. The function must return the
    /// result immediately.
    pub fn exit(&mut self) -> Flow {
        self.sched.free_task(self.task);
        suspended()
    }

    /// Shorthand for [`Scheduler::create_sub_task`] under this task.
    pub fn create_sub_task(
        &mut self,
        name: impl Into<SmolStr>,
        entry: TaskFn,
        local_handler: Option<LocalHandler>,
    ) -> TaskId {
        let task = self.task;
        self.sched
            .create_sub_task_of(task, name, entry, local_handler)
    }

    /// Shorthand for [`Scheduler::run_and_return`].
    pub fn run_and_return(&mut self, task: TaskId, message: Message) {
        self.sched.run_and_return(task, message)
    }
}

impl Scheduler {
    /// Record `resume` for the innermost level of `id` and suspend it until
    /// `until`. A task running under [`Scheduler::run_and_return`] hands
    /// control straight back to its caller instead.
    pub(crate) fn yield_task(&mut self, id: TaskId, until: NextTick, resume: ResumePoint) -> Flow {
        let now = self.now;
        let task = &mut self.tasks[id];
        task.context.set_resume_point(resume);

        if let Some(ret) = task.ret_task.take() {
            trace!(task = %task.name, ?ret, "yield back to caller");
            self.running = Some(ret);
            return suspended();
        }

        task.next_tick = until;
        trace!(task = %task.name, tick = now, ?until, resume, "yield");
        if self.current == Some(id) {
            self.select_next();
        }
        suspended()
    }
}
