//! Task registry and lifecycle.
//!
//! Main tasks form a circular doubly linked ring rooted at a sentinel; each
//! main task may own a chain of sub-tasks, newest at the head, which run
//! oldest first and before their parent on every pass. Links are task ids
//! stored in the task records, so nothing dangles when a slot is freed.

mod driver;
mod links;

use cotask_arena::{Pool, StackPool};
use smol_str::SmolStr;
use tracing::{debug, info};

use crate::config::SchedConfig;
use crate::context::Context;
use crate::task::{Link, Links, Task};
use crate::time::{RateLimiter, TickSource};
use crate::{LocalHandler, Message, NextTick, ResumePoint, TaskFn, TaskId, Tick, UserData};

use links::RootLinks;

pub struct Scheduler {
    config: SchedConfig,
    clock: Box<dyn TickSource>,
    limiter: RateLimiter,
    pub(crate) tasks: Pool<TaskId, Task>,
    pub(crate) stacks: StackPool,
    pub(crate) root: RootLinks,
    /// Traversal cursor of the frame driver.
    pub(crate) current: Option<TaskId>,
    /// Task whose function is executing right now.
    pub(crate) running: Option<TaskId>,
    /// Tick sampled at the start of the current frame.
    pub(crate) now: Tick,
    pass: u64,
    paused: bool,
    exempt: Option<TaskId>,
    shut_down: bool,
}

impl Scheduler {
    pub fn new(config: SchedConfig, clock: impl TickSource + 'static) -> Self {
        let now = clock.ticks();
        Scheduler {
            limiter: RateLimiter::new(config.min_frame_interval),
            tasks: Pool::with_capacity("task", config.task_capacity),
            stacks: StackPool::new(config.stack_capacity, config.stack_block_size),
            root: RootLinks::empty(),
            current: None,
            running: None,
            now,
            pass: 0,
            paused: false,
            exempt: None,
            shut_down: false,
            clock: Box::new(clock),
            config,
        }
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Tick the scheduler considers current.
    pub fn tick(&self) -> Tick {
        self.now
    }

    fn sample_clock(&mut self) -> Tick {
        self.now = self.clock.ticks();
        self.now
    }

    /// Create a main task, ready immediately, and splice it into the ring
    /// right after the traversal cursor.
    pub fn create_task(
        &mut self,
        name: impl Into<SmolStr>,
        entry: TaskFn,
        frame_break: bool,
        local_handler: Option<LocalHandler>,
    ) -> TaskId {
        assert!(!self.shut_down, "task created after scheduler shutdown");
        let now = self.sample_clock();
        let anchor = match self.current {
            Some(cursor) => Link::Task(self.main_of(cursor)),
            None => Link::Root,
        };
        let links = Links::Main {
            prev: Link::Root,
            next: Link::Root,
            subtask_next: None,
        };
        let task = Task::new(
            name.into(),
            Context::new(entry),
            links,
            frame_break,
            local_handler,
            now,
        );
        let id = self.tasks.alloc(task);
        self.ring_insert_after(anchor, id);
        if self.current.is_none() {
            self.current = Some(id);
        }
        debug!(task = %self.tasks[id].name, ?id, frame_break, "create task");
        id
    }

    /// Create a sub-task of the task that is executing right now.
    ///
    /// # Panics
    ///
    /// Panics when no task is executing.
    pub fn create_sub_task(
        &mut self,
        name: impl Into<SmolStr>,
        entry: TaskFn,
        local_handler: Option<LocalHandler>,
    ) -> TaskId {
        let parent = match self.running {
            Some(running) => running,
            None => panic!("sub-task created outside of a running task"),
        };
        self.create_sub_task_of(parent, name, entry, local_handler)
    }

    /// Create a sub-task at the head of `parent`'s chain. Sub-tasks only nest
    /// one deep: if `parent` is itself a sub-task the new task joins the
    /// chain of its owning main task.
    pub fn create_sub_task_of(
        &mut self,
        parent: TaskId,
        name: impl Into<SmolStr>,
        entry: TaskFn,
        local_handler: Option<LocalHandler>,
    ) -> TaskId {
        assert!(!self.shut_down, "task created after scheduler shutdown");
        assert!(self.tasks.contains(parent), "sub-task of a dead task");
        let owner = self.main_of(parent);
        let now = self.sample_clock();
        let links = Links::Sub {
            subtask_parent: owner,
            subtask_prev: None,
            subtask_next: None,
        };
        let task = Task::new(
            name.into(),
            Context::new(entry),
            links,
            false,
            local_handler,
            now,
        );
        let id = self.tasks.alloc(task);
        self.subtask_prepend(owner, id);
        debug!(
            task = %self.tasks[id].name,
            parent = %self.tasks[owner].name,
            ?id,
            "create sub-task"
        );
        id
    }

    /// Destroy `task`.
    ///
    /// Safe to call on the executing task itself: the traversal cursor is
    /// moved off the task before it is unlinked, and the frame driver never
    /// touches it again. The task function must return right away.
    ///
    /// # Panics
    ///
    /// Panics if `task` is dead or still owns sub-tasks.
    pub fn free_task(&mut self, task: TaskId) {
        let record = match self.tasks.get(task) {
            Some(record) => record,
            None => panic!("freeing a dead task {:?}", task),
        };
        if !record.is_sub_task() {
            if let Some(child) = record.subtask_next() {
                panic!(
                    "task `{}` freed while sub-task `{}` is still attached",
                    record.name, self.tasks[child].name
                );
            }
        }

        if let Some(handler) = record.local_handler {
            handler(self, task, Message::Free);
            assert!(
                self.tasks.contains(task),
                "local handler freed its own task during teardown"
            );
        }

        if self.current == Some(task) {
            self.select_next();
            if self.current == Some(task) {
                self.current = None;
            }
        }

        self.unlink(task);
        if self.running == Some(task) {
            self.running = None;
        }
        if self.exempt == Some(task) {
            self.exempt = None;
        }

        if let Some(mut record) = self.tasks.free(task) {
            record.context.free_stack(&mut self.stacks);
            debug!(task = %record.name, ?task, "free task");
        }
        if self.current.is_none() {
            self.current = self.fallback_task();
        }
    }

    /// Drop every task and stack block without notifying anyone. Used
    /// between levels.
    pub fn reset(&mut self) {
        debug!(tasks = self.tasks.len(), "reset task system");
        self.tasks.clear();
        self.stacks.clear();
        self.root = RootLinks::empty();
        self.current = None;
        self.running = None;
        self.exempt = None;
        self.paused = false;
    }

    /// Tear down every task, sending [`Message::Free`] to each local handler
    /// first, then clear the arenas.
    pub fn free_all(&mut self) {
        let doomed = self
            .tasks
            .iter()
            .filter_map(|(id, task)| task.local_handler.map(|handler| (id, handler)))
            .collect::<Vec<_>>();
        for (id, handler) in doomed {
            if self.tasks.contains(id) {
                handler(self, id, Message::Free);
            }
        }
        self.reset();
    }

    /// Free everything and refuse further task creation.
    pub fn shutdown(&mut self) {
        self.free_all();
        self.shut_down = true;
        info!("task system shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Halt scheduling. While paused only `exempt` (if any) keeps running.
    pub fn pause(&mut self, pause: bool, exempt: Option<TaskId>) {
        debug!(pause, ?exempt, "pause task system");
        self.paused = pause;
        self.exempt = exempt;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Make a sleeping (or waiting) task ready at the current tick.
    pub fn wake(&mut self, task: TaskId) {
        let now = self.now;
        self.tasks[task].next_tick = NextTick::At(now);
    }

    /// Put `task` to sleep until [`Scheduler::wake`] is called on it.
    pub fn sleep_task(&mut self, task: TaskId) {
        self.tasks[task].next_tick = NextTick::Asleep;
    }

    /// Deliver `message` to the task's local handler immediately. The
    /// handler cannot suspend; tasks without one ignore the message.
    pub fn run_local_handler(&mut self, task: TaskId, message: Message) {
        if let Some(handler) = self.tasks[task].local_handler {
            handler(self, task, message);
        }
    }

    pub fn set_user_data(&mut self, task: TaskId, data: Option<UserData>) {
        self.tasks[task].user_data = data;
    }

    pub fn user_data(&self, task: TaskId) -> Option<UserData> {
        self.tasks[task].user_data
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_live(&self, task: TaskId) -> bool {
        self.tasks.contains(task)
    }

    pub fn task_name(&self, task: TaskId) -> Option<&str> {
        self.tasks.get(task).map(|t| t.name.as_str())
    }

    pub fn next_tick(&self, task: TaskId) -> Option<NextTick> {
        self.tasks.get(task).map(|t| t.next_tick)
    }

    pub fn is_frame_break(&self, task: TaskId) -> bool {
        self.tasks[task].framebreak
    }

    /// Current recursion level of the task's context.
    pub fn level(&self, task: TaskId) -> i32 {
        self.tasks[task].context.level()
    }

    /// Resume point recorded at the innermost level of the task.
    pub fn resume_point(&self, task: TaskId) -> ResumePoint {
        self.tasks[task].context.resume_point()
    }

    pub fn context(&self, task: TaskId) -> &Context {
        &self.tasks[task].context
    }

    /// Persistent locals of `task` at `level`; empty if the level owns none.
    pub fn local_bytes(&self, task: TaskId, level: usize) -> &[u8] {
        self.tasks[task].context.level_bytes(&self.stacks, level)
    }

    /// Traversal cursor of the frame driver.
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// The task whose function is executing, if any.
    pub fn running(&self) -> Option<TaskId> {
        self.running
    }

    /// The main task owning `task`'s sub-task chain, or `None` for main tasks.
    pub fn parent(&self, task: TaskId) -> Option<TaskId> {
        self.tasks[task].subtask_parent()
    }

    /// Sub-tasks attached to `task`, in execution order: oldest first.
    pub fn subtasks(&self, task: TaskId) -> Vec<TaskId> {
        let mut out = vec![];
        if self.tasks[task].is_sub_task() {
            return out;
        }
        let mut cursor = self.tasks[task].subtask_next();
        while let Some(child) = cursor {
            out.push(child);
            cursor = self.tasks[child].subtask_next();
        }
        out.reverse();
        out
    }

    pub(crate) fn main_of(&self, task: TaskId) -> TaskId {
        self.tasks[task].subtask_parent().unwrap_or(task)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.len())
            .field("current", &self.current)
            .field("running", &self.running)
            .field("now", &self.now)
            .field("paused", &self.paused)
            .finish()
    }
}
