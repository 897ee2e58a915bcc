//! Per-task emulated call stack.
//!
//! Each level of a [`Context`] is one active task function: the function
//! itself, the resume point it recorded when it last suspended, and an
//! optional slice of the task's stack block holding locals that must survive
//! suspension. Level 0 is the task's entry function.
//!
//! Nested calls come in two flavours. A call whose callee runs off its end
//! before suspending returns *synchronously*: the callee level is popped and
//! the caller keeps running natively. A call whose callee suspends is
//! *delayed*: the caller records its resume point and suspends too, and
//! when the callee eventually returns the frame driver pops the callee level
//! and re-enters the caller level. `call_level` counts the native nesting
//! of the current execution so the two cases can be told apart.


use std::ops::Range;

use cotask_arena::{StackKey, StackPool, STACK_ALIGN};

use crate::{ResumePoint, TaskFn, MAX_LEVELS, START};

static_assertions::const_assert!(MAX_LEVELS > 1);
static_assertions::const_assert!(MAX_LEVELS <= i32::MAX as usize);

/// How popping a level continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unwind {
    /// The caller is waiting natively inside [`crate::TaskCx::call`].
    Sync,
    /// The caller's call was delayed; it must be re-entered at its resume
    /// point.
    Resume,
    /// Level 0 returned: the task is complete.
    Finished,
}

pub struct Context {
    /// Innermost live level; `-1` before the task first runs.
    level: i32,
    /// Native nesting of the current execution; `-1` while not executing.
    call_level: i32,
    ip: [ResumePoint; MAX_LEVELS],
    callstack: [Option<TaskFn>; MAX_LEVELS],
    /// Set on a level whose call into the level above suspended.
    delayed_call: [bool; MAX_LEVELS],
    stack_mem: Option<StackKey>,
    stack_offset: usize,
    stack_ptr: [usize; MAX_LEVELS],
    stack_size: [usize; MAX_LEVELS],
}

impl Context {
    pub fn new(entry: TaskFn) -> Self {
        let mut callstack = [None; MAX_LEVELS];
        callstack[0] = Some(entry);
        Context {
            level: -1,
            call_level: -1,
            ip: [START; MAX_LEVELS],
            callstack,
            delayed_call: [false; MAX_LEVELS],
            stack_mem: None,
            stack_offset: 0,
            stack_ptr: [0; MAX_LEVELS],
            stack_size: [0; MAX_LEVELS],
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn call_level(&self) -> i32 {
        self.call_level
    }

    pub fn is_started(&self) -> bool {
        self.level >= 0
    }

    pub fn is_executing(&self) -> bool {
        self.call_level >= 0
    }

    /// Whether the call made from `level` is waiting on a suspended callee.
    pub fn is_delayed(&self, level: usize) -> bool {
        self.delayed_call[level]
    }

    /// Resume point of the innermost level.
    pub fn resume_point(&self) -> ResumePoint {
        self.ip[self.top()]
    }

    /// Resume point recorded at `level`.
    pub fn resume_point_at(&self, level: usize) -> ResumePoint {
        self.ip[level]
    }

    pub(crate) fn set_resume_point(&mut self, resume: ResumePoint) {
        let top = self.top();
        self.ip[top] = resume;
    }

    /// The function the frame driver invokes when the task is next resumed.
    pub fn active_fn(&self) -> TaskFn {
        let top = self.top();
        match self.callstack[top] {
            Some(func) => func,
            None => panic!("no function installed at level {}", top),
        }
    }

    /// Bytes used by all live levels.
    pub fn stack_used(&self) -> usize {
        self.stack_offset
    }

    /// Whether the task holds a stack block.
    pub fn has_stack(&self) -> bool {
        self.stack_mem.is_some()
    }

    fn top(&self) -> usize {
        self.level.max(0) as usize
    }

    /// Enter the context from the frame driver.
    pub(crate) fn begin(&mut self) {
        assert_eq!(self.call_level, -1, "context entered twice");
        if self.level < 0 {
            self.level = 0;
        }
        self.call_level = 0;
    }

    /// Leave the context after the frame driver's invocation suspended.
    pub(crate) fn end(&mut self) {
        assert_eq!(
            self.call_level, 0,
            "execution suspended with nested calls still on the native stack"
        );
        self.call_level = -1;
    }

    /// Push a level running `func`. Returns the caller's level.
    pub(crate) fn push(&mut self, func: TaskFn) -> usize {
        assert!(self.is_executing(), "call outside of an executing task");
        let caller = self.top();
        let callee = caller + 1;
        assert!(
            callee < MAX_LEVELS,
            "task call depth exceeds {} levels",
            MAX_LEVELS
        );
        self.level = callee as i32;
        self.ip[callee] = START;
        self.callstack[callee] = Some(func);
        self.delayed_call[callee] = false;
        self.stack_size[callee] = 0;
        self.call_level += 1;
        caller
    }

    /// Finish a native call made from `caller`: record where the caller
    /// continues and whether the callee is still suspended above it.
    pub(crate) fn finish_call(&mut self, caller: usize, resume: ResumePoint, delayed: bool) {
        assert!(self.call_level > 0, "unbalanced call bookkeeping");
        self.ip[caller] = resume;
        self.delayed_call[caller] = delayed;
        self.call_level -= 1;
    }

    /// Pop the innermost level, releasing its slice of the stack block.
    pub(crate) fn pop(&mut self, stacks: &mut StackPool) -> Unwind {
        assert!(self.level >= 0, "return from a task that is not running");
        let popped = self.level as usize;
        self.release(stacks, popped);
        if popped > 0 {
            self.callstack[popped] = None;
        }
        self.ip[popped] = START;
        self.level -= 1;

        if popped == 0 {
            return Unwind::Finished;
        }
        let caller = popped - 1;
        if self.call_level > 0 {
            assert!(
                !self.delayed_call[caller],
                "synchronous return into a delayed call at level {}",
                caller
            );
            Unwind::Sync
        } else {
            assert!(
                self.delayed_call[caller],
                "return at level {} with no caller to resume",
                popped
            );
            self.delayed_call[caller] = false;
            Unwind::Resume
        }
    }

    /// Carve `size` zeroed bytes out of the stack block for the innermost
    /// level, allocating the block on first use. Returns the byte range of
    /// the level's slice. If the level already owns a slice it is returned
    /// unchanged.
    pub(crate) fn allocate(&mut self, stacks: &mut StackPool, size: usize) -> Range<usize> {
        let level = self.top();
        self.allocate_at(stacks, level, size)
    }

    fn allocate_at(&mut self, stacks: &mut StackPool, level: usize, size: usize) -> Range<usize> {
        assert!(size > 0, "cannot allocate an empty locals slice");
        if self.stack_size[level] > 0 {
            assert!(
                size <= self.stack_size[level],
                "level {} already owns {} bytes, {} requested",
                level,
                self.stack_size[level],
                size
            );
            return self.slice_range(level);
        }

        let key = match self.stack_mem {
            Some(key) => key,
            None => {
                let key = stacks.alloc();
                self.stack_mem = Some(key);
                key
            }
        };
        let aligned = (size + STACK_ALIGN - 1) / STACK_ALIGN * STACK_ALIGN;
        let start = self.stack_offset;
        assert!(
            start + aligned <= stacks.block_size(),
            "stack block overflow: {} bytes in use, {} more requested, block holds {}",
            start,
            aligned,
            stacks.block_size()
        );
        stacks[key].zero(start..start + aligned);
        self.stack_ptr[level] = start;
        self.stack_size[level] = aligned;
        self.stack_offset = start + aligned;
        self.slice_range(level)
    }

    fn release(&mut self, stacks: &mut StackPool, level: usize) {
        let size = self.stack_size[level];
        if size == 0 {
            return;
        }
        assert_eq!(
            self.stack_ptr[level] + size,
            self.stack_offset,
            "stack slices released out of order"
        );
        if let Some(key) = self.stack_mem {
            stacks[key].zero(self.stack_ptr[level]..self.stack_offset);
        }
        self.stack_offset = self.stack_ptr[level];
        self.stack_size[level] = 0;
    }

    fn slice_range(&self, level: usize) -> Range<usize> {
        let start = self.stack_ptr[level];
        start..start + self.stack_size[level]
    }

    /// The locals slice of `level`; empty if the level owns none.
    pub fn level_bytes<'a>(&self, stacks: &'a StackPool, level: usize) -> &'a [u8] {
        match self.stack_mem {
            Some(key) if self.stack_size[level] > 0 => &stacks[key].bytes()[self.slice_range(level)],
            _ => &[],
        }
    }

    pub(crate) fn level_bytes_mut<'a>(
        &self,
        stacks: &'a mut StackPool,
        level: usize,
    ) -> &'a mut [u8] {
        match self.stack_mem {
            Some(key) if self.stack_size[level] > 0 => {
                &mut stacks[key].bytes_mut()[self.slice_range(level)]
            }
            _ => &mut [],
        }
    }

    /// Reset level 0 to `resume` with a fresh zeroed slice of `size` bytes
    /// (none if `size` is zero). Only valid while no nested level is live.
    pub(crate) fn restore_level0(
        &mut self,
        stacks: &mut StackPool,
        resume: ResumePoint,
        size: usize,
    ) {
        assert!(self.level <= 0, "restoring a task inside a nested call");
        assert!(!self.is_executing(), "restoring a running task");
        self.release(stacks, 0);
        self.level = 0;
        self.ip[0] = resume;
        if size > 0 {
            self.allocate_at(stacks, 0, size);
        }
    }

    /// Give the stack block back to the pool. Called once, when the task is
    /// destroyed.
    pub(crate) fn free_stack(&mut self, stacks: &mut StackPool) {
        if let Some(key) = self.stack_mem.take() {
            stacks.free(key);
        }
        self.stack_offset = 0;
        self.stack_size = [0; MAX_LEVELS];
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = (self.level + 1).max(0) as usize;
        f.debug_struct("Context")
            .field("level", &self.level)
            .field("call_level", &self.call_level)
            .field("ip", &&self.ip[..live])
            .field("delayed_call", &&self.delayed_call[..live])
            .field("stack_used", &self.stack_offset)
            .finish()
    }
}
