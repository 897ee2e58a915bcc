//! Saving and restoring task state.
//!
//! A task is stored as its level-0 resume point, its level-0 locals and its
//! next tick:
//!
//! ```text
//! u32 resume point | u32 size | size bytes | u8 kind (0 = at, 1 = asleep) | u64 tick
//! ```
//!
//! All integers are little endian. The task being restored must already exist;
//! only its state is overwritten.

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::error::SaveError;
use crate::task::NextTick;
use crate::{Scheduler, TaskId};

const NEXT_TICK_AT: u8 = 0;
const NEXT_TICK_ASLEEP: u8 = 1;

fn need(input: &impl Buf, needed: usize) -> Result<(), SaveError> {
    if input.remaining() < needed {
        return Err(SaveError::Truncated {
            needed,
            remaining: input.remaining(),
        });
    }
    Ok(())
}

impl Scheduler {
    /// Write the persistent state of `task` to `out`.
    ///
    /// Fails if the task is dead or suspended inside a nested call, whose
    /// levels cannot be stored.
    pub fn save_task(&self, task: TaskId, out: &mut impl BufMut) -> Result<(), SaveError> {
        let record = self.tasks.get(task).ok_or(SaveError::DeadTask)?;
        let context = &record.context;
        if context.level() > 0 {
            return Err(SaveError::NestedFrames {
                level: context.level(),
            });
        }

        let locals = context.level_bytes(&self.stacks, 0);
        out.put_u32_le(context.resume_point_at(0));
        out.put_u32_le(locals.len() as u32);
        out.put_slice(locals);
        match record.next_tick {
            NextTick::At(tick) => {
                out.put_u8(NEXT_TICK_AT);
                out.put_u64_le(tick);
            }
            NextTick::Asleep => {
                out.put_u8(NEXT_TICK_ASLEEP);
                out.put_u64_le(0);
            }
        }
        debug!(task = %record.name, locals = locals.len(), "saved task");
        Ok(())
    }

    /// Restore state written by [`Scheduler::save_task`] into `task`, copying
    /// the locals verbatim.
    pub fn load_task(&mut self, task: TaskId, input: &mut impl Buf) -> Result<(), SaveError> {
        self.load_task_with(task, input, |stored, live| live.copy_from_slice(stored))
    }

    /// Restore state written by [`Scheduler::save_task`] into `task`, letting
    /// `translate` fill the live locals from the stored bytes. Use it for
    /// locals holding handles that do not survive a reload as-is.
    ///
    /// Nothing is modified unless the whole record parses.
    pub fn load_task_with(
        &mut self,
        task: TaskId,
        input: &mut impl Buf,
        mut translate: impl FnMut(&[u8], &mut [u8]),
    ) -> Result<(), SaveError> {
        if !self.tasks.contains(task) {
            return Err(SaveError::DeadTask);
        }
        let level = self.tasks[task].context.level();
        if level > 0 {
            return Err(SaveError::NestedFrames { level });
        }

        need(input, 8)?;
        let resume = input.get_u32_le();
        let size = input.get_u32_le() as usize;
        let max = self.stacks.block_size();
        if size > max {
            return Err(SaveError::SliceTooLarge { size, max });
        }
        need(input, size)?;
        let stored = input.copy_to_bytes(size);
        need(input, 9)?;
        let next_tick = match input.get_u8() {
            NEXT_TICK_AT => NextTick::At(input.get_u64_le()),
            NEXT_TICK_ASLEEP => {
                input.advance(8);
                NextTick::Asleep
            }
            kind => return Err(SaveError::BadNextTickKind(kind)),
        };

        let record = &mut self.tasks[task];
        record
            .context
            .restore_level0(&mut self.stacks, resume, size);
        if size > 0 {
            let live = record.context.level_bytes_mut(&mut self.stacks, 0);
            translate(&stored, &mut live[..size]);
        }
        record.next_tick = next_tick;
        debug!(task = %record.name, locals = size, ?next_tick, "restored task");
        Ok(())
    }
}
