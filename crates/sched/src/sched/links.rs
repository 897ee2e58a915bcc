use crate::task::{Link, Links};
use crate::TaskId;

use super::Scheduler;

/// The sentinel of the main ring. An empty ring points at itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RootLinks {
    pub(crate) prev: Link,
    pub(crate) next: Link,
}

impl RootLinks {
    pub(crate) fn empty() -> Self {
        RootLinks {
            prev: Link::Root,
            next: Link::Root,
        }
    }
}

impl Scheduler {
    fn ring_next(&self, link: Link) -> Link {
        match link {
            Link::Root => self.root.next,
            Link::Task(id) => match self.tasks[id].links {
                Links::Main { next, .. } => next,
                Links::Sub { .. } => panic!("sub-task {:?} is not in the main ring", id),
            },
        }
    }

    fn set_ring_next(&mut self, link: Link, to: Link) {
        match link {
            Link::Root => self.root.next = to,
            Link::Task(id) => match &mut self.tasks[id].links {
                Links::Main { next, .. } => *next = to,
                Links::Sub { .. } => panic!("sub-task {:?} is not in the main ring", id),
            },
        }
    }

    fn set_ring_prev(&mut self, link: Link, to: Link) {
        match link {
            Link::Root => self.root.prev = to,
            Link::Task(id) => match &mut self.tasks[id].links {
                Links::Main { prev, .. } => *prev = to,
                Links::Sub { .. } => panic!("sub-task {:?} is not in the main ring", id),
            },
        }
    }

    pub(crate) fn ring_insert_after(&mut self, anchor: Link, id: TaskId) {
        let after = self.ring_next(anchor);
        match &mut self.tasks[id].links {
            Links::Main { prev, next, .. } => {
                *prev = anchor;
                *next = after;
            }
            Links::Sub { .. } => panic!("inserting a sub-task into the main ring"),
        }
        self.set_ring_next(anchor, Link::Task(id));
        self.set_ring_prev(after, Link::Task(id));
    }

    pub(crate) fn subtask_prepend(&mut self, parent: TaskId, id: TaskId) {
        let head = self.tasks[parent].subtask_next();
        self.tasks[id].set_subtask_next(head);
        self.tasks[id].set_subtask_prev(None);
        if let Some(head) = head {
            self.tasks[head].set_subtask_prev(Some(id));
        }
        self.tasks[parent].set_subtask_next(Some(id));
    }

    /// Splice `id` out of whichever structure holds it.
    pub(crate) fn unlink(&mut self, id: TaskId) {
        match self.tasks[id].links {
            Links::Main { prev, next, .. } => {
                self.set_ring_next(prev, next);
                self.set_ring_prev(next, prev);
            }
            Links::Sub {
                subtask_parent,
                subtask_prev,
                subtask_next,
            } => {
                match subtask_prev {
                    Some(newer) => self.tasks[newer].set_subtask_next(subtask_next),
                    None => self.tasks[subtask_parent].set_subtask_next(subtask_next),
                }
                if let Some(older) = subtask_next {
                    self.tasks[older].set_subtask_prev(subtask_prev);
                }
            }
        }
    }

    /// Main tasks in ring order, starting after the sentinel.
    pub(crate) fn ring(&self) -> Vec<TaskId> {
        let mut out = vec![];
        let mut link = self.root.next;
        while let Link::Task(id) = link {
            out.push(id);
            link = self.ring_next(link);
        }
        out
    }

    /// The first task a pass over `main` visits: the last (oldest) sub-task
    /// of its chain, or the task itself.
    pub(crate) fn enter_main(&self, main: TaskId) -> TaskId {
        let mut last = main;
        while let Some(older) = self.tasks[last].subtask_next() {
            last = older;
        }
        last
    }

    /// The task visited after `id` in traversal order. Sub-tasks run from the
    /// tail of the chain back to its head and then hand over to their parent,
    /// main tasks follow the ring, and the sentinel is skipped.
    pub(crate) fn successor(&self, id: TaskId) -> TaskId {
        let task = &self.tasks[id];
        match task.links {
            Links::Sub {
                subtask_parent,
                subtask_prev,
                ..
            } => subtask_prev.unwrap_or(subtask_parent),
            Links::Main { next, .. } => {
                let next = match next {
                    Link::Task(next) => next,
                    Link::Root => match self.root.next {
                        Link::Task(first) => first,
                        Link::Root => unreachable!("main task {:?} outside an empty ring", id),
                    },
                };
                self.enter_main(next)
            }
        }
    }

    /// First task in traversal order, if any.
    pub(crate) fn first_task(&self) -> Option<TaskId> {
        match self.root.next {
            Link::Task(first) => Some(self.enter_main(first)),
            Link::Root => None,
        }
    }

    /// Where the cursor lands when nothing is ready: the first allocated
    /// live task, i.e. the one in the lowest arena slot. A sub-task stands
    /// for its main task, which is entered like any other so its sub-tasks
    /// still run first.
    pub(crate) fn fallback_task(&self) -> Option<TaskId> {
        let first = self.tasks.keys().next()?;
        Some(self.enter_main(self.main_of(first)))
    }

    /// Every task in the order one full scheduling pass visits them,
    /// starting from the head of the ring.
    pub fn traversal_order(&self) -> Vec<TaskId> {
        let mut out = Vec::with_capacity(self.tasks.len());
        for main in self.ring() {
            out.extend(self.subtasks(main));
            out.push(main);
        }
        out
    }

    /// Names of [`Scheduler::traversal_order`], separated by spaces.
    pub fn describe_order(&self) -> String {
        use itertools::Itertools;
        self.traversal_order()
            .into_iter()
            .map(|id| self.tasks[id].name.clone())
            .join(" ")
    }
}
