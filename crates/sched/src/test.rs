use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use expect_test::expect;
use pretty_assertions::assert_eq;
use test_env_log::test;

use crate::task::{Link, Links};
use crate::{
    Flow, Message, NextTick, RateLimiter, SchedConfig, Scheduler, TaskCx, TaskId, Tick, START,
};

const AGAIN: u32 = 1;
const AFTER: u32 = 2;

thread_local! {
    static LOG: RefCell<Vec<String>> = RefCell::new(vec![]);
    static LEVELS: RefCell<Vec<i32>> = RefCell::new(vec![]);
    static TARGET: Cell<Option<TaskId>> = Cell::new(None);
}

fn record(cx: &TaskCx<'_>) {
    record_str(cx.name());
}

fn record_str(s: &str) {
    LOG.with(|log| log.borrow_mut().push(s.to_owned()));
}

fn take_log() -> Vec<String> {
    LOG.with(|log| std::mem::take(&mut *log.borrow_mut()))
}

fn new_sched() -> (Scheduler, Rc<Cell<Tick>>) {
    let clock = Rc::new(Cell::new(0));
    let sched = Scheduler::new(SchedConfig::default(), clock.clone());
    (sched, clock)
}

fn every_frame(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    record(cx);
    cx.yield_for(0, AGAIN)
}

fn every_tick(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    record(cx);
    cx.yield_for(1, AGAIN)
}

fn every_third_tick(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    record_str(&format!("{}@{}", cx.name(), cx.tick()));
    cx.yield_for(3, AGAIN)
}

fn sleeper(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    record(cx);
    cx.sleep(AGAIN)
}

fn once(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    record(cx);
    ControlFlow::Continue(())
}

fn quitter(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    record(cx);
    cx.exit()
}

fn spawner(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    if cx.resume_point() == START {
        cx.create_sub_task("s1", every_tick, None);
        cx.create_sub_task("s2", every_tick, None);
    }
    record(cx);
    cx.yield_for(1, AGAIN)
}

fn walker(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    match cx.resume_point() {
        START => {
            record_str("walk");
            cx.yield_for(2, AGAIN)
        }
        AGAIN => {
            record_str("walked");
            ControlFlow::Continue(())
        }
        other => unreachable!("bad resume point {}", other),
    }
}

fn caller(cx: &mut TaskCx<'_>, msg: Message) -> Flow {
    loop {
        match cx.resume_point() {
            START => {
                record_str("call");
                cx.call(walker, msg, AFTER)?;
            }
            AFTER => {
                record_str("after");
                return ControlFlow::Continue(());
            }
            other => unreachable!("bad resume point {}", other),
        }
    }
}

fn note_level(cx: &TaskCx<'_>) {
    let level = cx.level();
    LEVELS.with(|levels| levels.borrow_mut().push(level));
}

fn quick(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    note_level(cx);
    ControlFlow::Continue(())
}

fn quick_caller(cx: &mut TaskCx<'_>, msg: Message) -> Flow {
    loop {
        match cx.resume_point() {
            START => {
                note_level(cx);
                cx.call(quick, msg, AFTER)?;
            }
            AFTER => {
                note_level(cx);
                return cx.yield_for(1, AGAIN);
            }
            AGAIN => return cx.yield_for(1, AGAIN),
            other => unreachable!("bad resume point {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Counter {
    n: u32,
}

fn counter(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    let n = {
        let locals = cx.locals::<Counter>();
        locals.n += 1;
        locals.n
    };
    record_str(&n.to_string());
    if n == 3 {
        return ControlFlow::Continue(());
    }
    cx.yield_for(1, AGAIN)
}

fn boss(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    if cx.resume_point() == START {
        let worker = TARGET.with(|t| t.get()).expect("worker registered");
        cx.run_and_return(worker, Message::Local(1));
        let next = cx.scheduler().next_tick(worker);
        record_str(&format!("boss sees worker at {:?}", next));
        let me = cx.task();
        record_str(&format!("boss running: {}", cx.scheduler().running() == Some(me)));
    }
    record(cx);
    cx.yield_for(1, AGAIN)
}

/// Hands its turn to a target that never yields, then relies on being the
/// running task again.
fn patron(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    if cx.resume_point() == START {
        let target = TARGET.with(|t| t.get()).expect("target registered");
        cx.run_and_return(target, Message::Run);
        let me = cx.task();
        let late = cx.scheduler().create_sub_task("late", every_tick, None);
        let parent = cx.scheduler().parent(late);
        record_str(&format!("late sub-task of patron: {}", parent == Some(me)));
    }
    record(cx);
    cx.yield_for(1, AGAIN)
}

fn worker(cx: &mut TaskCx<'_>, msg: Message) -> Flow {
    match cx.resume_point() {
        START => {
            record_str(&format!("worker {:?}", msg));
            cx.yield_for(5, AGAIN)
        }
        _ => {
            record_str(&format!("worker resumed {:?}", msg));
            ControlFlow::Continue(())
        }
    }
}

fn handler(sched: &mut Scheduler, task: TaskId, msg: Message) {
    let name = sched.task_name(task).unwrap_or("?").to_owned();
    record_str(&format!("{} got {:?}", name, msg));
}

/// Walk the ring both ways and check every link agrees with its neighbour.
fn assert_ring_consistent(sched: &Scheduler) {
    let forward = sched.ring();
    let mut backward = vec![];
    let mut link = sched.root.prev;
    while let Link::Task(id) = link {
        backward.push(id);
        link = match sched.tasks[id].links {
            Links::Main { prev, .. } => prev,
            Links::Sub { .. } => panic!("sub-task in the ring"),
        };
    }
    backward.reverse();
    assert_eq!(forward, backward, "ring links disagree");

    for main in forward {
        let mut newer = None;
        let mut cursor = sched.tasks[main].subtask_next();
        while let Some(child) = cursor {
            assert_eq!(sched.tasks[child].subtask_prev(), newer, "sub-task links disagree");
            assert_eq!(sched.tasks[child].subtask_parent(), Some(main));
            newer = Some(child);
            cursor = sched.tasks[child].subtask_next();
        }
    }

    let order = sched.traversal_order();
    assert_eq!(order.len(), sched.len(), "every live task is reachable");
    for id in order {
        if let Some(parent) = sched.parent(id) {
            assert!(sched.subtasks(parent).contains(&id));
        }
    }
}

#[test]
fn test_create_inserts_after_cursor() {
    let (mut sched, _clock) = new_sched();
    let a = sched.create_task("a", every_frame, false, None);
    sched.create_task("b", every_frame, false, None);
    sched.create_task("c", every_frame, false, None);

    assert_eq!(sched.current(), Some(a));
    expect![["a c b"]].assert_eq(&sched.describe_order());
    assert_ring_consistent(&sched);
}

#[test]
fn test_new_task_is_ready_at_creation_tick() {
    let (mut sched, clock) = new_sched();
    clock.set(42);
    let t = sched.create_task("t", every_frame, false, None);
    assert_eq!(sched.next_tick(t), Some(NextTick::At(42)));
    assert_eq!(sched.level(t), -1);
}

#[test]
fn test_sub_tasks_run_before_parent() {
    let (mut sched, clock) = new_sched();
    let parent = sched.create_task("parent", spawner, false, None);

    sched.run();
    assert_eq!(take_log(), vec!["parent", "s1", "s2"]);
    expect![["s1 s2 parent"]].assert_eq(&sched.describe_order());
    assert_eq!(sched.subtasks(parent).len(), 2);
    assert_ring_consistent(&sched);

    clock.set(1);
    sched.run();
    assert_eq!(take_log(), vec!["s1", "s2", "parent"]);
}

#[test]
fn test_sub_task_of_sub_task_joins_owner_chain() {
    let (mut sched, _clock) = new_sched();
    let main = sched.create_task("main", every_tick, false, None);
    let child = sched.create_sub_task_of(main, "child", every_tick, None);
    let grandchild = sched.create_sub_task_of(child, "grandchild", every_tick, None);

    assert_eq!(sched.parent(grandchild), Some(main));
    assert_eq!(sched.subtasks(main), vec![child, grandchild]);
    assert!(sched.subtasks(child).is_empty());
}

#[test]
fn test_frame_break_ends_frame() {
    let (mut sched, _clock) = new_sched();
    sched.create_task("a", every_frame, false, None);
    sched.create_task("b", every_frame, false, None);
    sched.create_task("fb", every_frame, true, None);
    expect![["a fb b"]].assert_eq(&sched.describe_order());

    sched.run();
    assert_eq!(take_log(), vec!["a", "fb"]);
    sched.run();
    assert_eq!(take_log(), vec!["b", "a", "fb"]);
}

#[test]
fn test_sleeping_frame_break_still_ends_frame() {
    let (mut sched, _clock) = new_sched();
    sched.create_task("a", every_frame, false, None);
    sched.create_task("b", every_frame, false, None);
    let fb = sched.create_task("fb", sleeper, true, None);

    sched.run();
    assert_eq!(take_log(), vec!["a", "fb"]);
    assert_eq!(sched.next_tick(fb), Some(NextTick::Asleep));
    sched.run();
    assert_eq!(take_log(), vec!["b", "a"]);
    sched.run();
    assert_eq!(take_log(), vec!["b", "a"]);

    sched.wake(fb);
    sched.run();
    assert_eq!(take_log(), vec!["b", "a", "fb"]);
}

#[test]
fn test_frame_without_frame_break_visits_each_task_once() {
    let (mut sched, _clock) = new_sched();
    sched.create_task("a", every_frame, false, None);
    sched.create_task("b", every_frame, false, None);

    sched.run();
    assert_eq!(take_log(), vec!["a", "b"]);
    sched.run();
    assert_eq!(take_log(), vec!["a", "b"]);
}

#[test]
fn test_yield_delay_is_honoured() {
    let (mut sched, clock) = new_sched();
    sched.create_task("t", every_third_tick, false, None);
    for tick in 0..=6 {
        clock.set(tick);
        sched.run();
    }
    assert_eq!(take_log(), vec!["t@0", "t@3", "t@6"]);
}

#[test]
fn test_delayed_call_resumes_caller() {
    let (mut sched, clock) = new_sched();
    let task = sched.create_task("caller", caller, false, None);

    sched.run();
    assert_eq!(take_log(), vec!["call", "walk"]);
    assert_eq!(sched.level(task), 1);
    assert!(sched.context(task).is_delayed(0));
    assert_eq!(sched.context(task).resume_point_at(0), AFTER);

    clock.set(1);
    sched.run();
    assert!(take_log().is_empty(), "the callee is still waiting");

    clock.set(2);
    sched.run();
    assert_eq!(take_log(), vec!["walked", "after"]);
    assert!(!sched.is_live(task), "the caller ran off its end");
    assert!(sched.is_empty());
}

#[test]
fn test_synchronous_call_keeps_levels_balanced() {
    let (mut sched, _clock) = new_sched();
    let task = sched.create_task("sync", quick_caller, false, None);
    sched.run();

    let levels = LEVELS.with(|levels| std::mem::take(&mut *levels.borrow_mut()));
    assert_eq!(levels, vec![0, 1, 0]);
    assert_eq!(sched.level(task), 0);
    assert!(!sched.context(task).is_delayed(0));
    assert_eq!(sched.resume_point(task), AGAIN);
}

#[test]
fn test_locals_survive_yields() {
    let (mut sched, clock) = new_sched();
    let task = sched.create_task("counter", counter, false, None);
    for tick in 0..4 {
        clock.set(tick);
        sched.run();
    }
    assert_eq!(take_log(), vec!["1", "2", "3"]);
    assert!(!sched.is_live(task));
    assert!(sched.stacks.is_empty(), "the stack block went back to the pool");
}

#[test]
fn test_self_free_moves_cursor() {
    let (mut sched, _clock) = new_sched();
    let quit = sched.create_task("quit", quitter, false, None);
    let b = sched.create_task("b", every_frame, false, None);

    sched.run();
    assert_eq!(take_log(), vec!["quit", "b"]);
    assert!(!sched.is_live(quit));
    assert_eq!(sched.current(), Some(b));
    assert_ring_consistent(&sched);
}

#[test]
fn test_completed_task_is_freed() {
    let (mut sched, _clock) = new_sched();
    let t = sched.create_task("once", once, false, None);
    sched.run();
    assert_eq!(take_log(), vec!["once"]);
    assert!(!sched.is_live(t));
    assert_eq!(sched.current(), None);
}

#[test]
fn test_free_sub_task_fixes_chain() {
    let (mut sched, _clock) = new_sched();
    let main = sched.create_task("main", every_tick, false, None);
    let s1 = sched.create_sub_task_of(main, "s1", every_tick, None);
    let s2 = sched.create_sub_task_of(main, "s2", every_tick, None);
    let s3 = sched.create_sub_task_of(main, "s3", every_tick, None);
    assert_eq!(sched.subtasks(main), vec![s1, s2, s3]);
    assert_ring_consistent(&sched);

    // head of the chain
    sched.free_task(s3);
    assert_eq!(sched.subtasks(main), vec![s1, s2]);
    assert_ring_consistent(&sched);
    // tail of the chain
    sched.free_task(s1);
    assert_eq!(sched.subtasks(main), vec![s2]);
    assert_ring_consistent(&sched);
    sched.free_task(s2);
    assert!(sched.subtasks(main).is_empty());
    sched.free_task(main);
    assert!(sched.is_empty());
    assert_eq!(sched.current(), None);
}

#[test]
#[should_panic(expected = "still attached")]
fn test_free_parent_with_children_panics() {
    let (mut sched, _clock) = new_sched();
    let main = sched.create_task("main", every_tick, false, None);
    sched.create_sub_task_of(main, "child", every_tick, None);
    sched.free_task(main);
}

#[test]
#[should_panic(expected = "outside of a running task")]
fn test_sub_task_needs_running_task() {
    let (mut sched, _clock) = new_sched();
    sched.create_sub_task("orphan", every_tick, None);
}

#[test]
fn test_run_and_return_hands_control_back() {
    let (mut sched, _clock) = new_sched();
    sched.create_task("boss", boss, false, None);
    let worker = sched.create_task("worker", worker, false, None);
    TARGET.with(|t| t.set(Some(worker)));

    sched.run();
    assert_eq!(
        take_log(),
        vec![
            "worker Local(1)",
            "boss sees worker at Some(At(0))",
            "boss running: true",
            "boss",
            "worker resumed Run",
        ]
    );
    assert!(!sched.is_live(worker));
}

#[test]
fn test_run_and_return_restores_caller_when_target_finishes() {
    let (mut sched, _clock) = new_sched();
    let patron = sched.create_task("patron", patron, false, None);
    let target = sched.create_task("once", once, false, None);
    TARGET.with(|t| t.set(Some(target)));

    sched.run();
    assert_eq!(
        take_log(),
        vec!["once", "late sub-task of patron: true", "patron", "late"]
    );
    assert!(!sched.is_live(target));
    assert_eq!(sched.running(), None);
    assert_eq!(sched.subtasks(patron).len(), 1);
}

#[test]
fn test_nothing_ready_falls_back_to_first_allocated_task() {
    let (mut sched, _clock) = new_sched();
    let a = sched.create_task("a", sleeper, false, None);
    let b = sched.create_task("b", sleeper, false, None);
    sched.create_task("c", sleeper, false, None);
    sched.free_task(a);
    expect![["c b"]].assert_eq(&sched.describe_order());

    sched.run();
    assert_eq!(take_log(), vec!["c", "b"]);
    assert_eq!(sched.current(), Some(b), "b is the oldest live task");
}

#[test]
fn test_fallback_enters_sub_tasks_before_parent() {
    let (mut sched, _clock) = new_sched();
    let main = sched.create_task("main", sleeper, false, None);
    let s1 = sched.create_sub_task_of(main, "s1", sleeper, None);
    sched.create_sub_task_of(main, "s2", sleeper, None);

    sched.run();
    assert_eq!(take_log(), vec!["main", "s1", "s2"]);
    assert_eq!(sched.current(), Some(s1));
}

#[test]
fn test_pause_runs_only_exempt_task() {
    let (mut sched, clock) = new_sched();
    sched.create_task("game", every_tick, false, None);
    let menu = sched.create_task("menu", every_tick, false, None);

    sched.pause(true, Some(menu));
    sched.run();
    assert_eq!(take_log(), vec!["menu"]);
    clock.set(1);
    sched.run();
    assert_eq!(take_log(), vec!["menu"]);

    sched.pause(false, None);
    clock.set(2);
    sched.run();
    assert_eq!(take_log(), vec!["game", "menu"]);
}

#[test]
fn test_local_handler_side_channel_and_teardown() {
    let (mut sched, _clock) = new_sched();
    let a = sched.create_task("a", every_tick, false, Some(handler));
    let b = sched.create_task("b", every_tick, false, Some(handler));
    let plain = sched.create_task("plain", every_tick, false, None);

    sched.run_local_handler(a, Message::Local(7));
    sched.run_local_handler(plain, Message::Local(7));
    assert_eq!(take_log(), vec!["a got Local(7)"]);

    sched.free_task(a);
    assert_eq!(take_log(), vec!["a got Free"]);

    sched.free_all();
    assert_eq!(take_log(), vec!["b got Free"]);
    assert!(!sched.is_live(b));
    assert!(sched.is_empty());
}

#[test]
fn test_reset_clears_without_teardown() {
    let (mut sched, _clock) = new_sched();
    sched.create_task("a", counter, false, Some(handler));
    sched.run();
    take_log();

    sched.reset();
    assert!(take_log().is_empty());
    assert!(sched.is_empty());
    assert!(sched.stacks.is_empty());
    assert_eq!(sched.current(), None);
    assert_eq!(sched.describe_order(), "");

    // usable again afterwards
    sched.create_task("b", every_frame, false, None);
    sched.run();
    assert_eq!(take_log(), vec!["b"]);
}

#[test]
#[should_panic(expected = "after scheduler shutdown")]
fn test_shutdown_refuses_new_tasks() {
    let (mut sched, _clock) = new_sched();
    sched.create_task("a", every_tick, false, None);
    sched.shutdown();
    assert!(sched.is_shut_down());
    sched.create_task("late", every_tick, false, None);
}

#[test]
fn test_user_data_is_opaque() {
    let (mut sched, _clock) = new_sched();
    let t = sched.create_task("t", every_tick, false, None);
    assert_eq!(sched.user_data(t), None);
    sched.set_user_data(t, Some(crate::UserData(0xdead)));
    assert_eq!(sched.user_data(t), Some(crate::UserData(0xdead)));
}

#[test]
fn test_rate_limiter_skips_fast_frames() {
    let start = Instant::now();
    let mut limiter = RateLimiter::new(Some(Duration::from_millis(10)));
    assert!(limiter.admit(start));
    assert!(!limiter.admit(start + Duration::from_millis(5)));
    assert!(limiter.admit(start + Duration::from_millis(10)));

    let config = SchedConfig::default().with_min_frame_interval(Some(Duration::from_millis(10)));
    let mut sched = Scheduler::new(config, Rc::new(Cell::new(0)));
    sched.create_task("t", every_frame, false, None);
    assert!(sched.run_at(start));
    assert!(!sched.run_at(start + Duration::from_millis(1)));
    assert_eq!(take_log(), vec!["t"]);
}

#[test]
fn test_ring_stays_consistent_under_churn() {
    let (mut sched, _clock) = new_sched();
    let mut live = vec![];
    let mut seed = 0x2545_f491_u32;
    for step in 0..200 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        match seed % 3 {
            0 | 1 => live.push(sched.create_task(format!("t{}", step), every_tick, false, None)),
            _ if !live.is_empty() => {
                let victim = live.swap_remove(seed as usize % live.len());
                sched.free_task(victim);
            }
            _ => {}
        }
        assert_ring_consistent(&sched);
        assert_eq!(sched.len(), live.len());
    }
}
