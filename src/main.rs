use std::cell::Cell;
use std::ops::ControlFlow;
use std::rc::Rc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use clap::Parser as ClapParser;
use cotask_sched::{Flow, Message, SchedConfig, Scheduler, TaskCx, TaskId, Tick, START};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const AGAIN: u32 = 1;
const TURN: u32 = 2;
const FLIP: u32 = 3;
const RIDE: u32 = 4;

/// Number of frames a pause lasts.
const PAUSE_FRAMES: u64 = 5;

thread_local! {
    static ELEVATOR: Cell<Option<TaskId>> = Cell::new(None);
}

fn main() {
    let opt = Opt::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let interval = opt.frame_interval_ms.map(Duration::from_millis);
    let config = SchedConfig::default().with_min_frame_interval(interval);
    let clock = Rc::new(Cell::new(0 as Tick));
    let mut sched = Scheduler::new(config, clock.clone());

    let elevator = sched.create_task("elevator", elevator, false, Some(announce_free));
    ELEVATOR.with(|e| e.set(Some(elevator)));
    sched.create_task("switch", switch, false, None);
    sched.create_task("patrol", patrol, false, Some(announce_free));
    let menu = sched.create_task("pause-menu", pause_menu, false, None);
    sched.create_task("render", render, true, None);
    info!(order = %sched.describe_order(), "tasks created");

    let mut skipped = 0u64;
    for frame in 0..opt.frames {
        match opt.pause_at {
            Some(at) if at == frame => sched.pause(true, Some(menu)),
            Some(at) if at + PAUSE_FRAMES == frame => sched.pause(false, None),
            _ => {}
        }
        if let Some(interval) = interval {
            std::thread::sleep(interval);
        }

        clock.set(clock.get() + opt.ticks_per_frame);
        if !sched.run() {
            skipped += 1;
        }
    }

    if skipped > 0 {
        warn!(skipped, "frames skipped by the rate limiter");
    }
    info!(
        tick = sched.tick(),
        live = sched.len(),
        order = %sched.describe_order(),
        "demo finished"
    );
    sched.shutdown();
}

#[derive(clap::Parser)]
#[clap(about, version, author)]
struct Opt {
    /// Number of frames to run.
    #[clap(long, default_value = "60")]
    frames: u64,

    /// Ticks the clock advances per frame.
    #[clap(long, default_value = "1")]
    ticks_per_frame: Tick,

    /// Minimum wall-clock time between frames, in milliseconds.
    #[clap(long)]
    frame_interval_ms: Option<u64>,

    /// Pause everything but the pause menu at this frame, for a few frames.
    #[clap(long)]
    pause_at: Option<u64>,
}

fn announce_free(sched: &mut Scheduler, task: TaskId, msg: Message) {
    if msg == Message::Free {
        info!(task = sched.task_name(task).unwrap_or("?"), "task leaves the world");
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Patrol {
    legs: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Walk {
    steps: u32,
}

/// Walks four legs of a square, each leg a nested call, then retires.
fn patrol(cx: &mut TaskCx<'_>, msg: Message) -> Flow {
    loop {
        match cx.resume_point() {
            START => cx.call(walk_leg, msg, TURN)?,
            TURN => {
                let legs = {
                    let patrol = cx.locals::<Patrol>();
                    patrol.legs += 1;
                    patrol.legs
                };
                info!(legs, tick = cx.tick(), "patrol turns a corner");
                if legs == 4 {
                    return ControlFlow::Continue(());
                }
                cx.call(walk_leg, msg, TURN)?;
            }
            other => unreachable!("patrol at resume point {}", other),
        }
    }
}

fn walk_leg(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    let steps = {
        let walk = cx.locals::<Walk>();
        walk.steps += 1;
        walk.steps
    };
    debug!(steps, level = cx.level(), "step");
    if steps == 3 {
        return ControlFlow::Continue(());
    }
    cx.yield_for(1, AGAIN)
}

/// Flipped after a while; wakes the elevator and throws a spark.
fn switch(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    match cx.resume_point() {
        START => cx.yield_for(10, FLIP),
        FLIP => {
            info!(tick = cx.tick(), "switch flipped");
            if let Some(elevator) = ELEVATOR.with(|e| e.get()) {
                if cx.scheduler().is_live(elevator) {
                    cx.scheduler().wake(elevator);
                }
            }
            cx.create_sub_task("spark", spark, None);
            cx.sleep(AGAIN)
        }
        _ => cx.sleep(AGAIN),
    }
}

fn spark(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    let task = cx.task();
    let sched = cx.scheduler();
    let parent = sched.parent(task).and_then(|p| sched.task_name(p));
    info!(parent = ?parent, "spark fizzles");
    cx.exit()
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Elevator {
    floor: u32,
}

fn elevator(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    match cx.resume_point() {
        START => {
            debug!("elevator waits for the switch");
            cx.sleep(RIDE)
        }
        RIDE => {
            let floor = {
                let elevator = cx.locals::<Elevator>();
                elevator.floor += 1;
                elevator.floor
            };
            info!(floor, tick = cx.tick(), "elevator arrives");
            if floor == 3 {
                return ControlFlow::Continue(());
            }
            cx.yield_for(2, RIDE)
        }
        other => unreachable!("elevator at resume point {}", other),
    }
}

fn pause_menu(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    if cx.scheduler().is_paused() {
        info!(tick = cx.tick(), "pause menu is up");
    }
    cx.yield_for(1, AGAIN)
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Render {
    frames: u32,
}

/// Ends every frame.
fn render(cx: &mut TaskCx<'_>, _msg: Message) -> Flow {
    let frames = {
        let render = cx.locals::<Render>();
        render.frames += 1;
        render.frames
    };
    debug!(frames, "frame rendered");
    cx.yield_for(0, AGAIN)
}
