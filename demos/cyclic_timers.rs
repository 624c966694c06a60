//! Runs two cyclic timers at different periods and a one-shot shutdown timer,
//! demonstrating `addCyclic`/`addTimed` and `OnceInCurrent` catch-up
//! semantics. Run with `cargo run --example cyclic-timers`.

use std::time::Duration;

use anyhow::Result;
use revent::{EventLoop, TimerPolicy};

fn main() -> Result<()> {
    env_logger::init();

    let mut event_loop = EventLoop::new()?;
    event_loop.start()?;

    event_loop.add_cyclic(
        Duration::from_millis(250),
        None,
        TimerPolicy::CurrentTime,
        Box::new(|id| log::info!("tick {id:?}: quarter-second heartbeat")),
    )?;

    event_loop.add_cyclic(
        Duration::from_secs(1),
        None,
        TimerPolicy::OnceInCurrent,
        Box::new(|id| log::info!("tick {id:?}: one-second heartbeat")),
    )?;

    let now = event_loop.now_monotonic();
    event_loop.add_timed(
        now + Duration::from_secs(5),
        Box::new(|_| log::info!("shutdown timer fired, stopping")),
    );

    loop {
        event_loop.run(Some(Duration::from_millis(100)))?;
        if event_loop.now_monotonic() >= now + Duration::from_secs(5) {
            break;
        }
    }

    event_loop.stop()?;
    while event_loop.state() != revent::LoopState::Stopped {
        event_loop.run(Some(Duration::ZERO))?;
    }

    Ok(())
}
