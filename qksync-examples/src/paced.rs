use std::time::{Duration, Instant};

use qksync::{RealtimeLimiter, Scheduler, SimTime, SyncError};

fn main() -> Result<(), SyncError> {
    env_logger::init();

    let horizon = SimTime::from_ms(200);
    let mut sched = Scheduler::new();
    let tick = sched.create_event("tick");
    sched.spawn_method("tick", &[tick], true, move |s| {
        if s.now() < horizon {
            s.notify(tick, SimTime::from_ms(1));
        }
    });

    let limiter = RealtimeLimiter::new(&mut sched, Duration::from_millis(10))?;
    limiter.enable()?;
    let start = Instant::now();
    let outcome = sched.run_until(horizon)?;
    let elapsed = start.elapsed();
    limiter.disable()?;

    println!("Paced Results:");
    println!("Kernel outcome: {outcome:?} at {}", sched.now());
    println!("Wall time: {:.2?} for {} simulated", elapsed, horizon);
    Ok(())
}
