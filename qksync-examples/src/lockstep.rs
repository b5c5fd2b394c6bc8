use std::{cell::Cell, rc::Rc, sync::Arc, time::Instant};

use log::{info, warn};
use qksync::{create_keeper, QuantumKeeper, Scheduler, SimConfig, SimTime, SyncError};

const INSTRUCTION: SimTime = SimTime::from_ns(10);
const WORK: SimTime = SimTime::from_ms(10);
const BUS_PERIOD: SimTime = SimTime::from_us(250);

// emulated core: burn through whatever budget the keeper hands out, then sync
fn cpu_loop(keeper: &QuantumKeeper) -> Result<u64, SyncError> {
    let mut executed = 0;
    while keeper.current_time() < WORK {
        let budget = keeper
            .time_to_sync()
            .min(WORK - keeper.current_time());
        let mut ran = SimTime::ZERO;
        while ran < budget {
            ran += INSTRUCTION;
            executed += 1;
        }
        keeper.inc(ran)?;
        keeper.sync()?;
    }
    Ok(executed)
}

fn main() -> Result<(), SyncError> {
    env_logger::init();

    let config = SimConfig::new().with_quantum(SimTime::from_us(100));
    let mut sched = Scheduler::with_config(config)?;

    let bus = sched.create_event("bus");
    let bus_cycles = Rc::new(Cell::new(0u64));
    let counter = Rc::clone(&bus_cycles);
    sched.spawn_method("bus", &[bus], true, move |s| {
        counter.set(counter.get() + 1);
        if s.now() < WORK {
            s.notify(bus, BUS_PERIOD);
        }
    });

    let mut keepers = Vec::new();
    for policy in ["bounded-quantum", "rolling"] {
        let keeper = create_keeper(&mut sched, policy)?;
        let worker = Arc::clone(&keeper);
        let dispatcher = sched.dispatcher();
        keeper.start_with(move || match cpu_loop(&worker) {
            Ok(executed) => {
                let name = worker.name().to_string();
                let at = worker.current_time();
                let _ = dispatcher.run_on_kernel(move || {
                    info!("{name}: {executed} instructions, done at {at}");
                });
            }
            Err(err) => warn!("{}: {err}", worker.name()),
        })?;
        keepers.push(keeper);
    }

    let start = Instant::now();
    let outcome = sched.run()?;
    let elapsed = start.elapsed();
    for keeper in &keepers {
        keeper.join()?;
    }

    println!("Lockstep Results:");
    println!("Kernel outcome: {outcome:?} at {}", sched.now());
    println!("Bus cycles: {}", bus_cycles.get());
    println!("Wall time: {:.2?}", elapsed);
    println!(
        "Simulated seconds per wall second: {:.3}",
        sched.now().to_seconds() / elapsed.as_secs_f64()
    );
    Ok(())
}
