use std::{cell::Cell, rc::Rc, thread};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qksync::{
    create_keeper,
    keeper::policy::{rolling_budget, AdaptiveQuantum, BoundedQuantum, Horizon, SyncPolicy},
    CrossThreadEvent, Scheduler, SimTime,
};

fn bench_policy_budgets(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_budget");
    group.throughput(Throughput::Elements(1024));

    let horizons: Vec<Horizon> = (0..1024u64)
        .map(|i| Horizon {
            kernel_time: SimTime::from_us(i),
            local_time: SimTime::from_us(i * 3),
            quantum: SimTime::from_ms(1),
            running: true,
        })
        .collect();

    group.bench_function("bounded", |b| {
        b.iter(|| {
            for h in &horizons {
                black_box(BoundedQuantum.time_to_sync(black_box(h)));
            }
        })
    });
    group.bench_function("adaptive", |b| {
        b.iter(|| {
            for h in &horizons {
                black_box(AdaptiveQuantum.time_to_sync(black_box(h)));
            }
        })
    });
    group.bench_function("rolling_kernel_side", |b| {
        b.iter(|| {
            for h in &horizons {
                black_box(rolling_budget(h, false, Some(SimTime::from_us(250))));
            }
        })
    });

    group.finish();
}

fn bench_cross_thread_notify(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_thread_notify");

    // notifications coalesce, so each burst costs one process run
    for burst in [1u64, 16, 256].iter() {
        group.throughput(Throughput::Elements(*burst));
        group.bench_with_input(BenchmarkId::new("burst", burst), burst, |b, &burst| {
            let mut sched = Scheduler::new();
            let ev = CrossThreadEvent::new(&mut sched, "bench", false);
            let runs = Rc::new(Cell::new(0u64));
            let counter = Rc::clone(&runs);
            sched.spawn_method("bench", &[ev.event()], false, move |_| {
                counter.set(counter.get() + 1);
            });
            b.iter(|| {
                let remote = ev.clone();
                thread::spawn(move || {
                    for _ in 0..burst {
                        remote.notify();
                    }
                })
                .join()
                .unwrap();
                sched.run().unwrap();
            });
            black_box(runs.get());
        });
    }

    group.finish();
}

fn bench_keeper_inc(c: &mut Criterion) {
    let mut sched = Scheduler::new();
    let keeper = create_keeper(&mut sched, "bounded-quantum").unwrap();
    keeper.start().unwrap();

    c.bench_function("keeper_inc_need_sync", |b| {
        b.iter(|| {
            keeper.inc(black_box(SimTime::from_ns(1))).unwrap();
            if keeper.need_sync() {
                keeper.reset().unwrap();
            }
        })
    });
    keeper.stop();
}

criterion_group!(
    benches,
    bench_policy_budgets,
    bench_cross_thread_notify,
    bench_keeper_inc
);
criterion_main!(benches);
