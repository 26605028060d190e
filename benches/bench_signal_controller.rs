// benches/bench_signal_controller.rs
use criterion::{
    black_box, criterion_group, criterion_main, AxisScale, Criterion, PlotConfiguration,
};
use std::time::Duration;
use traffic_coordinator::config::SignalTiming;
use traffic_coordinator::control_system::traffic_light_controller::{
    adapt_target, green_should_end, phase_demands,
};
use traffic_coordinator::simulation_engine::Phase;

/// Two-way split plan over `num_lanes` lanes: first half, then second half.
fn create_plan(num_lanes: usize) -> Vec<Phase> {
    let half = num_lanes / 2;
    let state = |a: char, b: char| {
        std::iter::repeat(a)
            .take(half)
            .chain(std::iter::repeat(b).take(num_lanes - half))
            .collect::<String>()
    };
    vec![
        Phase::new(0, state('G', 'r')),
        Phase::new(1, state('y', 'r')),
        Phase::new(2, state('r', 'r')),
        Phase::new(3, state('r', 'G')),
        Phase::new(4, state('r', 'y')),
        Phase::new(5, state('r', 'r')),
    ]
}

fn bench_green_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("green_decision");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(2));
    group.plot_config(PlotConfiguration::default().summary_scale(AxisScale::Linear));

    let timing = SignalTiming::default();
    for &size in [4usize, 16, 64].iter() {
        let phases = create_plan(size);
        let counts: Vec<u32> = (0..size as u32).map(|i| i % 7).collect();
        let waits: Vec<f64> = (0..size).map(|i| (i % 5) as f64 * 3.0).collect();
        group.bench_function(format!("lanes_{}", size), |b| {
            let mut target = timing.initial_green;
            b.iter(|| {
                let demands = phase_demands(&phases, &counts, &waits, timing.waiting_weight);
                target = adapt_target(target, counts[0], &timing);
                black_box(green_should_end(
                    timing.min_green,
                    0,
                    &demands,
                    target,
                    &timing,
                ))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_green_decision);
criterion_main!(benches);
