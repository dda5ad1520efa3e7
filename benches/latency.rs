//! Latency benchmarks for the hot, per-tick stop-loss operations.
//!
//! Run with: `cargo bench --bench latency`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use slm_core::arbiter::Arbiter;
use slm_core::config::RiskConfig;
use slm_core::constraint_adjuster;
use slm_core::metadata_corrector::MetadataCorrector;
use slm_core::price_calculator::{Intent, PriceCalculator};
use slm_core::types::{Direction, InstrumentMetadata, Position};
use slm_core::violation;

fn forex_metadata() -> InstrumentMetadata {
    InstrumentMetadata {
        symbol: "EURUSD".to_string(),
        point: Decimal::new(1, 5),
        digits: 5,
        nominal_contract_size: Decimal::new(100_000, 0),
        tick_value_usd: None,
        min_stops_distance: 0,
        bid: Decimal::new(119800, 5),
        ask: Decimal::new(119810, 5),
    }
}

fn losing_position(ticket: u64) -> Position {
    Position {
        ticket,
        symbol: "EURUSD".to_string(),
        direction: Direction::Buy,
        entry_price: Decimal::new(120000, 5),
        current_price: Decimal::new(119800, 5),
        current_sl: Decimal::ZERO,
        volume: Decimal::new(1, 2),
        profit_usd: Decimal::new(-200, 2),
    }
}

fn trailing_position(ticket: u64) -> Position {
    Position {
        ticket,
        symbol: "EURUSD".to_string(),
        direction: Direction::Buy,
        entry_price: Decimal::new(120000, 5),
        current_price: Decimal::new(120500, 5),
        current_sl: Decimal::new(120100, 5),
        volume: Decimal::new(1, 2),
        profit_usd: Decimal::new(500, 2),
    }
}

/// Benchmark pure arbitration: the call made once per position per worker
/// tick and again inline inside `update_sl_atomic`.
fn bench_arbiter_compute(c: &mut Criterion) {
    let risk_cfg = RiskConfig::default();
    let corrector = MetadataCorrector::new();
    let arbiter = Arbiter::new(&risk_cfg, &corrector);
    let metadata = forex_metadata();

    let mut group = c.benchmark_group("arbiter_compute");
    group.throughput(Throughput::Elements(1));

    let losing = losing_position(1);
    group.bench_function("hard_cap", |b| {
        b.iter(|| black_box(arbiter.compute(black_box(&losing), black_box(&metadata))))
    });

    let trailing = trailing_position(2);
    group.bench_function("trailing", |b| {
        b.iter(|| black_box(arbiter.compute(black_box(&trailing), black_box(&metadata))))
    });

    group.finish();
}

/// Benchmark SL price calculation in isolation from arbitration.
fn bench_price_calculator(c: &mut Criterion) {
    let corrector = MetadataCorrector::new();
    let calc = PriceCalculator::new(&corrector);
    let metadata = forex_metadata();

    c.bench_function("price_calculator_loss_protection", |b| {
        b.iter(|| {
            black_box(calc.calculate(
                black_box(Decimal::new(120000, 5)),
                black_box(Decimal::new(-200, 2)),
                black_box(Direction::Buy),
                black_box(Decimal::new(1, 2)),
                black_box(&metadata),
                None,
                Intent::LossProtection,
            ))
        })
    });
}

/// Benchmark broker-constraint clamping (stops distance, bid/ask ceiling).
fn bench_constraint_adjuster(c: &mut Criterion) {
    let metadata = forex_metadata();
    c.bench_function("constraint_adjuster_adjust", |b| {
        b.iter(|| {
            black_box(constraint_adjuster::adjust(
                black_box(Decimal::new(119500, 5)),
                black_box(Decimal::ZERO),
                black_box(Direction::Buy),
                black_box(&metadata),
                black_box(Decimal::new(120000, 5)),
            ))
        })
    });
}

/// Benchmark the Instrument Metadata Corrector's reverse-engineering path,
/// the most arithmetic-heavy step on the per-tick hot path for crypto/index
/// symbols with unreliable broker-reported contract sizes.
fn bench_metadata_corrector(c: &mut Criterion) {
    let corrector = MetadataCorrector::new();
    let position = losing_position(3);

    c.bench_function("corrected_size_reverse_engineered", |b| {
        b.iter(|| {
            black_box(corrector.corrected_size(
                black_box("BTCXAUm"),
                black_box(Decimal::new(2234929, 5)),
                black_box(Decimal::new(1, 2)),
                black_box(Decimal::new(-200, 2)),
                black_box(Decimal::ONE),
                Some(black_box(&position)),
            ))
        })
    });

    c.bench_function("corrected_size_cached", |b| {
        corrector.corrected_size(
            "EURUSD",
            Decimal::new(120000, 5),
            Decimal::new(1, 2),
            Decimal::new(-200, 2),
            Decimal::new(100_000, 0),
            None,
        );
        b.iter(|| {
            black_box(corrector.corrected_size(
                black_box("EURUSD"),
                black_box(Decimal::new(120000, 5)),
                black_box(Decimal::new(1, 2)),
                black_box(Decimal::new(-200, 2)),
                black_box(Decimal::new(100_000, 0)),
                None,
            ))
        })
    });
}

/// Benchmark violation detection, run once per tick right after arbitration.
fn bench_violation_detect(c: &mut Criterion) {
    let risk_cfg = RiskConfig::default();
    let corrector = MetadataCorrector::new();
    let arbiter = Arbiter::new(&risk_cfg, &corrector);
    let metadata = forex_metadata();
    let decision = arbiter.compute(&trailing_position(4), &metadata);
    let now = chrono::Utc::now();
    let last_success = now - chrono::Duration::milliseconds(50);

    c.bench_function("violation_detect", |b| {
        b.iter(|| black_box(violation::detect(4, black_box(&decision), Some(last_success), None, now)))
    });
}

/// Benchmark Decimal arithmetic, the unit of work underlying every price and
/// P&L computation in the crate.
fn bench_decimal_arithmetic(c: &mut Criterion) {
    let mut group = c.benchmark_group("decimal_arithmetic");

    let val_a = Decimal::new(12345, 4);
    let val_b = Decimal::new(67890, 4);

    group.bench_function("addition", |bencher| {
        bencher.iter(|| black_box(black_box(val_a) + black_box(val_b)))
    });
    group.bench_function("multiplication", |bencher| {
        bencher.iter(|| black_box(black_box(val_a) * black_box(val_b)))
    });
    group.bench_function("division", |bencher| {
        bencher.iter(|| black_box(black_box(val_a) / black_box(val_b)))
    });
    group.bench_function("round_dp", |bencher| {
        bencher.iter(|| black_box(black_box(val_a).round_dp(5)))
    });

    group.finish();
}

/// Benchmark concurrent DashMap operations at the sizes the per-ticket
/// lock table and tracking table run at under a realistic open-position
/// count.
fn bench_dashmap_operations(c: &mut Criterion) {
    use dashmap::DashMap;

    let mut group = c.benchmark_group("dashmap");

    for size in [10, 100, 1000].iter() {
        let map: DashMap<u64, Decimal> = DashMap::new();
        for ticket in 0..*size {
            map.insert(ticket, Decimal::new(ticket as i64, 2));
        }
        let known_key = (*size / 2) as u64;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("get", size), size, |b, _| {
            b.iter(|| black_box(map.get(&known_key)))
        });
        group.bench_with_input(BenchmarkId::new("entry_or_insert", size), size, |b, _| {
            b.iter(|| {
                map.entry(known_key).or_insert(Decimal::ZERO);
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_arbiter_compute,
    bench_price_calculator,
    bench_constraint_adjuster,
    bench_metadata_corrector,
    bench_violation_detect,
    bench_decimal_arithmetic,
    bench_dashmap_operations,
);

criterion_main!(benches);
