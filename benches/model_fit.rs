//! Benchmarks for cleaning, splitting, fitting and scoring.

use churnline::compute::{ModelKind, TrainedModel};
use churnline::data::DataTransform;
use churnline::types::{Column, FeatureVector, Table, FEATURE_COLUMNS, FEATURE_COUNT};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn churn_table(rows: usize) -> Table {
    let mut rng = StdRng::seed_from_u64(7);
    let mut columns: Vec<Column> = FEATURE_COLUMNS
        .iter()
        .map(|f| Column::numeric(*f, (0..rows).map(|_| rng.gen_range(0.0..100.0)).collect()))
        .collect();

    let churn = (0..rows).map(|_| if rng.gen_bool(0.15) { 1.0 } else { 0.0 }).collect();
    columns.push(Column::numeric("churn", churn));
    columns.push(Column::numeric("total_day_charge", vec![1.0; rows]));
    columns.push(Column::text("state", vec!["KS".to_string(); rows]));
    Table::new(columns).unwrap()
}

fn bench_clean_and_split(c: &mut Criterion) {
    let transform = DataTransform::default();
    let mut group = c.benchmark_group("clean_and_split");

    for rows in [1_000, 10_000, 100_000].iter() {
        let table = churn_table(*rows);
        group.throughput(Throughput::Elements(*rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, _| {
            b.iter(|| transform.clean_and_split(black_box(&table)))
        });
    }
    group.finish();
}

fn bench_fit(c: &mut Criterion) {
    let transform = DataTransform::default();
    let mut group = c.benchmark_group("linear_regression_fit");

    for rows in [1_000, 10_000, 100_000].iter() {
        let split = transform.clean_and_split(&churn_table(*rows)).unwrap();
        group.throughput(Throughput::Elements(*rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, _| {
            b.iter(|| {
                let (x, y) = (black_box(&split.x_train), black_box(&split.y_train));
                ModelKind::LinearRegression.fit(x, y)
            })
        });
    }
    group.finish();
}

fn bench_predict(c: &mut Criterion) {
    let model = TrainedModel {
        kind: ModelKind::LinearRegression,
        feature_names: FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect(),
        coefficients: vec![0.01; FEATURE_COUNT],
        intercept: 0.1,
    };
    let mut group = c.benchmark_group("predict_features");

    for rows in [1, 100, 10_000].iter() {
        let vectors: Vec<FeatureVector> = (0..*rows)
            .map(|i| FeatureVector::from_slice(&[i as f64; FEATURE_COUNT]).unwrap())
            .collect();
        group.throughput(Throughput::Elements(*rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, _| {
            b.iter(|| model.predict_features(black_box(&vectors)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_clean_and_split, bench_fit, bench_predict);
criterion_main!(benches);
