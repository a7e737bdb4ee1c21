use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use casecast::{
    build_lag_features, normalize_series, run_rollout, FeatureBatch, FeatureTable, Field,
    FieldModels, FieldPair, FnRegressor, ForecastState, LagFeatureConfig, LocationKey, ModelError,
    ObservationRow, ObservationTable, Rollout, RolloutConfig, RolloutError,
};
use chrono::NaiveDate;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 4, d).expect("valid April date")
}

fn obs(country: &str, d: u32, counts: Option<(u64, u64)>) -> ObservationRow {
    let cumulative = match counts {
        Some((cases, fatalities)) => FieldPair::new(Some(cases), Some(fatalities)),
        None => FieldPair::new(None, None),
    };
    ObservationRow::new(LocationKey::new(country, ""), day(d), cumulative)
}

fn feature_table(rows: Vec<ObservationRow>, window: usize) -> FeatureTable {
    let normalized =
        normalize_series(ObservationTable::from_rows(rows)).expect("normalization succeeds");
    let cfg = LagFeatureConfig {
        window,
        ..LagFeatureConfig::default()
    };
    build_lag_features(&normalized, &cfg).expect("lag build succeeds")
}

fn constant_models(value: f64) -> FieldModels {
    FieldPair::new(
        Box::new(FnRegressor::new("cases", move |batch: &FeatureBatch<'_>| {
            Ok(vec![value; batch.len()])
        })),
        Box::new(FnRegressor::new("fatalities", move |batch: &FeatureBatch<'_>| {
            Ok(vec![value; batch.len()])
        })),
    )
}

fn range(first: u32, last: u32, update_features_data: bool) -> RolloutConfig {
    RolloutConfig {
        first_date: day(first),
        last_date: day(last),
        update_features_data,
    }
}

fn a() -> LocationKey {
    LocationKey::new("A", "")
}

#[test]
fn prediction_accumulates_onto_baseline_and_feeds_next_day() {
    let table = feature_table(
        vec![
            obs("A", 1, Some((100, 5))),
            obs("A", 2, None),
            obs("A", 3, None),
        ],
        2,
    );
    let lag_1 = table
        .schema()
        .column_index(&Field::ConfirmedCases.lag_column(1))
        .expect("lag column exists");
    let lag_2 = table
        .schema()
        .column_index(&Field::ConfirmedCases.lag_column(2))
        .expect("lag column exists");

    let seen: Arc<Mutex<Vec<(f64, f64)>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    let models: FieldModels = FieldPair::new(
        Box::new(FnRegressor::new("cases", move |batch: &FeatureBatch<'_>| {
            let mut seen = recorder.lock().expect("recorder lock");
            for row in &batch.rows {
                let lag = |idx: usize| row[idx].as_f64().unwrap_or(f64::NAN);
                seen.push((lag(lag_1), lag(lag_2)));
            }
            Ok(vec![0.693; batch.len()])
        })),
        Box::new(FnRegressor::new("fatalities", |batch: &FeatureBatch<'_>| {
            Ok(vec![0.0; batch.len()])
        })),
    );

    let seed = ForecastState::seed_from(&table, day(2));
    let forecast = run_rollout(&table, &models, seed, range(2, 3, true)).expect("rollout succeeds");

    let rows = forecast.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].predicted, FieldPair::new(101, 5));
    assert_eq!(rows[1].predicted, FieldPair::new(102, 5));
    assert_eq!(rows[0].actual, FieldPair::new(None, None));

    let seen = seen.lock().expect("recorder lock");
    assert!((seen[0].0 - 101.0_f64.ln()).abs() < 1e-12);
    assert!((seen[1].0 - 0.693).abs() < 1e-12);
    assert!((seen[1].1 - 101.0_f64.ln()).abs() < 1e-12);
}

#[test]
fn missing_baseline_is_reported_before_any_model_call() {
    let table = feature_table(
        vec![obs("A", 1, Some((10, 0))), obs("A", 2, None), obs("B", 2, None)],
        1,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let models: FieldModels = FieldPair::new(
        Box::new(FnRegressor::new("cases", move |batch: &FeatureBatch<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.0; batch.len()])
        })),
        Box::new(FnRegressor::new("fatalities", |batch: &FeatureBatch<'_>| {
            Ok(vec![0.0; batch.len()])
        })),
    );

    let seed = ForecastState::seed_from(&table, day(2));
    let err = run_rollout(&table, &models, seed, range(2, 2, false)).expect_err("B has no baseline");

    match err {
        RolloutError::MissingBaseline { date, locations } => {
            assert_eq!(date, day(2));
            assert_eq!(locations, vec![LocationKey::new("B", "")]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn days_without_rows_leave_state_untouched() {
    let table = feature_table(vec![obs("A", 1, Some((7, 1))), obs("A", 3, None)], 1);
    let models = constant_models(10.0_f64.ln_1p());
    let mut seed = ForecastState::new();
    seed.insert(a(), FieldPair::new(7, 1));

    let mut rollout = Rollout::new(&table, &models, seed, range(2, 3, false)).expect("valid range");
    assert_eq!(rollout.step().expect("empty day"), Some(day(2)));
    assert!(rollout.completed().is_empty());
    assert_eq!(rollout.state().get(&a()), Some(&FieldPair::new(7, 1)));

    assert_eq!(rollout.step().expect("day with rows"), Some(day(3)));
    assert_eq!(rollout.state().get(&a()), Some(&FieldPair::new(17, 11)));
    assert_eq!(rollout.step().expect("done"), None);
}

#[test]
fn model_failure_names_day_and_locations_and_keeps_prior_days() {
    let table = feature_table(
        vec![
            obs("A", 1, Some((1, 0))),
            obs("A", 2, None),
            obs("A", 3, None),
        ],
        1,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let models: FieldModels = FieldPair::new(
        Box::new(FnRegressor::new("cases", |batch: &FeatureBatch<'_>| {
            Ok(vec![0.0; batch.len()])
        })),
        Box::new(FnRegressor::new("fatalities", move |batch: &FeatureBatch<'_>| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![0.0; batch.len()])
            } else {
                Err(ModelError::Predict("booster unavailable".to_string()))
            }
        })),
    );

    let seed = ForecastState::seed_from(&table, day(2));
    let mut rollout = Rollout::new(&table, &models, seed, range(2, 3, true)).expect("valid range");
    rollout.step().expect("first day succeeds");
    let err = rollout.step().expect_err("second day fails");

    match &err {
        RolloutError::Model {
            date,
            field,
            locations,
            ..
        } => {
            assert_eq!(*date, day(3));
            assert_eq!(*field, Field::Fatalities);
            assert_eq!(locations, &vec![a()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("2020-04-03"));
    assert_eq!(rollout.completed().len(), 1);
    assert_eq!(rollout.completed()[0].date, day(2));
}

#[test]
fn non_finite_output_is_rejected() {
    let table = feature_table(vec![obs("A", 1, Some((1, 0))), obs("A", 2, None)], 1);
    let models = constant_models(f64::INFINITY);
    let seed = ForecastState::seed_from(&table, day(2));

    let err = run_rollout(&table, &models, seed, range(2, 2, false)).expect_err("infinite output");
    assert!(matches!(
        err,
        RolloutError::Model {
            source: ModelError::NonFinite { .. },
            ..
        }
    ));
}

#[test]
fn negative_output_is_clamped_to_zero() {
    let table = feature_table(vec![obs("A", 1, Some((40, 2))), obs("A", 2, None)], 1);
    let models = constant_models(-3.0);
    let seed = ForecastState::seed_from(&table, day(2));

    let forecast = run_rollout(&table, &models, seed, range(2, 2, false)).expect("rollout succeeds");
    assert_eq!(forecast.rows()[0].predicted_log_new, FieldPair::new(0.0, 0.0));
    assert_eq!(forecast.rows()[0].predicted, FieldPair::new(40, 2));
}

#[test]
fn location_absent_on_a_day_keeps_its_last_state() {
    let table = feature_table(
        vec![
            obs("A", 1, Some((5, 0))),
            obs("B", 1, Some((9, 0))),
            obs("A", 2, None),
            obs("B", 2, None),
            obs("A", 3, None),
        ],
        2,
    );
    let models = constant_models(1.0_f64.ln_1p());
    let seed = ForecastState::seed_from(&table, day(2));

    let mut rollout = Rollout::new(&table, &models, seed, range(2, 3, true)).expect("valid range");
    while rollout.step().expect("step succeeds").is_some() {}

    let b = LocationKey::new("B", "");
    assert_eq!(rollout.state().get(&a()), Some(&FieldPair::new(7, 2)));
    assert_eq!(rollout.state().get(&b), Some(&FieldPair::new(10, 1)));
}

#[test]
fn disabled_propagation_leaves_observed_lags() {
    let table = feature_table(
        vec![
            obs("A", 1, Some((3, 0))),
            obs("A", 2, None),
            obs("A", 3, None),
        ],
        2,
    );
    let models = constant_models(0.5);
    let seed = ForecastState::seed_from(&table, day(2));

    let mut rollout = Rollout::new(&table, &models, seed, range(2, 3, false)).expect("valid range");
    while rollout.step().expect("step succeeds").is_some() {}
    assert!(rollout.overlay().is_empty());

    let mut rollout = Rollout::new(
        &table,
        &models,
        ForecastState::seed_from(&table, day(2)),
        range(2, 3, true),
    )
    .expect("valid range");
    while rollout.step().expect("step succeeds").is_some() {}
    assert_eq!(
        rollout.overlay().get(&a(), day(3), Field::ConfirmedCases, 1),
        Some(0.5)
    );
    assert_eq!(rollout.overlay().len(), 2);
}

#[test]
fn inverted_range_is_rejected() {
    let table = feature_table(vec![obs("A", 1, Some((1, 0)))], 1);
    let models = constant_models(0.0);
    let err = Rollout::new(&table, &models, ForecastState::new(), range(3, 2, false))
        .err()
        .expect("inverted range fails");
    assert!(matches!(err, RolloutError::InvalidRange { .. }));
}

#[test]
fn failed_day_is_retried_instead_of_skipped() {
    let table = feature_table(
        vec![
            obs("A", 1, Some((100, 0))),
            obs("A", 2, None),
            obs("A", 3, None),
        ],
        1,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let models: FieldModels = FieldPair::new(
        Box::new(FnRegressor::new("cases", move |batch: &FeatureBatch<'_>| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ModelError::Predict("transient".to_string()))
            } else {
                Ok(vec![10.0_f64.ln_1p(); batch.len()])
            }
        })),
        Box::new(FnRegressor::new("fatalities", |batch: &FeatureBatch<'_>| {
            Ok(vec![0.0; batch.len()])
        })),
    );

    let seed = ForecastState::seed_from(&table, day(2));
    let mut rollout = Rollout::new(&table, &models, seed, range(2, 3, true)).expect("valid range");
    let err = rollout.step().expect_err("first attempt fails");
    assert!(matches!(err, RolloutError::Model { field: Field::ConfirmedCases, .. }));
    assert!(rollout.completed().is_empty());
    assert_eq!(rollout.state().get(&a()), Some(&FieldPair::new(100, 0)));

    assert_eq!(rollout.step().expect("retry succeeds"), Some(day(2)));
    assert_eq!(rollout.completed().len(), 1);
    assert_eq!(rollout.completed()[0].predicted, FieldPair::new(110, 0));
    assert_eq!(
        rollout.overlay().get(&a(), day(3), Field::ConfirmedCases, 1),
        Some(10.0_f64.ln_1p())
    );

    assert_eq!(rollout.step().expect("next day"), Some(day(3)));
    assert_eq!(rollout.completed()[1].predicted, FieldPair::new(120, 0));
}

fn by_country(batch: &FeatureBatch<'_>) -> Result<Vec<f64>, ModelError> {
    Ok(batch
        .rows
        .iter()
        .map(|row| match row[0].as_category() {
            Some("A") => 1.0,
            _ => 2.0,
        })
        .collect())
}

#[test]
fn propagation_stays_within_location_and_window() {
    let mut rows = vec![obs("A", 1, Some((10, 0))), obs("B", 1, Some((10, 0)))];
    for d in 2..=6 {
        rows.push(obs("A", d, None));
        rows.push(obs("B", d, None));
    }
    let table = feature_table(rows, 2);
    let models: FieldModels = FieldPair::new(
        Box::new(FnRegressor::new("cases", by_country)),
        Box::new(FnRegressor::new("fatalities", by_country)),
    );

    let seed = ForecastState::seed_from(&table, day(2));
    let mut rollout = Rollout::new(&table, &models, seed, range(2, 6, true)).expect("valid range");
    while rollout.step().expect("step succeeds").is_some() {}

    let b = LocationKey::new("B", "");
    let overlay = rollout.overlay();
    for d in 3..=6 {
        for field in Field::ALL {
            for offset in 1..=2 {
                let written = d - offset >= 2;
                let expect = |value: f64| written.then_some(value);
                assert_eq!(overlay.get(&a(), day(d), field, offset as usize), expect(1.0));
                assert_eq!(overlay.get(&b, day(d), field, offset as usize), expect(2.0));
            }
            assert_eq!(overlay.get(&a(), day(d), field, 3), None);
            assert_eq!(overlay.get(&b, day(d), field, 3), None);
        }
    }
    // 7 (day, offset) cells per location and field
    assert_eq!(overlay.len(), 28);
}
