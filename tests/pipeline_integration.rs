//! Training and continuous deployment pipeline integration tests
//!
//! Runs the pipelines against generated CSV files on disk.

#[allow(dead_code)]
mod common;

use churnline::compute::{DeployOptions, DeployOutcome};
use churnline::data::{clean, CsvDataSource, DataSource};
use churnline::pipeline::{self, RunOptions, RunStatus, StepStatus};
use churnline::types::{CHARGE_COLUMNS, FEATURE_COLUMNS};
use churnline::ChurnlineError;
use common::{ChurnDataGenerator, TestEnv};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Ingest and cleaning
// =============================================================================

#[test]
fn test_clean_drops_charges_and_text_columns() {
    let env = TestEnv::with_rows(50);
    let table = CsvDataSource::new().read(&env.data_path).unwrap();
    assert!(table.column("state").unwrap().is_text());

    let cleaned = clean(&table).unwrap();
    for charge in CHARGE_COLUMNS {
        assert!(!cleaned.has_column(charge));
    }
    assert!(!cleaned.has_column("state"));
    for feature in FEATURE_COLUMNS {
        assert!(cleaned.has_column(feature));
    }
    assert!(cleaned.has_column("churn"));

    assert_eq!(clean(&cleaned).unwrap(), cleaned);
}

#[test]
fn test_training_on_csv() {
    let env = TestEnv::new();
    let (pipeline, tracker) = env.pipeline(env.registry());

    let output = pipeline
        .run_training(&env.data_path, RunOptions::default())
        .unwrap();

    assert_eq!(output.run.status, RunStatus::Succeeded);
    assert!(output.scores.r2 > 0.0);
    assert!(output.scores.rmse > 0.0);
    assert_eq!(tracker.last("rmse"), Some(output.scores.rmse));
    assert_eq!(output.model.feature_names, FEATURE_COLUMNS.to_vec());
}

#[test]
fn test_missing_feature_aborts_clean_step() {
    let env = TestEnv::with_rows(30);
    let csv = ChurnDataGenerator::new(3)
        .csv(30)
        .replace("total_intl_minutes", "intl_minutes");
    std::fs::write(&env.data_path, csv).unwrap();

    let (pipeline, _) = env.pipeline(env.registry());
    let err = pipeline
        .run_training(&env.data_path, RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, ChurnlineError::Schema(_)));

    let run = pipeline.runs().pop().unwrap();
    assert_eq!(run.step("ingest_data").unwrap().status, StepStatus::Completed);
    assert_eq!(run.step("clean_data").unwrap().status, StepStatus::Failed);
}

#[test]
fn test_unreadable_file_aborts_ingest() {
    let env = TestEnv::with_rows(10);
    let (pipeline, _) = env.pipeline(env.registry());

    let err = pipeline
        .run_training(&env.temp_dir.path().join("absent.csv"), RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, ChurnlineError::Ingest { .. }));
}

// =============================================================================
// Caching
// =============================================================================

#[test]
fn test_step_cache_survives_new_pipeline_instance() {
    let env = TestEnv::new();

    let (first, _) = env.pipeline(env.registry());
    let trained = first.run_training(&env.data_path, RunOptions::default()).unwrap();
    assert!(trained.run.steps.iter().all(|s| s.status == StepStatus::Completed));

    let (second, tracker) = env.pipeline(env.registry());
    let cached = second.run_training(&env.data_path, RunOptions::default()).unwrap();
    assert!(cached.run.steps.iter().all(|s| s.status == StepStatus::Cached));
    assert!((cached.scores.r2 - trained.scores.r2).abs() < 1e-12);
    assert!((cached.scores.rmse - trained.scores.rmse).abs() < 1e-12);
    // Cached evaluation does not re-log metrics
    assert!(tracker.is_empty());
}

#[test]
fn test_changed_data_invalidates_cache() {
    let env = TestEnv::new();
    let (pipeline, _) = env.pipeline(env.registry());
    pipeline.run_training(&env.data_path, RunOptions::default()).unwrap();

    ChurnDataGenerator::new(99).write_csv(&env.data_path, 400);
    let rerun = pipeline.run_training(&env.data_path, RunOptions::default()).unwrap();
    assert_eq!(rerun.run.step("train_model").unwrap().status, StepStatus::Completed);
}

// =============================================================================
// Continuous deployment
// =============================================================================

#[tokio::test]
async fn test_deploy_when_score_beats_threshold() {
    let env = TestEnv::new();
    let registry = env.registry();
    let (pipeline, _) = env.pipeline(registry.clone());

    let report = pipeline.run(&env.data_path, -10.0, 2, TIMEOUT).await.unwrap();
    assert!(report.decision);
    assert_eq!(report.outcome, DeployOutcome::Deployed { version: 1 });

    let names: Vec<&str> = report.run.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "ingest_data",
            "clean_data",
            "train_model",
            "evaluate_model",
            "deployment_trigger",
            "model_deployer"
        ]
    );

    let record = registry.lookup(&env.config().deployment, true).await.unwrap();
    assert_eq!(record.endpoint.config().workers, 2);
}

#[tokio::test]
async fn test_threshold_equal_to_score_does_not_deploy() {
    let env = TestEnv::new();
    let registry = env.registry();
    let (pipeline, _) = env.pipeline(registry.clone());

    let trained = pipeline.run_training(&env.data_path, RunOptions::cached(false)).unwrap();
    let report = pipeline
        .run(&env.data_path, trained.scores.r2, 1, TIMEOUT)
        .await
        .unwrap();

    assert!(!report.decision);
    assert_eq!(report.outcome, DeployOutcome::Skipped);
    assert!(registry.find(&env.config().deployment, false).await.is_none());
}

#[tokio::test]
async fn test_failed_trigger_keeps_previous_model() {
    let env = TestEnv::new();
    let registry = env.registry();
    let (pipeline, _) = env.pipeline(registry.clone());
    let key = env.config().deployment;

    pipeline.run(&env.data_path, -10.0, 1, TIMEOUT).await.unwrap();
    let deployed = registry.lookup(&key, true).await.unwrap();

    let report = pipeline.run(&env.data_path, 1.0, 1, TIMEOUT).await.unwrap();
    assert_eq!(report.outcome, DeployOutcome::Skipped);

    let current = registry.lookup(&key, true).await.unwrap();
    assert_eq!(current.version, deployed.version);
    assert!(current.endpoint.is_running().await);
}

#[tokio::test]
async fn test_deploy_start_timeout_fails_run() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.serving.warmup = Duration::from_millis(500);
    let registry = churnline::open_registry(&config).unwrap();
    let (pipeline, _) = env.pipeline(registry);

    let deploy = DeployOptions {
        workers: 1,
        timeout: Duration::from_millis(20),
    };
    let err = pipeline
        .run_with_options(&env.data_path, -10.0, deploy, RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChurnlineError::ServiceStartTimeout { .. }));

    let run = pipeline.runs().pop().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step("model_deployer").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_run_history_is_persisted() {
    let env = TestEnv::new();
    let (pipeline, _) = env.pipeline(env.registry());

    pipeline.run_training(&env.data_path, RunOptions::default()).unwrap();
    pipeline.run(&env.data_path, 1.0, 1, TIMEOUT).await.unwrap();
    let _ = pipeline.run_training(&env.temp_dir.path().join("absent.csv"), RunOptions::default());

    let runs = pipeline::load_runs(&env.state_dir).unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[2].status, RunStatus::Failed);
    assert!(runs[2].error.as_deref().unwrap().contains("absent.csv"));
    assert_eq!(runs, pipeline.runs());
}
