//! Training and continuous deployment pipelines.
//!
//! A run is a strict chain of steps:
//!
//! ```text
//! ingest_data -> clean_data -> train_model -> evaluate_model
//!                                               -> deployment_trigger -> model_deployer
//! ```
//!
//! The training pipeline stops after evaluation; the continuous deployment
//! pipeline gates the evaluated model on its R² and hands it to the
//! [`ServiceRegistry`]. Every run is recorded as a [`PipelineRun`].

pub mod cache;
pub mod deployment;
pub mod inference;

pub use cache::{StepCache, CACHE_EXEMPT_STEPS};
pub use deployment::should_deploy;
pub use inference::{parse_payload, sample_payload, InferenceFlow, DEFAULT_INFERENCE_TIMEOUT};

use crate::compute::{
    DeployOptions, DeployOutcome, Metric, ModelKind, ServiceRegistry, TrainedModel,
};
use crate::config::{ChurnlineConfig, PipelineConfig};
use crate::data::DataSource;
use crate::error::{ChurnlineError, Result};
use crate::observability::{record_pipeline_run, ExperimentTracker};
use crate::types::{DeploymentKey, ScorePair, Split, Table};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the train-and-evaluate pipeline.
pub const TRAINING_PIPELINE: &str = "training_pipeline";

/// Name of the train-evaluate-deploy pipeline.
pub const CONTINUOUS_DEPLOYMENT_PIPELINE: &str = "continuous_deployment_pipeline";

/// Run history file inside the state directory.
pub const RUNS_FILE: &str = "runs.jsonl";

// ============================================================================
// Run records
// ============================================================================

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Executed in this run
    Completed,
    /// Output reused from an earlier run
    Cached,
    Failed,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
}

/// Record of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run ID
    pub id: Uuid,
    /// Pipeline name
    pub pipeline: String,
    /// Overall status
    pub status: RunStatus,
    /// Steps in execution order
    pub steps: Vec<StepRecord>,
    /// Error that aborted the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    fn new(pipeline: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.to_string(),
            status: RunStatus::Running,
            steps: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record of the named step, if it ran.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn duration(&self) -> Option<Duration> {
        let finished = self.finished_at?;
        (finished - self.started_at).to_std().ok()
    }

    fn record(&mut self, name: &str, status: StepStatus, started: Instant) {
        self.steps.push(StepRecord {
            name: name.to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn finish(&mut self, error: Option<&ChurnlineError>) {
        self.status = if error.is_some() { RunStatus::Failed } else { RunStatus::Succeeded };
        self.error = error.map(|e| e.to_string());
        self.finished_at = Some(Utc::now());
    }
}

/// Reads the run history saved in `state_dir`. Undecodable lines are skipped.
pub fn load_runs(state_dir: &Path) -> Result<Vec<PipelineRun>> {
    let path = state_dir.join(RUNS_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(&path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(run) => Some(run),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable run record");
                None
            }
        })
        .collect())
}

// ============================================================================
// Pipelines
// ============================================================================

/// Per-run options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Reuse cached step outputs. Unset falls back to the configured value,
    /// then to the pipeline default.
    pub enable_cache: Option<bool>,
}

impl RunOptions {
    pub fn cached(enable_cache: bool) -> Self {
        Self {
            enable_cache: Some(enable_cache),
        }
    }
}

/// Result of the training pipeline.
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    pub run: PipelineRun,
    pub model: TrainedModel,
    pub scores: ScorePair,
}

/// Result of the continuous deployment pipeline.
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub run: PipelineRun,
    pub scores: ScorePair,
    /// Whether the trigger accepted the model
    pub decision: bool,
    pub outcome: DeployOutcome,
}

/// Trains, evaluates and optionally deploys churn models.
pub struct TrainingPipeline {
    source: Arc<dyn DataSource>,
    tracker: Arc<dyn ExperimentTracker>,
    registry: Arc<ServiceRegistry>,
    config: PipelineConfig,
    key: DeploymentKey,
    state_dir: Option<PathBuf>,
    cache: StepCache,
    history: RwLock<Vec<PipelineRun>>,
}

impl TrainingPipeline {
    pub fn new(
        source: Arc<dyn DataSource>,
        tracker: Arc<dyn ExperimentTracker>,
        registry: Arc<ServiceRegistry>,
        config: &ChurnlineConfig,
    ) -> Self {
        let state_dir = config.serving.state_dir.clone();
        Self {
            source,
            tracker,
            registry,
            config: config.pipeline.clone(),
            key: config.deployment.clone(),
            cache: StepCache::new(state_dir.as_ref().map(|dir| dir.join("cache"))),
            state_dir,
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &StepCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Key under which this pipeline deploys
    pub fn deployment_key(&self) -> &DeploymentKey {
        &self.key
    }

    /// Runs finished by this pipeline instance, oldest first.
    pub fn runs(&self) -> Vec<PipelineRun> {
        self.history.read().clone()
    }

    /// Ingests, cleans, trains and evaluates. Caches step outputs by default.
    pub fn run_training(&self, path: &Path, options: RunOptions) -> Result<TrainingOutput> {
        let use_cache = options.enable_cache.or(self.config.enable_cache).unwrap_or(true);
        let mut run = PipelineRun::new(TRAINING_PIPELINE);
        info!(run_id = %run.id, path = %path.display(), use_cache, "Starting training pipeline");

        match self.train_steps(&mut run, path, use_cache) {
            Ok((model, scores)) => {
                self.finish(&mut run, None);
                Ok(TrainingOutput { run, model, scores })
            }
            Err(e) => {
                self.finish(&mut run, Some(&e));
                Err(e)
            }
        }
    }

    /// Trains and evaluates, then deploys the model when its R² exceeds `min_accuracy`.
    pub async fn run(
        &self,
        path: &Path,
        min_accuracy: f64,
        workers: usize,
        timeout: Duration,
    ) -> Result<DeploymentReport> {
        self.run_with_options(
            path,
            min_accuracy,
            DeployOptions { workers, timeout },
            RunOptions::default(),
        )
        .await
    }

    /// [`run`](Self::run) with explicit options. Caching is off unless requested.
    pub async fn run_with_options(
        &self,
        path: &Path,
        min_accuracy: f64,
        deploy: DeployOptions,
        options: RunOptions,
    ) -> Result<DeploymentReport> {
        let use_cache = options.enable_cache.or(self.config.enable_cache).unwrap_or(false);
        let mut run = PipelineRun::new(CONTINUOUS_DEPLOYMENT_PIPELINE);
        info!(
            run_id = %run.id,
            path = %path.display(),
            min_accuracy,
            key = %self.key,
            "Starting continuous deployment pipeline"
        );

        match self.deployment_steps(&mut run, path, min_accuracy, deploy, use_cache).await {
            Ok((scores, decision, outcome)) => {
                self.finish(&mut run, None);
                Ok(DeploymentReport {
                    run,
                    scores,
                    decision,
                    outcome,
                })
            }
            Err(e) => {
                self.finish(&mut run, Some(&e));
                Err(e)
            }
        }
    }

    async fn deployment_steps(
        &self,
        run: &mut PipelineRun,
        path: &Path,
        min_accuracy: f64,
        deploy: DeployOptions,
        use_cache: bool,
    ) -> Result<(ScorePair, bool, DeployOutcome)> {
        let (model, scores) = self.train_steps(run, path, use_cache)?;

        let trigger_key = cache_key("deployment_trigger", &(scores.r2, min_accuracy))
            .filter(|_| use_cache);
        let decision: bool =
            self.execute_step(run, "deployment_trigger", trigger_key.as_deref(), || {
                Ok(should_deploy(scores.r2, min_accuracy))
            })?;

        let started = Instant::now();
        match self.registry.deploy(decision, model, &self.key, deploy).await {
            Ok(outcome) => {
                run.record("model_deployer", StepStatus::Completed, started);
                Ok((scores, decision, outcome))
            }
            Err(e) => {
                run.record("model_deployer", StepStatus::Failed, started);
                error!(run_id = %run.id, step = "model_deployer", error = %e, "Step failed");
                Err(e)
            }
        }
    }

    fn train_steps(
        &self,
        run: &mut PipelineRun,
        path: &Path,
        use_cache: bool,
    ) -> Result<(TrainedModel, ScorePair)> {
        // Each step's cache key covers the key of the step feeding it
        let ingest_key = if use_cache {
            self.source
                .fingerprint(path)
                .ok()
                .and_then(|fingerprint| cache_key("ingest_data", &(path, fingerprint)))
        } else {
            None
        };
        let table: Table = self.execute_step(run, "ingest_data", ingest_key.as_deref(), || {
            self.source.read(path)
        })?;

        let clean_key = ingest_key
            .as_ref()
            .and_then(|k| cache_key("clean_data", &(k, &self.config.transform)));
        let split: Split = self.execute_step(run, "clean_data", clean_key.as_deref(), || {
            self.config.transform.clean_and_split(&table)
        })?;

        let train_key = clean_key
            .as_ref()
            .and_then(|k| cache_key("train_model", &(k, &self.config.model_name)));
        let model: TrainedModel = self.execute_step(run, "train_model", train_key.as_deref(), || {
            ModelKind::from_name(&self.config.model_name)?.fit(&split.x_train, &split.y_train)
        })?;

        let evaluate_key = train_key.as_ref().and_then(|k| cache_key("evaluate_model", k));
        let scores: ScorePair =
            self.execute_step(run, "evaluate_model", evaluate_key.as_deref(), || {
                self.evaluate(&model, &split)
            })?;

        info!(run_id = %run.id, r2 = scores.r2, rmse = scores.rmse, "Model evaluated");
        Ok((model, scores))
    }

    fn evaluate(&self, model: &TrainedModel, split: &Split) -> Result<ScorePair> {
        let predictions = model.predict(&split.x_test)?;

        let mse = Metric::MeanSquaredError.score(&split.y_test, &predictions)?;
        self.tracker.log_metric(Metric::MeanSquaredError.name(), mse);

        let r2 = Metric::RSquared.score(&split.y_test, &predictions)?;
        self.tracker.log_metric(Metric::RSquared.name(), r2);

        let rmse = Metric::RootMeanSquaredError.score(&split.y_test, &predictions)?;
        self.tracker.log_metric(Metric::RootMeanSquaredError.name(), rmse);

        Ok(ScorePair { r2, rmse })
    }

    /// Runs `f` unless a cached output exists under `key`, recording the step on `run`.
    /// Steps in [`CACHE_EXEMPT_STEPS`] always run and are never cached.
    fn execute_step<O, F>(
        &self,
        run: &mut PipelineRun,
        step: &str,
        key: Option<&str>,
        f: F,
    ) -> Result<O>
    where
        O: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<O>,
    {
        let started = Instant::now();
        let key = key.filter(|_| !StepCache::is_exempt(step));

        if let Some(key) = key {
            if let Some(output) = self.cache.get::<O>(key) {
                info!(run_id = %run.id, step, "Using cached version of step");
                run.record(step, StepStatus::Cached, started);
                return Ok(output);
            }
        }

        match f() {
            Ok(output) => {
                if let Some(key) = key {
                    if let Err(e) = self.cache.put(key, &output) {
                        warn!(step, error = %e, "Failed to cache step output");
                    }
                }
                run.record(step, StepStatus::Completed, started);
                debug!(
                    run_id = %run.id,
                    step,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Step completed"
                );
                Ok(output)
            }
            Err(e) => {
                run.record(step, StepStatus::Failed, started);
                error!(run_id = %run.id, step, error = %e, "Step failed");
                Err(e)
            }
        }
    }

    fn finish(&self, run: &mut PipelineRun, error: Option<&ChurnlineError>) {
        run.finish(error);
        record_pipeline_run(&run.pipeline, error.is_none());

        if let Some(dir) = &self.state_dir {
            if let Err(e) = append_run(dir, run) {
                warn!(run_id = %run.id, error = %e, "Failed to record pipeline run");
            }
        }

        match run.status {
            RunStatus::Failed => {
                error!(run_id = %run.id, pipeline = %run.pipeline, "Pipeline run failed")
            }
            _ => info!(run_id = %run.id, pipeline = %run.pipeline, "Pipeline run succeeded"),
        }
        self.history.write().push(run.clone());
    }
}

fn cache_key<I: Serialize + ?Sized>(step: &str, input: &I) -> Option<String> {
    match StepCache::key(step, input) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(step, error = %e, "Step input not hashable; running uncached");
            None
        }
    }
}

fn append_run(dir: &Path, run: &PipelineRun) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(RUNS_FILE))?;
    writeln!(file, "{}", serde_json::to_string(run)?)?;
    Ok(())
}
