//! churnline CLI - Main entry point.

use anyhow::Context;
use churnline::cli::{Cli, Commands};
use churnline::compute::DeployOptions;
use churnline::config::ChurnlineConfig;
use churnline::data::CsvDataSource;
use churnline::observability::{self, MetricsTracker};
use churnline::pipeline::{self, InferenceFlow, RunOptions, TrainingPipeline};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => ChurnlineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ChurnlineConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if cli.json_logs {
        config.observability.json_logs = true;
    }
    if let Some(dir) = cli.state_dir {
        config.serving.state_dir = Some(dir);
    }

    observability::init(&config.observability)?;

    match cli.command {
        Commands::Train { data, no_cache } => {
            let path = data.unwrap_or_else(|| config.pipeline.data_path.clone());
            let pipeline = build_pipeline(&config)?;

            let output = pipeline.run_training(&path, RunOptions::cached(!no_cache))?;
            println!("Run {} ({})", output.run.id, output.run.pipeline);
            for step in &output.run.steps {
                println!("  {:<16} {:?} {}ms", step.name, step.status, step.duration_ms);
            }
            println!("R²:   {:.4}", output.scores.r2);
            println!("RMSE: {:.4}", output.scores.rmse);
        }

        Commands::Deploy {
            data,
            min_accuracy,
            workers,
            timeout,
            cache,
        } => {
            let path = data.unwrap_or_else(|| config.pipeline.data_path.clone());
            let min_accuracy = min_accuracy.unwrap_or(config.pipeline.min_accuracy);
            let defaults = config.serving.deploy_options();
            let deploy = DeployOptions {
                workers: workers.unwrap_or(defaults.workers),
                timeout: timeout.unwrap_or(defaults.timeout),
            };
            config.validate()?;

            let pipeline = build_pipeline(&config)?;
            let options = if cache { RunOptions::cached(true) } else { RunOptions::default() };
            let result = pipeline
                .run_with_options(&path, min_accuracy, deploy, options)
                .await;
            // The endpoint lives in this process; release its slot for `serve`
            pipeline.registry().shutdown().await?;
            let report = result?;

            println!("Run {} ({})", report.run.id, report.run.pipeline);
            println!("R²:   {:.4} (minimum {:.4})", report.scores.r2, min_accuracy);
            println!("RMSE: {:.4}", report.scores.rmse);
            println!("Outcome: {}", serde_json::to_string(&report.outcome)?);
        }

        Commands::Predict {
            payload,
            data,
            rows,
            seed,
            show_payload,
        } => {
            let raw = match payload {
                Some(file) => std::fs::read_to_string(&file)
                    .with_context(|| format!("reading payload {}", file.display()))?,
                None => {
                    let path = data.unwrap_or_else(|| config.pipeline.data_path.clone());
                    pipeline::sample_payload(&CsvDataSource::new(), &path, rows, seed)?
                }
            };
            if show_payload {
                println!("{}", raw);
            }

            let registry = churnline::open_registry(&config)?;
            let flow = InferenceFlow::new(Arc::clone(&registry))
                .with_timeout(config.serving.inference_timeout);
            let result = flow.predict(&raw, &config.deployment).await;
            registry.shutdown().await?;
            let predictions = result?;
            println!("{}", serde_json::json!({ "predictions": predictions }));
        }

        Commands::Serve { bind } => {
            if let Some(addr) = bind {
                config.serving.bind_addr = addr;
            }
            churnline::serve(config).await?;
        }

        Commands::Status { runs } => {
            let registry = churnline::open_registry(&config)?;
            let services = registry.list().await;
            if services.is_empty() {
                println!("No services deployed");
            }
            for service in services {
                let state = match &service.served_by {
                    Some(lease) => format!("running ({})", lease),
                    None => "stopped".to_string(),
                };
                println!(
                    "{}  v{}  {}  workers={}  {}  deployed {}",
                    service.key,
                    service.version,
                    service.model,
                    service.workers,
                    state,
                    service.deployed_at.to_rfc3339()
                );
            }

            if let Some(dir) = &config.serving.state_dir {
                let history = pipeline::load_runs(dir)?;
                let skip = history.len().saturating_sub(runs);
                for run in history.iter().skip(skip) {
                    println!(
                        "{}  {:<32} {:?}{}",
                        run.started_at.to_rfc3339(),
                        run.pipeline,
                        run.status,
                        run.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
                    );
                }
            }
        }

        Commands::Stop => {
            let registry = churnline::open_registry(&config)?;
            match registry.stop(&config.deployment).await? {
                Some(lease) => println!("Stopped {} (was running in {})", config.deployment, lease),
                None => println!("Stopped {} (was not running)", config.deployment),
            }
        }
    }

    Ok(())
}

fn build_pipeline(config: &ChurnlineConfig) -> anyhow::Result<TrainingPipeline> {
    let registry = churnline::open_registry(config)?;
    Ok(TrainingPipeline::new(
        Arc::new(CsvDataSource::new()),
        Arc::new(MetricsTracker::new()),
        registry,
        config,
    ))
}
