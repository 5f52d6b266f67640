//! Command-line interface for churnline.

use crate::config::humantime_serde::parse_duration;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// churnline - train churn models and serve the best one.
#[derive(Parser)]
#[command(name = "churnline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "CHURNLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "CHURNLINE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "CHURNLINE_JSON_LOGS")]
    pub json_logs: bool,

    /// Directory holding deployed services, run history and the step cache
    #[arg(long, env = "CHURNLINE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Train and evaluate a model without deploying it
    Train {
        /// Training data (CSV with header)
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Recompute every step instead of reusing cached outputs
        #[arg(long)]
        no_cache: bool,
    },

    /// Train, evaluate and deploy the model if it beats the threshold
    Deploy {
        /// Training data (CSV with header)
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Minimum R² the model must exceed to be deployed
        #[arg(long)]
        min_accuracy: Option<f64>,

        /// Prediction workers for the deployed endpoint
        #[arg(long)]
        workers: Option<usize>,

        /// How long to wait for the endpoint to become healthy (e.g. 60s)
        #[arg(long, value_parser = parse_duration_arg)]
        timeout: Option<Duration>,

        /// Reuse cached step outputs
        #[arg(long)]
        cache: bool,
    },

    /// Score a payload with the deployed service
    Predict {
        /// JSON payload file; omit to sample rows from the training data
        #[arg(short, long)]
        payload: Option<PathBuf>,

        /// Training data to sample from when no payload is given
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Rows to sample
        #[arg(long, default_value_t = 100)]
        rows: usize,

        /// Sampling seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Print the sampled payload alongside the predictions
        #[arg(long)]
        show_payload: bool,
    },

    /// Run the HTTP prediction server for the deployed service
    Serve {
        /// Bind address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Show deployed services and recent pipeline runs
    Status {
        /// Pipeline runs to show
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },

    /// Stop the deployed service
    Stop,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s)
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::try_parse_from([
            "churnline",
            "--state-dir",
            "/tmp/state",
            "deploy",
            "--data",
            "churn.csv",
            "--min-accuracy",
            "0.5",
            "--timeout",
            "30s",
        ])
        .unwrap();

        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/state")));
        match cli.command {
            Commands::Deploy {
                data,
                min_accuracy,
                timeout,
                workers,
                cache,
            } => {
                assert_eq!(data, Some(PathBuf::from("churn.csv")));
                assert_eq!(min_accuracy, Some(0.5));
                assert_eq!(timeout, Some(Duration::from_secs(30)));
                assert_eq!(workers, None);
                assert!(!cache);
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_parse_predict_defaults() {
        let cli = Cli::try_parse_from(["churnline", "predict"]).unwrap();
        match cli.command {
            Commands::Predict { payload, rows, seed, .. } => {
                assert!(payload.is_none());
                assert_eq!(rows, 100);
                assert_eq!(seed, 42);
            }
            _ => panic!("expected predict"),
        }
    }

    #[test]
    fn test_rejects_bad_timeout() {
        assert!(Cli::try_parse_from(["churnline", "deploy", "--timeout", "soon"]).is_err());
    }
}
