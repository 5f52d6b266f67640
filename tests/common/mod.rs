//! Common test utilities for integration tests.

pub mod fixtures;

use churnline::compute::ServiceRegistry;
use churnline::config::ChurnlineConfig;
use churnline::data::CsvDataSource;
use churnline::observability::MemoryTracker;
use churnline::pipeline::TrainingPipeline;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// Re-export common types
pub use fixtures::*;

/// Find an available port for testing.
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// Test environment with a state directory and a generated training file.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub state_dir: PathBuf,
    pub data_path: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_rows(400)
    }

    pub fn with_rows(rows: usize) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let state_dir = temp_dir.path().join("state");
        let data_path = temp_dir.path().join("churn.csv");
        ChurnDataGenerator::default().write_csv(&data_path, rows);

        Self {
            temp_dir,
            state_dir,
            data_path,
        }
    }

    /// Configuration pointing at this environment
    pub fn config(&self) -> ChurnlineConfig {
        let mut config = ChurnlineConfig::default();
        config.pipeline.data_path = self.data_path.clone();
        config.serving.state_dir = Some(self.state_dir.clone());
        config.serving.start_timeout = Duration::from_secs(5);
        config.serving.inference_timeout = Duration::from_secs(5);
        config
    }

    /// Registry reading and writing this environment's state directory
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        churnline::open_registry(&self.config()).expect("Failed to open registry")
    }

    /// Pipeline over the CSV source with an in-memory tracker
    pub fn pipeline(
        &self,
        registry: Arc<ServiceRegistry>,
    ) -> (TrainingPipeline, Arc<MemoryTracker>) {
        let tracker = Arc::new(MemoryTracker::new());
        let pipeline = TrainingPipeline::new(
            Arc::new(CsvDataSource::new()),
            tracker.clone(),
            registry,
            &self.config(),
        );
        (pipeline, tracker)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
