//! Model training, evaluation and serving for churnline
//!
//! Provides:
//! - Model families and fitted model artifacts
//! - Regression metrics
//! - Prediction endpoints and the registry of deployed services
//! - The shared on-disk store of services and their running slots
//! - The HTTP prediction server

pub mod evaluation;
pub mod http;
pub mod model;
pub mod registry;
pub mod serving;
pub mod store;

pub use evaluation::Metric;
pub use http::{router, run_prediction_server, ServerState};
pub use model::{ModelKind, TrainedModel};
pub use registry::{
    DeployOptions, DeployOutcome, RegistryConfig, RegistryStatsSnapshot, ServiceRecord,
    ServiceRegistry, ServiceSummary,
};
pub use serving::{EndpointConfig, EndpointState, ModelEndpoint};
pub use store::{Lease, ServiceStore, StoredService, SERVICES_FILE};
