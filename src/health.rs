//! Health reporting for prediction endpoints.
//!
//! Endpoints report a [`ComponentHealth`]; the prediction server folds them
//! into a [`HealthResponse`] for its `/health` route.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Serving predictions.
    Healthy,
    /// Alive but not serving yet (warming up).
    Degraded,
    /// Stopped or failed.
    Unhealthy,
}

impl HealthStatus {
    /// Convert to HTTP status code.
    pub fn to_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded | HealthStatus::Unhealthy => 503,
        }
    }

    /// Combine two statuses (worst wins).
    pub fn combine(&self, other: &HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Health of a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Health status.
    pub status: HealthStatus,
    /// Optional message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Additional details.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

impl ComponentHealth {
    /// Create a healthy component.
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            details: HashMap::new(),
        }
    }

    /// Create a degraded component.
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            details: HashMap::new(),
        }
    }

    /// Create an unhealthy component.
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            details: HashMap::new(),
        }
    }

    /// Add detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Full health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Individual component checks.
    pub components: Vec<ComponentHealth>,
    /// Timestamp.
    pub timestamp: String,
}

impl HealthResponse {
    /// Create a new health response.
    pub fn new(version: impl Into<String>, start_time: Instant) -> Self {
        Self {
            status: HealthStatus::Healthy,
            version: version.into(),
            uptime_seconds: start_time.elapsed().as_secs(),
            components: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Add a component check.
    pub fn add_component(&mut self, component: ComponentHealth) {
        self.status = self.status.combine(&component.status);
        self.components.push(component);
    }

    /// Build response from components.
    pub fn with_components(mut self, components: Vec<ComponentHealth>) -> Self {
        for component in components {
            self.add_component(component);
        }
        self
    }
}
