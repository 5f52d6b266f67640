// Deployment trigger

use tracing::info;

/// Whether a freshly evaluated model should replace the served one.
///
/// Strict comparison: a score equal to the threshold does not deploy, and a
/// NaN score never deploys.
pub fn should_deploy(score: f64, min_accuracy: f64) -> bool {
    let decision = score > min_accuracy;
    info!(score, min_accuracy, decision, "Deployment trigger evaluated");
    decision
}
