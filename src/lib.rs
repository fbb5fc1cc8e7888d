//! DeskPilot drives a desktop GUI by alternating between language-model
//! planning and concrete UI actions. An instruction is decomposed into a
//! dependency-ordered subtask queue; each subtask is executed one grounded
//! action per tick, with bounded replanning on failure.
//!
//! The caller owns the environment: it feeds an [`Observation`] into
//! [`Orchestrator::predict`], applies the returned [`AutomationCommand`]
//! with its own input driver, and supplies the next observation.

pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod grounding;
pub mod knowledge;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod trajectory;

pub use config::{load_config, AgentConfig};
pub use errors::{DeskPilotError, DeskPilotResult};
pub use grounding::command::{AutomationCommand, InputOp};
pub use grounding::snapshot::{Observation, SnapshotNode};
pub use orchestrator::{Orchestrator, PredictInfo};

/// Installs the default tracing subscriber for embedding applications.
/// Honors `RUST_LOG`; defaults to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env if present (ignore error if not found)
    let _ = dotenvy::dotenv();
}
