use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub grounding: GroundingConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

/// Which transport adapter to use for the engine. Selected explicitly in
/// config, never inferred from the model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub provider: ProviderKind,
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Use SSE streaming for OpenAI-compatible endpoints; the full response is
    /// still accumulated before it is returned.
    #[serde(default)]
    pub stream: bool,
    /// Whether the model accepts image content. Image parts are silently
    /// dropped from messages when false.
    #[serde(default = "default_true")]
    pub vision: bool,
    /// Optional API key stored in config.toml (falls back to the env var
    /// DESKPILOT_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenaiCompatible,
            api_base: String::new(),
            model: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream: false,
            vision: true,
            api_key: None,
        }
    }
}

impl EngineConfig {
    /// Resolves the API key: environment variable first, config value second.
    pub fn resolve_api_key(&self) -> String {
        std::env::var("DESKPILOT_API_KEY")
            .unwrap_or_else(|_| self.api_key.clone().unwrap_or_default())
    }
}

/// Safety bounds for the control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard ceiling on cumulative ticks for one instruction.
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps: u32,
    /// Steps per subtask before it is force-completed.
    #[serde(default = "default_max_subtask_steps")]
    pub max_subtask_steps: u32,
    /// Planning attempts before the loop gives up.
    #[serde(default = "default_max_plan_attempts")]
    pub max_plan_attempts: u32,
    /// Inner-loop iterations per tick.
    #[serde(default = "default_max_inner_loops")]
    pub max_inner_loops: u32,
    /// (user, assistant) exchange pairs kept in executor message history.
    #[serde(default = "default_max_trajectory_length")]
    pub max_trajectory_length: usize,
    /// Consecutive actions inspected for stuck patterns.
    #[serde(default = "default_stuck_window")]
    pub stuck_window: usize,
    /// Rolling action/state records kept for stuck detection.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_total_steps: default_max_total_steps(),
            max_subtask_steps: default_max_subtask_steps(),
            max_plan_attempts: default_max_plan_attempts(),
            max_inner_loops: default_max_inner_loops(),
            max_trajectory_length: default_max_trajectory_length(),
            stuck_window: default_stuck_window(),
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingConfig {
    /// Merge externally detected OCR text boxes into the element list.
    #[serde(default)]
    pub ocr: bool,
    /// An OCR box is added only if its max IoU against known elements is
    /// below this threshold.
    #[serde(default = "default_ocr_iou_threshold")]
    pub ocr_iou_threshold: f32,
    /// Structural roles skipped during traversal.
    #[serde(default = "default_exclude_roles")]
    pub exclude_roles: Vec<String>,
    /// Linearized rows folded into the UI-state signature.
    #[serde(default = "default_signature_rows")]
    pub signature_rows: usize,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            ocr: false,
            ocr_iou_threshold: default_ocr_iou_threshold(),
            exclude_roles: default_exclude_roles(),
            signature_rows: default_signature_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeConfig {
    /// Root directory for narrative/episodic stores. Defaults to the platform
    /// data directory when unset.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Retrieve prior experience during planning and execution.
    #[serde(default = "default_true")]
    pub enable_retrieval: bool,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_max_total_steps() -> u32 {
    50
}

fn default_max_subtask_steps() -> u32 {
    15
}

fn default_max_plan_attempts() -> u32 {
    3
}

fn default_max_inner_loops() -> u32 {
    10
}

fn default_max_trajectory_length() -> usize {
    8
}

fn default_stuck_window() -> usize {
    3
}

fn default_history_window() -> usize {
    10
}

fn default_ocr_iou_threshold() -> f32 {
    0.1
}

fn default_exclude_roles() -> Vec<String> {
    vec!["Pane".into(), "Group".into(), "Unknown".into()]
}

fn default_signature_rows() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn resolve_config_path() -> DeskPilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(DeskPilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config() -> DeskPilotResult<AgentConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config: AgentConfig = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), model = %config.engine.model, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AgentConfig) -> DeskPilotResult<()> {
    let path = resolve_config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
