use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::DeskPilotResult;

/// Sentinel returned when no prior experience exists.
pub const NO_MEMORY: &str = "None";

/// Retrieval capability: the most similar prior instruction (or subtask
/// query key) and its recorded outcome text.
#[async_trait]
pub trait ExperienceRetriever: Send + Sync {
    async fn retrieve_narrative(&self, instruction: &str) -> DeskPilotResult<(String, String)>;
    async fn retrieve_episodic(&self, query_key: &str) -> DeskPilotResult<(String, String)>;
}

/// External embedding capability used for similarity search. Computing
/// embeddings is out of scope; the store only consumes them.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> DeskPilotResult<Vec<f32>>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Narrative (whole-task) and episodic (subtask) experience stores, one
/// JSON object per file mapping query key to summary text. Write-back is
/// idempotent: an existing key is never re-summarized.
pub struct JsonKnowledgeBase {
    narrative_path: PathBuf,
    episodic_path: PathBuf,
    embedder: Option<Arc<dyn Embedder>>,
}

impl JsonKnowledgeBase {
    pub fn new(root: Option<PathBuf>) -> Self {
        let root = root.unwrap_or_else(default_root);
        let _ = std::fs::create_dir_all(&root);
        Self {
            narrative_path: root.join("narrative_memory.json"),
            episodic_path: root.join("episodic_memory.json"),
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn has_narrative(&self, key: &str) -> bool {
        load_store(&self.narrative_path).contains_key(key)
    }

    pub fn has_episode(&self, key: &str) -> bool {
        load_store(&self.episodic_path).contains_key(key)
    }

    /// Persists a narrative summary unless the key already exists. Returns
    /// whether the entry was written.
    pub fn save_narrative(&self, key: &str, summary: &str) -> DeskPilotResult<bool> {
        save_if_absent(&self.narrative_path, key, summary)
    }

    /// Persists an episodic summary unless the key already exists.
    pub fn save_episode(&self, key: &str, summary: &str) -> DeskPilotResult<bool> {
        save_if_absent(&self.episodic_path, key, summary)
    }

    async fn best_match(
        &self,
        store: &BTreeMap<String, String>,
        query: &str,
    ) -> DeskPilotResult<(String, String)> {
        if store.is_empty() {
            return Ok((NO_MEMORY.into(), NO_MEMORY.into()));
        }
        // Similarity needs the external embedding capability; without it,
        // report no memory rather than guessing.
        let Some(embedder) = &self.embedder else {
            return Ok((NO_MEMORY.into(), NO_MEMORY.into()));
        };

        let query_vec = embedder.embed(query).await?;
        let mut best: Option<(f32, &str, &str)> = None;
        for (key, text) in store {
            let key_vec = embedder.embed(key).await?;
            let score = cosine_similarity(&query_vec, &key_vec);
            if best.map(|(s, _, _)| score > s).unwrap_or(true) {
                best = Some((score, key, text));
            }
        }
        match best {
            Some((score, key, text)) => {
                tracing::debug!(score, key, "retrieved prior experience");
                Ok((key.to_string(), text.to_string()))
            }
            None => Ok((NO_MEMORY.into(), NO_MEMORY.into())),
        }
    }
}

#[async_trait]
impl ExperienceRetriever for JsonKnowledgeBase {
    async fn retrieve_narrative(&self, instruction: &str) -> DeskPilotResult<(String, String)> {
        let store = load_store(&self.narrative_path);
        self.best_match(&store, instruction).await
    }

    async fn retrieve_episodic(&self, query_key: &str) -> DeskPilotResult<(String, String)> {
        let store = load_store(&self.episodic_path);
        self.best_match(&store, query_key).await
    }
}

/// Retriever that always reports no memory. Used when retrieval is
/// disabled.
pub struct NullRetriever;

#[async_trait]
impl ExperienceRetriever for NullRetriever {
    async fn retrieve_narrative(&self, _instruction: &str) -> DeskPilotResult<(String, String)> {
        Ok((NO_MEMORY.into(), NO_MEMORY.into()))
    }

    async fn retrieve_episodic(&self, _query_key: &str) -> DeskPilotResult<(String, String)> {
        Ok((NO_MEMORY.into(), NO_MEMORY.into()))
    }
}

fn load_store(path: &Path) -> BTreeMap<String, String> {
    // Missing or corrupt files are treated as empty stores.
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn save_if_absent(path: &Path, key: &str, summary: &str) -> DeskPilotResult<bool> {
    let mut store = load_store(path);
    if store.contains_key(key) {
        return Ok(false);
    }
    store.insert(key.to_string(), summary.to_string());
    let content = serde_json::to_string_pretty(&store)?;
    std::fs::write(path, content)?;
    tracing::debug!(path = %path.display(), key, "experience persisted");
    Ok(true)
}

fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deskpilot")
        .join("knowledge")
}
