use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::DeskPilotResult;

/// One text box reported by an external recognizer, in absolute screen
/// coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub content: String,
}

impl TextBox {
    pub fn bbox(&self) -> [f32; 4] {
        [
            self.left as f32,
            self.top as f32,
            self.right as f32,
            self.bottom as f32,
        ]
    }
}

/// External OCR capability. The recognizer service itself is out of scope;
/// only the merge of its output into the element list is implemented here.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn detect(&self, screenshot: &[u8]) -> DeskPilotResult<Vec<TextBox>>;
}
