use serde::{Deserialize, Serialize};

/// One snapshot of UI state supplied by the caller each tick. Both fields are
/// optional; the grounding adapter degrades to an empty element list rather
/// than failing when either is missing or malformed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Observation {
    /// Accessibility tree rooted at the foreground window.
    pub tree: Option<SnapshotNode>,
    /// Raw screenshot bytes (PNG), forwarded to vision-capable engines.
    pub screenshot: Option<Vec<u8>>,
    /// Names of currently open applications, as reported by the caller.
    #[serde(default)]
    pub applications: Vec<String>,
    /// Name of the foreground application.
    #[serde(default)]
    pub foreground: Option<String>,
}

/// One node of the raw accessibility snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub role: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    /// Absolute screen coordinates of the top-left corner.
    pub position: (i32, i32),
    /// Width and height in pixels.
    pub size: (i32, i32),
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

/// One addressable UI control, flattened out of the snapshot. The index into
/// the adapter's element list is only valid for the observation that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiElement {
    pub role: String,
    pub title: String,
    pub text: String,
    pub position: (i32, i32),
    pub size: (i32, i32),
}

impl UiElement {
    /// Center point of the element in absolute screen coordinates.
    pub fn center(&self) -> (i32, i32) {
        (
            self.position.0 + self.size.0 / 2,
            self.position.1 + self.size.1 / 2,
        )
    }

    /// Bounding box as [xmin, ymin, xmax, ymax].
    pub fn bbox(&self) -> [f32; 4] {
        [
            self.position.0 as f32,
            self.position.1 as f32,
            (self.position.0 + self.size.0) as f32,
            (self.position.1 + self.size.1) as f32,
        ]
    }
}

/// Intersection-over-union of two axis-aligned boxes ([xmin, ymin, xmax,
/// ymax]). Degenerate unions and non-overlapping boxes yield 0.
pub fn bbox_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}
