pub mod action;
pub mod command;
pub mod ocr;
pub mod snapshot;

use std::sync::Arc;

use crate::config::GroundingConfig;
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::grounding::action::Action;
use crate::grounding::command::{normalize_key, AutomationCommand, InputOp, MouseButton};
use crate::grounding::ocr::TextRecognizer;
use crate::grounding::snapshot::{bbox_iou, Observation, SnapshotNode, UiElement};

/// Hotkeys suggested to the engine for common operations, so plans prefer
/// keyboard routes where one exists.
pub const HOTKEY_SUGGESTIONS: &[(&str, &[&str])] = &[
    ("save", &["ctrl", "s"]),
    ("copy", &["ctrl", "c"]),
    ("paste", &["ctrl", "v"]),
    ("cut", &["ctrl", "x"]),
    ("undo", &["ctrl", "z"]),
    ("find", &["ctrl", "f"]),
    ("select_all", &["ctrl", "a"]),
    ("new", &["ctrl", "n"]),
    ("close", &["ctrl", "w"]),
    ("quit", &["alt", "f4"]),
    ("switch_app", &["alt", "tab"]),
    ("refresh", &["f5"]),
];

/// Translates observations into an addressable element list and grounded
/// actions into concrete automation commands. Owns the cross-step notes
/// buffer. Element indices are tick-scoped: rebuilt on every `linearize`.
pub struct GroundingAdapter {
    config: GroundingConfig,
    recognizer: Option<Arc<dyn TextRecognizer>>,
    elements: Vec<UiElement>,
    index_out_of_range: bool,
    /// Scratch buffer for cross-step data ("notes"/clipboard).
    pub notes: Vec<String>,
}

impl GroundingAdapter {
    pub fn new(config: GroundingConfig) -> Self {
        Self {
            config,
            recognizer: None,
            elements: Vec::new(),
            index_out_of_range: false,
            notes: Vec::new(),
        }
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn TextRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Flattens the snapshot into the numbered element list and returns its
    /// textual linearization: a header row, then one tab-separated
    /// `id role title text` row per element. A missing or empty tree
    /// degrades to an empty string and an empty list.
    pub async fn linearize(&mut self, observation: &Observation) -> String {
        self.elements.clear();

        let Some(tree) = &observation.tree else {
            tracing::debug!("observation has no accessibility tree");
            return String::new();
        };

        let mut kept = Vec::new();
        collect_nodes(tree, &self.config.exclude_roles, &mut kept);

        // With some windows the exclusion list removes everything; retry
        // unfiltered so the caller always has at least one element.
        if kept.is_empty() {
            collect_nodes(tree, &[], &mut kept);
        }

        let mut rows = vec!["id\trole\ttitle\ttext".to_string()];
        for (idx, el) in kept.iter().enumerate() {
            rows.push(format!("{idx}\t{}\t{}\t{}", el.role, el.title, el.text));
        }

        self.elements = kept;

        if self.config.ocr {
            if let (Some(recognizer), Some(shot)) =
                (self.recognizer.clone(), observation.screenshot.as_deref())
            {
                self.merge_ocr_elements(recognizer.as_ref(), shot, &mut rows)
                    .await;
            }
        }

        tracing::debug!(elements = self.elements.len(), "snapshot linearized");
        rows.join("\n")
    }

    /// Appends recognizer text boxes that do not correspond to any known
    /// element (max IoU below the configured threshold) as synthetic Button
    /// elements.
    async fn merge_ocr_elements(
        &mut self,
        recognizer: &dyn TextRecognizer,
        screenshot: &[u8],
        rows: &mut Vec<String>,
    ) {
        let boxes = match recognizer.detect(screenshot).await {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(error = %e, "OCR detection failed, continuing without it");
                return;
            }
        };

        let tree_bboxes: Vec<[f32; 4]> = self.elements.iter().map(|e| e.bbox()).collect();

        for b in boxes {
            let max_iou = tree_bboxes
                .iter()
                .map(|t| bbox_iou(t, &b.bbox()))
                .fold(0.0f32, f32::max);
            if max_iou < self.config.ocr_iou_threshold {
                let idx = self.elements.len();
                rows.push(format!("{idx}\tButton\t\t{}", b.content));
                self.elements.push(UiElement {
                    role: "Button".into(),
                    title: String::new(),
                    text: b.content,
                    position: (b.left, b.top),
                    size: (b.right - b.left, b.bottom - b.top),
                });
            }
        }
    }

    pub fn elements(&self) -> &[UiElement] {
        &self.elements
    }

    /// Looks up an element by its tick-scoped index. An empty list is an
    /// error; an out-of-range index raises the out-of-range flag and falls
    /// back to element 0 so the caller can degrade rather than crash.
    pub fn find_element(&mut self, element_id: usize) -> DeskPilotResult<UiElement> {
        if self.elements.is_empty() {
            return Err(DeskPilotError::Grounding(
                "no elements in the current observation".into(),
            ));
        }
        match self.elements.get(element_id) {
            Some(el) => Ok(el.clone()),
            None => {
                tracing::warn!(element_id, len = self.elements.len(), "element index out of range");
                self.index_out_of_range = true;
                Ok(self.elements[0].clone())
            }
        }
    }

    /// Returns and clears the out-of-range flag. Consumed exactly once per
    /// downgraded action.
    pub fn take_out_of_range_flag(&mut self) -> bool {
        std::mem::take(&mut self.index_out_of_range)
    }

    pub fn active_applications(&self, observation: &Observation) -> Vec<String> {
        observation.applications.clone()
    }

    pub fn foreground_application(&self, observation: &Observation) -> String {
        observation.foreground.clone().unwrap_or_default()
    }

    /// Translates one grounded action into a concrete automation command
    /// addressed at element centers.
    pub fn translate(&mut self, action: &Action) -> DeskPilotResult<AutomationCommand> {
        let command = match action {
            Action::Click { element_id, num_clicks, button, hold_keys } => {
                let el = self.find_element(*element_id)?;
                let (x, y) = el.center();
                let holds: Vec<String> = hold_keys.iter().map(|k| normalize_key(k)).collect();
                let mut ops = Vec::new();
                for k in &holds {
                    ops.push(InputOp::KeyDown { key: k.clone() });
                }
                ops.push(InputOp::Click {
                    x,
                    y,
                    button: MouseButton::parse(button),
                    count: (*num_clicks).max(1),
                });
                for k in holds.iter().rev() {
                    ops.push(InputOp::KeyUp { key: k.clone() });
                }
                AutomationCommand::Ops { ops }
            }

            Action::Type { element_id, text, overwrite, enter } => {
                // A bad element reference falls back to typing at the
                // current cursor location.
                let target = element_id.and_then(|id| self.find_element(id).ok());
                let mut ops = Vec::new();
                if let Some(el) = target {
                    let (x, y) = el.center();
                    ops.push(InputOp::Click { x, y, button: MouseButton::Left, count: 1 });
                }
                if *overwrite {
                    ops.push(InputOp::KeyDown { key: "ctrl".into() });
                    ops.push(InputOp::Press { key: "a".into() });
                    ops.push(InputOp::KeyUp { key: "ctrl".into() });
                    ops.push(InputOp::Press { key: "backspace".into() });
                }
                ops.push(InputOp::TypeText { text: text.clone() });
                if *enter {
                    ops.push(InputOp::Press { key: "enter".into() });
                }
                AutomationCommand::Ops { ops }
            }

            Action::Open { name } | Action::SwitchApplications { name } => {
                AutomationCommand::Ops { ops: search_launch_ops(name) }
            }

            Action::DragAndDrop { drag_from_id, drop_on_id, hold_keys } => {
                let from = self.find_element(*drag_from_id)?;
                let to = self.find_element(*drop_on_id)?;
                let (x1, y1) = from.center();
                let (x2, y2) = to.center();
                let holds: Vec<String> = hold_keys.iter().map(|k| normalize_key(k)).collect();
                let mut ops = vec![InputOp::MoveTo { x: x1, y: y1 }];
                for k in &holds {
                    ops.push(InputOp::KeyDown { key: k.clone() });
                }
                ops.push(InputOp::DragTo { x: x2, y: y2 });
                for k in holds.iter().rev() {
                    ops.push(InputOp::KeyUp { key: k.clone() });
                }
                AutomationCommand::Ops { ops }
            }

            Action::Scroll { element_id, clicks } => {
                let el = match self.find_element(*element_id) {
                    Ok(el) => el,
                    Err(_) => self.find_element(0)?,
                };
                let (x, y) = el.center();
                AutomationCommand::Ops {
                    ops: vec![
                        InputOp::MoveTo { x, y },
                        InputOp::Scroll { x, y, clicks: *clicks },
                    ],
                }
            }

            Action::Hotkey { keys } => {
                let keys: Vec<String> = keys.iter().map(|k| normalize_key(k)).collect();
                let mut ops = Vec::new();
                for k in &keys {
                    ops.push(InputOp::KeyDown { key: k.clone() });
                }
                for k in keys.iter().rev() {
                    ops.push(InputOp::KeyUp { key: k.clone() });
                }
                AutomationCommand::Ops { ops }
            }

            Action::HoldAndPress { hold_keys, press_keys } => {
                let holds: Vec<String> = hold_keys.iter().map(|k| normalize_key(k)).collect();
                let presses: Vec<String> = press_keys.iter().map(|k| normalize_key(k)).collect();
                let mut ops = Vec::new();
                for k in &holds {
                    ops.push(InputOp::KeyDown { key: k.clone() });
                }
                for k in &presses {
                    ops.push(InputOp::Press { key: k.clone() });
                }
                for k in holds.iter().rev() {
                    ops.push(InputOp::KeyUp { key: k.clone() });
                }
                AutomationCommand::Ops { ops }
            }

            Action::Wait { seconds } => AutomationCommand::Wait { seconds: *seconds },

            Action::SaveToKnowledge { text } => {
                self.notes.extend(text.iter().cloned());
                AutomationCommand::Wait { seconds: 0.0 }
            }

            Action::Done => AutomationCommand::Done,
            Action::Fail => AutomationCommand::Fail,
        };
        Ok(command)
    }
}

/// Pre-order traversal keeping elements with positive size, non-negative
/// coordinates, and a role outside the exclusion set.
fn collect_nodes(node: &SnapshotNode, exclude_roles: &[String], out: &mut Vec<UiElement>) {
    let excluded = exclude_roles.iter().any(|r| r == &node.role);
    if !excluded {
        let (x, y) = node.position;
        let (w, h) = node.size;
        if x >= 0 && y >= 0 && w > 0 && h > 0 {
            out.push(UiElement {
                role: node.role.clone(),
                title: node.title.clone(),
                text: node.text.clone(),
                position: node.position,
                size: node.size,
            });
        }
    }
    for child in &node.children {
        collect_nodes(child, exclude_roles, out);
    }
}

/// Key sequence that opens the system search box, types the target name,
/// and confirms.
fn search_launch_ops(name: &str) -> Vec<InputOp> {
    vec![
        InputOp::KeyDown { key: "win".into() },
        InputOp::Press { key: "s".into() },
        InputOp::KeyUp { key: "win".into() },
        InputOp::Sleep { seconds: 0.5 },
        InputOp::TypeText { text: name.to_string() },
        InputOp::Press { key: "enter".into() },
        InputOp::Sleep { seconds: 1.0 },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grounding::ocr::TextBox;
    use async_trait::async_trait;

    fn leaf(role: &str, title: &str, pos: (i32, i32), size: (i32, i32)) -> SnapshotNode {
        SnapshotNode {
            role: role.into(),
            title: title.into(),
            text: String::new(),
            position: pos,
            size,
            children: Vec::new(),
        }
    }

    fn sample_tree() -> SnapshotNode {
        SnapshotNode {
            role: "Window".into(),
            title: "Editor".into(),
            text: String::new(),
            position: (0, 0),
            size: (800, 600),
            children: vec![
                SnapshotNode {
                    role: "Pane".into(),
                    title: String::new(),
                    text: String::new(),
                    position: (0, 0),
                    size: (800, 600),
                    children: vec![
                        leaf("Button", "Save", (10, 10), (80, 30)),
                        leaf("Edit", "Body", (10, 50), (700, 400)),
                        // zero-size nodes are dropped
                        leaf("Button", "Ghost", (10, 90), (0, 0)),
                        // off-screen nodes are dropped
                        leaf("Button", "Offscreen", (-50, 10), (80, 30)),
                    ],
                },
            ],
        }
    }

    fn observation() -> Observation {
        Observation {
            tree: Some(sample_tree()),
            screenshot: None,
            applications: vec!["editor.exe".into()],
            foreground: Some("editor.exe".into()),
        }
    }

    fn adapter() -> GroundingAdapter {
        GroundingAdapter::new(GroundingConfig::default())
    }

    #[tokio::test]
    async fn linearize_numbers_elements_in_preorder() {
        let mut g = adapter();
        let text = g.linearize(&observation()).await;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "id\trole\ttitle\ttext");
        assert!(lines[1].starts_with("0\tWindow\tEditor"));
        assert!(lines[2].starts_with("1\tButton\tSave"));
        assert!(lines[3].starts_with("2\tEdit\tBody"));
        // Pane excluded, ghost and offscreen filtered
        assert_eq!(g.elements().len(), 3);
    }

    #[tokio::test]
    async fn exclusion_yielding_empty_list_retries_unfiltered() {
        let mut g = adapter();
        let obs = Observation {
            tree: Some(leaf("Pane", "Only", (0, 0), (100, 100))),
            ..Default::default()
        };
        g.linearize(&obs).await;
        assert_eq!(g.elements().len(), 1);
        assert_eq!(g.elements()[0].role, "Pane");
    }

    #[tokio::test]
    async fn missing_tree_degrades_to_empty() {
        let mut g = adapter();
        let text = g.linearize(&Observation::default()).await;
        assert!(text.is_empty());
        assert!(g.elements().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_returns_element_zero_and_flags_once() {
        let mut g = adapter();
        g.linearize(&observation()).await;
        let el = g.find_element(99).unwrap();
        assert_eq!(el.title, "Editor");
        assert!(g.take_out_of_range_flag());
        // consumed exactly once
        assert!(!g.take_out_of_range_flag());
    }

    #[tokio::test]
    async fn find_on_empty_list_is_an_error() {
        let mut g = adapter();
        assert!(g.find_element(0).is_err());
    }

    #[tokio::test]
    async fn click_targets_element_center_with_hold_keys() {
        let mut g = adapter();
        g.linearize(&observation()).await;
        let cmd = g
            .translate(&Action::Click {
                element_id: 1,
                num_clicks: 2,
                button: "left".into(),
                hold_keys: vec!["control".into()],
            })
            .unwrap();
        let AutomationCommand::Ops { ops } = cmd else {
            panic!("expected ops")
        };
        assert_eq!(ops[0], InputOp::KeyDown { key: "ctrl".into() });
        assert_eq!(
            ops[1],
            InputOp::Click { x: 50, y: 25, button: MouseButton::Left, count: 2 }
        );
        assert_eq!(ops[2], InputOp::KeyUp { key: "ctrl".into() });
    }

    #[tokio::test]
    async fn save_to_knowledge_fills_notes_and_yields_wait() {
        let mut g = adapter();
        g.linearize(&observation()).await;
        let cmd = g
            .translate(&Action::SaveToKnowledge { text: vec!["invoice 42".into()] })
            .unwrap();
        assert_eq!(cmd, AutomationCommand::Wait { seconds: 0.0 });
        assert_eq!(g.notes, vec!["invoice 42"]);
    }

    #[tokio::test]
    async fn hotkey_releases_in_reverse_order() {
        let mut g = adapter();
        g.linearize(&observation()).await;
        let cmd = g
            .translate(&Action::Hotkey { keys: vec!["ctrl".into(), "s".into()] })
            .unwrap();
        let AutomationCommand::Ops { ops } = cmd else {
            panic!("expected ops")
        };
        assert_eq!(
            ops,
            vec![
                InputOp::KeyDown { key: "ctrl".into() },
                InputOp::KeyDown { key: "s".into() },
                InputOp::KeyUp { key: "s".into() },
                InputOp::KeyUp { key: "ctrl".into() },
            ]
        );
    }

    struct FixedRecognizer(Vec<TextBox>);

    #[async_trait]
    impl TextRecognizer for FixedRecognizer {
        async fn detect(&self, _screenshot: &[u8]) -> crate::errors::DeskPilotResult<Vec<TextBox>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn ocr_box_added_only_when_iou_below_threshold() {
        let config = GroundingConfig { ocr: true, ..Default::default() };
        let recognizer = FixedRecognizer(vec![
            // overlaps the Save button almost exactly -> skipped
            TextBox { left: 10, top: 10, right: 90, bottom: 40, content: "Save".into() },
            // novel text -> appended as synthetic Button
            TextBox { left: 500, top: 500, right: 560, bottom: 520, content: "Later".into() },
        ]);
        let mut g = GroundingAdapter::new(config).with_recognizer(Arc::new(recognizer));
        let obs = Observation {
            screenshot: Some(vec![0u8; 8]),
            ..observation()
        };
        let text = g.linearize(&obs).await;
        assert_eq!(g.elements().len(), 4);
        let last = g.elements().last().unwrap();
        assert_eq!(last.role, "Button");
        assert_eq!(last.text, "Later");
        assert!(text.lines().last().unwrap().contains("Later"));
    }
}
