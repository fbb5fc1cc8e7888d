use serde::{Deserialize, Serialize};

/// One primitive OS input operation, addressed by absolute screen
/// coordinates. DeskPilot only describes these; a caller-side driver
/// executes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InputOp {
    MoveTo { x: i32, y: i32 },
    Click { x: i32, y: i32, button: MouseButton, count: u32 },
    /// Press at the current position, move to (x, y), release.
    DragTo { x: i32, y: i32 },
    TypeText { text: String },
    KeyDown { key: String },
    KeyUp { key: String },
    Press { key: String },
    Scroll { x: i32, y: i32, clicks: i32 },
    Sleep { seconds: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    pub fn parse(token: &str) -> Self {
        match token {
            "middle" => MouseButton::Middle,
            "right" => MouseButton::Right,
            _ => MouseButton::Left,
        }
    }
}

/// What the control loop hands the caller each tick: one input sequence, a
/// wait, a skip, or a terminal sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutomationCommand {
    Ops { ops: Vec<InputOp> },
    Wait { seconds: f32 },
    /// Skip this tick without touching the environment.
    Next,
    Done,
    Fail,
}

impl AutomationCommand {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AutomationCommand::Done | AutomationCommand::Fail)
    }
}

/// Maps generic modifier tokens to the names the input layer expects.
pub fn normalize_key(key: &str) -> String {
    let key = key.trim().to_lowercase();
    match key.as_str() {
        "control" => "ctrl".into(),
        "command" | "meta" | "super" => "win".into(),
        "return" => "enter".into(),
        _ => key,
    }
}
