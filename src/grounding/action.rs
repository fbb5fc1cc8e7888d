use serde::{Deserialize, Serialize};

/// The closed set of grounded actions the engine may request. Produced by
/// the executor's parser and translated into automation commands by the
/// grounding adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        element_id: usize,
        num_clicks: u32,
        button: String,
        hold_keys: Vec<String>,
    },
    Type {
        element_id: Option<usize>,
        text: String,
        overwrite: bool,
        enter: bool,
    },
    /// Launch an application or file through the system search box.
    Open { name: String },
    /// Bring an already-running application to the foreground.
    SwitchApplications { name: String },
    DragAndDrop {
        drag_from_id: usize,
        drop_on_id: usize,
        hold_keys: Vec<String>,
    },
    Scroll { element_id: usize, clicks: i32 },
    Hotkey { keys: Vec<String> },
    HoldAndPress {
        hold_keys: Vec<String>,
        press_keys: Vec<String>,
    },
    Wait { seconds: f32 },
    /// Append text to the cross-step notes buffer; never touches the UI.
    SaveToKnowledge { text: Vec<String> },
    Done,
    Fail,
}

impl Action {
    pub fn default_wait() -> Self {
        Action::Wait { seconds: 1.0 }
    }

    /// Compact textual form used for stuck detection and failure feedback.
    pub fn describe(&self) -> String {
        match self {
            Action::Click { element_id, .. } => format!("click({element_id})"),
            Action::Type { element_id, text, .. } => match element_id {
                Some(id) => format!("type({id}, {text:?})"),
                None => format!("type({text:?})"),
            },
            Action::Open { name } => format!("open({name:?})"),
            Action::SwitchApplications { name } => format!("switch_applications({name:?})"),
            Action::DragAndDrop { drag_from_id, drop_on_id, .. } => {
                format!("drag_and_drop({drag_from_id}, {drop_on_id})")
            }
            Action::Scroll { element_id, clicks } => format!("scroll({element_id}, {clicks})"),
            Action::Hotkey { keys } => format!("hotkey({})", keys.join("+")),
            Action::HoldAndPress { hold_keys, press_keys } => format!(
                "hold_and_press({}, {})",
                hold_keys.join("+"),
                press_keys.join("+")
            ),
            Action::Wait { seconds } => format!("wait({seconds})"),
            Action::SaveToKnowledge { .. } => "save_to_knowledge".into(),
            Action::Done => "done".into(),
            Action::Fail => "fail".into(),
        }
    }
}
