//! Strict parser turning engine response text into one grounded action.
//!
//! The engine is instructed to end its response with a line like
//! `Grounded Action: click(3, num_clicks=2)`. The parser accepts positional
//! and keyword arguments, quoted strings, numbers, booleans, None, and flat
//! lists. Anything it cannot understand yields `None`, which the executor
//! substitutes with a short wait; model text is never evaluated.

use regex::Regex;
use std::sync::OnceLock;

use crate::grounding::action::Action;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    None,
}

impl Value {
    fn as_usize(&self) -> Option<usize> {
        match self {
            Value::Int(i) if *i >= 0 => Some(*i as usize),
            _ => None,
        }
    }

    fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i as i32),
            _ => None,
        }
    }

    fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(f) => Some(*f as f32),
            Value::Int(i) => Some(*i as f32),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn as_str_list(&self) -> Option<Vec<String>> {
        match self {
            Value::List(items) => items.iter().map(Value::as_str).collect(),
            // A bare string is accepted where a single-element list is meant.
            Value::Str(s) => Some(vec![s.clone()]),
            _ => None,
        }
    }
}

struct Args {
    positional: Vec<Value>,
    keyword: Vec<(String, Value)>,
}

impl Args {
    fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.keyword
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
            .or_else(|| self.positional.get(index))
    }
}

/// Extracts one executable action call from the response text, preferring
/// the section after the last `Grounded Action` marker.
pub fn parse_grounded_action(response: &str) -> Option<Action> {
    let segment = response
        .rsplit_once("Grounded Action")
        .map(|(_, after)| after)
        .unwrap_or(response);

    let (name, args_text) = find_call(segment)?;
    let args = parse_args(&args_text)?;
    build_action(&name, &args)
}

fn call_start_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:agent\.)?\b(click|type|open|switch_applications|drag_and_drop|scroll|hotkey|hold_and_press|wait|save_to_knowledge|done|fail)\s*\(",
        )
        .unwrap()
    })
}

/// Finds the first known action name followed by a balanced argument list.
fn find_call(text: &str) -> Option<(String, String)> {
    let m = call_start_regex().captures(text)?;
    let name = m.get(1)?.as_str().to_string();
    let open = m.get(0)?.end();

    let mut depth = 1usize;
    let mut in_quote: Option<char> = None;
    for (offset, ch) in text[open..].char_indices() {
        match in_quote {
            Some(q) => {
                if ch == q {
                    in_quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => in_quote = Some(ch),
                '(' | '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((name, text[open..open + offset].to_string()));
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Splits the argument text at top-level commas and parses each piece as a
/// positional or `key=value` argument.
fn parse_args(text: &str) -> Option<Args> {
    let mut args = Args { positional: Vec::new(), keyword: Vec::new() };
    for piece in split_top_level(text) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if let Some((key, value_text)) = split_kwarg(piece) {
            args.keyword.push((key, parse_value(&value_text)?));
        } else {
            if !args.keyword.is_empty() {
                // positional after keyword is malformed
                return None;
            }
            args.positional.push(parse_value(piece)?);
        }
    }
    Some(args)
}

fn split_top_level(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote: Option<char> = None;
    for ch in text.chars() {
        match in_quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    in_quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => {
                    in_quote = Some(ch);
                    current.push(ch);
                }
                '[' | '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ']' | ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(ch);
                }
                ',' if depth == 0 => {
                    pieces.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            },
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current);
    }
    pieces
}

fn split_kwarg(piece: &str) -> Option<(String, String)> {
    let eq = piece.find('=')?;
    let key = piece[..eq].trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_string(), piece[eq + 1..].trim().to_string()))
}

fn parse_value(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text {
        "None" | "null" => return Some(Value::None),
        "True" | "true" => return Some(Value::Bool(true)),
        "False" | "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Some(stripped) = strip_quotes(text) {
        return Some(Value::Str(stripped));
    }
    if text.starts_with('[') && text.ends_with(']') {
        let inner = &text[1..text.len() - 1];
        let items = split_top_level(inner)
            .iter()
            .map(|p| parse_value(p))
            .collect::<Option<Vec<_>>>()?;
        return Some(Value::List(items));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::Int(i));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Some(Value::Float(f));
    }
    None
}

fn strip_quotes(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    if text.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[text.len() - 1] == bytes[0]
    {
        Some(text[1..text.len() - 1].to_string())
    } else {
        None
    }
}

fn build_action(name: &str, args: &Args) -> Option<Action> {
    let action = match name {
        "click" => Action::Click {
            element_id: args.get(0, "element_id")?.as_usize()?,
            num_clicks: args
                .get(1, "num_clicks")
                .map_or(Some(1), |v| v.as_usize().map(|n| n as u32))?,
            button: args
                .get(2, "button")
                .map_or(Some("left".into()), Value::as_str)?,
            hold_keys: args
                .get(3, "hold_keys")
                .map_or(Some(Vec::new()), Value::as_str_list)?,
        },
        "type" => {
            // The first positional may be the element id or the text.
            let (element_id, text_index) = match args.get(0, "element_id") {
                Some(Value::None) | None => (None, 0),
                Some(v) => match v.as_usize() {
                    Some(id) => (Some(id), 1),
                    None => (None, 0),
                },
            };
            Action::Type {
                element_id,
                text: args
                    .get(text_index, "text")
                    .map_or(Some(String::new()), Value::as_str)?,
                overwrite: args
                    .get(text_index + 1, "overwrite")
                    .map_or(Some(false), Value::as_bool)?,
                enter: args
                    .get(text_index + 2, "enter")
                    .map_or(Some(false), Value::as_bool)?,
            }
        }
        "open" => Action::Open { name: args.get(0, "name").or_else(|| args.get(0, "app_or_file_name"))?.as_str()? },
        "switch_applications" => Action::SwitchApplications {
            name: args.get(0, "name").or_else(|| args.get(0, "app_or_file_name"))?.as_str()?,
        },
        "drag_and_drop" => Action::DragAndDrop {
            drag_from_id: args.get(0, "drag_from_id")?.as_usize()?,
            drop_on_id: args.get(1, "drop_on_id")?.as_usize()?,
            hold_keys: args
                .get(2, "hold_keys")
                .map_or(Some(Vec::new()), Value::as_str_list)?,
        },
        "scroll" => Action::Scroll {
            element_id: args.get(0, "element_id")?.as_usize()?,
            clicks: args.get(1, "clicks")?.as_i32()?,
        },
        "hotkey" => Action::Hotkey {
            keys: match args.get(0, "keys") {
                Some(v) if args.positional.len() <= 1 => v.as_str_list()?,
                // varargs form: hotkey("ctrl", "s")
                _ => args
                    .positional
                    .iter()
                    .map(Value::as_str)
                    .collect::<Option<Vec<_>>>()?,
            },
        },
        "hold_and_press" => Action::HoldAndPress {
            hold_keys: args.get(0, "hold_keys")?.as_str_list()?,
            press_keys: args.get(1, "press_keys")?.as_str_list()?,
        },
        "wait" => Action::Wait {
            seconds: args.get(0, "time").or_else(|| args.get(0, "seconds"))?.as_f32()?,
        },
        "save_to_knowledge" => Action::SaveToKnowledge {
            text: args.get(0, "text")?.as_str_list()?,
        },
        "done" => Action::Done,
        "fail" => Action::Fail,
        _ => return None,
    };
    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_click_with_defaults() {
        let action = parse_grounded_action("Grounded Action: click(3)").unwrap();
        assert_eq!(
            action,
            Action::Click {
                element_id: 3,
                num_clicks: 1,
                button: "left".into(),
                hold_keys: vec![],
            }
        );
    }

    #[test]
    fn parses_keyword_arguments_and_lists() {
        let action = parse_grounded_action(
            "I will save first.\nGrounded Action: click(element_id=7, num_clicks=2, button=\"right\", hold_keys=[\"ctrl\", \"shift\"])",
        )
        .unwrap();
        assert_eq!(
            action,
            Action::Click {
                element_id: 7,
                num_clicks: 2,
                button: "right".into(),
                hold_keys: vec!["ctrl".into(), "shift".into()],
            }
        );
    }

    #[test]
    fn parses_type_with_and_without_element() {
        let with_el =
            parse_grounded_action("Grounded Action: type(element_id=2, text=\"hello, world\", enter=True)")
                .unwrap();
        assert_eq!(
            with_el,
            Action::Type {
                element_id: Some(2),
                text: "hello, world".into(),
                overwrite: false,
                enter: true,
            }
        );

        let without = parse_grounded_action("Grounded Action: type(text=\"abc\")").unwrap();
        assert_eq!(
            without,
            Action::Type { element_id: None, text: "abc".into(), overwrite: false, enter: false }
        );
    }

    #[test]
    fn parses_agent_prefixed_calls_inside_code_fences() {
        let response = "```python\nagent.hotkey([\"ctrl\", \"s\"])\n```";
        assert_eq!(
            parse_grounded_action(response).unwrap(),
            Action::Hotkey { keys: vec!["ctrl".into(), "s".into()] }
        );
    }

    #[test]
    fn parses_varargs_hotkey() {
        assert_eq!(
            parse_grounded_action("hotkey('alt', 'tab')").unwrap(),
            Action::Hotkey { keys: vec!["alt".into(), "tab".into()] }
        );
    }

    #[test]
    fn parses_terminals_and_wait() {
        assert_eq!(parse_grounded_action("Grounded Action: done()").unwrap(), Action::Done);
        assert_eq!(parse_grounded_action("fail()").unwrap(), Action::Fail);
        assert_eq!(
            parse_grounded_action("wait(1.5)").unwrap(),
            Action::Wait { seconds: 1.5 }
        );
    }

    #[test]
    fn takes_the_call_after_the_last_marker() {
        let response = "Earlier I considered click(1).\n\
                        Grounded Action: scroll(4, -3)";
        assert_eq!(
            parse_grounded_action(response).unwrap(),
            Action::Scroll { element_id: 4, clicks: -3 }
        );
    }

    #[test]
    fn commas_inside_quotes_do_not_split_arguments() {
        let action =
            parse_grounded_action("type(text=\"first, second, third\")").unwrap();
        assert_eq!(
            action,
            Action::Type {
                element_id: None,
                text: "first, second, third".into(),
                overwrite: false,
                enter: false,
            }
        );
    }

    #[test]
    fn malformed_input_yields_none() {
        assert!(parse_grounded_action("I could not decide on an action.").is_none());
        assert!(parse_grounded_action("click(not_a_number)").is_none());
        assert!(parse_grounded_action("frobnicate(3)").is_none());
        assert!(parse_grounded_action("click(").is_none());
    }
}
