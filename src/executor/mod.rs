pub mod parser;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::engine::provider::LanguageModel;
use crate::engine::types::{Message, MessageHistory};
use crate::errors::DeskPilotResult;
use crate::grounding::action::Action;
use crate::grounding::command::AutomationCommand;
use crate::grounding::snapshot::Observation;
use crate::grounding::GroundingAdapter;
use crate::knowledge::{ExperienceRetriever, NO_MEMORY};
use crate::planner::dag::Subtask;
use crate::prompts;

/// One executor tick: the grounded action the engine chose, its concrete
/// translation, and the raw response it came from.
#[derive(Debug, Clone)]
pub struct ExecutorStep {
    pub action: Action,
    pub command: AutomationCommand,
    pub response: String,
    pub reflection: Option<String>,
}

/// Per-subtask executor: maintains bounded short-term state (message
/// history, recent actions, recent UI-state signatures) and requests exactly
/// one grounded action per tick.
pub struct Executor {
    engine: Arc<dyn LanguageModel>,
    retriever: Arc<dyn ExperienceRetriever>,
    temperature: f32,
    max_tokens: u32,
    max_trajectory_length: usize,
    stuck_window: usize,
    history_window: usize,
    signature_rows: usize,
    enable_reflection: bool,
    generator: MessageHistory,
    reflector: MessageHistory,
    turn_count: u32,
    response_history: Vec<String>,
    reflections: Vec<String>,
    previous_actions: VecDeque<String>,
    previous_states: VecDeque<String>,
}

impl Executor {
    pub fn new(
        engine: Arc<dyn LanguageModel>,
        retriever: Arc<dyn ExperienceRetriever>,
        config: &AgentConfig,
    ) -> Self {
        let max_pairs = config.limits.max_trajectory_length;
        Self {
            engine,
            retriever,
            temperature: config.engine.temperature,
            max_tokens: config.engine.max_tokens,
            max_trajectory_length: max_pairs,
            stuck_window: config.limits.stuck_window,
            history_window: config.limits.history_window,
            signature_rows: config.grounding.signature_rows,
            enable_reflection: true,
            generator: MessageHistory::new(prompts::EXECUTOR_PROMPT, max_pairs),
            reflector: MessageHistory::new(prompts::REFLECTION_PROMPT, max_pairs),
            turn_count: 0,
            response_history: Vec::new(),
            reflections: Vec::new(),
            previous_actions: VecDeque::new(),
            previous_states: VecDeque::new(),
        }
    }

    pub fn set_reflection(&mut self, enabled: bool) {
        self.enable_reflection = enabled;
    }

    /// Clears all per-subtask state. Called whenever the active subtask
    /// changes.
    pub fn reset(&mut self) {
        self.generator = MessageHistory::new(prompts::EXECUTOR_PROMPT, self.max_trajectory_length);
        self.reflector = MessageHistory::new(prompts::REFLECTION_PROMPT, self.max_trajectory_length);
        self.turn_count = 0;
        self.response_history.clear();
        self.reflections.clear();
        self.previous_actions.clear();
        self.previous_states.clear();
    }

    pub fn recent_actions(&self) -> Vec<String> {
        self.previous_actions.iter().cloned().collect()
    }

    /// Requests one grounded action for the active subtask.
    pub async fn next_action(
        &mut self,
        grounding: &mut GroundingAdapter,
        instruction: &str,
        subtask: &Subtask,
        future_tasks: &[Subtask],
        done_tasks: &[Subtask],
        observation: &Observation,
    ) -> DeskPilotResult<ExecutorStep> {
        if self.turn_count == 0 {
            self.prepare_system_prompt(instruction, subtask, future_tasks, done_tasks)
                .await;
        }

        let reflection = if self.enable_reflection && self.turn_count > 0 {
            self.reflect(subtask).await
        } else {
            None
        };

        let tree = grounding.linearize(observation).await;
        let current_state = state_signature(&tree, self.signature_rows);
        let progress_made = self.progress_made(&current_state);

        let mut request = String::new();
        if let Some(reflection) = &reflection {
            request.push_str(&format!("Reflection on previous trajectory: {reflection}\n"));
        }
        if !progress_made && !self.previous_actions.is_empty() {
            let recent: Vec<&String> = self.previous_actions.iter().rev().take(3).collect();
            request.push_str(&format!(
                "WARNING: No progress detected in recent actions. Consider alternative \
                 approaches.\nLast actions: {recent:?}\nSuggestion: {}\n",
                suggest_alternative(self.previous_actions.back().map(String::as_str).unwrap_or("")),
            ));
        }
        request.push_str(&format!(
            "Accessibility Tree: {tree}\n\
             Text Buffer = [{}].\n\
             The current open applications are {:?} and the active app is {}.\n\
             Progress Status: {}\n",
            grounding.notes.join(","),
            grounding.active_applications(observation),
            grounding.foreground_application(observation),
            if progress_made {
                "Making progress"
            } else {
                "No recent progress - consider alternative approach"
            },
        ));
        if self.turn_count == 0 {
            request.push_str(&format!(
                "Remember, only complete the subtask: {}\n\
                 You can use this extra information for completing it: {}.\n",
                subtask.name, subtask.info
            ));
        }

        let message = match (&observation.screenshot, self.engine.supports_vision()) {
            (Some(shot), true) => Message::user_with_image(request, shot),
            _ => Message::user(request),
        };
        self.generator.push(message);

        // Transport failures are retried inside the provider; if the budget
        // is exhausted the tick degrades to a wait instead of aborting the
        // instruction.
        let response = match self
            .engine
            .generate(&self.generator.as_messages(), self.temperature, self.max_tokens)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "executor engine call failed, degrading to wait");
                String::new()
            }
        };
        self.generator.push(Message::assistant(response.clone()));
        self.response_history.push(response.clone());

        // Unparsable output degrades to a short wait; model text is never
        // evaluated.
        let mut action = parser::parse_grounded_action(&response).unwrap_or_else(|| {
            tracing::warn!("no executable action in response, substituting wait");
            Action::default_wait()
        });

        let mut command = match grounding.translate(&action) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "action translation failed, substituting wait");
                action = Action::default_wait();
                AutomationCommand::Wait { seconds: 1.0 }
            }
        };

        // A stale element reference downgrades this action to a wait; the
        // flag is consumed exactly once.
        if grounding.take_out_of_range_flag() {
            tracing::warn!(action = %action.describe(), "out-of-range element, downgrading to wait");
            action = Action::default_wait();
            command = AutomationCommand::Wait { seconds: 1.0 };
        }

        if self.is_stuck(&action.describe()) {
            tracing::warn!(action = %action.describe(), "action extends a stuck pattern");
        }

        push_bounded(&mut self.previous_actions, action.describe(), self.history_window);
        push_bounded(&mut self.previous_states, current_state, self.history_window);
        self.turn_count += 1;

        tracing::info!(
            subtask = %subtask.name,
            action = %action.describe(),
            turn = self.turn_count,
            "executor action selected"
        );

        Ok(ExecutorStep { action, command, response, reflection })
    }

    /// Builds the subtask-scoped system prompt, folding in the most similar
    /// prior subtask experience when one exists.
    async fn prepare_system_prompt(
        &mut self,
        instruction: &str,
        subtask: &Subtask,
        future_tasks: &[Subtask],
        done_tasks: &[Subtask],
    ) {
        let query_key = format!(
            "Task:\n{instruction}\n\nSubtask: {}\nSubtask Instruction: {}",
            subtask.name, subtask.info
        );
        let mut task_description = instruction.to_string();
        let (similar, experience) = match self.retriever.retrieve_episodic(&query_key).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "episodic retrieval failed, continuing without it");
                (NO_MEMORY.into(), NO_MEMORY.into())
            }
        };
        if experience != NO_MEMORY && !experience.trim().is_empty() {
            tracing::info!(similar = %similar, "similar subtask experience found");
            task_description.push_str(&format!(
                "\nYou may refer to similar subtask experience if useful: {experience}"
            ));
        }

        let future: Vec<&str> = future_tasks.iter().map(|t| t.name.as_str()).collect();
        let done: Vec<&str> = done_tasks.iter().map(|t| t.name.as_str()).collect();
        let system = prompts::EXECUTOR_PROMPT
            .replace("CURRENT_OS", std::env::consts::OS)
            .replace("TASK_DESCRIPTION", &task_description)
            .replace("SUBTASK_DESCRIPTION", &subtask.name)
            .replace("FUTURE_TASKS", &future.join(", "))
            .replace("DONE_TASKS", &done.join(", "))
            .replace("HOTKEY_SUGGESTIONS", &prompts::hotkey_suggestions_line());
        self.generator.set_system(system);
    }

    /// Critiques the trajectory so far. Reflections too short to act on are
    /// discarded.
    async fn reflect(&mut self, subtask: &Subtask) -> Option<String> {
        let context = self.reflection_context(subtask);
        self.reflector.push(Message::user(context));
        let reflection = match self
            .engine
            .generate(&self.reflector.as_messages(), self.temperature, self.max_tokens)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "reflection call failed, skipping");
                return None;
            }
        };

        if reflection.trim().len() > 20 {
            self.reflections.push(reflection.clone());
            self.reflector.push(Message::assistant(reflection.clone()));
            tracing::info!(reflection = %reflection, "actionable reflection");
            Some(reflection)
        } else {
            None
        }
    }

    fn reflection_context(&self, subtask: &Subtask) -> String {
        let mut context = format!(
            "SUBTASK ANALYSIS:\nCurrent Subtask: {}\nSubtask Instructions: {}\n\n\
             EXECUTION TRAJECTORY:\n",
            subtask.name, subtask.info
        );

        if !self.previous_actions.is_empty() {
            let recent: Vec<&String> = self
                .previous_actions
                .iter()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            context.push_str(&format!("Recent Actions: {recent:?}\n"));

            if self.previous_actions.len() >= self.stuck_window {
                let tail: Vec<&String> = self
                    .previous_actions
                    .iter()
                    .rev()
                    .take(self.stuck_window)
                    .collect();
                if tail.windows(2).all(|w| w[0] == w[1]) {
                    context.push_str(&format!(
                        "PATTERN DETECTED: Repeating same action {:?}\n",
                        tail[0]
                    ));
                } else if tail.len() >= 3 && tail[0] == tail[2] && tail[0] != tail[1] {
                    context.push_str(&format!(
                        "PATTERN DETECTED: Alternating actions between {:?} and {:?}\n",
                        tail[0], tail[1]
                    ));
                }
            }
        }

        if !self.response_history.is_empty() {
            context.push_str("\nPlanning History:\n");
            let start = self.response_history.len().saturating_sub(3);
            context.push_str(&self.response_history[start..].join("\n"));
        }

        if !self.reflections.is_empty() {
            context.push_str("\nPrevious Reflections:\n");
            let start = self.reflections.len().saturating_sub(2);
            context.push_str(&self.reflections[start..].join("\n"));
            context.push_str("\nNOTE: Avoid repeating previous reflection guidance.\n");
        }

        context
    }

    /// Progress means the current signature differs from the last two.
    fn progress_made(&self, current_state: &str) -> bool {
        if self.previous_states.len() < 2 {
            return true;
        }
        !self
            .previous_states
            .iter()
            .rev()
            .take(2)
            .any(|s| s == current_state)
    }

    /// Whether choosing `candidate` now would extend a stuck pattern.
    pub fn is_stuck(&self, candidate: &str) -> bool {
        let history: Vec<String> = self.previous_actions.iter().cloned().collect();
        detect_stuck_pattern(&history, candidate, self.stuck_window)
    }
}

/// Reduces the first `rows` linearized element rows to `role:title` pairs
/// joined with `|`. Used to detect "no progress" across ticks.
pub fn state_signature(linearized_tree: &str, rows: usize) -> String {
    linearized_tree
        .lines()
        .skip(1)
        .take(rows)
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let _id = parts.next()?;
            let role = parts.next()?;
            let title = parts.next()?;
            if role.is_empty() || title.is_empty() {
                None
            } else {
                Some(format!("{role}:{title}"))
            }
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// True when `candidate` extends an exact-repeat run of `window` identical
/// actions, or completes an A/B/A alternating pattern over the last three.
pub fn detect_stuck_pattern(history: &[String], candidate: &str, window: usize) -> bool {
    if window == 0 {
        return false;
    }
    let tail_needed = window - 1;
    if history.len() >= tail_needed
        && tail_needed > 0
        && history.iter().rev().take(tail_needed).all(|a| a == candidate)
    {
        tracing::warn!(action = candidate, "stuck pattern: exact repetition");
        return true;
    }

    if history.len() >= 2 {
        let last = &history[history.len() - 1];
        let second_last = &history[history.len() - 2];
        if candidate == second_last && candidate != last {
            tracing::warn!(action = candidate, "stuck pattern: alternating actions");
            return true;
        }
    }

    false
}

/// Alternative strategy hints keyed by the kind of action that is stuck.
fn suggest_alternative(stuck_action: &str) -> &'static str {
    let lowered = stuck_action.to_lowercase();
    if lowered.contains("click") {
        "Try using hotkeys like Enter, Tab, or Escape instead of clicking"
    } else if lowered.contains("type") {
        "Try using ctrl+a to select all first, then type the text"
    } else if lowered.contains("scroll") {
        "Try using Page Up/Page Down or arrow keys instead of scrolling"
    } else if lowered.contains("hotkey") {
        "Try clicking on the element first to ensure focus, then use the hotkey"
    } else {
        "Try a different approach or break the step into smaller actions"
    }
}

fn push_bounded(buffer: &mut VecDeque<String>, value: String, cap: usize) {
    buffer.push_back(value);
    while buffer.len() > cap {
        buffer.pop_front();
    }
}
