use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::AgentConfig;
use crate::engine::build_engine;
use crate::engine::provider::LanguageModel;
use crate::errors::DeskPilotResult;
use crate::executor::Executor;
use crate::grounding::command::AutomationCommand;
use crate::grounding::snapshot::Observation;
use crate::grounding::GroundingAdapter;
use crate::knowledge::{ExperienceRetriever, JsonKnowledgeBase, NullRetriever};
use crate::planner::dag::{Subtask, SubtaskStatus};
use crate::planner::Planner;
use crate::trajectory::TrajectoryLog;

/// Diagnostic payload returned alongside every command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictInfo {
    pub subtask: String,
    pub subtask_info: String,
    pub subtask_status: String,
    pub plan: Option<String>,
    pub executor_response: Option<String>,
    pub reflection: Option<String>,
    pub forced_completion: bool,
    pub total_steps: u32,
    pub plan_attempts: u32,
}

/// The control loop: owns the replan/subtask-advance state machine and the
/// safety bounds, and maps planner/executor output to exactly one
/// automation command per tick. One instance serves one instruction; run
/// parallel instructions on independent instances.
pub struct Orchestrator {
    config: AgentConfig,
    engine: Arc<dyn LanguageModel>,
    retriever: Arc<dyn ExperienceRetriever>,
    knowledge: Option<Arc<JsonKnowledgeBase>>,
    grounding: GroundingAdapter,
    planner: Planner,
    executor: Executor,
    trajectory: TrajectoryLog,
    stop: Arc<AtomicBool>,

    requires_replan: bool,
    needs_next_subtask: bool,
    failure_feedback: String,
    subtasks: VecDeque<Subtask>,
    completed: Vec<Subtask>,
    current: Option<Subtask>,
    step_count: u32,
    total_step_count: u32,
    replan_count: u32,
    subtask_trajectory: String,
}

impl Orchestrator {
    pub fn new(config: AgentConfig) -> Self {
        let engine = build_engine(&config.engine);
        let knowledge = Arc::new(JsonKnowledgeBase::new(config.knowledge.root.clone()));
        let retriever: Arc<dyn ExperienceRetriever> = if config.knowledge.enable_retrieval {
            knowledge.clone()
        } else {
            Arc::new(NullRetriever)
        };
        Self::with_parts(config, engine, retriever, Some(knowledge))
    }

    /// Assembles the loop from explicit collaborators. Tests inject a
    /// scripted engine and skip the on-disk knowledge base this way.
    pub fn with_parts(
        config: AgentConfig,
        engine: Arc<dyn LanguageModel>,
        retriever: Arc<dyn ExperienceRetriever>,
        knowledge: Option<Arc<JsonKnowledgeBase>>,
    ) -> Self {
        let grounding = GroundingAdapter::new(config.grounding.clone());
        let planner = Planner::new(engine.clone(), retriever.clone(), &config);
        let executor = Executor::new(engine.clone(), retriever.clone(), &config);
        tracing::debug!(engine = engine.name(), "control loop assembled");
        Self {
            config,
            engine,
            retriever,
            knowledge,
            grounding,
            planner,
            executor,
            trajectory: TrajectoryLog::new(),
            stop: Arc::new(AtomicBool::new(false)),
            requires_replan: true,
            needs_next_subtask: true,
            failure_feedback: String::new(),
            subtasks: VecDeque::new(),
            completed: Vec::new(),
            current: None,
            step_count: 0,
            total_step_count: 0,
            replan_count: 0,
            subtask_trajectory: String::new(),
        }
    }

    /// Shared flag for cooperative cancellation; checked between ticks.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn set_reflection(&mut self, enabled: bool) {
        self.executor.set_reflection(enabled);
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn total_steps(&self) -> u32 {
        self.total_step_count
    }

    /// Discards all per-instruction state so the instance can serve a new
    /// instruction.
    pub fn reset(&mut self) {
        self.planner = Planner::new(self.engine.clone(), self.retriever.clone(), &self.config);
        self.executor = Executor::new(self.engine.clone(), self.retriever.clone(), &self.config);
        self.grounding = GroundingAdapter::new(self.config.grounding.clone());
        self.requires_replan = true;
        self.needs_next_subtask = true;
        self.failure_feedback.clear();
        self.subtasks.clear();
        self.completed.clear();
        self.current = None;
        self.step_count = 0;
        self.total_step_count = 0;
        self.replan_count = 0;
        self.subtask_trajectory.clear();
        self.stop.store(false, Ordering::SeqCst);
    }

    /// One tick: consumes an observation and returns exactly one command.
    /// The caller applies the command to the environment and supplies the
    /// next observation; no two ticks may be in flight at once.
    pub async fn predict(
        &mut self,
        instruction: &str,
        observation: &Observation,
    ) -> DeskPilotResult<(PredictInfo, AutomationCommand)> {
        let mut info = PredictInfo::default();

        if self.stop.load(Ordering::SeqCst) {
            tracing::info!("stop requested, skipping tick");
            info.subtask_status = "Cancelled".into();
            return Ok((info, AutomationCommand::Next));
        }

        self.total_step_count += 1;
        info.total_steps = self.total_step_count;
        if self.total_step_count > self.config.limits.max_total_steps {
            tracing::warn!(
                max = self.config.limits.max_total_steps,
                "maximum total steps exceeded, forcing completion"
            );
            info.subtask_status = "Forced_Complete".into();
            return Ok((info, AutomationCommand::Done));
        }

        let mut yielded: Option<AutomationCommand> = None;
        let mut inner_loops = 0u32;
        let mut subtask_status = "In";

        while yielded.is_none() && inner_loops < self.config.limits.max_inner_loops {
            inner_loops += 1;

            if self.requires_replan {
                self.replan_count += 1;
                if self.replan_count > self.config.limits.max_plan_attempts {
                    tracing::warn!(
                        replans = self.replan_count,
                        "maximum replans exceeded, forcing completion"
                    );
                    info.subtask_status = "Forced_Complete".into();
                    return Ok((info, AutomationCommand::Done));
                }

                tracing::info!(replan = self.replan_count, "(re)planning");
                let queue = self
                    .planner
                    .subtask_queue(
                        &mut self.grounding,
                        observation,
                        instruction,
                        &self.failure_feedback,
                    )
                    .await?;
                self.subtasks = queue.into_iter().collect();
                self.requires_replan = false;
                info.plan = self.planner.plan_history.last().cloned();
            }

            if self.needs_next_subtask {
                match self.subtasks.pop_front() {
                    Some(mut next) => {
                        next.status = SubtaskStatus::Active;
                        tracing::info!(subtask = %next.name, "next subtask");
                        self.current = Some(next);
                        self.needs_next_subtask = false;
                        self.step_count = 0;
                        self.executor.reset();
                        subtask_status = "Start";
                    }
                    None => {
                        tracing::warn!("plan produced no pending subtasks");
                        yielded = Some(AutomationCommand::Done);
                        break;
                    }
                }
            }

            let Some(subtask) = self.current.clone() else {
                self.needs_next_subtask = true;
                continue;
            };

            let future_tasks: Vec<Subtask> = self.subtasks.iter().cloned().collect();
            let step = self
                .executor
                .next_action(
                    &mut self.grounding,
                    instruction,
                    &subtask,
                    &future_tasks,
                    &self.completed,
                    observation,
                )
                .await?;
            self.step_count += 1;

            info.subtask = subtask.name.clone();
            info.subtask_info = subtask.info.clone();
            info.executor_response = Some(step.response.clone());
            info.reflection = step.reflection.clone();
            info.plan_attempts = self.planner.plan_attempts();

            let mut command = step.command.clone();

            // Liveness bound: a subtask that keeps not terminating is
            // force-completed as a success.
            if self.step_count > self.config.limits.max_subtask_steps && !command.is_terminal() {
                tracing::warn!(
                    subtask = %subtask.name,
                    steps = self.step_count,
                    "subtask exceeded maximum steps, forcing completion"
                );
                command = AutomationCommand::Done;
                info.forced_completion = true;
            }

            self.trajectory.record(
                &subtask.name,
                &step.action.describe(),
                serde_json::to_value(&command).unwrap_or_default(),
            );
            self.update_episodic_memory(subtask_status, instruction, &subtask, &step.response)
                .await;
            subtask_status = "In";

            match command {
                AutomationCommand::Fail => {
                    self.planner.record_outcome(&subtask.name, false);
                    self.failure_feedback = self.build_failure_feedback(&subtask, &step.response);
                    self.mark_current(SubtaskStatus::Failed);
                    self.requires_replan = true;
                    self.needs_next_subtask = true;
                    self.subtask_trajectory.clear();
                    info.subtask_status = "Failed".into();

                    if self.subtasks.is_empty() {
                        // Nothing left to advance to: report failure upward.
                        yielded = Some(AutomationCommand::Fail);
                    }
                }

                AutomationCommand::Done => {
                    self.planner.record_outcome(&subtask.name, true);
                    tracing::info!(subtask = %subtask.name, "subtask completed");
                    self.mark_current(SubtaskStatus::Done);
                    if let Some(done) = self.current.take() {
                        self.completed.push(done);
                    }
                    self.needs_next_subtask = true;
                    self.requires_replan = false;
                    info.subtask_status = "Done".into();
                    self.finalize_episode().await;

                    if self.subtasks.is_empty() {
                        yielded = Some(AutomationCommand::Done);
                    }
                }

                other => {
                    info.subtask_status = "In".into();
                    yielded = Some(other);
                }
            }
        }

        // Inner-loop bound hit without an action: terminate rather than
        // looping further.
        let command = yielded.unwrap_or_else(|| {
            tracing::warn!("inner loop bound reached without an action, forcing completion");
            info.forced_completion = true;
            AutomationCommand::Done
        });

        Ok((info, command))
    }

    fn mark_current(&mut self, status: SubtaskStatus) {
        if let Some(current) = &mut self.current {
            current.status = status;
        }
    }

    fn build_failure_feedback(&self, subtask: &Subtask, failed_response: &str) -> String {
        let completed: Vec<&str> = self.completed.iter().map(|t| t.name.as_str()).collect();
        let recent = self.executor.recent_actions();
        format!(
            "SUBTASK FAILURE ANALYSIS:\n\
             - Completed subtasks: {completed:?}\n\
             - Failed subtask: '{}'\n\
             - Failed action: {}\n\
             - Recent action history: {recent:?}\n\
             - Suggested approach: Try breaking down the failed subtask into smaller \
             steps or use alternative methods (hotkeys vs clicks)\n\
             Please replan with a different approach.",
            subtask.name,
            failed_response.lines().last().unwrap_or("Unknown"),
        )
    }

    /// Accumulates the per-subtask trajectory and, at a subtask boundary,
    /// summarizes and persists it keyed by `task\nsubtask`. Same key is
    /// never re-summarized.
    async fn update_episodic_memory(
        &mut self,
        status: &str,
        instruction: &str,
        subtask: &Subtask,
        executor_response: &str,
    ) {
        if self.knowledge.is_none() {
            return;
        }
        match status {
            "Start" => {
                self.finalize_episode().await;
                self.subtask_trajectory = format!(
                    "Task:\n{instruction}\n\nSubtask: {}\nSubtask Instruction: {}\n\
                     ----------------------\n\nPlan:\n{executor_response}\n",
                    subtask.name, subtask.info
                );
            }
            _ => {
                if !self.subtask_trajectory.is_empty() {
                    self.subtask_trajectory.push_str(&format!(
                        "\n----------------------\n\nPlan:\n{executor_response}\n"
                    ));
                }
            }
        }
    }

    async fn finalize_episode(&mut self) {
        let Some(kb) = self.knowledge.clone() else {
            return;
        };
        if self.subtask_trajectory.is_empty() {
            return;
        }
        let trajectory = std::mem::take(&mut self.subtask_trajectory);
        let key = trajectory
            .split("\n----------------------\n\nPlan:\n")
            .next()
            .unwrap_or(&trajectory)
            .to_string();
        if kb.has_episode(&key) {
            return;
        }
        match self.planner.summarize_episode(&trajectory).await {
            Ok(summary) => {
                if let Err(e) = kb.save_episode(&key, &summary) {
                    tracing::warn!(error = %e, "failed to persist episodic memory");
                }
            }
            Err(e) => tracing::warn!(error = %e, "episode summarization failed"),
        }
    }

    /// Persists a whole-task summary once per instruction. Call after the
    /// instruction reaches a terminal command.
    pub async fn update_narrative_memory(&mut self, instruction: &str, trajectory: &str) {
        let Some(kb) = self.knowledge.clone() else {
            return;
        };
        if kb.has_narrative(instruction) {
            return;
        }
        match self.planner.summarize_narrative(trajectory).await {
            Ok(summary) => {
                if let Err(e) = kb.save_narrative(instruction, &summary) {
                    tracing::warn!(error = %e, "failed to persist narrative memory");
                }
            }
            Err(e) => tracing::warn!(error = %e, "narrative summarization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedEngine;
    use crate::errors::DeskPilotError;
    use crate::grounding::command::InputOp;
    use crate::grounding::snapshot::SnapshotNode;

    const TWO_NODE_DAG: &str = r#"<json>{"dag": {"nodes": [
        {"name": "open_app", "info": "Open app X"},
        {"name": "verify_open", "info": "Verify the app is open"}],
        "edges": [[{"name": "open_app"}, {"name": "verify_open"}]]}}</json>"#;

    fn observation() -> Observation {
        Observation {
            tree: Some(SnapshotNode {
                role: "Window".into(),
                title: "Desktop".into(),
                text: String::new(),
                position: (0, 0),
                size: (1024, 768),
                children: vec![SnapshotNode {
                    role: "Button".into(),
                    title: "Start".into(),
                    text: String::new(),
                    position: (0, 700),
                    size: (48, 48),
                    children: Vec::new(),
                }],
            }),
            ..Default::default()
        }
    }

    fn orchestrator(engine: Arc<ScriptedEngine>, config: AgentConfig) -> Orchestrator {
        let mut orchestrator =
            Orchestrator::with_parts(config, engine, Arc::new(NullRetriever), None);
        orchestrator.set_reflection(false);
        orchestrator
    }

    #[tokio::test]
    async fn two_step_instruction_yields_two_actions_then_done() {
        let engine = ScriptedEngine::new(vec![
            "1. Open app X\n2. Verify it is open",
            TWO_NODE_DAG,
            "Grounded Action: open(\"app X\")",
            "Grounded Action: done()",
            "Grounded Action: wait(1.0)",
            "Grounded Action: done()",
        ]);
        let mut agent = orchestrator(engine, AgentConfig::default());
        let obs = observation();

        let (info, first) = agent.predict("open app X", &obs).await.unwrap();
        let AutomationCommand::Ops { ops } = first else {
            panic!("expected an input sequence, got {first:?}")
        };
        assert!(ops.iter().any(|op| matches!(op, InputOp::TypeText { text } if text == "app X")));
        assert_eq!(info.subtask, "open_app");

        let (info, second) = agent.predict("open app X", &obs).await.unwrap();
        assert_eq!(second, AutomationCommand::Wait { seconds: 1.0 });
        assert_eq!(info.subtask, "verify_open");

        let (_, third) = agent.predict("open app X", &obs).await.unwrap();
        assert_eq!(third, AutomationCommand::Done);
    }

    #[tokio::test]
    async fn failed_subtask_triggers_exactly_one_replan() {
        let engine = ScriptedEngine::new(vec![
            // initial plan: linear fallback gives two subtasks
            "open the settings\nchange the theme",
            "this is not a DAG",
            // first subtask fails
            "Grounded Action: fail()",
            // replan (with failure feedback), again linear
            "change the theme directly",
            "still not a DAG",
            // new first subtask acts
            "Grounded Action: wait(2.0)",
        ]);
        let mut agent = orchestrator(engine, AgentConfig::default());
        let obs = observation();

        let (info, command) = agent.predict("change theme", &obs).await.unwrap();
        assert_eq!(command, AutomationCommand::Wait { seconds: 2.0 });
        assert_eq!(info.plan_attempts, 1);
        assert_eq!(agent.planner().plan_attempts(), 1);
        assert!(agent
            .planner()
            .failed_subtasks()
            .contains(&"step_1".to_string()));
    }

    #[tokio::test]
    async fn failure_with_no_remaining_subtasks_reports_fail_upward() {
        let engine = ScriptedEngine::new(vec![
            "single step",
            "not json",
            "Grounded Action: fail()",
        ]);
        let mut agent = orchestrator(engine, AgentConfig::default());
        let (_, command) = agent.predict("impossible", &observation()).await.unwrap();
        assert_eq!(command, AutomationCommand::Fail);
    }

    #[tokio::test]
    async fn tick_ceiling_forces_terminal_done() {
        let config = AgentConfig {
            limits: crate::config::LimitsConfig {
                max_total_steps: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = ScriptedEngine::new(vec![]);
        let mut agent = orchestrator(engine.clone(), config);
        let (info, command) = agent.predict("anything", &observation()).await.unwrap();
        assert_eq!(command, AutomationCommand::Done);
        assert_eq!(info.subtask_status, "Forced_Complete");
        // the ceiling fires before any engine call
        assert_eq!(engine.request_count(), 0);
    }

    #[tokio::test]
    async fn subtask_exceeding_max_steps_is_force_completed_as_success() {
        let config = AgentConfig {
            limits: crate::config::LimitsConfig {
                max_subtask_steps: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = ScriptedEngine::new(vec![
            "only step",
            "not json",
            "Grounded Action: wait(1.0)",
            "Grounded Action: wait(1.0)",
        ]);
        let mut agent = orchestrator(engine, config);
        let obs = observation();

        let (_, first) = agent.predict("slow task", &obs).await.unwrap();
        assert_eq!(first, AutomationCommand::Wait { seconds: 1.0 });

        let (info, second) = agent.predict("slow task", &obs).await.unwrap();
        assert_eq!(second, AutomationCommand::Done);
        assert!(info.forced_completion);
        assert!(agent
            .planner()
            .successful_subtasks()
            .contains(&"step_1".to_string()));
    }

    #[tokio::test]
    async fn replan_cap_forces_done() {
        let config = AgentConfig {
            limits: crate::config::LimitsConfig {
                max_plan_attempts: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        // plan once, fail with a remaining subtask so a replan is requested
        // in the same tick; the second planning pass exceeds the cap.
        let engine = ScriptedEngine::new(vec![
            "a\nb",
            "not json",
            "Grounded Action: fail()",
        ]);
        let mut agent = orchestrator(engine, config);
        let (info, command) = agent.predict("task", &observation()).await.unwrap();
        assert_eq!(command, AutomationCommand::Done);
        assert_eq!(info.subtask_status, "Forced_Complete");
    }

    #[tokio::test]
    async fn stop_flag_skips_the_tick() {
        let engine = ScriptedEngine::new(vec![]);
        let mut agent = orchestrator(engine, AgentConfig::default());
        agent.stop_handle().store(true, Ordering::SeqCst);
        let (_, command) = agent.predict("task", &observation()).await.unwrap();
        assert_eq!(command, AutomationCommand::Next);
    }

    #[tokio::test]
    async fn empty_plan_response_surfaces_as_error() {
        let engine = ScriptedEngine::new(vec![""]);
        let mut agent = orchestrator(engine, AgentConfig::default());
        let result = agent.predict("task", &observation()).await;
        assert!(matches!(result, Err(DeskPilotError::Planner(_))));
    }

    #[tokio::test]
    async fn reset_clears_per_instruction_state() {
        let engine = ScriptedEngine::new(vec![
            "one step",
            "not json",
            "Grounded Action: wait(1.0)",
        ]);
        let mut agent = orchestrator(engine, AgentConfig::default());
        agent.predict("task", &observation()).await.unwrap();
        assert_eq!(agent.total_steps(), 1);
        agent.reset();
        assert_eq!(agent.total_steps(), 0);
        assert_eq!(agent.planner().plan_attempts(), 0);
    }
}
