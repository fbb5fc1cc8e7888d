pub mod dag;

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::engine::provider::LanguageModel;
use crate::engine::types::{Message, MessageHistory};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::grounding::snapshot::Observation;
use crate::grounding::GroundingAdapter;
use crate::knowledge::{ExperienceRetriever, NO_MEMORY};
use crate::planner::dag::{linear_fallback, parse_dag, Subtask, TaskGraph};
use crate::prompts;

/// One recorded planning cycle, kept to enrich later failure feedback.
#[derive(Debug, Clone)]
pub struct PlanAttempt {
    pub attempt: u32,
    pub feedback: String,
    pub failed_subtasks: Vec<String>,
    pub successful_subtasks: Vec<String>,
}

/// Hierarchical planner: instruction + observation → step-by-step plan →
/// subtask DAG → ordered subtask queue. Tracks per-subtask outcomes across
/// replanning attempts within one instruction.
pub struct Planner {
    engine: Arc<dyn LanguageModel>,
    retriever: Arc<dyn ExperienceRetriever>,
    temperature: f32,
    max_tokens: u32,
    generator: MessageHistory,
    dag_translator: MessageHistory,
    turn_count: u32,
    plan_attempts: u32,
    max_plan_attempts: u32,
    previous_failures: Vec<PlanAttempt>,
    successful_subtasks: Vec<String>,
    failed_subtasks: Vec<String>,
    pub plan_history: Vec<String>,
}

impl Planner {
    pub fn new(
        engine: Arc<dyn LanguageModel>,
        retriever: Arc<dyn ExperienceRetriever>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            engine,
            retriever,
            temperature: config.engine.temperature,
            max_tokens: config.engine.max_tokens,
            generator: MessageHistory::new(prompts::PLANNER_PROMPT, config.limits.max_trajectory_length),
            dag_translator: MessageHistory::new(
                prompts::DAG_TRANSLATOR_PROMPT,
                config.limits.max_trajectory_length,
            ),
            turn_count: 0,
            plan_attempts: 0,
            max_plan_attempts: config.limits.max_plan_attempts,
            previous_failures: Vec::new(),
            successful_subtasks: Vec::new(),
            failed_subtasks: Vec::new(),
            plan_history: Vec::new(),
        }
    }

    pub fn plan_attempts(&self) -> u32 {
        self.plan_attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.plan_attempts > self.max_plan_attempts
    }

    pub fn successful_subtasks(&self) -> &[String] {
        &self.successful_subtasks
    }

    pub fn failed_subtasks(&self) -> &[String] {
        &self.failed_subtasks
    }

    /// Moves a subtask name between the failed and successful sets. Only
    /// enriches future failure feedback; never affects ordering.
    pub fn record_outcome(&mut self, name: &str, success: bool) {
        if success {
            if !self.successful_subtasks.iter().any(|s| s == name) {
                self.successful_subtasks.push(name.to_string());
            }
            self.failed_subtasks.retain(|s| s != name);
        } else if !self.failed_subtasks.iter().any(|s| s == name) {
            self.failed_subtasks.push(name.to_string());
        }
    }

    /// Full planning cycle: plan, translate to a DAG, topologically sort.
    pub async fn subtask_queue(
        &mut self,
        grounding: &mut GroundingAdapter,
        observation: &Observation,
        instruction: &str,
        failure_feedback: &str,
    ) -> DeskPilotResult<Vec<Subtask>> {
        let plan = self
            .generate_plan(grounding, observation, instruction, failure_feedback)
            .await?;
        let graph = self.generate_dag(instruction, &plan).await;
        Ok(graph.topological_sort())
    }

    /// Expands raw failure feedback with structured replanning history:
    /// recent failed attempts, confirmed outcomes, and escalating guidance.
    /// Each call with non-empty feedback counts one planning attempt.
    fn enhance_failure_feedback(&mut self, feedback: &str) -> String {
        self.plan_attempts += 1;
        self.previous_failures.push(PlanAttempt {
            attempt: self.plan_attempts,
            feedback: feedback.to_string(),
            failed_subtasks: self.failed_subtasks.clone(),
            successful_subtasks: self.successful_subtasks.clone(),
        });

        let mut enhanced = feedback.to_string();

        if self.plan_attempts > 1 {
            enhanced.push_str("\n\nPREVIOUS PLANNING FAILURES:\n");
            let start = self.previous_failures.len().saturating_sub(2);
            for failure in &self.previous_failures[start..] {
                enhanced.push_str(&format!(
                    "Attempt {}: {}\n",
                    failure.attempt, failure.feedback
                ));
            }
            enhanced.push_str(&format!(
                "\nSUCCESSFUL SUBTASKS (don't repeat): {:?}\n",
                self.successful_subtasks
            ));
            enhanced.push_str(&format!(
                "FAILED SUBTASKS (need alternative approach): {:?}\n",
                self.failed_subtasks
            ));
            enhanced.push_str(
                "\nREPLANNING GUIDANCE:\n\
                 - Break the task down into smaller, more atomic steps\n\
                 - Prioritize keyboard shortcuts over mouse interactions\n\
                 - Consider alternative approaches for previously failed subtasks\n",
            );
        }

        if self.plan_attempts >= self.max_plan_attempts {
            enhanced.push_str(
                "\nFINAL ATTEMPT: This is the last replanning attempt. Create the \
                 simplest possible plan that directly achieves the goal.\n",
            );
        }

        enhanced
    }

    pub async fn generate_plan(
        &mut self,
        grounding: &mut GroundingAdapter,
        observation: &Observation,
        instruction: &str,
        failure_feedback: &str,
    ) -> DeskPilotResult<String> {
        let tree = grounding.linearize(observation).await;

        let feedback = if failure_feedback.trim().is_empty() {
            String::new()
        } else {
            let enhanced = self.enhance_failure_feedback(failure_feedback);
            tracing::info!(attempt = self.plan_attempts, "replanning with enhanced feedback");
            enhanced
        };

        // Retrieve prior experience at the first planning step and on every
        // replan, and fold it into the system prompt's task description.
        if self.turn_count == 0 || !feedback.is_empty() {
            let mut task_description = instruction.to_string();
            let (similar_task, experience) =
                self.retriever.retrieve_narrative(instruction).await?;
            if experience != NO_MEMORY && !experience.trim().is_empty() {
                tracing::info!(similar_task = %similar_task, "similar task experience found");
                task_description.push_str(&format!(
                    "\nYou may refer to prior experience if it is useful: {experience}"
                ));
            }
            self.generator.set_system(
                prompts::PLANNER_PROMPT.replace("TASK_DESCRIPTION", &task_description),
            );
        }

        let mut request = format!(
            "Accessibility Tree: {tree}\n\
             The notes buffer contains: [{}].\n\
             The current open applications are {:?}",
            grounding.notes.join(","),
            grounding.active_applications(observation),
        );
        if !feedback.is_empty() {
            request.push_str(&format!(" Previous plan failed at step: {feedback}"));
        }

        let message = match (&observation.screenshot, self.engine.supports_vision()) {
            (Some(shot), true) => Message::user_with_image(request, shot),
            _ => Message::user(request),
        };
        self.generator.push(message);

        tracing::info!("generating high level plan");
        let plan = self
            .engine
            .generate(&self.generator.as_messages(), self.temperature, self.max_tokens)
            .await?;

        if plan.trim().is_empty() {
            return Err(DeskPilotError::Planner(
                "plan generation returned an empty response; check the engine \
                 configuration, API key, and model availability"
                    .into(),
            ));
        }

        tracing::info!(plan = %plan, "high level plan generated");
        self.generator.push(Message::assistant(plan.clone()));
        self.plan_history.push(plan.clone());
        self.turn_count += 1;

        Ok(plan)
    }

    /// Asks the engine to translate the plan into a DAG; malformed or cyclic
    /// output falls back to the linear chain.
    pub async fn generate_dag(&mut self, instruction: &str, plan: &str) -> TaskGraph {
        self.dag_translator
            .push(Message::user(format!("Instruction: {instruction}\nPlan: {plan}")));

        tracing::info!("generating DAG");
        let raw = match self
            .engine
            .generate(&self.dag_translator.as_messages(), self.temperature, self.max_tokens)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "DAG translation call failed, using linear plan");
                return linear_fallback(plan);
            }
        };
        self.dag_translator.push(Message::assistant(raw.clone()));

        match parse_dag(&raw) {
            Some(dag) => TaskGraph::Dag(dag),
            None => {
                tracing::warn!("failed to parse DAG, falling back to linear plan execution");
                linear_fallback(plan)
            }
        }
    }

    pub async fn summarize_narrative(&self, trajectory: &str) -> DeskPilotResult<String> {
        let messages = vec![
            Message::system(prompts::NARRATIVE_SUMMARIZATION_PROMPT),
            Message::user(trajectory),
        ];
        self.engine
            .generate(&messages, self.temperature, self.max_tokens)
            .await
    }

    pub async fn summarize_episode(&self, trajectory: &str) -> DeskPilotResult<String> {
        let messages = vec![
            Message::system(prompts::EPISODE_SUMMARIZATION_PROMPT),
            Message::user(trajectory),
        ];
        self.engine
            .generate(&messages, self.temperature, self.max_tokens)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::engine::testing::ScriptedEngine;
    use crate::grounding::snapshot::SnapshotNode;
    use crate::knowledge::NullRetriever;

    fn observation() -> Observation {
        Observation {
            tree: Some(SnapshotNode {
                role: "Window".into(),
                title: "Desktop".into(),
                text: String::new(),
                position: (0, 0),
                size: (800, 600),
                children: Vec::new(),
            }),
            ..Default::default()
        }
    }

    fn planner(engine: Arc<ScriptedEngine>) -> Planner {
        Planner::new(engine, Arc::new(NullRetriever), &AgentConfig::default())
    }

    #[tokio::test]
    async fn plan_and_dag_produce_sorted_queue() {
        let engine = ScriptedEngine::new(vec![
            "1. Open the editor\n2. Save the file",
            r#"<json>{"dag": {"nodes": [
                {"name": "open_editor", "info": "Open the editor"},
                {"name": "save_file", "info": "Save the file"}],
                "edges": [[{"name": "open_editor"}, {"name": "save_file"}]]}}</json>"#,
        ]);
        let mut grounding = GroundingAdapter::new(Default::default());
        let mut planner = planner(engine);
        let queue = planner
            .subtask_queue(&mut grounding, &observation(), "save a note", "")
            .await
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].name, "open_editor");
        assert_eq!(queue[1].name, "save_file");
        assert_eq!(planner.plan_attempts(), 0);
    }

    #[tokio::test]
    async fn unparsable_dag_falls_back_to_linear_chain() {
        let engine = ScriptedEngine::new(vec![
            "open the browser\nsearch the docs",
            "sorry, I cannot produce JSON",
        ]);
        let mut grounding = GroundingAdapter::new(Default::default());
        let mut planner = planner(engine);
        let queue = planner
            .subtask_queue(&mut grounding, &observation(), "find docs", "")
            .await
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].name, "step_1");
        assert_eq!(queue[0].info, "open the browser");
    }

    #[tokio::test]
    async fn empty_plan_response_is_fatal() {
        let engine = ScriptedEngine::new(vec![""]);
        let mut grounding = GroundingAdapter::new(Default::default());
        let mut planner = planner(engine);
        let result = planner
            .generate_plan(&mut grounding, &observation(), "do something", "")
            .await;
        assert!(matches!(result, Err(DeskPilotError::Planner(_))));
    }

    #[tokio::test]
    async fn failure_feedback_counts_attempts_and_escalates() {
        let engine = ScriptedEngine::new(vec!["plan a", "bad dag", "plan b", "bad dag"]);
        let mut grounding = GroundingAdapter::new(Default::default());
        let mut planner = planner(engine);
        planner.record_outcome("step_1", false);

        planner
            .subtask_queue(&mut grounding, &observation(), "task", "step_1 failed")
            .await
            .unwrap();
        assert_eq!(planner.plan_attempts(), 1);

        planner
            .subtask_queue(&mut grounding, &observation(), "task", "step_1 failed again")
            .await
            .unwrap();
        assert_eq!(planner.plan_attempts(), 2);
        let last = planner.previous_failures.last().unwrap();
        assert!(last.failed_subtasks.contains(&"step_1".to_string()));
    }

    #[tokio::test]
    async fn record_outcome_moves_between_sets() {
        let engine = ScriptedEngine::new(vec![]);
        let mut planner = planner(engine);
        planner.record_outcome("a", false);
        assert_eq!(planner.failed_subtasks(), ["a"]);
        planner.record_outcome("a", true);
        assert!(planner.failed_subtasks().is_empty());
        assert_eq!(planner.successful_subtasks(), ["a"]);
        // duplicates are collapsed
        planner.record_outcome("a", true);
        assert_eq!(planner.successful_subtasks(), ["a"]);
    }
}
