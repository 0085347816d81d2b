//! Component N: the test harness.
//!
//! Scripted in-memory fakes for every external collaborator (dispatcher,
//! container executor, LLM client) so the driver loop can be exercised
//! end-to-end without real git remotes, containers, or model calls.
//! Shaped like `state_store.rs`'s `:memory:` SQLite test setup and
//! `lease.rs`'s scripted-request unit tests elsewhere in this codebase,
//! generalized into standalone fakes the rest of the crate's integration
//! tests share rather than re-deriving per test module.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DriverResult, ToolLoopResult};
use crate::interfaces::{CommandOutput, ContainerExecutor, Dispatcher, StoryAssignment, StoryOutcome};
use crate::message::Message;
use crate::tool_loop::{LlmClient, ToolEvent, ToolExecutor};
use crate::context::Role;

/// Hands out a fixed, pre-scripted sequence of story assignments, then
/// signals shutdown (`None`) once exhausted. Also records every lease
/// acquired/released and every STATE_CHANGE notification published, so
/// tests can assert on the lease and notification invariants directly.
pub struct ScriptedDispatcher {
    assignments: Mutex<VecDeque<StoryAssignment>>,
    pub outcomes: Mutex<Vec<(String, String, StoryOutcome)>>,
    pub leases: Mutex<Vec<(String, String)>>,
    pub releases: Mutex<Vec<(String, String)>>,
    pub notifications: Mutex<Vec<Message>>,
}

impl ScriptedDispatcher {
    pub fn new(assignments: Vec<StoryAssignment>) -> Self {
        Self {
            assignments: Mutex::new(assignments.into()),
            outcomes: Mutex::new(Vec::new()),
            leases: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn await_story(&self, _agent_id: &str) -> DriverResult<Option<StoryAssignment>> {
        Ok(self.assignments.lock().unwrap().pop_front())
    }

    async fn submit_outcome(
        &self,
        agent_id: &str,
        story_id: &str,
        outcome: StoryOutcome,
    ) -> DriverResult<()> {
        self.outcomes
            .lock()
            .unwrap()
            .push((agent_id.to_string(), story_id.to_string(), outcome));
        Ok(())
    }

    async fn set_lease(&self, agent_id: &str, story_id: &str) -> DriverResult<()> {
        self.leases
            .lock()
            .unwrap()
            .push((agent_id.to_string(), story_id.to_string()));
        Ok(())
    }

    async fn release_lease(&self, agent_id: &str, story_id: &str) -> DriverResult<()> {
        self.releases
            .lock()
            .unwrap()
            .push((agent_id.to_string(), story_id.to_string()));
        Ok(())
    }

    async fn notify_state_change(&self, notification: Message) -> DriverResult<()> {
        self.notifications.lock().unwrap().push(notification);
        Ok(())
    }
}

/// Returns a fixed sequence of command outputs, one per call, repeating
/// the last once exhausted so a test doesn't need to script every call.
pub struct ScriptedContainer {
    outputs: Mutex<VecDeque<CommandOutput>>,
}

impl ScriptedContainer {
    pub fn new(outputs: Vec<CommandOutput>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
        }
    }

    pub fn always_succeeds() -> Self {
        Self::new(vec![CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }])
    }
}

#[async_trait]
impl ContainerExecutor for ScriptedContainer {
    async fn run(&self, _work_dir: &std::path::Path, _command: &[String]) -> DriverResult<CommandOutput> {
        let mut outputs = self.outputs.lock().unwrap();
        Ok(if outputs.len() > 1 {
            outputs.pop_front().unwrap()
        } else {
            outputs
                .front()
                .cloned()
                .unwrap_or(CommandOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
        })
    }
}

/// Plays back a fixed sequence of model turns, one `Vec<ToolEvent>` per
/// call to `run_turn`; returns no events once the script is exhausted,
/// which the tool loop treats as inactivity.
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Vec<ToolEvent>>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<ToolEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }

    pub fn single_tool_call(name: &str, input: Value) -> Self {
        Self::new(vec![vec![ToolEvent::ToolUse {
            id: "1".into(),
            name: name.to_string(),
            input,
        }]])
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn run_turn(&self, _messages: &[(Role, String)]) -> ToolLoopResult<Vec<ToolEvent>> {
        Ok(self.turns.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Echoes whatever input JSON it is given back as a string, standing in
/// for a real tool sandbox in tests that only care about control flow.
pub struct EchoToolExecutor;

#[async_trait]
impl ToolExecutor for EchoToolExecutor {
    async fn execute(&self, _name: &str, input: &Value) -> ToolLoopResult<String> {
        Ok(input.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_dispatcher_yields_then_shuts_down() {
        let dispatcher = ScriptedDispatcher::new(vec![StoryAssignment {
            story_id: "s-1".into(),
            repo_url: "git@example.com:repo.git".into(),
            repo_name: "repo".into(),
            base_branch: "main".into(),
            content: "do the thing".into(),
            story_type: "feature".into(),
        }]);

        let first = dispatcher.await_story("agent-1").await.unwrap();
        assert!(first.is_some());
        let second = dispatcher.await_story("agent-1").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn scripted_container_always_succeeds_reports_success() {
        let container = ScriptedContainer::always_succeeds();
        let output = container
            .run(std::path::Path::new("."), &["test".to_string()])
            .await
            .unwrap();
        assert!(output.succeeded());
    }
}
