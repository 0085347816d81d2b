//! External interface contracts.
//!
//! The boundaries this crate talks across but does not itself implement:
//! the dispatcher that hands out story assignments and receives results,
//! and the container executor a coding agent drives tool calls against.
//! Shaped like `traits.rs`'s `AgentRunner`/`ModelBackend` split elsewhere in
//! this codebase — core defines the contract, a binary crate supplies the
//! concrete backend — narrowed to what this agent's driver loop actually
//! calls across.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverResult;
use crate::message::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryAssignment {
    pub story_id: String,
    pub repo_url: String,
    pub repo_name: String,
    pub base_branch: String,
    pub content: String,
    pub story_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoryOutcome {
    Merged { branch: String },
    Abandoned { reason: String },
    Escalated { reason: String },
}

/// The dispatcher assigns a story to a waiting agent and receives the
/// agent's terminal outcome. `await_story` blocks (cooperatively) until a
/// story is available or the agent is told to shut down.
///
/// It also holds the lease binding an agent to the story it was handed:
/// `set_lease` is called once a story is accepted in WAITING, and
/// `release_lease` once the agent reaches DONE or ERROR, so the dispatcher
/// always knows which stories are actively claimed. `notify_state_change`
/// is the dispatcher's one wire notification channel, used to publish
/// STATE_CHANGE events as the driver transitions.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn await_story(&self, agent_id: &str) -> DriverResult<Option<StoryAssignment>>;
    async fn submit_outcome(&self, agent_id: &str, story_id: &str, outcome: StoryOutcome) -> DriverResult<()>;
    async fn set_lease(&self, agent_id: &str, story_id: &str) -> DriverResult<()>;
    async fn release_lease(&self, agent_id: &str, story_id: &str) -> DriverResult<()>;
    async fn notify_state_change(&self, notification: Message) -> DriverResult<()>;
}

/// Runs commands inside the agent's container (test suites, build steps).
/// Shaped like the container-executor split in `harness` elsewhere in this
/// codebase — the harness drives the model, something else drives the
/// sandbox the model's tool calls execute in.
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    async fn run(&self, work_dir: &std::path::Path, command: &[String]) -> DriverResult<CommandOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}
