//! Component E: the tool loop.
//!
//! Drives one turn of LLM-directed tool use to completion: feed the model
//! the current context, execute whatever tools it calls, feed results back,
//! and repeat until a terminal tool fires or a timeout trips. Shaped like
//! `harness/claude_code.rs`'s `ClaudeCodeHarness::build_args` /
//! `parse_output_line` elsewhere in this codebase (which classifies a
//! `stream-json` line's `type` field into text/tool_use/tool_result/error/
//! result) and its `is_subagent_tool`/`extract_subagent_request` MCP-prefix
//! handling.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{ContextManager, Role};
use crate::error::{ToolLoopError, ToolLoopResult};

/// One event decoded from a model turn, mirroring the `ResponseChunk`
/// variants elsewhere in this codebase.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    Error(String),
    /// The model ended its turn without further tool calls.
    End,
}

/// A model backend. The harness this mirrors buffers the whole stdout
/// stream before returning (not truly incremental); this trait keeps that
/// shape — one call returns every event of a single turn — rather than
/// presenting a per-token stream nothing downstream needs.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn run_turn(&self, messages: &[(Role, String)]) -> ToolLoopResult<Vec<ToolEvent>>;
}

/// Executes a single tool call and returns its result text.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, input: &Value) -> ToolLoopResult<String>;
}

/// Strips an MCP server prefix (`mcp__<server>__<name>`) so terminal-tool
/// matching and signal detection work on the logical tool name without
/// rewriting what's actually logged.
pub fn strip_mcp_prefix(tool_name: &str) -> &str {
    if let Some(rest) = tool_name.strip_prefix("mcp__") {
        if let Some(idx) = rest.find("__") {
            return &rest[idx + 2..];
        }
    }
    tool_name
}

/// The outcome of a completed tool loop, decoded from whichever terminal
/// tool fired (or from a timeout/inactivity condition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    PlanComplete,
    Done,
    Question(String),
    TodosAdd(String),
    StoryComplete,
    ContainerSwitch(String),
    Timeout,
    Inactivity,
    Error(String),
}

/// Tools whose firing ends the loop, mapped to how their result decodes
/// into a `Signal`.
pub struct TerminalTools {
    names: HashSet<String>,
}

impl TerminalTools {
    pub fn new(names: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            names: names.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.names.contains(strip_mcp_prefix(tool_name))
    }
}

/// Decodes a terminal tool's result text into a `Signal`. Each terminal
/// tool name maps to exactly one signal variant; an unrecognised terminal
/// tool is a programming error in the caller's `TerminalTools` set, not a
/// recoverable runtime condition, so it surfaces as `UndecodableResult`.
pub fn decode_terminal_result(tool_name: &str, output: &str) -> ToolLoopResult<Signal> {
    match strip_mcp_prefix(tool_name) {
        "submit_plan" => Ok(Signal::PlanComplete),
        "done" => Ok(Signal::Done),
        "ask_question" => Ok(Signal::Question(output.to_string())),
        "todos_add" => Ok(Signal::TodosAdd(output.to_string())),
        "mark_story_complete" => Ok(Signal::StoryComplete),
        "container_switch" => Ok(Signal::ContainerSwitch(output.to_string())),
        other => Err(ToolLoopError::UndecodableResult(
            other.to_string(),
            output.to_string(),
        )),
    }
}

/// Runs the tool loop to completion: feeds context to the model, executes
/// any tools it calls, appends results, and repeats. Returns once a
/// terminal tool fires, the model ends its turn without calling one, the
/// phase timeout elapses, or no events arrive for `inactivity_timeout`.
pub async fn run_tool_loop(
    client: &dyn LlmClient,
    executor: &dyn ToolExecutor,
    context: &mut ContextManager,
    terminal_tools: &TerminalTools,
    phase_timeout: Duration,
    inactivity_timeout: Duration,
) -> ToolLoopResult<Signal> {
    let turn_fut = run_turns(client, executor, context, terminal_tools, inactivity_timeout);

    match tokio::time::timeout(phase_timeout, turn_fut).await {
        Ok(result) => result,
        Err(_) => Ok(Signal::Timeout),
    }
}

async fn run_turns(
    client: &dyn LlmClient,
    executor: &dyn ToolExecutor,
    context: &mut ContextManager,
    terminal_tools: &TerminalTools,
    inactivity_timeout: Duration,
) -> ToolLoopResult<Signal> {
    loop {
        let messages: Vec<(Role, String)> = context
            .get_messages()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect();

        let events = match tokio::time::timeout(inactivity_timeout, client.run_turn(&messages)).await {
            Ok(result) => result?,
            Err(_) => return Ok(Signal::Inactivity),
        };

        if events.is_empty() {
            return Ok(Signal::Inactivity);
        }

        let mut saw_tool_use = false;

        for event in events {
            match event {
                ToolEvent::Text(text) => {
                    context.append(Role::Assistant, text, now());
                }
                ToolEvent::ToolUse { id, name, input } => {
                    saw_tool_use = true;
                    context.append(
                        Role::Assistant,
                        format!("[tool_use:{name}] {input}"),
                        now(),
                    );

                    if terminal_tools.contains(&name) {
                        let output = executor.execute(&name, &input).await?;
                        context.append(Role::Tool, format!("[tool_result:{id}] {output}"), now());
                        return decode_terminal_result(&name, &output);
                    }

                    let output = executor.execute(&name, &input).await?;
                    context.append(Role::Tool, format!("[tool_result:{id}] {output}"), now());
                }
                ToolEvent::ToolResult { id, output, is_error } => {
                    let tag = if is_error { "error" } else { "tool_result" };
                    context.append(Role::Tool, format!("[{tag}:{id}] {output}"), now());
                }
                ToolEvent::Error(msg) => return Ok(Signal::Error(msg)),
                ToolEvent::End => {
                    if !saw_tool_use {
                        return Ok(Signal::Done);
                    }
                }
            }
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedClient {
        turns: Mutex<Vec<Vec<ToolEvent>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn run_turn(&self, _messages: &[(Role, String)]) -> ToolLoopResult<Vec<ToolEvent>> {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                Ok(vec![])
            } else {
                Ok(turns.remove(0))
            }
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, _name: &str, input: &Value) -> ToolLoopResult<String> {
            Ok(input.to_string())
        }
    }

    fn mgr() -> ContextManager {
        ContextManager::new(Box::new(crate::context::ApproxTokenizer::new("cl100k_base")))
    }

    #[test]
    fn mcp_prefix_is_stripped_for_signal_detection() {
        assert_eq!(strip_mcp_prefix("mcp__planner__submit_plan"), "submit_plan");
        assert_eq!(strip_mcp_prefix("submit_plan"), "submit_plan");
    }

    #[tokio::test]
    async fn terminal_tool_ends_the_loop_with_the_right_signal() {
        let client = ScriptedClient {
            turns: Mutex::new(vec![vec![ToolEvent::ToolUse {
                id: "1".into(),
                name: "mcp__planner__submit_plan".into(),
                input: serde_json::json!({"plan": "do it"}),
            }]]),
        };
        let executor = EchoExecutor;
        let terminal = TerminalTools::new(["submit_plan", "done"]);
        let mut context = mgr();

        let signal = run_tool_loop(
            &client,
            &executor,
            &mut context,
            &terminal,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(signal, Signal::PlanComplete);
    }

    #[tokio::test]
    async fn end_without_tool_use_means_done() {
        let client = ScriptedClient {
            turns: Mutex::new(vec![vec![ToolEvent::Text("all set".into()), ToolEvent::End]]),
        };
        let executor = EchoExecutor;
        let terminal = TerminalTools::new(["submit_plan"]);
        let mut context = mgr();

        let signal = run_tool_loop(
            &client,
            &executor,
            &mut context,
            &terminal,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(signal, Signal::Done);
    }

    #[tokio::test]
    async fn no_events_is_treated_as_inactivity() {
        let client = ScriptedClient {
            turns: Mutex::new(vec![]),
        };
        let executor = EchoExecutor;
        let terminal = TerminalTools::new(["submit_plan"]);
        let mut context = mgr();

        let signal = run_tool_loop(
            &client,
            &executor,
            &mut context,
            &terminal,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(signal, Signal::Inactivity);
    }

    #[test]
    fn unrecognised_terminal_tool_is_undecodable() {
        let err = decode_terminal_result("mystery_tool", "output").unwrap_err();
        assert!(matches!(err, ToolLoopError::UndecodableResult(_, _)));
    }
}
