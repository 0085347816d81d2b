//! Component H: state handlers.
//!
//! One function per state, each taking the shared agent context and
//! returning where to go next. Shaped like `agent_runner.rs`'s per-phase
//! dispatch elsewhere in this codebase (one method per workflow phase, each
//! returning the next `WorkflowState`), generalized to this machine's 13
//! states, with the plan/code approval gates built on this crate's own
//! `EffectRuntime` rather than synchronous phase methods.

use std::time::Duration;

use crate::budget::{self, BudgetDecision, BudgetReviewContext, Phase};
use crate::context::Role;
use crate::effects::{tokio_util_cancel::CancelToken, Effect, EffectOutcome, EffectRuntime};
use crate::error::{DriverError, DriverResult, WorkspaceError};
use crate::interfaces::{CommandOutput, ContainerExecutor, Dispatcher, StoryOutcome};
use crate::message::{ApprovalStatus, ApprovalType};
use crate::state::AgentState;
use crate::state_store::{StateStore, StateValue};
use crate::tool_loop::{self, LlmClient, Signal, TerminalTools, ToolExecutor};
use crate::workspace::WorkspaceManager;
use crate::config::Config;
use crate::context::ContextManager;

pub struct AgentContext<'a> {
    pub agent_id: String,
    pub story_id: String,
    pub work_dir: std::path::PathBuf,
    pub state_store: &'a dyn StateStore,
    pub context: &'a mut ContextManager,
    pub effects: &'a EffectRuntime,
    pub cancel: &'a CancelToken,
    pub llm: &'a dyn LlmClient,
    pub tool_executor: &'a dyn ToolExecutor,
    pub container: &'a dyn ContainerExecutor,
    pub dispatcher: &'a dyn Dispatcher,
    pub workspace_manager: &'a WorkspaceManager,
    pub config: &'a Config,
}

#[derive(Debug)]
pub enum HandlerOutcome {
    Next(AgentState),
    /// The driver loop should stop calling handlers; the story reached a
    /// terminal resolution (merged, abandoned, or escalated).
    Finished,
    /// The handler can't make progress right now for a transient reason
    /// (a workspace network retry schedule ran out) and wants the driver
    /// to sleep and re-enter the same state rather than transition
    /// anywhere or fail the story.
    Suspend { retry_after: Duration },
}

/// Key under which a caught handler error's message is stored before the
/// driver forces a transition to `AgentState::Error`.
pub const ERROR_STATE_KEY: &str = "error";

/// Key tracking whether the dispatcher currently holds a lease for this
/// agent's story, so DONE/ERROR only release a lease that was actually
/// acquired in WAITING.
const LEASE_HELD_KEY: &str = "lease_held";

async fn release_lease_if_held(ctx: &mut AgentContext<'_>) -> DriverResult<()> {
    let held = match ctx.state_store.get(LEASE_HELD_KEY).await? {
        Some(value) => value.as_bool()?,
        None => false,
    };
    if held {
        ctx.dispatcher
            .release_lease(&ctx.agent_id, &ctx.story_id)
            .await?;
        ctx.state_store
            .set(LEASE_HELD_KEY, StateValue::Bool(false))
            .await?;
    }
    Ok(())
}

async fn origin_state(ctx: &AgentContext<'_>, key: &str) -> DriverResult<AgentState> {
    let raw = ctx
        .state_store
        .get(key)
        .await?
        .ok_or_else(|| DriverError::InvalidTransition {
            from: "unknown".into(),
            to: "unknown".into(),
        })?;
    let name = raw.as_str()?;
    parse_state_name(name).ok_or_else(|| DriverError::InvalidTransition {
        from: name.to_string(),
        to: "unknown".into(),
    })
}

fn parse_state_name(name: &str) -> Option<AgentState> {
    use AgentState::*;
    Some(match name {
        "Waiting" => Waiting,
        "Setup" => Setup,
        "Planning" => Planning,
        "PlanReview" => PlanReview,
        "Coding" => Coding,
        "Testing" => Testing,
        "Fixing" => Fixing,
        "CodeReview" => CodeReview,
        "BudgetReview" => BudgetReview,
        "AwaitMerge" => AwaitMerge,
        "Question" => Question,
        "Done" => Done,
        "Error" => Error,
        _ => return None,
    })
}

pub async fn handle_waiting(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    match ctx.dispatcher.await_story(&ctx.agent_id).await? {
        Some(assignment) => {
            ctx.story_id = assignment.story_id.clone();
            ctx.dispatcher
                .set_lease(&ctx.agent_id, &ctx.story_id)
                .await?;
            ctx.state_store
                .set(LEASE_HELD_KEY, StateValue::Bool(true))
                .await?;
            ctx.state_store
                .set("story_repo_url", StateValue::Str(assignment.repo_url))
                .await?;
            ctx.state_store
                .set("story_repo_name", StateValue::Str(assignment.repo_name))
                .await?;
            ctx.state_store
                .set("story_base_branch", StateValue::Str(assignment.base_branch))
                .await?;
            ctx.state_store
                .set("story_type", StateValue::Str(assignment.story_type))
                .await?;
            ctx.context
                .append_pinned(Role::User, assignment.content, now());
            Ok(HandlerOutcome::Next(AgentState::Setup))
        }
        // The dispatcher hands out `None` to signal its story channel has
        // closed, not "nothing is queued yet" — WAITING has nothing left
        // to wait for, so this is an error the driver forces into ERROR.
        None => Err(DriverError::StoryChannelClosed),
    }
}

pub async fn handle_setup(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let repo_url = get_str(ctx, "story_repo_url").await?;
    let repo_name = get_str(ctx, "story_repo_name").await?;
    let base_branch = get_str(ctx, "story_base_branch").await?;

    let workspace = match ctx
        .workspace_manager
        .setup_workspace(
            &repo_url,
            &repo_name,
            &base_branch,
            &ctx.work_dir,
            &ctx.agent_id,
            &ctx.story_id,
        )
        .await
    {
        Ok(workspace) => workspace,
        Err(err) => {
            let retry_after = Duration::from_secs(ctx.config.workspace.suspend_retry_secs);
            return workspace_error_to_outcome(err, retry_after);
        }
    };

    ctx.state_store
        .set("workspace_branch", StateValue::Str(workspace.branch_name))
        .await?;

    Ok(HandlerOutcome::Next(AgentState::Planning))
}

/// A workspace's network-retry schedule running out isn't a terminal
/// failure: SETUP suspends and tries again later instead of escalating the
/// story. Any other workspace error (bad repo, disk full, branch
/// exhaustion) is a real failure and propagates for the driver to force
/// into ERROR.
fn workspace_error_to_outcome(err: WorkspaceError, retry_after: Duration) -> DriverResult<HandlerOutcome> {
    match err {
        WorkspaceError::NetworkExhausted { .. } => Ok(HandlerOutcome::Suspend { retry_after }),
        other => Err(other.into()),
    }
}

async fn get_str(ctx: &AgentContext<'_>, key: &str) -> DriverResult<String> {
    let value = ctx.state_store.get(key).await?.ok_or_else(|| {
        DriverError::InvalidTransition {
            from: format!("missing key {key}"),
            to: "Setup".into(),
        }
    })?;
    Ok(value.as_str()?.to_string())
}

/// Shared iterate-until-signal loop used by PLANNING, CODING, and FIXING:
/// each call to the tool loop is one budget-counted iteration, repeated
/// until a terminal signal resolves it or the phase's budget trips.
async fn run_phase(
    ctx: &mut AgentContext<'_>,
    phase: Phase,
    terminal_tools: &TerminalTools,
    current_state: AgentState,
) -> DriverResult<HandlerOutcome> {
    let default_budget = ctx.config.budget_for(phase);

    loop {
        let (_, tripped) =
            budget::check_budget(ctx.state_store, &ctx.story_id, phase, default_budget).await?;
        if tripped {
            ctx.state_store
                .set("budget:origin_state", StateValue::Str(current_state.to_string()))
                .await?;
            return Ok(HandlerOutcome::Next(AgentState::BudgetReview));
        }

        let signal = tool_loop::run_tool_loop(
            ctx.llm,
            ctx.tool_executor,
            ctx.context,
            terminal_tools,
            std::time::Duration::from_secs(ctx.config.tool_loop.phase_timeout_secs),
            std::time::Duration::from_secs(ctx.config.tool_loop.inactivity_timeout_secs),
        )
        .await?;

        match signal {
            Signal::PlanComplete => return Ok(HandlerOutcome::Next(AgentState::PlanReview)),
            Signal::Done => {
                if matches!(phase, Phase::Coding | Phase::Fixing) {
                    return Ok(HandlerOutcome::Next(AgentState::Testing));
                }
                // Planning ended without submitting a plan; counts as an
                // iteration, try again.
                continue;
            }
            Signal::Question(text) => {
                ctx.state_store
                    .set("question_text", StateValue::Str(text))
                    .await?;
                ctx.state_store
                    .set("question:origin_state", StateValue::Str(current_state.to_string()))
                    .await?;
                return Ok(HandlerOutcome::Next(AgentState::Question));
            }
            Signal::TodosAdd(text) => {
                // Updates the running todo list without ending the phase;
                // counts as an iteration, same as Done-without-a-plan does
                // for Planning.
                ctx.context.append(Role::Tool, format!("todos updated:\n{text}"), now());
                continue;
            }
            Signal::Timeout | Signal::Inactivity | Signal::Error(_) => {
                // Counts against the phase budget; loop again.
                continue;
            }
            other => {
                return Err(DriverError::InvalidTransition {
                    from: format!("{other:?}"),
                    to: current_state.to_string(),
                })
            }
        }
    }
}

pub async fn handle_planning(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let terminal = TerminalTools::new(["submit_plan", "ask_question"]);
    run_phase(ctx, Phase::Planning, &terminal, AgentState::Planning).await
}

pub async fn handle_coding(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let terminal = TerminalTools::new(["done", "ask_question", "todos_add"]);
    run_phase(ctx, Phase::Coding, &terminal, AgentState::Coding).await
}

pub async fn handle_fixing(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let terminal = TerminalTools::new(["done", "ask_question", "todos_add"]);
    run_phase(ctx, Phase::Fixing, &terminal, AgentState::Fixing).await
}

async fn run_approval(
    ctx: &mut AgentContext<'_>,
    approval_type: ApprovalType,
    content: String,
    reason: String,
    on_approved: AgentState,
    on_needs_changes: AgentState,
) -> DriverResult<HandlerOutcome> {
    let outcome = ctx
        .effects
        .execute(
            Effect::Approval {
                content,
                reason,
                approval_type,
                story_id: ctx.story_id.clone(),
            },
            ctx.cancel,
        )
        .await?;

    match outcome {
        EffectOutcome::Approval { status, feedback } => {
            if let Some(feedback) = feedback {
                ctx.context.append(Role::User, feedback, now());
            }
            match status {
                ApprovalStatus::Approved => Ok(HandlerOutcome::Next(on_approved)),
                ApprovalStatus::NeedsChanges => Ok(HandlerOutcome::Next(on_needs_changes)),
                ApprovalStatus::Rejected => Ok(HandlerOutcome::Next(AgentState::Error)),
            }
        }
        _ => Err(DriverError::InvalidTransition {
            from: "ApprovalEffect".into(),
            to: "unexpected outcome".into(),
        }),
    }
}

pub async fn handle_plan_review(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let plan = ctx
        .context
        .get_messages()
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();

    run_approval(
        ctx,
        ApprovalType::Plan,
        plan,
        "plan ready for review".into(),
        AgentState::Coding,
        AgentState::Planning,
    )
    .await
}

pub async fn handle_code_review(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let summary = ctx
        .context
        .get_messages()
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();

    run_approval(
        ctx,
        ApprovalType::Code,
        summary,
        "implementation ready for review".into(),
        AgentState::AwaitMerge,
        AgentState::Fixing,
    )
    .await
}

pub async fn handle_testing(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let output = run_tests(ctx).await?;
    if output.succeeded() {
        Ok(HandlerOutcome::Next(AgentState::CodeReview))
    } else {
        ctx.context.append(
            Role::Tool,
            format!("test run failed:\n{}", output.stderr),
            now(),
        );
        Ok(HandlerOutcome::Next(AgentState::Fixing))
    }
}

async fn run_tests(ctx: &AgentContext<'_>) -> DriverResult<CommandOutput> {
    Ok(ctx
        .container
        .run(&ctx.work_dir, &["test".to_string()])
        .await?)
}

pub async fn handle_budget_review(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let origin = origin_state(ctx, "budget:origin_state").await?;
    let phase = state_to_phase(origin).unwrap_or(Phase::Coding);

    let iterations_used = budget::current_iterations(ctx.state_store, &ctx.story_id, phase).await?;
    let recent_context = ctx.context.get_window(10_000);
    let review_ctx = BudgetReviewContext {
        story_id: &ctx.story_id,
        phase,
        iterations_used,
        iteration_budget: ctx.config.budget_for(phase),
        plan_summary: "",
        recent_context: &recent_context,
        last_tool_invocations: &[],
        heuristic_issue_pattern: None,
    };
    let content = budget::render_review_content(&review_ctx);

    let outcome = ctx
        .effects
        .execute(
            Effect::BudgetReview {
                content,
                origin_state: origin.to_string(),
                story_id: ctx.story_id.clone(),
                timeout: std::time::Duration::from_secs(ctx.config.effects.budget_review_timeout_secs),
            },
            ctx.cancel,
        )
        .await?;

    let feedback = match outcome {
        EffectOutcome::BudgetReview { feedback } => feedback.unwrap_or_default(),
        _ => {
            return Err(DriverError::InvalidTransition {
                from: "BudgetReviewEffect".into(),
                to: "unexpected outcome".into(),
            })
        }
    };

    let decision = budget::parse_feedback(&feedback, ctx.config.budgets.continue_increment)?;
    match decision {
        BudgetDecision::Continue(n) => {
            let default_budget = ctx.config.budget_for(phase);
            budget::extend_budget(ctx.state_store, &ctx.story_id, phase, default_budget, n).await?;
            Ok(HandlerOutcome::Next(origin))
        }
        BudgetDecision::Pivot => {
            budget::reset_budget(ctx.state_store, &ctx.story_id, phase).await?;
            Ok(HandlerOutcome::Next(AgentState::Planning))
        }
        BudgetDecision::Escalate | BudgetDecision::Abandon => Ok(HandlerOutcome::Next(AgentState::Error)),
    }
}

fn state_to_phase(state: AgentState) -> Option<Phase> {
    match state {
        AgentState::Planning => Some(Phase::Planning),
        AgentState::Coding => Some(Phase::Coding),
        AgentState::Fixing => Some(Phase::Fixing),
        _ => None,
    }
}

pub async fn handle_question(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let question = get_str(ctx, "question_text").await?;
    let origin = origin_state(ctx, "question:origin_state").await?;

    let outcome = ctx
        .effects
        .execute(
            Effect::Question {
                content: question,
                origin_state: origin.to_string(),
                story_id: ctx.story_id.clone(),
            },
            ctx.cancel,
        )
        .await?;

    match outcome {
        EffectOutcome::Answer { text } => {
            ctx.context.append(Role::User, text, now());
            Ok(HandlerOutcome::Next(origin))
        }
        _ => Err(DriverError::InvalidTransition {
            from: "QuestionEffect".into(),
            to: "unexpected outcome".into(),
        }),
    }
}

pub async fn handle_await_merge(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    let branch = get_str(ctx, "workspace_branch").await?;
    let output = ctx.container.run(&ctx.work_dir, &["push".to_string()]).await?;

    if output.succeeded() {
        ctx.dispatcher
            .submit_outcome(&ctx.agent_id, &ctx.story_id, StoryOutcome::Merged { branch })
            .await?;
        Ok(HandlerOutcome::Next(AgentState::Done))
    } else {
        ctx.context
            .append(Role::Tool, format!("merge failed:\n{}", output.stderr), now());
        Ok(HandlerOutcome::Next(AgentState::Fixing))
    }
}

pub async fn handle_done(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    release_lease_if_held(ctx).await?;
    ctx.state_store.persist().await?;
    Ok(HandlerOutcome::Finished)
}

pub async fn handle_error(ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    release_lease_if_held(ctx).await?;
    // A channel close in WAITING reaches here with no story ever assigned;
    // there's nothing to escalate to the dispatcher in that case.
    if !ctx.story_id.is_empty() {
        ctx.dispatcher
            .submit_outcome(
                &ctx.agent_id,
                &ctx.story_id,
                StoryOutcome::Escalated {
                    reason: "agent entered the Error state".into(),
                },
            )
            .await?;
    }
    Ok(HandlerOutcome::Finished)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A workspace that can't reach the network before its retry schedule
    /// runs out suspends SETUP for a later retry instead of escalating the
    /// story as a failure.
    #[test]
    fn network_exhaustion_during_setup_suspends_rather_than_errors() {
        let err = WorkspaceError::NetworkExhausted {
            attempts: 4,
            last_error: "connection refused".into(),
        };
        let outcome = workspace_error_to_outcome(err, Duration::from_secs(30)).unwrap();
        assert!(matches!(
            outcome,
            HandlerOutcome::Suspend { retry_after } if retry_after == Duration::from_secs(30)
        ));
    }

    /// Any other workspace failure is real and still propagates for the
    /// driver to force the story into ERROR.
    #[test]
    fn other_workspace_errors_during_setup_propagate_as_driver_errors() {
        let err = WorkspaceError::GitFailed("fatal: bad object".into());
        assert!(workspace_error_to_outcome(err, Duration::from_secs(30)).is_err());
    }
}
