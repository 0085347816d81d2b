//! Component G: the budget controller.
//!
//! Tracks per-phase iteration counters against a configured ceiling and, on
//! breach, assembles the content of a `BudgetReview` effect for the
//! architect. Shaped like `iterative_loop.rs`'s iteration-count bookkeeping
//! and `ralph_loop.rs`'s plan/build iteration split elsewhere in this
//! codebase, narrowed to the three named phases and persisted through the
//! state store rather than an in-process counter, so a budget review
//! survives a restart.

use serde::{Deserialize, Serialize};

use crate::context::ContextMessage;
use crate::error::{EffectError, EffectResult};
use crate::state_store::{StateStore, StateValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Planning,
    Coding,
    Fixing,
}

impl Phase {
    fn counter_key(self, story_id: &str) -> String {
        format!("budget:{}:{story_id}:iterations", self.key_fragment())
    }

    fn ceiling_key(self, story_id: &str) -> String {
        format!("budget:{}:{story_id}:ceiling", self.key_fragment())
    }

    fn key_fragment(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Coding => "coding",
            Phase::Fixing => "fixing",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "PLANNING",
            Phase::Coding => "CODING",
            Phase::Fixing => "FIXING",
        }
    }
}

/// The architect's resolution of a budget review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Grants `n` additional iterations before the next review.
    Continue(u32),
    /// Abandon the current approach within the same phase; the handler
    /// should re-plan without burning further iterations of this phase.
    Pivot,
    /// Escalate to a human outside the architect/agent loop; the agent
    /// should move to `Error` carrying the escalation reason.
    Escalate,
    /// Abandon the story outright.
    Abandon,
}

/// Parses free-text architect feedback into a decision. Accepts
/// `CONTINUE`, `CONTINUE[N]`, `PIVOT`, `ESCALATE`, `ABANDON`
/// case-insensitively, trimmed of surrounding whitespace.
pub fn parse_feedback(feedback: &str, default_increment: u32) -> EffectResult<BudgetDecision> {
    let trimmed = feedback.trim();
    let upper = trimmed.to_uppercase();

    if upper == "PIVOT" {
        return Ok(BudgetDecision::Pivot);
    }
    if upper == "ESCALATE" {
        return Ok(BudgetDecision::Escalate);
    }
    if upper == "ABANDON" {
        return Ok(BudgetDecision::Abandon);
    }
    if upper == "CONTINUE" {
        return Ok(BudgetDecision::Continue(default_increment));
    }
    if let Some(rest) = upper.strip_prefix("CONTINUE[").and_then(|s| s.strip_suffix(']')) {
        return rest
            .parse::<u32>()
            .map(BudgetDecision::Continue)
            .map_err(|_| EffectError::UnparseableFeedback(trimmed.to_string()));
    }

    Err(EffectError::UnparseableFeedback(trimmed.to_string()))
}

/// Everything a `BudgetReview` effect needs to describe the stuck phase to
/// the architect, assembled by the calling handler from tool-loop history
/// and context state.
pub struct BudgetReviewContext<'a> {
    pub story_id: &'a str,
    pub phase: Phase,
    pub iterations_used: u32,
    pub iteration_budget: u32,
    pub plan_summary: &'a str,
    /// Context window capped to roughly 10k tokens by the caller before
    /// being handed here; this module does not re-truncate it.
    pub recent_context: &'a [ContextMessage],
    pub last_tool_invocations: &'a [String],
    pub heuristic_issue_pattern: Option<&'a str>,
}

/// Renders the human-readable body of a `BudgetReviewRequest` payload.
pub fn render_review_content(ctx: &BudgetReviewContext<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Story {} is stuck in {} after {}/{} iterations.\n\n",
        ctx.story_id,
        ctx.phase.as_str(),
        ctx.iterations_used,
        ctx.iteration_budget
    ));
    out.push_str("Plan:\n");
    out.push_str(ctx.plan_summary);
    out.push_str("\n\nRecent context:\n");
    for msg in ctx.recent_context {
        out.push_str(&format!("- [{:?}] {}\n", msg.role, msg.content));
    }
    out.push_str("\nLast tool invocations:\n");
    let tail_start = ctx.last_tool_invocations.len().saturating_sub(5);
    for call in &ctx.last_tool_invocations[tail_start..] {
        out.push_str(&format!("- {call}\n"));
    }
    if let Some(pattern) = ctx.heuristic_issue_pattern {
        out.push_str(&format!("\nSuspected issue pattern: {pattern}\n"));
    }
    out
}

/// Reads the effective ceiling for `phase` — `default_budget` unless a
/// prior `Continue[N]` decision raised it via `extend_budget`.
pub async fn effective_budget(
    store: &dyn StateStore,
    story_id: &str,
    phase: Phase,
    default_budget: u32,
) -> crate::error::StateStoreResult<u32> {
    match store.get(&phase.ceiling_key(story_id)).await? {
        Some(v) => Ok(v.as_int()? as u32),
        None => Ok(default_budget),
    }
}

/// Reads, increments, and persists the iteration counter for `phase` on
/// `story_id`; returns `true` once the count exceeds the phase's effective
/// ceiling (`default_budget`, or higher if a prior `Continue[N]` raised
/// it), at which point the caller should raise a `BudgetReview` effect
/// instead of proceeding.
pub async fn check_budget(
    store: &dyn StateStore,
    story_id: &str,
    phase: Phase,
    default_budget: u32,
) -> crate::error::StateStoreResult<(u32, bool)> {
    let key = phase.counter_key(story_id);
    let current = match store.get(&key).await? {
        Some(v) => v.as_int()? as u32,
        None => 0,
    };
    let next = current + 1;
    store.set(&key, StateValue::Int(next as i64)).await?;
    let ceiling = effective_budget(store, story_id, phase, default_budget).await?;
    Ok((next, next > ceiling))
}

/// Reads the current iteration count for `phase` without incrementing it,
/// for use when rendering a budget-review summary.
pub async fn current_iterations(
    store: &dyn StateStore,
    story_id: &str,
    phase: Phase,
) -> crate::error::StateStoreResult<u32> {
    match store.get(&phase.counter_key(story_id)).await? {
        Some(v) => Ok(v.as_int()? as u32),
        None => Ok(0),
    }
}

/// Raises the effective ceiling for `phase` by `n` additional iterations,
/// applied after a `Continue` decision so the next `check_budget` call
/// doesn't immediately re-trip.
pub async fn extend_budget(
    store: &dyn StateStore,
    story_id: &str,
    phase: Phase,
    default_budget: u32,
    n: u32,
) -> crate::error::StateStoreResult<u32> {
    let current = effective_budget(store, story_id, phase, default_budget).await?;
    let raised = current + n;
    store
        .set(&phase.ceiling_key(story_id), StateValue::Int(raised as i64))
        .await?;
    Ok(raised)
}

/// Resets the counter and ceiling for `phase`, applied after a `Pivot`
/// decision moves the story back into planning with a clean slate for
/// that phase.
pub async fn reset_budget(
    store: &dyn StateStore,
    story_id: &str,
    phase: Phase,
) -> crate::error::StateStoreResult<()> {
    store.delete(&phase.counter_key(story_id)).await?;
    store.delete(&phase.ceiling_key(story_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::MemoryStateStore;

    #[test]
    fn parses_continue_with_explicit_amount() {
        assert_eq!(
            parse_feedback("continue[3]", 2).unwrap(),
            BudgetDecision::Continue(3)
        );
    }

    #[test]
    fn parses_bare_continue_using_default_increment() {
        assert_eq!(
            parse_feedback("Continue", 2).unwrap(),
            BudgetDecision::Continue(2)
        );
    }

    #[test]
    fn parses_pivot_escalate_abandon() {
        assert_eq!(parse_feedback("pivot", 2).unwrap(), BudgetDecision::Pivot);
        assert_eq!(parse_feedback("ESCALATE", 2).unwrap(), BudgetDecision::Escalate);
        assert_eq!(parse_feedback(" abandon ", 2).unwrap(), BudgetDecision::Abandon);
    }

    #[test]
    fn rejects_garbage_feedback() {
        assert!(parse_feedback("maybe later", 2).is_err());
        assert!(parse_feedback("CONTINUE[three]", 2).is_err());
    }

    #[tokio::test]
    async fn check_budget_trips_only_after_exceeding_the_ceiling() {
        let store = MemoryStateStore::new("agent-1");
        for _ in 0..3 {
            let (_, tripped) = check_budget(&store, "s-1", Phase::Coding, 3).await.unwrap();
            assert!(!tripped);
        }
        let (count, tripped) = check_budget(&store, "s-1", Phase::Coding, 3).await.unwrap();
        assert_eq!(count, 4);
        assert!(tripped);
    }

    #[tokio::test]
    async fn extend_budget_prevents_an_immediate_retrip() {
        let store = MemoryStateStore::new("agent-1");
        for _ in 0..4 {
            check_budget(&store, "s-1", Phase::Coding, 3).await.unwrap();
        }
        extend_budget(&store, "s-1", Phase::Coding, 3, 2).await.unwrap();
        let (count, tripped) = check_budget(&store, "s-1", Phase::Coding, 3).await.unwrap();
        assert_eq!(count, 5);
        assert!(!tripped, "extended ceiling should absorb the next iteration");
    }

    #[tokio::test]
    async fn reset_budget_clears_the_counter() {
        let store = MemoryStateStore::new("agent-1");
        check_budget(&store, "s-1", Phase::Planning, 5).await.unwrap();
        reset_budget(&store, "s-1", Phase::Planning).await.unwrap();
        let (count, _) = check_budget(&store, "s-1", Phase::Planning, 5).await.unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn review_content_includes_only_the_last_five_tool_invocations() {
        let invocations: Vec<String> = (0..8).map(|i| format!("tool-{i}")).collect();
        let ctx = BudgetReviewContext {
            story_id: "s-1",
            phase: Phase::Fixing,
            iterations_used: 9,
            iteration_budget: 8,
            plan_summary: "fix the flaky test",
            recent_context: &[],
            last_tool_invocations: &invocations,
            heuristic_issue_pattern: Some("repeated test failure on the same assertion"),
        };
        let rendered = render_review_content(&ctx);
        assert!(rendered.contains("tool-3"));
        assert!(rendered.contains("tool-7"));
        assert!(!rendered.contains("tool-2"));
        assert!(rendered.contains("repeated test failure"));
    }
}
