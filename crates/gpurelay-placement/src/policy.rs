//! Node selection policy.
//!
//! Every strategy works on the same filtered candidate set:
//!
//! - not the excluded node
//! - status is `Ready`, `Stopped`, `Warming` or `Emergency`
//! - more than [`MIN_SELECTABLE_QUOTA_SECS`] of quota left
//!
//! The quota floor is absolute. A node about to run dry would need another
//! switch right after starting, so it is never picked automatically.

use std::cmp::Ordering;

use tracing::debug;

use gpurelay_state::{Node, NodeStatus, Strategy};

use crate::cursor::RoundRobinCursor;

/// Minimum remaining quota for a node to be selectable (30 minutes).
pub const MIN_SELECTABLE_QUOTA_SECS: u64 = 30 * 60;

fn selectable_status(status: NodeStatus) -> bool {
    matches!(
        status,
        NodeStatus::Ready | NodeStatus::Stopped | NodeStatus::Warming | NodeStatus::Emergency
    )
}

/// Nodes eligible for selection, ordered by id.
pub fn candidates<'a>(nodes: &'a [Node], exclude: Option<&str>) -> Vec<&'a Node> {
    let mut out: Vec<&Node> = nodes
        .iter()
        .filter(|n| Some(n.id.as_str()) != exclude)
        .filter(|n| selectable_status(n.status))
        .filter(|n| n.remaining_quota_secs() > MIN_SELECTABLE_QUOTA_SECS)
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// Pick the next node under `strategy`.
///
/// Pure for every strategy except `RoundRobin`, which advances `cursor`
/// by one per call that finds at least one candidate.
pub fn select_next(
    nodes: &[Node],
    exclude: Option<&str>,
    strategy: Strategy,
    cursor: &RoundRobinCursor,
) -> Option<Node> {
    let pool = candidates(nodes, exclude);
    if pool.is_empty() {
        debug!(?exclude, ?strategy, "no selectable node");
        return None;
    }

    let chosen = match strategy {
        Strategy::MaxQuota => pool.into_iter().min_by(|a, b| max_quota_order(a, b)),
        Strategy::FastestStart => pool.into_iter().min_by(|a, b| fastest_start_order(a, b)),
        Strategy::SmartBalance => pool.into_iter().min_by(|a, b| smart_balance_order(a, b)),
        Strategy::RoundRobin => cursor.pick(&pool).copied(),
    };
    chosen.cloned()
}

/// Pick a reserve node for emergency activation.
///
/// Only emergency nodes that can quick-start and are `Ready` or `Stopped`
/// qualify; the fastest to start wins.
pub fn select_emergency(nodes: &[Node], exclude: Option<&str>) -> Option<Node> {
    nodes
        .iter()
        .filter(|n| Some(n.id.as_str()) != exclude)
        .filter(|n| n.is_emergency && n.can_quick_start)
        .filter(|n| matches!(n.status, NodeStatus::Ready | NodeStatus::Stopped))
        .min_by(|a, b| {
            a.estimated_start_secs
                .cmp(&b.estimated_start_secs)
                .then_with(|| a.id.cmp(&b.id))
        })
        .cloned()
}

/// `Ready` sorts before anything else.
fn ready_first(a: &Node, b: &Node) -> Ordering {
    b.is_ready().cmp(&a.is_ready())
}

fn max_quota_order(a: &Node, b: &Node) -> Ordering {
    b.remaining_quota_secs()
        .cmp(&a.remaining_quota_secs())
        .then_with(|| a.id.cmp(&b.id))
}

fn fastest_start_order(a: &Node, b: &Node) -> Ordering {
    ready_first(a, b)
        .then_with(|| a.estimated_start_secs.cmp(&b.estimated_start_secs))
        .then_with(|| a.id.cmp(&b.id))
}

/// Priority ascending, then `Ready` first, then most quota left.
fn smart_balance_order(a: &Node, b: &Node) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| ready_first(a, b))
        .then_with(|| b.remaining_quota_secs().cmp(&a.remaining_quota_secs()))
        .then_with(|| a.id.cmp(&b.id))
}
