//! Scaling orchestrator.
//!
//! Pure: turns the desired size and the current observation into node
//! actions. Executing them is the reconciler's job.

use crate::observer::{NodeState, Observation, ProbedNode};
use std::collections::BTreeSet;

/// A membership change requested from the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    /// Start a node at this ordinal with the desired version
    Create { ordinal: u32 },
    /// Stop this node
    Remove { name: String },
}

/// Removal preference: lower goes first. An unreachable node may still be
/// serving, so it ranks after the nodes known to be sealed.
fn removal_rank(node: &ProbedNode) -> u8 {
    match node.state {
        NodeState::Sealed => 0,
        NodeState::Unreachable => 1,
        NodeState::Standby => 2,
        NodeState::Active => 3,
    }
}

/// Actions that bring membership to `desired` nodes.
///
/// Creates fill the lowest free ordinals. Removals prefer sealed nodes, then
/// unreachable ones, then standbys, then the active node, highest ordinal
/// first within each group. The last unsealed node is never removed, and
/// neither is an unreachable node while no node is observed unsealed.
pub fn reconcile_size(desired: usize, observation: &Observation) -> Vec<NodeAction> {
    let current = observation.len();

    if current < desired {
        let taken: BTreeSet<u32> = observation.nodes.iter().map(|n| n.ordinal).collect();
        return (0u32..)
            .filter(|o| !taken.contains(o))
            .take(desired - current)
            .map(|ordinal| NodeAction::Create { ordinal })
            .collect();
    }

    let mut excess = current.saturating_sub(desired);
    if excess == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<&ProbedNode> = observation.nodes.iter().collect();
    candidates.sort_by(|a, b| {
        removal_rank(a)
            .cmp(&removal_rank(b))
            .then(b.ordinal.cmp(&a.ordinal))
    });

    let mut unsealed_left = observation.unsealed().len();
    let mut actions = Vec::new();
    for node in candidates {
        if excess == 0 {
            break;
        }
        if node.state == NodeState::Unreachable && unsealed_left == 0 {
            continue;
        }
        if node.state.is_unsealed() {
            if unsealed_left <= 1 {
                continue;
            }
            unsealed_left -= 1;
        }
        actions.push(NodeAction::Remove { name: node.name.clone() });
        excess -= 1;
    }
    actions
}
