//! Rolling upgrade orchestrator.
//!
//! The upgrade state is never stored. Each pass derives it from the
//! observation, the desired version and the one replacement that may be in
//! flight (`status.upgrade`). At most one old-version node is torn down at a
//! time, and only when the cluster keeps an unsealed node while it is gone.

use crate::observer::{NodeState, Observation, ProbedNode};
use crds::UpgradeProgress;
use std::fmt;

/// Where a rolling upgrade stands in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Every member runs the desired version
    Stable,
    /// A replaced node has not come back yet, or membership is not settled
    AwaitingSealedReplacement,
    /// A new-version node is sealed; someone has to unseal it
    AwaitingUnseal,
    /// No leader, or the old leader cannot be replaced safely yet
    AwaitingPromotion,
    /// The last old node is gone and a new-version node leads
    Complete,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpgradeState::Stable => "Stable",
            UpgradeState::AwaitingSealedReplacement => "AwaitingSealedReplacement",
            UpgradeState::AwaitingUnseal => "AwaitingUnseal",
            UpgradeState::AwaitingPromotion => "AwaitingPromotion",
            UpgradeState::Complete => "Complete",
        };
        f.write_str(s)
    }
}

/// Tear down `name` and recreate it at the desired version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub name: String,
    pub ordinal: u32,
}

/// Decision for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePlan {
    pub state: UpgradeState,
    pub replace: Option<Replacement>,
    /// Progress to persist in status; `None` clears it
    pub progress: Option<UpgradeProgress>,
    /// The in-flight replacement exceeded the stall threshold this pass
    pub stalled: bool,
    pub message: String,
}

impl UpgradePlan {
    fn waiting(state: UpgradeState, progress: Option<UpgradeProgress>, message: String) -> Self {
        Self {
            state,
            replace: None,
            progress,
            stalled: false,
            message,
        }
    }

    pub fn is_upgrading(&self) -> bool {
        !matches!(self.state, UpgradeState::Stable | UpgradeState::Complete)
    }
}

/// Inputs that do not come from the observation.
#[derive(Debug, Clone)]
pub struct UpgradeTarget<'a> {
    pub version: &'a str,
    pub nodes: usize,
    /// `status.currentVersion` from the previous pass
    pub current_version: &'a str,
    pub progress: Option<&'a UpgradeProgress>,
    pub stall_threshold: u32,
}

fn replace(node: &ProbedNode, version: &str, message: String) -> UpgradePlan {
    UpgradePlan {
        state: UpgradeState::AwaitingSealedReplacement,
        replace: Some(Replacement {
            name: node.name.clone(),
            ordinal: node.ordinal,
        }),
        progress: Some(UpgradeProgress {
            node: node.name.clone(),
            target_version: version.to_string(),
            pending_passes: 0,
        }),
        stalled: false,
        message,
    }
}

/// Derives the upgrade state and the single replacement to perform, if any.
pub fn plan_upgrade(target: &UpgradeTarget<'_>, observation: &Observation) -> UpgradePlan {
    let desired = target.version;
    let is_new = |n: &&ProbedNode| n.version == desired;
    let old: Vec<&ProbedNode> = observation.nodes.iter().filter(|n| !is_new(n)).collect();
    let new: Vec<&ProbedNode> = observation.nodes.iter().filter(is_new).collect();

    // A replacement aimed at another version is obsolete
    let progress = target.progress.filter(|p| p.target_version == desired);

    let upgrading = !old.is_empty()
        || progress.is_some()
        || (!target.current_version.is_empty() && target.current_version != desired);
    if !upgrading {
        return UpgradePlan::waiting(UpgradeState::Stable, None, String::new());
    }

    if let Some(p) = progress {
        let back = observation.get(&p.node).is_some_and(|n| n.version == desired);
        if !back {
            let pending_passes = p.pending_passes + 1;
            if pending_passes >= target.stall_threshold {
                // Forward only: issue the same replacement again
                let ordinal = observation
                    .get(&p.node)
                    .map(|n| n.ordinal)
                    .or_else(|| node_ordinal(&p.node));
                if let Some(ordinal) = ordinal {
                    return UpgradePlan {
                        state: UpgradeState::AwaitingSealedReplacement,
                        replace: Some(Replacement {
                            name: p.node.clone(),
                            ordinal,
                        }),
                        progress: Some(UpgradeProgress {
                            pending_passes: 0,
                            ..p.clone()
                        }),
                        stalled: true,
                        message: format!(
                            "{} did not come back at {} after {} passes; replacing it again",
                            p.node, desired, pending_passes
                        ),
                    };
                }
            }
            return UpgradePlan::waiting(
                UpgradeState::AwaitingSealedReplacement,
                Some(UpgradeProgress {
                    pending_passes,
                    ..p.clone()
                }),
                format!("waiting for {} to come back at {}", p.node, desired),
            );
        }
    }

    if observation.len() != target.nodes {
        return UpgradePlan::waiting(
            UpgradeState::AwaitingSealedReplacement,
            None,
            format!("waiting for {} members, have {}", target.nodes, observation.len()),
        );
    }
    if let Some(n) = new.iter().find(|n| n.state == NodeState::Unreachable) {
        return UpgradePlan::waiting(
            UpgradeState::AwaitingSealedReplacement,
            None,
            format!("waiting for {} to become reachable", n.name),
        );
    }
    if let Some(n) = new.iter().find(|n| n.state == NodeState::Sealed) {
        return UpgradePlan::waiting(
            UpgradeState::AwaitingUnseal,
            None,
            format!("{} runs {} and must be unsealed", n.name, desired),
        );
    }

    let active = observation.active();
    let new_standby = new.iter().any(|n| n.state == NodeState::Standby);

    if old.is_empty() {
        return match active {
            None => UpgradePlan::waiting(
                UpgradeState::AwaitingPromotion,
                None,
                "waiting for a new-version node to become active".to_string(),
            ),
            Some(_) => UpgradePlan::waiting(
                UpgradeState::Complete,
                None,
                format!("all nodes run {}", desired),
            ),
        };
    }

    if active.is_none() && new_standby {
        return UpgradePlan::waiting(
            UpgradeState::AwaitingPromotion,
            None,
            "waiting for a standby to take over leadership".to_string(),
        );
    }

    let unsealed = observation.unsealed().len();
    let highest_first = |state: NodeState| {
        old.iter()
            .copied()
            .filter(move |n| n.state == state)
            .max_by_key(|n| n.ordinal)
    };

    if let Some(victim) = highest_first(NodeState::Sealed) {
        return replace(victim, desired, format!("replacing sealed {} with {}", victim.name, desired));
    }
    // An unreachable node may be the one still serving
    if let Some(victim) = highest_first(NodeState::Unreachable) {
        if unsealed >= 1 || target.nodes == 1 {
            return replace(victim, desired, format!("replacing unreachable {} with {}", victim.name, desired));
        }
        return UpgradePlan::waiting(
            UpgradeState::AwaitingPromotion,
            None,
            format!("{} is unreachable and no other node is unsealed", victim.name),
        );
    }

    if let Some(victim) = highest_first(NodeState::Standby) {
        if unsealed >= 2 {
            return replace(victim, desired, format!("replacing standby {} with {}", victim.name, desired));
        }
        return UpgradePlan::waiting(
            UpgradeState::AwaitingPromotion,
            None,
            format!("{} is the only unsealed node", victim.name),
        );
    }

    match old.iter().find(|n| n.state == NodeState::Active) {
        Some(victim) if target.nodes == 1 || (new_standby && unsealed >= 2) => {
            replace(victim, desired, format!("replacing active {} with {}", victim.name, desired))
        }
        Some(victim) => UpgradePlan::waiting(
            UpgradeState::AwaitingPromotion,
            None,
            format!("{} stays active until a {} standby can take over", victim.name, desired),
        ),
        None => UpgradePlan::waiting(
            UpgradeState::AwaitingPromotion,
            None,
            "waiting for an active node".to_string(),
        ),
    }
}

/// Ordinal suffix of a node name.
fn node_ordinal(name: &str) -> Option<u32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

#[cfg(test)]
#[path = "upgrade_test.rs"]
mod upgrade_test;
