//! Unit tests for the rolling upgrade planner

use super::*;

const OLD: &str = "0.9.1-0";
const NEW: &str = "0.9.1-1";

fn node(ordinal: u32, state: NodeState, version: &str) -> ProbedNode {
    ProbedNode {
        name: format!("v-{}", ordinal),
        ordinal,
        state,
        version: version.to_string(),
    }
}

fn observation(nodes: Vec<ProbedNode>) -> Observation {
    Observation {
        nodes,
        initialized: true,
    }
}

fn target<'a>(nodes: usize, current: &'a str, progress: Option<&'a UpgradeProgress>) -> UpgradeTarget<'a> {
    UpgradeTarget {
        version: NEW,
        nodes,
        current_version: current,
        progress,
        stall_threshold: 3,
    }
}

fn replaced(plan: &UpgradePlan) -> Option<&str> {
    plan.replace.as_ref().map(|r| r.name.as_str())
}

#[test]
fn test_stable_when_everything_runs_desired_version() {
    let obs = observation(vec![node(0, NodeState::Active, NEW), node(1, NodeState::Standby, NEW)]);
    let plan = plan_upgrade(&target(2, NEW, None), &obs);
    assert_eq!(plan.state, UpgradeState::Stable);
    assert!(plan.replace.is_none());
    assert!(plan.progress.is_none());
}

#[test]
fn test_fresh_cluster_is_stable() {
    let obs = observation(vec![node(0, NodeState::Sealed, NEW)]);
    let plan = plan_upgrade(&target(1, "", None), &obs);
    assert_eq!(plan.state, UpgradeState::Stable);
}

#[test]
fn test_old_standby_is_replaced_before_old_active() {
    let obs = observation(vec![node(0, NodeState::Active, OLD), node(1, NodeState::Standby, OLD)]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);

    assert_eq!(plan.state, UpgradeState::AwaitingSealedReplacement);
    assert_eq!(replaced(&plan), Some("v-1"));
    let progress = plan.progress.unwrap();
    assert_eq!(progress.node, "v-1");
    assert_eq!(progress.target_version, NEW);
    assert_eq!(progress.pending_passes, 0);
}

#[test]
fn test_sealed_old_nodes_go_first() {
    let obs = observation(vec![
        node(0, NodeState::Active, OLD),
        node(1, NodeState::Sealed, OLD),
        node(2, NodeState::Standby, OLD),
    ]);
    let plan = plan_upgrade(&target(3, OLD, None), &obs);
    assert_eq!(replaced(&plan), Some("v-1"));
}

#[test]
fn test_unreachable_old_node_goes_first() {
    let obs = observation(vec![
        node(0, NodeState::Active, OLD),
        node(1, NodeState::Standby, OLD),
        node(2, NodeState::Unreachable, OLD),
    ]);
    let plan = plan_upgrade(&target(3, OLD, None), &obs);
    assert_eq!(replaced(&plan), Some("v-2"));
    assert_eq!(plan.message, "replacing unreachable v-2 with 0.9.1-1");
}

#[test]
fn test_sealed_old_node_goes_before_unreachable_one() {
    // v-0 may still be the leader behind a failed probe
    let obs = observation(vec![node(0, NodeState::Unreachable, OLD), node(1, NodeState::Sealed, OLD)]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);
    assert_eq!(replaced(&plan), Some("v-1"));
    assert_eq!(plan.message, "replacing sealed v-1 with 0.9.1-1");
}

#[test]
fn test_unreachable_node_kept_when_nothing_else_is_unsealed() {
    let obs = observation(vec![
        node(0, NodeState::Unreachable, OLD),
        node(1, NodeState::Unreachable, OLD),
    ]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);
    assert!(plan.replace.is_none());
    assert_eq!(plan.state, UpgradeState::AwaitingPromotion);
}

#[test]
fn test_single_unreachable_node_is_replaced() {
    let obs = observation(vec![node(0, NodeState::Unreachable, OLD)]);
    let plan = plan_upgrade(&target(1, OLD, None), &obs);
    assert_eq!(replaced(&plan), Some("v-0"));
}

#[test]
fn test_waits_while_replacement_has_not_reappeared() {
    let progress = UpgradeProgress {
        node: "v-1".to_string(),
        target_version: NEW.to_string(),
        pending_passes: 0,
    };
    let obs = observation(vec![node(0, NodeState::Active, OLD)]);
    let plan = plan_upgrade(&target(2, OLD, Some(&progress)), &obs);

    assert_eq!(plan.state, UpgradeState::AwaitingSealedReplacement);
    assert!(plan.replace.is_none());
    assert!(!plan.stalled);
    assert_eq!(plan.progress.unwrap().pending_passes, 1);
}

#[test]
fn test_new_sealed_node_awaits_unseal() {
    let progress = UpgradeProgress {
        node: "v-1".to_string(),
        target_version: NEW.to_string(),
        pending_passes: 2,
    };
    let obs = observation(vec![node(0, NodeState::Active, OLD), node(1, NodeState::Sealed, NEW)]);
    let plan = plan_upgrade(&target(2, OLD, Some(&progress)), &obs);

    assert_eq!(plan.state, UpgradeState::AwaitingUnseal);
    assert!(plan.replace.is_none());
    // The replacement is back, so nothing is in flight anymore
    assert!(plan.progress.is_none());
}

#[test]
fn test_old_active_replaced_once_new_standby_exists() {
    let obs = observation(vec![node(0, NodeState::Active, OLD), node(1, NodeState::Standby, NEW)]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);
    assert_eq!(replaced(&plan), Some("v-0"));
}

#[test]
fn test_old_active_kept_without_new_standby() {
    // Membership short of desired: nothing moves
    let obs = observation(vec![node(0, NodeState::Active, OLD)]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);
    assert_eq!(plan.state, UpgradeState::AwaitingSealedReplacement);
    assert!(plan.replace.is_none());
}

#[test]
fn test_single_node_cluster_replaces_its_only_node() {
    let obs = observation(vec![node(0, NodeState::Active, OLD)]);
    let plan = plan_upgrade(&target(1, OLD, None), &obs);
    assert_eq!(replaced(&plan), Some("v-0"));
}

#[test]
fn test_no_leader_with_new_standby_awaits_promotion() {
    let obs = observation(vec![node(0, NodeState::Sealed, OLD), node(1, NodeState::Standby, NEW)]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);
    assert_eq!(plan.state, UpgradeState::AwaitingPromotion);
    assert!(plan.replace.is_none());
}

#[test]
fn test_all_new_without_leader_awaits_promotion() {
    let obs = observation(vec![node(0, NodeState::Standby, NEW), node(1, NodeState::Standby, NEW)]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);
    assert_eq!(plan.state, UpgradeState::AwaitingPromotion);
}

#[test]
fn test_complete_when_old_nodes_gone_and_leader_is_new() {
    let obs = observation(vec![node(0, NodeState::Standby, NEW), node(1, NodeState::Active, NEW)]);
    let plan = plan_upgrade(&target(2, OLD, None), &obs);
    assert_eq!(plan.state, UpgradeState::Complete);
    assert!(!plan.is_upgrading());
}

#[test]
fn test_sole_unsealed_old_standby_is_kept() {
    let obs = observation(vec![node(0, NodeState::Standby, OLD)]);
    let mut t = target(1, OLD, None);
    t.nodes = 1;
    let plan = plan_upgrade(&t, &obs);
    assert_eq!(plan.state, UpgradeState::AwaitingPromotion);
    assert!(plan.replace.is_none());
}

#[test]
fn test_stalled_replacement_is_reissued() {
    let progress = UpgradeProgress {
        node: "v-1".to_string(),
        target_version: NEW.to_string(),
        pending_passes: 2,
    };
    let obs = observation(vec![node(0, NodeState::Active, OLD)]);
    let plan = plan_upgrade(&target(2, OLD, Some(&progress)), &obs);

    assert!(plan.stalled);
    assert_eq!(
        plan.replace,
        Some(Replacement {
            name: "v-1".to_string(),
            ordinal: 1
        })
    );
    assert_eq!(plan.progress.unwrap().pending_passes, 0);
}

#[test]
fn test_progress_for_another_version_is_dropped() {
    let progress = UpgradeProgress {
        node: "v-1".to_string(),
        target_version: "0.9.2-0".to_string(),
        pending_passes: 5,
    };
    let obs = observation(vec![node(0, NodeState::Active, NEW), node(1, NodeState::Standby, NEW)]);
    let plan = plan_upgrade(&target(2, NEW, Some(&progress)), &obs);
    assert_eq!(plan.state, UpgradeState::Stable);
    assert!(plan.progress.is_none());
}

#[test]
fn test_never_two_old_nodes_down_at_once() {
    // One replacement in flight: the remaining old standby must wait
    let progress = UpgradeProgress {
        node: "v-2".to_string(),
        target_version: NEW.to_string(),
        pending_passes: 0,
    };
    let obs = observation(vec![node(0, NodeState::Active, OLD), node(1, NodeState::Standby, OLD)]);
    let plan = plan_upgrade(&target(3, OLD, Some(&progress)), &obs);
    assert!(plan.replace.is_none());
}
