//! Read-side helpers over MachineState records

use machina_common::crd::MachineState;
use machina_common::Result;

use crate::store::StateStore;

/// Name of the upgrade record kept for a pool
pub fn machine_state_name_for_pool(pool: &str) -> String {
    format!("{}-upgrade", pool)
}

/// True if every node's most recent state is `which`.
///
/// A record with no observations yet counts as true.
pub fn is_upgrading_progression_true(which: &str, state: &MachineState) -> bool {
    state
        .status
        .as_ref()
        .map(|s| s.most_recent_state.iter().all(|entry| entry.state == which))
        .unwrap_or(true)
}

/// Fetch the upgrade record for `pool`
pub async fn machine_state_for_pool(store: &dyn StateStore, pool: &str) -> Result<MachineState> {
    store.get_state(&machine_state_name_for_pool(pool)).await
}

/// [`is_upgrading_progression_true`] for the upgrade record of `pool`
pub async fn is_upgrading_progression_true_for_pool(
    store: &dyn StateStore,
    which: &str,
    pool: &str,
) -> Result<bool> {
    let state = machine_state_for_pool(store, pool).await?;
    Ok(is_upgrading_progression_true(which, &state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStateStore;
    use crate::writer::apply_observation;
    use machina_common::crd::ComponentKind;

    fn upgrade_record(states: &[(&str, &str)]) -> MachineState {
        states.iter().fold(
            MachineState::for_kind(ComponentKind::UpgradeProgression),
            |ms, (node, state)| apply_observation(ms, state, node, state, "test"),
        )
    }

    #[test]
    fn record_name_for_pool() {
        assert_eq!(machine_state_name_for_pool("worker"), "worker-upgrade");
    }

    #[test]
    fn all_nodes_in_state() {
        let ms = upgrade_record(&[("n1", "Done"), ("n2", "Done")]);
        assert!(is_upgrading_progression_true("Done", &ms));
        assert!(!is_upgrading_progression_true("Draining", &ms));
    }

    #[test]
    fn one_lagging_node_is_false() {
        let ms = upgrade_record(&[("n1", "Done"), ("n2", "Draining")]);
        assert!(!is_upgrading_progression_true("Done", &ms));
    }

    #[test]
    fn empty_record_is_true() {
        let mut ms = MachineState::for_kind(ComponentKind::UpgradeProgression);
        assert!(is_upgrading_progression_true("Done", &ms));
        ms.status = None;
        assert!(is_upgrading_progression_true("Done", &ms));
    }

    #[tokio::test]
    async fn pool_lookup_uses_upgrade_record() {
        let mut store = MockStateStore::new();
        store
            .expect_get_state()
            .withf(|name| name == "master-upgrade")
            .times(1)
            .returning(|_| Ok(upgrade_record(&[("m1", "Done")])));

        assert!(is_upgrading_progression_true_for_pool(&store, "Done", "master")
            .await
            .unwrap());
    }
}
