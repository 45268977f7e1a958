//! End-to-end drop collection scenarios against an in-process cluster.
//!
//! Every test runs a real coordinator, the shared lock table, the config
//! store and one participant per shard. Failures are injected at the
//! participant's storage or routing state.

#[cfg(test)]
mod tests {
    use crate::catalog::ConfigCollection;
    use crate::ddl::OperationState;
    use crate::error::ErrorKind;
    use crate::metrics::ShardOutcome;
    use crate::participant::FilteringMetadata;
    use crate::testing::TestCluster;
    use crate::types::{DatabaseVersion, Namespace, WriteConcern};
    use std::time::Duration;

    fn users() -> Namespace {
        Namespace::new("app", "users").unwrap()
    }

    fn cluster() -> TestCluster {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init();

        let cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.create_database("app", "a");
        cluster
    }

    #[tokio::test]
    async fn test_drop_removes_metadata_and_local_data() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b", "c"]);
        cluster.catalog.add_tag(&ns, "eu", "", "m");
        cluster.shard("b").storage.add_range_deletions(&ns, 3);

        let coordinator = cluster.coordinator("a");
        let cache = coordinator.catalog_cache();
        assert!(cache.get_collection_routing_info(&ns).await.unwrap().is_sharded());
        let loads_before = cache.collection_refresh_count();

        let handle = coordinator.drop_collection(ns.clone(), WriteConcern::Majority);
        assert_eq!(handle.name(), "dropCollection");
        handle.wait().await.unwrap();

        assert_eq!(cluster.catalog.rows_for(&ns), 0);
        for shard in &cluster.shards {
            assert!(!shard.storage.has_collection(&ns));
            assert!(!shard.storage.has_cached_metadata(&ns));
            assert_eq!(shard.state.collection(&ns).metadata(), FilteringMetadata::Unknown);
        }
        assert_eq!(cluster.shard("b").storage.pending_range_deletions(&ns), 0);

        // The cache was invalidated, not patched: the next read goes to the store.
        assert!(!cache.is_collection_cached(&ns));
        let info = cache.get_collection_routing_info(&ns).await.unwrap();
        assert!(!info.is_sharded());
        assert_eq!(cache.collection_refresh_count(), loads_before + 1);

        assert!(!cluster.locks.is_locked("app"));
        assert!(!cluster.locks.is_locked("app.users"));

        let snapshot = coordinator.metrics().snapshot();
        assert_eq!(snapshot.operations_succeeded, 1);
        assert_eq!(snapshot.operations_active, 0);
        assert_eq!(snapshot.locks_acquired, 2);
        assert_eq!(snapshot.cleanup_runs, 1);
    }

    #[tokio::test]
    async fn test_state_transitions_on_success() {
        let cluster = cluster();
        cluster.create_sharded_collection(&users(), &["a"]);

        let handle = cluster
            .coordinator("a")
            .drop_collection(users(), WriteConcern::Majority);
        assert!(!handle.id().is_nil());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.state().is_terminal() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let transitions = handle.transitions();
        handle.wait().await.unwrap();

        assert_eq!(
            transitions,
            vec![
                OperationState::PreconditionsChecked,
                OperationState::LocksHeld,
                OperationState::BodyRunning,
                OperationState::Succeeded,
                OperationState::LocksReleased,
                OperationState::Resolved,
            ]
        );
    }

    #[tokio::test]
    async fn test_state_transitions_on_precondition_failure() {
        let cluster = cluster();
        let handle = cluster
            .coordinator("a")
            .drop_collection(users(), WriteConcern::Nodes(1));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.state().is_terminal() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            handle.transitions(),
            vec![OperationState::Failed, OperationState::Resolved]
        );
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_drop_twice_succeeds_both_times() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b", "c"]);
        let coordinator = cluster.coordinator("a");

        coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap();
        coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap();

        let metrics = coordinator.metrics();
        for shard in ["a", "b", "c"] {
            assert_eq!(metrics.shard_commands_for(shard, ShardOutcome::Ok), 1);
            assert_eq!(metrics.shard_commands_for(shard, ShardOutcome::NamespaceNotFound), 1);
        }
        assert_eq!(cluster.catalog.rows_for(&ns), 0);
        assert_eq!(metrics.snapshot().cleanup_runs, 2);
    }

    #[tokio::test]
    async fn test_not_found_on_some_shards_still_succeeds() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["b"]);
        let coordinator = cluster.coordinator("a");
        coordinator.catalog_cache().get_collection_routing_info(&ns).await.unwrap();

        coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap();

        let metrics = coordinator.metrics();
        assert_eq!(metrics.shard_commands_for("a", ShardOutcome::NamespaceNotFound), 1);
        assert_eq!(metrics.shard_commands_for("b", ShardOutcome::Ok), 1);
        assert_eq!(metrics.shard_commands_for("c", ShardOutcome::NamespaceNotFound), 1);
        assert_eq!(cluster.catalog.rows_for(&ns), 0);
        assert!(!coordinator.catalog_cache().is_collection_cached(&ns));
    }

    #[tokio::test]
    async fn test_unsharded_collection_on_primary_only() {
        let cluster = cluster();
        let ns = Namespace::new("app", "plain").unwrap();
        cluster.shard("a").storage.create_collection(&ns);

        cluster
            .coordinator("a")
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap();
        assert!(!cluster.shard("a").storage.has_collection(&ns));
    }

    #[tokio::test]
    async fn test_not_primary_fails_before_locking() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b"]);

        let handle = cluster
            .coordinator("b")
            .drop_collection(ns.clone(), WriteConcern::Majority);
        let err = handle.wait().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotPrimaryForDatabase);
        assert_eq!(
            err.to_string(),
            "this is not the primary shard for db app expected: a shardId: b"
        );
        for shard in &cluster.shards {
            assert_eq!(shard.storage.drop_count(), 0);
        }
        assert_eq!(cluster.catalog.rows_for(&ns), 3);
    }

    #[tokio::test]
    async fn test_primary_check_uses_fresh_routing() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a"]);
        let coordinator = cluster.coordinator("a");

        // Warm the cache, then move the primary behind its back.
        coordinator.catalog_cache().get_database("app").await.unwrap();
        cluster.catalog.move_primary("app", "b").unwrap();

        let err = coordinator
            .run_drop_collection(ns, WriteConcern::Majority)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotPrimaryForDatabase);
    }

    #[tokio::test]
    async fn test_stale_database_version() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b"]);
        cluster
            .shard("a")
            .state
            .database("app")
            .set_version(DatabaseVersion::new());

        let handle = cluster
            .coordinator("a")
            .drop_collection(ns.clone(), WriteConcern::Majority);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleDatabaseVersion);
        assert_eq!(cluster.shard("b").storage.drop_count(), 0);
        assert!(!cluster.locks.is_locked("app"));
    }

    #[tokio::test]
    async fn test_requires_majority_write_concern() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a"]);
        let coordinator = cluster.coordinator("a");

        let err = coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Nodes(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
        assert!(err.to_string().contains("majority writeConcern, got 1"));
        assert_eq!(coordinator.metrics().snapshot().locks_acquired, 0);
        assert!(cluster.shard("a").storage.has_collection(&ns));
    }

    #[tokio::test]
    async fn test_system_collection_rejected() {
        let cluster = cluster();
        let ns = Namespace::new("app", "system.views").unwrap();
        cluster.shard("a").storage.create_collection(&ns);

        let err = cluster
            .coordinator("a")
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalOperation);
        assert!(cluster.shard("a").storage.has_collection(&ns));
    }

    #[tokio::test]
    async fn test_hard_error_aborts_without_cleanup() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b", "c"]);
        cluster
            .shard("b")
            .storage
            .fail_drops_with(Some(ErrorKind::Internal));
        let coordinator = cluster.coordinator("a");

        let err = coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err
            .to_string()
            .starts_with("Error dropping collection on shard b :: caused by ::"));

        // a already dropped, c never contacted, config rows untouched.
        assert!(!cluster.shard("a").storage.has_collection(&ns));
        assert_eq!(cluster.shard("c").storage.drop_count(), 0);
        assert_eq!(cluster.catalog.rows_for(&ns), 4);
        assert!(cluster.catalog.removal_write_concerns().is_empty());
        assert_eq!(coordinator.metrics().snapshot().cleanup_runs, 0);
        assert!(!cluster.locks.is_locked("app.users"));

        // Re-running after the fault clears finishes the job.
        cluster.shard("b").storage.fail_drops_with(None);
        coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap();
        assert_eq!(cluster.catalog.rows_for(&ns), 0);
    }

    #[tokio::test]
    async fn test_participant_write_concern_error_aborts() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b"]);
        cluster
            .shard("a")
            .storage
            .fail_write_concern(Some("waiting for replication timed out".into()));

        let err = cluster
            .coordinator("a")
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteConcernFailed);
        assert_eq!(cluster.shard("b").storage.drop_count(), 0);
        assert!(cluster.catalog.rows_for(&ns) > 0);
    }

    #[tokio::test]
    async fn test_stale_shard_resolves_after_migration_commit() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b"]);
        let csr = cluster.shard("b").state.collection(&ns);
        csr.enter_critical_section();

        let config = cluster.coordinator_config("a").with_fanout_config(
            crate::config::FanoutConfig::default()
                .with_backoff(Duration::from_millis(5), Duration::from_millis(20)),
        );
        let coordinator = cluster.coordinator_with(config, cluster.client.clone());
        let handle = coordinator.drop_collection(ns.clone(), WriteConcern::Majority);

        tokio::time::sleep(Duration::from_millis(30)).await;
        csr.exit_critical_section();

        handle.wait().await.unwrap();
        assert!(!cluster.shard("b").storage.has_collection(&ns));
        let stale = coordinator.metrics().shard_commands_for("b", ShardOutcome::Stale);
        assert!(stale >= 1 && stale < 10, "stale attempts: {}", stale);
    }

    #[tokio::test]
    async fn test_stale_shard_gives_up_after_ten_attempts() {
        let cluster = TestCluster::new(&["a", "b"]);
        cluster.create_database("app", "a");
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b"]);
        cluster.shard("b").state.collection(&ns).enter_critical_section();
        let coordinator = cluster.coordinator("a");

        let err = coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StaleShardVersion);
        assert!(err
            .to_string()
            .starts_with("Error dropping collection on shard b due to exceeded retry attempts"));
        let metrics = coordinator.metrics();
        assert_eq!(metrics.shard_commands_for("a", ShardOutcome::Ok), 1);
        assert_eq!(metrics.shard_commands_for("b", ShardOutcome::Stale), 10);
        assert_eq!(cluster.catalog.rows_for(&ns), 3);
        assert_eq!(metrics.snapshot().cleanup_runs, 0);
        assert_eq!(metrics.snapshot().operations_failed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_still_invalidates_cache() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b"]);
        cluster.catalog.fail_removals_from(ConfigCollection::Collections);
        let coordinator = cluster.coordinator("a");
        coordinator.catalog_cache().get_collection_routing_info(&ns).await.unwrap();

        let err = coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigStore);
        assert!(!coordinator.catalog_cache().is_collection_cached(&ns));
        assert!(!cluster.locks.is_locked("app.users"));

        // Only the collection entry is left; a second drop removes it.
        assert_eq!(cluster.catalog.rows_for(&ns), 1);
        cluster.catalog.clear_failures();
        coordinator
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap();
        assert_eq!(cluster.catalog.rows_for(&ns), 0);
    }

    #[tokio::test]
    async fn test_unregistered_shard_not_contacted() {
        let cluster = cluster();
        let ns = users();
        cluster.create_sharded_collection(&ns, &["a", "b", "c"]);
        cluster.catalog.remove_shard(&crate::types::ShardId::new("c"));

        cluster
            .coordinator("a")
            .run_drop_collection(ns.clone(), WriteConcern::Majority)
            .await
            .unwrap();

        // Not registered when the list was read, so not contacted.
        assert_eq!(cluster.shard("c").storage.drop_count(), 0);
        assert!(cluster.shard("c").storage.has_collection(&ns));
    }
}
