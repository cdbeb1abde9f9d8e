use crate::prelude::*;
use crate::testkit::{TestTopology, TEST_BASE};

const WAIT: Duration = Duration::from_secs(10);

async fn exit_of(handle: &TaskHandle) -> TaskExitCode {
    tokio::time::timeout(WAIT, handle.wait())
        .await
        .expect("task did not finish in time")
}

async fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

fn phases(snap: &TaskStatusSnapshot) -> Vec<String> {
    snap.log
        .iter()
        .filter_map(|line| line.strip_prefix("Entering phase "))
        .map(str::to_string)
        .collect()
}

fn contains(topology: &TestTopology, member: u16, rid: u16) -> bool {
    topology
        .node(member)
        .expect("member not running")
        .contains_replica_id(TEST_BASE, ReplicaId(rid))
        .expect("base not hosted")
}

#[tokio::test]
async fn test_repl_clean_removes_decommissioned_id_everywhere() {
    let topology = TestTopology::full_mesh(4).await.expect("topology");
    topology.seed(4, 10).expect("seed");
    topology.seed(1, 12).expect("seed");
    topology.decommission(4);

    let node1 = topology.node(1).expect("node");
    let handle = node1
        .submit_clean(ReplicaId(4), TEST_BASE, false, false)
        .expect("submit");
    assert_eq!(exit_of(&handle).await, TaskExitCode::Success);

    for member in 1..=3 {
        assert!(!contains(&topology, member, 4));
        // Unrelated replica ids are untouched.
        assert!(contains(&topology, member, 1));
        let node = topology.node(member).expect("node");
        assert!(!node.is_being_cleaned(ReplicaId(4), TEST_BASE));
        assert_eq!(node.tasks().active_clean_count(), 0);
    }

    let snap = handle.snapshot();
    assert_eq!(
        phases(&snap),
        vec!["preparing", "collecting", "releasing", "cleaning", "done"]
    );
    assert_eq!(snap.current_item, 2);
    assert_eq!(snap.total_items, 2);
    let store = topology.store(1).expect("store");
    assert!(store.list_clean_tasks().expect("list").is_empty());
    assert_eq!(
        node1.clean_task(ReplicaId(4), TEST_BASE).map(|_| ()),
        Err(OperationError::NoMatchingTask)
    );
}

#[tokio::test]
async fn test_repl_clean_capacity_is_enforced_and_counted() {
    let topology = TestTopology::full_mesh(2).await.expect("topology");
    // With the only other member down no force clean can reach quorum.
    topology.stop(2);
    let node1 = topology.node(1).expect("node");

    let mut handles = Vec::new();
    for rid in 100..164 {
        handles.push(
            node1
                .submit_clean(ReplicaId(rid), TEST_BASE, true, false)
                .expect("submit"),
        );
    }
    assert_eq!(node1.tasks().active_clean_count(), 64);

    assert_eq!(
        node1
            .submit_clean(ReplicaId(164), TEST_BASE, true, false)
            .map(|_| ()),
        Err(OperationError::CapacityExceeded)
    );
    assert_eq!(node1.tasks().rejected_count(), 1);
    assert_eq!(node1.tasks().active_clean_count(), 64);

    // Aborting one instance frees a slot.
    let abort = node1
        .submit_abort(ReplicaId(100), TEST_BASE, false)
        .expect("abort");
    assert_eq!(exit_of(&handles[0]).await, TaskExitCode::Aborted);
    assert_eq!(exit_of(&abort).await, TaskExitCode::Success);
    assert_eq!(node1.tasks().active_clean_count(), 63);

    assert!(node1
        .submit_clean(ReplicaId(164), TEST_BASE, true, false)
        .is_ok());
    assert_eq!(node1.tasks().active_clean_count(), 64);
    assert!(handles[1..].iter().all(|h| h.exit_code().is_none()));
}

#[tokio::test]
async fn test_repl_force_clean_supersedes_and_laggard_converges() {
    let topology = TestTopology::full_mesh(4).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    topology.stop(2);
    let node1 = topology.node(1).expect("node");

    let first = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert_eq!(
        node1
            .submit_clean(ReplicaId(9), TEST_BASE, false, false)
            .map(|_| ()),
        Err(OperationError::AlreadyActive)
    );

    let forced = node1
        .submit_clean(ReplicaId(9), TEST_BASE, true, false)
        .expect("submit");
    assert_eq!(
        node1
            .submit_clean(ReplicaId(9), TEST_BASE, true, false)
            .map(|_| ()),
        Err(OperationError::AlreadyActive)
    );

    assert_eq!(exit_of(&first).await, TaskExitCode::Superseded);
    assert_eq!(exit_of(&forced).await, TaskExitCode::Success);
    assert!(!contains(&topology, 1, 9));
    assert!(!contains(&topology, 3, 9));
    assert!(!contains(&topology, 4, 9));

    let snap = forced.snapshot();
    assert!(snap
        .log
        .iter()
        .any(|l| l.starts_with("Proceeding with 2 of 3 members")));
    assert!(snap.log.iter().any(|l| l.contains("force is set")));

    // The member that was down is reconciled from the outbox once it returns.
    let node2 = topology.restart(2).await.expect("restart");
    assert!(
        wait_until(|| node2.contains_replica_id(TEST_BASE, ReplicaId(9)) == Ok(false)).await
    );
    assert!(wait_until(|| node2.tasks().active_clean_count() == 0).await);
    assert!(!node2.is_being_cleaned(ReplicaId(9), TEST_BASE));
}

#[tokio::test]
async fn test_repl_abort_before_clean_starts() {
    let topology = TestTopology::full_mesh(3).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    let node1 = topology.node(1).expect("node");
    let node2 = topology.node(2).expect("node");

    let abort = node1
        .submit_abort(ReplicaId(9), TEST_BASE, false)
        .expect("abort");
    assert_eq!(exit_of(&abort).await, TaskExitCode::Success);

    // Submitted where the intent is held, the clean never starts.
    let clean = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert_eq!(exit_of(&clean).await, TaskExitCode::Aborted);

    // Submitted elsewhere, it learns of the abort from the other members.
    let clean = node2
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert_eq!(exit_of(&clean).await, TaskExitCode::Aborted);

    for member in 1..=3 {
        assert!(contains(&topology, member, 9));
        let node = topology.node(member).expect("node");
        // A member reached before the abort marked the id, and unmarks it once the
        // abort arrives.
        assert!(wait_until(|| !node.is_being_cleaned(ReplicaId(9), TEST_BASE)).await);
    }
}

#[tokio::test]
async fn test_repl_abort_running_clean() {
    let topology = TestTopology::full_mesh(3).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    topology.stop(2);
    let node1 = topology.node(1).expect("node");
    let node3 = topology.node(3).expect("node");

    let clean = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert!(wait_until(|| node3.is_being_cleaned(ReplicaId(9), TEST_BASE)).await);
    assert_eq!(clean.snapshot().phase, "collecting");

    let abort = node1
        .submit_abort(ReplicaId(9), TEST_BASE, false)
        .expect("abort");
    assert_eq!(exit_of(&clean).await, TaskExitCode::Aborted);
    assert_eq!(exit_of(&abort).await, TaskExitCode::Success);
    assert_eq!(clean.snapshot().phase, "aborted");

    assert!(!node1.is_being_cleaned(ReplicaId(9), TEST_BASE));
    assert!(wait_until(|| !node3.is_being_cleaned(ReplicaId(9), TEST_BASE)).await);
    assert!(wait_until(|| node3.tasks().active_clean_count() == 0).await);
    assert!(contains(&topology, 1, 9));
    assert!(contains(&topology, 3, 9));
    assert!(topology
        .store(1)
        .expect("store")
        .list_clean_tasks()
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn test_repl_clean_resumes_after_restart() {
    let topology = TestTopology::full_mesh(3).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    topology.stop(2);
    let node3 = topology.node(3).expect("node");

    let before = topology
        .node(1)
        .expect("node")
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert!(wait_until(|| node3.is_being_cleaned(ReplicaId(9), TEST_BASE)).await);

    topology.stop(1);
    assert_eq!(before.exit_code(), None);
    assert_eq!(before.snapshot().phase, "collecting");

    topology.restart(2).await.expect("restart");
    let node1 = topology.restart(1).await.expect("restart");
    let resumed = node1
        .clean_task(ReplicaId(9), TEST_BASE)
        .expect("clean task was not resumed");
    assert!(resumed
        .snapshot()
        .log
        .iter()
        .any(|l| l == "Resuming clean task in phase collecting"));

    assert_eq!(exit_of(&resumed).await, TaskExitCode::Success);
    for member in 1..=3 {
        assert!(!contains(&topology, member, 9));
    }
}

#[tokio::test]
async fn test_repl_certified_abort_waits_for_every_member() {
    let topology = TestTopology::full_mesh(3).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    topology.stop(3);
    let node1 = topology.node(1).expect("node");

    let clean = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    let abort = node1
        .submit_abort(ReplicaId(9), TEST_BASE, true)
        .expect("abort");
    assert_eq!(exit_of(&clean).await, TaskExitCode::Aborted);

    // Member 2 acknowledges, member 3 can not.
    assert!(wait_until(|| abort.snapshot().current_item == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = abort.snapshot();
    assert_eq!(snap.phase, "propagating");
    assert_eq!(snap.exit_code, None);
    assert_eq!(snap.total_items, 2);

    // Each start with the abort still pending is visible in the task log.
    topology.stop(1);
    let node1 = topology.restart(1).await.expect("restart");
    let resumed = node1
        .abort_task(ReplicaId(9), TEST_BASE)
        .expect("abort task was not resumed");
    assert!(resumed
        .snapshot()
        .log
        .iter()
        .any(|l| l.starts_with("Resuming abort task in phase propagating, waiting on 1 members")));
    assert_eq!(resumed.exit_code(), None);

    let node3 = topology.restart(3).await.expect("restart");
    assert_eq!(exit_of(&resumed).await, TaskExitCode::Success);
    assert_eq!(resumed.snapshot().phase, "confirmed");
    assert!(contains(&topology, 3, 9));
    assert!(!node3.is_being_cleaned(ReplicaId(9), TEST_BASE));
    assert!(topology
        .store(1)
        .expect("store")
        .list_abort_tasks()
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn test_repl_clean_rerun_is_idempotent() {
    let topology = TestTopology::full_mesh(3).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    let node1 = topology.node(1).expect("node");

    let handle = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert_eq!(exit_of(&handle).await, TaskExitCode::Success);

    // Without force the id must still be present locally.
    assert_eq!(
        node1
            .submit_clean(ReplicaId(9), TEST_BASE, false, false)
            .map(|_| ()),
        Err(OperationError::NotFound)
    );

    let forced = node1
        .submit_clean(ReplicaId(9), TEST_BASE, true, false)
        .expect("submit");
    assert_eq!(exit_of(&forced).await, TaskExitCode::Success);
    for member in 1..=3 {
        assert!(!contains(&topology, member, 9));
    }
}

#[tokio::test]
async fn test_repl_release_waits_for_lagging_members() {
    let topology = TestTopology::full_mesh(3).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    let node1 = topology.node(1).expect("node");
    let late = Csn::new(ReplicaId(9), Duration::from_secs(20));
    assert_eq!(node1.apply_update(TEST_BASE, late), Ok(true));

    let handle = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert!(wait_until(|| handle.snapshot().phase == "releasing").await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.exit_code(), None);
    assert_eq!(handle.snapshot().phase, "releasing");
    assert!(contains(&topology, 1, 9));

    // Replication catches the other members up.
    for member in 2..=3 {
        let node = topology.node(member).expect("node");
        assert_eq!(node.apply_update(TEST_BASE, late), Ok(true));
    }
    assert_eq!(exit_of(&handle).await, TaskExitCode::Success);
    for member in 1..=3 {
        assert!(!contains(&topology, member, 9));
    }
}

#[tokio::test]
async fn test_repl_certify_all_waits_for_members_outside_collected() {
    let topology = TestTopology::full_mesh(3).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    // Nothing replicates to member 3, so collecting never reaches it.
    {
        let mut wr = topology.registry.write();
        wr.remove_agreement(ReplicaId(1), ReplicaId(3));
        wr.remove_agreement(ReplicaId(2), ReplicaId(3));
        wr.commit();
    }
    topology.stop(3);
    let node1 = topology.node(1).expect("node");

    let handle = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, true)
        .expect("submit");
    assert!(wait_until(|| handle.snapshot().phase == "releasing").await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.exit_code(), None);
    assert_eq!(handle.snapshot().phase, "releasing");
    assert!(contains(&topology, 1, 9));

    let node3 = topology.restart(3).await.expect("restart");
    assert_eq!(exit_of(&handle).await, TaskExitCode::Success);
    for member in 1..=3 {
        assert!(!contains(&topology, member, 9));
    }
    assert!(!node3.is_being_cleaned(ReplicaId(9), TEST_BASE));
    assert_eq!(node3.tasks().active_clean_count(), 0);
}

#[tokio::test]
async fn test_repl_aborted_clean_releases_every_marked_member() {
    let topology = TestTopology::new(&[1, 2, 3], CleanAllRuvConfig::new_for_test())
        .await
        .expect("topology");
    // Member 3 replicates to no one, so what it learns stays with it.
    for (from, to) in [(1, 2), (1, 3), (2, 1), (2, 3)] {
        topology
            .registry
            .add_agreement(ReplicaId(from), ReplicaId(to));
    }
    topology.seed(9, 10).expect("seed");
    let node1 = topology.node(1).expect("node");
    let node2 = topology.node(2).expect("node");
    let node3 = topology.node(3).expect("node");

    // Only member 3 holds an abort for replica id 9.
    assert_eq!(
        node3.handle_message(
            ReplicaId(2),
            CoordinationMessage::AbortCleaning {
                rid: ReplicaId(9),
                base: TEST_BASE.to_string(),
                certify: false,
                origin: ReplicaId(3),
            },
        ),
        Ok(CoordinationResponse::Ack)
    );

    let clean = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert_eq!(exit_of(&clean).await, TaskExitCode::Aborted);

    // Member 2 marked the id before member 3's answer was seen. It is told to let go.
    for node in [&node1, &node2, &node3] {
        assert!(wait_until(|| node.tasks().active_clean_count() == 0).await);
        assert!(wait_until(|| !node.is_being_cleaned(ReplicaId(9), TEST_BASE)).await);
    }
    assert!(wait_until(|| topology
        .store(2)
        .expect("store")
        .list_clean_tasks()
        .expect("list")
        .is_empty())
    .await);
    for member in 1..=3 {
        assert!(contains(&topology, member, 9));
    }
}

#[tokio::test]
async fn test_repl_abort_intent_kept_after_abort_outlives_ttl() {
    let config = CleanAllRuvConfig {
        abort_intent_ttl_secs: 1,
        ..CleanAllRuvConfig::new_for_test()
    };
    let topology = TestTopology::mesh(3, config).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    topology.stop(3);
    let node1 = topology.node(1).expect("node");

    let abort = node1
        .submit_abort(ReplicaId(9), TEST_BASE, true)
        .expect("abort");
    // The certified abort runs for longer than the ttl.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(abort.exit_code(), None);
    topology.restart(3).await.expect("restart");
    assert_eq!(exit_of(&abort).await, TaskExitCode::Success);

    let clean = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert_eq!(exit_of(&clean).await, TaskExitCode::Aborted);
    let snap = clean.snapshot();
    assert!(snap
        .log
        .iter()
        .any(|l| l == "An abort is pending for this replica id, not starting"));
    assert_eq!(phases(&snap), vec!["preparing"]);

    // The stamped intent is what a restart reloads.
    let intents = topology
        .store(1)
        .expect("store")
        .list_abort_intents()
        .expect("list");
    assert_eq!(intents.len(), 1);
    assert!(intents[0].released.is_some());
}

#[tokio::test]
async fn test_repl_rejecting_member_shows_as_stalled() {
    let config = CleanAllRuvConfig {
        max_clean_tasks: 1,
        ..CleanAllRuvConfig::new_for_test()
    };
    let topology = TestTopology::mesh(2, config).await.expect("topology");
    topology.seed(9, 10).expect("seed");
    let node1 = topology.node(1).expect("node");
    let node2 = topology.node(2).expect("node");

    // Member 2 is at capacity with a clean of another replica id.
    let other_started = CoordinationMessage::ReplicaIdCleaningStarted {
        rid: ReplicaId(77),
        base: TEST_BASE.to_string(),
        force: false,
        origin: ReplicaId(1),
    };
    assert!(node2.handle_message(ReplicaId(1), other_started).is_ok());
    assert_eq!(node2.tasks().active_clean_count(), 1);

    let handle = node1
        .submit_clean(ReplicaId(9), TEST_BASE, false, false)
        .expect("submit");
    assert!(wait_until(|| handle.snapshot().stalled).await);
    let snap = handle.snapshot();
    assert_eq!(snap.phase, "collecting");
    assert!(snap.status.contains("stalled, rejected by member 2"));
    assert!(snap
        .last_error
        .as_deref()
        .map(|e| e.starts_with("member 2: Rejected"))
        .unwrap_or(false));
    assert!(snap
        .log
        .iter()
        .any(|l| l.starts_with("Member 2 rejected the request")));
    let store1 = topology.store(1).expect("store");
    assert!(wait_until(|| store1
        .list_clean_tasks()
        .map(|records| records.iter().any(|r| r.last_error.is_some()))
        .unwrap_or(false))
    .await);

    // Once member 2 has room the clean carries on.
    assert_eq!(
        node2.handle_message(
            ReplicaId(1),
            CoordinationMessage::ReplicaIdCleaned {
                rid: ReplicaId(77),
                base: TEST_BASE.to_string(),
                origin: ReplicaId(1),
                purged_max: None,
            },
        ),
        Ok(CoordinationResponse::Purged)
    );
    assert_eq!(exit_of(&handle).await, TaskExitCode::Success);
    assert!(!handle.snapshot().stalled);
    for member in 1..=2 {
        assert!(!contains(&topology, member, 9));
    }
}

#[tokio::test]
async fn test_repl_clean_relays_through_indirect_path() {
    let config = CleanAllRuvConfig {
        force_quorum_percent: 50,
        ..CleanAllRuvConfig::new_for_test()
    };
    let topology = TestTopology::new(&[1, 2, 3], config)
        .await
        .expect("topology");
    // A chain 1 - 2 - 3. Member 1 can not reach member 3 directly.
    for (from, to) in [(1, 2), (2, 1), (2, 3), (3, 2)] {
        topology
            .registry
            .add_agreement(ReplicaId(from), ReplicaId(to));
    }
    topology.transport.block_link(ReplicaId(1), ReplicaId(3));
    topology.seed(9, 10).expect("seed");
    let node1 = topology.node(1).expect("node");
    let node2 = topology.node(2).expect("node");

    let handle = node1
        .submit_clean(ReplicaId(9), TEST_BASE, true, false)
        .expect("submit");
    assert_eq!(exit_of(&handle).await, TaskExitCode::Success);

    // Member 3 purges from member 2's relay, while member 1's own messages to it are
    // still waiting in its outbox.
    let node3 = topology.node(3).expect("node");
    assert!(wait_until(|| node3.contains_replica_id(TEST_BASE, ReplicaId(9)) == Ok(false)).await);
    assert_eq!(
        topology
            .store(1)
            .expect("store")
            .list_outbox()
            .expect("outbox")
            .len(),
        2
    );

    let store2 = topology.store(2).expect("store");
    assert!(wait_until(|| store2.list_outbox().map(|o| o.is_empty()).unwrap_or(false)).await);
    topology.stop(3);

    // A repeated purge notice is answered without relaying it again.
    let cleaned = CoordinationMessage::ReplicaIdCleaned {
        rid: ReplicaId(9),
        base: TEST_BASE.to_string(),
        origin: ReplicaId(1),
        purged_max: Some(Csn::new(ReplicaId(9), Duration::from_secs(10))),
    };
    assert_eq!(
        node2.handle_message(ReplicaId(1), cleaned),
        Ok(CoordinationResponse::Purged)
    );
    assert!(store2.list_outbox().expect("outbox").is_empty());

    // An abort is relayed once, however often it arrives.
    let abort = CoordinationMessage::AbortCleaning {
        rid: ReplicaId(10),
        base: TEST_BASE.to_string(),
        certify: false,
        origin: ReplicaId(1),
    };
    for _ in 0..3 {
        assert_eq!(
            node2.handle_message(ReplicaId(1), abort.clone()),
            Ok(CoordinationResponse::Ack)
        );
    }
    let outbox = store2.list_outbox().expect("outbox");
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].target, ReplicaId(3));
    assert_eq!(outbox[0].msg, abort);
}
