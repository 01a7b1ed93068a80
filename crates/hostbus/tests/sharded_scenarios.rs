//! End-to-end scenarios against the sharded realization.
//!
//! The Leader's reconciler is exercised two ways: live (a background
//! endpoint whose reconciler thread moves messages while a publisher
//! waits) and inline (`reconcile_now` for deterministic steps).

use std::time::Duration;

use hostbus::{BackendKind, Bus, BusConfig, HostIdentity, RecvOutcome};

fn test_config(root: &std::path::Path) -> BusConfig {
    let mut cfg = BusConfig::at_root(root);
    cfg.recv_tick = Duration::from_millis(20);
    cfg.recv_db_poll_every = Duration::from_millis(40);
    cfg.send_wait = Duration::from_secs(2);
    cfg
}

fn connect(root: &std::path::Path, background: bool) -> Bus {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Bus::connect_with(
        test_config(root),
        BackendKind::Sharded,
        HostIdentity::current(),
        background,
    )
    .expect("connect")
}

#[test]
fn s1_round_trip_through_live_reconciler() {
    let tmp = tempfile::tempdir().expect("tempdir");
    // The first endpoint claims 001 and is therefore the Leader; its
    // background reconciler moves everyone's outbox rows.
    let a = connect(tmp.path(), true);
    let b = connect(tmp.path(), false);

    let sent = b.send(a.id(), "hi");
    assert!(
        sent.starts_with("Sent (to 1 agent(s), id="),
        "reconciler should move the row inside the send wait: {sent}"
    );

    let batch = a.recv(5);
    assert!(
        batch.contains(&format!("[{}] - 1 message(s)", b.id())),
        "unexpected batch: {batch}"
    );
    assert!(batch.contains(" hi"));

    assert_eq!(a.recv(1), "Timeout (1s).");
}

#[test]
fn s2_broadcast_excludes_sender() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), true);
    let b = connect(tmp.path(), false);
    let c = connect(tmp.path(), false);

    let sent = a.send("all", "ping");
    assert!(
        sent.starts_with("Sent (to 2 agent(s), id="),
        "unexpected send outcome: {sent}"
    );

    for receiver in [&b, &c] {
        let batch = receiver.recv(5);
        assert!(
            batch.contains(&format!("[{}] - 1 message(s)", a.id())),
            "{} missed the broadcast: {batch}",
            receiver.id()
        );
    }
    assert_eq!(a.recv(1), "Timeout (1s).");
}

#[test]
fn s3_offline_recipient_fails_fast() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), false);
    assert_eq!(a.send("999", "x"), "Error: Agent '999' offline.");
}

#[test]
fn s4_self_address_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), false);
    assert_eq!(a.send(a.id(), "x"), "Error: cannot send to self.");
}

#[test]
fn s6_clean_exit_frees_smallest_id() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), false);
    let b = connect(tmp.path(), false);
    let freed = a.id().to_string();
    assert!(freed < b.id().to_string());

    drop(a);
    let again = connect(tmp.path(), false);
    assert_eq!(again.id(), freed);
}

#[test]
fn s7_new_command_cancels_blocking_receive() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), false);

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| a.try_recv(86_400).expect("recv"));
        std::thread::sleep(Duration::from_millis(120));
        a.session().mark_active();
        assert_eq!(waiter.join().expect("join"), RecvOutcome::Cancelled);
    });
}

#[test]
fn send_without_leader_times_out_then_delivers() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), false);
    let mut cfg = test_config(tmp.path());
    cfg.send_wait = Duration::from_secs(1);
    let b = Bus::connect_with(cfg, BackendKind::Sharded, HostIdentity::current(), false)
        .expect("connect b");

    // No reconciler is running anywhere: the wait must elapse.
    let sent = b.send(a.id(), "delayed");
    assert_eq!(sent, "Send timeout after 1s (to 1 agents)");

    // A later Leader pass still moves the durable row.
    let stats = a.reconcile_now().expect("sharded has a reconciler");
    assert!(stats.is_leader);
    assert_eq!(stats.moved, 1);
    let batch = a.recv(0);
    assert!(batch.contains("delayed"), "{batch}");
}

#[test]
fn status_handshake_is_serviced_by_leader() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), true);
    let b = connect(tmp.path(), false);

    let roster = b.get_status();
    let lines: Vec<&str> = roster.lines().collect();
    assert!(
        lines[0].contains(&format!("Agent {}", b.id())) && lines[0].contains("THIS"),
        "requester first with THIS flag: {roster}"
    );
    assert!(
        roster.contains(&format!("Agent {}", a.id())),
        "leader listed too: {roster}"
    );
}

#[test]
fn status_falls_back_to_local_scan_without_leader() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), false);

    let started = std::time::Instant::now();
    let roster = a.get_status();
    assert!(
        started.elapsed() >= Duration::from_secs(3),
        "fallback only after the leader wait"
    );
    assert!(
        roster.contains(&format!("Agent {}", a.id())) && roster.contains("THIS"),
        "local scan roster: {roster}"
    );
}

#[test]
fn release_is_idempotent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = connect(tmp.path(), false);
    a.release();
    a.release();
    drop(a);
}
