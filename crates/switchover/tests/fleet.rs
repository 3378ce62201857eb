mod common;

use chrono::Utc;
use common::{
    quick_deadlines, start_fleet, start_node, wait_state, FakeDatabase, KillableBroadcast,
};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use switchover::bus::{Broadcast, MemoryBroadcast};
use switchover::{
    Controller, CutoverMarker, State, Status, Target, CONTROL_CHANNEL, STATE_CHANNEL,
};
use tokio_util::sync::CancellationToken;

struct Setup {
    bus: Arc<dyn Broadcast>,
    old: FakeDatabase,
    new: FakeDatabase,
    controller: Controller,
}

async fn setup() -> Setup {
    let bus: Arc<dyn Broadcast> = Arc::new(MemoryBroadcast::new());
    let controller = Controller::new(bus.clone(), chrono::Duration::zero())
        .await
        .unwrap();

    Setup {
        bus,
        old: FakeDatabase::new("old"),
        new: FakeDatabase::new("new"),
        controller,
    }
}

fn within(d: chrono::Duration) -> chrono::DateTime<Utc> {
    Utc::now() + d
}

#[tokio::test]
async fn test_fleet_cuts_over_to_next_database() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let mut announcements = bus.subscribe().await.unwrap();
    let nodes = start_fleet(&bus, &old, &new, &["a", "b", "c"]).await;

    controller
        .wait_for(3, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();
    assert!(controller.ready());

    // Before the cutover, connections are to the old database.
    assert_eq!(nodes[0].handler.get().await.unwrap().target(), Target::Old);

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();
    controller
        .wait_for(
            3,
            &[State::ArmWait, State::Pausing, State::Paused, State::PauseWait],
            cfg.consensus_deadline(),
        )
        .await
        .unwrap();
    controller
        .wait_for(3, &[State::PauseWait], cfg.pause_deadline())
        .await
        .unwrap();

    for node in &nodes {
        assert!(node.app.is_paused());
        assert_eq!(node.handler.state(), State::PauseWait);
    }

    // The operator flips the marker. Each node observes it on its next
    // connection, which lands on the next database.
    old.set_marker(CutoverMarker::UseNextDb);
    for node in &nodes {
        let conn = node.handler.get().await.unwrap();
        assert_eq!(conn.target(), Target::New);
        assert_eq!(conn.database, "new");
    }
    for node in &nodes {
        wait_state(node, State::Complete, Duration::from_secs(1)).await;
        assert!(!node.app.is_paused());
        assert_eq!(node.app.pauses.load(Ordering::SeqCst), 1);
    }

    // Passing the absolute deadline has no effect on a completed switchover.
    let remaining = (cfg.absolute_deadline() - Utc::now())
        .to_std()
        .unwrap_or_default();
    tokio::time::sleep(remaining + Duration::from_millis(200)).await;
    for node in &nodes {
        assert_eq!(node.handler.state(), State::Complete);
    }

    // Every node passed through each state exactly once. A node may become
    // ready before it first announces itself as starting.
    let mut transitions = BTreeMap::<String, Vec<State>>::new();
    while let Ok(message) = announcements.try_recv() {
        if message.channel != STATE_CHANNEL {
            continue;
        }
        let status = Status::parse(&message.payload).unwrap();
        let states = transitions.entry(status.node_id).or_default();
        if states.last() != Some(&status.state) {
            states.push(status.state);
        }
    }
    assert_eq!(transitions.len(), 3);
    for states in transitions.values() {
        let states: Vec<State> = states
            .iter()
            .copied()
            .skip_while(|s| *s == State::Starting)
            .collect();
        assert_eq!(
            states,
            [
                State::Ready,
                State::Armed,
                State::ArmWait,
                State::Pausing,
                State::Paused,
                State::PauseWait,
                State::Complete,
            ]
        );
    }
}

#[tokio::test]
async fn test_silent_peer_stalls_until_consensus_deadline() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let mut nodes = start_fleet(&bus, &old, &new, &["a", "b", "c"]).await;

    controller
        .wait_for(3, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    // Node "c" crashes without announcing anything. Its peers still expect
    // it, and only the consensus deadline ends the attempt.
    std::mem::drop(nodes.pop());

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();

    let mut resumes = Vec::new();
    for node in &nodes {
        wait_state(node, State::Armed, Duration::from_millis(500)).await;
        resumes.push(node.app.resumes());
    }
    for (node, resumes) in nodes.iter().zip(resumes) {
        wait_state(node, State::Abort, Duration::from_secs(2)).await;
        assert!(Utc::now() + chrono::Duration::milliseconds(50) >= cfg.consensus_deadline());
        assert_eq!(node.app.pauses.load(Ordering::SeqCst), 0);
        // The application is resumed upon the abort.
        assert!(node.app.resumes() > resumes);
    }
}

#[tokio::test]
async fn test_pause_failure_aborts_fleet() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let nodes = start_fleet(&bus, &old, &new, &["a", "b", "c"]).await;
    nodes[2].app.fail_pause.store(true, Ordering::SeqCst);

    controller
        .wait_for(3, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();

    // The failed node aborts as soon as its pause fails. The others remain
    // paused until the absolute deadline, then abort and resume.
    wait_state(&nodes[2], State::Abort, Duration::from_secs(3)).await;
    for node in &nodes[..2] {
        wait_state(node, State::Paused, Duration::from_secs(1)).await;
        assert!(node.app.is_paused());
    }
    for node in &nodes {
        wait_state(node, State::Abort, Duration::from_secs(4)).await;
        assert!(!node.app.is_paused());
        assert_eq!(node.app.pauses.load(Ordering::SeqCst), 1);
    }
    assert_eq!(nodes[0].handler.get().await.unwrap().target(), Target::Old);
}

#[tokio::test]
async fn test_max_pause_without_cutover_aborts() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let nodes = start_fleet(&bus, &old, &new, &["a", "b"]).await;

    controller
        .wait_for(2, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();
    controller
        .wait_for(2, &[State::PauseWait], cfg.pause_deadline())
        .await
        .unwrap();
    let resumes: Vec<usize> = nodes.iter().map(|node| node.app.resumes()).collect();

    for (node, resumes) in nodes.iter().zip(resumes) {
        wait_state(node, State::Abort, Duration::from_secs(4)).await;
        assert!(Utc::now() + chrono::Duration::milliseconds(50) >= cfg.absolute_deadline());
        assert!(!node.app.is_paused());
        assert!(node.app.resumes() > resumes);
    }
}

#[tokio::test]
async fn test_abort_then_reset() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let nodes = start_fleet(&bus, &old, &new, &["a", "b"]).await;

    controller
        .wait_for(2, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    controller.arm(&quick_deadlines()).await.unwrap();
    for node in &nodes {
        wait_state(node, State::ArmWait, Duration::from_millis(500)).await;
    }
    controller.abort().await.unwrap();
    for node in &nodes {
        wait_state(node, State::Abort, Duration::from_millis(500)).await;
    }

    // An aborted node ignores arming until it's reset.
    controller.arm(&quick_deadlines()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nodes[0].handler.state(), State::Abort);

    controller.reset().await.unwrap();
    for node in &nodes {
        wait_state(node, State::Ready, Duration::from_secs(4)).await;
    }

    controller.arm(&quick_deadlines()).await.unwrap();
    for node in &nodes {
        wait_state(node, State::ArmWait, Duration::from_millis(500)).await;
    }
    nodes[0].handler.abort();
    wait_state(&nodes[0], State::Abort, Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_done_is_final() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let nodes = start_fleet(&bus, &old, &new, &["a", "b"]).await;

    controller
        .wait_for(2, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    controller.done().await.unwrap();
    for node in &nodes {
        wait_state(node, State::Complete, Duration::from_millis(500)).await;
    }

    controller.arm(&quick_deadlines()).await.unwrap();
    controller.abort().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for node in &nodes {
        assert_eq!(node.handler.state(), State::Complete);
        assert_eq!(node.handler.status().state, State::Complete);
        assert_eq!(node.handler.status().node_id, node.handler.node_id());
    }
}

#[tokio::test]
async fn test_connection_held_through_pause_lands_on_next_database() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let nodes = start_fleet(&bus, &old, &new, &["a", "b"]).await;

    controller
        .wait_for(2, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    // A long-running request holds its connection across the whole pause.
    let held = nodes[0].handler.get().await.unwrap();
    assert_eq!(held.target(), Target::Old);

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();
    controller
        .wait_for(2, &[State::PauseWait], cfg.pause_deadline())
        .await
        .unwrap();

    // It's returned to the pool while paused, and the marker is then flipped.
    std::mem::drop(held);
    old.set_marker(CutoverMarker::UseNextDb);

    for _ in 0..4 {
        let conn = nodes[0].handler.get().await.unwrap();
        assert_eq!(conn.target(), Target::New);
        assert_eq!(conn.database, "new");
    }
    wait_state(&nodes[0], State::Complete, Duration::from_secs(1)).await;
    assert!(!nodes[0].app.is_paused());
}

#[tokio::test]
async fn test_lost_subscription_aborts_and_resumes() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let kill = CancellationToken::new();
    let killable: Arc<dyn Broadcast> = Arc::new(KillableBroadcast {
        inner: bus.clone(),
        kill: kill.clone(),
    });
    let nodes = start_fleet(&killable, &old, &new, &["a"]).await;

    controller
        .wait_for(1, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();
    wait_state(&nodes[0], State::PauseWait, Duration::from_secs(3)).await;
    assert!(nodes[0].app.is_paused());

    // Losing the bus ends the switchover at once, rather than at a deadline.
    kill.cancel();
    wait_state(&nodes[0], State::Abort, Duration::from_millis(500)).await;
    assert!(Utc::now() < cfg.absolute_deadline());
    assert!(!nodes[0].app.is_paused());

    // The abort is still announced to the fleet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = controller.node_status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, State::Abort);

    // And local commands are still served.
    nodes[0].handler.reset();
    wait_state(&nodes[0], State::Starting, Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_mismatched_databases_abort() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let other = FakeDatabase::new("other");

    let nodes = vec![
        start_node(&bus, &old, &new, "a").await,
        start_node(&bus, &old, &new, "b").await,
        start_node(&bus, &old, &other, "c").await,
    ];
    for node in &nodes {
        node.set_ready();
    }
    controller
        .wait_for(3, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();
    assert_eq!(nodes[2].handler.status().db_next_id, "other-id");

    // Every node arms, but none may reach consensus with a peer which
    // would cut over to a different database.
    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();

    for node in &nodes {
        wait_state(node, State::Abort, Duration::from_millis(500)).await;
        assert!(Utc::now() < cfg.consensus_deadline());
        assert_eq!(node.app.pauses.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_node_joining_during_switchover_aborts() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let nodes = start_fleet(&bus, &old, &new, &["a", "b"]).await;

    controller
        .wait_for(2, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();
    for node in &nodes {
        wait_state(node, State::ArmWait, Duration::from_millis(500)).await;
    }

    // A node starting now announces itself, which ends the attempt.
    let late = start_node(&bus, &old, &new, "late").await;
    for node in &nodes {
        wait_state(node, State::Abort, Duration::from_millis(500)).await;
        assert!(Utc::now() < cfg.pause_at());
        assert_eq!(node.app.pauses.load(Ordering::SeqCst), 0);
    }
    assert_eq!(late.handler.state(), State::Starting);
}

#[tokio::test]
async fn test_malformed_messages_are_discarded() {
    let Setup {
        bus,
        old,
        new,
        controller,
    } = setup().await;
    let nodes = start_fleet(&bus, &old, &new, &["a", "b"]).await;

    controller
        .wait_for(2, &[State::Ready], within(chrono::Duration::seconds(6)))
        .await
        .unwrap();

    let cfg = quick_deadlines();
    controller.arm(&cfg).await.unwrap();
    for node in &nodes {
        wait_state(node, State::ArmWait, Duration::from_millis(500)).await;
    }

    for (channel, payload) in [
        (STATE_CHANNEL, "garbage"),
        (
            STATE_CHANNEL,
            "NodeID=x&State=bogus&Offset=0s&DBID=old-id&DBNextID=new-id&ActiveRequests=0",
        ),
        (CONTROL_CHANNEL, "finish"),
        (CONTROL_CHANNEL, "BeginAt=yesterday"),
    ] {
        bus.publish(channel, payload).await.unwrap();
    }

    // Neither aborted nor joined by a phantom node, the fleet carries on.
    controller
        .wait_for(2, &[State::PauseWait], cfg.pause_deadline())
        .await
        .unwrap();
    for node in &nodes {
        assert_eq!(node.handler.state(), State::PauseWait);
        assert_eq!(node.app.pauses.load(Ordering::SeqCst), 1);
    }
}
