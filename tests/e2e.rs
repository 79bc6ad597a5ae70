//!
//! End-to-end scenarios over the in-process loopback transport (§8):
//! happy-path commit, a refusing participant forcing abort, file
//! contention producing a forced NO, lost-ack retransmission, and
//! recovery after a simulated coordinator/participant crash.
//!
use std::sync::Arc;
use std::time::Duration;

use collage_2pc::coordinator::Coordinator;
use collage_2pc::participant::{AutoApprove, AutoDeny, Participant};
use collage_2pc::recovery::{recover_coordinator, recover_participant};
use collage_2pc::transport::{Inbound, LoopbackNetwork, LoopbackTransport};
use collage_2pc::message::Message;
use collage_2pc::wal::Wal;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;

fn spawn_coordinator_dispatch(coordinator: Arc<Coordinator>, mut rx: UnboundedReceiver<Inbound>) {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            coordinator.handle_inbound(inbound).await;
        }
    });
}

fn spawn_participant_dispatch(participant: Arc<Participant>, mut rx: UnboundedReceiver<Inbound>) {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            let participant = Arc::clone(&participant);
            tokio::spawn(async move {
                match inbound.message {
                    Message::VoteRequest { tid, image, files } => {
                        participant.handle_vote_request(&inbound.src, tid, image, files).await;
                    }
                    Message::VoteOutcome { tid, commit } => {
                        participant.handle_vote_outcome(&inbound.src, tid, commit).await;
                    }
                    _ => {}
                }
            });
        }
    });
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn new_coordinator(net: &LoopbackNetwork, addr: &str, dir: &std::path::Path) -> Arc<Coordinator> {
    let (transport, rx) = net.register(addr).await;
    let wal = Arc::new(Wal::open(dir.join("wal.log")).unwrap());
    let coordinator = Coordinator::new(dir.to_path_buf(), wal, Arc::new(transport));
    spawn_coordinator_dispatch(Arc::clone(&coordinator), rx);
    coordinator
}

async fn new_participant(
    net: &LoopbackNetwork,
    id: &str,
    dir: &std::path::Path,
    approve: bool,
) -> Arc<Participant> {
    let (transport, rx) = net.register(id).await;
    let wal = Arc::new(Wal::open(dir.join("wal.log")).unwrap());
    let hook: Arc<dyn collage_2pc::participant::UserHook> =
        if approve { Arc::new(AutoApprove) } else { Arc::new(AutoDeny) };
    let participant = Participant::new(id.to_string(), dir.to_path_buf(), wal, Arc::new(transport), hook);
    spawn_participant_dispatch(Arc::clone(&participant), rx);
    participant
}

#[tokio::test]
async fn single_participant_happy_commit() {
    let net = LoopbackNetwork::new();
    let coord_dir = tempdir().unwrap();
    let part_dir = tempdir().unwrap();
    std::fs::write(part_dir.path().join("a.png"), [1, 2, 3, 4]).unwrap();

    let coordinator = new_coordinator(&net, "coord", coord_dir.path()).await;
    let _participant = new_participant(&net, "A", part_dir.path(), true).await;

    let tid = coordinator
        .start_commit("out.png".to_string(), vec![1, 2, 3, 4], vec!["A:a.png".to_string()])
        .await;

    let dest = coord_dir.path().join("out.png");
    assert!(wait_until(|| dest.exists(), Duration::from_secs(2)).await, "destination never published");
    assert_eq!(std::fs::read(&dest).unwrap(), vec![1, 2, 3, 4]);

    let a_file = part_dir.path().join("a.png");
    assert!(wait_until(|| !a_file.exists(), Duration::from_secs(2)).await, "source file never deleted");

    let (committed, aborted, leaked) = coordinator.status.snapshot();
    assert_eq!((committed, aborted, leaked), (1, 0, 0));

    let records = Wal::replay(coord_dir.path().join("wal.log")).unwrap();
    assert!(records.iter().any(|r| matches!(r, collage_2pc::wal::Record::Completed { tid: t } if *t == tid)));
}

#[tokio::test]
async fn two_participants_one_refuses_aborts() {
    let net = LoopbackNetwork::new();
    let coord_dir = tempdir().unwrap();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    std::fs::write(dir_a.path().join("a"), [7]).unwrap();
    std::fs::write(dir_b.path().join("b"), [8]).unwrap();

    let coordinator = new_coordinator(&net, "coord2", coord_dir.path()).await;
    let _a = new_participant(&net, "A2", dir_a.path(), true).await;
    let _b = new_participant(&net, "B2", dir_b.path(), false).await;

    let _tid = coordinator
        .start_commit("out.png".to_string(), vec![9, 9], vec!["A2:a".to_string(), "B2:b".to_string()])
        .await;

    let dest = coord_dir.path().join("out.png");
    assert!(wait_until(|| coordinator.status.snapshot().1 == 1, Duration::from_secs(2)).await, "never aborted");
    assert!(!dest.exists(), "destination must not exist on abort");
    // a's file remains on disk -- only the lock is released, not the file.
    assert!(dir_a.path().join("a").exists());
}

#[tokio::test]
async fn overlapping_file_contention_forces_no() {
    let net = LoopbackNetwork::new();
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("shared"), [1]).unwrap();
    let (transport, rx) = net.register("C").await;
    let wal = Arc::new(Wal::open(dir.path().join("wal.log")).unwrap());
    let participant = Participant::new("C".to_string(), dir.path().to_path_buf(), wal, Arc::new(transport), Arc::new(AutoApprove));
    spawn_participant_dispatch(Arc::clone(&participant), rx);

    let (coord_tx, mut coord_rx) = net.register("coord3").await;
    coord_tx.send("C", Message::VoteRequest { tid: 1, image: vec![], files: vec!["shared".into()] }).await.unwrap();
    let first = coord_rx.recv().await.unwrap();
    assert_eq!(first.message, Message::VoteResponse { tid: 1, vote: true });

    coord_tx.send("C", Message::VoteRequest { tid: 2, image: vec![], files: vec!["shared".into()] }).await.unwrap();
    let second = coord_rx.recv().await.unwrap();
    assert_eq!(second.message, Message::VoteResponse { tid: 2, vote: false }, "overlapping file must be refused");
    assert!(participant.is_locked("shared").await);
}

#[tokio::test]
async fn lost_ack_is_retransmitted_and_eventually_completes() {
    // A transport that drops every VoteAck exactly once per participant,
    // then behaves normally, forcing the coordinator's ACK_TIMEOUT retry
    // path to run at least one extra round.
    use async_trait::async_trait;
    use collage_2pc::error::Error;
    use collage_2pc::transport::Transport;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DropFirstAck {
        inner: LoopbackTransport,
        dropped_once: AtomicBool,
    }

    #[async_trait]
    impl Transport for DropFirstAck {
        async fn send(&self, dest: &str, message: Message) -> Result<(), Error> {
            if matches!(message, Message::VoteAck { .. }) && !self.dropped_once.swap(true, Ordering::SeqCst) {
                return Ok(()); // silently dropped once
            }
            self.inner.send(dest, message).await
        }
    }

    let net = LoopbackNetwork::new();
    let coord_dir = tempdir().unwrap();
    let part_dir = tempdir().unwrap();
    std::fs::write(part_dir.path().join("a"), [5]).unwrap();

    let coordinator = new_coordinator(&net, "coord4", coord_dir.path()).await;
    let (inner_transport, rx) = net.register("D").await;
    let wal = Arc::new(Wal::open(part_dir.path().join("wal.log")).unwrap());
    let flaky = Arc::new(DropFirstAck { inner: inner_transport, dropped_once: AtomicBool::new(false) });
    let participant = Participant::new("D".to_string(), part_dir.path().to_path_buf(), wal, flaky, Arc::new(AutoApprove));
    spawn_participant_dispatch(participant, rx);

    let start = tokio::time::Instant::now();
    let _tid = coordinator
        .start_commit("out4.png".to_string(), vec![1], vec!["D:a".to_string()])
        .await;

    assert!(
        wait_until(|| coordinator.status.snapshot().0 == 1, Duration::from_secs(10)).await,
        "coordinator never completed after a lost ack"
    );
    // Completion required at least one ACK_TIMEOUT retry round.
    assert!(start.elapsed() >= collage_2pc::coordinator::ACK_TIMEOUT);
}

#[tokio::test]
async fn coordinator_recovery_republishes_commit_and_resends_outcome() {
    let dir = tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path().join("wal.log")).unwrap());

    // Simulate a crash right after the decision record was fsynced but
    // before the outcome was ever sent: write the WAL by hand.
    wal.append_and_fsync(&collage_2pc::wal::Record::ParticipantList {
        tid: 42,
        participants: vec!["P".to_string()],
    })
    .unwrap();
    collage_2pc::wal::log_collage(dir.path(), 42, &[3, 1, 4]).unwrap();
    wal.append_and_fsync(&collage_2pc::wal::Record::Decision {
        tid: 42,
        commit: true,
        filename: "recovered.png".to_string(),
        imgpath: collage_2pc::wal::blob_path(dir.path(), 42).to_string_lossy().into_owned(),
    })
    .unwrap();

    let net = LoopbackNetwork::new();
    let (transport, rx) = net.register("coord5").await;
    let (_p_transport, mut p_rx) = net.register("P").await;
    let coordinator = Coordinator::new(dir.path().to_path_buf(), wal, Arc::new(transport));
    spawn_coordinator_dispatch(Arc::clone(&coordinator), rx);

    recover_coordinator(&coordinator).await.unwrap();

    let dest = dir.path().join("recovered.png");
    assert!(wait_until(|| dest.exists(), Duration::from_secs(2)).await);
    assert_eq!(std::fs::read(&dest).unwrap(), vec![3, 1, 4]);

    let inbound = tokio::time::timeout(Duration::from_secs(2), p_rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.message, Message::VoteOutcome { tid: 42, commit: true });
}

#[tokio::test]
async fn participant_recovery_relocks_and_resends_yes() {
    let dir = tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path().join("wal.log")).unwrap());
    wal.append_and_fsync(&collage_2pc::wal::Record::StagedCommit {
        tid: 7,
        files: vec!["a".to_string(), "b".to_string()],
    })
    .unwrap();

    let net = LoopbackNetwork::new();
    let (transport, rx) = net.register("Q").await;
    let (_coord_transport, mut coord_rx) = net.register("coord6").await;
    let participant =
        Participant::new("Q".to_string(), dir.path().to_path_buf(), wal, Arc::new(transport), Arc::new(AutoApprove));
    spawn_participant_dispatch(Arc::clone(&participant), rx);

    recover_participant(&participant, Some("coord6")).await.unwrap();

    assert!(participant.is_locked("a").await);
    assert!(participant.is_locked("b").await);

    let inbound = tokio::time::timeout(Duration::from_secs(2), coord_rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.message, Message::VoteResponse { tid: 7, vote: true });
}
