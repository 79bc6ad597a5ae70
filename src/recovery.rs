//!
//! recovery.rs
//! Startup replay for both node kinds (§4.5). Recovery runs after the
//! transport is created (so it may send messages) but before any live
//! traffic is dispatched, reconstructing in-memory state purely from the
//! WAL and, for the coordinator, resuming any transaction left mid-flight.
//!
use std::collections::HashMap;
use std::sync::Arc;

use atomic_counter::AtomicCounter;

use crate::coordinator::Coordinator;
use crate::message::Message;
use crate::participant::Participant;
use crate::wal::{Record, Wal};

/// The latest-known state for one TID as seen by the coordinator's log:
/// every TID gets exactly one `ParticipantList`, then at most one
/// `Decision`, then at most one `Completed`, written in that order, so
/// "latest record type" is simply the highest type number observed.
#[derive(Default)]
struct CoordTidState {
    participants: Vec<String>,
    decision: Option<(bool, String, String)>, // (commit, filename, imgpath)
    completed: bool,
}

/// Replay the coordinator's WAL and resume every transaction that did
/// not reach `Completed`. Must run before the coordinator accepts new
/// `startCommit` calls, and must advance the TID counter past every
/// logged TID so freshly allocated TIDs never collide with history.
pub async fn recover_coordinator(coordinator: &Arc<Coordinator>) -> Result<(), crate::error::Error> {
    let records = Wal::replay(coordinator.wal().path())?;
    let mut by_tid: HashMap<u32, CoordTidState> = HashMap::new();
    let mut max_tid: Option<u32> = None;

    for record in records {
        let tid = record.tid();
        max_tid = Some(max_tid.map_or(tid, |m| m.max(tid)));
        let entry = by_tid.entry(tid).or_default();
        match record {
            Record::ParticipantList { participants, .. } => entry.participants = participants,
            Record::Decision { commit, filename, imgpath, .. } => entry.decision = Some((commit, filename, imgpath)),
            Record::Completed { .. } => entry.completed = true,
            Record::StagedCommit { .. } | Record::Applied { .. } => {
                log::warn!("tid {tid}: participant-only record found in coordinator WAL; ignoring");
            }
        }
    }

    if let Some(max_tid) = max_tid {
        let next = (max_tid as usize) + 1;
        let current = coordinator.tid_counter().get();
        if next > current {
            coordinator.tid_counter().add(next - current);
        }
    }

    for (tid, state) in by_tid {
        if state.completed {
            // §7: a destination-publish failure "is logged and re-tried on
            // next recovery" -- that holds even once `Completed` has been
            // logged, since the publish happens after the decision is
            // durable but is not itself covered by the decision fsync.
            if let Some((true, filename, imgpath)) = &state.decision {
                republish_if_missing(tid, filename, imgpath).await;
            }
            continue;
        }
        match state.decision {
            None => {
                log::info!("tid {tid}: recovered with no decision logged; treating as ABORT");
                resend_abort_only(coordinator, tid, &state.participants).await;
            }
            Some((false, _, _)) => {
                log::info!("tid {tid}: recovered decision=ABORT, never completed");
                resend_abort_only(coordinator, tid, &state.participants).await;
            }
            Some((true, filename, imgpath)) => {
                log::info!("tid {tid}: recovered decision=COMMIT, never completed; re-publishing and resuming acks");
                if let Err(e) = republish(tid, &filename, &imgpath).await {
                    log::warn!("tid {tid}: re-publishing {filename} from {imgpath} failed: {e}");
                }
                let coordinator = Arc::clone(coordinator);
                let participants = state.participants;
                tokio::spawn(async move {
                    coordinator.recover_await_acks(tid, participants).await;
                });
            }
        }
    }
    Ok(())
}

/// Copy the blob at `imgpath` to `filename`, unconditionally. Used for a
/// TID still mid-flight, where the destination may or may not already
/// exist and republishing over it is harmless (both sides hold the same
/// committed image).
async fn republish(tid: u32, filename: &str, imgpath: &str) -> std::io::Result<()> {
    if imgpath.is_empty() || !tokio::fs::try_exists(imgpath).await.unwrap_or(false) {
        return Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("blob {imgpath} missing")));
    }
    tokio::fs::copy(imgpath, filename).await.map(|_| ())?;
    log::info!("tid {tid}: republished {filename} from {imgpath}");
    Ok(())
}

/// §7: a TID whose decision was logged as COMMIT and whose `Completed`
/// record was also logged, but whose destination file is absent (the
/// original publish attempt failed after `Completed` was already
/// appended), is re-published here as long as its blob side-file still
/// exists. A destination that already exists is left untouched.
async fn republish_if_missing(tid: u32, filename: &str, imgpath: &str) {
    if tokio::fs::try_exists(filename).await.unwrap_or(false) {
        return;
    }
    if let Err(e) = republish(tid, filename, imgpath).await {
        log::warn!("tid {tid}: completed commit missing destination {filename}, blob unusable: {e}");
    }
}

/// §4.5 case 2: send `VOTE_OUTCOME(commit=false)` once to every known
/// participant and consider the TID closed without collecting acks --
/// the design notes resolve this as "the coordinator never learns
/// whether locks were actually released", which is acceptable because
/// the outcome handler on the participant side is itself idempotent and
/// will be retried by the participant's own recovery if it crashed too.
async fn resend_abort_only(coordinator: &Arc<Coordinator>, tid: u32, participants: &[String]) {
    for p in participants {
        if let Err(e) = coordinator.transport().send(p, Message::VoteOutcome { tid, commit: false }).await {
            log::warn!("tid {tid}: recovery VOTE_OUTCOME to {p} failed: {e}");
        }
    }
    if let Err(e) = coordinator.wal().append_and_fsync(&crate::wal::Record::Completed { tid }) {
        log::error!("fatal WAL error (recovery completed): {e}; coordinator cannot continue");
        std::process::exit(1);
    }
}

/// Replay the participant's WAL. A TID whose latest record is
/// `StagedCommit` with no matching `Applied` is restaged (re-locked) and
/// its YES vote is resent, so a coordinator retransmitting prepares
/// after its own crash converges; the participant never speculatively
/// applies or aborts on its own.
pub async fn recover_participant(participant: &Arc<Participant>, coordinator_addr: Option<&str>) -> Result<(), crate::error::Error> {
    let records = Wal::replay(participant.wal().path())?;
    let mut staged: HashMap<u32, Vec<String>> = HashMap::new();
    let mut applied: HashMap<u32, bool> = HashMap::new();

    for record in records {
        let tid = record.tid();
        match record {
            Record::StagedCommit { files, .. } => {
                staged.insert(tid, files);
            }
            Record::Applied { .. } => {
                applied.insert(tid, true);
            }
            Record::ParticipantList { .. } | Record::Decision { .. } => {
                log::warn!("tid {tid}: coordinator-only record found in participant WAL; ignoring");
            }
        }
    }

    for (tid, files) in staged {
        if applied.contains_key(&tid) {
            continue;
        }
        participant.restage(tid, files).await;
        match coordinator_addr {
            Some(addr) => {
                log::info!("tid {tid}: recovered staged-commit with no decision; resending YES to {addr}");
                if let Err(e) = participant.transport().send(addr, Message::VoteResponse { tid, vote: true }).await {
                    log::warn!("tid {tid}: recovery VOTE_RESPONSE to {addr} failed: {e}");
                }
            }
            None => log::warn!(
                "tid {tid}: recovered staged-commit but no --coordinator address configured; cannot resend YES"
            ),
        }
    }
    Ok(())
}
