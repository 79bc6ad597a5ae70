//!
//! coordinator.rs
//! The coordinator's per-transaction state machine: `INIT -> PREPARING ->
//! {DECIDE_COMMIT | DECIDE_ABORT} -> AWAITING_ACKS -> COMPLETED` (§4.3).
//! One `tokio::task` drives each transaction end to end, matching the
//! "lightweight task with its own timers" re-architecture hint of the
//! original design notes rather than a thread per transaction.
//!
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use atomic_counter::{AtomicCounter, RelaxedCounter};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::error::Error;
use crate::message::Message;
use crate::transport::{Inbound, Transport};
use crate::wal::{self, Record, Wal};

/// Vote collection deadline, measured from entry to PREPARING (§4.3).
pub const VOTE_TIMEOUT: Duration = Duration::from_secs(3);
/// Ack retransmission interval (§4.3).
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Retransmission rounds before the coordinator gives up on stragglers.
pub const MAX_RETRIES: u32 = 20;

/// A fatal local I/O error on the WAL write path voids the commit
/// protocol's durability claim; per §7 the node must refuse to continue
/// rather than silently proceed as if the record were durable.
fn fatal_wal_error(context: &str, err: Error) -> ! {
    log::error!("fatal WAL error ({context}): {err}; coordinator cannot continue");
    std::process::exit(1);
}

/// Split a `"<address>:<filepath>"` source (§6) into `(address, path)`.
///
/// §10.1 dials `<address>` as a TCP `host:port`, which already contains a
/// colon, so a plain first-colon split (as the distilled spec's abstract
/// opaque addresses would allow) cannot tell a dialable address from its
/// path when both are present: `"127.0.0.1:6000:a.png"` must yield
/// address `"127.0.0.1:6000"`, not `"127.0.0.1"`. Resolved by first trying
/// a three-way split and accepting it only when the middle component is
/// entirely digits (a port number) -- otherwise falling back to the
/// original first-colon split, which still covers the opaque,
/// non-networked addresses (e.g. `"A:a.png"`) the test suite and the
/// loopback transport use. Either way, the path keeps any further colons
/// intact, per §6's "paths may contain further colons".
fn parse_source(source: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = source.splitn(3, ':').collect();
    if parts.len() == 3 && !parts[1].is_empty() && parts[1].bytes().all(|b| b.is_ascii_digit()) {
        return Some((format!("{}:{}", parts[0], parts[1]), parts[2].to_string()));
    }
    source.split_once(':').map(|(a, p)| (a.to_string(), p.to_string()))
}

/// Aggregate counters surfaced by the coordinator's status report
/// (§10.6), extending the teacher project's end-of-run report with the
/// "leaked participant" counter the design notes call for instead of
/// silently giving up after `MAX_RETRIES`.
#[derive(Default)]
pub struct Status {
    pub committed: AtomicUsize,
    pub aborted: AtomicUsize,
    pub leaked: AtomicUsize,
}

impl Status {
    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.committed.load(Ordering::Relaxed),
            self.aborted.load(Ordering::Relaxed),
            self.leaked.load(Ordering::Relaxed),
        )
    }
}

/// Per-TID dispatch registration: the main inbound loop forwards
/// `VoteResponse` / `VoteAck` frames for a TID into that transaction's
/// private channel. A TID absent from this map means "unknown
/// transaction" -- the coordinator drops the frame (§7).
type Registry = Mutex<HashMap<u32, mpsc::UnboundedSender<Inbound>>>;

pub struct Coordinator {
    dir: PathBuf,
    wal: Arc<Wal>,
    transport: Arc<dyn Transport>,
    tid_counter: RelaxedCounter,
    registry: Registry,
    pub status: Status,
}

impl Coordinator {
    pub fn new(dir: PathBuf, wal: Arc<Wal>, transport: Arc<dyn Transport>) -> Arc<Coordinator> {
        Arc::new(Coordinator {
            dir,
            wal,
            transport,
            tid_counter: RelaxedCounter::new(0),
            registry: Mutex::new(HashMap::new()),
            status: Status::default(),
        })
    }

    /// `startCommit(filename, image, sources)` (§4.3, §6). Parses each
    /// source into `(address, path)` via `parse_source`, allocates a fresh
    /// TID, durably logs the participant list, then spawns the
    /// transaction task and returns immediately -- `startCommit` never
    /// fails to its caller (§7 propagation policy).
    pub async fn start_commit(self: &Arc<Self>, filename: String, image: Vec<u8>, sources: Vec<String>) -> u32 {
        let mut files_by_participant: HashMap<String, Vec<String>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for source in &sources {
            let (addr, path) = match parse_source(source) {
                Some(parsed) => parsed,
                None => {
                    log::warn!("source {source:?} has no ':' separator; skipping");
                    continue;
                }
            };
            if !files_by_participant.contains_key(&addr) {
                order.push(addr.clone());
            }
            files_by_participant.entry(addr).or_default().push(path);
        }

        let tid = self.tid_counter.inc() as u32;
        if let Err(e) = self
            .wal
            .append_and_fsync(&Record::ParticipantList { tid, participants: order.clone() })
        {
            fatal_wal_error("participant list", e);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().await.insert(tid, tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_transaction(tid, filename, image, order, files_by_participant, rx).await;
        });
        tid
    }

    /// Routes a live inbound frame to its transaction's dispatch channel.
    /// Called from the node's main event loop. A TID with no registered
    /// channel is either completed or never existed; both are dropped.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        match &inbound.message {
            Message::VoteResponse { tid, .. } | Message::VoteAck { tid, .. } => {
                let registry = self.registry.lock().await;
                match registry.get(tid) {
                    Some(tx) => {
                        let _ = tx.send(inbound);
                    }
                    None => log::debug!("dropping frame for unknown/completed tid {tid}"),
                }
            }
            other => log::warn!("coordinator received a message it never sends: {other:?}"),
        }
    }

    async fn run_transaction(
        self: Arc<Self>,
        tid: u32,
        filename: String,
        image: Vec<u8>,
        participants: Vec<String>,
        files_by_participant: HashMap<String, Vec<String>>,
        mut rx: mpsc::UnboundedReceiver<Inbound>,
    ) {
        // PREPARING: one VOTE_REQUEST per participant, its files only.
        for p in &participants {
            let files = files_by_participant.get(p).cloned().unwrap_or_default();
            if let Err(e) = self.transport.send(p, Message::VoteRequest { tid, image: image.clone(), files }).await {
                log::warn!("tid {tid}: VOTE_REQUEST to {p} failed: {e}");
            }
        }

        let commit = self.collect_votes(tid, &participants, &mut rx).await;
        if commit {
            self.status.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.status.aborted.fetch_add(1, Ordering::Relaxed);
        }
        log::info!("tid {tid}: decision = {}", if commit { "COMMIT" } else { "ABORT" });

        // Decision durability (invariant 4): blob first, then the
        // decision record, fsynced, before any outcome message or the
        // destination publish.
        let imgpath = if commit {
            match wal::log_collage(&self.dir, tid, &image) {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(e) => {
                    fatal_wal_error("image blob", e);
                }
            }
        } else {
            String::new()
        };
        if let Err(e) = self.wal.append_and_fsync(&Record::Decision {
            tid,
            commit,
            filename: filename.clone(),
            imgpath,
        }) {
            fatal_wal_error("decision", e);
        }

        if commit {
            if let Err(e) = tokio::fs::write(&filename, &image).await {
                log::warn!("tid {tid}: publishing destination {filename} failed: {e}; recovery will retry");
            }
        }

        self.await_acks(tid, &participants, commit, &mut rx, HashSet::new()).await;
        self.registry.lock().await.remove(&tid);
    }

    /// Collect `VOTE_RESPONSE`s until every participant has voted YES
    /// (deduped by participant id -- the source counts duplicate YESes
    /// multiple times, treated here as a bug per §9), a NO arrives, or
    /// `VOTE_TIMEOUT` elapses.
    async fn collect_votes(
        &self,
        tid: u32,
        participants: &[String],
        rx: &mut mpsc::UnboundedReceiver<Inbound>,
    ) -> bool {
        let deadline = Instant::now() + VOTE_TIMEOUT;
        let mut yes: HashSet<String> = HashSet::new();
        let mut decided_abort = false;

        while !decided_abort && yes.len() < participants.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(inbound)) => match inbound.message {
                    Message::VoteResponse { vote, .. } => {
                        if vote {
                            yes.insert(inbound.src);
                        } else {
                            decided_abort = true;
                        }
                    }
                    other => log::debug!("tid {tid}: ignoring unexpected {other:?} during PREPARING"),
                },
                Ok(None) => break,
                Err(_elapsed) => break, // VOTE_TIMEOUT reached
            }
        }
        !decided_abort && yes.len() >= participants.len()
    }

    /// AWAITING_ACKS: broadcast `VOTE_OUTCOME` to every known participant
    /// (not only YES voters -- abort notifications must reach everyone so
    /// locks are released), then retransmit to stragglers every
    /// `ACK_TIMEOUT` up to `MAX_RETRIES` rounds.
    async fn await_acks(
        &self,
        tid: u32,
        participants: &[String],
        commit: bool,
        rx: &mut mpsc::UnboundedReceiver<Inbound>,
        mut acked: HashSet<String>,
    ) {
        for round in 0..MAX_RETRIES {
            for p in participants {
                if !acked.contains(p) {
                    if let Err(e) = self.transport.send(p, Message::VoteOutcome { tid, commit }).await {
                        log::warn!("tid {tid}: VOTE_OUTCOME to {p} failed (round {round}): {e}");
                    }
                }
            }
            if acked.len() >= participants.len() {
                break;
            }
            let deadline = Instant::now() + ACK_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, rx.recv()).await {
                    Ok(Some(inbound)) => {
                        if let Message::VoteAck { participant_id, .. } = inbound.message {
                            acked.insert(participant_id);
                        }
                    }
                    Ok(None) => break,
                    Err(_elapsed) => break,
                }
            }
            if acked.len() >= participants.len() {
                break;
            }
        }

        if acked.len() < participants.len() {
            self.status.leaked.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "tid {tid}: giving up after {MAX_RETRIES} retries with {}/{} acked",
                acked.len(),
                participants.len()
            );
        }

        if let Err(e) = self.wal.append_and_fsync(&Record::Completed { tid }) {
            fatal_wal_error("completed", e);
        }
    }

    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub(crate) fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn tid_counter(&self) -> &RelaxedCounter {
        &self.tid_counter
    }

    pub(crate) async fn register(&self, tid: u32) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().await.insert(tid, tx);
        rx
    }

    pub(crate) async fn unregister(&self, tid: u32) {
        self.registry.lock().await.remove(&tid);
    }

    /// Re-enter AWAITING_ACKS for a TID recovered mid-flight (§4.5 case 3).
    pub(crate) async fn recover_await_acks(self: &Arc<Self>, tid: u32, participants: Vec<String>) {
        let mut rx = self.register(tid).await;
        self.await_acks(tid, &participants, true, &mut rx, HashSet::new()).await;
        self.unregister(tid).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_address_splits_on_first_colon() {
        assert_eq!(parse_source("A:a.png"), Some(("A".to_string(), "a.png".to_string())));
    }

    #[test]
    fn opaque_address_path_may_contain_further_colons() {
        assert_eq!(parse_source("A:b:c.png"), Some(("A".to_string(), "b:c.png".to_string())));
    }

    #[test]
    fn host_port_address_splits_on_second_colon() {
        assert_eq!(
            parse_source("127.0.0.1:6000:a.png"),
            Some(("127.0.0.1:6000".to_string(), "a.png".to_string()))
        );
    }

    #[test]
    fn host_port_address_path_may_contain_further_colons() {
        assert_eq!(
            parse_source("127.0.0.1:6000:dir/a:b.png"),
            Some(("127.0.0.1:6000".to_string(), "dir/a:b.png".to_string()))
        );
    }

    #[test]
    fn source_with_no_colon_is_rejected() {
        assert_eq!(parse_source("nocolon"), None);
    }
}
