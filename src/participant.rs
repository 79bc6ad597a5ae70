//!
//! participant.rs
//! The participant's per-TID state machine: `IDLE -> STAGED ->
//! {APPLIED_COMMIT | APPLIED_ABORT}` (§4.4), plus the file-lock
//! discipline guarding concurrent transactions over the same local
//! namespace.
//!
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::message::Message;
use crate::transport::Transport;
use crate::wal::{Record, Wal};

/// The injected `askUser(image, files) -> bool` hook (§6). A participant
/// never votes YES without consulting it first.
#[async_trait]
pub trait UserHook: Send + Sync {
    async fn ask(&self, image: &[u8], files: &[String]) -> bool;
}

/// Always approves. Used by tests and by any deployment that wants an
/// unattended participant.
pub struct AutoApprove;

#[async_trait]
impl UserHook for AutoApprove {
    async fn ask(&self, _image: &[u8], _files: &[String]) -> bool {
        true
    }
}

/// Always refuses, for exercising the NO-vote path deterministically.
pub struct AutoDeny;

#[async_trait]
impl UserHook for AutoDeny {
    async fn ask(&self, _image: &[u8], _files: &[String]) -> bool {
        false
    }
}

/// Prompts on stdin, the one concrete `askUser` a human operator runs
/// the `participant` binary with. Reading stdin is blocking, so it runs
/// on a blocking-pool thread rather than stalling the async dispatch
/// loop for every other in-flight transaction.
pub struct StdinPrompt;

#[async_trait]
impl UserHook for StdinPrompt {
    async fn ask(&self, image: &[u8], files: &[String]) -> bool {
        let files = files.to_vec();
        let image_len = image.len();
        tokio::task::spawn_blocking(move || {
            println!(
                "Release {} file(s) for a {}-byte collage? {:?} [y/N] ",
                files.len(),
                image_len,
                files
            );
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

fn fatal_wal_error(context: &str, err: Error) -> ! {
    log::error!("fatal WAL error ({context}): {err}; participant cannot continue");
    std::process::exit(1);
}

/// Runtime state guarded by the single process-wide mutex of §4.4: the
/// global lock set and the TID -> staged-files map are one unit because
/// every transition touches both together.
#[derive(Default)]
struct State {
    locked: HashSet<String>,
    staged: HashMap<u32, Vec<String>>,
}

pub struct Participant {
    pub id: String,
    dir: PathBuf,
    wal: Arc<Wal>,
    transport: Arc<dyn Transport>,
    ask_user: Arc<dyn UserHook>,
    state: tokio::sync::Mutex<State>,
}

impl Participant {
    pub fn new(
        id: String,
        dir: PathBuf,
        wal: Arc<Wal>,
        transport: Arc<dyn Transport>,
        ask_user: Arc<dyn UserHook>,
    ) -> Arc<Participant> {
        Arc::new(Participant { id, dir, wal, transport, ask_user, state: tokio::sync::Mutex::new(State::default()) })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Receive `VOTE_REQUEST(tid, image, files)` from `src`. Consults the
    /// injected hook first (a suspension point, not under the lock
    /// mutex), then atomically checks and claims the files.
    pub async fn handle_vote_request(&self, src: &str, tid: u32, image: Vec<u8>, files: Vec<String>) {
        let approved = self.ask_user.ask(&image, &files).await;

        let vote = {
            let mut state = self.state.lock().await;
            let free = files.iter().all(|f| !state.locked.contains(f));
            if approved && free {
                if let Err(e) = self.wal.append_and_fsync(&Record::StagedCommit { tid, files: files.clone() }) {
                    fatal_wal_error("staged-commit", e);
                }
                for f in &files {
                    state.locked.insert(f.clone());
                }
                state.staged.insert(tid, files.clone());
                true
            } else {
                false
            }
        };

        log::debug!("tid {tid}: voting {} to {src}", if vote { "YES" } else { "NO" });
        if let Err(e) = self.transport.send(src, Message::VoteResponse { tid, vote }).await {
            log::warn!("tid {tid}: VOTE_RESPONSE to {src} failed: {e}");
        }
    }

    /// Receive `VOTE_OUTCOME(tid, commit)` from `src`. Applies the
    /// decision (idempotently), acks, then logs completion -- the
    /// invariant is only that the ack is not sent before the local apply
    /// is durable; an outcome for an unknown TID still acks and logs
    /// completion so it breaks coordinator retransmission (§9).
    pub async fn handle_vote_outcome(&self, src: &str, tid: u32, commit: bool) {
        let staged_files = {
            let mut state = self.state.lock().await;
            let files = state.staged.remove(&tid);
            if let Some(files) = &files {
                for f in files {
                    state.locked.remove(f);
                }
            }
            files
        };

        if let Some(files) = &staged_files {
            if commit {
                for f in files {
                    let path = self.dir.join(f);
                    match tokio::fs::try_exists(&path).await {
                        Ok(true) => {
                            if let Err(e) = tokio::fs::remove_file(&path).await {
                                log::warn!("tid {tid}: deleting {f:?} failed: {e}; recovery will retry");
                            }
                        }
                        Ok(false) => {} // already deleted: idempotent
                        Err(e) => log::warn!("tid {tid}: checking {f:?} failed: {e}"),
                    }
                }
            }
        } else {
            log::debug!("tid {tid}: VOTE_OUTCOME for unknown transaction; acking defensively");
        }

        if let Err(e) = self.transport.send(src, Message::VoteAck { tid, participant_id: self.id.clone() }).await {
            log::warn!("tid {tid}: VOTE_ACK to {src} failed: {e}");
        }
        if let Err(e) = self.wal.append_and_fsync(&Record::Applied { tid }) {
            fatal_wal_error("applied", e);
        }
    }

    /// Reconstruct staged state for a TID recovered from the WAL (§4.5):
    /// re-lock its files and rebuild the TID -> files map, without
    /// speculatively applying or aborting.
    pub(crate) async fn restage(&self, tid: u32, files: Vec<String>) {
        let mut state = self.state.lock().await;
        for f in &files {
            state.locked.insert(f.clone());
        }
        state.staged.insert(tid, files);
    }

    #[cfg(test)]
    pub(crate) async fn is_locked(&self, path: &str) -> bool {
        self.state.lock().await.locked.contains(path)
    }
}
