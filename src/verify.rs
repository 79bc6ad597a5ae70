//!
//! verify.rs
//! Post-hoc invariant checking against a completed (or crashed) run's
//! on-disk state, generalizing the teacher project's `checker.rs` --
//! which cross-references a coordinator op-log against each
//! participant's op-log and asserts they agree on which transactions
//! committed -- from the teacher's custom `ProtocolMessage`/`OpLog`
//! format to this crate's WAL (§4.2) and to the testable properties of
//! §8 rather than the teacher's narrower commit/abort count check.
//!
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::wal::{Record, Wal};

/// One pass/fail line in a verification report, named after the §8
/// property it checks.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct Report {
    pub checks: Vec<Check>,
}

impl Report {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    fn push(&mut self, name: &str, passed: bool, detail: impl Into<String>) {
        self.checks.push(Check { name: name.to_string(), passed, detail: detail.into() });
    }
}

struct CoordTid {
    participants: Vec<String>,
    decision: Option<(bool, String, String)>,
}

/// Replay a coordinator's `wal.log` into a per-TID decision map.
fn replay_coordinator(dir: &Path) -> Result<HashMap<u32, CoordTid>, crate::error::Error> {
    let records = Wal::replay(dir.join("wal.log"))?;
    let mut by_tid: HashMap<u32, CoordTid> = HashMap::new();
    for record in records {
        let tid = record.tid();
        match record {
            Record::ParticipantList { participants, .. } => {
                by_tid.entry(tid).or_insert_with(|| CoordTid { participants: vec![], decision: None }).participants =
                    participants;
            }
            Record::Decision { commit, filename, imgpath, .. } => {
                by_tid
                    .entry(tid)
                    .or_insert_with(|| CoordTid { participants: vec![], decision: None })
                    .decision = Some((commit, filename, imgpath));
            }
            Record::Completed { .. } => {}
            Record::StagedCommit { .. } | Record::Applied { .. } => {}
        }
    }
    Ok(by_tid)
}

/// Simulate a participant's lock timeline from its WAL to check
/// invariant 3 (§8): no path is ever locked under two distinct TIDs at
/// once. Returns the staged file list per TID alongside any conflicts.
fn simulate_participant_locks(dir: &Path) -> Result<(HashMap<u32, Vec<String>>, Vec<String>), crate::error::Error> {
    let records = Wal::replay(dir.join("wal.log"))?;
    let mut staged: HashMap<u32, Vec<String>> = HashMap::new();
    let mut locked_by: HashMap<String, u32> = HashMap::new();
    let mut conflicts = Vec::new();

    for record in records {
        match record {
            Record::StagedCommit { tid, files } => {
                for f in &files {
                    if let Some(&holder) = locked_by.get(f) {
                        if holder != tid {
                            conflicts.push(format!("{f:?} locked by tid {holder} and tid {tid} simultaneously"));
                        }
                    }
                    locked_by.insert(f.clone(), tid);
                }
                staged.insert(tid, files);
            }
            Record::Applied { tid } => {
                if let Some(files) = staged.get(&tid) {
                    for f in files {
                        if locked_by.get(f) == Some(&tid) {
                            locked_by.remove(f);
                        }
                    }
                }
            }
            Record::ParticipantList { .. } | Record::Decision { .. } => {}
        }
    }
    Ok((staged, conflicts))
}

fn applied_tids(dir: &Path) -> Result<std::collections::HashSet<u32>, crate::error::Error> {
    let records = Wal::replay(dir.join("wal.log"))?;
    Ok(records
        .into_iter()
        .filter_map(|r| match r {
            Record::Applied { tid } => Some(tid),
            _ => None,
        })
        .collect())
}

/// Verify a completed run: `coordinator_dir` holds the coordinator's
/// `wal.log` and any `<tid>_img.bin` blobs; `participant_dirs` maps each
/// participant's id (as it appears in the coordinator's source strings)
/// to its own working directory.
pub fn verify(coordinator_dir: &Path, participant_dirs: &[(String, PathBuf)]) -> Result<Report, crate::error::Error> {
    let mut report = Report::default();
    let coord = replay_coordinator(coordinator_dir)?;

    for (&tid, state) in &coord {
        let Some((commit, filename, imgpath)) = &state.decision else {
            report.push(&format!("tid {tid} decision logged"), false, "no decision record found");
            continue;
        };

        if *commit {
            let dest = coordinator_dir.join(filename);
            let dest_bytes = std::fs::read(&dest);
            let blob_path = coordinator_dir.join(imgpath);
            let blob_bytes = std::fs::read(&blob_path);
            match (&dest_bytes, &blob_bytes) {
                (Ok(d), Ok(b)) => report.push(
                    &format!("tid {tid} destination matches blob"),
                    d == b,
                    format!("{} bytes vs blob {} bytes", d.len(), b.len()),
                ),
                (Err(e), _) => {
                    report.push(&format!("tid {tid} destination exists"), false, format!("{filename}: {e}"))
                }
                (_, Err(_)) => report.push(
                    &format!("tid {tid} destination matches blob"),
                    dest_bytes.is_ok(),
                    "blob already reclaimed; destination presence is all that can be checked",
                ),
            }
        } else {
            let dest = coordinator_dir.join(filename);
            report.push(
                &format!("tid {tid} destination absent on abort"),
                !dest.exists(),
                format!("{filename} must not exist"),
            );
        }

        for participant_id in &state.participants {
            let Some((_, participant_dir)) = participant_dirs.iter().find(|(id, _)| id == participant_id) else {
                continue;
            };
            let applied = applied_tids(participant_dir)?;
            let (staged, _) = simulate_participant_locks(participant_dir)?;
            if !applied.contains(&tid) {
                report.push(
                    &format!("tid {tid} participant {participant_id} applied"),
                    false,
                    "no Applied record for this TID",
                );
                continue;
            }
            if let Some(files) = staged.get(&tid) {
                if *commit {
                    let remaining: Vec<&String> =
                        files.iter().filter(|f| participant_dir.join(f).exists()).collect();
                    report.push(
                        &format!("tid {tid} participant {participant_id} deleted its files"),
                        remaining.is_empty(),
                        format!("still present: {remaining:?}"),
                    );
                }
            }
        }
    }

    let mut all_conflicts = Vec::new();
    for (id, dir) in participant_dirs {
        let (_, conflicts) = simulate_participant_locks(dir)?;
        for c in conflicts {
            all_conflicts.push(format!("{id}: {c}"));
        }
    }
    report.push(
        "no participant ever double-locks a path",
        all_conflicts.is_empty(),
        all_conflicts.join("; "),
    );

    Ok(report)
}
