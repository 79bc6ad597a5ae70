//!
//! wal.rs
//! Write-ahead log: append-only, comma-separated, one record per line,
//! each line terminated by the literal token `EOL`. A line not ending in
//! `EOL` is a torn tail from a crash mid-write and is the only defense
//! against partial writes -- it is simply ignored on replay.
//!
//! Writes go through a single process-wide mutex; `fsync` is a separate
//! operation the caller invokes once after one or more logically linked
//! appends, matching the teacher project's op-log which also serializes
//! all writers behind one lock (`oplog::OpLog`'s `Arc<Mutex<_>>`) but
//! durability here is explicit rather than implicit-per-write.
//!
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Error;

/// A single decoded WAL record. Coordinator logs only ever contain
/// `ParticipantList`, `Decision`, and `Completed`; participant logs only
/// ever contain `StagedCommit` and `Applied` -- the two node kinds never
/// share a log file, so there is no ambiguity despite sharing one enum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// type 0 -- coordinator: participant list for a TID.
    ParticipantList { tid: u32, participants: Vec<String> },
    /// type 1 -- coordinator: the durable decision.
    Decision { tid: u32, commit: bool, filename: String, imgpath: String },
    /// type 2 -- coordinator: transaction fully completed.
    Completed { tid: u32 },
    /// type 3 -- participant: staged commit with its file list.
    StagedCommit { tid: u32, files: Vec<String> },
    /// type 4 -- participant: local apply (and ack) completed.
    Applied { tid: u32 },
}

impl Record {
    pub fn tid(&self) -> u32 {
        match self {
            Record::ParticipantList { tid, .. } => *tid,
            Record::Decision { tid, .. } => *tid,
            Record::Completed { tid } => *tid,
            Record::StagedCommit { tid, .. } => *tid,
            Record::Applied { tid } => *tid,
        }
    }

    /// A field used verbatim in a comma-separated record must not itself
    /// contain a comma or the literal `EOL` token, or it would desync the
    /// reader. The source is silent on this; §9 resolves it by rejecting
    /// such inputs outright rather than guessing an escaping scheme.
    fn validate_field(s: &str) -> Result<(), Error> {
        if s.contains(',') || s == "EOL" {
            return Err(Error::LocalIOError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("WAL field {s:?} contains a comma or the EOL token"),
            )));
        }
        Ok(())
    }

    fn encode(&self) -> Result<String, Error> {
        let mut parts: Vec<String> = Vec::new();
        match self {
            Record::ParticipantList { tid, participants } => {
                parts.push(tid.to_string());
                parts.push("0".to_string());
                parts.push(participants.len().to_string());
                for p in participants {
                    Self::validate_field(p)?;
                    parts.push(p.clone());
                }
            }
            Record::Decision { tid, commit, filename, imgpath } => {
                Self::validate_field(filename)?;
                Self::validate_field(imgpath)?;
                parts.push(tid.to_string());
                parts.push("1".to_string());
                parts.push(if *commit { "true" } else { "false" }.to_string());
                parts.push(filename.clone());
                parts.push(imgpath.clone());
            }
            Record::Completed { tid } => {
                parts.push(tid.to_string());
                parts.push("2".to_string());
            }
            Record::StagedCommit { tid, files } => {
                parts.push(tid.to_string());
                parts.push("3".to_string());
                parts.push(files.len().to_string());
                for f in files {
                    Self::validate_field(f)?;
                    parts.push(f.clone());
                }
            }
            Record::Applied { tid } => {
                parts.push(tid.to_string());
                parts.push("4".to_string());
            }
        }
        parts.push("EOL".to_string());
        Ok(parts.join(","))
    }

    /// Parse one line. Returns `None` for a torn tail: a line that does
    /// not end in the `EOL` token, or whose fields don't parse -- both
    /// are treated identically, since a crash can corrupt a write
    /// anywhere in the line, not only at its very end.
    fn parse(line: &str) -> Option<Record> {
        let line = line.trim_end_matches(['\n', '\r']);
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 3 || *parts.last().unwrap() != "EOL" {
            return None;
        }
        let fields = &parts[..parts.len() - 1]; // drop trailing EOL
        let tid: u32 = fields[0].parse().ok()?;
        let rtype: u32 = fields[1].parse().ok()?;
        match rtype {
            0 => {
                let n: usize = fields.get(2)?.parse().ok()?;
                let rest = &fields[3..];
                if rest.len() != n {
                    return None;
                }
                Some(Record::ParticipantList {
                    tid,
                    participants: rest.iter().map(|s| s.to_string()).collect(),
                })
            }
            1 => {
                if fields.len() != 5 {
                    return None;
                }
                let commit = match fields[2] {
                    "true" => true,
                    "false" => false,
                    _ => return None,
                };
                Some(Record::Decision {
                    tid,
                    commit,
                    filename: fields[3].to_string(),
                    imgpath: fields[4].to_string(),
                })
            }
            2 => {
                if fields.len() != 2 {
                    return None;
                }
                Some(Record::Completed { tid })
            }
            3 => {
                let n: usize = fields.get(2)?.parse().ok()?;
                let rest = &fields[3..];
                if rest.len() != n {
                    return None;
                }
                Some(Record::StagedCommit {
                    tid,
                    files: rest.iter().map(|s| s.to_string()).collect(),
                })
            }
            4 => {
                if fields.len() != 2 {
                    return None;
                }
                Some(Record::Applied { tid })
            }
            _ => None,
        }
    }
}

/// An append-only write-ahead log file.
pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
}

impl Wal {
    /// Open (creating if absent) the WAL at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        Ok(Wal { file: Mutex::new(file), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Does not fsync -- call `fsync` once after any
    /// group of logically linked appends per §4.2.
    pub fn append(&self, record: &Record) -> Result<(), Error> {
        let line = record.encode()?;
        let mut f = self.file.lock().expect("WAL mutex poisoned");
        writeln!(f, "{line}")?;
        Ok(())
    }

    /// Durability barrier over everything written so far.
    pub fn fsync(&self) -> Result<(), Error> {
        let f = self.file.lock().expect("WAL mutex poisoned");
        f.sync_all()?;
        Ok(())
    }

    pub fn append_and_fsync(&self, record: &Record) -> Result<(), Error> {
        self.append(record)?;
        self.fsync()
    }

    /// Stream the WAL and return every well-formed record in file order,
    /// silently dropping any torn tail.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<Record>, Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(record) = Record::parse(&line) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

/// Path of the image blob side-file for a coordinator TID, as required
/// by `logCollage` (§4.2): `<dir>/<tid>_img.bin`.
pub fn blob_path(dir: impl AsRef<Path>, tid: u32) -> PathBuf {
    dir.as_ref().join(format!("{tid}_img.bin"))
}

/// `logCollage(tid, img)`: durably write the committed image to its
/// blob side-file. Must complete (and be fsynced) before the decision
/// record referring to it is appended.
pub fn log_collage(dir: impl AsRef<Path>, tid: u32, img: &[u8]) -> Result<PathBuf, Error> {
    let path = blob_path(dir, tid);
    let mut f = File::create(&path)?;
    f.write_all(img)?;
    f.sync_all()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn participant_list_round_trips() {
        let r = Record::ParticipantList { tid: 5, participants: vec!["A".into(), "B".into()] };
        assert_eq!(Record::parse(&r.encode().unwrap()), Some(r));
    }

    #[test]
    fn decision_round_trips() {
        let r = Record::Decision {
            tid: 5,
            commit: true,
            filename: "out.png".into(),
            imgpath: "5_img.bin".into(),
        };
        assert_eq!(Record::parse(&r.encode().unwrap()), Some(r));
    }

    #[test]
    fn staged_commit_round_trips() {
        let r = Record::StagedCommit { tid: 2, files: vec!["a.png".into()] };
        assert_eq!(Record::parse(&r.encode().unwrap()), Some(r));
    }

    #[test]
    fn comma_in_field_is_rejected() {
        let r = Record::Decision {
            tid: 1,
            commit: true,
            filename: "out,png".into(),
            imgpath: "1_img.bin".into(),
        };
        assert!(r.encode().is_err());
    }

    #[test]
    fn torn_tail_is_ignored_on_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(&Record::ParticipantList { tid: 1, participants: vec!["A".into()] }).unwrap();
            wal.fsync().unwrap();
        }
        // Simulate a crash mid-write: append a torn line with no EOL token.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "2,0,1,A").unwrap(); // no trailing ,EOL and no newline
        }
        let records = Wal::replay(&path).unwrap();
        assert_eq!(records, vec![Record::ParticipantList { tid: 1, participants: vec!["A".into()] }]);
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does_not_exist.log");
        assert_eq!(Wal::replay(&path).unwrap(), Vec::new());
    }

    #[test]
    fn blob_written_before_decision_is_readable() {
        let dir = tempdir().unwrap();
        let path = log_collage(dir.path(), 9, &[1, 2, 3]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert_eq!(path, blob_path(dir.path(), 9));
    }
}
