//!
//! message.rs
//! Binary wire codec shared between coordinator and participant.
//!
//! Every message body starts with a `u32` message type and a `u32`
//! transaction id, followed by type-specific fields. Strings are
//! length-prefixed with a two-byte big-endian count followed by their
//! UTF-8 bytes -- the same layout `java.io.DataOutputStream.writeUTF`
//! produces, since a cross-language participant may exist on the wire.
//!
use crate::error::Error;

const TYPE_VOTE_REQUEST: u32 = 0;
const TYPE_VOTE_OUTCOME: u32 = 1;
const TYPE_VOTE_RESPONSE: u32 = 2;
const TYPE_VOTE_ACK: u32 = 3;

/// A decoded protocol message. `tid` is present on every variant because
/// every record on the wire is keyed by transaction id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Coordinator -> participant: vote on releasing `files`.
    VoteRequest { tid: u32, image: Vec<u8>, files: Vec<String> },
    /// Coordinator -> participant: the binding decision.
    VoteOutcome { tid: u32, commit: bool },
    /// Participant -> coordinator: this participant's vote.
    VoteResponse { tid: u32, vote: bool },
    /// Participant -> coordinator: decision has been applied locally.
    VoteAck { tid: u32, participant_id: String },
}

impl Message {
    pub fn tid(&self) -> u32 {
        match self {
            Message::VoteRequest { tid, .. } => *tid,
            Message::VoteOutcome { tid, .. } => *tid,
            Message::VoteResponse { tid, .. } => *tid,
            Message::VoteAck { tid, .. } => *tid,
        }
    }

    /// Encode this message into its on-the-wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::VoteRequest { tid, image, files } => {
                write_u32(&mut buf, TYPE_VOTE_REQUEST);
                write_u32(&mut buf, *tid);
                write_u32(&mut buf, image.len() as u32);
                buf.extend_from_slice(image);
                write_u32(&mut buf, files.len() as u32);
                for f in files {
                    write_str(&mut buf, f);
                }
            }
            Message::VoteOutcome { tid, commit } => {
                write_u32(&mut buf, TYPE_VOTE_OUTCOME);
                write_u32(&mut buf, *tid);
                buf.push(if *commit { 1 } else { 0 });
            }
            Message::VoteResponse { tid, vote } => {
                write_u32(&mut buf, TYPE_VOTE_RESPONSE);
                write_u32(&mut buf, *tid);
                buf.push(if *vote { 1 } else { 0 });
            }
            Message::VoteAck { tid, participant_id } => {
                write_u32(&mut buf, TYPE_VOTE_ACK);
                write_u32(&mut buf, *tid);
                write_str(&mut buf, participant_id);
            }
        }
        buf
    }

    /// Decode a message body. A truncated header, a truncated
    /// length-prefixed field, or a length exceeding the remaining bytes
    /// all produce `Error::MalformedFrame`; the caller drops the frame
    /// and keeps the connection alive.
    pub fn decode(bytes: &[u8]) -> Result<Message, Error> {
        let mut cur = Cursor::new(bytes);
        let mtype = cur.read_u32()?;
        let tid = cur.read_u32()?;
        match mtype {
            TYPE_VOTE_REQUEST => {
                let image_len = cur.read_u32()? as usize;
                let image = cur.read_bytes(image_len)?.to_vec();
                let n_files = cur.read_u32()? as usize;
                let mut files = Vec::with_capacity(n_files);
                for _ in 0..n_files {
                    files.push(cur.read_str()?);
                }
                Ok(Message::VoteRequest { tid, image, files })
            }
            TYPE_VOTE_OUTCOME => {
                let commit = cur.read_bool()?;
                Ok(Message::VoteOutcome { tid, commit })
            }
            TYPE_VOTE_RESPONSE => {
                let vote = cur.read_bool()?;
                Ok(Message::VoteResponse { tid, vote })
            }
            TYPE_VOTE_ACK => {
                let participant_id = cur.read_str()?;
                Ok(Message::VoteAck { tid, participant_id })
            }
            other => Err(Error::MalformedFrame(format!("unknown message type {other}"))),
        }
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    // Encoder-side guard: the spec's two-byte length prefix cannot
    // represent a string longer than u16::MAX, and neither participant
    // ids nor file paths are expected to approach that.
    debug_assert!(bytes.len() <= u16::MAX as usize);
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// A tiny bounds-checked cursor over a byte slice. Every read returns
/// `MalformedFrame` instead of panicking on short input.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::MalformedFrame(format!(
                "need {} bytes at offset {} but only {} remain",
                n,
                self.pos,
                self.bytes.len() - self.pos.min(self.bytes.len())
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bool(&mut self) -> Result<bool, Error> {
        let b = self.read_bytes(1)?;
        Ok(b[0] != 0)
    }

    fn read_str(&mut self) -> Result<String, Error> {
        let len_bytes = self.read_bytes(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::MalformedFrame(format!("invalid UTF-8 in string field: {e}")))
    }
}


