//!
//! participant binary
//! Runs a participant node: binds the TCP transport under the given
//! id/port, replays the WAL to restage any in-flight transaction, then
//! dispatches inbound `VOTE_REQUEST`/`VOTE_OUTCOME` frames, consulting
//! the stdin `askUser` prompt for each vote.
//!
use std::path::PathBuf;
use std::sync::Arc;

use collage_2pc::message::Message;
use collage_2pc::options::ParticipantOptions;
use collage_2pc::participant::{Participant, StdinPrompt};
use collage_2pc::recovery::recover_participant;
use collage_2pc::transport::TcpTransport;
use collage_2pc::wal::Wal;

#[tokio::main]
async fn main() {
    let opts = ParticipantOptions::from_args();
    let dir = PathBuf::from(&opts.dir);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("cannot create working directory {:?}: {e}", dir);
        std::process::exit(1);
    }

    let wal = Arc::new(Wal::open(dir.join("wal.log")).unwrap_or_else(|e| {
        eprintln!("cannot open WAL: {e}");
        std::process::exit(1);
    }));

    let listen_addr = format!("0.0.0.0:{}", opts.port);
    let (transport, mut rx) = TcpTransport::bind(&listen_addr).await.unwrap_or_else(|e| {
        eprintln!("cannot bind {listen_addr}: {e}");
        std::process::exit(1);
    });

    let participant = Participant::new(opts.id.clone(), dir.clone(), wal, Arc::new(transport), Arc::new(StdinPrompt));

    if let Err(e) = recover_participant(&participant, opts.coordinator_addr.as_deref()).await {
        log::error!("recovery failed: {e}");
        std::process::exit(1);
    }
    log::info!("participant {:?} listening on {listen_addr}, working dir {:?}", opts.id, dir);

    ctrlc::set_handler(move || {
        println!("participant shutting down");
        std::process::exit(0);
    })
    .unwrap_or_else(|e| log::warn!("could not install ctrl-c handler: {e}"));

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
                other => log::warn!("participant received a message it never expects: {other:?}"),
            }
        });
    }
}
