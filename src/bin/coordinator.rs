//!
//! coordinator binary
//! Runs the coordinator node: binds the TCP transport, replays the WAL
//! to resume any in-flight transactions, then drives `startCommit` calls
//! read as lines on stdin -- the artifact-building process that decides
//! *what* collage to commit is an injected capability out of scope for
//! this crate (§1), so the binary's own control plane is the simplest
//! thing that can exercise it end to end: `commit <dest> <image-file>
//! <addr>:<path> [<addr>:<path> ...]`.
//!
use std::path::PathBuf;
use std::sync::Arc;

use collage_2pc::coordinator::Coordinator;
use collage_2pc::options::CoordinatorOptions;
use collage_2pc::recovery::recover_coordinator;
use collage_2pc::transport::TcpTransport;
use collage_2pc::wal::Wal;

#[tokio::main]
async fn main() {
    let opts = CoordinatorOptions::from_args();
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

    let coordinator = Coordinator::new(dir.clone(), wal, Arc::new(transport));

    if let Err(e) = recover_coordinator(&coordinator).await {
        log::error!("recovery failed: {e}");
        std::process::exit(1);
    }
    log::info!("coordinator listening on {listen_addr}, working dir {:?}", dir);

    {
        let coordinator = Arc::clone(&coordinator);
        ctrlc::set_handler(move || {
            let (committed, aborted, leaked) = coordinator.status.snapshot();
            println!("coordinator shutting down: committed={committed} aborted={aborted} leaked={leaked}");
            std::process::exit(0);
        })
        .unwrap_or_else(|e| log::warn!("could not install ctrl-c handler: {e}"));
    }

    let dispatch = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                coordinator.handle_inbound(inbound).await;
            }
        })
    };

    let control = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { run_control_plane(coordinator).await })
    };

    let _ = tokio::join!(dispatch, control);
}

/// `startCommit(filename, image, sources)` driven from stdin lines of the
/// form `commit <dest> <image-file> <addr:path> [addr:path ...]`.
async fn run_control_plane(coordinator: Arc<Coordinator>) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => return, // stdin closed
            Err(e) => {
                log::warn!("stdin read error: {e}");
                return;
            }
        };
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("commit") => {
                let Some(dest) = parts.next() else {
                    eprintln!("usage: commit <dest> <image-file> <addr:path> [addr:path ...]");
                    continue;
                };
                let Some(image_path) = parts.next() else {
                    eprintln!("usage: commit <dest> <image-file> <addr:path> [addr:path ...]");
                    continue;
                };
                let sources: Vec<String> = parts.map(|s| s.to_string()).collect();
                if sources.is_empty() {
                    eprintln!("at least one <addr:path> source is required");
                    continue;
                }
                let image = match std::fs::read(image_path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        eprintln!("cannot read image {image_path}: {e}");
                        continue;
                    }
                };
                let tid = coordinator.start_commit(dest.to_string(), image, sources).await;
                println!("started tid {tid}");
            }
            Some("status") => {
                let (committed, aborted, leaked) = coordinator.status.snapshot();
                println!("committed={committed} aborted={aborted} leaked={leaked}");
            }
            Some(other) => eprintln!("unknown command {other:?}; expected 'commit' or 'status'"),
            None => {}
        }
    }
}
