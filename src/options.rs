//!
//! options.rs
//! Command-line option parsing and logging bootstrap for the coordinator
//! and participant binaries, following the shape of the teacher project's
//! `tpcoptions.rs`: a `clap` builder-API parser that feeds `log` /
//! `stderrlog` initialization, generalized from the teacher's single
//! combined `-m run|client|participant|check` flag to two positional-arg
//! CLIs matching the external interface of the protocol itself.
//!
extern crate clap;
extern crate log;
extern crate stderrlog;

use clap::{App, Arg};

/// Options for the `coordinator` binary: CLI positional `<port>` per the
/// spec's external interface, plus a working-directory and verbosity
/// knob every node needs regardless of protocol role.
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    pub port: u16,
    pub dir: String,
    pub verbosity: usize,
}

/// Options for the `participant` binary: CLI positionals `<port> <id>`.
/// `coordinator_addr` is not part of the distilled spec's CLI surface --
/// it exists because a recovering participant must know where to resend
/// a staged vote, and the spec names the coordinator as "a single, fixed
/// identity" but never says how a participant learns its address outside
/// of an inbound message. See DESIGN.md.
#[derive(Clone, Debug)]
pub struct ParticipantOptions {
    pub port: u16,
    pub id: String,
    pub dir: String,
    pub coordinator_addr: Option<String>,
    pub verbosity: usize,
}

fn init_logging(verbosity: usize) {
    stderrlog::new()
        .module(module_path!())
        .verbosity(verbosity)
        .init()
        .unwrap_or_else(|e| eprintln!("logging already initialized: {e}"));
}

impl CoordinatorOptions {
    /// Parse argv for the coordinator binary. Per §6, an arg-count
    /// mismatch exits non-zero -- `clap` does this itself for a missing
    /// required positional, matching the teacher's `panic!`-on-misuse
    /// style for CLI bootstrap errors.
    pub fn from_args() -> CoordinatorOptions {
        let matches = App::new("collage-coordinator")
            .version("0.1.0")
            .author("Rust Student <student@cs.utexas.edu>")
            .about("Coordinator node for the collage two-phase-commit protocol")
            .arg(Arg::with_name("port").required(true).index(1).help("Port to listen on"))
            .arg(
                Arg::with_name("dir")
                    .short("d")
                    .long("dir")
                    .takes_value(true)
                    .help("Working directory for wal.log and image blobs"),
            )
            .arg(
                Arg::with_name("verbosity")
                    .short("v")
                    .multiple(true)
                    .help("Output verbosity: repeat for more (-v, -vv, -vvv)"),
            )
            .get_matches();

        let port: u16 = matches
            .value_of("port")
            .unwrap()
            .parse()
            .unwrap_or_else(|e| panic!("invalid port: {e}"));
        let dir = shellexpand::tilde(matches.value_of("dir").unwrap_or(".")).into_owned();
        let verbosity = matches.occurrences_of("verbosity") as usize;
        init_logging(verbosity);
        CoordinatorOptions { port, dir, verbosity }
    }
}

impl ParticipantOptions {
    pub fn from_args() -> ParticipantOptions {
        let matches = App::new("collage-participant")
            .version("0.1.0")
            .author("Rust Student <student@cs.utexas.edu>")
            .about("Participant node for the collage two-phase-commit protocol")
            .arg(Arg::with_name("port").required(true).index(1).help("Port to listen on"))
            .arg(Arg::with_name("id").required(true).index(2).help("This participant's stable address/id"))
            .arg(
                Arg::with_name("dir")
                    .short("d")
                    .long("dir")
                    .takes_value(true)
                    .help("Working directory for wal.log and owned files"),
            )
            .arg(
                Arg::with_name("coordinator")
                    .long("coordinator")
                    .takes_value(true)
                    .help("Coordinator address, used to resend a staged vote on crash recovery"),
            )
            .arg(
                Arg::with_name("verbosity")
                    .short("v")
                    .multiple(true)
                    .help("Output verbosity: repeat for more (-v, -vv, -vvv)"),
            )
            .get_matches();

        let port: u16 = matches
            .value_of("port")
            .unwrap()
            .parse()
            .unwrap_or_else(|e| panic!("invalid port: {e}"));
        let id = matches.value_of("id").unwrap().to_string();
        let dir = shellexpand::tilde(matches.value_of("dir").unwrap_or(".")).into_owned();
        let coordinator_addr = matches.value_of("coordinator").map(|s| s.to_string());
        let verbosity = matches.occurrences_of("verbosity") as usize;
        init_logging(verbosity);
        ParticipantOptions { port, id, dir, coordinator_addr, verbosity }
    }
}
