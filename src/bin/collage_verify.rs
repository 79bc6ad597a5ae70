//!
//! collage-verify binary
//! Generalizes the teacher project's `checker.rs`/`check_last_run` into
//! a standalone tool: replays a coordinator's working directory plus
//! each named participant's working directory and reports pass/fail for
//! the testable properties of §8.
//!
//! Usage: collage-verify <coordinator-dir> <participant-id>=<participant-dir> [...]
//!
use std::path::PathBuf;

use collage_2pc::verify::verify;

extern crate clap;
extern crate stderrlog;
use clap::{App, Arg};

fn main() {
    stderrlog::new().module(module_path!()).verbosity(1).init().ok();

    let matches = App::new("collage-verify")
        .version("0.1.0")
        .author("Rust Student <student@cs.utexas.edu>")
        .about("Checks a completed (or crashed) collage-2pc run's on-disk state against its invariants")
        .arg(Arg::with_name("coordinator_dir").required(true).index(1).help("Coordinator working directory"))
        .arg(
            Arg::with_name("participant")
                .multiple(true)
                .required(true)
                .index(2)
                .help("One or more <id>=<dir> participant working directories"),
        )
        .get_matches();

    let coordinator_dir = PathBuf::from(matches.value_of("coordinator_dir").unwrap());
    let mut participant_dirs = Vec::new();
    for entry in matches.values_of("participant").unwrap() {
        match entry.split_once('=') {
            Some((id, dir)) => participant_dirs.push((id.to_string(), PathBuf::from(dir))),
            None => {
                eprintln!("malformed participant arg {entry:?}, expected <id>=<dir>");
                std::process::exit(2);
            }
        }
    }

    let report = match verify(&coordinator_dir, &participant_dirs) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("verification could not run: {e}");
            std::process::exit(2);
        }
    };

    for check in &report.checks {
        println!("[{}] {} -- {}", if check.passed { "PASS" } else { "FAIL" }, check.name, check.detail);
    }

    if report.all_passed() {
        println!("all invariants held");
    } else {
        std::process::exit(1);
    }
}
