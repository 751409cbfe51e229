//! feedsync-transform: evaluates one transform script in its own process.
//!
//! Reads a JSON request on stdin and writes the JSON reply to stdout. The
//! parent caps this process's address space, so an allocation past the cap
//! aborts here and is reported upstream as a resource-limit failure.

use std::process::ExitCode;

fn main() -> ExitCode {
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    match feedsync_engine::transform::serve_worker(stdin, stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("feedsync-transform: {e}");
            ExitCode::FAILURE
        }
    }
}
