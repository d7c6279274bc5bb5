//! `twilight`: the ponycloud host agent.

use std::process::ExitCode;

use pony_daemon::cli::{self, Program};

#[tokio::main]
async fn main() -> ExitCode {
    cli::run(Program::Twilight).await
}
