//! `luna`: the ponycloud storage agent.

use std::process::ExitCode;

use pony_daemon::cli::{self, Program};

#[tokio::main]
async fn main() -> ExitCode {
    cli::run(Program::Luna).await
}
