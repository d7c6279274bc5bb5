//! `sparkle`: the ponycloud hub daemon.

use std::process::ExitCode;

use pony_daemon::cli::{self, Program};

#[tokio::main]
async fn main() -> ExitCode {
    cli::run(Program::Sparkle).await
}
