// SPDX-License-Identifier: MIT
//! Command-line surface for the `qqgate` binary.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "qqgate",
    about = "OneBot v11 chat-channel gateway bridging a QQ bot connection to an agent runtime",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the gateway config file (overrides layered auto-discovery).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect every configured account, start the dispatch/delivery
    /// pipeline, and run the automation reconciler and proactive nudge
    /// sweeps until interrupted (spec §2 "Data flow").
    Run,

    /// Parse and validate the merged configuration, then exit.
    ///
    /// Checks route shapes, cron expressions, and the `every` schedule's
    /// lower bound without connecting to any account (spec §6, §7).
    Validate,

    /// Print the effective merged configuration as YAML and exit.
    ShowConfig,

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "qqgate", &mut std::io::stdout());
}
