// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Lace — event-sourced multi-agent coding assistant core.
///
/// With no subcommand, runs one turn: the prompt (argument or stdin) goes
/// to the named agent in the named session, the assistant's reply streams
/// to stdout, and the full exchange is persisted in the thread store.
#[derive(Parser, Debug)]
#[command(name = "lace", version, about)]
pub struct Cli {
    /// Session to create or load
    #[arg(long, short = 's', default_value = "default")]
    pub session: String,

    /// Agent within the session to address
    #[arg(long, short = 'a', default_value = "main")]
    pub agent: String,

    /// Explicit config file (merged over the discovered layers)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Database file override
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The user prompt.  Read from stdin when omitted.
    pub prompt: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List known sessions
    Sessions,
    /// List the tasks of a session
    Tasks {
        /// Session name
        session: String,
    },
    /// List the agents of a session
    Agents {
        /// Session name
        session: String,
        /// Include completed agents
        #[arg(long)]
        all: bool,
    },
}
