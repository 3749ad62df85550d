// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "otto",
    about = "Autonomous agent runtime: concurrent sessions driving a model-tool loop over MCP",
    version
)]
pub struct Cli {
    /// Explicit config file (highest-priority layer).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (OTTO_LOG overrides).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP API server (the default when no subcommand is given).
    Serve {
        /// Bind address override.
        #[arg(long)]
        host: Option<String>,
        /// Port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective merged configuration as YAML.
    ShowConfig,
    /// List the registered model providers.
    ListProviders {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// List sessions persisted under the data root.
    Sessions {
        /// Source filter: memory, file, or all.
        #[arg(long, default_value = "file")]
        source: String,
    },
}
