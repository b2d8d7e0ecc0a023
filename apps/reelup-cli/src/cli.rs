use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reelup_protocol::TaskStatus;

#[derive(Parser)]
#[command(author, version, about = "Resumable chunked video uploads", long_about = None)]
pub struct Cli {
    /// Config file (defaults to <config dir>/reelup/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that take precedence over the config file.
#[derive(Args, Default)]
pub struct Overrides {
    /// Upload server base URL
    #[arg(long, global = true)]
    pub server: Option<String>,
    /// Bearer token for the upload server
    #[arg(long, global = true)]
    pub token: Option<String>,
    /// Task store directory
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    /// Chunks in flight per task
    #[arg(long, global = true)]
    pub parallel: Option<usize>,
    /// Send chunks from the main runtime instead of the background worker
    #[arg(long, global = true)]
    pub foreground: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload a file
    Upload {
        file: PathBuf,
        /// Title sent with finalize (defaults to the file name)
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Extra metadata as key=value, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },
    /// Resume every unfinished upload whose file is still on disk
    Resume,
    /// List persisted uploads
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Show one upload in detail
    Show { id: String },
    /// Delete an upload's persisted state
    Purge { id: String },
}
