use clap::{Parser, Subcommand, ValueEnum};

pub mod commands;
pub mod output;

#[derive(Parser)]
#[command(
    name = "impfix",
    version,
    about = "Find undefined names in Python files and suggest the imports that fix them"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Index directory (default: .impfix in the current directory)
    #[arg(long, global = true)]
    pub index_dir: Option<String>,

    /// Skip the index refresh before answering
    #[arg(long, global = true)]
    pub no_update: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index a directory tree (create/update .impfix)
    Index {
        /// Directory to index (default: current directory)
        #[arg(default_value = ".")]
        path: String,
    },

    /// Rescan every indexed tree for changed files
    Update,

    /// Report names a file uses but never defines or imports, with
    /// import suggestions for each
    Check {
        /// Python file to analyze
        file: String,
    },

    /// Look up where a symbol can be imported from
    Find {
        /// Symbol name to search for
        symbol: String,
    },

    /// Complete a symbol prefix against the index
    Complete {
        /// Prefix to complete
        prefix: String,
    },
}

#[derive(Clone, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Compact,
}
