use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use impfix::cli::commands;
use impfix::cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let index_dir = commands::index_dir(cli.index_dir.as_deref());

    match cli.command {
        Commands::Index { ref path } => {
            let output = commands::run_index(path, &index_dir, &cli.format)?;
            println!("{}", output);
        }

        Commands::Update => {
            let output = commands::run_update(&index_dir, &cli.format)?;
            println!("{}", output);
        }

        Commands::Check { ref file } => {
            let (output, has_missing) =
                commands::run_check(file, &index_dir, cli.no_update, &cli.format)?;
            println!("{}", output);
            if has_missing {
                std::process::exit(1);
            }
        }

        Commands::Find { ref symbol } => {
            let output = commands::run_find(symbol, &index_dir, &cli.format)?;
            println!("{}", output);
        }

        Commands::Complete { ref prefix } => {
            let output = commands::run_complete(prefix, &index_dir, &cli.format)?;
            println!("{}", output);
        }
    }

    Ok(())
}
