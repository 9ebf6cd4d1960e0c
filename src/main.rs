//! lanshare - share a directory with other machines on the LAN
//!
//! `lanshare server` serves a directory, `lanshare list` and `lanshare get`
//! talk to a running server.

use anyhow::{Context, Result};
use clap::Parser;

use lanshare::cli::{Cli, Commands};
use lanshare::client::Client;
use lanshare::logger;
use lanshare::server;

fn main() -> Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nInterrupted");
        std::process::exit(130);
    })
    .context("Failed to install Ctrl-C handler")?;

    let cli = Cli::parse();
    logger::init(cli.verbosity());

    match &cli.command {
        Commands::Server { .. } => {
            let config = cli.server_config().context("missing server options")?;
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(num_cpus::get())
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            rt.block_on(server::serve(config))
        }
        Commands::List { server_ip } => {
            let client = Client::new(cli.client_config());
            let listing = client
                .list(server_ip)
                .with_context(|| format!("list files on {}", server_ip))?;
            println!("Files available on server {}:", server_ip);
            println!("{}", listing);
            Ok(())
        }
        Commands::Get {
            server_ip,
            filename,
            ..
        } => {
            let client = Client::new(cli.client_config());
            let download = client
                .get(server_ip, filename)
                .with_context(|| format!("download {} from {}", filename, server_ip))?;
            println!(
                "File downloaded successfully: {} ({} bytes)",
                download.path.display(),
                download.bytes
            );
            Ok(())
        }
    }
}
