//! Command-line interface

use clap::{ArgAction, Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::{ClientConfig, ServerConfig, DEFAULT_BACKLOG, DEFAULT_MAX_CONNECTIONS};
use crate::protocol::DEFAULT_PORT;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "lanshare",
    author,
    version,
    about = "Share a directory with other machines on the local network"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TCP port of the file service
    #[arg(long, global = true, env = "LANSHARE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    /// Serve the files in DIRECTORY
    Server {
        /// Directory to share
        #[arg(default_value = ".")]
        directory: PathBuf,

        /// Local address to listen on (chosen automatically if omitted)
        bind_ip: Option<Ipv4Addr>,

        /// Connections served at the same time
        #[arg(long, env = "LANSHARE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
        max_connections: usize,

        /// Listen backlog
        #[arg(long, default_value_t = DEFAULT_BACKLOG)]
        backlog: u32,

        /// Append one line per request to this file
        #[arg(long, env = "LANSHARE_ACCESS_LOG")]
        access_log: Option<PathBuf>,
    },

    /// List the files a server shares
    List {
        /// Server IPv4 address
        server_ip: String,
    },

    /// Download a file into the current directory
    Get {
        /// Server IPv4 address
        server_ip: String,

        /// Name of the file on the server
        filename: String,

        /// Save into this directory instead
        #[arg(long, short = 'o', env = "LANSHARE_OUTPUT_DIR", default_value = ".")]
        output_dir: PathBuf,
    },
}

impl Cli {
    /// Logging verbosity: -1 quiet, 0 default, 1+ more detail
    pub fn verbosity(&self) -> i8 {
        if self.quiet {
            -1
        } else {
            self.verbose.min(i8::MAX as u8) as i8
        }
    }

    pub fn server_config(&self) -> Option<ServerConfig> {
        match &self.command {
            Commands::Server {
                directory,
                bind_ip,
                max_connections,
                backlog,
                access_log,
            } => Some(
                ServerConfig::new(directory)
                    .bind_ip(*bind_ip)
                    .port(self.port)
                    .backlog(*backlog)
                    .max_connections(*max_connections)
                    .access_log(access_log.clone()),
            ),
            _ => None,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::default().port(self.port).show_progress(!self.quiet);
        match &self.command {
            Commands::Get { output_dir, .. } => config.download_dir(output_dir),
            _ => config,
        }
    }
}
