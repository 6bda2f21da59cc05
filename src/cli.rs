//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// HTTP forwarding cache - replays stored answers, forwards the rest
#[derive(Parser, Debug)]
#[command(name = "http-cache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "HTTP_CACHE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "HTTP_CACHE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "HTTP_CACHE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "HTTP_CACHE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "HTTP_CACHE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Do not start the queue workers even if configured
    #[arg(long)]
    pub no_queue: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the cache server (default)
    Serve,

    /// Print the cache key derived for a JSON-encoded request
    Key {
        /// Path to the request JSON (`-` for stdin)
        #[arg(required = true)]
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_key_subcommand() {
        let cli = Cli::parse_from(["http-cache", "key", "request.json"]);
        assert!(matches!(
            cli.command,
            Some(Command::Key { ref file }) if file == &PathBuf::from("request.json")
        ));
    }

    #[test]
    fn parses_server_overrides() {
        let cli = Cli::parse_from(["http-cache", "--port", "9000", "--no-queue", "serve"]);
        assert_eq!(cli.port, Some(9000));
        assert!(cli.no_queue);
        assert!(matches!(cli.command, Some(Command::Serve)));
    }
}
