//! Command-line interface for meshconn.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// meshconn - multi-transport mesh connectivity
#[derive(Parser, Debug)]
#[command(
    name = "meshconn",
    author,
    version,
    about = "Multi-transport resilient mesh connectivity",
    long_about = r#"
meshconn races a mesh peer's endpoints, keeps the fastest one connected
and inspects invite links.

QUICK START:
  Probe:   meshconn probe --local http://192.168.1.10:8080 --relay wss://relay.example.com/relay/home
  Invite:  meshconn invite decode 'meshconn://join/eyJ0b2tlbiI6...'
  Config:  meshconn config example > meshconn.toml
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Race a peer's endpoints and connect to the fastest
    Probe(ProbeArgs),

    /// Encode or decode invite links
    #[command(subcommand)]
    Invite(InviteCommand),

    /// Show or check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Probe command arguments
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Local network endpoint
    #[arg(long)]
    pub local: Option<String>,

    /// Public endpoint
    #[arg(long)]
    pub public: Option<String>,

    /// Relay endpoint
    #[arg(long)]
    pub relay: Option<String>,

    /// Invite link; its endpoints are added to the explicit ones
    #[arg(long)]
    pub invite: Option<String>,

    /// Legacy join token
    #[arg(short, long)]
    pub token: Option<String>,

    /// Peer identifier used in logs and status
    #[arg(long, default_value = "peer")]
    pub peer: String,

    /// Keep re-probing and print events until interrupted
    #[arg(short, long)]
    pub watch: bool,
}

/// Invite subcommands
#[derive(Subcommand, Debug)]
pub enum InviteCommand {
    /// Print the contents of an invite
    Decode(InviteDecodeArgs),

    /// Build an invite link
    Encode(InviteEncodeArgs),
}

/// Invite decode arguments
#[derive(Args, Debug)]
pub struct InviteDecodeArgs {
    /// Invite URI, bare blob, or legacy query link
    pub uri: String,
}

/// Invite encode arguments
#[derive(Args, Debug)]
pub struct InviteEncodeArgs {
    /// Join token
    #[arg(short, long)]
    pub token: String,

    /// Mesh name
    #[arg(short, long)]
    pub mesh: String,

    /// Endpoint address (can be specified multiple times)
    #[arg(short, long = "endpoint")]
    pub endpoints: Vec<String>,

    /// Mesh public key
    #[arg(long)]
    pub public_key: Option<String>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print an example configuration
    Example(ConfigExampleArgs),

    /// Check a configuration file
    Validate(ConfigValidateArgs),
}

/// Config example arguments
#[derive(Args, Debug)]
pub struct ConfigExampleArgs {
    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Config validate arguments
#[derive(Args, Debug)]
pub struct ConfigValidateArgs {
    /// File to validate (defaults to the global --config or the default path)
    pub path: Option<PathBuf>,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_probe() {
        let cli = Cli::parse_from([
            "meshconn",
            "probe",
            "--local",
            "http://10.0.0.2:8080",
            "--relay",
            "wss://r.example.com/relay",
            "--watch",
        ]);
        assert!(cli.log_level.is_none());
        match cli.command {
            Commands::Probe(args) => {
                assert_eq!(args.local.as_deref(), Some("http://10.0.0.2:8080"));
                assert!(args.public.is_none());
                assert!(args.watch);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_invite_encode() {
        let cli = Cli::parse_from([
            "meshconn", "invite", "encode", "-t", "tok", "-m", "home", "-e", "ws://a", "-e", "ws://b",
        ]);
        match cli.command {
            Commands::Invite(InviteCommand::Encode(args)) => {
                assert_eq!(args.endpoints, vec!["ws://a", "ws://b"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_log_level_flag_is_optional_override() {
        let cli = Cli::parse_from(["meshconn", "-l", "debug", "config", "example"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
