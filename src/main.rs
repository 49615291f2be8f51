//! meshconn CLI - multi-transport mesh connectivity.

use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use meshconn::cli::*;
use meshconn::config::{init_logging, Config};
use meshconn::error::{Error, Result};
use meshconn::link::LinkCredentials;
use meshconn::probe::{ProbeEvent, ProberStatus, TransportProber, WebSocketConnector};
use meshconn::protocol::{MeshEndpoints, MeshInvite, MeshToken};
use meshconn::types::{EndpointKind, PeerId, TransportState};
use meshconn::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = load_config(cli.config.as_ref());

    // Initialize logging
    let log_config = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default()
        .with_overrides(cli.log_level.clone(), cli.no_color);
    init_logging(&log_config)?;

    match cli.command {
        Commands::Probe(args) => run_probe(args, config?, cli.format).await,
        Commands::Invite(InviteCommand::Decode(args)) => run_invite_decode(&args, cli.format),
        Commands::Invite(InviteCommand::Encode(args)) => run_invite_encode(args),
        Commands::Config(ConfigCommand::Example(args)) => run_config_example(&args),
        Commands::Config(ConfigCommand::Validate(args)) => {
            run_config_validate(args.path.or(cli.config))
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    if let Some(path) = path {
        Config::load(path)
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())
    } else {
        Ok(Config::default())
    }
}

/// Race the given endpoints and report the winner.
async fn run_probe(args: ProbeArgs, config: Config, format: OutputFormat) -> Result<()> {
    let mut endpoints = MeshEndpoints::new(args.local, args.public, args.relay);
    let mut token = args.token;
    if let Some(ref uri) = args.invite {
        let invite = MeshInvite::parse_uri(uri)?;
        let from_invite = invite.mesh_endpoints();
        endpoints.local = endpoints.local.or(from_invite.local);
        endpoints.public = endpoints.public.or(from_invite.public);
        endpoints.relay = endpoints.relay.or(from_invite.relay);
        token = token.or(Some(invite.token));
    }
    if endpoints.is_empty() {
        return Err(Error::InvalidConfig(
            "no endpoints given; use --local, --public, --relay or --invite".into(),
        ));
    }

    let credentials = match token {
        Some(token) => match MeshToken::decode(&token) {
            Ok(signed) => LinkCredentials::Signed(signed),
            Err(_) => LinkCredentials::Legacy(token),
        },
        None => LinkCredentials::Anonymous,
    };

    let connector = WebSocketConnector::new(config.node.clone(), credentials, config.link.clone());
    let prober = TransportProber::new(
        PeerId::new(args.peer),
        &endpoints,
        connector,
        config.probe.clone(),
    );

    if format == OutputFormat::Text {
        println!("{} meshconn {}", "▶".bright_cyan(), VERSION);
        for (kind, address) in endpoints.to_ordered_list() {
            println!("  {:<8} {}", kind.to_string().bright_white(), address);
        }
        println!();
    }

    let result = prober.probe_all_transports().await;
    print_status(&prober.status(), format)?;

    match result {
        Ok(kind) => {
            if format == OutputFormat::Text {
                println!("{} Connected via {}", "✓".green(), kind.to_string().bright_green());
            }
        }
        Err(e) if !args.watch => return Err(e),
        Err(e) => println!("{} {}", "✗".red(), e),
    }

    if args.watch {
        watch_prober(&prober, format).await;
    }

    prober.disconnect().await;
    Ok(())
}

async fn watch_prober(prober: &TransportProber<WebSocketConnector>, format: OutputFormat) {
    let mut events = prober.subscribe();
    prober.start_reprobe();
    if format == OutputFormat::Text {
        println!(
            "{} Re-probing every {:?}, Ctrl-C to stop",
            "…".dimmed(),
            prober.config().reprobe_interval
        );
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event, format),
                Err(RecvError::Lagged(n)) => eprintln!("{} dropped {n} events", "⚠".yellow()),
                Err(RecvError::Closed) => break,
            },
        }
    }
    prober.stop_reprobe();
}

fn print_status(status: &ProberStatus, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    for (kind, endpoint) in &status.endpoints {
        let state = match endpoint.state {
            TransportState::Connected => endpoint.state.to_string().bright_green(),
            TransportState::Available => endpoint.state.to_string().green(),
            TransportState::Failed => endpoint.state.to_string().red(),
            TransportState::Probing | TransportState::Unknown => endpoint.state.to_string().yellow(),
        };
        let latency = endpoint
            .latency_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms} ms"));
        let marker = if status.active == Some(*kind) { "*" } else { " " };
        print!("{marker} {:<8} {:<10} {:>8}", kind.to_string(), state, latency);
        if let Some(ref error) = endpoint.error {
            print!("  {}", error.dimmed());
        }
        println!();
    }
    Ok(())
}

fn print_event(event: &ProbeEvent, format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", serde_json::json!({ "event": format!("{event:?}") }));
        return;
    }
    match event {
        ProbeEvent::Promoted { kind, previous, latency } => println!(
            "{} promoted {} (was {}, {:?})",
            "⇄".bright_cyan(),
            kind.to_string().bright_green(),
            previous.map_or_else(|| "none".to_string(), |p| p.to_string()),
            latency
        ),
        ProbeEvent::AllFailed { errors, .. } => {
            println!("{} all endpoints failed", "✗".red());
            for (kind, error) in errors {
                println!("    {kind}: {error}");
            }
        }
        ProbeEvent::SessionLost { kind } => println!("{} session on {kind} lost", "⚠".yellow()),
        ProbeEvent::ProbeCompleted {
            kind,
            result: Ok(latency),
            ..
        } => println!("  {} {kind} {latency:?}", "·".dimmed()),
        ProbeEvent::ProbeCompleted {
            kind,
            result: Err(error),
            ..
        } => println!("  {} {kind} {}", "·".dimmed(), error.dimmed()),
        other => println!("  {}", format!("{other:?}").dimmed()),
    }
}

fn run_invite_decode(args: &InviteDecodeArgs, format: OutputFormat) -> Result<()> {
    let invite = MeshInvite::parse_uri(&args.uri)?;
    let endpoints = invite.mesh_endpoints();

    if format == OutputFormat::Json {
        let value = serde_json::json!({
            "invite": invite,
            "endpoints": endpoints,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", "Mesh invite".bright_white().bold());
    println!("{}", "─".repeat(50));
    println!("  {:<12} {}", "Mesh:".bright_white(), invite.mesh_name);
    for kind in [EndpointKind::Local, EndpointKind::Public, EndpointKind::Relay] {
        let address = endpoints.get(kind).unwrap_or("-");
        println!("  {:<12} {}", format!("{kind}:").bright_white(), address);
    }
    if let Some(ref key) = invite.mesh_public_key {
        println!("  {:<12} {}", "Public key:".bright_white(), key);
    }

    match MeshToken::decode(&invite.token) {
        Ok(token) if token.is_expired() => {
            println!("  {:<12} {} ({})", "Token:".bright_white(), "expired".red(), token.mesh_id);
        }
        Ok(token) => println!(
            "  {:<12} {} ({}, {}s left)",
            "Token:".bright_white(),
            "signed".green(),
            token.mesh_id,
            token.remaining_secs()
        ),
        Err(_) => println!("  {:<12} {}", "Token:".bright_white(), "legacy".yellow()),
    }
    Ok(())
}

fn run_invite_encode(args: InviteEncodeArgs) -> Result<()> {
    let invite = MeshInvite {
        token: args.token,
        mesh_name: args.mesh,
        endpoints: args.endpoints,
        mesh_public_key: args.public_key,
    };
    println!("{}", invite.to_uri()?);
    Ok(())
}

fn run_config_example(args: &ConfigExampleArgs) -> Result<()> {
    let config = Config::example();
    let output = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{output}");
    }

    Ok(())
}

fn run_config_validate(path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(Config::default_path);
    Config::load(&path)?;
    println!("{} {} is valid", "✓".green(), path.display());
    Ok(())
}
