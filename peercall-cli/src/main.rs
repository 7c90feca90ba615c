//! peercall CLI application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local user name (random if omitted)
    #[arg(short, long, env = "PEERCALL_IDENTITY")]
    identity: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// STUN server, repeatable (overrides the config file)
    #[arg(long, env = "PEERCALL_STUN", value_delimiter = ',')]
    stun: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between two in-process peers
    Demo {
        /// Video call instead of audio-only
        #[arg(long)]
        video: bool,

        /// Have the callee decline
        #[arg(long)]
        decline: bool,

        /// Share the screen once connected
        #[arg(long)]
        share_screen: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "3")]
        duration: u64,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Show status and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peercall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.stun)?;

    match cli.command {
        Commands::Demo {
            video,
            decline,
            share_screen,
            duration,
        } => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            let call_type = if video { CallType::Video } else { CallType::Audio };
            handle_demo(
                config,
                &identity,
                call_type,
                decline,
                share_screen,
                Duration::from_secs(duration),
            )
            .await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Status => {
            handle_status(&config);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>, stun: &[String]) -> Result<CallConfig> {
    let config = match path {
        Some(path) => CallConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CallConfig::default(),
    };
    let config = if stun.is_empty() {
        config
    } else {
        config.with_stun_servers(stun.iter().cloned())
    };
    config.validate()?;
    Ok(config)
}

async fn handle_demo(
    config: CallConfig,
    identity: &str,
    call_type: CallType,
    decline: bool,
    share_screen: bool,
    duration: Duration,
) -> Result<()> {
    let callee = format!("{}-peer", identity);
    println!("📞 {} calls {} ({:?})", identity, callee, call_type);

    let hub = SignalingHub::new();
    let caller = CallClient::builder(identity, Arc::new(hub.port(identity)))
        .with_config(config.clone())
        .build()
        .await?;
    let answerer = CallClient::builder(callee.as_str(), Arc::new(hub.port(callee.as_str())))
        .with_config(config)
        .build()
        .await?;

    let mut caller_events = caller.subscribe_events();
    let mut answerer_events = answerer.subscribe_events();

    let session_id = caller.call(vec![UserId::new(&callee)], call_type).await?;
    println!("🔔 Ringing, session {}", session_id);

    wait_for(&mut answerer_events, |e| matches!(e, CallEvent::IncomingCall { .. })).await?;
    if decline {
        answerer.decline().await?;
        println!("❌ {} declined", callee);
        let state = wait_for_terminal(&mut caller_events).await?;
        println!("📴 Caller finished in state {}", state);
        answerer.shutdown().await;
        caller.shutdown().await;
        return Ok(());
    }

    answerer.accept().await?;
    println!("✅ {} accepted", callee);

    let connected = tokio::time::timeout(
        Duration::from_secs(15),
        wait_for(&mut caller_events, |e| {
            matches!(
                e,
                CallEvent::StateChanged {
                    new_state: CallState::Active | CallState::Failed,
                    ..
                }
            )
        }),
    )
    .await;

    match connected {
        Ok(Ok(CallEvent::StateChanged {
            new_state: CallState::Active,
            ..
        })) => println!("🟢 Connected"),
        Ok(Ok(_)) => println!("🔴 Connection failed"),
        Ok(Err(e)) => return Err(e),
        Err(_) => println!("⏱️  No connectivity within 15s"),
    }

    if share_screen && caller.snapshot().state == CallState::Active {
        match caller.start_screen_share().await {
            Ok(track) => println!("🖥️  Sharing screen ({})", track.id()),
            Err(e) => println!("⚠️  Screen share unavailable: {}", e),
        }
    }

    if caller.snapshot().state == CallState::Active {
        let muted = !caller.toggle_audio(None).await?;
        println!("🎙️  Caller microphone muted: {}", muted);
        tokio::time::sleep(duration).await;
        if let Some(elapsed) = caller.snapshot().duration() {
            println!("⏲️  Call lasted {}s", elapsed.num_seconds());
        }
        match caller.stats().await {
            Ok(stats) => println!(
                "📊 Sent {} bytes in {} packets, received {} bytes in {} packets",
                stats.bytes_sent, stats.packets_sent, stats.bytes_received, stats.packets_received
            ),
            Err(e) => tracing::warn!(error = %e, "Connection stats unavailable"),
        }
    }

    caller.hangup().await?;
    let state = wait_for_terminal(&mut answerer_events).await?;
    println!("📴 Call ended ({} finished in state {})", callee, state);

    answerer.shutdown().await;
    caller.shutdown().await;
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    matches: impl Fn(&CallEvent) -> bool,
) -> Result<CallEvent> {
    loop {
        match events.recv().await {
            Ok(event) if matches(&event) => return Ok(event),
            Ok(other) => tracing::debug!(event = ?other, "Call event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("Event stream closed");
            }
        }
    }
}

async fn wait_for_terminal(events: &mut broadcast::Receiver<CallEvent>) -> Result<CallState> {
    let event = wait_for(events, |e| {
        matches!(e, CallEvent::StateChanged { new_state, .. } if new_state.is_terminal())
    })
    .await?;
    match event {
        CallEvent::StateChanged { new_state, .. } => Ok(new_state),
        _ => anyhow::bail!("Unexpected event"),
    }
}

fn handle_status(config: &CallConfig) {
    println!("📊 peercall status");
    println!("==================");
    println!("✅ Peer transport: webrtc");
    println!("✅ Media: synthetic devices");
    println!("⚠️  Signaling: in-process hub only");
    println!(
        "   ICE servers: {}",
        config
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("   Ring timeout: {}s", config.ring_timeout_secs);
    println!();
    println!("Available commands:");
    println!("  peercall demo [options]  - Run a call between two local peers");
    println!("  peercall config          - Print the effective configuration");
    println!("  peercall status          - Show this status");
    println!();
    println!("Use 'peercall --help' for detailed options");
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo",
    ];

    let mut rng = rand::thread_rng();
    let words: Vec<&str> = WORDS.choose_multiple(&mut rng, 2).copied().collect();
    words.join("-")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_random_identity_has_two_words() {
        let identity = generate_random_identity();
        assert_eq!(identity.split('-').count(), 2);
    }

    #[test]
    fn test_stun_override() {
        let config = load_config(None, &["stun.example.org:3478".to_string()]).unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls[0], "stun:stun.example.org:3478");
    }

    #[test]
    fn test_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ring_timeout_secs": 12}}"#).unwrap();
        let config = load_config(Some(file.path()), &[]).unwrap();
        assert_eq!(config.ring_timeout_secs, 12);
    }

    #[test]
    fn test_cli_parses_demo() {
        let cli = Cli::try_parse_from(["peercall", "--stun", "a,b", "demo", "--video", "--decline"])
            .unwrap();
        assert_eq!(cli.stun, vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(
            cli.command,
            Commands::Demo {
                video: true,
                decline: true,
                ..
            }
        ));
    }
}
