//! Headless live journey player.
//!
//! Plays one live journey against the configured server, logging join/leave
//! events and the eased statistics as they change.
//!
//! ```bash
//! JOURNEY_API_URL=http://localhost:8084 \
//!   cargo run -p journey -- --uid <uid> --jwt <jwt> --duration 60
//! ```
//!
//! Set `RUST_LOG=journey_core=debug` for the engine's own logging.

mod args;

use journey_core::{LiveSession, LiveSessionConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let argv: Vec<String> = std::env::args().collect();
    if argv.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    let player = match args::parse_args(&argv) {
        Ok(player) => player,
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    let client = journey_api::Client::from_env()?;
    info!(server = client.base_url(), journey = %player.journey.uid, "connecting");

    let config = LiveSessionConfig::new(player.journey)
        .with_start_at(player.start_at_ms)
        .with_profile_pictures(player.profile_pictures);
    let session = LiveSession::start(config, Arc::new(client));

    let stats = session.stats();
    let _stats_log = {
        let stats = stats.clone();
        session.stats().subscribe(move || {
            stats.with(|bucket| {
                info!(users = bucket.users, likes = bucket.likes, "stats");
            });
        })
    };
    let join_leave = session.join_leave();
    let _join_leave_log = {
        let join_leave = join_leave.clone();
        session.join_leave().subscribe(move || {
            let flags = join_leave.get();
            info!(joined = flags.joined, left = flags.left, "join/leave");
        })
    };
    let status = session.sync_status();
    let _status_log = {
        let status = status.clone();
        session.sync_status().subscribe(move || info!(status = ?status.get(), "stats sync"))
    };

    tokio::select! {
        result = session.finished() => match result {
            Ok(()) => info!("journey finished"),
            Err(_) => warn!("session stopped before the journey ended"),
        },
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("failed to listen for ctrl-c: {}", err);
            }
            info!("interrupted, leaving journey");
            session.unload();
        }
    }

    session.stop();
    // Give the keep-alive leave a moment to reach the server.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}

fn print_help() {
    println!("journey - headless live journey player");
    println!();
    println!("USAGE:");
    println!("  journey --uid <UID> --jwt <JWT> --duration <SECONDS> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help          Show this help message");
    println!("  --session <UID>     Session uid for join/leave events (default: random)");
    println!("  --start-at <MS>     Journey time to start at; negative for a pre-roll (default: 0)");
    println!("  --no-pictures       Do not fetch profile pictures");
    println!();
    println!("ENVIRONMENT:");
    println!("  JOURNEY_API_URL     Server root (default: http://localhost:8084)");
    println!("  JOURNEY_API_TOKEN   Bearer token for authenticated requests");
    println!("  RUST_LOG            Log filter (default: info)");
}
