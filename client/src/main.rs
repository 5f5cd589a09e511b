use clap::Parser;
use client::{ClientHooks, ClientLink, ClientSession, LinkConfig, LinkEvent};
use log::{info, warn};
use shared::session;
use shared::{MemoryWorld, SmoothingConfig, WorldStore, DEFAULT_PORT};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server host to connect to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Player name presented at login
    #[clap(short, long, default_value = "bot")]
    name: String,

    /// Credentials passed through to the server's login check
    #[clap(short, long, default_value = "")]
    credentials: String,

    /// Game identifier the server must accept
    #[clap(long, default_value = "replication-demo")]
    game_id: String,

    /// Ticks per second
    #[clap(short, long, default_value = "30")]
    tick_rate: u32,

    /// Seconds between status lines
    #[clap(long, default_value = "5")]
    report_every: u64,
}

/// Logs session events; the bot has no game logic of its own.
struct BotHooks;

impl ClientHooks<MemoryWorld> for BotHooks {
    fn logged_in(&mut self, world: &mut MemoryWorld, player_id: u16) {
        info!(
            "Logged in as player {} ({} entities, {} players)",
            player_id,
            world.entity_count(),
            world.player_count()
        );
    }

    fn player_added(&mut self, world: &mut MemoryWorld, player_id: u16) {
        let name = world
            .player(player_id)
            .map(|player| player.name.clone())
            .unwrap_or_default();
        info!("Player {} ({}) joined", player_id, name);
    }

    fn player_removed(&mut self, _world: &mut MemoryWorld, player_id: u16) {
        info!("Player {} left", player_id);
    }

    fn disconnected(&mut self, reason: &str) {
        warn!("Server closed the session: {}", reason);
    }
}

/// Reasons a retry with the same login cannot fix.
fn refused(reason: Option<&str>) -> bool {
    matches!(
        reason,
        Some(session::REASON_BAD_GAME | session::REASON_BAD_VERSION | session::REASON_LOGIN_FAILED)
    )
}

/// Walks every owned entity around a circle.
fn steer(world: &mut MemoryWorld, player_id: u16, elapsed: f32) {
    let (sin, cos) = (elapsed * 0.5).sin_cos();
    for id in world.entities_owned_by(player_id) {
        let Some(mut state) = world.entity(id).copied() else {
            continue;
        };
        state.position = [cos as f64 * 20.0, state.position[1], sin as f64 * 20.0];
        state.motion = [-sin * 10.0, 0.0, cos * 10.0];
        world.apply_entity(id, state);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = LinkConfig {
        game_id: args.game_id,
        ..LinkConfig::default()
    };

    info!("Connecting to {}:{} as {}", args.host, args.port, args.name);
    let mut link = ClientLink::new(config);
    link.connect(&args.host, args.port, &args.name, &args.credentials)
        .await?;

    let mut session = ClientSession::new(MemoryWorld::new(), SmoothingConfig::default());
    let mut hooks = BotHooks;
    let started = Instant::now();
    let report_every = Duration::from_secs(args.report_every.max(1));
    let mut last_report = Instant::now();
    let mut interval =
        tokio::time::interval(Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                link.disconnect_nice("client exiting").await;
                break;
            }
        }

        match link.maintain().await {
            LinkEvent::Reconnected => info!("Reconnected"),
            LinkEvent::TimedOut => warn!("Connection timed out"),
            _ => {}
        }

        session.process(&mut link, &mut hooks).await;

        if !link.is_connected() {
            if link.reconnect_at().is_none() && refused(session.last_disconnect_reason()) {
                break;
            }
            if link.reconnect_at().is_none() && !link.schedule_backoff() {
                warn!("Giving up on {}:{}", args.host, args.port);
                break;
            }
            continue;
        }

        let player_id = link.player_id();
        if player_id != 0 {
            steer(
                session.world_mut(),
                player_id,
                started.elapsed().as_secs_f32(),
            );
            if let Err(e) = session.send_owned_updates(&mut link).await {
                warn!("Update failed: {}", e);
            }
        }

        if last_report.elapsed() >= report_every {
            last_report = Instant::now();
            info!(
                "player {} | {:?} | {} entities | ping {:.1} ms avg | {} B in / {} B out",
                player_id,
                session.state(),
                session.world().entity_count(),
                link.latency().average(),
                link.bytes_in(),
                link.bytes_out()
            );
        }
    }

    Ok(())
}
