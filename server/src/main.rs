use clap::Parser;
use log::info;
use rand::Rng;
use server::hooks::ServerHooks;
use server::network::{Server, ServerConfig};
use shared::codec::Precision;
use shared::{EntityState, MemoryWorld, WorldStore, DEFAULT_PORT};
use std::collections::HashMap;
use std::time::Duration;

const DRONE_KIND: u16 = 1;
const AVATAR_KIND: u16 = 2;

/// Gives every player an avatar entity it is allowed to move.
#[derive(Default)]
struct DemoHooks {
    avatars: HashMap<u16, u32>,
}

impl ServerHooks<MemoryWorld> for DemoHooks {
    fn player_joined(&mut self, world: &mut MemoryWorld, player_id: u16) {
        let mut state = EntityState::at([0.0, 0.0, 0.0]);
        state.owner = player_id;
        if let Some(id) = world.spawn(AVATAR_KIND, "avatar", state) {
            info!("Spawned avatar {} for player {}", id, player_id);
            self.avatars.insert(player_id, id);
        }
    }

    fn player_left(&mut self, world: &mut MemoryWorld, player_id: u16) {
        if let Some(id) = self.avatars.remove(&player_id) {
            world.despawn(id);
        }
    }
}

fn spawn_drones(world: &mut MemoryWorld, count: usize) {
    let mut rng = rand::thread_rng();
    for _ in 0..count {
        let mut state = EntityState::at([
            rng.gen_range(-500.0..500.0),
            rng.gen_range(0.0..100.0),
            rng.gen_range(-500.0..500.0),
        ]);
        state.motion = [
            rng.gen_range(-5.0..5.0),
            0.0,
            rng.gen_range(-5.0..5.0),
        ];
        world.spawn(DRONE_KIND, "drone", state);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[clap(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Game identifier clients must present
        #[clap(long, default_value = "replication-demo")]
        game_id: String,
        /// Ticks per second
        #[clap(short, long, default_value = "50")]
        tick_rate: u32,
        /// Base update rate per client (updates per second)
        #[clap(short, long, default_value = "20")]
        update_rate: u32,
        /// Update precision, -1 for automatic
        #[clap(long, default_value = "-1", allow_hyphen_values = true)]
        precision: i8,
        /// Number of server-owned drifting entities
        #[clap(short, long, default_value = "16")]
        entities: usize,
        /// Maximum concurrent clients
        #[clap(short, long, default_value = "32")]
        max_clients: usize,
        /// Seconds a dropped player is kept for a resync
        #[clap(short, long, default_value = "10")]
        grace: u64,
    }

    let args = Args::parse();

    let precision = if args.precision < 0 {
        Precision::AUTO
    } else {
        Precision::from_wire(args.precision)
    };
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        game_id: args.game_id,
        max_clients: args.max_clients,
        update_interval: Duration::from_secs_f32(1.0 / args.update_rate.max(1) as f32),
        update_precision: precision,
        grace_period: Duration::from_secs(args.grace),
        ..ServerConfig::default()
    };

    let mut world = MemoryWorld::new();
    world
        .globals_mut()
        .insert("motd".to_string(), "welcome".to_string());
    spawn_drones(&mut world, args.entities);

    let server = Server::bind(config).await?;
    info!(
        "Serving {} entities on {}",
        world.entity_count(),
        server.local_addr()
    );

    let tick = Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32);
    let mut hooks = DemoHooks::default();
    server.run(&mut world, &mut hooks, tick).await
}
