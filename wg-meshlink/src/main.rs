// WireGuard VPN and Mesh Daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::interval;
use wg_meshlink::{
    config::{self, load_config},
    engine::Engine,
    event_monitor::EventMonitor,
    link::IpCommand,
    routing::{NoopAgent, PolicyRuleAgent, RoutingPolicyController},
    state::ConnectionController,
    state_file,
    types::{Config, ControllerSettings, Credentials, ServerData},
    wg_engine::WgEngine,
};

/// Interval for logging peer status and refreshing the state file (seconds)
const STATUS_INTERVAL_SECS: u64 = 60;

type Controller = ConnectionController<WgEngine, IpCommand>;
type Routing = RoutingPolicyController<NoopAgent, PolicyRuleAgent>;

#[derive(Parser)]
#[command(name = "wg-meshlink")]
#[command(about = "WireGuard VPN and mesh connectivity daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-meshlink/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the exit node, join the mesh if configured, and hold the
    /// link until SIGINT/SIGTERM
    Up,
    /// Generate a private key and print it with its public key
    Keygen,
    /// Print the public key for a private key
    Pubkey {
        /// Base64 private key
        key: String,
    },
}

/// Engine used only for key operations
fn key_engine() -> WgEngine {
    WgEngine::new(EventMonitor::new().sink(), Duration::ZERO)
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Keygen => {
            let engine = key_engine();
            let private = engine.generate_secret_key();
            println!("private_key = \"{}\"", private);
            println!("public_key = \"{}\"", engine.generate_public_key(&private));
            Ok(())
        }
        Command::Pubkey { key } => {
            config::validate_key(&key).context("Invalid private key")?;
            println!("{}", key_engine().generate_public_key(&key));
            Ok(())
        }
        Command::Up => {
            // 2 threads: the main loop, plus process spawns and signal delivery
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("wg-meshlink")
                .enable_time()
                .enable_io()
                .build()?;

            runtime.block_on(async_main(args.config))
        }
    }
}

async fn async_main(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    log::info!("Starting wg-meshlink daemon");
    log::info!("Tunnel interface: {}", config.general.interface);
    log::info!(
        "Exit node: {}:{}",
        config.vpn.server_ip,
        config.vpn.port
    );

    let settings = ControllerSettings::from_config(&config);
    let monitor = EventMonitor::new();
    let engine = WgEngine::new(monitor.sink(), settings.connect_timeout);
    let controller = ConnectionController::new(engine, monitor, IpCommand::new(), settings);
    let routing = RoutingPolicyController::new(
        NoopAgent,
        PolicyRuleAgent::new(
            config.general.fwmark,
            config.routing.table_id,
            config.routing.priority,
        ),
        config.routing.enabled,
    );

    if let Err(e) = bring_up(&config, &controller, &routing).await {
        log::error!("Startup failed: {:#}", e);
        graceful_shutdown(&controller, &routing).await;
        return Err(e);
    }

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to set up SIGHUP handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("Failed to set up SIGUSR1 handler")?;

    let mut status_timer = interval(Duration::from_secs(STATUS_INTERVAL_SECS));

    log::info!("Daemon started successfully");
    write_state(&controller).await;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }

            // Network changed: tell the engine and reload the mesh map
            _ = sighup.recv() => {
                log::info!("Received SIGHUP, refreshing");
                if let Err(e) = controller.network_change().await {
                    log::warn!("Failed to notify network change: {}", e);
                }
                if let Err(e) = load_mesh_map(&config, &controller).await {
                    log::error!("Failed to refresh mesh map: {:#}", e);
                }
            }

            // Toggle policy routing without touching the tunnel
            _ = sigusr1.recv() => {
                let result = if routing.is_enabled().await {
                    routing.disable().await
                } else {
                    routing.enable().await
                };
                match result {
                    Ok(()) => log::info!(
                        "Policy routing is now {} (table {})",
                        if routing.is_enabled().await { "on" } else { "off" },
                        routing.table_id().await
                    ),
                    Err(e) => log::error!("Failed to toggle policy routing: {}", e),
                }
            }

            _ = status_timer.tick() => {
                match controller.status_map().await {
                    Ok(peers) => {
                        for (public_key, state) in &peers {
                            log::debug!("Peer {}: {}", public_key, state);
                        }
                        log::info!("{} peers configured", peers.len());
                    }
                    Err(e) => log::warn!("Failed to read peer status: {}", e),
                }
                write_state(&controller).await;
            }
        }
    }

    graceful_shutdown(&controller, &routing).await;
    Ok(())
}

/// Join the mesh if configured, connect to the exit node, route through the tunnel
async fn bring_up(config: &Config, controller: &Controller, routing: &Routing) -> Result<()> {
    if let Some(mesh) = &config.mesh {
        log::info!("Enabling mesh with address {}", mesh.address);
        controller
            .enable(mesh.address, &mesh.private_key)
            .await
            .context("Failed to enable mesh")?;
        load_mesh_map(config, controller).await?;
    }

    controller
        .start(
            &Credentials {
                private_key: config.vpn.private_key.clone(),
            },
            &ServerData {
                ip: config.vpn.server_ip,
                public_key: config.vpn.server_public_key.clone(),
            },
        )
        .await
        .context("Failed to connect to exit node")?;

    let interface = controller
        .tunnel_interface()
        .await
        .context("Tunnel interface missing after connect")?;
    routing
        .apply_rules(&interface, config.routing.ipv6)
        .await
        .context("Failed to apply routing rules")?;

    Ok(())
}

async fn load_mesh_map(config: &Config, controller: &Controller) -> Result<()> {
    let Some(path) = config.mesh.as_ref().and_then(|mesh| mesh.map_file.as_ref()) else {
        return Ok(());
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read mesh map {:?}", path))?;
    controller
        .refresh(&raw)
        .await
        .context("Failed to install mesh map")?;
    log::info!("Mesh map loaded from {:?}", path);
    Ok(())
}

async fn write_state(controller: &Controller) {
    let state = controller.connection_state().await;
    let interface = controller.tunnel_interface().await;
    if let Err(e) = state_file::write_state(&state, interface.as_ref().map(|i| i.name.as_str())) {
        log::warn!("Failed to write state file: {}", e);
    }
}

/// Clear routing, leave the mesh and drop the VPN connection
async fn graceful_shutdown(controller: &Controller, routing: &Routing) {
    log::info!("Shutting down gracefully...");

    if let Err(e) = routing.clear_rules().await {
        log::error!("Failed to clear routing rules: {}", e);
    }

    // Stop first so leaving the mesh does not restore the VPN link
    if controller.is_active().await {
        if let Err(e) = controller.stop().await {
            log::error!("Failed to disconnect: {}", e);
        }
    }
    if controller.connection_state().await.mesh_enabled {
        if let Err(e) = controller.disable().await {
            log::error!("Failed to disable mesh: {}", e);
        }
    }

    state_file::cleanup();
    log::info!("Shutdown complete");
}
