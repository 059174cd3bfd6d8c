use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunsocks::config::{ActivationConfig, ProfileStore, TunnelConfig, DEFAULT_NODE_LABEL};
use tunsocks::rpc::RpcServer;
use tunsocks::tun::NetworkSettings;
use tunsocks::utils::parse_host_port;
use tunsocks::TunnelController;

#[derive(Parser, Debug)]
#[command(name = "tunsocks")]
#[command(about = "User-space TUN to SOCKS5 bridge", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Profile path (defaults to the platform config directory)
    #[arg(long, global = true)]
    profile: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct ProfileArgs {
    /// SOCKS5 proxy address (host:port)
    #[arg(short = 'p', long)]
    proxy: String,

    /// Node label shown in status
    #[arg(short = 'n', long, default_value = DEFAULT_NODE_LABEL)]
    node: String,
}

impl ProfileArgs {
    fn to_activation(&self) -> anyhow::Result<ActivationConfig> {
        let (proxy_host, proxy_port) = parse_host_port(&self.proxy)?;
        Ok(ActivationConfig {
            proxy_host,
            proxy_port,
            node_label: self.node.clone(),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel on a TUN device until Ctrl-C
    #[command(alias = "start")]
    Run {
        /// Install this proxy before starting
        #[arg(short = 'p', long)]
        proxy: Option<String>,

        /// TUN device name
        #[arg(short = 'd', long, default_value = "utun-socks")]
        device: String,

        /// MTU
        #[arg(long, default_value_t = 1500)]
        mtu: u16,

        /// Write routes into the system routing table (Linux)
        #[arg(long)]
        apply_routes: bool,
    },

    /// Serve JSON-RPC on stdin/stdout
    Rpc,

    /// Install the tunnel profile (overwrites an existing one)
    Install(ProfileArgs),

    /// Update the installed profile
    Update(ProfileArgs),

    /// Print status as JSON
    Status,

    /// Print the network settings derived from the profile
    Settings,

    /// Remove the installed profile
    Remove,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志（stdout 留给 RPC，日志写 stderr）
    let log_level = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunsocks={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = match args.profile {
        Some(path) => ProfileStore::new(path),
        None => ProfileStore::default_location()?,
    };

    match args.command {
        Commands::Run {
            proxy,
            device,
            mtu,
            apply_routes,
        } => {
            let template = TunnelConfig {
                device_name: device,
                mtu,
                ..Default::default()
            };
            let controller = TunnelController::with_template(store, template).apply_routes(apply_routes);

            if let Some(proxy) = proxy {
                let (proxy_host, proxy_port) = parse_host_port(&proxy)?;
                let node_label = controller
                    .store()
                    .load()?
                    .map(|p| p.node_label)
                    .unwrap_or_else(|| DEFAULT_NODE_LABEL.to_string());
                controller.install(&ActivationConfig {
                    proxy_host,
                    proxy_port,
                    node_label,
                })?;
            }

            info!("🚀 tunsocks starting...");
            controller.start_tun().await.context("failed to start tunnel")?;

            let mut states = controller.subscribe();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
                _ = states.wait_for(|s| *s == tunsocks::TunnelState::Stopped) => {
                    error!("❌ Tunnel stopped unexpectedly");
                }
            }
            controller.stop().await?;
        }

        Commands::Rpc => {
            let controller = Arc::new(TunnelController::new(store));
            RpcServer::run(controller).await?;
        }

        Commands::Install(profile) => {
            TunnelController::new(store).install(&profile.to_activation()?)?;
        }

        Commands::Update(profile) => {
            TunnelController::new(store).update(&profile.to_activation()?)?;
        }

        Commands::Status => {
            let status = TunnelController::new(store).status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Settings => {
            let activation = store
                .load()?
                .context("no profile installed, run `tunsocks install` first")?;
            let settings = NetworkSettings::from_config(&TunnelConfig::default().with_activation(&activation));
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }

        Commands::Remove => {
            if !TunnelController::new(store).remove().await? {
                info!("No profile installed");
            }
        }
    }

    Ok(())
}
