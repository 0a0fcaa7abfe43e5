//! Zonecast node daemon
//!
//! Joins the peer group, serves the local control channel and answers
//! remote controls on the external port.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zonecast::{
    config::AppConfig,
    network::{udp, ExternalDeviceGateway, GroupTransport, UdpGroupTransport},
    node::{Node, StreamBackends},
    ui::WebServer,
};

#[derive(Parser, Debug)]
#[command(name = "zonecastd", version, about = "Share and stream music across zones on the LAN")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display name of this node
    #[arg(short, long)]
    name: Option<String>,

    /// JSON catalog of local tracks
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Control channel port
    #[arg(long)]
    ui_port: Option<u16>,

    /// Run without the control channel
    #[arg(long)]
    no_ui: bool,

    /// Maximum concurrent streaming sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().or_else(AppConfig::default_path);

    if args.init_config {
        let path = config_path.context("no configuration directory on this platform")?;
        AppConfig::default().save(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(name) = args.name {
        config.node.name = name;
    }
    if let Some(catalog) = args.catalog {
        config.node.catalog = Some(catalog);
    }
    if let Some(port) = args.ui_port {
        config.ui.http_port = port;
    }
    if let Some(max) = args.max_sessions {
        config.streaming.max_sessions = max;
    }
    if args.no_ui {
        config.ui.enabled = false;
    }
    config.validate()?;

    tracing::info!("Starting zonecast node '{}'", config.node.name);

    let group = UdpGroupTransport::start(&config.node.name, &config.network)?;
    let transport: Arc<dyn GroupTransport> = group.clone();
    let backends = StreamBackends::from_config(&config);
    let node = Node::new(config.clone(), transport, backends)?;
    let _tasks = node.start();

    // Remote controls
    let local_ip = match node.local_ip() {
        Some(IpAddr::V4(ip)) => ip,
        _ => Ipv4Addr::LOCALHOST,
    };
    let port = config.network.external_port;
    let socket = udp::create_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
    socket.set_broadcast(true)?;
    let gateway = Arc::new(ExternalDeviceGateway::new(
        node.registry().clone(),
        node.messenger().clone(),
        node.request_sender(),
        local_ip,
        port,
    ));
    tokio::spawn(gateway.run(udp::into_tokio(socket)?));
    tracing::info!("Listening for remote controls on port {}", port);

    if config.ui.enabled {
        let _web_handle = WebServer::new(config.ui.clone(), node.clone()).start_background();
        tracing::info!("Control channel at http://{}:{}", config.ui.bind_address, config.ui.http_port);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, leaving the group");
    node.shutdown();
    group.shutdown();
    Ok(())
}
