//! Remote control client
//!
//! Speaks the external device protocol: discovers nodes, registers as a
//! device and sends play, stop and next for the zone it is placed in.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zonecast::{constants::DEFAULT_EXTERNAL_PORT, network::external::MARKER, network::udp};

#[derive(Parser, Debug)]
#[command(name = "zonecast-remote", version, about = "Remote control for zonecast nodes")]
struct Args {
    /// Node to talk to; discovery broadcasts when omitted
    #[arg(long)]
    node: Option<IpAddr>,

    /// External device port
    #[arg(short, long, default_value_t = DEFAULT_EXTERNAL_PORT)]
    port: u16,

    /// Seconds to wait for replies
    #[arg(long, default_value_t = 2)]
    wait: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find nodes on the LAN
    Discover,
    /// Register this device and list the peers
    Register { name: String },
    /// Play the current track of the device's zone
    Play { name: String },
    /// Pause the device's zone
    Stop { name: String },
    /// Skip to the next track
    Next { name: String },
}

impl Command {
    fn datagram(&self) -> Vec<u8> {
        let (tag, name) = match self {
            Command::Discover => ("DISC", ""),
            Command::Register { name } => ("ACKN", name.as_str()),
            Command::Play { name } => ("PLAY", name.as_str()),
            Command::Stop { name } => ("STOP", name.as_str()),
            Command::Next { name } => ("NEXT", name.as_str()),
        };
        let mut data = MARKER.to_vec();
        data.extend_from_slice(tag.as_bytes());
        data.extend_from_slice(name.as_bytes());
        data
    }

    fn expects_reply(&self) -> bool {
        matches!(self, Command::Discover | Command::Register { .. })
    }
}

/// Decoded node reply
struct Reply {
    tag: String,
    node: Ipv4Addr,
    size: u16,
    payload: String,
}

fn parse_reply(data: &[u8]) -> Option<Reply> {
    let data = data.strip_prefix(&MARKER[..])?;
    if data.len() < 10 {
        return None;
    }
    Some(Reply {
        tag: String::from_utf8_lossy(&data[..4]).into_owned(),
        node: Ipv4Addr::new(data[4], data[5], data[6], data[7]),
        size: u16::from_be_bytes([data[8], data[9]]),
        payload: String::from_utf8_lossy(&data[10..]).into_owned(),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let target = match (args.node, &args.command) {
        (Some(ip), _) => SocketAddr::new(ip, args.port),
        (None, Command::Discover) => SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), args.port),
        (None, _) => bail!("--node is required for {:?}", args.command),
    };

    // Nodes reply to the external port, so listen on it as well
    let socket: UdpSocket = udp::create_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port))
        .context("cannot bind the external port")?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_secs(args.wait)))?;

    socket.send_to(&args.command.datagram(), target)?;
    tracing::debug!("Sent {:?} to {}", args.command, target);

    if !args.command.expects_reply() {
        return Ok(());
    }

    let mut buf = [0u8; 65_535];
    let mut replies = 0;
    loop {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if udp::is_timeout(&e) => break,
            Err(e) => return Err(e.into()),
        };
        // Our own broadcast comes back too
        let reply = match parse_reply(&buf[..len]) {
            Some(reply) if reply.tag != "DISC" => reply,
            _ => continue,
        };
        replies += 1;

        match reply.tag.as_str() {
            "SYNC" => println!("node {} ({})", reply.node, from),
            "LIST" => {
                let prefix = format!("LIST{}", reply.size);
                let peers = reply.payload.strip_prefix(prefix.as_str()).unwrap_or(&reply.payload);
                println!("{} peers known to {}:", reply.size, reply.node);
                for ip in peers.split(',').filter(|ip| !ip.is_empty()) {
                    println!("  {}", ip);
                }
            }
            other => println!("{} from {}: {}", other, reply.node, reply.payload),
        }
        if matches!(args.command, Command::Register { .. }) {
            break;
        }
    }

    if replies == 0 {
        println!("no reply within {}s", args.wait);
    }
    Ok(())
}
