use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::time::interval;
use veilmesh::{
    config::Config,
    connection::ConnectionTracker,
    firewall::OpenFirewall,
    hostmap::HostMap,
    http,
    inbound::{Inbound, NullHandshake},
    lighthouse::LighthouseMap,
    metrics::Metrics,
    tun::{self, Inside, TunDevice},
    CaPool,
};

#[derive(Parser, Debug)]
#[command(
    name = "veilmesh",
    version,
    about = "Veilmesh mesh overlay daemon - encrypted UDP data plane",
    long_about = "Veilmesh daemon\n\n\
        Terminates the overlay's inbound data plane: authenticated UDP\n\
        datagrams are replay-checked, decrypted and delivered to the local\n\
        TUN interface; control messages are dispatched to their handlers.\n\n\
        Examples:\n  \
          # Run with a TUN interface\n  \
          veilmesh --port 4242 --vip 10.128.0.1\n\n  \
          # Run as a lighthouse\n  \
          veilmesh --port 4242 --vip 10.128.0.1 --lighthouse"
)]
struct Args {
    /// UDP port for overlay traffic
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<std::path::PathBuf>,

    /// Virtual IP address (e.g. 10.128.0.1); omit to run without a TUN device
    #[arg(long)]
    vip: Option<std::net::Ipv4Addr>,

    /// Virtual interface name
    #[arg(long)]
    tun_name: Option<String>,

    /// Advertise peers to others (lighthouse role)
    #[arg(long)]
    lighthouse: bool,

    /// Port for the Prometheus metrics endpoint
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Trusted CA fingerprints (repeatable)
    #[arg(long, action = clap::ArgAction::Append)]
    trusted_ca: Vec<String>,
}

fn load_config(args: &Args) -> Config {
    let mut config = if let Some(path) = &args.config {
        Config::load(path).unwrap_or_else(|e| {
            warn!(
                "failed to load config from {:?}: {}. Using defaults.",
                path, e
            );
            Config::default()
        })
    } else {
        Config::load_or_default()
    };

    if let Some(port) = args.port {
        config.daemon.port = port;
    }
    if let Some(port) = args.metrics_port {
        config.daemon.metrics_port = port;
    }
    if let Some(vip) = args.vip {
        config.tun.address = Some(vip);
    }
    if let Some(name) = &args.tun_name {
        config.tun.name = name.clone();
    }
    if args.lighthouse {
        config.lighthouse.am_lighthouse = true;
    }

    config
}

fn setup_tun(config: &Config) -> Inside {
    let Some(tun_config) = config.tun_config() else {
        warn!("no virtual IP configured, inbound traffic will be discarded");
        return Inside::Discard;
    };

    if let Err(e) = tun::check_tun_permissions() {
        warn!("{}. Continuing without a TUN device.", e);
        return Inside::Discard;
    }

    match TunDevice::create(tun_config) {
        Ok(device) => Inside::Device(device),
        Err(e) => {
            warn!("failed to create TUN device: {}. Continuing without one.", e);
            Inside::Discard
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let config = load_config(&args);
    info!("starting Veilmesh daemon on UDP/{}", config.daemon.port);

    let metrics = Metrics::new();
    let allow_roam = config.allow_roam_cidrs()?;
    let tun = setup_tun(&config);

    let socket = UdpSocket::bind(format!("0.0.0.0:{}", config.daemon.port))
        .await
        .context("failed to bind UDP socket")?;
    let socket = Arc::new(socket);
    info!("overlay listening on UDP/{}", socket.local_addr()?.port());

    if config.lighthouse.am_lighthouse {
        info!("running as a lighthouse");
    }

    let mut inbound = Inbound {
        hostmap: HostMap::new(),
        connections: ConnectionTracker::new(config.idle_timeout()),
        firewall: OpenFirewall,
        lighthouse: LighthouseMap::new(allow_roam),
        tun,
        handshake: NullHandshake,
        outside: Arc::clone(&socket),
        metrics: Arc::clone(&metrics),
        trusted_cas: CaPool::new(args.trusted_ca.clone()),
        config: config.inbound(),
    };

    // Metrics endpoint.
    let metrics_clone = Arc::clone(&metrics);
    let metrics_port = config.daemon.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = http::serve_metrics(metrics_clone, metrics_port).await {
            error!("metrics server failed: {}", e);
        }
    });

    let mut sweep_interval = interval(config.idle_timeout().min(std::time::Duration::from_secs(30)));
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("exiting...");
                break;
            }
            _ = sweep_interval.tick() => {
                for vpn_ip in inbound.connections.sweep() {
                    debug!("tunnel {} is idle", vpn_ip);
                }
                metrics.set_sessions(inbound.hostmap.len() as u64);
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => inbound.handle_packet(from, &buf[..len]).await,
                    Err(e) => error!("socket error: {}", e),
                }
            }
        }
    }

    Ok(())
}
