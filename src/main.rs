//! Vesper supernode daemon.
//!
//! Rendezvous and relay server of the Vesper overlay VPN: authenticates
//! edge registrations, tracks public sockets, brokers peer discovery, and
//! relays traffic when no direct path exists. Supernodes federate through
//! a distinguished community whose members are other supernodes.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, reload};
use vesper::config::SnConfig;
use vesper::crypto::HeaderMode;
use vesper::mgmt;
use vesper::mgmt::rpc::RpcContext;
use vesper::net::Supernode;
use vesper::net::types::{DEFAULT_MGMT_PORT, DEFAULT_PORT, DEFAULT_REGISTRATION_TTL};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "vesperd", version, about = "Vesper overlay VPN supernode")]
struct Args {
    /// Data port, UDP (and aux TCP when enabled)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Datapath bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Enable the aux TCP datapath
    #[arg(long)]
    tcp: bool,

    /// Management bind address
    #[arg(long, default_value = "127.0.0.1")]
    mgmt_bind: IpAddr,

    /// Management HTTP port
    #[arg(long, default_value_t = DEFAULT_MGMT_PORT)]
    mgmt_port: u16,

    /// Password required by mutating management methods
    #[arg(long)]
    mgmt_password: Option<String>,

    /// Community ACL file; absent means any community may form
    #[arg(short = 'c', long)]
    community_file: Option<PathBuf>,

    /// Federation community name
    #[arg(long, default_value = "*Federation")]
    federation: String,

    /// Federated supernode anchor as host:port (repeatable)
    #[arg(short = 'l', long = "peer")]
    peers: Vec<String>,

    /// Auto-IP pool lower bound
    #[arg(long, default_value = "10.128.0.0")]
    auto_ip_min: Ipv4Addr,

    /// Auto-IP pool upper bound
    #[arg(long, default_value = "10.255.255.0")]
    auto_ip_max: Ipv4Addr,

    /// Auto-IP subnet prefix length
    #[arg(long, default_value_t = 24)]
    auto_ip_prefix: u8,

    /// Edge registration TTL in seconds
    #[arg(short = 't', long, default_value_t = DEFAULT_REGISTRATION_TTL)]
    registration_ttl: u64,

    /// Disable MAC spoofing protection (never disables the community ACL)
    #[arg(long)]
    no_spoofing_protection: bool,

    /// Default header protection for bare ACL communities: none | static
    #[arg(long, default_value = "none")]
    header_encryption: String,

    /// X25519 key file for user-auth communities; created when missing
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Advertised version string, at most 19 bytes
    #[arg(long)]
    version_string: Option<String>,
}

fn filter_for(level: u8) -> EnvFilter {
    let directive = match level {
        0 => "vesper=error",
        1 => "vesper=warn",
        2 => "vesper=info",
        3 => "vesper=debug",
        _ => "vesper=trace",
    };
    EnvFilter::new(directive)
}

#[tokio::main]
async fn main() {
    let base_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(2));
    let (filter, filter_handle) = reload::Layer::new(base_filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let header_mode: HeaderMode = match args.header_encryption.parse() {
        Ok(HeaderMode::User) => {
            error!("user mode is selected per community through the ACL key files");
            std::process::exit(1);
        }
        Ok(mode) => mode,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let cfg = SnConfig {
        bind_address: args.bind,
        port: args.port,
        tcp_enabled: args.tcp,
        mgmt_bind: args.mgmt_bind,
        mgmt_port: args.mgmt_port,
        mgmt_password: args.mgmt_password,
        federation_name: args.federation,
        federation_peers: args.peers,
        community_file: args.community_file,
        auto_ip_pool_min: args.auto_ip_min,
        auto_ip_pool_max: args.auto_ip_max,
        auto_ip_prefix: args.auto_ip_prefix,
        registration_ttl: args.registration_ttl,
        spoofing_protection: !args.no_spoofing_protection,
        header_encryption_default: header_mode,
        version_string: args
            .version_string
            .unwrap_or_else(|| format!("vesper-{VERSION}")),
        key_file: args.key_file,
    };

    info!("vesper supernode v{}", VERSION);

    let node = match Supernode::new(cfg).await {
        Ok(node) => node,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = node.start().await {
        error!("cannot start datapath: {}", e);
        std::process::exit(1);
    }

    // Management plane, wired to the same state and shutdown channel.
    let ctx = RpcContext {
        state: node.state(),
        keep_running: node.keep_running(),
        shutdown: node.shutdown_tx(),
        events: node.events(),
        set_verbose: Some(Arc::new(move |level| {
            let _ = filter_handle.reload(filter_for(level));
        })),
    };
    let mgmt_bind = SocketAddr::new(args.mgmt_bind, args.mgmt_port);
    let mgmt_shutdown = node.shutdown_tx().subscribe();
    tokio::spawn(async move {
        if let Err(e) = mgmt::serve(ctx, mgmt_bind, mgmt_shutdown).await {
            error!("management API failed: {}", e);
        }
    });

    // First signal (or a management `stop`) shuts down cleanly; a second
    // signal during wind-down forces exit.
    let mut stop_rx = node.shutdown_tx().subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            node.shutdown().await;
        }
        _ = stop_rx.changed() => {}
    }
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("forced exit");
            std::process::exit(1);
        }
        _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {}
    }
    info!("supernode stopped");
}
