use std::process;
use std::sync::Arc;

use clap::Parser;
use echtun::config::{Config, DEFAULT_DNS, DEFAULT_ECH_DOMAIN, DEFAULT_LISTEN};
use echtun::dialer::WsDialer;
use echtun::ech::{DohEchProvider, EchProvider};
use echtun::server::ProxyServer;
use echtun::{logging, Result};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "echtun", about = "SOCKS5/HTTP proxy tunnelled over ECH-protected WebSocket")]
struct Args {
    /// proxy listen address (SOCKS5 and HTTP)
    #[arg(short = 'l', long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// relay server, e.g. x.x.workers.dev:443
    #[arg(short = 'f', long)]
    server: String,

    /// connect to this IP instead of resolving the server
    #[arg(long = "ip")]
    server_ip: Option<String>,

    #[arg(long)]
    token: Option<String>,

    /// DoH server for the ECH lookup
    #[arg(long, default_value = DEFAULT_DNS)]
    dns: String,

    /// domain publishing the ECH config
    #[arg(long, default_value = DEFAULT_ECH_DOMAIN)]
    ech: String,

    /// fallback proxy IP passed to the relay
    #[arg(long = "pyip")]
    proxy_ip: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.verbose);

    let cfg = Config {
        listen_addr: args.listen,
        server_addr: args.server,
        server_ip: args.server_ip,
        token: args.token,
        dns_server: args.dns,
        ech_domain: args.ech,
        proxy_ip: args.proxy_ip,
    };

    if let Err(e) = run(cfg).await {
        error!(error = %e, "fatal");
        process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    cfg.validate()?;

    let ech = Arc::new(DohEchProvider::new(&cfg.ech_domain, &cfg.dns_server)?);
    info!(domain = %cfg.ech_domain, dns = %cfg.dns_server, "fetching ech config");
    ech.prepare().await?;

    let endpoint = cfg.endpoint()?;
    let server_ip = cfg.pinned_ip()?;
    info!(server = %cfg.server_addr, "relay backend");
    if let Some(ip) = server_ip {
        info!(ip = %ip, "relay server ip pinned");
    }

    let dialer = WsDialer::new(endpoint, server_ip, cfg.token(), ech);
    let server = Arc::new(ProxyServer::new(cfg.listen_addr.clone(), dialer, cfg.fallback_ip()));
    server.run().await
}
