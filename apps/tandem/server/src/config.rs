use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            shutdown_grace: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "tandem-server",
    author,
    version,
    about = "Pairs anonymous peers and relays their WebRTC handshake"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TANDEM_LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    pub listen_addr: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TANDEM_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Connections silent for longer than this are closed.
    #[arg(long, env = "TANDEM_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// How often idle connections are looked for.
    #[arg(long, env = "TANDEM_REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.reap_interval_secs == 0 {
            anyhow::bail!("reap interval must be greater than zero");
        }
        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            reap_interval: Duration::from_secs(cli.reap_interval_secs),
        })
    }
}
