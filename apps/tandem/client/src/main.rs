use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_client::rtc::{RtcTransportFactory, DEFAULT_ICE_SERVER};
use tandem_client::{drive, NegotiationState, Negotiator, SignalingConnection, SyntheticDevices};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "tandem-peer",
    author,
    version,
    about = "Headless Tandem peer that queues, negotiates and hangs up"
)]
struct Cli {
    /// Signaling endpoint.
    #[arg(long, env = "TANDEM_SERVER_URL", default_value = "ws://127.0.0.1:3000/ws")]
    server: String,

    /// STUN/TURN urls handed to the peer connection.
    #[arg(
        long = "ice-server",
        env = "TANDEM_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_ICE_SERVER
    )]
    ice_servers: Vec<String>,

    /// Matches to complete before exiting. Zero keeps requeueing forever.
    #[arg(long, default_value_t = 1)]
    rounds: u32,

    /// How long to stay connected before leaving a match.
    #[arg(long, default_value_t = 30)]
    hold_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    let factory = RtcTransportFactory::new(cli.ice_servers.clone())
        .context("failed to set up webrtc api")?;
    let mut signaling = SignalingConnection::connect(&cli.server)
        .await
        .with_context(|| format!("failed to reach {}", cli.server))?;
    info!(server = %cli.server, "connected to signaling server");

    let (negotiator, mut events) =
        Negotiator::new(factory, SyntheticDevices::default(), signaling.outbound.clone());
    let mut transitions = negotiator.subscribe();

    let driver = {
        let negotiator = negotiator.clone();
        tokio::spawn(async move {
            drive(&negotiator, &mut signaling.inbound, &mut events).await;
        })
    };

    negotiator.enter_queue()?;
    let hold = Duration::from_secs(cli.hold_secs);
    let mut completed = 0u32;
    let mut hangup: Option<tokio::task::JoinHandle<()>> = None;

    loop {
        let change = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; leaving");
                negotiator.leave().await?;
                break;
            }
            change = transitions.recv() => change,
        };
        let Some(change) = change else {
            break;
        };

        match change.to {
            NegotiationState::Connected if change.from == NegotiationState::Negotiating => {
                info!(match_id = ?change.match_id, hold_secs = cli.hold_secs, "media flowing");
                if hangup.is_none() {
                    let negotiator = negotiator.clone();
                    hangup = Some(tokio::spawn(async move {
                        tokio::time::sleep(hold).await;
                        if let Err(err) = negotiator.leave().await {
                            warn!(error = %err, "failed to leave match");
                        }
                    }));
                }
            }
            NegotiationState::Idle if change.from.in_match() => {
                if let Some(task) = hangup.take() {
                    task.abort();
                }
                completed += 1;
                info!(completed, "match over");
                if cli.rounds != 0 && completed >= cli.rounds {
                    break;
                }
                negotiator.enter_queue()?;
            }
            _ => {}
        }
    }

    driver.abort();
    Ok(())
}
