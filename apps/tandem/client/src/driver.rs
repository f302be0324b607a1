use tandem_core::ServerMessage;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::media::MediaDevices;
use crate::negotiation::Negotiator;
use crate::transport::{TransportEnvelope, TransportFactory};

/// Feeds signaling frames and transport events into `negotiator` one at a
/// time until the signaling channel closes. Each step completes before the
/// next is taken, so an offer is fully answered before candidates that
/// follow it are applied.
pub async fn drive<F, D>(
    negotiator: &Negotiator<F, D>,
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
    events: &mut mpsc::UnboundedReceiver<TransportEnvelope>,
) where
    F: TransportFactory,
    D: MediaDevices,
{
    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some(message) = message else {
                    info!("signaling channel closed");
                    negotiator.shutdown().await;
                    return;
                };
                if let Err(err) = negotiator.handle_server_message(message).await {
                    warn!(error = %err, "signaling message could not be applied");
                }
            }
            Some(envelope) = events.recv() => {
                if let Err(err) = negotiator.handle_transport_event(envelope).await {
                    warn!(error = %err, "transport event could not be applied");
                }
            }
        }
    }
}
