//! Per-client negotiation state machine.
//!
//! A [`Negotiator`] owns at most one match at a time. Every asynchronous
//! step (device acquisition, description creation, transport setup) runs
//! without holding the session lock and re-validates the match generation
//! once it resumes, so late completions for a torn-down match are dropped
//! instead of mutating the next one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::{ClientMessage, IceCandidate, MatchId, ServerMessage, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{MediaError, NegotiationError, SignalingError};
use crate::media::{LocalStream, LocalTrack, MediaDevices, MediaRequest, TrackKind};
use crate::transport::{
    MediaTransport, RemoteStream, TransportEnvelope, TransportEvent, TransportEventSink,
    TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Queued,
    Matched,
    Negotiating,
    Connected,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Queued => "queued",
            NegotiationState::Matched => "matched",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
        }
    }

    pub fn in_match(&self) -> bool {
        matches!(
            self,
            NegotiationState::Matched | NegotiationState::Negotiating | NegotiationState::Connected
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: NegotiationState,
    pub to: NegotiationState,
    pub match_id: Option<MatchId>,
}

struct ActiveMatch<T> {
    id: MatchId,
    role: Role,
    generation: u64,
    transport: Option<Arc<T>>,
    remote: Option<RemoteStream>,
    /// Initiator: our last offer has not been answered yet.
    offer_outstanding: bool,
    /// Initiator: a fresh offer is owed once the outstanding one settles.
    reoffer_pending: bool,
    /// Responder: an offer that arrived mid device change.
    deferred_offer: Option<SessionDescription>,
}

impl<T> ActiveMatch<T> {
    fn new(id: MatchId, role: Role, generation: u64) -> Self {
        Self {
            id,
            role,
            generation,
            transport: None,
            remote: None,
            offer_outstanding: false,
            reoffer_pending: false,
            deferred_offer: None,
        }
    }

    fn context(&self) -> Option<MatchContext<T>> {
        self.transport.clone().map(|transport| MatchContext {
            id: self.id.clone(),
            role: self.role,
            generation: self.generation,
            transport,
        })
    }
}

struct Session<T> {
    state: NegotiationState,
    current: Option<ActiveMatch<T>>,
    local: Option<LocalStream>,
    updating: bool,
    subscribers: Vec<mpsc::UnboundedSender<StateTransition>>,
}

impl<T> Session<T> {
    fn transition(&mut self, to: NegotiationState) {
        if self.state == to {
            return;
        }
        let change = StateTransition {
            from: self.state,
            to,
            match_id: self.current.as_ref().map(|active| active.id.clone()),
        };
        info!(from = %change.from, to = %change.to, "negotiation state changed");
        self.state = to;
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }

    fn active(&self, generation: u64) -> Option<&ActiveMatch<T>> {
        self.current
            .as_ref()
            .filter(|active| active.generation == generation)
    }

    fn active_mut(&mut self, generation: u64) -> Option<&mut ActiveMatch<T>> {
        self.current
            .as_mut()
            .filter(|active| active.generation == generation)
    }
}

/// Snapshot of the current match taken under the lock.
struct MatchContext<T> {
    id: MatchId,
    role: Role,
    generation: u64,
    transport: Arc<T>,
}

/// Holds the session's `updating` flag for one device change and clears it
/// on drop, so a cancelled change cannot wedge the negotiator.
struct DeviceUpdate<'a, T> {
    session: &'a Mutex<Session<T>>,
}

impl<'a, T> DeviceUpdate<'a, T> {
    fn begin(
        session: &'a Mutex<Session<T>>,
    ) -> Result<(Self, Option<LocalStream>), NegotiationError> {
        let mut guard = session.lock();
        if guard.updating {
            return Err(NegotiationError::DeviceChangeInProgress);
        }
        guard.updating = true;
        let previous = guard.local.clone();
        drop(guard);
        Ok((Self { session }, previous))
    }

    /// Ends the update and hands back the offer held during it, if any.
    fn finish(self) -> Option<(MatchId, SessionDescription)> {
        let mut session = self.session.lock();
        session.updating = false;
        let held = session.current.as_mut().and_then(|active| {
            let offer = active.deferred_offer.take()?;
            Some((active.id.clone(), offer))
        });
        held
    }
}

impl<T> Drop for DeviceUpdate<'_, T> {
    fn drop(&mut self) {
        self.session.lock().updating = false;
    }
}

pub struct Negotiator<F: TransportFactory, D: MediaDevices> {
    factory: F,
    devices: D,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<TransportEnvelope>,
    session: Mutex<Session<F::Transport>>,
    next_generation: AtomicU64,
}

impl<F, D> Negotiator<F, D>
where
    F: TransportFactory,
    D: MediaDevices,
{
    /// Builds an idle negotiator. Outgoing signaling is written to
    /// `outbound`; the returned receiver carries transport events that must
    /// be fed back through [`Negotiator::handle_transport_event`].
    pub fn new(
        factory: F,
        devices: D,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEnvelope>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let negotiator = Arc::new(Self {
            factory,
            devices,
            outbound,
            events,
            session: Mutex::new(Session {
                state: NegotiationState::Idle,
                current: None,
                local: None,
                updating: false,
                subscribers: Vec::new(),
            }),
            next_generation: AtomicU64::new(0),
        });
        (negotiator, events_rx)
    }

    pub fn state(&self) -> NegotiationState {
        self.session.lock().state
    }

    pub fn match_id(&self) -> Option<MatchId> {
        self.session
            .lock()
            .current
            .as_ref()
            .map(|active| active.id.clone())
    }

    pub fn role(&self) -> Option<Role> {
        self.session.lock().current.as_ref().map(|active| active.role)
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.session.lock().local.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.session
            .lock()
            .current
            .as_ref()
            .and_then(|active| active.remote.clone())
    }

    pub fn is_updating(&self) -> bool {
        self.session.lock().updating
    }

    /// Every transition after this call is delivered in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateTransition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.session.lock().subscribers.push(tx);
        rx
    }

    pub fn enter_queue(&self) -> Result<(), NegotiationError> {
        let mut session = self.session.lock();
        match session.state {
            NegotiationState::Idle => {
                self.send(ClientMessage::EnterQueue)?;
                session.transition(NegotiationState::Queued);
                Ok(())
            }
            NegotiationState::Queued => Ok(()),
            state => Err(NegotiationError::InvalidState {
                action: "enter the queue",
                state: state.as_str(),
            }),
        }
    }

    /// Leaves the queue or the current match, whichever applies.
    pub async fn leave(&self) -> Result<(), NegotiationError> {
        let state = {
            let mut session = self.session.lock();
            if session.state == NegotiationState::Queued {
                self.send(ClientMessage::LeaveQueue)?;
                session.transition(NegotiationState::Idle);
                return Ok(());
            }
            session.state
        };
        if state.in_match() {
            self.end_match(None, true).await;
        }
        Ok(())
    }

    /// Drops the match without telling the server and releases local
    /// capture. Used when the signaling channel itself is gone.
    pub async fn shutdown(&self) {
        self.end_match(None, false).await;
        let local = {
            let mut session = self.session.lock();
            session.transition(NegotiationState::Idle);
            session.local.take()
        };
        if let Some(local) = local {
            local.stop_all();
        }
    }

    pub async fn handle_server_message(
        &self,
        message: ServerMessage,
    ) -> Result<(), NegotiationError> {
        match message {
            ServerMessage::Queued => {
                if self.state() != NegotiationState::Queued {
                    debug!(state = %self.state(), "queue acknowledgement outside of the queue");
                }
                Ok(())
            }
            ServerMessage::Matched {
                match_id,
                initiator,
            } => {
                let role = if initiator {
                    Role::Initiator
                } else {
                    Role::Responder
                };
                self.on_matched(match_id, role).await
            }
            ServerMessage::Offer { match_id, offer } => self.on_offer(match_id, offer).await,
            ServerMessage::Answer { match_id, answer } => self.on_answer(match_id, answer).await,
            ServerMessage::IceCandidate {
                match_id,
                candidate,
            } => self.on_remote_candidate(match_id, candidate).await,
            ServerMessage::PeerDeviceChange { match_id } => {
                self.on_peer_device_change(match_id).await
            }
            ServerMessage::PeerDisconnected { match_id } => {
                if self.end_match(Some(&match_id), false).await {
                    info!(match_id = %match_id, "peer disconnected");
                }
                Ok(())
            }
            ServerMessage::Pong => Ok(()),
            ServerMessage::Error { message } => {
                warn!(%message, "signaling server reported an error");
                Ok(())
            }
        }
    }

    pub async fn handle_transport_event(
        &self,
        envelope: TransportEnvelope,
    ) -> Result<(), NegotiationError> {
        let TransportEnvelope { generation, event } = envelope;
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let match_id = self.session.lock().active(generation).map(|a| a.id.clone());
                match match_id {
                    Some(match_id) => self.send(ClientMessage::IceCandidate {
                        match_id,
                        candidate,
                    })?,
                    None => debug!(generation, "dropping local candidate from a stale transport"),
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let mut session = self.session.lock();
                let Some(active) = session.active_mut(generation) else {
                    debug!(generation, "dropping remote track from a stale transport");
                    return Ok(());
                };
                debug!(match_id = %active.id, kind = %track.kind, "remote track arrived");
                active.remote.get_or_insert_with(RemoteStream::default).add(track);
                let awaiting_answer = active.offer_outstanding;
                if session.state == NegotiationState::Negotiating && !awaiting_answer {
                    session.transition(NegotiationState::Connected);
                }
            }
            TransportEvent::IceStateChanged(state) => {
                debug!(generation, ?state, "ice connection state changed");
                if !state.is_lost() {
                    return Ok(());
                }
                let match_id = self.session.lock().active(generation).map(|a| a.id.clone());
                if let Some(match_id) = match_id {
                    warn!(match_id = %match_id, ?state, "peer connection lost");
                    self.end_match(Some(&match_id), true).await;
                }
            }
        }
        Ok(())
    }

    pub async fn change_audio_input(&self, device_id: &str) -> Result<(), NegotiationError> {
        self.change_device(TrackKind::Audio, device_id).await
    }

    pub async fn change_video_input(&self, device_id: &str) -> Result<(), NegotiationError> {
        self.change_device(TrackKind::Video, device_id).await
    }

    /// Switches one capture device, keeping the other kind's track. When a
    /// match is live the peer is told about the change and the initiator
    /// renegotiates. An offer held back while switching is answered
    /// whether or not the switch succeeded.
    pub async fn change_device(
        &self,
        kind: TrackKind,
        device_id: &str,
    ) -> Result<(), NegotiationError> {
        let (update, previous) = DeviceUpdate::begin(&self.session)?;
        let swapped = self.swap_device(kind, device_id, previous).await;
        if let Some((match_id, offer)) = update.finish() {
            self.answer_deferred_offer(match_id, offer).await?;
        }
        let ctx = match swapped {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return Ok(()),
            Err(err) => {
                self.resume_owed_offer().await?;
                return Err(err);
            }
        };

        info!(match_id = %ctx.id, %kind, device_id, "local device changed");
        self.send(ClientMessage::DeviceChange {
            match_id: ctx.id.clone(),
        })?;
        if ctx.role == Role::Initiator {
            self.renegotiate(ctx).await?;
        }
        Ok(())
    }

    async fn swap_device(
        &self,
        kind: TrackKind,
        device_id: &str,
        previous: Option<LocalStream>,
    ) -> Result<Option<MatchContext<F::Transport>>, NegotiationError> {
        let previous = previous.unwrap_or_default();
        let old_track = previous.track(kind).cloned();
        if let Some(old) = &old_track {
            old.stop();
        }

        let track = match self.open_track(kind, device_id).await {
            Ok(track) => track,
            Err(err) => {
                warn!(%kind, device_id, error = %err, "device switch failed");
                if let Some(old) = old_track {
                    self.restore_track(&previous, old).await;
                }
                return Err(err.into());
            }
        };

        let next = previous.with_track(track);
        let ctx = {
            let mut session = self.session.lock();
            session.local = Some(next.clone());
            session.current.as_ref().and_then(ActiveMatch::context)
        };
        if let Some(ctx) = &ctx {
            ctx.transport.replace_outgoing_tracks(&next).await?;
        }
        Ok(ctx)
    }

    async fn open_track(&self, kind: TrackKind, device_id: &str) -> Result<LocalTrack, MediaError> {
        let stream = self
            .devices
            .acquire(&MediaRequest::only(kind, device_id))
            .await?;
        stream
            .track(kind)
            .cloned()
            .ok_or(MediaError::NoDevice(kind.as_str()))
    }

    /// Reopens the device that was stopped ahead of a failed switch so the
    /// session keeps sending from it.
    async fn restore_track(&self, previous: &LocalStream, old: LocalTrack) {
        let kind = old.kind();
        match self.open_track(kind, old.device_id()).await {
            Ok(track) => {
                let restored = previous.with_track(track);
                let transport = {
                    let mut session = self.session.lock();
                    session.local = Some(restored.clone());
                    session
                        .current
                        .as_ref()
                        .and_then(|active| active.transport.clone())
                };
                if let Some(transport) = transport {
                    if let Err(err) = transport.replace_outgoing_tracks(&restored).await {
                        warn!(%kind, error = %err, "failed to reattach restored track");
                    }
                }
            }
            Err(err) => {
                error!(
                    %kind,
                    device_id = old.device_id(),
                    error = %err,
                    "previous device could not be reopened"
                );
            }
        }
    }

    async fn on_matched(&self, match_id: MatchId, role: Role) -> Result<(), NegotiationError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = {
            let mut session = self.session.lock();
            if session.state == NegotiationState::Idle {
                // The server paired us before our leaveQueue reached it.
                drop(session);
                info!(match_id = %match_id, "matched after leaving the queue; declining");
                return self.send(ClientMessage::LeaveMatch { match_id });
            }
            let replaced = session
                .current
                .replace(ActiveMatch::new(match_id.clone(), role, generation));
            session.transition(NegotiationState::Matched);
            replaced
        };
        if let Some(previous) = replaced {
            warn!(previous = %previous.id, next = %match_id, "new match replaced an active one");
            if let Some(transport) = previous.transport {
                close_quietly(&previous.id, transport.as_ref()).await;
            }
        }

        info!(match_id = %match_id, ?role, "matched with a peer");
        self.start_negotiation(match_id, role, generation).await
    }

    async fn start_negotiation(
        &self,
        match_id: MatchId,
        role: Role,
        generation: u64,
    ) -> Result<(), NegotiationError> {
        let local = match self.ensure_local_stream().await {
            Ok(local) => local,
            Err(err) => {
                error!(
                    match_id = %match_id,
                    error = %err,
                    "local media unavailable; abandoning match"
                );
                self.end_match(Some(&match_id), true).await;
                return Err(err.into());
            }
        };
        if !self.is_current(generation) {
            return Ok(());
        }

        let sink = TransportEventSink::new(generation, self.events.clone());
        let transport = match self.factory.create(sink).await {
            Ok(transport) => transport,
            Err(err) => {
                error!(match_id = %match_id, error = %err, "failed to create media transport");
                self.end_match(Some(&match_id), true).await;
                return Err(err.into());
            }
        };
        if let Err(err) = transport.add_local_tracks(&local).await {
            error!(match_id = %match_id, error = %err, "failed to attach local tracks");
            close_quietly(&match_id, transport.as_ref()).await;
            self.end_match(Some(&match_id), true).await;
            return Err(err.into());
        }

        let installed = {
            let mut session = self.session.lock();
            match session.active_mut(generation) {
                Some(active) => {
                    active.transport = Some(Arc::clone(&transport));
                    session.transition(NegotiationState::Negotiating);
                    true
                }
                None => false,
            }
        };
        if !installed {
            debug!(match_id = %match_id, "match ended during transport setup");
            close_quietly(&match_id, transport.as_ref()).await;
            return Ok(());
        }

        if role == Role::Initiator {
            let ctx = MatchContext {
                id: match_id,
                role,
                generation,
                transport,
            };
            let id = ctx.id.clone();
            let offered = self.send_offer(&ctx).await;
            return self.abandon_on_error(&id, offered).await;
        }
        Ok(())
    }

    async fn ensure_local_stream(&self) -> Result<LocalStream, MediaError> {
        let existing = self.session.lock().local.clone();
        if let Some(local) = existing.filter(|local| !local.is_empty()) {
            return Ok(local);
        }
        let acquired = self
            .devices
            .acquire(&MediaRequest::default_devices())
            .await?;
        let mut session = self.session.lock();
        if let Some(local) = session.local.clone().filter(|local| !local.is_empty()) {
            // A device change installed a stream while we were acquiring.
            acquired.stop_all();
            return Ok(local);
        }
        session.local = Some(acquired.clone());
        Ok(acquired)
    }

    /// Offers unless an earlier offer is still unanswered, in which case the
    /// new one is owed and sent from [`Self::on_answer`].
    async fn send_offer(&self, ctx: &MatchContext<F::Transport>) -> Result<(), NegotiationError> {
        {
            let mut session = self.session.lock();
            let Some(active) = session.active_mut(ctx.generation) else {
                return Ok(());
            };
            if active.offer_outstanding {
                debug!(match_id = %ctx.id, "offer still unanswered; re-offering after the answer");
                active.reoffer_pending = true;
                return Ok(());
            }
            active.offer_outstanding = true;
            active.reoffer_pending = false;
        }
        let offer = ctx.transport.create_offer().await?;
        ctx.transport.set_local_description(offer.clone()).await?;
        if !self.is_current(ctx.generation) {
            return Ok(());
        }
        debug!(match_id = %ctx.id, "sending offer");
        self.send(ClientMessage::Offer {
            match_id: ctx.id.clone(),
            offer,
        })
    }

    async fn renegotiate(&self, ctx: MatchContext<F::Transport>) -> Result<(), NegotiationError> {
        {
            let mut session = self.session.lock();
            if session.active(ctx.generation).is_none() {
                return Ok(());
            }
            session.transition(NegotiationState::Negotiating);
        }
        let offered = self.send_offer(&ctx).await;
        self.abandon_on_error(&ctx.id, offered).await
    }

    async fn on_offer(
        &self,
        match_id: MatchId,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(ctx) = self.context(&match_id, "offer").await? else {
            return Ok(());
        };
        if ctx.role != Role::Responder {
            warn!(match_id = %match_id, "initiator received an offer; ignoring");
            return Ok(());
        }
        {
            let mut session = self.session.lock();
            if session.updating {
                info!(match_id = %match_id, "holding offer until the device change completes");
                if let Some(active) = session.active_mut(ctx.generation) {
                    active.deferred_offer = Some(offer);
                }
                return Ok(());
            }
            session.transition(NegotiationState::Negotiating);
        }

        let answered = self.answer_offer(&ctx, offer).await;
        self.abandon_on_error(&match_id, answered).await
    }

    async fn answer_deferred_offer(
        &self,
        match_id: MatchId,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(ctx) = self.context(&match_id, "held offer").await? else {
            return Ok(());
        };
        {
            let mut session = self.session.lock();
            if session.active(ctx.generation).is_none() {
                return Ok(());
            }
            session.transition(NegotiationState::Negotiating);
        }
        info!(match_id = %match_id, "answering offer held during the device change");
        let answered = self.answer_offer(&ctx, offer).await;
        self.abandon_on_error(&match_id, answered).await
    }

    /// Sends an offer the initiator owes its peer once nothing else is in
    /// flight. Used when a local device change fails after the peer asked
    /// for a renegotiation.
    async fn resume_owed_offer(&self) -> Result<(), NegotiationError> {
        let ctx = {
            let session = self.session.lock();
            session
                .current
                .as_ref()
                .filter(|active| {
                    active.role == Role::Initiator
                        && active.reoffer_pending
                        && !active.offer_outstanding
                })
                .and_then(ActiveMatch::context)
        };
        match ctx {
            Some(ctx) => self.renegotiate(ctx).await,
            None => Ok(()),
        }
    }

    async fn answer_offer(
        &self,
        ctx: &MatchContext<F::Transport>,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        ctx.transport.set_remote_description(offer).await?;
        let answer = ctx.transport.create_answer().await?;
        ctx.transport.set_local_description(answer.clone()).await?;
        if !self.is_current(ctx.generation) {
            return Ok(());
        }
        debug!(match_id = %ctx.id, "sending answer");
        self.send(ClientMessage::Answer {
            match_id: ctx.id.clone(),
            answer,
        })?;
        self.settle(ctx.generation);
        Ok(())
    }

    async fn on_answer(
        &self,
        match_id: MatchId,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(ctx) = self.context(&match_id, "answer").await? else {
            return Ok(());
        };
        if ctx.role != Role::Initiator {
            warn!(match_id = %match_id, "responder received an answer; ignoring");
            return Ok(());
        }
        let outstanding = self
            .session
            .lock()
            .active(ctx.generation)
            .is_some_and(|active| active.offer_outstanding);
        if !outstanding {
            warn!(match_id = %match_id, "answer without an outstanding offer; ignoring");
            return Ok(());
        }

        let applied = ctx
            .transport
            .set_remote_description(answer)
            .await
            .map_err(NegotiationError::from);
        if applied.is_err() {
            return self.abandon_on_error(&match_id, applied).await;
        }

        let reoffer = {
            let mut session = self.session.lock();
            let Some(active) = session.active_mut(ctx.generation) else {
                return Ok(());
            };
            active.offer_outstanding = false;
            std::mem::take(&mut active.reoffer_pending)
        };
        if reoffer {
            info!(match_id = %match_id, "answer applied; sending the owed re-offer");
            let offered = self.send_offer(&ctx).await;
            return self.abandon_on_error(&match_id, offered).await;
        }
        self.settle(ctx.generation);
        Ok(())
    }

    async fn on_remote_candidate(
        &self,
        match_id: MatchId,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let Some(ctx) = self.context(&match_id, "ice candidate").await? else {
            return Ok(());
        };
        if let Err(err) = ctx.transport.add_remote_candidate(candidate).await {
            warn!(match_id = %match_id, error = %err, "failed to apply remote candidate");
            return Err(err.into());
        }
        Ok(())
    }

    async fn on_peer_device_change(&self, match_id: MatchId) -> Result<(), NegotiationError> {
        let Some(ctx) = self.context(&match_id, "peer device change").await? else {
            return Ok(());
        };
        if ctx.role != Role::Initiator {
            debug!(match_id = %match_id, "peer changed devices; waiting for its offer");
            return Ok(());
        }
        {
            let mut session = self.session.lock();
            if session.updating {
                // Our own change ends with a fresh offer, or resumes this one if it fails.
                debug!(match_id = %match_id, "peer changed devices during our own update");
                if let Some(active) = session.active_mut(ctx.generation) {
                    active.reoffer_pending = true;
                }
                return Ok(());
            }
        }
        info!(match_id = %match_id, "peer changed devices; renegotiating");
        self.renegotiate(ctx).await
    }

    /// Resolves the current match for an incoming negotiation step. Returns
    /// `None` for messages addressed to any other match.
    async fn context(
        &self,
        match_id: &MatchId,
        step: &'static str,
    ) -> Result<Option<MatchContext<F::Transport>>, NegotiationError> {
        let lookup = {
            let session = self.session.lock();
            match session.current.as_ref() {
                Some(active) if &active.id == match_id => Some(active.context()),
                _ => None,
            }
        };
        match lookup {
            None => {
                debug!(
                    match_id = %match_id,
                    step,
                    "ignoring message for a match that is not current"
                );
                Ok(None)
            }
            Some(Some(ctx)) => Ok(Some(ctx)),
            Some(None) => {
                error!(
                    match_id = %match_id,
                    step,
                    "no media transport for the current match; returning to idle"
                );
                self.end_match(Some(match_id), true).await;
                Err(NegotiationError::NoTransport(match_id.to_string()))
            }
        }
    }

    /// A completed description exchange lands on `Connected` once the
    /// peer's media is already flowing.
    fn settle(&self, generation: u64) {
        let mut session = self.session.lock();
        let has_remote = session
            .active(generation)
            .is_some_and(|active| active.remote.is_some());
        if has_remote {
            session.transition(NegotiationState::Connected);
        }
    }

    async fn abandon_on_error(
        &self,
        match_id: &MatchId,
        result: Result<(), NegotiationError>,
    ) -> Result<(), NegotiationError> {
        if let Err(err) = &result {
            error!(match_id = %match_id, error = %err, "negotiation failed; abandoning match");
            self.end_match(Some(match_id), true).await;
        }
        result
    }

    /// Tears the current match down. When `target` is set only that match is
    /// ended. Returns false if there was nothing to end, which makes every
    /// teardown path safe to repeat.
    async fn end_match(&self, target: Option<&MatchId>, notify_server: bool) -> bool {
        let ended = {
            let mut session = self.session.lock();
            let is_target = match (&session.current, target) {
                (Some(active), Some(id)) => &active.id == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !is_target {
                return false;
            }
            session.transition(NegotiationState::Idle);
            session.current.take()
        };
        let Some(ended) = ended else {
            return false;
        };

        if notify_server {
            if let Err(err) = self.send(ClientMessage::LeaveMatch {
                match_id: ended.id.clone(),
            }) {
                debug!(match_id = %ended.id, error = %err, "could not send teardown to the server");
            }
        }
        if let Some(transport) = ended.transport {
            close_quietly(&ended.id, transport.as_ref()).await;
        }
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.lock().active(generation).is_some()
    }

    fn send(&self, message: ClientMessage) -> Result<(), NegotiationError> {
        self.outbound
            .send(message)
            .map_err(|_| NegotiationError::Signaling(SignalingError::ChannelClosed))
    }
}

async fn close_quietly<T: MediaTransport>(match_id: &MatchId, transport: &T) {
    if let Err(err) = transport.close().await {
        debug!(match_id = %match_id, error = %err, "transport close reported an error");
    }
}
