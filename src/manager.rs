//! Orchestration of discovery, outbound sends and inbound requests
//!
//! One task owns every state transition. Network completions, archive progress,
//! discovery results and server requests all arrive as `Event`s on one channel, so
//! listener callbacks never run concurrently with each other. Only
//! `ReceiverListener::on_transfer` runs elsewhere, on an archive worker.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use plist::Dictionary;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::archive::{self, CountingReader};
use crate::client::{self, Call, Transport};
use crate::config::Config;
use crate::directory::{PeerDirectory, PeerEvent};
use crate::discovery::{DiscoveryEvent, EventSink, NsdController};
use crate::entity::Entity;
use crate::environment::{self, Environment, HostEnvironment, LocalInterface, ReadyStatus};
use crate::error::{SendError, StartError, TransportError};
use crate::listener::{DiscoverListener, ReceiverListener, SendListener};
use crate::logger::{Logger, NoopLogger};
use crate::messages::{self, AskRequest, AskResponse, DiscoverResponse};
use crate::peer::{AirDropPeer, Peer, PeerStatus, TransferState};
use crate::pipe::{self, BodyReceiver, BodySender, ChannelReader, ChannelWriter};
use crate::protocol::{limits, routes, timeouts};
use crate::server::{AirDropServer, RequestHandler};
use crate::session::{CancelSlot, ReceiveState, ReceivingSession, SendingSession};
use crate::tls;

pub(crate) enum Event {
    ServiceResolved {
        id: String,
        url: String,
    },
    ServiceLost {
        id: String,
    },
    PeerDiscovered {
        id: String,
        url: String,
        result: Result<Dictionary, TransportError>,
    },
    Send {
        peer_id: String,
        entities: Vec<Arc<dyn Entity>>,
        listener: Arc<dyn SendListener>,
        reply: oneshot::Sender<Result<SendingSession, SendError>>,
    },
    ThumbnailReady {
        send_id: u64,
        icon: Option<Vec<u8>>,
    },
    AskFinished {
        send_id: u64,
        result: Result<Dictionary, TransportError>,
    },
    SendProgress {
        send_id: u64,
        bytes_sent: u64,
    },
    PackFailed {
        send_id: u64,
        error: io::Error,
    },
    UploadFinished {
        send_id: u64,
        result: Result<(), TransportError>,
    },
    SendCanceled {
        send_id: u64,
    },
    Ask {
        remote: IpAddr,
        request: AskRequest,
        responder: oneshot::Sender<Option<Dictionary>>,
    },
    AskCanceled {
        remote: IpAddr,
    },
    Upload {
        remote: IpAddr,
        body: BodyReceiver,
        reply: oneshot::Sender<bool>,
    },
    ReceiveProgress {
        session: Arc<ReceivingSession>,
        path: String,
        received: u64,
        total: u64,
        index: usize,
        count: usize,
    },
    ReceiveFinished {
        session: Arc<ReceivingSession>,
        result: io::Result<()>,
        reply: oneshot::Sender<bool>,
    },
    SessionClosed {
        session_id: u64,
        remote: IpAddr,
    },
    Shutdown,
}

struct Shared {
    config: Config,
    name: String,
    environment: Arc<dyn Environment>,
    transport: Arc<dyn Transport>,
    journal: Arc<dyn Logger>,
    directory: Arc<PeerDirectory>,
    events: mpsc::UnboundedSender<Event>,
    pool: Arc<rayon::ThreadPool>,
    handler: Arc<InboundHandler>,
    receiver: RwLock<Option<Arc<dyn ReceiverListener>>>,
    discover_listener: RwLock<Option<Arc<dyn DiscoverListener>>>,
    sessions: RwLock<HashMap<IpAddr, Arc<ReceivingSession>>>,
    nsd: Mutex<Option<NsdController>>,
    server: Mutex<Option<AirDropServer>>,
    tls: Mutex<Option<Arc<rustls::ServerConfig>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn receiver(&self) -> Option<Arc<dyn ReceiverListener>> {
        self.receiver.read().clone()
    }

    fn is_current(&self, session: &Arc<ReceivingSession>) -> bool {
        self.sessions
            .read()
            .get(&session.remote())
            .is_some_and(|s| Arc::ptr_eq(s, session))
    }

    fn forget(&self, session: &Arc<ReceivingSession>) {
        let mut sessions = self.sessions.write();
        if sessions.get(&session.remote()).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&session.remote());
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

/// Answers the transfer server by turning requests into events.
struct InboundHandler {
    events: mpsc::UnboundedSender<Event>,
    discover: Dictionary,
}

#[async_trait]
impl RequestHandler for InboundHandler {
    async fn discover(&self, remote: IpAddr, _request: Dictionary) -> Option<Dictionary> {
        tracing::debug!(remote = %remote, "answering discover");
        Some(self.discover.clone())
    }

    async fn ask(&self, remote: IpAddr, request: Dictionary) -> Option<Dictionary> {
        let request = match AskRequest::from_dictionary(&request) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "refusing malformed ask");
                return None;
            }
        };
        let (responder, answer) = oneshot::channel();
        self.events.send(Event::Ask { remote, request, responder }).ok()?;
        answer.await.ok().flatten()
    }

    fn ask_canceled(&self, remote: IpAddr) {
        let _ = self.events.send(Event::AskCanceled { remote });
    }

    async fn upload(&self, remote: IpAddr, body: BodyReceiver) -> bool {
        let (reply, done) = oneshot::channel();
        if self.events.send(Event::Upload { remote, body, reply }).is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Thumbnail,
    Asking,
    Uploading,
}

struct Outbound {
    peer_id: String,
    url: String,
    entities: Vec<Arc<dyn Entity>>,
    listener: Arc<dyn SendListener>,
    slot: CancelSlot,
    stage: Stage,
    bytes_total: Option<u64>,
    reported: Option<u64>,
}

struct Actor {
    shared: Weak<Shared>,
    outbound: HashMap<u64, Outbound>,
}

impl Actor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            let Some(shared) = self.shared.upgrade() else { break };
            self.handle(&shared, event);
        }
        for (_, ob) in self.outbound.drain() {
            ob.slot.cancel();
        }
        tracing::debug!("manager loop exited");
    }

    fn handle(&mut self, shared: &Arc<Shared>, event: Event) {
        match event {
            Event::ServiceResolved { id, url } => self.on_service_resolved(shared, id, url),
            Event::ServiceLost { id } => self.on_service_lost(shared, &id),
            Event::PeerDiscovered { id, url, result } => self.on_peer_discovered(shared, id, url, result),
            Event::Send { peer_id, entities, listener, reply } => {
                let result = self.on_send(shared, peer_id, entities, listener);
                if let Err(e) = &result {
                    tracing::info!(error = %e, "send refused");
                }
                // The caller may have stopped waiting; a dropped session is simply never cancelled.
                let _ = reply.send(result);
            }
            Event::ThumbnailReady { send_id, icon } => self.on_thumbnail_ready(shared, send_id, icon),
            Event::AskFinished { send_id, result } => self.on_ask_finished(shared, send_id, result),
            Event::SendProgress { send_id, bytes_sent } => self.on_send_progress(shared, send_id, bytes_sent),
            Event::PackFailed { send_id, error } => self.on_pack_failed(shared, send_id, error),
            Event::UploadFinished { send_id, result } => self.on_upload_finished(shared, send_id, result),
            Event::SendCanceled { send_id } => self.on_send_canceled(shared, send_id),
            Event::Ask { remote, request, responder } => self.on_ask(shared, remote, request, responder),
            Event::AskCanceled { remote } => self.on_ask_canceled(shared, remote),
            Event::Upload { remote, body, reply } => self.on_upload(shared, remote, body, reply),
            Event::ReceiveProgress { session, path, received, total, index, count } => {
                if !shared.is_current(&session) || session.state() != ReceiveState::Transferring || index >= count {
                    return;
                }
                if let Some(listener) = shared.receiver() {
                    listener.on_transfer_progress(&session, &path, received, total, index, count);
                }
            }
            Event::ReceiveFinished { session, result, reply } => self.on_receive_finished(shared, session, result, reply),
            Event::SessionClosed { session_id, remote } => {
                let mut sessions = shared.sessions.write();
                if sessions.get(&remote).is_some_and(|s| s.id() == session_id) {
                    sessions.remove(&remote);
                }
            }
            Event::Shutdown => {}
        }
    }

    // --- discovery ---

    fn on_service_resolved(&mut self, shared: &Arc<Shared>, id: String, url: String) {
        tracing::debug!(peer = %id, url = %url, "service resolved");
        let transport = shared.transport.clone();
        let events = shared.events.clone();
        tokio::spawn(async move {
            let target = format!("{url}{}", routes::DISCOVER);
            let result = transport.post_dictionary(&target, Dictionary::new()).await;
            let _ = events.send(Event::PeerDiscovered { id, url, result });
        });
    }

    fn on_peer_discovered(
        &mut self,
        shared: &Arc<Shared>,
        id: String,
        url: String,
        result: Result<Dictionary, TransportError>,
    ) {
        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(peer = %id, error = %e, "discover handshake failed");
                return;
            }
        };
        let Some(resp) = DiscoverResponse::from_dictionary(&answer) else {
            tracing::warn!(peer = %id, "discover answer carries no name");
            return;
        };
        let known = shared.directory.get(&id).is_some();
        let peer = Peer::AirDrop(AirDropPeer::from_discover(&id, &url, resp));
        shared.directory.upsert(peer.clone());
        if known {
            tracing::debug!(peer = %id, "peer updated");
            return;
        }
        tracing::info!(peer = %id, name = %peer.name(), "peer found");
        let listener = shared.discover_listener.read().clone();
        if let Some(listener) = listener {
            listener.on_peer_found(&peer);
        }
    }

    fn on_service_lost(&mut self, shared: &Arc<Shared>, id: &str) {
        let Some(peer) = shared.directory.remove(id) else { return };
        tracing::info!(peer = %id, name = %peer.name(), "peer lost");
        let listener = shared.discover_listener.read().clone();
        if let Some(listener) = listener {
            listener.on_peer_lost(&peer);
        }
    }

    // --- outbound ---

    fn on_send(
        &mut self,
        shared: &Arc<Shared>,
        peer_id: String,
        entities: Vec<Arc<dyn Entity>>,
        listener: Arc<dyn SendListener>,
    ) -> Result<SendingSession, SendError> {
        let status = environment::ready(shared.environment.as_ref());
        if status != ReadyStatus::Ok {
            return Err(SendError::NotReady(status));
        }
        if entities.is_empty() {
            return Err(SendError::NoEntities);
        }
        let Peer::AirDrop(peer) = shared.directory.get(&peer_id).ok_or(SendError::UnknownPeer)? else {
            return Err(SendError::Unsupported);
        };
        // A peer that was lost and re-resolved mid-send comes back Idle.
        if peer.status.state.is_busy() || self.sending_to(&peer.id) {
            return Err(SendError::Busy);
        }

        let bytes_total = entities.iter().map(|e| e.size()).sum::<Option<u64>>();
        shared.directory.update_status(&peer.id, |s| {
            *s = PeerStatus { state: TransferState::AwaitingConfirmation, bytes_sent: 0, bytes_total }
        });
        let send_id = shared.next_id();
        let slot = CancelSlot::default();
        let wants_thumbnail = entities[0].mime_type().starts_with("image/");
        tracing::info!(peer = %peer.id, send = send_id, files = entities.len(), bytes = ?bytes_total, "asking to send");
        shared.journal.send_started(&peer.id, entities.len(), bytes_total);

        self.outbound.insert(
            send_id,
            Outbound {
                peer_id: peer.id,
                url: peer.url,
                entities,
                listener,
                slot: slot.clone(),
                stage: Stage::Thumbnail,
                bytes_total,
                reported: None,
            },
        );
        if wants_thumbnail {
            self.start_thumbnail(shared, send_id);
        } else {
            self.start_ask(shared, send_id, None);
        }
        Ok(SendingSession::new(send_id, slot, shared.events.clone()))
    }

    fn sending_to(&self, peer_id: &str) -> bool {
        self.outbound.values().any(|ob| ob.peer_id == peer_id && !ob.slot.is_canceled())
    }

    /// Outbound send that is still live, i.e. present and not cancelled.
    fn live(&mut self, send_id: u64) -> Option<&mut Outbound> {
        self.outbound.get_mut(&send_id).filter(|ob| !ob.slot.is_canceled())
    }

    fn take_live(&mut self, send_id: u64) -> Option<Outbound> {
        self.live(send_id)?;
        self.outbound.remove(&send_id)
    }

    fn start_thumbnail(&mut self, shared: &Arc<Shared>, send_id: u64) {
        let Some(ob) = self.live(send_id) else { return };
        let entity = ob.entities[0].clone();
        let events = shared.events.clone();
        shared.pool.spawn(move || {
            let icon = entity.thumbnail();
            let _ = events.send(Event::ThumbnailReady { send_id, icon });
        });
        let events = shared.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeouts::THUMBNAIL_MS)).await;
            let _ = events.send(Event::ThumbnailReady { send_id, icon: None });
        });
    }

    fn on_thumbnail_ready(&mut self, shared: &Arc<Shared>, send_id: u64, icon: Option<Vec<u8>>) {
        match self.live(send_id) {
            Some(ob) if ob.stage == Stage::Thumbnail => {}
            _ => return,
        }
        if icon.is_none() {
            tracing::debug!(send = send_id, "asking without icon");
        }
        self.start_ask(shared, send_id, icon);
    }

    fn start_ask(&mut self, shared: &Arc<Shared>, send_id: u64, icon: Option<Vec<u8>>) {
        let Some(ob) = self.live(send_id) else { return };
        ob.stage = Stage::Asking;
        let body = AskRequest::new(&shared.config.id, &shared.name, &ob.entities, icon).to_dictionary();
        let url = format!("{}{}", ob.url, routes::ASK);
        let transport = shared.transport.clone();
        let events = shared.events.clone();
        let armed = ob.slot.arm(|| {
            let call = Call::spawn(async move { transport.post_dictionary(&url, body).await });
            let handle = call.abort_handle();
            tokio::spawn(async move {
                let result = call.await;
                let _ = events.send(Event::AskFinished { send_id, result });
            });
            handle
        });
        if !armed {
            tracing::debug!(send = send_id, "ask suppressed by cancel");
        }
    }

    fn on_ask_finished(&mut self, shared: &Arc<Shared>, send_id: u64, result: Result<Dictionary, TransportError>) {
        match result {
            Err(e) if e.is_cancelled() => {}
            Ok(_) => {
                let Some(ob) = self.live(send_id) else { return };
                tracing::info!(peer = %ob.peer_id, send = send_id, "ask accepted");
                shared.directory.update_status(&ob.peer_id, |s| s.state = TransferState::Sending);
                ob.listener.on_accepted();
                self.start_upload(shared, send_id);
            }
            Err(e) => {
                let Some(ob) = self.take_live(send_id) else { return };
                ob.slot.finish();
                tracing::info!(peer = %ob.peer_id, send = send_id, error = %e, "ask rejected");
                shared.directory.update_status(&ob.peer_id, |s| s.state = TransferState::Rejected);
                shared.journal.send_rejected(&ob.peer_id);
                ob.listener.on_rejected();
            }
        }
    }

    fn start_upload(&mut self, shared: &Arc<Shared>, send_id: u64) {
        let Some(ob) = self.live(send_id) else { return };
        ob.stage = Stage::Uploading;
        let (tx, body) = pipe::channel();
        let url = format!("{}{}", ob.url, routes::UPLOAD);
        let transport = shared.transport.clone();
        let events = shared.events.clone();
        let armed = ob.slot.arm(|| {
            let call = Call::spawn(async move { transport.post_stream(&url, body).await });
            let handle = call.abort_handle();
            tokio::spawn(async move {
                let result = call.await;
                let _ = events.send(Event::UploadFinished { send_id, result });
            });
            handle
        });
        if !armed {
            return;
        }
        let entities = ob.entities.clone();
        let total = ob.bytes_total;
        let events = shared.events.clone();
        shared.pool.spawn(move || pack_upload(send_id, &entities, total, tx, &events));
    }

    fn on_send_progress(&mut self, shared: &Arc<Shared>, send_id: u64, bytes_sent: u64) {
        let Some(ob) = self.live(send_id) else { return };
        let Some(total) = ob.bytes_total else { return };
        if ob.stage != Stage::Uploading {
            return;
        }
        let sent = bytes_sent.min(total);
        if ob.reported.is_some_and(|r| sent <= r) {
            return;
        }
        ob.reported = Some(sent);
        shared.directory.update_status(&ob.peer_id, |s| s.bytes_sent = sent);
        ob.listener.on_progress(sent, total);
    }

    fn on_pack_failed(&mut self, shared: &Arc<Shared>, send_id: u64, error: io::Error) {
        let Some(ob) = self.take_live(send_id) else { return };
        // Tears down the upload; its cancelled result is ignored.
        ob.slot.cancel();
        self.fail_send(shared, ob, &format!("packing failed: {error}"));
    }

    fn on_upload_finished(&mut self, shared: &Arc<Shared>, send_id: u64, result: Result<(), TransportError>) {
        if matches!(&result, Err(e) if e.is_cancelled()) {
            return;
        }
        let Some(ob) = self.take_live(send_id) else { return };
        ob.slot.finish();
        match result {
            Ok(()) => {
                let bytes = ob.bytes_total.or(ob.reported).unwrap_or(0);
                tracing::info!(peer = %ob.peer_id, send = send_id, bytes, "sent");
                shared.directory.update_status(&ob.peer_id, |s| {
                    s.state = TransferState::Sent;
                    if let Some(total) = s.bytes_total {
                        s.bytes_sent = total;
                    }
                });
                shared.journal.send_done(&ob.peer_id, bytes);
                ob.listener.on_sent();
            }
            Err(e) => self.fail_send(shared, ob, &e.to_string()),
        }
    }

    fn fail_send(&mut self, shared: &Arc<Shared>, ob: Outbound, msg: &str) {
        tracing::warn!(peer = %ob.peer_id, error = %msg, "send failed");
        shared.directory.update_status(&ob.peer_id, |s| s.state = TransferState::Failed);
        shared.journal.send_failed(&ob.peer_id, msg);
        ob.listener.on_send_failed();
    }

    fn on_send_canceled(&mut self, shared: &Arc<Shared>, send_id: u64) {
        let Some(ob) = self.outbound.remove(&send_id) else { return };
        tracing::info!(peer = %ob.peer_id, send = send_id, stage = ?ob.stage, "send canceled");
        if !self.sending_to(&ob.peer_id) {
            shared.directory.update_status(&ob.peer_id, |s| *s = PeerStatus::default());
        }
        shared.journal.send_canceled(&ob.peer_id);
    }

    // --- inbound ---

    fn on_ask(
        &mut self,
        shared: &Arc<Shared>,
        remote: IpAddr,
        request: AskRequest,
        responder: oneshot::Sender<Option<Dictionary>>,
    ) {
        let Some(listener) = shared.receiver() else {
            tracing::info!(remote = %remote, "no receiver registered; refusing ask");
            let _ = responder.send(None);
            return;
        };
        let accept = AskResponse {
            model_name: shared.config.model_name.clone(),
            computer_name: shared.name.clone(),
        }
        .to_dictionary();
        let session = Arc::new(ReceivingSession::new(
            shared.next_id(),
            remote,
            request,
            responder,
            accept,
            shared.events.clone(),
        ));
        tracing::info!(
            remote = %remote,
            sender = %session.sender_name(),
            files = session.files().len(),
            "incoming request"
        );
        let replaced = shared.sessions.write().insert(remote, session.clone());
        if let Some(old) = replaced {
            tracing::warn!(remote = %remote, replaced = old.id(), "new ask from the same address replaces pending session");
        }
        listener.on_request(session);
    }

    fn on_ask_canceled(&mut self, shared: &Arc<Shared>, remote: IpAddr) {
        let session = shared.sessions.read().get(&remote).cloned();
        let Some(session) = session else { return };
        // A newer ask from the same address is still connected; leave it alone.
        if !session.is_orphaned() || !session.abandon() {
            return;
        }
        shared.forget(&session);
        tracing::info!(remote = %remote, sender = %session.sender_name(), "request withdrawn");
        if let Some(listener) = shared.receiver() {
            listener.on_request_canceled(&session);
        }
    }

    fn on_upload(&mut self, shared: &Arc<Shared>, remote: IpAddr, body: BodyReceiver, reply: oneshot::Sender<bool>) {
        let session = shared.sessions.read().get(&remote).cloned();
        let (Some(session), Some(listener)) = (session, shared.receiver()) else {
            tracing::warn!(remote = %remote, "upload without a pending request");
            let _ = reply.send(false);
            return;
        };
        if !session.begin_transfer() {
            tracing::warn!(remote = %remote, state = ?session.state(), "upload for a request that was not accepted");
            let _ = reply.send(false);
            return;
        }
        tracing::info!(remote = %remote, files = session.files().len(), "receiving");
        let events = shared.events.clone();
        shared.pool.spawn(move || {
            let result = unpack_upload(&session, listener.as_ref(), body, &events);
            let _ = events.send(Event::ReceiveFinished { session, result, reply });
        });
    }

    fn on_receive_finished(
        &mut self,
        shared: &Arc<Shared>,
        session: Arc<ReceivingSession>,
        result: io::Result<()>,
        reply: oneshot::Sender<bool>,
    ) {
        let ok = result.is_ok();
        if session.complete(ok) {
            let listener = shared.receiver();
            if ok {
                tracing::info!(remote = %session.remote(), files = session.files().len(), "receive done");
                shared.journal.receive_done(session.remote(), session.sender_name(), session.files().len());
                if let Some(listener) = listener {
                    listener.on_transfer_done(&session);
                }
            } else {
                if let Err(e) = &result {
                    tracing::warn!(remote = %session.remote(), error = %e, "receive failed");
                }
                shared.journal.receive_failed(session.remote(), session.sender_name());
                if let Some(listener) = listener {
                    listener.on_transfer_failed(&session);
                }
            }
        } else {
            tracing::debug!(remote = %session.remote(), "receive ended after cancel");
        }
        shared.forget(&session);
        let _ = reply.send(session.state() == ReceiveState::Done);
    }
}

/// Pack `entities` into the upload pipe. Runs on an archive worker.
fn pack_upload(
    send_id: u64,
    entities: &[Arc<dyn Entity>],
    total: Option<u64>,
    tx: BodySender,
    events: &mpsc::UnboundedSender<Event>,
) {
    let interval = Duration::from_millis(limits::PROGRESS_INTERVAL_MS);
    let mut writer = ChannelWriter::new(tx);
    let mut sent = 0u64;
    let mut last = Instant::now();
    let mut on_read = |n: u64| {
        sent += n;
        if total.is_some() && last.elapsed() >= interval {
            last = Instant::now();
            let _ = events.send(Event::SendProgress { send_id, bytes_sent: sent });
        }
    };
    match archive::pack(entities, &mut writer, &mut on_read).and_then(|w| w.flush()) {
        Ok(()) => {
            if total.is_some() {
                let _ = events.send(Event::SendProgress { send_id, bytes_sent: sent });
            }
            // Dropping the writer ends the body.
            drop(writer);
        }
        Err(e) => {
            writer.fail(io::Error::new(e.kind(), e.to_string()));
            let _ = events.send(Event::PackFailed { send_id, error: e });
        }
    }
}

/// Unpack an upload body through the listener. Runs on an archive worker.
fn unpack_upload(
    session: &Arc<ReceivingSession>,
    listener: &dyn ReceiverListener,
    body: BodyReceiver,
    events: &mpsc::UnboundedSender<Event>,
) -> io::Result<()> {
    let interval = Duration::from_millis(limits::PROGRESS_INTERVAL_MS);
    let mut reader = ChannelReader::new(body, session.token());
    let allowed: HashSet<String> = session.paths().into_iter().map(str::to_string).collect();
    let count = session.files().len();
    let mut index = 0usize;
    archive::unpack(&mut reader, &allowed, |path, size, input| {
        let current = index;
        index += 1;
        let report = |received: u64| {
            let _ = events.send(Event::ReceiveProgress {
                session: session.clone(),
                path: path.to_string(),
                received,
                total: size,
                index: current,
                count,
            });
        };
        let mut received = 0u64;
        let mut last = Instant::now();
        let mut counted = CountingReader::new(input, |n| {
            received += n;
            if last.elapsed() >= interval {
                last = Instant::now();
                report(received);
            }
        });
        listener.on_transfer(session, path, size, &mut counted)?;
        drop(counted);
        report(received);
        Ok(())
    })?;
    // Senders pad the stream past the archive trailer.
    io::copy(&mut reader, &mut io::sink())?;
    Ok(())
}

/// Entry point of the subsystem. Build one per process inside a tokio runtime.
pub struct AirDropManager {
    shared: Arc<Shared>,
}

pub struct Builder {
    config: Config,
    environment: Option<Arc<dyn Environment>>,
    transport: Option<Arc<dyn Transport>>,
    journal: Option<Arc<dyn Logger>>,
    receiver: Option<Arc<dyn ReceiverListener>>,
    directory: Option<Arc<PeerDirectory>>,
}

impl Builder {
    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn journal(mut self, journal: Arc<dyn Logger>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn receiver_listener(mut self, listener: Arc<dyn ReceiverListener>) -> Self {
        self.receiver = Some(listener);
        self
    }

    /// Share a directory with other peer sources.
    pub fn directory(mut self, directory: Arc<PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn build(self) -> Result<AirDropManager> {
        let runtime = Handle::try_current().context("AirDropManager must be built inside a tokio runtime")?;
        let config = self.config;
        anyhow::ensure!(!config.id.is_empty(), "config has no device id");

        let workers = match config.archive_workers {
            0 => num_cpus::get().clamp(1, 4),
            n => n,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("archive-{i}"))
            .build()
            .context("failed to build archive pool")?;

        let name = config.device_name();
        let discover = DiscoverResponse { computer_name: name.clone(), capabilities: Some(messages::own_capabilities()) }
            .to_dictionary()
            .context("encode discover answer")?;
        let (events, rx) = mpsc::unbounded_channel();
        let environment = self.environment.unwrap_or_else(|| {
            Arc::new(HostEnvironment::new(config.interfaces.clone(), config.bluetooth)) as Arc<dyn Environment>
        });

        let shared = Arc::new(Shared {
            name,
            environment,
            transport: self.transport.unwrap_or_else(client::default_transport),
            journal: self.journal.unwrap_or_else(|| Arc::new(NoopLogger)),
            directory: self.directory.unwrap_or_default(),
            handler: Arc::new(InboundHandler { events: events.clone(), discover }),
            events,
            pool: Arc::new(pool),
            receiver: RwLock::new(self.receiver),
            discover_listener: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            nsd: Mutex::new(None),
            server: Mutex::new(None),
            tls: Mutex::new(None),
            next_id: AtomicU64::new(1),
            config,
        });
        let actor = Actor { shared: Arc::downgrade(&shared), outbound: HashMap::new() };
        runtime.spawn(actor.run(rx));
        tracing::debug!(id = %shared.config.id, name = %shared.name, workers, "manager started");
        Ok(AirDropManager { shared })
    }
}

impl AirDropManager {
    pub fn builder(config: Config) -> Builder {
        Builder { config, environment: None, transport: None, journal: None, receiver: None, directory: None }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Name advertised to peers.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn ready(&self) -> ReadyStatus {
        environment::ready(self.shared.environment.as_ref())
    }

    fn ensure_ready(&self) -> Result<LocalInterface, StartError> {
        match self.ready() {
            ReadyStatus::Ok => {}
            status => return Err(StartError::NotReady(status)),
        }
        self.shared
            .environment
            .local_interface()
            .ok_or(StartError::NotReady(ReadyStatus::NoWifi))
    }

    fn with_nsd(&self, address: IpAddr, f: impl FnOnce(&NsdController)) -> Result<(), StartError> {
        let mut guard = self.shared.nsd.lock();
        if guard.is_none() {
            let lock = self.shared.environment.multicast_lock();
            let controller =
                NsdController::new(&self.shared.config.id, address, lock).context("failed to start mdns worker")?;
            *guard = Some(controller);
        }
        if let Some(nsd) = guard.as_ref() {
            f(nsd);
        }
        Ok(())
    }

    /// Browse for peers. Found peers are verified with a `/Discover` call first.
    pub fn start_discover(&self, listener: Arc<dyn DiscoverListener>) -> Result<(), StartError> {
        let interface = self.ensure_ready()?;
        self.shared.transport.set_interface(Some(interface.clone()));
        *self.shared.discover_listener.write() = Some(listener);
        let events = self.shared.events.clone();
        let sink: EventSink = Arc::new(move |event| {
            let event = match event {
                DiscoveryEvent::Resolved { id, url } => Event::ServiceResolved { id, url },
                DiscoveryEvent::Lost { id } => Event::ServiceLost { id },
            };
            let _ = events.send(event);
        });
        self.with_nsd(interface.address, |nsd| nsd.start_discover(sink))
    }

    pub fn stop_discover(&self) {
        *self.shared.discover_listener.write() = None;
        if let Some(nsd) = self.shared.nsd.lock().as_ref() {
            nsd.stop_discover();
        }
    }

    fn server_tls(&self) -> Result<Arc<rustls::ServerConfig>, StartError> {
        let mut cached = self.shared.tls.lock();
        if let Some(config) = cached.as_ref() {
            return Ok(config.clone());
        }
        let identity =
            tls::load_or_generate_server_config(self.shared.config.tls_cert.clone(), self.shared.config.tls_key.clone())?;
        tracing::info!(fingerprint = %identity.fingerprint, "server certificate loaded");
        Ok(cached.insert(identity.config).clone())
    }

    /// Serve `/Discover`, `/Ask` and `/Upload` and advertise the service.
    pub async fn start_discoverable(&self) -> Result<SocketAddr, StartError> {
        let interface = self.ensure_ready()?;
        let addr = match self.local_addr() {
            Some(addr) => addr,
            None => {
                let tls = self.server_tls()?;
                let bind = SocketAddr::new(self.shared.config.bind, self.shared.config.port);
                let server = AirDropServer::start(bind, tls, self.request_handler()).await?;
                // A concurrent start may have won; the loser is dropped and stops.
                self.shared.server.lock().get_or_insert(server).local_addr()
            }
        };
        self.with_nsd(interface.address, |nsd| nsd.publish(addr.port()))?;
        Ok(addr)
    }

    pub fn stop_discoverable(&self) {
        if let Some(nsd) = self.shared.nsd.lock().as_ref() {
            nsd.unpublish();
        }
        let server = self.shared.server.lock().take();
        if let Some(server) = server {
            server.stop();
        }
    }

    /// Feed a resolved service in, as discovery would. Useful when peers are known
    /// out of band.
    pub fn resolve_service(&self, id: &str, url: &str) {
        let _ = self.shared.events.send(Event::ServiceResolved { id: id.to_string(), url: url.to_string() });
    }

    pub fn lose_service(&self, id: &str) {
        let _ = self.shared.events.send(Event::ServiceLost { id: id.to_string() });
    }

    /// Ask `peer_id` to accept `entities`, then upload them. Outcomes arrive on `listener`.
    pub async fn send(
        &self,
        peer_id: &str,
        entities: Vec<Arc<dyn Entity>>,
        listener: Arc<dyn SendListener>,
    ) -> Result<SendingSession, SendError> {
        let (reply, answer) = oneshot::channel();
        self.shared
            .events
            .send(Event::Send { peer_id: peer_id.to_string(), entities, listener, reply })
            .map_err(|_| SendError::Shutdown)?;
        answer.await.map_err(|_| SendError::Shutdown)?
    }

    pub fn receiving_session(&self, remote: IpAddr) -> Option<Arc<ReceivingSession>> {
        self.shared.sessions.read().get(&remote).cloned()
    }

    pub fn receiving_sessions(&self) -> Vec<Arc<ReceivingSession>> {
        self.shared.sessions.read().values().cloned().collect()
    }

    /// The handler the transfer server drives, for embedding behind another server.
    pub fn request_handler(&self) -> Arc<dyn RequestHandler> {
        self.shared.handler.clone()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.shared.directory
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.shared.directory.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.directory.subscribe()
    }

    pub fn set_receiver_listener(&self, listener: Option<Arc<dyn ReceiverListener>>) {
        *self.shared.receiver.write() = listener;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.server.lock().as_ref().map(AirDropServer::local_addr)
    }

    /// Stop everything and wait for the discovery worker to drain.
    pub async fn destroy(self) {
        self.stop_discover();
        self.stop_discoverable();
        let nsd = self.shared.nsd.lock().take();
        if let Some(mut nsd) = nsd {
            if tokio::task::spawn_blocking(move || nsd.destroy()).await.is_err() {
                tracing::error!("discovery teardown panicked");
            }
        }
        let _ = self.shared.events.send(Event::Shutdown);
    }
}
