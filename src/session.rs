//! Per-transfer state shared between the manager and the embedder

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use plist::Dictionary;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::manager::Event;
use crate::messages::{basename, AskRequest, FileDescriptor};

#[derive(Debug)]
enum SlotState {
    Idle,
    Armed(AbortHandle),
    Canceled,
    Finished,
}

/// Cancel handle exchanged as a send advances from ask to upload.
///
/// Arming and cancelling take the same lock, so a call armed after `cancel()` is never
/// started and a call armed before it is always aborted.
#[derive(Clone, Debug)]
pub struct CancelSlot(Arc<Mutex<SlotState>>);

impl Default for CancelSlot {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(SlotState::Idle)))
    }
}

impl CancelSlot {
    /// Run `start` and keep its handle, unless the slot was already cancelled or finished.
    pub fn arm(&self, start: impl FnOnce() -> AbortHandle) -> bool {
        let mut state = self.0.lock();
        match *state {
            SlotState::Canceled | SlotState::Finished => false,
            SlotState::Idle | SlotState::Armed(_) => {
                *state = SlotState::Armed(start());
                true
            }
        }
    }

    /// Abort the armed call. Returns false if the slot was already cancelled or finished.
    pub fn cancel(&self) -> bool {
        let mut state = self.0.lock();
        match std::mem::replace(&mut *state, SlotState::Canceled) {
            SlotState::Armed(handle) => {
                handle.abort();
                true
            }
            SlotState::Idle => true,
            SlotState::Canceled => false,
            SlotState::Finished => {
                *state = SlotState::Finished;
                false
            }
        }
    }

    pub fn finish(&self) {
        let mut state = self.0.lock();
        if !matches!(*state, SlotState::Canceled) {
            *state = SlotState::Finished;
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(*self.0.lock(), SlotState::Canceled)
    }
}

/// Handle returned by `AirDropManager::send`.
#[derive(Debug)]
pub struct SendingSession {
    id: u64,
    slot: CancelSlot,
    events: mpsc::UnboundedSender<Event>,
}

impl SendingSession {
    pub(crate) fn new(id: u64, slot: CancelSlot, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { id, slot, events }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop the send wherever it is. No further listener callbacks fire for it.
    pub fn cancel(&self) {
        if self.slot.cancel() {
            tracing::debug!(send = self.id, "send canceled");
            let _ = self.events.send(Event::SendCanceled { send_id: self.id });
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.slot.is_canceled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Requested,
    Accepted,
    Transferring,
    Done,
    Failed,
    Rejected,
    Canceled,
}

impl ReceiveState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceiveState::Done | ReceiveState::Failed | ReceiveState::Rejected | ReceiveState::Canceled
        )
    }
}

/// One inbound request, keyed by the sender's address.
pub struct ReceivingSession {
    id: u64,
    remote: IpAddr,
    sender_id: String,
    sender_name: String,
    files: Vec<FileDescriptor>,
    preview: Option<Vec<u8>>,
    file_names: HashMap<String, String>,
    state: Mutex<ReceiveState>,
    responder: Mutex<Option<oneshot::Sender<Option<Dictionary>>>>,
    accept_response: Dictionary,
    token: CancellationToken,
    events: mpsc::UnboundedSender<Event>,
}

impl std::fmt::Debug for ReceivingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivingSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("sender_id", &self.sender_id)
            .field("sender_name", &self.sender_name)
            .field("files", &self.files.len())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl ReceivingSession {
    pub(crate) fn new(
        id: u64,
        remote: IpAddr,
        request: AskRequest,
        responder: oneshot::Sender<Option<Dictionary>>,
        accept_response: Dictionary,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let millis = Utc::now().timestamp_millis();
        let file_names = request
            .files
            .iter()
            .map(|f| (f.path.clone(), format!("{}_{}_{}", request.sender_id, millis, basename(&f.path))))
            .collect();
        Self {
            id,
            remote,
            sender_id: request.sender_id,
            sender_name: request.sender_name,
            files: request.files,
            preview: request.icon,
            file_names,
            state: Mutex::new(ReceiveState::Requested),
            responder: Mutex::new(Some(responder)),
            accept_response,
            token: CancellationToken::new(),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn remote(&self) -> IpAddr {
        self.remote
    }
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }
    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }
    /// MIME types, one per requested file.
    pub fn types(&self) -> Vec<&'static str> {
        self.files.iter().map(FileDescriptor::mime_type).collect()
    }
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
    /// Icon bytes sent with the ask, as received.
    pub fn preview(&self) -> Option<&[u8]> {
        self.preview.as_deref()
    }
    /// Collision-avoiding local name generated for an archive path.
    pub fn file_name(&self, path: &str) -> Option<&str> {
        self.file_names.get(path).map(String::as_str)
    }
    pub fn state(&self) -> ReceiveState {
        *self.state.lock()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn respond(&self, answer: Option<Dictionary>) -> bool {
        match self.responder.lock().take() {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        let _ = self.events.send(Event::SessionClosed { session_id: self.id, remote: self.remote });
    }

    /// Answer the ask with this device's model and name. False if no longer pending.
    pub fn accept(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ReceiveState::Requested {
                return false;
            }
            *state = ReceiveState::Accepted;
        }
        if !self.respond(Some(self.accept_response.clone())) {
            tracing::warn!(remote = %self.remote, "accepted an ask whose sender already left");
        }
        true
    }

    /// Decline the ask. False if no longer pending.
    pub fn reject(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ReceiveState::Requested {
                return false;
            }
            *state = ReceiveState::Rejected;
        }
        self.respond(None);
        self.close();
        true
    }

    /// Abandon the session at any stage. A running transfer is aborted and reported
    /// neither as done nor as failed.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return false;
            }
            *state = ReceiveState::Canceled;
        }
        self.token.cancel();
        self.respond(None);
        self.close();
        true
    }

    /// Accepted → Transferring, as the upload arrives.
    pub(crate) fn begin_transfer(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ReceiveState::Accepted {
            return false;
        }
        *state = ReceiveState::Transferring;
        true
    }

    /// Transferring → Done/Failed. False when the session was cancelled meanwhile.
    pub(crate) fn complete(&self, ok: bool) -> bool {
        let mut state = self.state.lock();
        if *state != ReceiveState::Transferring {
            return false;
        }
        *state = if ok { ReceiveState::Done } else { ReceiveState::Failed };
        true
    }

    /// The `/Ask` connection this session answers has gone away.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.responder.lock().as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// The asking peer disconnected before an answer.
    pub(crate) fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ReceiveState::Requested {
            return false;
        }
        *state = ReceiveState::Canceled;
        self.responder.lock().take();
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::messages::AskResponse;

    pub(crate) fn session(
        files: &[&str],
    ) -> (Arc<ReceivingSession>, oneshot::Receiver<Option<Dictionary>>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = oneshot::channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let request = AskRequest {
            sender_id: "a1b2c3d4e5f6".into(),
            sender_name: "MacBook".into(),
            files: files
                .iter()
                .map(|p| FileDescriptor { name: basename(p).into(), file_type: "public.png".into(), path: p.to_string() })
                .collect(),
            icon: None,
        };
        let accept = AskResponse { model_name: "Android".into(), computer_name: "Phone".into() }.to_dictionary();
        let s = ReceivingSession::new(7, "10.0.0.5".parse().unwrap(), request, tx, accept, events);
        (Arc::new(s), rx, events_rx)
    }

    #[test]
    fn generated_names_use_sender_time_and_basename() {
        let (s, _rx, _ev) = session(&["./a/pic.png", "./b.png"]);
        let name = s.file_name("./a/pic.png").unwrap();
        let parts: Vec<&str> = name.splitn(3, '_').collect();
        assert_eq!(parts[0], "a1b2c3d4e5f6");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2], "pic.png");
        assert!(s.file_name("./other").is_none());
        assert_eq!(s.types(), vec!["image/png", "image/png"]);
    }

    #[test]
    fn accept_answers_once() {
        let (s, mut rx, _ev) = session(&["./x.png"]);
        assert!(s.accept());
        let answer = rx.try_recv().unwrap().unwrap();
        assert!(answer.get("ReceiverModelName").is_some());
        assert!(!s.accept());
        assert!(!s.reject());
        assert!(s.begin_transfer());
        assert!(s.complete(true));
        assert_eq!(s.state(), ReceiveState::Done);
    }

    #[test]
    fn reject_answers_none_and_closes() {
        let (s, mut rx, mut ev) = session(&["./x.png"]);
        assert!(s.reject());
        assert_eq!(rx.try_recv().unwrap(), None);
        assert!(matches!(ev.try_recv(), Ok(Event::SessionClosed { session_id: 7, .. })));
    }

    #[test]
    fn cancel_during_transfer_trips_token() {
        let (s, _rx, _ev) = session(&["./x.png"]);
        s.accept();
        s.begin_transfer();
        let token = s.token();
        assert!(s.cancel());
        assert!(token.is_cancelled());
        assert!(!s.complete(false));
        assert_eq!(s.state(), ReceiveState::Canceled);
        assert!(!s.cancel());
    }

    #[test]
    fn orphaned_once_asker_is_gone() {
        let (s, rx, _ev) = session(&["./x.png"]);
        assert!(!s.is_orphaned());
        drop(rx);
        assert!(s.is_orphaned());
        assert!(s.abandon());
        assert_eq!(s.state(), ReceiveState::Canceled);
        assert!(!s.accept());
    }

    #[tokio::test]
    async fn cancel_before_arm_prevents_start() {
        let slot = CancelSlot::default();
        assert!(slot.cancel());
        let mut started = false;
        let armed = slot.arm(|| {
            started = true;
            tokio::spawn(async {}).abort_handle()
        });
        assert!(!armed);
        assert!(!started);
        assert!(!slot.cancel());
    }

    #[tokio::test]
    async fn cancel_aborts_armed_call() {
        let slot = CancelSlot::default();
        let task = tokio::spawn(std::future::pending::<()>());
        let handle = task.abort_handle();
        assert!(slot.arm(move || handle));
        assert!(slot.cancel());
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn finished_slot_ignores_cancel() {
        let slot = CancelSlot::default();
        slot.arm(|| tokio::spawn(async {}).abort_handle());
        slot.finish();
        assert!(!slot.cancel());
        assert!(!slot.is_canceled());
        assert!(!slot.arm(|| tokio::spawn(async {}).abort_handle()));
    }
}
