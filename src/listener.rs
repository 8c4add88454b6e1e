//! Callback surfaces for embedders
//!
//! Every callback except `ReceiverListener::on_transfer` runs on the manager's event
//! loop, one at a time. Callbacks must not block.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::peer::Peer;
use crate::session::ReceivingSession;

pub trait DiscoverListener: Send + Sync {
    fn on_peer_found(&self, _peer: &Peer) {}
    fn on_peer_lost(&self, _peer: &Peer) {}
}

pub trait SendListener: Send + Sync {
    fn on_accepted(&self) {}
    fn on_rejected(&self) {}
    /// Only fired when the total size is known.
    fn on_progress(&self, _bytes_sent: u64, _bytes_total: u64) {}
    fn on_sent(&self) {}
    fn on_send_failed(&self) {}
}

pub trait ReceiverListener: Send + Sync {
    /// A peer asks to send. Answer through `session.accept()` / `reject()`, now or later.
    fn on_request(&self, _session: Arc<ReceivingSession>) {}
    /// The asking peer gave up before an answer was sent.
    fn on_request_canceled(&self, _session: &Arc<ReceivingSession>) {}
    /// Consume one file of an accepted upload. Runs on an archive worker thread; may
    /// leave bytes unread. An error fails the whole transfer.
    fn on_transfer(&self, session: &ReceivingSession, path: &str, size: u64, input: &mut dyn Read) -> io::Result<()>;
    fn on_transfer_progress(
        &self,
        _session: &Arc<ReceivingSession>,
        _path: &str,
        _bytes_received: u64,
        _bytes_total: u64,
        _index: usize,
        _count: usize,
    ) {
    }
    fn on_transfer_done(&self, _session: &Arc<ReceivingSession>) {}
    fn on_transfer_failed(&self, _session: &Arc<ReceivingSession>) {}
}

/// Write one received file to `dir` under the session's generated name.
/// Partial files are left in place on error.
pub fn save_to_dir(dir: &Path, session: &ReceivingSession, path: &str, input: &mut dyn Read) -> io::Result<PathBuf> {
    let name = session
        .file_name(path)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unexpected archive path {path}")))?;
    fs::create_dir_all(dir)?;
    let dest = dir.join(name);
    let mut out = fs::File::create(&dest)?;
    io::copy(input, &mut out)?;
    out.sync_all()?;
    Ok(dest)
}

/// Receiver that writes everything into one directory. Requests are left for the
/// embedder (or `auto_accept`) to answer.
pub struct SaveToDir {
    dir: PathBuf,
    auto_accept: bool,
}

impl SaveToDir {
    pub fn new(dir: impl Into<PathBuf>, auto_accept: bool) -> Self {
        Self { dir: dir.into(), auto_accept }
    }
}

impl ReceiverListener for SaveToDir {
    fn on_request(&self, session: Arc<ReceivingSession>) {
        if self.auto_accept {
            session.accept();
        }
    }

    fn on_transfer(&self, session: &ReceivingSession, path: &str, _size: u64, input: &mut dyn Read) -> io::Result<()> {
        let dest = save_to_dir(&self.dir, session, path, input)?;
        tracing::info!(file = %dest.display(), "received");
        Ok(())
    }
}
