use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use airshare::entity::entities_from_paths;
use airshare::environment::StaticEnvironment;
use airshare::listener::{ReceiverListener, SaveToDir, SendListener};
use airshare::peer::TransferState;
use airshare::session::ReceivingSession;
use airshare::{AirDropManager, Config};

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn loopback_config(tls_dir: &Path) -> Config {
    let mut cfg = Config::ephemeral();
    cfg.bind = "127.0.0.1".parse().unwrap();
    cfg.port = 0;
    cfg.tls_cert = Some(tls_dir.join("cert.pem"));
    cfg.tls_key = Some(tls_dir.join("key.pem"));
    cfg
}

fn build(cfg: Config, receiver: Option<Arc<dyn ReceiverListener>>) -> Result<AirDropManager> {
    let mut builder = AirDropManager::builder(cfg).environment(Arc::new(StaticEnvironment::loopback()));
    if let Some(receiver) = receiver {
        builder = builder.receiver_listener(receiver);
    }
    builder.build()
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Sent,
    Rejected,
    Failed,
}

struct Done(mpsc::UnboundedSender<Outcome>);

impl SendListener for Done {
    fn on_rejected(&self) {
        let _ = self.0.send(Outcome::Rejected);
    }
    fn on_sent(&self) {
        let _ = self.0.send(Outcome::Sent);
    }
    fn on_send_failed(&self) {
        let _ = self.0.send(Outcome::Failed);
    }
}

struct Decline;

impl ReceiverListener for Decline {
    fn on_request(&self, session: Arc<ReceivingSession>) {
        session.reject();
    }
    fn on_transfer(&self, _: &ReceivingSession, _: &str, _: u64, _: &mut dyn std::io::Read) -> std::io::Result<()> {
        Ok(())
    }
}

/// Point `sender` at `receiver`'s server and wait for the `/Discover` handshake.
async fn introduce(sender: &AirDropManager, receiver: &AirDropManager) -> Result<String> {
    let addr = receiver.local_addr().expect("receiver is serving");
    let id = receiver.config().id.clone();
    sender.resolve_service(&id, &format!("https://127.0.0.1:{}", addr.port()));
    for _ in 0..250u32 {
        if sender.directory().get(&id).is_some() {
            return Ok(id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("peer never appeared")
}

fn received_with_suffix(dir: &Path, suffix: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(suffix)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_send_receive_basic() -> Result<()> {
    let tls_tmp = tempfile::tempdir()?;
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;

    write_file(&src.path().join("a.txt"), 8 * 1024)?; // small
    write_file(&src.path().join("dir1/b.bin"), 256 * 1024)?; // medium
    write_file(&src.path().join("dir1/dir2/c.dat"), 1_100_000)?; // crosses 1MB

    let receiver = build(
        loopback_config(tls_tmp.path()),
        Some(Arc::new(SaveToDir::new(dst.path(), true))),
    )?;
    receiver.start_discoverable().await?;
    let sender = build(Config::ephemeral(), None)?;
    let peer_id = introduce(&sender, &receiver).await?;
    assert_eq!(sender.directory().get(&peer_id).map(|p| p.name().to_string()), Some(receiver.name().to_string()));

    let entities = entities_from_paths(&[src.path().join("a.txt"), src.path().join("dir1")])?;
    assert_eq!(entities.len(), 3);
    let (tx, mut outcome) = mpsc::unbounded_channel();
    sender.send(&peer_id, entities, Arc::new(Done(tx))).await?;
    let result = tokio::time::timeout(Duration::from_secs(30), outcome.recv()).await?;
    assert_eq!(result, Some(Outcome::Sent));
    assert_eq!(
        sender.directory().get(&peer_id).map(|p| p.status().state),
        Some(TransferState::Sent)
    );

    for (name, original) in [
        ("_a.txt", src.path().join("a.txt")),
        ("_b.bin", src.path().join("dir1/b.bin")),
        ("_c.dat", src.path().join("dir1/dir2/c.dat")),
    ] {
        let got = received_with_suffix(dst.path(), name).unwrap_or_else(|| panic!("{name} missing"));
        assert_eq!(std::fs::read(got)?, std::fs::read(original)?, "{name} differs");
    }
    assert!(receiver.receiving_sessions().is_empty());

    sender.destroy().await;
    receiver.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_declined_request_is_reported() -> Result<()> {
    let tls_tmp = tempfile::tempdir()?;
    let src = tempfile::tempdir()?;
    write_file(&src.path().join("a.txt"), 1024)?;

    let receiver = build(loopback_config(tls_tmp.path()), Some(Arc::new(Decline)))?;
    receiver.start_discoverable().await?;
    let sender = build(Config::ephemeral(), None)?;
    let peer_id = introduce(&sender, &receiver).await?;

    let (tx, mut outcome) = mpsc::unbounded_channel();
    sender
        .send(&peer_id, entities_from_paths(&[src.path().join("a.txt")])?, Arc::new(Done(tx)))
        .await?;
    let result = tokio::time::timeout(Duration::from_secs(30), outcome.recv()).await?;
    assert_eq!(result, Some(Outcome::Rejected));
    assert_eq!(
        sender.directory().get(&peer_id).map(|p| p.status().state),
        Some(TransferState::Rejected)
    );

    sender.destroy().await;
    receiver.destroy().await;
    Ok(())
}
