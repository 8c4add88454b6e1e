use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use airshare::cli::{Args, Command};
use airshare::config::{self, Config};
use airshare::directory::PeerEvent;
use airshare::entity::entities_from_paths;
use airshare::listener::{save_to_dir, DiscoverListener, ReceiverListener, SendListener};
use airshare::logger::TextLogger;
use airshare::progress::TransferProgress;
use airshare::session::ReceivingSession;
use airshare::{tls, AirDropManager, Peer};

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();

    let path = args.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = Config::load_or_init(&path).context("Failed to load config")?;
    args.apply(&mut cfg);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match args.command.clone() {
        Command::Id => show_id(&cfg),
        Command::Discover { timeout } => rt.block_on(discover(&args, cfg, timeout)),
        Command::Send { to, timeout, paths } => rt.block_on(send(&args, cfg, &to, timeout, paths)),
        Command::Receive { accept_all, .. } => rt.block_on(receive(&args, cfg, accept_all)),
    }
}

fn show_id(cfg: &Config) -> Result<()> {
    let identity = tls::load_or_generate_server_config(cfg.tls_cert.clone(), cfg.tls_key.clone())
        .context("Failed to set up TLS configuration")?;
    println!("id:          {}", cfg.id);
    println!("name:        {}", cfg.device_name());
    println!("port:        {}", cfg.port);
    println!("fingerprint: {}", identity.fingerprint);
    Ok(())
}

fn build_manager(args: &Args, cfg: Config, receiver: Option<Arc<dyn ReceiverListener>>) -> Result<AirDropManager> {
    let mut builder = AirDropManager::builder(cfg);
    if let Some(path) = &args.log_file {
        builder = builder.journal(Arc::new(TextLogger::new(path)?));
    }
    if let Some(receiver) = receiver {
        builder = builder.receiver_listener(receiver);
    }
    builder.build()
}

fn describe(peer: &Peer) -> String {
    match peer {
        Peer::AirDrop(p) => {
            let vendor = if p.vendor_api_version() > 0 { " (airshare)" } else { "" };
            format!("{:<14} {}  {}{}", p.id, p.name, p.url, vendor)
        }
        Peer::NearShare(p) => format!("{:<14} {}  (nearby share)", p.id, p.name),
    }
}

struct PrintPeers;

impl DiscoverListener for PrintPeers {
    fn on_peer_found(&self, peer: &Peer) {
        println!("+ {}", describe(peer));
    }
    fn on_peer_lost(&self, peer: &Peer) {
        println!("- {}", describe(peer));
    }
}

struct Quiet;
impl DiscoverListener for Quiet {}

async fn discover(args: &Args, cfg: Config, timeout: u64) -> Result<()> {
    let manager = build_manager(args, cfg, None)?;
    manager.start_discover(Arc::new(PrintPeers))?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(timeout)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    manager.destroy().await;
    Ok(())
}

async fn wait_for_peer(
    manager: &AirDropManager,
    events: &mut broadcast::Receiver<PeerEvent>,
    key: &str,
    timeout: Duration,
) -> Result<Peer> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(peer) = manager.directory().find(key) {
            return Ok(peer);
        }
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("peer directory closed"),
            },
            _ = tokio::time::sleep_until(deadline) => bail!("no peer named {key} found within {}s", timeout.as_secs()),
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Rejected,
    Failed,
}

struct CliSendListener {
    progress: Arc<TransferProgress>,
    total: Option<u64>,
    outcome: mpsc::UnboundedSender<Outcome>,
}

impl SendListener for CliSendListener {
    fn on_accepted(&self) {
        self.progress.accepted(self.total);
    }
    fn on_rejected(&self) {
        self.progress.finish_error("declined by peer");
        let _ = self.outcome.send(Outcome::Rejected);
    }
    fn on_progress(&self, bytes_sent: u64, _bytes_total: u64) {
        self.progress.set_position(bytes_sent);
    }
    fn on_sent(&self) {
        self.progress.finish_success(self.total.unwrap_or(0));
        let _ = self.outcome.send(Outcome::Sent);
    }
    fn on_send_failed(&self) {
        self.progress.finish_error("transfer failed");
        let _ = self.outcome.send(Outcome::Failed);
    }
}

async fn send(args: &Args, cfg: Config, to: &str, timeout: u64, paths: Vec<PathBuf>) -> Result<()> {
    let entities = entities_from_paths(&paths)?;
    if entities.is_empty() {
        bail!("nothing to send");
    }
    let total = entities.iter().map(|e| e.size()).sum::<Option<u64>>();
    let manager = build_manager(args, cfg, None)?;

    let mut events = manager.subscribe();
    manager.start_discover(Arc::new(Quiet))?;
    let peer = match wait_for_peer(&manager, &mut events, to, Duration::from_secs(timeout)).await {
        Ok(peer) => peer,
        Err(e) => {
            manager.destroy().await;
            return Err(e);
        }
    };
    manager.stop_discover();

    let progress = Arc::new(TransferProgress::new());
    progress.print_line("Sending", &format!("{} file(s) to {}", entities.len(), peer.name()));
    progress.waiting(peer.name());
    let (tx, mut outcome) = mpsc::unbounded_channel();
    let listener = Arc::new(CliSendListener { progress: progress.clone(), total, outcome: tx });
    let session = manager.send(peer.id(), entities, listener).await?;

    let result = tokio::select! {
        o = outcome.recv() => o,
        _ = tokio::signal::ctrl_c() => {
            session.cancel();
            progress.finish_error("canceled");
            None
        }
    };
    manager.destroy().await;
    match result {
        Some(Outcome::Sent) | None => Ok(()),
        Some(Outcome::Rejected) => bail!("{} declined the transfer", peer.name()),
        Some(Outcome::Failed) => bail!("transfer to {} failed", peer.name()),
    }
}

struct CliReceiver {
    dir: PathBuf,
    accept_all: bool,
    prompts: mpsc::UnboundedSender<Arc<ReceivingSession>>,
    progress: Mutex<Option<TransferProgress>>,
}

impl CliReceiver {
    fn line(&self, label: &str, detail: &str) {
        match self.progress.lock().as_ref() {
            Some(p) => p.print_line(label, detail),
            None => println!("{label:>12} {detail}"),
        }
    }

    fn finish(&self) {
        if let Some(p) = self.progress.lock().take() {
            p.finish_quiet();
        }
    }
}

impl ReceiverListener for CliReceiver {
    fn on_request(&self, session: Arc<ReceivingSession>) {
        self.line(
            "Request",
            &format!("{} wants to send {}", session.sender_name(), session.paths().join(", ")),
        );
        if self.accept_all {
            session.accept();
        } else {
            let _ = self.prompts.send(session);
        }
    }

    fn on_request_canceled(&self, session: &Arc<ReceivingSession>) {
        self.line("Withdrawn", session.sender_name());
    }

    fn on_transfer(&self, session: &ReceivingSession, path: &str, _size: u64, input: &mut dyn Read) -> io::Result<()> {
        let dest = save_to_dir(&self.dir, session, path, input)?;
        self.line("Received", &dest.display().to_string());
        Ok(())
    }

    fn on_transfer_progress(
        &self,
        _session: &Arc<ReceivingSession>,
        path: &str,
        bytes_received: u64,
        bytes_total: u64,
        index: usize,
        count: usize,
    ) {
        let mut progress = self.progress.lock();
        let p = progress.get_or_insert_with(TransferProgress::new);
        p.set_status("Receiving", &format!("{path} ({}/{count}) {bytes_received}/{bytes_total} bytes", index + 1));
    }

    fn on_transfer_done(&self, session: &Arc<ReceivingSession>) {
        self.finish();
        self.line("Done", &format!("{} file(s) from {}", session.files().len(), session.sender_name()));
    }

    fn on_transfer_failed(&self, session: &Arc<ReceivingSession>) {
        self.finish();
        self.line("Failed", &format!("transfer from {}", session.sender_name()));
    }
}

fn prompt(question: &str) -> io::Result<bool> {
    let mut out = io::stdout();
    write!(out, "{question} [y/N] ")?;
    out.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn receive(args: &Args, cfg: Config, accept_all: bool) -> Result<()> {
    let dir = cfg.download_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let (prompts, mut requests) = mpsc::unbounded_channel();
    let receiver = Arc::new(CliReceiver { dir: dir.clone(), accept_all, prompts, progress: Mutex::new(None) });
    let manager = build_manager(args, cfg, Some(receiver))?;

    let addr = manager.start_discoverable().await?;
    println!("Discoverable as {} on port {}; saving to {}", manager.name(), addr.port(), dir.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(session) = requests.recv() => {
                let question = format!("Accept {} file(s) from {}?", session.files().len(), session.sender_name());
                let accepted = tokio::task::spawn_blocking(move || prompt(&question)).await??;
                if accepted {
                    session.accept();
                } else {
                    session.reject();
                }
            }
        }
    }
    manager.destroy().await;
    Ok(())
}
