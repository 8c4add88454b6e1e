//! mDNS publish/browse on a dedicated worker thread
//!
//! The responder is only ever touched from the worker. Every public call enqueues a
//! command, so start/stop pairs are serialized and teardown drains what came before.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::environment::MulticastLock;
use crate::protocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer other than ourselves resolved to an IPv4 URL.
    Resolved { id: String, url: String },
    Lost { id: String },
}

pub type EventSink = Arc<dyn Fn(DiscoveryEvent) + Send + Sync>;

enum Command {
    StartDiscover { sink: EventSink },
    StopDiscover,
    Publish { port: u16 },
    Unpublish,
    Destroy,
}

/// Instance label of a full service name (`<id>._airdrop._tcp.local.`).
pub fn instance_id(fullname: &str) -> &str {
    let suffix = format!(".{}", protocol::SERVICE_TYPE);
    fullname.strip_suffix(suffix.as_str()).unwrap_or(fullname)
}

/// `https://<ipv4>:<port>` from the lowest IPv4 address. IPv6-only services give `None`.
pub fn peer_url<'a>(addrs: impl IntoIterator<Item = &'a IpAddr>, port: u16) -> Option<String> {
    addrs
        .into_iter()
        .filter_map(|a| match a {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .min()
        .map(|v4| format!("https://{v4}:{port}"))
}

/// Map a resolution to an event; ourselves and IPv6-only services map to nothing.
pub fn resolve_event<'a>(
    local_id: &str,
    fullname: &str,
    addrs: impl IntoIterator<Item = &'a IpAddr>,
    port: u16,
) -> Option<DiscoveryEvent> {
    let id = instance_id(fullname);
    if id == local_id {
        return None;
    }
    match peer_url(addrs, port) {
        Some(url) => Some(DiscoveryEvent::Resolved { id: id.to_string(), url }),
        None => {
            tracing::warn!(peer = %id, "dropping service without an IPv4 address");
            None
        }
    }
}

struct Worker {
    local_id: String,
    address: IpAddr,
    lock: Box<dyn MulticastLock>,
    daemon: Option<ServiceDaemon>,
    browsing: Option<Arc<AtomicBool>>,
    published: Option<String>,
}

impl Worker {
    fn daemon(&mut self) -> Option<&ServiceDaemon> {
        if self.daemon.is_none() {
            match ServiceDaemon::new() {
                Ok(daemon) => {
                    if let Err(e) = daemon.disable_interface(IfKind::All) {
                        tracing::warn!(error = %e, "failed narrowing mdns interfaces");
                    }
                    if let Err(e) = daemon.enable_interface(IfKind::Addr(self.address)) {
                        tracing::warn!(error = %e, address = %self.address, "failed enabling mdns interface");
                    }
                    self.daemon = Some(daemon);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed starting mdns responder");
                    return None;
                }
            }
        }
        self.daemon.as_ref()
    }

    fn update_lock(&mut self) {
        if self.browsing.is_some() || self.published.is_some() {
            self.lock.acquire();
        } else {
            self.lock.release();
        }
    }

    fn start_discover(&mut self, sink: EventSink) {
        if self.browsing.is_some() {
            tracing::debug!("discovery already running");
            return;
        }
        let local_id = self.local_id.clone();
        let Some(daemon) = self.daemon() else { return };
        let events = match daemon.browse(protocol::SERVICE_TYPE) {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "failed to browse");
                return;
            }
        };
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let spawned = thread::Builder::new().name("mdns-browse".into()).spawn(move || {
            while let Ok(event) = events.recv() {
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        if let Some(ev) =
                            resolve_event(&local_id, info.get_fullname(), info.get_addresses(), info.get_port())
                        {
                            sink(ev);
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let id = instance_id(&fullname);
                        if id != local_id {
                            sink(DiscoveryEvent::Lost { id: id.to_string() });
                        }
                    }
                    ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
        });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed spawning browse thread");
            return;
        }
        tracing::info!("discovery started");
        self.browsing = Some(active);
        self.update_lock();
    }

    fn stop_discover(&mut self) {
        let Some(active) = self.browsing.take() else { return };
        active.store(false, Ordering::Release);
        if let Some(daemon) = &self.daemon {
            if let Err(e) = daemon.stop_browse(protocol::SERVICE_TYPE) {
                tracing::warn!(error = %e, "failed to stop browsing");
            }
        }
        tracing::info!("discovery stopped");
        self.update_lock();
    }

    fn publish(&mut self, port: u16) {
        if self.published.is_some() {
            self.unpublish();
        }
        let id = self.local_id.clone();
        let address = self.address;
        let Some(daemon) = self.daemon() else { return };
        let mut txt = HashMap::new();
        txt.insert(protocol::TXT_FLAGS.to_string(), protocol::FLAGS.to_string());
        let info = match ServiceInfo::new(protocol::SERVICE_TYPE, &id, &format!("{id}.local."), address, port, txt) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(error = %e, "invalid service record");
                return;
            }
        };
        let fullname = info.get_fullname().to_string();
        if let Err(e) = daemon.register(info) {
            tracing::error!(error = %e, "failed to publish");
            return;
        }
        tracing::info!(service = %fullname, port, "published");
        self.published = Some(fullname);
        self.update_lock();
    }

    fn unpublish(&mut self) {
        let Some(fullname) = self.published.take() else { return };
        if let Some(daemon) = &self.daemon {
            match daemon.unregister(&fullname) {
                // Wait so the goodbye packet goes out before anything else.
                Ok(status) => {
                    let _ = status.recv_timeout(std::time::Duration::from_secs(1));
                }
                Err(e) => tracing::warn!(error = %e, "failed to unpublish"),
            }
        }
        tracing::info!(service = %fullname, "unpublished");
        self.update_lock();
    }

    fn destroy(&mut self) {
        self.stop_discover();
        self.unpublish();
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                tracing::warn!(error = %e, "mdns shutdown failed");
            }
        }
        self.lock.release();
    }

    fn run(mut self, commands: Receiver<Command>) {
        while let Ok(command) = commands.recv() {
            match command {
                Command::StartDiscover { sink } => self.start_discover(sink),
                Command::StopDiscover => self.stop_discover(),
                Command::Publish { port } => self.publish(port),
                Command::Unpublish => self.unpublish(),
                Command::Destroy => break,
            }
        }
        self.destroy();
        tracing::debug!("mdns worker exited");
    }
}

/// Front end of the discovery worker. Every method may be called any number of times,
/// in any order.
pub struct NsdController {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl NsdController {
    pub fn new(local_id: &str, address: IpAddr, lock: Box<dyn MulticastLock>) -> std::io::Result<Self> {
        let (commands, rx) = mpsc::channel();
        let worker = Worker {
            local_id: local_id.to_string(),
            address,
            lock,
            daemon: None,
            browsing: None,
            published: None,
        };
        let handle = thread::Builder::new()
            .name("mdns-worker".into())
            .spawn(move || worker.run(rx))?;
        Ok(Self { commands, worker: Some(handle) })
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("mdns worker already gone");
        }
    }

    pub fn start_discover(&self, sink: EventSink) {
        self.enqueue(Command::StartDiscover { sink });
    }

    pub fn stop_discover(&self) {
        self.enqueue(Command::StopDiscover);
    }

    pub fn publish(&self, port: u16) {
        self.enqueue(Command::Publish { port });
    }

    pub fn unpublish(&self) {
        self.enqueue(Command::Unpublish);
    }

    /// Drain pending commands, withdraw everything, and wait for the worker.
    pub fn destroy(&mut self) {
        self.enqueue(Command::Destroy);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("mdns worker panicked");
            }
        }
    }
}

impl Drop for NsdController {
    fn drop(&mut self) {
        // Detach rather than join; `destroy` is the blocking path.
        self.enqueue(Command::Destroy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn instance_id_strips_service_type() {
        assert_eq!(instance_id("a1b2c3d4e5f6._airdrop._tcp.local."), "a1b2c3d4e5f6");
        assert_eq!(instance_id("bare"), "bare");
    }

    #[test]
    fn url_uses_lowest_ipv4() {
        let addrs: Vec<IpAddr> = vec!["fe80::1".parse().unwrap(), "10.0.0.9".parse().unwrap(), "10.0.0.3".parse().unwrap()];
        assert_eq!(peer_url(&addrs, 8770).as_deref(), Some("https://10.0.0.3:8770"));
        let v6: Vec<IpAddr> = vec!["fe80::1".parse().unwrap()];
        assert_eq!(peer_url(&v6, 8770), None);
    }

    #[test]
    fn resolution_skips_self_and_ipv6_only() {
        let v4: Vec<IpAddr> = vec!["192.168.1.4".parse().unwrap()];
        let v6: Vec<IpAddr> = vec!["fe80::4".parse().unwrap()];
        assert_eq!(resolve_event("aaaaaaaaaaaa", "aaaaaaaaaaaa._airdrop._tcp.local.", &v4, 8770), None);
        assert_eq!(resolve_event("aaaaaaaaaaaa", "bbbbbbbbbbbb._airdrop._tcp.local.", &v6, 8770), None);
        assert_eq!(
            resolve_event("aaaaaaaaaaaa", "bbbbbbbbbbbb._airdrop._tcp.local.", &v4, 8770),
            Some(DiscoveryEvent::Resolved { id: "bbbbbbbbbbbb".into(), url: "https://192.168.1.4:8770".into() })
        );
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ipv6_only_service_is_warned_about() {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let v6: Vec<IpAddr> = vec!["fe80::4".parse().unwrap()];
        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(resolve_event("aaaaaaaaaaaa", "bbbbbbbbbbbb._airdrop._tcp.local.", &v6, 8770), None);
        });
        let logged = String::from_utf8(out.0.lock().clone()).unwrap();
        assert!(logged.contains("WARN"), "{logged}");
        assert!(logged.contains("bbbbbbbbbbbb"), "{logged}");
    }

    #[derive(Clone, Default)]
    struct CountingLock(Arc<Mutex<(u32, u32)>>);

    impl MulticastLock for CountingLock {
        fn acquire(&mut self) {
            self.0.lock().0 += 1;
        }
        fn release(&mut self) {
            self.0.lock().1 += 1;
        }
    }

    #[test]
    fn stop_without_start_and_double_destroy_are_harmless() {
        let lock = CountingLock::default();
        let mut nsd = NsdController::new("aaaaaaaaaaaa", "127.0.0.1".parse().unwrap(), Box::new(lock.clone())).unwrap();
        nsd.stop_discover();
        nsd.unpublish();
        nsd.stop_discover();
        nsd.destroy();
        nsd.destroy();
        nsd.stop_discover();
        // Nothing was started, so the lock was never taken.
        assert_eq!(lock.0.lock().0, 0);
    }
}
