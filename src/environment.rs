//! Host preconditions: radio state, usable network interface, multicast lock

use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStatus {
    Ok,
    NoBluetooth,
    NoWifi,
}

/// Interface chosen for discovery and outbound connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    /// OS interface index, used as the scope id of link-local IPv6 peers.
    pub index: Option<u32>,
    pub address: IpAddr,
}

/// Held while browsing or publishing so multicast packets reach the process.
pub trait MulticastLock: Send {
    fn acquire(&mut self);
    fn release(&mut self);
}

/// Accessor for everything the subsystem needs from the host.
pub trait Environment: Send + Sync {
    fn bluetooth_ready(&self) -> bool;
    fn local_interface(&self) -> Option<LocalInterface>;
    fn multicast_lock(&self) -> Box<dyn MulticastLock>;
}

/// Bluetooth first, then a usable interface.
pub fn ready(env: &dyn Environment) -> ReadyStatus {
    if !env.bluetooth_ready() {
        ReadyStatus::NoBluetooth
    } else if env.local_interface().is_none() {
        ReadyStatus::NoWifi
    } else {
        ReadyStatus::Ok
    }
}

/// Lock for hosts that deliver multicast without asking.
#[derive(Default)]
pub struct NoopMulticastLock {
    held: bool,
}

impl MulticastLock for NoopMulticastLock {
    fn acquire(&mut self) {
        if !self.held {
            tracing::debug!("multicast lock acquired");
            self.held = true;
        }
    }
    fn release(&mut self) {
        if self.held {
            tracing::debug!("multicast lock released");
            self.held = false;
        }
    }
}

/// Candidate address as reported by the OS.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub index: Option<u32>,
    pub address: IpAddr,
    pub loopback: bool,
}

/// Pick the first preferred interface that has an address (IPv4 over IPv6), else the
/// first non-loopback IPv4 interface, else the first non-loopback IPv6 one.
pub fn select_interface(candidates: &[Candidate], preferred: &[String]) -> Option<LocalInterface> {
    let pick = |c: &Candidate| LocalInterface { name: c.name.clone(), index: c.index, address: c.address };
    for name in preferred {
        let on_iface = || candidates.iter().filter(|c| &c.name == name);
        if let Some(c) = on_iface().find(|c| c.address.is_ipv4()).or_else(|| on_iface().next()) {
            return Some(pick(c));
        }
        tracing::trace!(interface = %name, "preferred interface has no address");
    }
    let usable = || candidates.iter().filter(|c| !c.loopback && !c.address.is_unspecified());
    usable()
        .find(|c| c.address.is_ipv4())
        .or_else(|| usable().next())
        .map(pick)
}

pub struct HostEnvironment {
    preferred: Vec<String>,
    bluetooth: bool,
}

impl HostEnvironment {
    pub fn new(preferred: Vec<String>, bluetooth: bool) -> Self {
        Self { preferred, bluetooth }
    }

    fn candidates() -> Vec<Candidate> {
        match if_addrs::get_if_addrs() {
            Ok(addrs) => addrs
                .into_iter()
                .map(|i| Candidate {
                    loopback: i.is_loopback(),
                    address: i.ip(),
                    index: i.index,
                    name: i.name,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed listing network interfaces");
                Vec::new()
            }
        }
    }
}

impl Environment for HostEnvironment {
    fn bluetooth_ready(&self) -> bool {
        self.bluetooth
    }

    fn local_interface(&self) -> Option<LocalInterface> {
        let found = select_interface(&Self::candidates(), &self.preferred);
        match &found {
            Some(i) => tracing::debug!(interface = %i.name, address = %i.address, "found usable interface"),
            None => tracing::warn!("no usable network interface"),
        }
        found
    }

    fn multicast_lock(&self) -> Box<dyn MulticastLock> {
        Box::new(NoopMulticastLock::default())
    }
}

/// Fixed answers, for embedders that track radio state themselves and for tests.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    pub bluetooth: bool,
    pub interface: Option<LocalInterface>,
}

impl StaticEnvironment {
    pub fn loopback() -> Self {
        Self {
            bluetooth: true,
            interface: Some(LocalInterface {
                name: "lo".to_string(),
                index: None,
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            }),
        }
    }
}

impl Environment for StaticEnvironment {
    fn bluetooth_ready(&self) -> bool {
        self.bluetooth
    }
    fn local_interface(&self) -> Option<LocalInterface> {
        self.interface.clone()
    }
    fn multicast_lock(&self) -> Box<dyn MulticastLock> {
        Box::new(NoopMulticastLock::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(name: &str, addr: &str, loopback: bool) -> Candidate {
        Candidate { name: name.into(), index: Some(3), address: addr.parse().unwrap(), loopback }
    }

    fn preferred() -> Vec<String> {
        vec!["wlan1".into(), "wlan0".into()]
    }

    #[test]
    fn preferred_interface_wins_and_prefers_ipv4() {
        let cs = vec![
            cand("eth0", "10.0.0.2", false),
            cand("wlan0", "fe80::1", false),
            cand("wlan0", "192.168.1.9", false),
        ];
        let got = select_interface(&cs, &preferred()).unwrap();
        assert_eq!(got.name, "wlan0");
        assert_eq!(got.address, "192.168.1.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ipv6_only_preferred_interface_is_used() {
        let cs = vec![cand("wlan1", "fe80::2", false), cand("eth0", "10.0.0.2", false)];
        assert_eq!(select_interface(&cs, &preferred()).unwrap().name, "wlan1");
    }

    #[test]
    fn falls_back_to_first_ipv4_non_loopback() {
        let cs = vec![
            cand("lo", "127.0.0.1", true),
            cand("eth1", "fe80::5", false),
            cand("eth0", "10.0.0.2", false),
        ];
        assert_eq!(select_interface(&cs, &preferred()).unwrap().name, "eth0");
        assert!(select_interface(&[cand("lo", "127.0.0.1", true)], &preferred()).is_none());
    }

    #[test]
    fn ready_checks_bluetooth_first() {
        let mut env = StaticEnvironment::loopback();
        assert_eq!(ready(&env), ReadyStatus::Ok);
        env.interface = None;
        assert_eq!(ready(&env), ReadyStatus::NoWifi);
        env.bluetooth = false;
        assert_eq!(ready(&env), ReadyStatus::NoBluetooth);
    }
}
