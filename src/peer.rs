//! Peers visible to this device

use crate::messages::DiscoverResponse;
use crate::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    AwaitingConfirmation,
    Sending,
    Sent,
    Rejected,
    Failed,
}

impl TransferState {
    /// A send is in flight; a new one must wait.
    pub fn is_busy(self) -> bool {
        matches!(self, TransferState::AwaitingConfirmation | TransferState::Sending)
    }
}

/// Transfer status as seen from the sending side. `bytes_total` is `None` when any
/// entity's size is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerStatus {
    pub state: TransferState,
    pub bytes_sent: u64,
    pub bytes_total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AirDropPeer {
    pub id: String,
    pub name: String,
    /// `https://<ip>:<port>`
    pub url: String,
    pub capabilities: Option<serde_json::Value>,
    pub status: PeerStatus,
}

impl AirDropPeer {
    pub fn from_discover(id: &str, url: &str, resp: DiscoverResponse) -> Self {
        Self {
            id: id.to_string(),
            name: resp.computer_name,
            url: url.to_string(),
            capabilities: resp.capabilities,
            status: PeerStatus::default(),
        }
    }

    /// API level advertised under this implementation's vendor namespace, 0 if absent.
    pub fn vendor_api_version(&self) -> i64 {
        self.capabilities
            .as_ref()
            .and_then(|c| c.get("Vendor"))
            .and_then(|v| v.get(protocol::VENDOR_NAMESPACE))
            .and_then(|m| m.get("APIVersion"))
            .and_then(|a| a.as_i64())
            .unwrap_or(0)
    }
}

/// Peer reached through the vendor cross-device SDK. Discovery and sending for it live
/// outside this crate; it only shares the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct NearSharePeer {
    pub id: String,
    pub name: String,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Peer {
    AirDrop(AirDropPeer),
    NearShare(NearSharePeer),
}

impl Peer {
    pub fn id(&self) -> &str {
        match self {
            Peer::AirDrop(p) => &p.id,
            Peer::NearShare(p) => &p.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Peer::AirDrop(p) => &p.name,
            Peer::NearShare(p) => &p.name,
        }
    }

    pub fn status(&self) -> PeerStatus {
        match self {
            Peer::AirDrop(p) => p.status,
            Peer::NearShare(p) => p.status,
        }
    }

    pub fn set_status(&mut self, status: PeerStatus) {
        match self {
            Peer::AirDrop(p) => p.status = status,
            Peer::NearShare(p) => p.status = status,
        }
    }

    /// AirDrop peers are the same endpoint when their URLs match; otherwise ids decide.
    pub fn is_same_as(&self, other: &Peer) -> bool {
        match (self, other) {
            (Peer::AirDrop(a), Peer::AirDrop(b)) => a.url == b.url,
            _ => self.id() == other.id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::own_capabilities;

    fn airdrop(id: &str, url: &str) -> Peer {
        Peer::AirDrop(AirDropPeer::from_discover(
            id,
            url,
            DiscoverResponse { computer_name: "Mac".into(), capabilities: None },
        ))
    }

    #[test]
    fn airdrop_identity_is_the_url() {
        let a = airdrop("aaaaaaaaaaaa", "https://10.0.0.2:8770");
        let b = airdrop("bbbbbbbbbbbb", "https://10.0.0.2:8770");
        let c = airdrop("aaaaaaaaaaaa", "https://10.0.0.3:8770");
        assert!(a.is_same_as(&b));
        assert!(!a.is_same_as(&c));
    }

    #[test]
    fn mixed_variants_compare_ids() {
        let a = airdrop("same", "https://10.0.0.2:8770");
        let n = Peer::NearShare(NearSharePeer { id: "same".into(), name: "PC".into(), status: PeerStatus::default() });
        assert!(a.is_same_as(&n));
        assert!(n.is_same_as(&a));
    }

    #[test]
    fn vendor_api_version_from_capabilities() {
        let mut p = AirDropPeer::from_discover(
            "x",
            "https://h:1",
            DiscoverResponse { computer_name: "n".into(), capabilities: Some(own_capabilities()) },
        );
        assert_eq!(p.vendor_api_version(), 1);
        p.capabilities = Some(serde_json::json!({"Version": 1}));
        assert_eq!(p.vendor_api_version(), 0);
        p.capabilities = None;
        assert_eq!(p.vendor_api_version(), 0);
    }

    #[test]
    fn busy_states() {
        assert!(TransferState::AwaitingConfirmation.is_busy());
        assert!(TransferState::Sending.is_busy());
        assert!(!TransferState::Rejected.is_busy());
        assert!(!TransferState::Idle.is_busy());
    }
}
