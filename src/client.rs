//! Outbound HTTPS calls to peers

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use hyper::client::conn::SendRequest;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Request, StatusCode, Uri};
use parking_lot::RwLock;
use plist::Dictionary;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_rustls::TlsConnector;

use crate::environment::LocalInterface;
use crate::error::TransportError;
use crate::messages;
use crate::pipe::BodyReceiver;
use crate::protocol::{self, content_type, timeouts};
use crate::tls;

/// Outbound half of the protocol. The manager only talks to peers through this.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Restrict outgoing connections to one interface. `None` lets the OS choose.
    fn set_interface(&self, _interface: Option<LocalInterface>) {}

    /// POST a plist dictionary and parse the plist dictionary answer.
    async fn post_dictionary(&self, url: &str, body: Dictionary) -> Result<Dictionary, TransportError>;

    /// POST a streamed octet body. The stream is consumed as it is produced.
    async fn post_stream(&self, url: &str, body: BodyReceiver) -> Result<(), TransportError>;
}

/// A spawned transport call. Aborting it drops the connection; awaiting an aborted
/// call yields `TransportError::Cancelled`.
pub struct Call<T> {
    handle: JoinHandle<Result<T, TransportError>>,
}

impl<T: Send + 'static> Call<T> {
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        Self { handle: tokio::spawn(fut) }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }
}

impl<T> Future for Call<T> {
    type Output = Result<T, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(TransportError::Cancelled)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(TransportError::Io(io::Error::other(e.to_string())))),
        }
    }
}

/// Aborts the connection driver when the request side is dropped, closing the socket.
struct ConnGuard(JoinHandle<()>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Target {
    uri: Uri,
    host: String,
    authority: String,
    addr: SocketAddr,
}

pub struct AirDropClient {
    tls: TlsConnector,
    interface: RwLock<Option<LocalInterface>>,
}

impl Default for AirDropClient {
    fn default() -> Self {
        Self::new()
    }
}

fn is_link_local_v6(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80)
}

/// Socket address for a peer; link-local IPv6 targets get the interface index as scope.
pub fn scoped_addr(ip: IpAddr, port: u16, interface: Option<&LocalInterface>) -> SocketAddr {
    match (ip, interface.and_then(|i| i.index)) {
        (IpAddr::V6(v6), Some(index)) if is_link_local_v6(&ip) => SocketAddr::V6(SocketAddrV6::new(v6, port, 0, index)),
        _ => SocketAddr::new(ip, port),
    }
}

impl AirDropClient {
    pub fn new() -> Self {
        Self {
            tls: TlsConnector::from(tls::build_client_config()),
            interface: RwLock::new(None),
        }
    }

    async fn target(&self, url: &str, path: &str) -> Result<Target, TransportError> {
        let base: Uri = url.parse().map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        let raw_host = base.host().ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;
        let host = raw_host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = base.port_u16().unwrap_or(protocol::PORT);
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .map(|a| a.ip())
                .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?,
        };
        let addr = scoped_addr(ip, port, self.interface.read().as_ref());
        let authority = base
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| format!("{raw_host}:{port}"));
        let uri: Uri = path.parse().map_err(|_| TransportError::InvalidUrl(path.to_string()))?;
        Ok(Target { uri, host, authority, addr })
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let connect_err = |source: io::Error| TransportError::Connect { addr, source };
        let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }.map_err(connect_err)?;
        let local = self.interface.read().as_ref().map(|i| i.address);
        if let Some(local) = local {
            if local.is_ipv4() == addr.is_ipv4() && !is_link_local_v6(&local) {
                socket.bind(SocketAddr::new(local, 0)).map_err(connect_err)?;
            }
        }
        match tokio::time::timeout(Duration::from_millis(timeouts::CONNECT_MS), socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(connect_err(e)),
            Err(_) => Err(connect_err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))),
        }
    }

    async fn connect(&self, target: &Target) -> Result<(SendRequest<Body>, ConnGuard), TransportError> {
        let tcp = self.connect_tcp(target.addr).await?;
        let handshake = self.tls.connect(tls::server_name_for(&target.host), tcp);
        let stream = tokio::time::timeout(Duration::from_millis(timeouts::HANDSHAKE_MS), handshake)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))??;
        let (sender, conn) = hyper::client::conn::handshake(stream).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "peer connection closed with error");
            }
        });
        Ok((sender, ConnGuard(driver)))
    }

    fn request(target: &Target, content: &str, body: Body) -> Result<Request<Body>, TransportError> {
        Ok(Request::post(target.uri.clone())
            .header(HOST, target.authority.as_str())
            .header(CONTENT_TYPE, content)
            .body(body)?)
    }
}

fn url_path(url: &str) -> &str {
    // Base URLs are `https://ip:port`; anything after the authority is the route.
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.find('/') {
        Some(i) => &rest[i..],
        None => "/",
    }
}

fn url_base(url: &str) -> &str {
    let path = url_path(url);
    if path == "/" && !url.ends_with('/') {
        url
    } else {
        &url[..url.len() - path.len()]
    }
}

#[async_trait]
impl Transport for AirDropClient {
    fn set_interface(&self, interface: Option<LocalInterface>) {
        *self.interface.write() = interface;
    }

    async fn post_dictionary(&self, url: &str, body: Dictionary) -> Result<Dictionary, TransportError> {
        let target = self.target(url_base(url), url_path(url)).await?;
        let bytes = messages::encode_dictionary(&body).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let (mut sender, _guard) = self.connect(&target).await?;
        let req = Self::request(&target, content_type::PLIST, Body::from(bytes))?;

        let exchange = async {
            let resp = sender.send_request(req).await?;
            if resp.status() != StatusCode::OK {
                return Err(TransportError::Status(resp.status().as_u16()));
            }
            let raw = hyper::body::to_bytes(resp.into_body()).await?;
            parse_reply(&raw)
        };
        tokio::time::timeout(Duration::from_millis(timeouts::ASK_RESPONSE_MS), exchange)
            .await
            .map_err(|_| TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "no answer from peer")))?
    }

    async fn post_stream(&self, url: &str, body: BodyReceiver) -> Result<(), TransportError> {
        let target = self.target(url_base(url), url_path(url)).await?;
        let (mut sender, _guard) = self.connect(&target).await?;
        let stream = futures::stream::unfold(body, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let req = Self::request(&target, content_type::OCTET_STREAM, Body::wrap_stream(stream))?;
        let resp = sender.send_request(req).await?;
        if resp.status() != StatusCode::OK {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        // Drain so the peer sees a clean close.
        let _ = hyper::body::to_bytes(resp.into_body()).await;
        Ok(())
    }
}

/// A peer's answer must be a plist dictionary; an empty body is not one.
fn parse_reply(raw: &[u8]) -> Result<Dictionary, TransportError> {
    if raw.is_empty() {
        return Err(TransportError::Malformed("empty response body".into()));
    }
    messages::decode_dictionary(raw).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Shared client handle, convenient for builders.
pub fn default_transport() -> Arc<dyn Transport> {
    Arc::new(AirDropClient::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_split() {
        assert_eq!(url_path("https://10.0.0.2:8770/Ask"), "/Ask");
        assert_eq!(url_base("https://10.0.0.2:8770/Ask"), "https://10.0.0.2:8770");
        assert_eq!(url_path("https://10.0.0.2:8770"), "/");
        assert_eq!(url_base("https://10.0.0.2:8770"), "https://10.0.0.2:8770");
        assert_eq!(url_path("https://[fe80::1]:8770/Upload"), "/Upload");
    }

    #[test]
    fn link_local_v6_gets_scope() {
        let iface = LocalInterface { name: "wlan0".into(), index: Some(4), address: "fe80::9".parse().unwrap() };
        match scoped_addr("fe80::1".parse().unwrap(), 8770, Some(&iface)) {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 4),
            other => panic!("unexpected {other}"),
        }
        match scoped_addr("2001:db8::1".parse().unwrap(), 8770, Some(&iface)) {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 0),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(
            scoped_addr("10.0.0.2".parse().unwrap(), 8770, Some(&iface)),
            "10.0.0.2:8770".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn empty_reply_is_malformed() {
        assert!(matches!(parse_reply(b""), Err(TransportError::Malformed(_))));
        assert!(matches!(parse_reply(b"bplist00\x01"), Err(TransportError::Malformed(_))));

        let mut dict = Dictionary::new();
        dict.insert("ReceiverComputerName".into(), "Studio".into());
        let raw = messages::encode_dictionary(&dict).unwrap();
        assert_eq!(parse_reply(&raw).unwrap(), dict);
    }

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let client = AirDropClient::new();
        let err = client.post_dictionary("not a url", Dictionary::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let port = {
            let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        let client = AirDropClient::new();
        let err = client
            .post_dictionary(&format!("https://127.0.0.1:{port}/Discover"), Dictionary::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }), "{err}");
    }

    #[tokio::test]
    async fn aborted_call_is_cancelled() {
        let call: Call<()> = Call::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });
        call.abort_handle().abort();
        assert!(matches!(call.await, Err(TransportError::Cancelled)));
    }
}
