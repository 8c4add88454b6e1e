//! Inbound HTTPS server for `/Discover`, `/Ask` and `/Upload`

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use plist::Dictionary;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::messages;
use crate::pipe::{self, BodyReceiver, BodySender};
use crate::protocol::{content_type, limits, routes, timeouts};

/// What the server needs from the layer above. `remote` is the peer's address, the
/// only correlation key the protocol offers.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `None` answers 401.
    async fn discover(&self, remote: IpAddr, request: Dictionary) -> Option<Dictionary>;
    /// May wait for the user. `None` answers 401.
    async fn ask(&self, remote: IpAddr, request: Dictionary) -> Option<Dictionary>;
    /// The asking connection went away before `ask` finished.
    fn ask_canceled(&self, remote: IpAddr);
    /// Consume the archive body. `true` answers 200, `false` 401.
    async fn upload(&self, remote: IpAddr, body: BodyReceiver) -> bool;
}

pub struct AirDropServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl AirDropServer {
    /// Bind and start accepting on the current runtime.
    pub async fn start(
        bind: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind).await.with_context(|| format!("bind {bind}"))?;
        let local_addr = listener.local_addr().context("local addr")?;
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(listener, TlsAcceptor::from(tls), handler, shutdown.clone()));
        tracing::info!(addr = %local_addr, "transfer server listening");
        Ok(Self { local_addr, shutdown })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop open connections.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(addr = %self.local_addr, "transfer server stopping");
            self.shutdown.cancel();
        }
    }
}

impl Drop for AirDropServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(tcp, peer, acceptor, handler, shutdown).await {
                tracing::debug!(remote = %peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn serve_connection(
    tcp: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let _ = tcp.set_nodelay(true);
    let tls = tokio::time::timeout(Duration::from_millis(timeouts::HANDSHAKE_MS), acceptor.accept(tcp))
        .await
        .context("tls handshake timed out")?
        .context("tls handshake")?;
    let remote = peer.ip().to_canonical();
    let service = service_fn(move |req| route(req, remote, handler.clone()));
    let conn = Http::new().http1_only(true).serve_connection(tls, service);
    tokio::select! {
        res = conn => res.context("serve http")?,
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

fn dictionary_response(answer: Option<Dictionary>) -> Response<Body> {
    let Some(dict) = answer else {
        return empty(StatusCode::UNAUTHORIZED);
    };
    match messages::encode_dictionary(&dict) {
        Ok(bytes) => {
            let mut resp = Response::new(Body::from(bytes));
            resp.headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type::PLIST));
            resp
        }
        Err(e) => {
            tracing::error!(error = %e, "failed encoding response");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Buffer a control body, refusing anything over the limit.
async fn read_control_body(mut body: Body) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e))?;
        if out.len() + chunk.len() > limits::MAX_CONTROL_BODY {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "control body too large"));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

async fn read_dictionary(body: Body) -> std::result::Result<Dictionary, String> {
    let raw = read_control_body(body).await.map_err(|e| e.to_string())?;
    messages::decode_dictionary(&raw).map_err(|e| e.to_string())
}

/// Forward request body frames into the unpack pipe until either side stops.
async fn pump(mut body: Body, tx: BodySender) {
    while let Some(chunk) = body.data().await {
        let item = chunk.map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e));
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

/// Reports an `/Ask` whose response future was dropped, i.e. the client hung up.
struct AskGuard {
    handler: Arc<dyn RequestHandler>,
    remote: IpAddr,
    armed: bool,
}

impl AskGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AskGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(remote = %self.remote, "ask canceled by peer");
            self.handler.ask_canceled(self.remote);
        }
    }
}

async fn route(
    req: Request<Body>,
    remote: IpAddr,
    handler: Arc<dyn RequestHandler>,
) -> std::result::Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(empty(StatusCode::METHOD_NOT_ALLOWED));
    }
    let path = req.uri().path().to_string();
    tracing::debug!(remote = %remote, route = %path, "request");
    let resp = match path.as_str() {
        routes::DISCOVER => match read_dictionary(req.into_body()).await {
            Ok(dict) => dictionary_response(handler.discover(remote, dict).await),
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "bad discover body");
                empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        routes::ASK => match read_dictionary(req.into_body()).await {
            Ok(dict) => {
                let guard = AskGuard { handler: handler.clone(), remote, armed: true };
                let answer = handler.ask(remote, dict).await;
                guard.disarm();
                dictionary_response(answer)
            }
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "bad ask body");
                empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        routes::UPLOAD => {
            let (tx, rx) = pipe::channel();
            tokio::spawn(pump(req.into_body(), tx));
            if handler.upload(remote, rx).await {
                empty(StatusCode::OK)
            } else {
                empty(StatusCode::UNAUTHORIZED)
            }
        }
        _ => empty(StatusCode::NOT_FOUND),
    };
    Ok(resp)
}
