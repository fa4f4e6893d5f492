//! Host Server
//!
//! Accepts TCP connections, runs preamble interception on each, then serves
//! HTTP/1 on the remaining bytes. Every request reports the client address
//! that was settled for it.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE, SERVER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::ListenerScope;
use crate::connection::{ClientAddrs, ConnectionState};
use crate::fallback::HeaderFallback;
use crate::policy::InterceptPolicy;
use crate::preamble::{self, InterceptOutcome};
use crate::stream::PrefixedStream;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Value of the `Server` response header
pub const SERVER_NAME: &str = concat!("fixip/", env!("CARGO_PKG_VERSION"));

/// Bind every scope and serve until one listener fails.
pub async fn run(scopes: Vec<ListenerScope>) -> Result<(), BoxError> {
    let mut listeners = JoinSet::new();

    for scope in scopes {
        let listener = TcpListener::bind(scope.bind).await?;
        info!(
            "Listening on {} (intercept port {}, scrub {})",
            scope.bind,
            scope.policy.intercept_port(),
            scope.policy.scrub_fallback_header()
        );
        listeners.spawn(serve(listener, scope.policy));
    }

    while let Some(result) = listeners.join_next().await {
        result??;
    }
    Ok(())
}

/// Pause after an accept error that is not tied to a single connection
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop for one listener. Accept errors are logged and never end it.
pub async fn serve(listener: TcpListener, policy: Arc<InterceptPolicy>) -> Result<(), BoxError> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                if let Some(delay) = accept_backoff(&e) {
                    sleep(delay).await;
                }
                continue;
            }
        };
        let policy = policy.clone();

        tokio::spawn(async move {
            handle_connection(stream, peer, policy).await;
        });
    }
}

/// Errors from one aborted handshake retry at once; anything else (such as
/// running out of file descriptors) waits before the next accept.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, policy: Arc<InterceptPolicy>) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Failed to get local address for {}: {}", peer, e);
            return;
        }
    };

    let mut state = ConnectionState::new(peer, local);
    state.evaluate(policy.trust());

    let leftover = match timeout(
        policy.read_timeout(),
        preamble::intercept(&mut stream, &mut state, &policy),
    )
    .await
    {
        Ok(Ok(InterceptOutcome::Continue(leftover))) => leftover,
        Ok(Ok(InterceptOutcome::ProbeHandled)) => return,
        Ok(Ok(InterceptOutcome::Aborted(e))) => {
            debug!("Connection from {} aborted: {}", peer, e);
            return;
        }
        Ok(Err(e)) => {
            debug!("Read error from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("Timed out waiting for first bytes from {}", peer);
            return;
        }
    };

    let state = Arc::new(Mutex::new(state));
    let io = TokioIo::new(PrefixedStream::new(leftover.freeze(), stream));
    let service = service_fn(move |req| {
        let state = state.clone();
        let policy = policy.clone();
        async move { handle_request(req, &state, &policy) }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        error!("Connection error from {}: {}", peer, e);
    }
}

fn handle_request<B>(
    mut req: Request<B>,
    state: &Mutex<ConnectionState>,
    policy: &InterceptPolicy,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let addrs = {
        let mut state = state.lock();
        HeaderFallback::from_policy(policy).resolve(&mut state, req.headers_mut(), policy.trust());
        ClientAddrs::from(&*state)
    };
    req.extensions_mut().insert(addrs);

    Ok(whoami(&req, policy))
}

/// Report the addresses settled for the request as plain text.
fn whoami<B>(req: &Request<B>, policy: &InterceptPolicy) -> Response<Full<Bytes>> {
    let mut body = String::new();
    if let Some(addrs) = req.extensions().get::<ClientAddrs>() {
        body.push_str(&format!("remote_addr: {}\n", addrs.remote_addr));
        body.push_str(&format!("original_remote_addr: {}\n", addrs.original_remote_addr));
        if let Some(balancer) = addrs.load_balancer_addr {
            body.push_str(&format!("load_balancer_addr: {}\n", balancer));
        }
    }

    let header = policy.fallback_header();
    if let Some(value) = req.headers().get(header).and_then(|v| v.to_str().ok()) {
        body.push_str(&format!("{}: {}\n", header, value));
    }

    let mut response = Response::new(Full::new(Bytes::from(body)));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}
