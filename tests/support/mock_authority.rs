use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Mutable answer served by [`MockAuthorityServer`].
#[derive(Clone)]
pub struct MockAuthority {
    state: Arc<RwLock<AuthorityState>>,
    requests: Arc<AtomicU64>,
}

struct AuthorityState {
    begin: u64,
    end: u64,
    failure: Option<StatusCode>,
    raw_body: Option<String>,
}

impl MockAuthority {
    pub fn new(begin: u64, end: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(AuthorityState {
                begin,
                end,
                failure: None,
                raw_body: None,
            })),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_epoch(&self, begin: u64, end: u64) {
        let mut state = self.state.write().expect("mock authority poisoned");
        state.begin = begin;
        state.end = end;
    }

    /// Advances the reported epoch by `epochs` whole epochs.
    pub fn advance(&self, epochs: u64) {
        let mut state = self.state.write().expect("mock authority poisoned");
        let span = state.end - state.begin + 1;
        state.begin += span * epochs;
        state.end += span * epochs;
    }

    pub fn fail_with(&self, status: Option<StatusCode>) {
        self.state.write().expect("mock authority poisoned").failure = status;
    }

    pub fn serve_raw(&self, body: Option<&str>) {
        self.state.write().expect("mock authority poisoned").raw_body = body.map(str::to_owned);
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn respond(&self) -> (StatusCode, String) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().expect("mock authority poisoned");
        if let Some(status) = state.failure {
            return (status, "unavailable".to_owned());
        }
        if let Some(raw) = &state.raw_body {
            return (StatusCode::OK, raw.clone());
        }
        let body = json!({
            "epochStartBlockHeight": state.begin,
            "epochEndBlockHeight": state.end,
        });
        (StatusCode::OK, body.to_string())
    }
}

pub struct MockAuthorityServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockAuthorityServer {
    pub async fn start(authority: MockAuthority) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock authority listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let authority = authority.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    serve_request(authority.clone(), req)
                }))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock authority server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}/current_epoch", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(
    authority: MockAuthority,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let (status, body) = authority.respond();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
