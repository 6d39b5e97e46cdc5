//! Transport listeners and exchange dispatch.
//!
//! # Responsibilities
//! - Bind the HTTP and/or HTTPS listeners, each independently optional
//! - Serve every accepted connection with HTTP/1.1 on its own task
//! - Per exchange: decode, resolve identity, dispatch, save, respond
//! - Convert dispatch failures into a 500 for that exchange only
//!
//! # Design Decisions
//! - TLS bootstrap failure logs and disables HTTPS; HTTP still starts
//! - The session is saved before the response leaves; a save failure is
//!   logged and swallowed so a computed response is never thrown away
//! - Application state is threaded explicitly through dispatch, never
//!   held in task-local or global storage

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tokio_util::io::StreamReader;

use crate::config::AppConfig;
use crate::http::{decode_request, DecodePolicy, Request, Response};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::tls;
use crate::net::{Listener, ListenerError};
use crate::session::{identity, Session};
use crate::store::SessionStore;

/// Error type for server startup.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("invalid bind address {0:?}")]
    BadAddress(String),
    #[error("listener address lookup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Application-scoped state threaded through every dispatch call.
pub struct Application {
    pub context_path: String,
    attributes: DashMap<String, serde_json::Value>,
    default_headers: Vec<(String, String)>,
}

impl Application {
    fn from_config(config: &AppConfig) -> Self {
        Self {
            context_path: config.server.context_path.clone(),
            attributes: DashMap::new(),
            default_headers: config
                .server
                .default_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<serde_json::Value> {
        self.attributes.get(name).map(|entry| entry.value().clone())
    }

    pub fn set_attribute(&self, name: &str, value: serde_json::Value) {
        self.attributes.insert(name.to_string(), value);
    }
}

/// The routing/handler collaborator invoked once per exchange.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        request: &mut Request,
        session: &mut Session,
        application: &Application,
    ) -> Result<Response, Box<dyn std::error::Error + Send + Sync>>;
}

/// Everything one exchange needs, shared across all of them.
struct ExchangeContext {
    config: Arc<AppConfig>,
    store: Arc<dyn SessionStore>,
    dispatch: Arc<dyn Dispatch>,
    application: Application,
}

/// Addresses actually bound at startup.
pub struct BoundAddrs {
    pub http: Option<SocketAddr>,
    pub https: Option<SocketAddr>,
}

/// Owns the accept loops for both listeners.
pub struct TransportListener {
    context: Arc<ExchangeContext>,
    shutdown: Shutdown,
}

impl TransportListener {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn SessionStore>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        let application = Application::from_config(&config);
        Self {
            context: Arc::new(ExchangeContext {
                config,
                store,
                dispatch,
                application,
            }),
            shutdown: Shutdown::new(),
        }
    }

    pub fn shutdown_handle(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Bind the configured listeners and spawn their accept loops.
    pub async fn start(&self) -> Result<BoundAddrs, ServerError> {
        let config = &self.context.config;
        let mut bound = BoundAddrs {
            http: None,
            https: None,
        };

        if let Some(port) = config.server.http_port {
            let listener = self.bind(port).await?;
            bound.http = Some(listener.local_addr()?);
            tracing::info!(address = %bound.http.unwrap(), "HTTP listener started");
            self.spawn_accept_loop(listener, None);
        }

        if let Some(port) = config.server.https_port {
            match self.tls_acceptor() {
                Some(acceptor) => {
                    let listener = self.bind(port).await?;
                    bound.https = Some(listener.local_addr()?);
                    tracing::info!(address = %bound.https.unwrap(), "HTTPS listener started");
                    self.spawn_accept_loop(listener, Some(acceptor));
                }
                None => {
                    tracing::warn!("TLS bootstrap failed, HTTPS listener disabled");
                }
            }
        }

        Ok(bound)
    }

    /// Run until ctrl-c, then close the store.
    pub async fn run(self) -> Result<(), ServerError> {
        self.start().await?;
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "signal handler failed");
        }
        tracing::info!("shutdown signal received");
        self.shutdown.trigger();
        if let Err(e) = self.context.store.close().await {
            tracing::warn!(error = %e, "session store close failed");
        }
        Ok(())
    }

    async fn bind(&self, port: u16) -> Result<Listener, ServerError> {
        let config = &self.context.config.server;
        let addr: SocketAddr = format!("{}:{}", config.bind_address, port)
            .parse()
            .map_err(|_| ServerError::BadAddress(config.bind_address.clone()))?;
        Ok(Listener::bind(addr, config.max_connections).await?)
    }

    fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        let tls_config = &self.context.config.tls;
        let key_file = tls_config.key_file.as_ref()?;
        if tls_config.cert_files.is_empty() {
            return None;
        }
        let credentials = match tls::bootstrap(key_file, &tls_config.cert_files) {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::warn!(error = %e, "TLS credential loading failed");
                return None;
            }
        };
        match tls::server_config(&credentials) {
            Ok(server_config) => Some(TlsAcceptor::from(server_config)),
            Err(e) => {
                tracing::warn!(error = %e, "TLS configuration failed");
                None
            }
        }
    }

    fn spawn_accept_loop(&self, listener: Listener, acceptor: Option<TlsAcceptor>) {
        let context = self.context.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer, permit) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let context = context.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match acceptor {
                        None => serve_connection(stream, peer, context).await,
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => serve_connection(stream, peer, context).await,
                            Err(e) => {
                                tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                            }
                        },
                    }
                });
            }
            tracing::debug!("accept loop stopped");
        });
    }
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, context: Arc<ExchangeContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| {
        let context = context.clone();
        async move { handle_exchange(request, peer, context).await }
    });
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        tracing::debug!(peer = %peer, error = %e, "connection ended with error");
    }
}

/// One full exchange: decode, resolve, dispatch, save, respond.
async fn handle_exchange(
    request: hyper::Request<Incoming>,
    peer: SocketAddr,
    context: Arc<ExchangeContext>,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    let config = &context.config;
    let (parts, body) = request.into_parts();

    let policy = DecodePolicy {
        context_path: config.server.context_path.clone(),
        method_override_param: config.server.method_override_param.clone(),
        spool_threshold: config.upload.spool_threshold,
        spool_dir: config.upload.dir.clone(),
    };
    let reader = StreamReader::new(
        BodyExt::into_data_stream(body).map_err(std::io::Error::other),
    );
    let mut request =
        match decode_request(parts.method, &parts.uri, parts.headers, reader, &policy).await {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "request decode failed");
                return Ok(render(Response::server_error(), &context, None));
            }
        };

    let resolved = identity::resolve(
        request.header("cookie"),
        peer,
        &config.session,
        &config.server.context_path,
    );
    let mut session = Session::new(resolved.id, context.store.clone());

    let response = match context
        .dispatch
        .dispatch(&mut request, &mut session, &context.application)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(
                peer = %peer,
                path = %request.path,
                error = %e,
                "dispatch failed"
            );
            Response::server_error()
        }
    };

    // The response is already computed; a persistence outage must not
    // invalidate it.
    if let Err(e) = session.save().await {
        tracing::warn!(session_id = %session.id(), error = %e, "session save failed");
    }

    Ok(render(response, &context, resolved.set_cookie))
}

/// Assemble the wire response: default headers first, then the
/// dispatch's, then the session cookie.
fn render(
    response: Response,
    context: &ExchangeContext,
    set_cookie: Option<String>,
) -> hyper::Response<Full<Bytes>> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &context.application.default_headers {
        builder = builder.header(name, value);
    }
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    if let Some(cookie) = set_cookie {
        builder = builder.header(http::header::SET_COOKIE, cookie);
    }
    match builder.body(Full::new(response.body)) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "response assembly failed");
            let mut fallback = hyper::Response::new(Full::new(Bytes::new()));
            *fallback.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        }
    }
}
