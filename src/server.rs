use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::client::{Client, WebhookApi};
use crate::config::{Config, TlsConfig};
use crate::handlers::{self, AppState};
use crate::listener::{RegisteringListener, TcpAcceptor};

/// Handshaken connections waiting for axum to pick them up.
const PENDING_CONNECTIONS: usize = 128;

/// Webhook bot: routes, configuration and the injected API client.
pub struct Bot {
    config: Config,
    api: Arc<dyn WebhookApi>,
    router: Router,
}

impl Bot {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::new(&config.telegram.api_base, &config.http_client)
            .context("Failed to build Bot API client")?;
        Ok(Self::with_api(config, Arc::new(client)))
    }

    pub fn with_api(config: Config, api: Arc<dyn WebhookApi>) -> Self {
        let state = Arc::new(AppState::new(
            &config.telegram.bot_token,
            &config.webhook.reply_text,
        ));
        let router = router(state, config.server.request_timeout());
        Self {
            config,
            api,
            router,
        }
    }

    /// Bind, register the webhook on first accept and serve TLS until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let tls = load_tls(&self.config.tls).with_context(|| {
            format!(
                "Failed to load TLS certificate {} / key {}",
                self.config.tls.certificate.display(),
                self.config.tls.private_key.display()
            )
        })?;

        let addr = self.config.server.bind_target();
        let tcp = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;

        let listener = Arc::new(RegisteringListener::new(
            TcpAcceptor::new(tcp),
            self.api.clone(),
            &self.config.telegram.bot_token,
            &self.config.webhook.public_url,
        ));

        let incoming = TlsListener::spawn(listener.clone(), tls)?;
        info!("Listening on https://{}", incoming.local_addr);

        let served = axum::serve(incoming, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        if let Some(outcome) = listener.registration() {
            debug!("Webhook registration outcome: {:?}", outcome);
        }
        if let Err(e) = listener.close() {
            warn!("Failed to close listener: {}", e);
        }

        served.context("Server error")
    }
}

pub fn router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/{token}", post(handlers::on_update))
        .route("/{token}/", post(handlers::on_update))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn load_tls(config: &TlsConfig) -> io::Result<TlsAcceptor> {
    let certs = load_certs(&config.certificate)?;

    let key_file = File::open(&config.private_key)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> io::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found",
        ));
    }
    Ok(certs)
}

/// TLS front of the registering listener, fed to `axum::serve`.
///
/// A background task drives `RegisteringListener::accept` and runs each
/// handshake on its own task, so a slow client never stalls acceptance.
pub struct TlsListener {
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    local_addr: SocketAddr,
}

impl TlsListener {
    pub fn spawn(
        listener: Arc<RegisteringListener<TcpAcceptor>>,
        tls: TlsAcceptor,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(PENDING_CONNECTIONS);

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                        debug!("Listener closed, stopping accept loop");
                        break;
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if tx.is_closed() {
                    break;
                }

                let tls = tls.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match tls.accept(stream).await {
                        Ok(stream) => {
                            let _ = tx.send((stream, peer)).await;
                        }
                        Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                    }
                });
            }
        });

        Ok(Self {
            incoming: rx,
            local_addr,
        })
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(accepted) => accepted,
            // Accept loop ended; graceful shutdown finishes the server.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
