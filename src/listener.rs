//! TCP listener wrapper that registers the webhook before serving.
//!
//! The first `accept` (across all concurrent callers) performs a single
//! `setWebhook` call; every caller waits for it to resolve before reaching the
//! underlying listener. Registration failures are logged and never fail
//! `accept`.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Once, OnceLock};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::SetWebhookRequest;
use crate::client::WebhookApi;
use crate::config::mask_token;

/// Minimal listener surface wrapped by [`RegisteringListener`].
#[async_trait]
pub trait Acceptor: Send + Sync {
    type Conn: Send;

    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)>;

    fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// [`Acceptor`] over a bound tokio TCP listener.
///
/// Closing wakes pending accepts; they and all later accepts fail with
/// [`io::ErrorKind::NotConnected`].
pub struct TcpAcceptor {
    inner: TcpListener,
    closed: watch::Sender<bool>,
}

impl TcpAcceptor {
    pub fn new(inner: TcpListener) -> Self {
        let (closed, _) = watch::channel(false);
        Self { inner, closed }
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let closed = self.closed.subscribe();
        let already_closed = *self.closed.borrow();
        if already_closed {
            return Err(listener_closed());
        }

        tokio::select! {
            accepted = self.inner.accept() => accepted,
            _ = wait_closed(closed) => Err(listener_closed()),
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// How the one-shot registration ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    Registered,
    /// The platform answered but did not accept the webhook.
    Rejected { code: i32, description: String },
    /// No usable answer: transport, content type or decode failure.
    Failed(String),
}

pub struct RegisteringListener<A> {
    inner: A,
    api: Arc<dyn WebhookApi>,
    token: String,
    webhook_url: String,
    /// Registration runs on its own task, started at most once; callers
    /// await a shared handle so dropping one of them cannot restart it.
    in_service: OnceLock<Shared<BoxFuture<'static, RegistrationOutcome>>>,
    off_service: Once,
}

/// Public callback URL: the base with the bot token as last path segment.
pub fn webhook_url(base: &str, token: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), token)
}

impl<A: Acceptor> RegisteringListener<A> {
    pub fn new(inner: A, api: Arc<dyn WebhookApi>, token: &str, webhook_base: &str) -> Self {
        Self {
            inner,
            api,
            token: token.to_string(),
            webhook_url: webhook_url(webhook_base, token),
            in_service: OnceLock::new(),
            off_service: Once::new(),
        }
    }

    /// Outcome of the registration, `None` until the first accept resolved it.
    pub fn registration(&self) -> Option<RegistrationOutcome> {
        self.in_service.get().and_then(|gate| gate.peek().cloned())
    }

    /// Wait for the next connection, registering the webhook first if this
    /// is the first call.
    pub async fn accept(&self) -> io::Result<(A::Conn, SocketAddr)> {
        let gate = self
            .in_service
            .get_or_init(|| self.start_registration())
            .clone();
        gate.await;
        self.inner.accept().await
    }

    /// Run the one-time teardown hook, then close the underlying listener.
    /// Every call closes; only the first runs the hook.
    pub fn close(&self) -> io::Result<()> {
        self.off_service.call_once(|| {
            debug!("Listener leaving service");
        });
        self.inner.close()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn start_registration(&self) -> Shared<BoxFuture<'static, RegistrationOutcome>> {
        let task = tokio::spawn(register(
            self.api.clone(),
            self.token.clone(),
            self.webhook_url.clone(),
        ));
        async move {
            task.await.unwrap_or_else(|e| {
                error!("Webhook registration task failed: {}", e);
                RegistrationOutcome::Failed(e.to_string())
            })
        }
        .boxed()
        .shared()
    }
}

async fn register(
    api: Arc<dyn WebhookApi>,
    token: String,
    webhook_url: String,
) -> RegistrationOutcome {
    let masked_url = webhook_url.replace(&token, &mask_token(&token));
    info!("Registering webhook {}", masked_url);

    let request = SetWebhookRequest { url: webhook_url };

    match api.set_webhook(&token, &request).await {
        Ok(resp) if resp.ok && resp.result => {
            info!("Webhook registered: {}", resp.description);
            RegistrationOutcome::Registered
        }
        Ok(resp) => {
            warn!(
                "Webhook registration rejected (code {}): {}",
                resp.error_code, resp.description
            );
            RegistrationOutcome::Rejected {
                code: resp.error_code,
                description: resp.description,
            }
        }
        Err(e) => {
            error!("Webhook registration failed: {}", e);
            RegistrationOutcome::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SetWebhookResponse;
    use crate::client::ClientError;
    use futures::future::join_all;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    enum Reply {
        Accept,
        Reject,
        Fail,
    }

    struct StubApi {
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
        reply: Reply,
        /// Set once the stubbed call has finished.
        resolved: Arc<AtomicBool>,
    }

    impl StubApi {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                reply,
                resolved: Arc::new(AtomicBool::new(false)),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebhookApi for StubApi {
        async fn set_webhook(
            &self,
            _token: &str,
            request: &SetWebhookRequest,
        ) -> Result<SetWebhookResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(request.url.clone());
            // Widen the race window for concurrent first accepts.
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.resolved.store(true, Ordering::SeqCst);
            match self.reply {
                Reply::Accept => Ok(SetWebhookResponse {
                    ok: true,
                    result: true,
                    error_code: 0,
                    description: "Webhook was set".to_string(),
                }),
                Reply::Reject => Ok(SetWebhookResponse {
                    ok: false,
                    result: false,
                    error_code: 401,
                    description: "Unauthorized".to_string(),
                }),
                Reply::Fail => Err(ClientError::ContentType {
                    status: StatusCode::BAD_GATEWAY,
                    content_type: "text/html".to_string(),
                }),
            }
        }
    }

    /// Acceptor that hands out sequence numbers, counts closes and records
    /// accepts that arrive before registration resolved.
    struct StubAcceptor {
        accepted: AtomicUsize,
        early: AtomicUsize,
        closes: AtomicUsize,
        closed: AtomicBool,
        resolved: Arc<AtomicBool>,
    }

    impl StubAcceptor {
        fn new(resolved: Arc<AtomicBool>) -> Self {
            Self {
                accepted: AtomicUsize::new(0),
                early: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                resolved,
            }
        }
    }

    #[async_trait]
    impl Acceptor for StubAcceptor {
        type Conn = usize;

        async fn accept(&self) -> io::Result<(usize, SocketAddr)> {
            if !self.resolved.load(Ordering::SeqCst) {
                self.early.fetch_add(1, Ordering::SeqCst);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(listener_closed());
            }
            let n = self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok((n, SocketAddr::from(([127, 0, 0, 1], 40000))))
        }

        fn close(&self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 7001)))
        }
    }

    fn listener(api: Arc<StubApi>) -> Arc<RegisteringListener<StubAcceptor>> {
        let acceptor = StubAcceptor::new(api.resolved.clone());
        Arc::new(RegisteringListener::new(
            acceptor,
            api,
            "123:secret",
            "https://bot.example.com:88/",
        ))
    }

    #[test]
    fn test_webhook_url_appends_token() {
        assert_eq!(
            webhook_url("https://bot.example.com:88", "123:abc"),
            "https://bot.example.com:88/123:abc"
        );
        assert_eq!(
            webhook_url("https://bot.example.com/hooks/", "t"),
            "https://bot.example.com/hooks/t"
        );
    }

    #[tokio::test]
    async fn test_concurrent_first_accepts_register_once() {
        let api = StubApi::new(Reply::Accept);
        let listener = listener(api.clone());

        let tasks = (0..16).map(|_| {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        });
        let results = join_all(tasks).await;

        assert_eq!(api.calls(), 1);
        assert_eq!(results.len(), 16);
        for result in results {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(listener.inner.accepted.load(Ordering::SeqCst), 16);
        assert_eq!(listener.inner.early.load(Ordering::SeqCst), 0);
        assert_eq!(
            api.urls.lock().unwrap().as_slice(),
            ["https://bot.example.com:88/123:secret".to_string()]
        );
        assert_eq!(listener.registration(), Some(RegistrationOutcome::Registered));
    }

    #[tokio::test]
    async fn test_cancelled_first_accept_does_not_register_again() {
        let api = StubApi::new(Reply::Accept);
        let listener = listener(api.clone());

        let first = tokio::time::timeout(Duration::from_millis(10), listener.accept()).await;
        assert!(first.is_err());
        assert_eq!(api.calls(), 1);

        assert!(listener.accept().await.is_ok());
        assert!(listener.accept().await.is_ok());
        assert_eq!(api.calls(), 1);
        assert_eq!(listener.inner.early.load(Ordering::SeqCst), 0);
        assert_eq!(listener.registration(), Some(RegistrationOutcome::Registered));
    }

    #[tokio::test]
    async fn test_aborted_first_accept_does_not_register_again() {
        let api = StubApi::new(Reply::Fail);
        let listener = listener(api.clone());

        let first = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        assert!(listener.accept().await.is_ok());
        assert_eq!(api.calls(), 1);
        assert!(matches!(
            listener.registration(),
            Some(RegistrationOutcome::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_no_registration_before_first_accept() {
        let api = StubApi::new(Reply::Accept);
        let listener = listener(api.clone());

        assert_eq!(listener.local_addr().unwrap().port(), 7001);
        assert_eq!(api.calls(), 0);
        assert!(listener.registration().is_none());
    }

    #[tokio::test]
    async fn test_subsequent_accepts_do_not_register() {
        let api = StubApi::new(Reply::Accept);
        let listener = listener(api.clone());

        for expected in 0..5 {
            let (conn, _) = listener.accept().await.unwrap();
            assert_eq!(conn, expected);
        }
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_still_accepts() {
        let api = StubApi::new(Reply::Fail);
        let listener = listener(api.clone());

        assert!(listener.accept().await.is_ok());
        assert!(listener.accept().await.is_ok());

        assert_eq!(api.calls(), 1);
        assert!(matches!(
            listener.registration(),
            Some(RegistrationOutcome::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_registration_is_recorded() {
        let api = StubApi::new(Reply::Reject);
        let listener = listener(api.clone());

        assert!(listener.accept().await.is_ok());
        assert!(listener.accept().await.is_ok());

        assert_eq!(api.calls(), 1);
        assert_eq!(
            listener.registration(),
            Some(RegistrationOutcome::Rejected {
                code: 401,
                description: "Unauthorized".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_close_delegates_every_time() {
        let api = StubApi::new(Reply::Accept);
        let listener = listener(api.clone());

        listener.close().unwrap();
        listener.close().unwrap();
        listener.close().unwrap();

        assert!(listener.off_service.is_completed());
        assert_eq!(listener.inner.closes.load(Ordering::SeqCst), 3);
        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_tcp_acceptor_close_wakes_pending_accept() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let acceptor = Arc::new(TcpAcceptor::new(tcp));

        let pending = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        acceptor.close().unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(
            acceptor.accept().await.unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[tokio::test]
    async fn test_tcp_acceptor_accepts_connection() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let acceptor = TcpAcceptor::new(tcp);
        let addr = acceptor.local_addr().unwrap();

        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_stream, peer) = acceptor.accept().await.unwrap();
        let client = connect.await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
