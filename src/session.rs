//! The application-facing façade: wires components A–G together and
//! exposes the programmatic surface described for the core.
//!
//! Grounded on the shape of the teacher's `StanzaStream` (construct once,
//! `connect`/`send_*`/`iq_*` from any task, callbacks for inbound events)
//! but without its actor/worker split: this crate drives reconnection from
//! one explicit task per §9's redesign note ("a single reconciler driven by
//! the tick"), rather than a reconnector closure racing a mailbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use jid::Jid;
use log::{debug, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::dispatcher;
use crate::error::Error;
use crate::event::Event;
use crate::iq_correlator::IqCorrelator;
use crate::negotiation::{self, NegotiationConfig};
use crate::stanza::{Iq, Message, Presence, Stanza};
use crate::stream_management::{SmConfig, SmEngine, SmState, TickAction};
use crate::transport::{Endpoint, Transport};
use crate::writer::Writer;
use crate::xmlstream::ElementReader;

/// Construction parameters for a [`Session`].
#[derive(Clone)]
pub struct SessionConfig {
    /// The server's domain, used both as the SRV lookup target and the
    /// stream's `to=`.
    pub hostname: String,
    /// SASL username, if this session will authenticate.
    pub username: Option<String>,
    /// SASL password, if this session will authenticate.
    pub password: Option<String>,
    /// Bypass SRV and connect directly to `(host, port)`.
    pub server_override: Option<(String, u16)>,
    /// Fallback port when SRV resolution fails outright. Default 5222.
    pub port: u16,
    /// Offer STARTTLS when advertised. Default `true`.
    pub tls: bool,
    /// Fail the connection if the stream never becomes encrypted. Default
    /// `false`, matching the teacher's permissive default (documented as
    /// insecure; callers SHOULD set this `true` in production).
    pub require_tls: bool,
    /// Default timeout for [`Session::iq_request`] when the caller doesn't
    /// specify one. `None` means wait forever.
    pub iq_default_timeout: Option<Duration>,
}

impl SessionConfig {
    /// A session with TLS offered but not required, no credentials (so
    /// `connect()` will perform no SASL and return a bare-domain identity),
    /// and no IQ timeout.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: None,
            password: None,
            server_override: None,
            port: 5222,
            tls: true,
            require_tls: false,
            iq_default_timeout: None,
        }
    }

    /// Configure SASL credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Bypass SRV and connect to a specific host/port.
    pub fn with_server_override(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_override = Some((host.into(), port));
        self
    }
}

#[derive(Default)]
struct Callbacks {
    on_error: Option<Arc<dyn Fn(Error, bool) + Send + Sync>>,
    on_iq: Option<Arc<dyn Fn(Iq) + Send + Sync>>,
    on_message: Option<Arc<dyn Fn(Message) + Send + Sync>>,
    on_presence: Option<Arc<dyn Fn(Presence) + Send + Sync>>,
    on_sm_enabled: Option<Arc<dyn Fn() + Send + Sync>>,
    on_stream_resumed: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct Shared {
    config: StdMutex<SessionConfig>,
    endpoint: StdMutex<Endpoint>,
    jid: StdMutex<Option<Jid>>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    encrypted: AtomicBool,
    default_language: StdMutex<String>,
    writer: Mutex<Option<Arc<Writer>>>,
    iq: Arc<IqCorrelator>,
    sm: Arc<SmEngine>,
    sm_state: Arc<Mutex<Option<SmState>>>, // == sm.shared_state(), cached to avoid re-deriving it
    events_tx: mpsc::UnboundedSender<Event>,
    callbacks: StdMutex<Callbacks>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    sm_driver_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn endpoint_for(config: &SessionConfig) -> Endpoint {
        match &config.server_override {
            Some((host, port)) => Endpoint::Host {
                host: host.clone(),
                port: *port,
            },
            None => Endpoint::Srv {
                domain: config.hostname.clone(),
                srv: "_xmpp-client._tcp".to_owned(),
                fallback_port: config.port,
            },
        }
    }

    fn negotiation_config(config: &SessionConfig, resource: Option<String>, bind: bool) -> NegotiationConfig {
        NegotiationConfig {
            domain: config.hostname.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            resource,
            starttls: config.tls,
            require_tls: config.require_tls,
            bind,
        }
    }

    async fn abort_dispatcher(&self) {
        if let Some(handle) = self.dispatcher_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn spawn_dispatcher(self: &Arc<Self>, reader: ElementReader<tokio::io::ReadHalf<Transport>>, writer: Arc<Writer>) {
        let iq = self.iq.clone();
        let sm = self.sm.clone();
        let sm_state = self.sm_state.clone();
        let events = self.events_tx.clone();
        let handle = tokio::spawn(dispatcher::run(reader, writer, iq, sm, sm_state, events));
        *self.dispatcher_task.lock().await = Some(handle);
    }

    async fn adopt_outcome(self: &Arc<Self>, outcome: negotiation::NegotiationOutcome) -> Arc<Writer> {
        *self.jid.lock().unwrap() = Some(outcome.jid);
        self.encrypted.store(outcome.encrypted, Ordering::SeqCst);
        self.authenticated.store(
            self.config.lock().unwrap().username.is_some(),
            Ordering::SeqCst,
        );
        let writer = Arc::new(Writer::new(outcome.write_half, self.sm_state.clone()));
        *self.writer.lock().await = Some(writer.clone());
        self.spawn_dispatcher(outcome.reader, writer.clone()).await;
        self.connected.store(true, Ordering::SeqCst);
        writer
    }

    /// Full reconnect: fresh TCP, full negotiation including bind, then
    /// re-`<enable/>` if Stream Management was previously on (the
    /// `<enabled/>` handler performs the pending-resume-h trim if one is
    /// recorded).
    async fn attempt_full_reconnect(self: &Arc<Self>) {
        debug!("stream management: attempting full reconnect");
        self.abort_dispatcher().await;
        let endpoint = self.endpoint.lock().unwrap().clone();
        let transport = match Transport::connect(&endpoint).await {
            Ok(t) => t,
            Err(e) => {
                warn!("reconnect: transport connect failed: {e}");
                return; // the next tick will retry
            }
        };
        let config = Self::negotiation_config(&self.config.lock().unwrap().clone(), None, true);
        let outcome = match negotiation::negotiate(transport, &config).await {
            Ok(o) => o,
            Err(e) => {
                warn!("reconnect: negotiation failed: {e}");
                let _ = self.events_tx.send(Event::Error {
                    error: e,
                    fatal: false,
                });
                return;
            }
        };
        let wants_resumption = matches!(
            self.sm_state.lock().await.as_ref(),
            Some(s) if s.resumption_enabled
        );
        let writer = self.adopt_outcome(outcome).await;
        if wants_resumption {
            let _ = writer.send_nonza(&SmEngine::enable_request(true, 0)).await;
        }
        self.sm.mark_connected(Instant::now()).await;
    }

    /// Resumption attempt: fresh TCP, re-authenticate, send `<resume/>`
    /// directly (bypassing the dispatcher, which isn't running yet).
    async fn attempt_resume(self: &Arc<Self>) {
        debug!("stream management: attempting resumption");
        self.abort_dispatcher().await;
        let (h, previd) = {
            let state = self.sm_state.lock().await;
            match state.as_ref() {
                Some(s) if s.resumption_enabled => match &s.resumption_id {
                    Some(id) => (s.last_server_ack, id.clone()),
                    None => return,
                },
                _ => return,
            }
        };

        let endpoint = self.endpoint.lock().unwrap().clone();
        let transport = match Transport::connect(&endpoint).await {
            Ok(t) => t,
            Err(_) => return,
        };
        let config = Self::negotiation_config(&self.config.lock().unwrap().clone(), None, false);
        let (mut reader, encrypted) = match negotiation::resume_authenticated(transport, &config).await {
            Ok(v) => v,
            Err(_) => return,
        };

        let resume_el = SmEngine::resume_request(h, &previd);
        let mut buf = Vec::new();
        if resume_el.write_to(&mut buf).is_err() {
            return;
        }
        use tokio::io::AsyncWriteExt as _;
        if reader.io_mut().write_all(&buf).await.is_err() {
            return;
        }

        let response = match reader.next_element(Some(&["resumed", "failed"])).await {
            Ok(el) => el,
            Err(_) => return,
        };

        match response.name() {
            "resumed" => {
                let Ok(k) = crate::stream_management::parse_resumed(&response) else {
                    return;
                };
                let replay = self.sm.handle_resumed(k, Instant::now()).await;
                self.encrypted.store(encrypted, Ordering::SeqCst);
                let (read_half, write_half) = negotiation::split(reader);
                let writer = Arc::new(Writer::new(write_half, self.sm_state.clone()));
                for stanza in &replay {
                    let _ = writer.resend_raw(stanza).await;
                }
                *self.writer.lock().await = Some(writer.clone());
                self.spawn_dispatcher(read_half, writer).await;
                self.connected.store(true, Ordering::SeqCst);
                debug!("stream management: resumed at h={k}");
                let _ = self.events_tx.send(Event::StreamResumed);
            }
            "failed" => {
                let (item_not_found, reported_h) = crate::stream_management::parse_failed(&response);
                warn!("stream management: resume failed (item_not_found={item_not_found})");
                match self.sm.handle_failed(item_not_found, reported_h).await {
                    crate::stream_management::FailedResumeOutcome::ReconnectAndReenable => {
                        self.attempt_full_reconnect().await;
                    }
                    crate::stream_management::FailedResumeOutcome::SurfaceError => {
                        let _ = self.events_tx.send(Event::Error {
                            error: Error::Sm("stream resumption refused".into()),
                            fatal: false,
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

async fn event_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        match event {
            Event::Iq(iq) => {
                let cb = shared.callbacks.lock().unwrap().on_iq.clone();
                if let Some(cb) = cb {
                    cb(iq);
                }
            }
            Event::Message(m) => {
                let cb = shared.callbacks.lock().unwrap().on_message.clone();
                if let Some(cb) = cb {
                    cb(m);
                }
            }
            Event::Presence(p) => {
                let cb = shared.callbacks.lock().unwrap().on_presence.clone();
                if let Some(cb) = cb {
                    cb(p);
                }
            }
            Event::StreamManagementEnabled => {
                let cb = shared.callbacks.lock().unwrap().on_sm_enabled.clone();
                if let Some(cb) = cb {
                    cb();
                }
            }
            Event::StreamResumed => {
                let cb = shared.callbacks.lock().unwrap().on_stream_resumed.clone();
                if let Some(cb) = cb {
                    cb();
                }
            }
            Event::Error { error, fatal } => {
                if fatal {
                    shared.connected.store(false, Ordering::SeqCst);
                }
                let cb = shared.callbacks.lock().unwrap().on_error.clone();
                if let Some(cb) = cb {
                    cb(error, fatal);
                }
            }
        }
    }
}

async fn sm_driver_loop(shared: Arc<Shared>) {
    let interval_duration = shared.sm.config().tick_interval;
    let mut interval = tokio::time::interval(interval_duration);
    loop {
        interval.tick().await;
        match shared.sm.tick(Instant::now()).await {
            TickAction::None => {}
            TickAction::SendAckRequest => {
                let writer = shared.writer.lock().await.clone();
                if let Some(writer) = writer {
                    if writer.send_nonza(&SmEngine::ack_request()).await.is_err() {
                        shared.sm.note_write_failure(Instant::now()).await;
                    }
                }
            }
            TickAction::BeginResume | TickAction::RetryResume => {
                shared.attempt_resume().await;
            }
            TickAction::EscalateToReconnect | TickAction::RetryReconnect => {
                shared.attempt_full_reconnect().await;
            }
            TickAction::FailPermanently => {
                shared.connected.store(false, Ordering::SeqCst);
                let _ = shared.events_tx.send(Event::Error {
                    error: Error::Sm("reconnect budget exhausted".into()),
                    fatal: true,
                });
                return;
            }
        }
    }
}

/// A live (or not-yet-connected) XMPP session.
///
/// Cheaply cloneable; every clone refers to the same underlying stream and
/// background tasks.
#[derive(Clone)]
pub struct Session(Arc<Shared>);

impl Session {
    /// Construct a session. Does not connect; call [`Self::connect`].
    pub fn new(config: SessionConfig) -> Self {
        let endpoint = Shared::endpoint_for(&config);
        let domain = config.hostname.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sm = Arc::new(SmEngine::new(SmConfig::default(), Instant::now()));
        let sm_state = sm.shared_state();
        let shared = Arc::new(Shared {
            config: StdMutex::new(config),
            endpoint: StdMutex::new(endpoint),
            jid: StdMutex::new(None),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            encrypted: AtomicBool::new(false),
            default_language: StdMutex::new("en".to_owned()),
            writer: Mutex::new(None),
            iq: Arc::new(IqCorrelator::new(events_tx.clone(), domain)),
            sm,
            sm_state,
            events_tx,
            callbacks: StdMutex::new(Callbacks::default()),
            dispatcher_task: Mutex::new(None),
            sm_driver_task: Mutex::new(None),
        });
        tokio::spawn(event_loop(shared.clone(), events_rx));
        Self(shared)
    }

    /// Resolve, connect, negotiate, and (if `bind`) bind a resource,
    /// starting the background dispatcher and Stream Management tick.
    pub async fn connect(&self, resource: Option<String>, bind: bool) -> Result<(), Error> {
        let endpoint = Shared::endpoint_for(&self.0.config.lock().unwrap().clone());
        *self.0.endpoint.lock().unwrap() = endpoint.clone();
        let transport = Transport::connect(&endpoint).await?;
        let config = Shared::negotiation_config(&self.0.config.lock().unwrap().clone(), resource, bind);
        let outcome = negotiation::negotiate(transport, &config).await?;
        *self.0.default_language.lock().unwrap() = "en".to_owned();
        self.0.adopt_outcome(outcome).await;

        let mut sm_driver = self.0.sm_driver_task.lock().await;
        if sm_driver.is_none() {
            *sm_driver = Some(tokio::spawn(sm_driver_loop(self.0.clone())));
        }
        Ok(())
    }

    /// Reconfigure credentials and force a fresh connection.
    pub async fn authenticate(&self, username: impl Into<String>, password: impl Into<String>) -> Result<(), Error> {
        {
            let mut config = self.0.config.lock().unwrap();
            config.username = Some(username.into());
            config.password = Some(password.into());
        }
        self.0.abort_dispatcher().await;
        self.connect(None, true).await
    }

    /// Write the closing stream tag, stop the background tasks, and mark
    /// the session disconnected.
    pub async fn close(&self) -> Result<(), Error> {
        let writer = self.0.writer.lock().await.take();
        self.0.abort_dispatcher().await;
        if let Some(handle) = self.0.sm_driver_task.lock().await.take() {
            handle.abort();
        }
        self.0.connected.store(false, Ordering::SeqCst);
        if let Some(writer) = writer {
            writer.close().await?;
        }
        Ok(())
    }

    async fn writer(&self) -> Result<Arc<Writer>, Error> {
        self.0
            .writer
            .lock()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Send a message stanza.
    pub async fn send_message(&self, msg: Message) -> Result<(), Error> {
        self.writer().await?.send_stanza(Stanza::Message(msg)).await
    }

    /// Send a presence stanza.
    pub async fn send_presence(&self, presence: Presence) -> Result<(), Error> {
        self.writer()
            .await?
            .send_stanza(Stanza::Presence(presence))
            .await
    }

    /// Send an IQ request and block for its response.
    ///
    /// `timeout` overrides [`SessionConfig::iq_default_timeout`] for this
    /// call; `None` falls back to the configured default (which itself may
    /// be `None`, meaning wait forever).
    pub async fn iq_request(&self, iq: Iq, timeout: Option<Duration>) -> Result<Iq, Error> {
        let writer = self.writer().await?;
        let timeout = timeout.or(self.0.config.lock().unwrap().iq_default_timeout);
        self.0.iq.request_sync(&writer, iq, timeout).await
    }

    /// Send an IQ request without blocking; `cb` (if given) is invoked with
    /// the response on a separate task.
    pub async fn iq_request_async(
        &self,
        iq: Iq,
        cb: Option<Box<dyn FnOnce(Iq) + Send + 'static>>,
    ) -> Result<String, Error> {
        let writer = self.writer().await?;
        self.0.iq.request_async(&writer, iq, cb).await
    }

    /// Send a `Result`/`Error` response to a peer's IQ request.
    pub async fn iq_response(&self, iq: Iq) -> Result<(), Error> {
        if iq.is_request() {
            return Err(Error::Argument(
                "iq_response requires kind Result or Error".into(),
            ));
        }
        self.writer().await?.send_stanza(Stanza::Iq(iq)).await
    }

    /// Request the peer enable XEP-0198 Stream Management. Success is
    /// reported asynchronously via [`Self::on_sm_enabled`] once `<enabled/>`
    /// arrives.
    pub async fn enable_stream_management(&self, with_resumption: bool, max_seconds: u32) -> Result<(), Error> {
        self.writer()
            .await?
            .send_nonza(&SmEngine::enable_request(with_resumption, max_seconds))
            .await
    }

    /// Register a callback for background errors. `fatal` is `true` when
    /// the session is now permanently disconnected.
    pub fn on_error<F: Fn(Error, bool) + Send + Sync + 'static>(&self, f: F) {
        self.0.callbacks.lock().unwrap().on_error = Some(Arc::new(f));
    }

    /// Register a callback for inbound IQ requests.
    pub fn on_iq<F: Fn(Iq) + Send + Sync + 'static>(&self, f: F) {
        self.0.callbacks.lock().unwrap().on_iq = Some(Arc::new(f));
    }

    /// Register a callback for inbound messages.
    pub fn on_message<F: Fn(Message) + Send + Sync + 'static>(&self, f: F) {
        self.0.callbacks.lock().unwrap().on_message = Some(Arc::new(f));
    }

    /// Register a callback for inbound presence.
    pub fn on_presence<F: Fn(Presence) + Send + Sync + 'static>(&self, f: F) {
        self.0.callbacks.lock().unwrap().on_presence = Some(Arc::new(f));
    }

    /// Register a callback fired once Stream Management is confirmed
    /// enabled.
    pub fn on_sm_enabled<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.0.callbacks.lock().unwrap().on_sm_enabled = Some(Arc::new(f));
    }

    /// Register a callback fired each time the stream is transparently
    /// resumed after a drop.
    pub fn on_stream_resumed<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.0.callbacks.lock().unwrap().on_stream_resumed = Some(Arc::new(f));
    }

    /// The session's bound JID, once connected.
    pub fn jid(&self) -> Option<Jid> {
        self.0.jid.lock().unwrap().clone()
    }

    /// `true` while a stream is up (negotiated, or transparently resumed).
    pub fn connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    /// `true` once SASL completed successfully for the current stream.
    pub fn authenticated(&self) -> bool {
        self.0.authenticated.load(Ordering::SeqCst)
    }

    /// `true` if the current transport is wrapped in TLS.
    pub fn is_encrypted(&self) -> bool {
        self.0.encrypted.load(Ordering::SeqCst)
    }

    /// `xml:lang` of the current stream root.
    pub fn default_language(&self) -> String {
        self.0.default_language.lock().unwrap().clone()
    }
}
