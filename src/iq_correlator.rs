//! Component F: matches IQ responses to the request that asked for them.
//!
//! Grounded on the teacher's `client::iq` (`IqResponseToken`,
//! `IqMapEntryHandle`): a oneshot per pending synchronous request, with the
//! map entry's lifetime tied to the request rather than to an explicit
//! cancel call. This module additionally supports the async/callback mode
//! and the timeout-implies-disconnect special case for ping liveness
//! probes, neither of which the teacher's `IqResponseToken` needed since it
//! only ever awaits once, directly.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::Error;
use crate::event::Event;
use crate::stanza::{Iq, Stanza};
use crate::writer::Writer;

const PING_NS: &str = "urn:xmpp:ping";

type Callback = Box<dyn FnOnce(Iq) + Send + 'static>;

/// Tracks in-flight IQ requests and routes responses back to whoever sent
/// them.
pub struct IqCorrelator {
    waiters: Mutex<HashMap<String, oneshot::Sender<Iq>>>,
    callbacks: Mutex<HashMap<String, Callback>>,
    responses: Mutex<HashMap<String, Iq>>,
    events: mpsc::UnboundedSender<Event>,
    /// The session's own server domain, so a ping addressed to the bare
    /// server JID (`to=domain`) is recognised as server-directed just like
    /// one with no `to` at all.
    server_domain: String,
}

/// `true` for a `urn:xmpp:ping` request with no `to`, or one addressed to
/// the bare server domain — both are the server-liveness probe whose
/// timeout §4.F treats as a hard disconnection, not just a request timeout.
fn is_server_ping(iq: &Iq, server_domain: &str) -> bool {
    let to_is_server = match &iq.header.to {
        None => true,
        Some(to) => to.node().is_none() && to.domain().as_str().eq_ignore_ascii_case(server_domain),
    };
    to_is_server
        && iq
            .payload
            .as_ref()
            .map(|p| p.name() == "ping" && p.ns() == PING_NS)
            .unwrap_or(false)
}

impl IqCorrelator {
    /// `events` is the session's shared event sink; used only for the
    /// ping-timeout-implies-disconnect special case. `server_domain` is the
    /// session's configured server domain, used by the same special case.
    pub fn new(events: mpsc::UnboundedSender<Event>, server_domain: impl Into<String>) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            events,
            server_domain: server_domain.into(),
        }
    }

    /// Send `iq` (which must be `Get` or `Set`) and block until its
    /// response arrives, the session is cancelled, or `timeout` elapses.
    /// `None` means wait forever.
    pub async fn request_sync(
        &self,
        writer: &Writer,
        iq: Iq,
        timeout: Option<Duration>,
    ) -> Result<Iq, Error> {
        if !iq.is_request() {
            return Err(Error::Argument("iq_request requires kind Get or Set".into()));
        }
        let is_ping = is_server_ping(&iq, &self.server_domain);

        let mut stanza = Stanza::Iq(iq);
        let id = stanza.ensure_id().to_owned();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id.clone(), tx);

        if let Err(e) = writer.send_stanza(stanza).await {
            self.waiters.lock().await.remove(&id);
            return Err(e);
        }

        let outcome = match timeout {
            Some(d) => tokio::time::timeout(d, rx).await,
            None => Ok(rx.await),
        };

        match outcome {
            Ok(Ok(iq)) => Ok(iq),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_elapsed) => {
                self.waiters.lock().await.remove(&id);
                if is_ping {
                    let _ = self.events.send(Event::Error {
                        error: Error::Disconnected,
                        fatal: true,
                    });
                }
                Err(Error::Timeout)
            }
        }
    }

    /// Send `iq` and return its assigned id immediately. `cb`, if given, is
    /// invoked with the response on a separate task once it arrives; if
    /// omitted, the response is held in the `responses` map instead.
    pub async fn request_async(
        &self,
        writer: &Writer,
        iq: Iq,
        cb: Option<Callback>,
    ) -> Result<String, Error> {
        if !iq.is_request() {
            return Err(Error::Argument("iq_request requires kind Get or Set".into()));
        }
        let mut stanza = Stanza::Iq(iq);
        let id = stanza.ensure_id().to_owned();
        if let Some(cb) = cb {
            self.callbacks.lock().await.insert(id.clone(), cb);
        }
        writer.send_stanza(stanza).await?;
        Ok(id)
    }

    /// Take a response a polling caller previously left unclaimed (no
    /// waiter, no callback, at arrival time).
    pub async fn take_response(&self, id: &str) -> Option<Iq> {
        self.responses.lock().await.remove(id)
    }

    /// Route an arrived `Result`/`Error` IQ to whichever waiter or callback
    /// is registered for its id. Called by the dispatcher.
    pub async fn on_response(&self, iq: Iq) {
        let Some(id) = iq.header.id.clone() else {
            return;
        };
        if let Some(tx) = self.waiters.lock().await.remove(&id) {
            let _ = tx.send(iq);
            return;
        }
        if let Some(cb) = self.callbacks.lock().await.remove(&id) {
            // Never run the callback inline on the dispatcher's task.
            tokio::spawn(async move { cb(iq) });
            return;
        }
        self.responses.lock().await.insert(id, iq);
    }

    /// Unblock every pending synchronous waiter with `Disconnected` and
    /// drop every pending callback registration. Called once the
    /// dispatcher's read loop exits.
    pub async fn cancel_all(&self) {
        self.waiters.lock().await.clear();
        self.callbacks.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::IqKind;
    #[tokio::test]
    async fn on_response_signals_the_matching_waiter() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let correlator = IqCorrelator::new(tx, "example.org");
        let (sender, receiver) = oneshot::channel();
        correlator.waiters.lock().await.insert("1".to_owned(), sender);

        let response = Iq::result_for("1", None);
        correlator.on_response(response).await;

        let got = receiver.await.unwrap();
        assert_eq!(got.header.id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn on_response_with_no_waiter_or_callback_is_stashed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let correlator = IqCorrelator::new(tx, "example.org");
        correlator.on_response(Iq::result_for("unclaimed", None)).await;
        let stashed = correlator.take_response("unclaimed").await;
        assert!(stashed.is_some());
    }

    #[tokio::test]
    async fn rejects_non_request_iq_kinds() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let correlator = IqCorrelator::new(tx, "example.org");
        let bad = Iq::result_for("x", None);
        assert!(matches!(bad.kind, IqKind::Result));
        // request_sync/async both reject Result/Error kinds up front; we
        // can't easily build a Writer here without a live transport, so
        // this test only pins the is_request() gate itself.
        assert!(!bad.is_request());
    }
}
