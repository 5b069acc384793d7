//! Component E: the read loop that runs once negotiation hands off the
//! stream.
//!
//! Grounded on the teacher's `stanzastream::worker` read side, which also
//! funnels every parsed element through one place that decides whether it's
//! an IQ correlator match, an application-facing stanza, or a stream
//! management nonza. Simplified into a single free function (rather than an
//! actor with its own event enum) since this crate has no `StanzaStream`
//! front/back split to serve.

use std::sync::Arc;
use std::time::Instant;

use log::debug;
use minidom::Element;
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, ProtocolError};
use crate::event::Event;
use crate::iq_correlator::IqCorrelator;
use crate::stanza::Stanza;
use crate::stanza_xml;
use crate::stream_management::{
    parse_ack, parse_enabled, parse_failed, parse_resumed, FailedResumeOutcome, SmEngine, SmState,
};
use crate::transport::Transport;
use crate::writer::Writer;
use crate::xmlstream::{ElementReader, ReadError};

const SM_NS: &str = "urn:xmpp:sm:3";

fn map_read_err(e: ReadError) -> Error {
    match e {
        ReadError::Io(io) => Error::Io(io),
        ReadError::Protocol(p) => Error::Protocol(p),
        ReadError::StreamClosed => Error::Disconnected,
    }
}

/// Run the read loop until the stream fails or closes. Returns once that
/// happens; the caller (the SM driver in [`crate::session`]) decides
/// whether to reconnect.
pub async fn run(
    mut reader: ElementReader<ReadHalf<Transport>>,
    writer: Arc<Writer>,
    iq: Arc<IqCorrelator>,
    sm: Arc<SmEngine>,
    sm_state: Arc<Mutex<Option<SmState>>>,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        let element = match reader.next_element(None).await {
            Ok(el) => el,
            Err(e) => {
                debug!("dispatcher: read loop ending: {e:?}");
                iq.cancel_all().await;
                let _ = events.send(Event::Error {
                    error: map_read_err(e),
                    fatal: true,
                });
                return;
            }
        };

        let result = if element.ns() == SM_NS {
            handle_sm_nonza(&element, &writer, &sm, &sm_state, &events).await
        } else {
            handle_stanza(element, &iq, &sm_state, &events).await
        };

        if let Err(e) = result {
            let _ = events.send(Event::Error {
                error: e,
                fatal: false,
            });
        }
    }
}

async fn handle_stanza(
    element: Element,
    iq: &IqCorrelator,
    sm_state: &Mutex<Option<SmState>>,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(), Error> {
    match element.name() {
        "iq" | "message" | "presence" => {
            if let Some(state) = sm_state.lock().await.as_mut() {
                state.record_inbound();
            }
            match stanza_xml::from_element(element)? {
                Stanza::Iq(iq_el) if !iq_el.is_request() => {
                    iq.on_response(iq_el).await;
                }
                Stanza::Iq(iq_el) => {
                    let _ = events.send(Event::Iq(iq_el));
                }
                Stanza::Message(m) => {
                    let _ = events.send(Event::Message(m));
                }
                Stanza::Presence(p) => {
                    let _ = events.send(Event::Presence(p));
                }
            }
            Ok(())
        }
        // Unknown top-level elements outside the stream management
        // namespace are silently ignored, matching permissive stream
        // parsers elsewhere in the ecosystem (forward-compatibility with
        // extensions this crate doesn't know about).
        _ => Ok(()),
    }
}

async fn handle_sm_nonza(
    element: &Element,
    writer: &Writer,
    sm: &SmEngine,
    sm_state: &Mutex<Option<SmState>>,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(), Error> {
    match element.name() {
        "r" => {
            let h = sm_state.lock().await.as_ref().map_or(0, |s| s.inbound_seq);
            writer.send_nonza(&SmEngine::ack_reply(h)).await
        }
        "a" => {
            let h = parse_ack(element)?;
            sm.handle_ack(h, Instant::now()).await;
            if let Some(state) = sm_state.lock().await.as_mut() {
                state.record_inbound();
            }
            Ok(())
        }
        "enabled" => {
            let (resume, id, max) = parse_enabled(element)?;
            let replay = sm.handle_enabled(resume, id, max, Instant::now()).await;
            for stanza in &replay {
                writer.resend_raw(stanza).await?;
            }
            let _ = events.send(Event::StreamManagementEnabled);
            Ok(())
        }
        "resumed" => {
            let h = parse_resumed(element)?;
            let replay = sm.handle_resumed(h, Instant::now()).await;
            for stanza in &replay {
                writer.resend_raw(stanza).await?;
            }
            let _ = events.send(Event::StreamResumed);
            Ok(())
        }
        "failed" => {
            let (item_not_found, h) = parse_failed(element);
            match sm.handle_failed(item_not_found, h).await {
                FailedResumeOutcome::ReconnectAndReenable => {
                    let _ = events.send(Event::Error {
                        error: Error::Sm("stream resumption failed, reconnecting".into()),
                        fatal: false,
                    });
                }
                FailedResumeOutcome::SurfaceError => {
                    let _ = events.send(Event::Error {
                        error: Error::Sm("stream resumption failed".into()),
                        fatal: false,
                    });
                }
            }
            Ok(())
        }
        other => Err(ProtocolError::MalformedStreamManagement(format!(
            "unexpected urn:xmpp:sm:3 element <{other}/>"
        ))
        .into()),
    }
}
