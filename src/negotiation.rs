//! Component C: drives the stream from a freshly connected [`Transport`] to
//! a bound, ready-to-dispatch session.
//!
//! Grounded on the teacher's `client/login.rs` (`auth`, `client_login`) and
//! `client/bind.rs`, generalized into a single `async fn` that owns the
//! parser exclusively for the whole bring-up — there is no dispatcher task
//! yet at this point, so there is nothing to race with.
//!
//! [`resume_authenticated`] reuses the open/STARTTLS/SASL prefix for XEP-0198
//! resumption, which re-authenticates on the new TCP connection but skips
//! resource binding in favour of a `<resume/>` request; see
//! [`crate::stream_management`].

use std::collections::HashSet;

use jid::Jid;
use minidom::Element;
use sasl::client::Mechanism as _;
use sasl::common::Credentials;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{AuthError, Error, ProtocolError};
use crate::sasl_mech;
use crate::transport::Transport;
use crate::xmlstream::{ElementReader, ReadError};

const STREAM_NS: &str = "http://etherx.jabber.org/streams";
const CLIENT_NS: &str = "jabber:client";
const TLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const BIND_IQ_ID: &str = "_bind";

/// Parameters the negotiator needs. Owned by [`crate::session::SessionConfig`].
#[derive(Clone)]
pub struct NegotiationConfig {
    /// The server's domain (also the `to=` of the stream open).
    pub domain: String,
    /// SASL username (the JID's `node` part), if authenticating.
    pub username: Option<String>,
    /// SASL password, if authenticating.
    pub password: Option<String>,
    /// Requested resource, or `None` to let the server assign one.
    pub resource: Option<String>,
    /// Offer STARTTLS when the server advertises it.
    pub starttls: bool,
    /// Fail if the stream is not encrypted by the time SASL would start.
    pub require_tls: bool,
    /// Perform resource binding once authenticated.
    pub bind: bool,
}

/// Everything the rest of the session needs once negotiation completes.
pub struct NegotiationOutcome {
    /// The read half, ready for the dispatcher.
    pub reader: ElementReader<ReadHalf<Transport>>,
    /// The write half, to be wrapped by [`crate::writer::Writer`].
    pub write_half: WriteHalf<Transport>,
    /// The (possibly server-assigned) bound JID.
    pub jid: Jid,
    /// Whether the stream ended up encrypted.
    pub encrypted: bool,
}

fn map_read_err(e: ReadError) -> Error {
    match e {
        ReadError::Io(io) => Error::Io(io),
        ReadError::Protocol(p) => Error::Protocol(p),
        ReadError::StreamClosed => Error::Disconnected,
    }
}

fn stream_open_tag(to: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{to}' version='1.0' \
         xmlns='{CLIENT_NS}' xmlns:stream='{STREAM_NS}' xml:lang='en'>"
    )
}

fn serialize(element: &Element) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    element
        .write_to(&mut buf)
        .map_err(|e| Error::Protocol(ProtocolError::Parse(e.to_string())))?;
    Ok(buf)
}

async fn open_and_read_features<S>(mut io: S, to: &str) -> Result<(ElementReader<S>, Element), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(stream_open_tag(to).as_bytes()).await?;
    let mut reader = ElementReader::open(io).await.map_err(map_read_err)?;
    let features = reader
        .next_element(Some(&["features"]))
        .await
        .map_err(map_read_err)?;
    Ok((reader, features))
}

/// Open the stream and perform the STARTTLS loop, stopping once the peer no
/// longer advertises `starttls` (or we've decided not to offer it).
async fn bring_up_tls(
    transport: Transport,
    config: &NegotiationConfig,
) -> Result<(ElementReader<Transport>, Element, bool), Error> {
    let (mut reader, mut features) = open_and_read_features(transport, &config.domain).await?;
    let mut encrypted = false;

    while config.starttls && features.get_child("starttls", TLS_NS).is_some() && !encrypted {
        let request = Element::builder("starttls", TLS_NS).build();
        reader.io_mut().write_all(&serialize(&request)?).await?;

        let response = reader
            .next_element(Some(&["proceed", "failure"]))
            .await
            .map_err(map_read_err)?;
        if response.name() == "failure" {
            return Err(Error::Tls("server refused STARTTLS".into()));
        }

        let transport = reader.into_inner().upgrade_tls(&config.domain).await?;
        encrypted = true;
        let (new_reader, new_features) = open_and_read_features(transport, &config.domain).await?;
        reader = new_reader;
        features = new_features;
    }

    if config.require_tls && !encrypted {
        return Err(AuthError::TlsRequired.into());
    }

    Ok((reader, features, encrypted))
}

fn build_credentials(config: &NegotiationConfig, reader: &ElementReader<Transport>) -> Option<Credentials> {
    let (username, password) = match (&config.username, &config.password) {
        (Some(u), Some(p)) => (u, p),
        _ => return None,
    };
    Some(
        Credentials::default()
            .with_username(username.clone())
            .with_password(password.clone())
            .with_channel_binding(
                reader
                    .io_ref()
                    .channel_binding()
                    .map(sasl::common::ChannelBinding::TlsExporter)
                    .unwrap_or(sasl::common::ChannelBinding::None),
            ),
    )
}

fn advertised_mechanisms(features: &Element) -> HashSet<String> {
    features
        .get_child("mechanisms", SASL_NS)
        .map(|mechanisms| {
            mechanisms
                .children()
                .filter(|c| c.name() == "mechanism")
                .map(|c| c.text())
                .collect()
        })
        .unwrap_or_default()
}

async fn authenticate<S>(
    reader: &mut ElementReader<S>,
    mechanisms: &HashSet<String>,
    creds: &Credentials,
    domain: &str,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut mechanism = sasl_mech::select(mechanisms, creds, domain)?;

    let initial = mechanism.initial();
    let mut auth_el = Element::builder("auth", SASL_NS)
        .attr("mechanism", mechanism.name())
        .build();
    if !initial.is_empty() {
        auth_el.append_text_node(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            &initial,
        ));
    }
    reader.io_mut().write_all(&serialize(&auth_el)?).await?;

    loop {
        let el = reader
            .next_element(Some(&["challenge", "success", "failure"]))
            .await
            .map_err(map_read_err)?;
        match el.name() {
            "failure" => {
                let condition = el
                    .children()
                    .next()
                    .map(|c| c.name().to_owned())
                    .unwrap_or_else(|| "unknown".to_owned());
                return Err(AuthError::Failure(condition).into());
            }
            "challenge" => {
                let data =
                    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, el.text())
                        .map_err(|e| AuthError::Local(e.to_string()))?;
                let response = mechanism.response(&data).map_err(AuthError::Local)?;
                let mut response_el = Element::builder("response", SASL_NS).build();
                response_el.append_text_node(base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    &response,
                ));
                reader.io_mut().write_all(&serialize(&response_el)?).await?;
            }
            "success" => {
                let data =
                    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, el.text())
                        .unwrap_or_default();
                mechanism.success(&data).map_err(AuthError::Local)?;
                return Ok(());
            }
            _ => unreachable!("filtered by next_element"),
        }
    }
}

async fn bind_resource<S>(reader: &mut ElementReader<S>, resource: Option<&str>) -> Result<Jid, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut bind_el = Element::builder("bind", BIND_NS).build();
    if let Some(resource) = resource {
        let mut resource_el = Element::builder("resource", BIND_NS).build();
        resource_el.append_text_node(resource.to_owned());
        bind_el.append_child(resource_el);
    }
    let mut iq = Element::builder("iq", CLIENT_NS)
        .attr("type", "set")
        .attr("id", BIND_IQ_ID)
        .build();
    iq.append_child(bind_el);
    reader.io_mut().write_all(&serialize(&iq)?).await?;

    loop {
        let el = reader.next_element(None).await.map_err(map_read_err)?;
        if el.name() != "iq" || el.attr("id") != Some(BIND_IQ_ID) {
            continue;
        }
        if el.attr("type") != Some("result") {
            return Err(ProtocolError::BindResponseMissingJid.into());
        }
        let bound = el
            .get_child("bind", BIND_NS)
            .and_then(|b| b.get_child("jid", BIND_NS))
            .map(|j| j.text())
            .ok_or(ProtocolError::BindResponseMissingJid)?;
        return bound.parse().map_err(Error::from);
    }
}

/// Drive the full bring-up sequence: open → features → (STARTTLS)* → SASL →
/// open → features → bind.
pub async fn negotiate(
    transport: Transport,
    config: &NegotiationConfig,
) -> Result<NegotiationOutcome, Error> {
    let (reader, features, encrypted) = bring_up_tls(transport, config).await?;
    let creds = build_credentials(config, &reader);

    let (mut reader, features) = match creds {
        None => (reader, features),
        Some(creds) => {
            let mut reader = reader;
            let mechanisms = advertised_mechanisms(&features);
            authenticate(&mut reader, &mechanisms, &creds, &config.domain).await?;
            let transport = reader.into_inner();
            open_and_read_features(transport, &config.domain).await?
        }
    };

    let jid = if config.bind && features.get_child("bind", BIND_NS).is_some() {
        bind_resource(&mut reader, config.resource.as_deref()).await?
    } else {
        let username = config.username.as_deref().unwrap_or("");
        format!("{username}@{}", config.domain).parse().map_err(Error::from)?
    };

    let (read_half, write_half) = split(reader);
    Ok(NegotiationOutcome {
        reader: read_half,
        write_half,
        jid,
        encrypted,
    })
}

/// Re-authenticate on a freshly connected transport, stopping right after
/// the post-SASL stream restart, without binding. Used by
/// [`crate::stream_management`] to re-establish the underlying stream before
/// sending `<resume/>`.
pub async fn resume_authenticated(
    transport: Transport,
    config: &NegotiationConfig,
) -> Result<(ElementReader<Transport>, bool), Error> {
    let (mut reader, features, encrypted) = bring_up_tls(transport, config).await?;
    let creds = build_credentials(config, &reader)
        .ok_or_else(|| Error::Argument("credentials are required to resume a stream".into()))?;
    let mechanisms = advertised_mechanisms(&features);
    authenticate(&mut reader, &mechanisms, &creds, &config.domain).await?;
    let transport = reader.into_inner();
    let (reader, _features) = open_and_read_features(transport, &config.domain).await?;
    Ok((reader, encrypted))
}

/// Split a negotiated stream into independent read/write halves, handing
/// off to the long-running dispatcher and writer.
pub fn split(reader: ElementReader<Transport>) -> (ElementReader<ReadHalf<Transport>>, WriteHalf<Transport>) {
    let (transport, state) = reader.into_io_and_state();
    let (read_half, write_half) = tokio::io::split(transport);
    (ElementReader::from_io_and_state(read_half, state), write_half)
}
