//! Error taxonomy for the session core.
//!
//! Shaped after `tokio-xmpp`'s own `error.rs`: hand-rolled `Display`/`Error`
//! impls and `From` conversions rather than a derive-macro crate, because
//! that is how the teacher crate does it.

use std::fmt;
use std::io;
use std::net::AddrParseError;

/// Top-level error type returned by fallible APIs on [`crate::Session`].
#[derive(Debug)]
pub enum Error {
    /// Invalid JID, port out of range, empty hostname, or wrong IQ kind
    /// passed to an API that requires a specific one.
    Argument(String),
    /// An API was called before `connect()` completed (or after the
    /// session was permanently closed).
    NotConnected,
    /// I/O error on the transport. Fatal to the current stream.
    Io(io::Error),
    /// The transport disconnected (cleanly or otherwise) and no further
    /// recovery is in progress.
    Disconnected,
    /// TLS handshake or certificate verification failed.
    Tls(String),
    /// SASL / resource binding failure.
    Auth(AuthError),
    /// Malformed or unexpected stanza/element on the wire.
    Protocol(ProtocolError),
    /// An IQ request did not receive a response within its timeout.
    Timeout,
    /// Unrecoverable Stream Management failure after the reconnect budget
    /// was exhausted.
    Sm(String),
    /// Error parsing a Jabber ID.
    JidParse(jid::Error),
    /// Invalid network address.
    Addr(AddrParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Argument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotConnected => write!(f, "not connected"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Disconnected => write!(f, "disconnected"),
            Error::Tls(msg) => write!(f, "TLS error: {msg}"),
            Error::Auth(e) => write!(f, "authentication error: {e}"),
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::Timeout => write!(f, "request timed out"),
            Error::Sm(msg) => write!(f, "stream management error: {msg}"),
            Error::JidParse(e) => write!(f, "JID parse error: {e}"),
            Error::Addr(e) => write!(f, "invalid network address: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Auth(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::JidParse(e) => Some(e),
            Error::Addr(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Self {
        Error::Addr(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

/// XMPP protocol-level error: unexpected element, malformed stanza, or a
/// bind response missing the bound JID.
#[derive(Debug)]
pub enum ProtocolError {
    /// The stream parser encountered an element that was not in the set of
    /// names expected at this point in the negotiation.
    UnexpectedElement {
        /// Local name of the element which was expected.
        expected: Vec<String>,
        /// Local name of the element that was actually received.
        got: String,
    },
    /// Underlying XML parse error from `rxml`.
    Parse(String),
    /// The peer closed the stream (`</stream:stream>`) while we were
    /// reading a child element.
    StreamClosed,
    /// The `<stream:stream>` header carried no recognisable namespace or id.
    MalformedStreamHeader,
    /// Resource binding succeeded at the protocol level but the response
    /// carried no `<jid>`.
    BindResponseMissingJid,
    /// A stream management nonza (`<r/>`, `<a/>`, `<enabled/>`, ...) was
    /// malformed.
    MalformedStreamManagement(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::UnexpectedElement { expected, got } => write!(
                f,
                "unexpected element <{got}/>, expected one of {expected:?}"
            ),
            ProtocolError::Parse(e) => write!(f, "XML parse error: {e}"),
            ProtocolError::StreamClosed => write!(f, "stream closed by peer"),
            ProtocolError::MalformedStreamHeader => write!(f, "malformed stream header"),
            ProtocolError::BindResponseMissingJid => {
                write!(f, "bind response contained no jid")
            }
            ProtocolError::MalformedStreamManagement(msg) => {
                write!(f, "malformed stream management element: {msg}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Authentication error: no supported SASL mechanism, a SASL failure
/// reported by the server, or a mandatory-TLS refusal.
#[derive(Debug)]
pub enum AuthError {
    /// None of the mechanisms advertised by the server are supported
    /// (or credentials were not supplied for any of them).
    NoMechanism,
    /// The server rejected the chosen mechanism's exchange.
    Failure(String),
    /// Our own SASL implementation rejected the exchange (e.g. a bad
    /// server signature in a SCRAM `<success/>`).
    Local(String),
    /// The server requires STARTTLS but it was disabled by the caller.
    TlsRequired,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(f, "no supported SASL mechanism advertised"),
            AuthError::Failure(c) => write!(f, "SASL failure reported by server: {c}"),
            AuthError::Local(msg) => write!(f, "local SASL error: {msg}"),
            AuthError::TlsRequired => write!(f, "TLS required"),
        }
    }
}

impl std::error::Error for AuthError {}
