//! The three XMPP stanza kinds, as a tagged union over a common header.
//!
//! `xmpp-parsers` models each stanza as an exhaustively-typed structure for
//! every extension in existence; that belongs to the higher-level façade
//! this crate deliberately stays below (see the crate-level docs). Here a
//! stanza is a common header plus one opaque [`minidom::Element`] payload,
//! which is exactly what the core negotiation, dispatch and stream
//! management logic needs to look at.

use jid::Jid;
use minidom::Element;

use crate::event::make_id;

/// Attributes shared by all three stanza kinds.
#[derive(Debug, Clone, Default)]
pub struct Header {
    /// Destination JID, if any.
    pub to: Option<Jid>,
    /// Origin JID, if any. Usually filled in by the server on receipt.
    pub from: Option<Jid>,
    /// Stanza id. Required on `Iq` before it is sent; optional otherwise.
    pub id: Option<String>,
    /// `xml:lang` BCP-47 tag, if set explicitly on the stanza.
    pub language: Option<String>,
}

/// `type='...'` of an `<iq/>` stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    /// A query.
    Get,
    /// A request to change state.
    Set,
    /// A successful response to a `Get`/`Set` request.
    Result,
    /// An error response to a `Get`/`Set` request.
    Error,
}

impl IqKind {
    /// `true` for `Get`/`Set`: these require exactly one matching response.
    pub fn is_request(self) -> bool {
        matches!(self, IqKind::Get | IqKind::Set)
    }

    /// Wire form of the `type` attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            IqKind::Get => "get",
            IqKind::Set => "set",
            IqKind::Result => "result",
            IqKind::Error => "error",
        }
    }

    /// Parse the `type` attribute of an `<iq/>` element.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(IqKind::Get),
            "set" => Some(IqKind::Set),
            "result" => Some(IqKind::Result),
            "error" => Some(IqKind::Error),
            _ => None,
        }
    }
}

/// An `<iq/>` stanza.
#[derive(Debug, Clone)]
pub struct Iq {
    /// Common header.
    pub header: Header,
    /// `Get | Set | Result | Error`.
    pub kind: IqKind,
    /// Query/response payload. `None` is only valid for `Result`/`Error`
    /// when the server sent an empty body.
    pub payload: Option<Element>,
}

impl Iq {
    /// Build a `type='get'` IQ with no id assigned yet.
    pub fn get(payload: Element) -> Self {
        Self {
            header: Header::default(),
            kind: IqKind::Get,
            payload: Some(payload),
        }
    }

    /// Build a `type='set'` IQ with no id assigned yet.
    pub fn set(payload: Element) -> Self {
        Self {
            header: Header::default(),
            kind: IqKind::Set,
            payload: Some(payload),
        }
    }

    /// Build a `type='result'` response to `request_id`.
    pub fn result_for(request_id: impl Into<String>, payload: Option<Element>) -> Self {
        Self {
            header: Header {
                id: Some(request_id.into()),
                ..Header::default()
            },
            kind: IqKind::Result,
            payload,
        }
    }

    /// `true` if this IQ requires a `Result`/`Error` response.
    pub fn is_request(&self) -> bool {
        self.kind.is_request()
    }
}

/// A `<message/>` stanza.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Common header.
    pub header: Header,
    /// The full stanza body (e.g. containing `<body/>`, `<subject/>`,
    /// chat-state nonzas, ...). Kept opaque: the application layer parses
    /// whatever extensions it cares about.
    pub payload: Element,
}

/// A `<presence/>` stanza.
#[derive(Debug, Clone, Default)]
pub struct Presence {
    /// Common header.
    pub header: Header,
    /// The full stanza body (e.g. `<show/>`, `<status/>`, MUC/caps
    /// extensions, ...).
    pub payload: Element,
}

/// A stanza sent or received over the stream.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// IQ stanza.
    Iq(Iq),
    /// Message stanza.
    Message(Message),
    /// Presence stanza.
    Presence(Presence),
}

impl Stanza {
    /// Shared header accessor.
    pub fn header(&self) -> &Header {
        match self {
            Stanza::Iq(iq) => &iq.header,
            Stanza::Message(m) => &m.header,
            Stanza::Presence(p) => &p.header,
        }
    }

    /// Mutable shared header accessor.
    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Stanza::Iq(iq) => &mut iq.header,
            Stanza::Message(m) => &mut m.header,
            Stanza::Presence(p) => &mut p.header,
        }
    }

    /// Assign a fresh id if none is set yet, returning the id now in effect.
    pub fn ensure_id(&mut self) -> &str {
        let header = self.header_mut();
        if header.id.is_none() {
            header.id = Some(make_id());
        }
        header.id.as_deref().unwrap()
    }

    /// `true` if this stanza participates in XEP-0198 counting/caching
    /// (every stanza kind does — only stream-level nonzas like `<r/>`/`<a/>`
    /// and the stream header itself are excluded, and those are never
    /// represented as a [`Stanza`] at all).
    pub fn is_sm_eligible(&self) -> bool {
        true
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

impl From<Message> for Stanza {
    fn from(m: Message) -> Self {
        Stanza::Message(m)
    }
}

impl From<Presence> for Stanza {
    fn from(p: Presence) -> Self {
        Stanza::Presence(p)
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Iq(iq) => Ok(iq),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Message(m) => Ok(m),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Presence(p) => Ok(p),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_id_is_idempotent_once_set() {
        let mut msg = Stanza::Message(Message::default());
        let id = msg.ensure_id().to_owned();
        let id2 = msg.ensure_id().to_owned();
        assert_eq!(id, id2);
    }

    #[test]
    fn iq_request_kinds() {
        assert!(IqKind::Get.is_request());
        assert!(IqKind::Set.is_request());
        assert!(!IqKind::Result.is_request());
        assert!(!IqKind::Error.is_request());
    }

    #[test]
    fn iq_kind_roundtrips_through_str() {
        for kind in [IqKind::Get, IqKind::Set, IqKind::Result, IqKind::Error] {
            assert_eq!(IqKind::parse(kind.as_str()), Some(kind));
        }
    }
}
