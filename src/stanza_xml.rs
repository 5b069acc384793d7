//! Wire serialization between [`Stanza`] and [`minidom::Element`].
//!
//! A [`Stanza::Iq`] payload is the single query/response child element
//! (`<query/>`, `<bind/>`, `<ping/>`, ...); [`Message`] and [`Presence`]
//! payloads are a synthetic container whose children and text nodes are the
//! stanza's actual content (`<body/>`, `<subject/>`, `<show/>`, ...) — the
//! container itself never appears on the wire, only its contents do.

use minidom::{Element, Node};

use crate::error::ProtocolError;
use crate::stanza::{Header, Iq, IqKind, Message, Presence, Stanza};

const CLIENT_NS: &str = "jabber:client";
/// Name of the synthetic container [`Message`]/[`Presence`] payloads use.
/// Never written to or read from the wire.
const PAYLOAD_CONTAINER: &str = "payload";

fn header_from_element(el: &Element) -> Header {
    Header {
        to: el.attr("to").and_then(|s| s.parse().ok()),
        from: el.attr("from").and_then(|s| s.parse().ok()),
        id: el.attr("id").map(str::to_owned),
        language: el.attr("xml:lang").map(str::to_owned),
    }
}

fn apply_header(mut builder: minidom::ElementBuilder, header: &Header) -> minidom::ElementBuilder {
    if let Some(to) = &header.to {
        builder = builder.attr("to", to.to_string());
    }
    if let Some(from) = &header.from {
        builder = builder.attr("from", from.to_string());
    }
    if let Some(id) = &header.id {
        builder = builder.attr("id", id.clone());
    }
    if let Some(lang) = &header.language {
        builder = builder.attr("xml:lang", lang.clone());
    }
    builder
}

fn merge_payload_nodes(into: &mut Element, payload: &Element) {
    for node in payload.nodes() {
        match node {
            Node::Element(child) => into.append_child(child.clone()),
            Node::Text(text) => into.append_text_node(text.clone()),
        }
    }
}

fn wire_children_into_container(el: &Element) -> Element {
    let mut container = Element::builder(PAYLOAD_CONTAINER, CLIENT_NS).build();
    merge_payload_nodes(&mut container, el);
    container
}

/// Serialize a stanza to the element that is actually put on the wire.
pub fn to_element(stanza: &Stanza) -> Element {
    match stanza {
        Stanza::Iq(iq) => {
            let builder = apply_header(
                Element::builder("iq", CLIENT_NS).attr("type", iq.kind.as_str()),
                &iq.header,
            );
            let mut el = builder.build();
            if let Some(payload) = &iq.payload {
                el.append_child(payload.clone());
            }
            el
        }
        Stanza::Message(m) => {
            let builder = apply_header(Element::builder("message", CLIENT_NS), &m.header);
            let mut el = builder.build();
            merge_payload_nodes(&mut el, &m.payload);
            el
        }
        Stanza::Presence(p) => {
            let builder = apply_header(Element::builder("presence", CLIENT_NS), &p.header);
            let mut el = builder.build();
            merge_payload_nodes(&mut el, &p.payload);
            el
        }
    }
}

/// Parse a stanza off the wire. `el` must be a direct child of the stream
/// root named `iq`, `message`, or `presence` — callers are expected to have
/// already filtered on that via [`crate::xmlstream::ElementReader`].
pub fn from_element(el: Element) -> Result<Stanza, ProtocolError> {
    let header = header_from_element(&el);
    match el.name() {
        "iq" => {
            let kind = el
                .attr("type")
                .and_then(IqKind::parse)
                .ok_or_else(|| ProtocolError::Parse("iq element missing a valid type".into()))?;
            let payload = el.children().next().cloned();
            Ok(Stanza::Iq(Iq {
                header,
                kind,
                payload,
            }))
        }
        "message" => Ok(Stanza::Message(Message {
            header,
            payload: wire_children_into_container(&el),
        })),
        "presence" => Ok(Stanza::Presence(Presence {
            header,
            payload: wire_children_into_container(&el),
        })),
        other => Err(ProtocolError::UnexpectedElement {
            expected: vec!["iq".into(), "message".into(), "presence".into()],
            got: other.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iq_roundtrips_its_single_payload_child() {
        let query = Element::builder("query", "jabber:iq:roster").build();
        let iq = Stanza::Iq(Iq::get(query));
        let el = to_element(&iq);
        assert_eq!(el.name(), "iq");
        assert_eq!(el.attr("type"), Some("get"));

        let back = from_element(el).unwrap();
        match back {
            Stanza::Iq(iq) => assert_eq!(iq.kind, IqKind::Get),
            _ => panic!("expected iq"),
        }
    }

    #[test]
    fn message_body_survives_the_round_trip() {
        let mut payload = Element::builder(PAYLOAD_CONTAINER, CLIENT_NS).build();
        let mut body = Element::builder("body", CLIENT_NS).build();
        body.append_text_node("hello");
        payload.append_child(body);
        let msg = Stanza::Message(Message {
            header: Header::default(),
            payload,
        });

        let el = to_element(&msg);
        assert_eq!(el.name(), "message");
        assert_eq!(el.get_child("body", CLIENT_NS).unwrap().text(), "hello");

        let back = from_element(el).unwrap();
        let Stanza::Message(back) = back else {
            panic!("expected message");
        };
        assert_eq!(back.payload.get_child("body", CLIENT_NS).unwrap().text(), "hello");
    }
}
