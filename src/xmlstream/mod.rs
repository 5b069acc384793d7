// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # RFC 6120 XML streams
//!
//! This module turns a byte stream carrying a single, synthetic
//! `<stream:stream>` document into a lazy sequence of the root's direct
//! child elements, materialised as [`minidom::Element`] trees. It is the
//! lowest layer of the core: the [`crate::negotiation`] and
//! [`crate::dispatcher`] modules are the only other code that touches it
//! directly.
//!
//! Bytes are pulled from the underlying [`tokio::io::AsyncRead`] into an
//! `rxml` parser incrementally, the same way `minidom` itself builds an
//! `Element` tree over `rxml` events — except here the tree builder stops
//! and yields control back to the caller every time it completes a
//! direct child of the stream root, rather than reading to the end of the
//! document (there is no end, until the peer closes the stream).

use std::collections::VecDeque;
use std::io;

use rxml::{Event, Namespace, Parser};
use tokio::io::{AsyncRead, AsyncReadExt};

use minidom::Element;

use crate::error::ProtocolError;

/// Name + namespace of the stream root, as parsed out of the opening
/// `<stream:stream>` tag.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    /// `xmlns` of the stream root (e.g. `jabber:client`).
    pub namespace: String,
    /// `id` attribute of the stream root, if the peer set one.
    pub id: Option<String>,
    /// `from` attribute of the stream root, if the peer set one.
    pub from: Option<String>,
    /// `xml:lang` attribute of the stream root. Defaults to `en`.
    pub lang: String,
}

/// A non-fatal or fatal condition encountered while reading the next
/// element.
#[derive(Debug)]
pub enum ReadError {
    /// The underlying transport failed. Fatal to the stream.
    Io(io::Error),
    /// The XML was not well-formed, or violated the stream contract
    /// (wrong namespace, unbalanced tags, ...).
    Protocol(ProtocolError),
    /// The peer closed the stream root (`</stream:stream>`).
    StreamClosed,
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

impl From<ProtocolError> for ReadError {
    fn from(e: ProtocolError) -> Self {
        ReadError::Protocol(e)
    }
}

/// Minimal builder that assembles one subtree (a stream child, or the
/// stream header itself) out of a run of `rxml` events.
struct TreeBuilder {
    // Stack of elements under construction. The top of the stack is the
    // element currently receiving children/text; when it is popped and the
    // stack becomes empty, the finished element is the subtree's root.
    stack: Vec<Element>,
    finished: Option<Element>,
}

/// `minidom::Element` attributes are flat `name -> value` strings with no
/// namespace of their own; the only namespaced attribute XMPP ever uses is
/// `xml:lang`, which `minidom` spells with its conventional prefix rather
/// than the XML namespace URI `rxml` reports it under.
fn attr_key(ns: &Namespace, local: &str) -> String {
    if *ns == Namespace::xml() {
        format!("xml:{local}")
    } else {
        local.to_owned()
    }
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            finished: None,
        }
    }

    /// Feed one event. Returns `true` once a full subtree has been
    /// completed and is available via [`Self::take`].
    fn feed(&mut self, event: Event) -> Result<bool, ProtocolError> {
        match event {
            Event::XmlDeclaration(..) => Ok(false),
            Event::StartElement(_, (ns, name), attrs) => {
                let mut builder = Element::builder(name.as_str(), ns.as_str());
                for ((attr_ns, local), value) in attrs.into_iter() {
                    builder = builder.attr(attr_key(&attr_ns, local.as_str()), value.as_str());
                }
                self.stack.push(builder.build());
                Ok(false)
            }
            Event::Text(_, data) => {
                if let Some(top) = self.stack.last_mut() {
                    top.append_text_node(data.as_str());
                }
                Ok(false)
            }
            Event::EndElement(_) => {
                let done = self
                    .stack
                    .pop()
                    .ok_or_else(|| ProtocolError::Parse("unbalanced end tag".into()))?;
                match self.stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(done);
                        Ok(false)
                    }
                    None => {
                        self.finished = Some(done);
                        Ok(true)
                    }
                }
            }
        }
    }

    fn take(&mut self) -> Option<Element> {
        self.finished.take()
    }
}

/// Reads top-level children of a `<stream:stream>` root from an
/// [`AsyncRead`], one at a time.
///
/// Single-consumer: concurrent calls to [`Self::next_element`] are
/// undefined, exactly as specified for the abstract Stream Parser
/// component.
pub struct ElementReader<R> {
    io: R,
    parser: Parser,
    builder: TreeBuilder,
    read_buf: Vec<u8>,
    pending_events: VecDeque<Event>,
    header: Option<StreamHeader>,
    closed: bool,
}

/// The parts of an [`ElementReader`] that are independent of which I/O
/// object is backing it: the `rxml` parser, the in-progress tree builder,
/// any already-parsed-but-undelivered events, and the stream header seen so
/// far.
pub struct ReaderState {
    parser: Parser,
    builder: TreeBuilder,
    pending_events: VecDeque<Event>,
    header: Option<StreamHeader>,
    closed: bool,
}

impl<R: AsyncRead + Unpin> ElementReader<R> {
    /// Construct a reader and block until the opening `<stream:stream>` tag
    /// has been fully read.
    pub async fn open(io: R) -> Result<Self, ReadError> {
        let mut this = Self {
            io,
            parser: Parser::new(),
            builder: TreeBuilder::new(),
            read_buf: vec![0u8; 4096],
            pending_events: VecDeque::new(),
            header: None,
            closed: false,
        };
        this.read_header().await?;
        Ok(this)
    }

    /// Rebuild a reader around a new I/O object, carrying over parser state
    /// produced while reading from a different (but logically identical)
    /// I/O object. See [`Self::into_io_and_state`].
    pub fn from_io_and_state(io: R, state: ReaderState) -> Self {
        Self {
            io,
            parser: state.parser,
            builder: state.builder,
            read_buf: vec![0u8; 4096],
            pending_events: state.pending_events,
            header: state.header,
            closed: state.closed,
        }
    }

    async fn read_header(&mut self) -> Result<(), ReadError> {
        loop {
            let event = self.next_raw_event().await?;
            match event {
                Event::XmlDeclaration(..) => continue,
                Event::StartElement(_, (ns, name), attrs) => {
                    if name.as_str() != "stream" {
                        return Err(ProtocolError::MalformedStreamHeader.into());
                    }
                    let mut lang = "en".to_owned();
                    let mut id = None;
                    let mut from = None;
                    for (qname, value) in attrs.into_iter() {
                        match qname.1.as_str() {
                            "lang" => lang = value.as_str().to_owned(),
                            "id" => id = Some(value.as_str().to_owned()),
                            "from" => from = Some(value.as_str().to_owned()),
                            _ => {}
                        }
                    }
                    self.header = Some(StreamHeader {
                        namespace: ns.as_str().to_owned(),
                        id,
                        from,
                        lang,
                    });
                    return Ok(());
                }
                _ => return Err(ProtocolError::MalformedStreamHeader.into()),
            }
        }
    }

    /// The stream root's attributes, as observed on open.
    pub fn header(&self) -> &StreamHeader {
        self.header.as_ref().expect("header read before use")
    }

    /// `xml:lang` of the stream root, defaulting to `en`.
    pub fn default_language(&self) -> &str {
        &self.header().lang
    }

    async fn next_raw_event(&mut self) -> Result<Event, ReadError> {
        loop {
            if let Some(ev) = self.pending_events.pop_front() {
                return Ok(ev);
            }
            if self.closed {
                return Err(ReadError::StreamClosed);
            }
            let n = self.io.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed").into());
            }
            let events = self
                .parser
                .feed(&self.read_buf[..n])
                .map_err(|e| ProtocolError::Parse(e.to_string()))?;
            self.pending_events.extend(events);
        }
    }

    /// Block until the next direct child of the stream root is fully
    /// available, returning it with all descendants materialised.
    ///
    /// If `expected_names` is given and the element's local name is not in
    /// that set, `Err(ProtocolError::UnexpectedElement)` is returned.
    pub async fn next_element(
        &mut self,
        expected_names: Option<&[&str]>,
    ) -> Result<Element, ReadError> {
        loop {
            let event = self.next_raw_event().await?;
            if let Event::EndElement(_) = event {
                if self.builder.stack.is_empty() {
                    // This closes the stream root itself.
                    self.closed = true;
                    return Err(ReadError::StreamClosed);
                }
            }
            if self.builder.feed(event)? {
                let element = self.builder.take().expect("feed signalled completion");
                if let Some(names) = expected_names {
                    if !names.contains(&element.name()) {
                        return Err(ProtocolError::UnexpectedElement {
                            expected: names.iter().map(|s| s.to_string()).collect(),
                            got: element.name().to_owned(),
                        }
                        .into());
                    }
                }
                return Ok(element);
            }
        }
    }

    /// Consume the reader, returning the underlying I/O object.
    pub fn into_inner(self) -> R {
        self.io
    }

    /// Split the reader into its I/O object and its parser state, without
    /// losing any element already parsed but not yet delivered.
    ///
    /// Used exactly once per session, when negotiation hands the stream off
    /// to the long-running dispatcher: at that point the transport is split
    /// into independent read/write halves (see [`crate::transport`]), and
    /// the parser state — which was built against the unsplit transport —
    /// needs to move over to the new read half intact.
    pub fn into_io_and_state(self) -> (R, ReaderState) {
        (
            self.io,
            ReaderState {
                parser: self.parser,
                builder: self.builder,
                pending_events: self.pending_events,
                header: self.header,
                closed: self.closed,
            },
        )
    }

    /// Borrow the underlying I/O object for reading its properties (e.g.
    /// TLS channel binding) without disturbing the parser.
    pub fn io_ref(&self) -> &R {
        &self.io
    }

    /// Borrow the underlying I/O object for writing.
    ///
    /// The negotiator interleaves reads (via [`Self::next_element`]) with
    /// writes on the same byte stream while it temporarily owns the parser
    /// exclusively; this accessor is how it reaches the transport without
    /// tearing the reader down between round-trips.
    pub fn io_mut(&mut self) -> &mut R {
        &mut self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_header_and_two_children() {
        let doc = concat!(
            "<?xml version='1.0'?>",
            "<stream:stream xmlns='jabber:client' ",
            "xmlns:stream='http://etherx.jabber.org/streams' ",
            "xml:lang='en' to='example.org'>",
            "<a/><b>text</b>",
        );
        let io = io::Cursor::new(doc.as_bytes().to_vec());
        let mut reader = ElementReader::open(io).await.unwrap();
        assert_eq!(reader.default_language(), "en");

        let first = reader.next_element(None).await.unwrap();
        assert_eq!(first.name(), "a");

        let second = reader.next_element(Some(&["b"])).await.unwrap();
        assert_eq!(second.name(), "b");
        assert_eq!(second.text(), "text");
    }

    #[tokio::test]
    async fn rejects_unexpected_element_name() {
        let doc = concat!(
            "<stream:stream xmlns='jabber:client' ",
            "xmlns:stream='http://etherx.jabber.org/streams'>",
            "<iq/>",
        );
        let io = io::Cursor::new(doc.as_bytes().to_vec());
        let mut reader = ElementReader::open(io).await.unwrap();
        let err = reader.next_element(Some(&["message"])).await.unwrap_err();
        assert!(matches!(
            err,
            ReadError::Protocol(ProtocolError::UnexpectedElement { .. })
        ));
    }
}
