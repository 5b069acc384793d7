//! Client-side core for the [XMPP](https://xmpp.org/) protocol (RFC 3920/3921).
//!
//! This crate establishes a long-lived, encrypted, authenticated XML stream
//! to an XMPP server, exchanges the three stanza kinds (`iq`, `message`,
//! `presence`), and keeps the session alive across transient network
//! failures via [XEP-0198](https://xmpp.org/extensions/xep-0198.html) Stream
//! Management.
//!
//! # Getting started
//!
//! Build a [`Session`] with [`Session::new`], call [`Session::connect`], then
//! drive it: send stanzas with [`Session::send_message`] /
//! [`Session::send_presence`] / [`Session::iq_request`], and register
//! callbacks with [`Session::on_message`] and friends to receive incoming
//! ones.
//!
//! # Scope
//!
//! This crate covers connection bring-up, the stream engine, the IQ
//! correlator and the Stream Management engine. It does *not* implement a
//! roster, presence subscription semantics, MUC, vCards, or any other
//! extension layered on top of a session — those belong in a higher-level
//! crate built on top of this one, the way `xmpp` is built on top of
//! `tokio-xmpp`.

#![deny(unsafe_code)]

pub mod error;
pub mod event;
pub mod iq_correlator;
pub mod negotiation;
pub mod sasl_mech;
pub mod session;
pub mod stanza;
pub mod stream_management;
pub mod transport;
pub mod writer;
pub mod xmlstream;

mod dispatcher;
mod stanza_xml;

pub use jid;
pub use minidom;

pub use error::Error;
pub use event::Event;
pub use session::{Session, SessionConfig};
pub use stanza::{Iq, IqKind, Message, Presence, Stanza};

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::jid;
        #[allow(unused_imports)]
        use crate::minidom;
    }
}
