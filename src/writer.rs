//! Component D: the single point through which anything leaves the stream.
//!
//! Grounded on the teacher's `stanzastream::worker` write path, which
//! likewise serializes every outbound element through one sink before it
//! touches the socket; simplified here to a mutex around the write half
//! rather than an actor loop, since this crate has no reconnect-time queue
//! to coordinate with the write path.

use std::sync::Arc;

use minidom::Element;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::stanza::Stanza;
use crate::stream_management::SmState;
use crate::transport::Transport;

fn serialize(element: &Element) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    element
        .write_to(&mut buf)
        .map_err(|e| Error::Protocol(crate::error::ProtocolError::Parse(e.to_string())))?;
    Ok(buf)
}

/// Serializes writes to the transport and, for stanzas that participate in
/// XEP-0198, folds the send into the replay cache atomically.
pub struct Writer {
    io: Mutex<WriteHalf<Transport>>,
    sm: Arc<Mutex<Option<SmState>>>,
}

impl Writer {
    /// Wrap a write half. `sm` is the same shared Stream Management state the
    /// dispatcher and [`crate::stream_management`] engine read and update;
    /// `None` while Stream Management hasn't been enabled.
    pub fn new(io: WriteHalf<Transport>, sm: Arc<Mutex<Option<SmState>>>) -> Self {
        Self {
            io: Mutex::new(io),
            sm,
        }
    }

    /// Send a stream-level nonza (`<r/>`, `<a/>`, `<enable/>`, `<starttls/>`,
    /// ...) that never participates in the replay cache.
    pub async fn send_nonza(&self, element: &Element) -> Result<(), Error> {
        let bytes = serialize(element)?;
        let mut io = self.io.lock().await;
        io.write_all(&bytes).await?;
        Ok(())
    }

    /// Send a stanza, assigning it an id if it doesn't have one yet.
    ///
    /// If Stream Management is currently enabled, the stanza is appended to
    /// the replay cache and `outbound_seq` is incremented in the same
    /// critical section as the write, so a send that fails midway never
    /// leaves the cache and the wire out of sync.
    pub async fn send_stanza(&self, mut stanza: Stanza) -> Result<(), Error> {
        stanza.ensure_id();
        let element = crate::stanza_xml::to_element(&stanza);
        let bytes = serialize(&element)?;

        let mut io = self.io.lock().await;
        let mut sm = self.sm.lock().await;
        io.write_all(&bytes).await?;
        if let Some(sm) = sm.as_mut() {
            sm.record_outbound(stanza);
        }
        Ok(())
    }

    /// Re-send a stanza already present in the replay cache (XEP-0198
    /// replay after resume/reconnect). Writes the same bytes `send_stanza`
    /// would have, but does not touch the cache or `outbound_seq` again —
    /// the stanza is already accounted for from its original send.
    pub async fn resend_raw(&self, stanza: &Stanza) -> Result<(), Error> {
        let element = crate::stanza_xml::to_element(stanza);
        self.send_nonza(&element).await
    }

    /// Gracefully close the stream by writing `</stream:stream>` and
    /// shutting down the transport.
    pub async fn close(&self) -> Result<(), Error> {
        let mut io = self.io.lock().await;
        io.write_all(b"</stream:stream>").await?;
        io.shutdown().await?;
        Ok(())
    }
}
