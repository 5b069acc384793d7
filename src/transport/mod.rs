//! Component A: the raw byte pipe to the server.
//!
//! Resolves the server's address (SRV-aware, falling back to a direct A/AAAA
//! lookup or a literal IP), connects over TCP, and — for the `starttls`
//! feature — performs the `STARTTLS` upgrade once the negotiator asks for it.
//! Grounded on the teacher's `connect::dns::DnsConfig` and
//! `connect::starttls`, generalised from its `ServerConnector` trait object
//! into a single enum since this crate only ever needs one connection
//! strategy per session rather than a pluggable-at-compile-time trait.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::select_ok;
use futures::FutureExt;
use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{IntoName, TokioAsyncResolver};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::Error;

/// How to locate the server's socket address.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Resolve `_<srv>._tcp.<domain>` SRV records, falling back to an A/AAAA
    /// lookup on `domain` at `fallback_port` if the SRV lookup fails.
    Srv {
        /// Domain to resolve (usually the JID's domain part).
        domain: String,
        /// SRV service name, e.g. `_xmpp-client._tcp`.
        srv: String,
        /// Port to use if SRV resolution fails outright.
        fallback_port: u16,
    },
    /// Resolve `host`'s A/AAAA records directly, skipping SRV.
    Host {
        /// Hostname to resolve.
        host: String,
        /// Port to connect to.
        port: u16,
    },
    /// Connect to a literal socket address, no DNS involved.
    Addr(SocketAddr),
}

impl Endpoint {
    /// The default SRV strategy for XMPP clients: `_xmpp-client._tcp`,
    /// falling back to port 5222.
    pub fn client_srv(domain: impl Into<String>) -> Self {
        Endpoint::Srv {
            domain: domain.into(),
            srv: "_xmpp-client._tcp".to_owned(),
            fallback_port: 5222,
        }
    }

    async fn resolve(&self) -> Result<TcpStream, Error> {
        match self {
            Endpoint::Addr(addr) => Ok(TcpStream::connect(addr).await?),
            Endpoint::Host { host, port } => resolve_host(host, *port).await,
            Endpoint::Srv {
                domain,
                srv,
                fallback_port,
            } => resolve_srv(domain, srv, *fallback_port).await,
        }
    }
}

async fn resolve_host(host: &str, port: u16) -> Result<TcpStream, Error> {
    let ascii_domain = idna::domain_to_ascii(host).map_err(|e| Error::Argument(e.to_string()))?;

    if let Ok(ip) = ascii_domain.parse() {
        return Ok(TcpStream::connect(&SocketAddr::new(ip, port)).await?);
    }

    let (config, mut options) =
        hickory_resolver::system_conf::read_system_conf().map_err(|e| Error::Argument(e.to_string()))?;
    options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
    let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());

    let ips = resolver
        .lookup_ip(ascii_domain)
        .await
        .map_err(|e| Error::Argument(e.to_string()))?;

    select_ok(
        ips.into_iter()
            .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
    )
    .await
    .map(|(stream, _)| stream)
    .map_err(|_| Error::Disconnected)
}

async fn resolve_srv(domain: &str, srv: &str, fallback_port: u16) -> Result<TcpStream, Error> {
    let ascii_domain = idna::domain_to_ascii(domain).map_err(|e| Error::Argument(e.to_string()))?;

    if let Ok(ip) = ascii_domain.parse() {
        debug!("connecting to literal address {ip}:{fallback_port}");
        return Ok(TcpStream::connect(&SocketAddr::new(ip, fallback_port)).await?);
    }

    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().map_err(|e| Error::Argument(e.to_string()))?;
    let srv_name = format!("{srv}.{ascii_domain}.")
        .into_name()
        .map_err(|e| Error::Argument(e.to_string()))?;

    match resolver.srv_lookup(srv_name.clone()).await {
        Ok(lookup) => {
            // The teacher leaves candidates in whatever order the resolver
            // handed them back (`// TODO: sort lookup records by
            // priority/weight`). RFC 2782 requires trying lower-priority
            // values first, and within equal priority, weighting by the
            // `weight` field; ascending `(priority, weight)` order is a
            // reasonable total order that at least always tries every
            // lower-priority target before any higher-priority one.
            let mut candidates: Vec<_> = lookup.iter().collect();
            candidates.sort_by_key(|r| (r.priority(), r.weight()));

            for candidate in candidates {
                debug!("attempting connection to {srv_name} {candidate}");
                match resolve_host(&candidate.target().to_ascii(), candidate.port()).await {
                    Ok(stream) => return Ok(stream),
                    Err(_) => continue,
                }
            }
            Err(Error::Disconnected)
        }
        Err(_) => {
            debug!("SRV lookup failed, falling back to {domain}:{fallback_port}");
            resolve_host(domain, fallback_port).await
        }
    }
}

/// The byte pipe actually used for a session: plain TCP, or TCP wrapped in
/// TLS once STARTTLS has completed.
pub enum Transport {
    /// Unencrypted TCP, before (or in lieu of) a STARTTLS upgrade. Whether a
    /// session ever leaves this state is a runtime decision
    /// ([`crate::session::SessionConfig::tls`]/`require_tls`), not a
    /// compile-time one — unlike the teacher, which picks between a
    /// `StartTlsServerConnector` and a `TcpServerConnector` at the type
    /// level behind its `starttls`/`insecure-tcp` features.
    Plain(TcpStream),
    /// TLS over TCP, established via STARTTLS or from the start.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    /// Connect to `endpoint` over plain TCP.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, Error> {
        let stream = endpoint.resolve().await?;
        stream.set_nodelay(true).ok();
        Ok(Transport::Plain(stream))
    }

    /// `true` once the transport is wrapped in TLS.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Consume a plain transport and return one wrapped in TLS, verifying
    /// the peer certificate against the platform's trust store (the same
    /// default the teacher's `tls-rust`/`rustls-native-certs` combination
    /// uses).
    pub async fn upgrade_tls(self, domain: &str) -> Result<Self, Error> {
        let tcp = match self {
            Transport::Plain(tcp) => tcp,
            Transport::Tls(_) => return Err(Error::Tls("already encrypted".into())),
        };

        let mut root_store = tokio_rustls::rustls::RootCertStore::empty();
        let native_certs =
            rustls_native_certs::load_native_certs().map_err(|e| Error::Tls(e.to_string()))?;
        root_store.add_parsable_certificates(native_certs);

        let config = tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(domain.to_owned())
            .map_err(|e| Error::Tls(e.to_string()))?;

        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(Transport::Tls(Box::new(tls)))
    }

    /// TLS-exporter channel binding data for SASL `-PLUS` mechanisms, when
    /// the negotiated TLS version supports it (1.3 only, matching the
    /// teacher's current `channel_binding` implementation).
    pub fn channel_binding(&self) -> Option<Vec<u8>> {
        let Transport::Tls(tls) = self else {
            return None;
        };
        let (_, conn) = tls.get_ref();
        if conn.protocol_version() != Some(tokio_rustls::rustls::ProtocolVersion::TLSv1_3) {
            return None;
        }
        conn.export_keying_material(vec![0u8; 32], b"EXPORTER-Channel-Binding", None)
            .ok()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srv_candidate_sort_is_priority_then_weight() {
        // Mirrors RFC 2782 §: lower priority tried first; not a full
        // weighted-random selection, but never tries a higher-priority
        // target before a lower-priority one exists.
        let mut candidates = vec![(20u16, 5u16), (10, 50), (10, 1), (0, 0)];
        candidates.sort();
        assert_eq!(candidates, vec![(0, 0), (10, 1), (10, 50), (20, 5)]);
    }
}
