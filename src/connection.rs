//! Internal module for establishing TCP and TLS connections to IMAP servers.

use crate::error::{Error, Result};
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};
use webpki_roots::TLS_SERVER_ROOTS;

/// Byte stream an IMAP session can run over.
pub(crate) trait ImapTransport: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

impl<T> ImapTransport for T where T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

/// Either a TLS stream or a plain TCP stream.
pub(crate) type ImapStream = Box<dyn ImapTransport>;

/// Connects to `target_addr`, wrapping the stream in TLS when `tls` is set.
#[instrument(
    name = "connection::establish",
    skip_all,
    fields(imap_host = %imap_host, target_addr = %target_addr, tls = tls)
)]
pub(crate) async fn establish(imap_host: &str, target_addr: &str, tls: bool) -> Result<ImapStream> {
    if !tls {
        let tcp_stream = connect_direct(target_addr).await?;
        return Ok(Box::new(tcp_stream));
    }

    let connector = create_tls_connector();
    let server_name = parse_server_name(imap_host)?;
    let tcp_stream = connect_direct(target_addr).await?;

    debug!("Performing TLS handshake");

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|source| Error::TlsConnect {
            target: target_addr.to_string(),
            source,
        })?;

    Ok(Box::new(tls_stream))
}

/// Creates a TLS connector with the webpki root certificates.
fn create_tls_connector() -> TlsConnector {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(tls_config))
}

/// Parses server name for TLS SNI.
fn parse_server_name(host: &str) -> Result<rustls::ServerName> {
    rustls::ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

#[instrument(name = "connection::tcp_connect", skip_all)]
async fn connect_direct(target_addr: &str) -> Result<TcpStream> {
    debug!(target = %target_addr, "Establishing TCP connection");

    TcpStream::connect(target_addr)
        .await
        .map_err(|source| Error::TcpConnect {
            target: target_addr.to_string(),
            source,
        })
}
