//! Dynamic TLS termination for intercepted HTTPS connections (spec §4.6
//! "HTTPS flow" step 1): the CA's SNI callback drives leaf minting via
//! `tokio_rustls::LazyConfigAcceptor`, which reads the ClientHello before a
//! server config needs to be chosen.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::ca::CertificateAuthority;
use crate::errors::KProxyError;

pub async fn accept_tls(
    stream: TcpStream,
    ca: &CertificateAuthority,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>, KProxyError> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor
        .await
        .map_err(|e| KProxyError::certificate(format!("reading client hello: {e}")))?;

    let sni = start
        .client_hello()
        .server_name()
        .map(|s| s.to_string())
        .unwrap_or_default();

    let leaf = ca.get_certificate(&sni).await?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), leaf.key.clone_key())
        .map_err(|e| KProxyError::certificate(format!("building server config for {sni}: {e}")))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    start
        .into_stream(Arc::new(server_config))
        .await
        .map_err(|e| KProxyError::certificate(format!("TLS handshake failed for {sni}: {e}")))
}

/// Opens a TLS client connection to the origin for the decrypted leg of an
/// intercepted HTTPS request, verified against the system trust store
/// (spec §4.6 step 3: "standard verification against the system trust
/// store").
pub async fn dial_origin_tls(
    host: &str,
    port: u16,
    root_store: Arc<rustls::RootCertStore>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, KProxyError> {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates((*root_store).clone())
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| KProxyError::upstream(format!("dialing {host}:{port}: {e}")))?;

    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| KProxyError::upstream(format!("invalid origin hostname {host}: {e}")))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| KProxyError::upstream(format!("TLS handshake with {host}:{port} failed: {e}")))
}

pub fn load_system_root_store() -> Result<Arc<rustls::RootCertStore>, KProxyError> {
    let mut store = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = store.add(cert);
    }
    Ok(Arc::new(store))
}
