//! # TLS Infrastructure
//!
//! QUIC requires TLS 1.3. Meshage nodes do not authenticate one another
//! (any node that can reach the listener may join), so this module only
//! provides what the transport needs to stand up encrypted links:
//!
//! - **Certificates**: a fresh self-signed certificate per process
//! - **Verifiers**: accept any well-formed peer certificate whose
//!   handshake signature verifies
//! - **Transport tuning**: keep-alive and idle timeout for Peer Links
//!
//! ## Security Properties
//!
//! - Traffic between peers is encrypted and integrity-protected
//! - ALPN protocol "meshage" prevents cross-protocol connections
//! - Peer identity is the name announced in the `Hello`/`Welcome`
//!   handshake, not anything carried in the certificate
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` APIs are used intentionally: certificate chains are
//! not validated. Deploy on trusted networks only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{ClientConfig, IdleTimeout, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier carried by every meshage connection.
pub const ALPN: &[u8] = b"meshage";

/// Server name presented in certificates and used as SNI when dialing.
pub const SERVER_NAME: &str = "meshage";

/// Interval between QUIC keep-alive packets on an otherwise idle link.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// A link that hears nothing (not even keep-alives) for this long is dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub fn generate_self_signed_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>
{
    let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .context("failed to generate self-signed certificate")?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let cert = certified.cert.der().clone();
    Ok((vec![cert], key))
}

fn transport_config() -> Result<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(IDLE_TIMEOUT).context("idle timeout out of range")?,
    ));
    // One bidirectional stream per link; a little headroom for races.
    transport.max_concurrent_bidi_streams(4u32.into());
    transport.max_concurrent_uni_streams(0u32.into());
    Ok(Arc::new(transport))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(transport_config()?);

    Ok(server_config)
}

pub fn create_client_config() -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(transport_config()?);

    Ok(client_config)
}

/// Accepts any server certificate but still checks the handshake signature,
/// so the session keys are bound to the certificate actually presented.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}
