//! rustls client configuration for both transports
//!
//! QUIC requires TLS 1.3 and gets early data plus the `mqtt` ALPN; the TCP
//! fallback accepts 1.2 and 1.3. Trust comes from `auth.ca_file` when set,
//! otherwise from the platform store.

use crate::config::{ConfigError, ConnectionConfig};
use rustls::client::WantsClientCert;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ConfigBuilder, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MQTT_ALPN: &[u8] = b"mqtt";

/// Which transport the configuration is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProfile {
    Quic,
    Tcp,
}

/// Build the rustls client configuration for `profile`
pub fn client_config(
    config: &ConnectionConfig,
    profile: TlsProfile,
) -> Result<ClientConfig, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions: &[&'static rustls::SupportedProtocolVersion] = match profile {
        TlsProfile::Quic => &[&rustls::version::TLS13],
        TlsProfile::Tcp => rustls::DEFAULT_VERSIONS,
    };
    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(|e| ConfigError::Tls(format!("Unsupported protocol versions: {e}")))?;

    let identity = match (&config.auth.client_cert, &config.auth.client_key) {
        (Some(cert), Some(key)) => Some((load_certs(cert)?, load_private_key(key)?)),
        _ => None,
    };

    let builder = if config.auth.insecure_skip_verify {
        skip_verification(builder)?
    } else {
        builder.with_root_certificates(root_store(config.auth.ca_file.as_deref())?)
    };

    let mut tls = match identity {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| ConfigError::Tls(format!("Client certificate rejected: {e}")))?,
        None => builder.with_no_client_auth(),
    };

    if profile == TlsProfile::Quic {
        tls.alpn_protocols = vec![MQTT_ALPN.to_vec()];
        tls.enable_early_data = config.session.enable_0rtt;
    }
    Ok(tls)
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();

    if let Some(path) = ca_file {
        let certs = load_certs(path)?;
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(ConfigError::Tls(format!(
                "No usable CA certificates in {}",
                path.display()
            )));
        }
        debug!(added, ignored, ca_file = %path.display(), "Loaded CA certificates");
        return Ok(roots);
    }

    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!(%error, "Error loading platform certificates");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded platform root certificates");
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::Tls(format!("Failed to open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("Invalid PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::Tls(format!("Failed to open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ConfigError::Tls(format!("Invalid PEM in {}: {e}", path.display())))?
        .ok_or_else(|| ConfigError::Tls(format!("No private key found in {}", path.display())))
}

#[cfg(feature = "dangerous-skip-verify")]
fn skip_verification(
    builder: ConfigBuilder<ClientConfig, rustls::WantsVerifier>,
) -> Result<ConfigBuilder<ClientConfig, WantsClientCert>, ConfigError> {
    warn!("TLS certificate verification is DISABLED");
    Ok(builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::SkipServerVerification)))
}

#[cfg(not(feature = "dangerous-skip-verify"))]
fn skip_verification(
    _builder: ConfigBuilder<ClientConfig, rustls::WantsVerifier>,
) -> Result<ConfigBuilder<ClientConfig, WantsClientCert>, ConfigError> {
    Err(ConfigError::Tls(
        "auth.insecure_skip_verify requires the 'dangerous-skip-verify' feature".to_string(),
    ))
}

#[cfg(feature = "dangerous-skip-verify")]
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Test brokers only.
    #[derive(Debug)]
    pub(super) struct SkipServerVerification;

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_quic_profile_sets_alpn_and_early_data() {
        let config = ConnectionConfig::new("broker.local", "dev");
        let tls = client_config(&config, TlsProfile::Quic).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"mqtt".to_vec()]);
        assert!(tls.enable_early_data);

        let tcp = client_config(&config, TlsProfile::Tcp).unwrap();
        assert!(tcp.alpn_protocols.is_empty());
        assert!(!tcp.enable_early_data);
    }

    #[test]
    fn test_early_data_follows_config() {
        let mut config = ConnectionConfig::new("broker.local", "dev");
        config.session.enable_0rtt = false;
        let tls = client_config(&config, TlsProfile::Quic).unwrap();
        assert!(!tls.enable_early_data);
    }

    #[test]
    fn test_missing_ca_file_is_a_tls_error() {
        let mut config = ConnectionConfig::new("broker.local", "dev");
        config.auth.ca_file = Some("/nonexistent/ca.pem".into());
        assert!(matches!(
            client_config(&config, TlsProfile::Tcp),
            Err(ConfigError::Tls(_))
        ));
    }

    #[test]
    fn test_ca_file_without_certificates_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let mut config = ConnectionConfig::new("broker.local", "dev");
        config.auth.ca_file = Some(file.path().to_path_buf());

        let err = client_config(&config, TlsProfile::Quic).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[cfg(not(feature = "dangerous-skip-verify"))]
    #[test]
    fn test_skip_verify_needs_feature() {
        let mut config = ConnectionConfig::new("broker.local", "dev");
        config.auth.insecure_skip_verify = true;
        let err = client_config(&config, TlsProfile::Tcp).unwrap_err();
        assert!(err.to_string().contains("dangerous-skip-verify"));
    }

    #[cfg(feature = "dangerous-skip-verify")]
    #[test]
    fn test_skip_verify_builds_both_profiles() {
        let mut config = ConnectionConfig::new("broker.local", "dev");
        config.auth.insecure_skip_verify = true;
        config.auth.ca_file = Some("/nonexistent/ca.pem".into());

        let quic = client_config(&config, TlsProfile::Quic).unwrap();
        assert_eq!(quic.alpn_protocols, vec![b"mqtt".to_vec()]);
        assert!(client_config(&config, TlsProfile::Tcp).is_ok());
    }
}
