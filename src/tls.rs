//! TLS policy for the secure listener
//!
//! Certificates come from PEM files supplied by the operator. Protocol
//! versions are bounded explicitly and cipher suites are restricted to an
//! ordered allowlist; the server's order wins over the client's.

use crate::config::ServerConfig;
use crate::error::ServerError;
use rustls::crypto::ring::cipher_suite as suites;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{SupportedCipherSuite, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Built-in allowlist, most preferred first
pub const DEFAULT_CIPHER_SUITES: [&str; 9] = [
    "TLS13_AES_256_GCM_SHA384",
    "TLS13_CHACHA20_POLY1305_SHA256",
    "TLS13_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
];

/// TLS protocol versions this proxy can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn parse(version: &str) -> Option<Self> {
        match version.trim() {
            "1.2" | "TLSv1.2" => Some(TlsVersion::Tls12),
            "1.3" | "TLSv1.3" => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    fn rustls_version(self) -> &'static SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Protocol bounds and cipher preference for a TLS listener
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    /// Ordered cipher suite names; empty means [`DEFAULT_CIPHER_SUITES`]
    pub cipher_suites: Vec<String>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_suites: Vec::new(),
        }
    }
}

impl TlsPolicy {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let parse = |v: &str| {
            TlsVersion::parse(v)
                .ok_or_else(|| ServerError::Tls(format!("unsupported TLS version {:?}", v)))
        };

        Ok(Self {
            min_version: parse(&config.min_tls_version)?,
            max_version: parse(&config.max_tls_version)?,
            cipher_suites: config.cipher_suites.clone(),
        })
    }

    /// Enabled protocol versions, newest first
    pub fn protocol_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        [TlsVersion::Tls13, TlsVersion::Tls12]
            .into_iter()
            .filter(|v| *v >= self.min_version && *v <= self.max_version)
            .map(TlsVersion::rustls_version)
            .collect()
    }

    /// Allowlisted suites usable with the enabled versions, in preference order
    pub fn selected_cipher_suites(&self) -> Result<Vec<SupportedCipherSuite>, ServerError> {
        let names: Vec<&str> = if self.cipher_suites.is_empty() {
            DEFAULT_CIPHER_SUITES.to_vec()
        } else {
            self.cipher_suites.iter().map(String::as_str).collect()
        };

        let versions = self.protocol_versions();
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let suite = cipher_suite_by_name(name)
                .ok_or_else(|| ServerError::Tls(format!("unknown cipher suite {:?}", name)))?;
            let usable = versions.iter().any(|v| v.version == suite.version().version);
            if usable && !selected.contains(&suite) {
                selected.push(suite);
            }
        }

        if selected.is_empty() {
            return Err(ServerError::Tls(
                "no cipher suite in the allowlist matches the enabled TLS versions".to_string(),
            ));
        }

        Ok(selected)
    }
}

fn cipher_suite_by_name(name: &str) -> Option<SupportedCipherSuite> {
    let suite = match name.trim().to_ascii_uppercase().as_str() {
        "TLS13_AES_256_GCM_SHA384" => suites::TLS13_AES_256_GCM_SHA384,
        "TLS13_AES_128_GCM_SHA256" => suites::TLS13_AES_128_GCM_SHA256,
        "TLS13_CHACHA20_POLY1305_SHA256" => suites::TLS13_CHACHA20_POLY1305_SHA256,
        "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384" => suites::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256" => suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256" => {
            suites::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
        }
        "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384" => suites::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256" => suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256" => {
            suites::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
        }
        _ => return None,
    };
    Some(suite)
}

/// Build the rustls server configuration for a certificate/key pair
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    policy: &TlsPolicy,
) -> Result<rustls::ServerConfig, ServerError> {
    let provider = CryptoProvider {
        cipher_suites: policy.selected_cipher_suites()?,
        ..rustls::crypto::ring::default_provider()
    };

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&policy.protocol_versions())
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    config.ignore_client_order = true;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

/// Load certificate and key files and build an acceptor for the secure listener
pub fn load_acceptor(
    cert_path: &str,
    key_path: &str,
    policy: &TlsPolicy,
) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = build_server_config(certs, key, policy)?;

    info!(
        cert = %cert_path,
        key = %key_path,
        min_version = ?policy.min_version,
        max_version = ?policy.max_version,
        cipher_suites = config.crypto_provider().cipher_suites.len(),
        "TLS enabled with provided certificates"
    );

    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path).map_err(|e| {
        ServerError::Tls(format!("Failed to open certificate file {}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ServerError::Tls(format!("Failed to parse certificates from {}: {}", path, e))
        })?;

    if certs.is_empty() {
        return Err(ServerError::Tls(format!("No certificates found in {}", path)));
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::Tls(format!("Failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ServerError::Tls(format!("Failed to parse key from {}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(ServerError::Tls(format!("No private key found in {}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::io::Write;

    fn self_signed_pem() -> (String, String) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_tls_version_parse() {
        assert_eq!(TlsVersion::parse("1.2"), Some(TlsVersion::Tls12));
        assert_eq!(TlsVersion::parse("TLSv1.3"), Some(TlsVersion::Tls13));
        assert_eq!(TlsVersion::parse("1.0"), None);
        assert!(TlsVersion::Tls12 < TlsVersion::Tls13);
    }

    #[test]
    fn test_default_policy_versions() {
        let versions = TlsPolicy::default().protocol_versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_3);
        assert_eq!(versions[1].version, rustls::ProtocolVersion::TLSv1_2);
    }

    #[test]
    fn test_default_cipher_order() {
        let selected = TlsPolicy::default().selected_cipher_suites().unwrap();
        assert_eq!(selected.len(), DEFAULT_CIPHER_SUITES.len());
        assert_eq!(selected[0], suites::TLS13_AES_256_GCM_SHA384);
        assert_eq!(
            selected[3],
            suites::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
        );
        assert_eq!(
            *selected.last().unwrap(),
            suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        );
    }

    #[test]
    fn test_tls13_only_drops_tls12_suites() {
        let policy = TlsPolicy {
            min_version: TlsVersion::Tls13,
            ..TlsPolicy::default()
        };
        let selected = policy.selected_cipher_suites().unwrap();
        assert_eq!(selected.len(), 3);
        assert!(selected
            .iter()
            .all(|s| s.version().version == rustls::ProtocolVersion::TLSv1_3));
    }

    #[test]
    fn test_custom_allowlist_keeps_order() {
        let policy = TlsPolicy {
            cipher_suites: vec![
                "tls_ecdhe_rsa_with_aes_128_gcm_sha256".to_string(),
                "TLS13_AES_128_GCM_SHA256".to_string(),
                "TLS13_AES_128_GCM_SHA256".to_string(),
            ],
            ..TlsPolicy::default()
        };
        let selected = policy.selected_cipher_suites().unwrap();
        assert_eq!(
            selected,
            vec![
                suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                suites::TLS13_AES_128_GCM_SHA256,
            ]
        );
    }

    #[test]
    fn test_unknown_or_unusable_suites_rejected() {
        let policy = TlsPolicy {
            cipher_suites: vec!["TLS_RSA_WITH_RC4_128_SHA".to_string()],
            ..TlsPolicy::default()
        };
        assert!(matches!(policy.selected_cipher_suites(), Err(ServerError::Tls(_))));

        let policy = TlsPolicy {
            min_version: TlsVersion::Tls13,
            cipher_suites: vec!["TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".to_string()],
            ..TlsPolicy::default()
        };
        assert!(matches!(policy.selected_cipher_suites(), Err(ServerError::Tls(_))));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = ServerConfig::default();
        config.min_tls_version = "1.3".to_string();
        let policy = TlsPolicy::from_config(&config).unwrap();
        assert_eq!(policy.min_version, TlsVersion::Tls13);
        assert_eq!(policy.max_version, TlsVersion::Tls13);

        config.max_tls_version = "1.1".to_string();
        assert!(TlsPolicy::from_config(&config).is_err());
    }

    #[test]
    fn test_build_server_config_from_pem_files() {
        let (cert_pem, key_pem) = self_signed_pem();
        let cert_file = write_temp(&cert_pem);
        let key_file = write_temp(&key_pem);

        let certs = load_certs(cert_file.path().to_str().unwrap()).unwrap();
        let key = load_key(key_file.path().to_str().unwrap()).unwrap();
        assert_eq!(certs.len(), 1);

        let config = build_server_config(certs, key, &TlsPolicy::default()).unwrap();
        assert!(config.ignore_client_order);
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(
            config.crypto_provider().cipher_suites.len(),
            DEFAULT_CIPHER_SUITES.len()
        );

        assert!(load_acceptor(
            cert_file.path().to_str().unwrap(),
            key_file.path().to_str().unwrap(),
            &TlsPolicy::default()
        )
        .is_ok());
    }

    #[test]
    fn test_missing_or_empty_pem_files() {
        assert!(matches!(
            load_certs("/nonexistent/cert.pem"),
            Err(ServerError::Tls(_))
        ));

        let empty = write_temp("");
        let path = empty.path().to_str().unwrap();
        assert!(matches!(load_certs(path), Err(ServerError::Tls(_))));
        assert!(matches!(load_key(path), Err(ServerError::Tls(_))));
    }
}
