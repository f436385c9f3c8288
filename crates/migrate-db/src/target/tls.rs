//! rustls connector for the target, chosen by `sslmode`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};

/// libpq `sslmode` values the target accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    /// Encrypted if the server offers it; certificate unchecked.
    Prefer,
    /// Encrypted; certificate unchecked.
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    const NAMES: [(&'static str, SslMode); 5] = [
        ("disable", SslMode::Disable),
        ("prefer", SslMode::Prefer),
        ("require", SslMode::Require),
        ("verify-ca", SslMode::VerifyCa),
        ("verify-full", SslMode::VerifyFull),
    ];

    pub fn as_str(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(_, mode)| *mode == self)
            .map_or("disable", |(name, _)| *name)
    }

    fn verifies_certificate(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// tokio-postgres only negotiates; verification happens in the connector.
    pub fn to_postgres(self) -> tokio_postgres::config::SslMode {
        use tokio_postgres::config::SslMode as Pg;
        match self {
            SslMode::Disable => Pg::Disable,
            SslMode::Prefer => Pg::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => Pg::Require,
        }
    }
}

impl FromStr for SslMode {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted.is_empty() {
            return Ok(SslMode::Disable);
        }
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, mode)| *mode)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::NAMES.iter().map(|(name, _)| *name).collect();
                MigrateError::Config(format!(
                    "unknown ssl_mode '{}' (expected one of: {})",
                    s.trim(),
                    names.join(", ")
                ))
            })
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector for `mode`, or `None` for plain TCP.
pub fn connector(mode: SslMode) -> Result<Option<MakeRustlsConnect>> {
    if mode == SslMode::Disable {
        return Ok(None);
    }
    Ok(Some(MakeRustlsConnect::new(client_config(mode))))
}

fn client_config(mode: SslMode) -> ClientConfig {
    if mode.verifies_certificate() {
        // rustls has no CA-only mode, so verify-ca checks the hostname as well.
        debug!("sslmode={}: verifying against webpki roots", mode);
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        return ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
    }

    warn!(
        "sslmode={}: target certificate is not verified, use verify-full for authenticated TLS",
        mode
    );
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

/// Trusts whatever certificate the server presents.
#[derive(Debug)]
struct AcceptAnyCert;

const OFFERED_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ED25519,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
];

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        OFFERED_SCHEMES.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_parse_case_insensitively() {
        for (name, mode) in SslMode::NAMES {
            assert_eq!(name.parse::<SslMode>().unwrap(), mode);
            assert_eq!(name.to_uppercase().parse::<SslMode>().unwrap(), mode);
            assert_eq!(mode.to_string(), name);
        }
        assert_eq!(" ".parse::<SslMode>().unwrap(), SslMode::Disable);
    }

    #[test]
    fn test_unknown_mode_lists_choices() {
        let err = "sometimes".parse::<SslMode>().unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
        assert!(err.to_string().contains("verify-full"));
    }

    #[test]
    fn test_verifying_modes_negotiate_require() {
        use tokio_postgres::config::SslMode as Pg;
        assert!(matches!(SslMode::Disable.to_postgres(), Pg::Disable));
        assert!(matches!(SslMode::Prefer.to_postgres(), Pg::Prefer));
        assert!(matches!(SslMode::VerifyCa.to_postgres(), Pg::Require));
        assert!(matches!(SslMode::VerifyFull.to_postgres(), Pg::Require));
    }

    #[test]
    fn test_connector_only_when_encrypting() {
        assert!(connector(SslMode::Disable).unwrap().is_none());
        assert!(connector(SslMode::Require).unwrap().is_some());
        assert!(connector(SslMode::VerifyFull).unwrap().is_some());
    }

    #[test]
    fn test_unverified_config_offers_common_schemes() {
        let schemes = AcceptAnyCert.supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&SignatureScheme::RSA_PSS_SHA256));
    }
}
