//! # Mutual TLS credentials
//!
//! Certificate issuance and rotation live outside this crate. The proxy only consumes a
//! [`CertificateProvider`], asking it for the cluster CA and the node keypair every time a
//! call is about to be forwarded, so rotated certificates are picked up without a restart.
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to load the CA certificate: {0}")]
    Ca(#[source] crate::BoxError),
    #[error("Failed to load the node certificate: {0}")]
    Certificate(#[source] crate::BoxError),
}

/// A PEM encoded certificate chain and its private key.
#[derive(Clone)]
pub struct Keypair {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("cert_pem", &String::from_utf8_lossy(&self.cert_pem))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Supplies the CA and leaf certificate used for mutual TLS.
pub trait CertificateProvider: Send + Sync + 'static {
    /// The PEM encoded CA certificate.
    fn ca(&self) -> Result<Vec<u8>, CredentialError>;

    /// The keypair this node presents to its peers.
    fn certificate(&self) -> Result<Keypair, CredentialError>;
}

impl<T: CertificateProvider + ?Sized> CertificateProvider for Arc<T> {
    fn ca(&self) -> Result<Vec<u8>, CredentialError> {
        (**self).ca()
    }

    fn certificate(&self) -> Result<Keypair, CredentialError> {
        (**self).certificate()
    }
}

/// Reads the PEM files on every request.
#[derive(Debug, Clone)]
pub struct FileCertificateProvider {
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl FileCertificateProvider {
    pub fn new(ca: impl Into<PathBuf>, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            ca: ca.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }
}

impl CertificateProvider for FileCertificateProvider {
    fn ca(&self) -> Result<Vec<u8>, CredentialError> {
        std::fs::read(&self.ca).map_err(|e| CredentialError::Ca(Box::new(e)))
    }

    fn certificate(&self) -> Result<Keypair, CredentialError> {
        let cert_pem =
            std::fs::read(&self.cert).map_err(|e| CredentialError::Certificate(Box::new(e)))?;
        let key_pem =
            std::fs::read(&self.key).map_err(|e| CredentialError::Certificate(Box::new(e)))?;
        Ok(Keypair { cert_pem, key_pem })
    }
}

/// Serves fixed, in-memory PEM material.
#[derive(Debug, Clone)]
pub struct StaticCertificateProvider {
    ca: Vec<u8>,
    keypair: Keypair,
}

impl StaticCertificateProvider {
    pub fn new(ca: impl Into<Vec<u8>>, keypair: Keypair) -> Self {
        Self {
            ca: ca.into(),
            keypair,
        }
    }
}

impl CertificateProvider for StaticCertificateProvider {
    fn ca(&self) -> Result<Vec<u8>, CredentialError> {
        Ok(self.ca.clone())
    }

    fn certificate(&self) -> Result<Keypair, CredentialError> {
        Ok(self.keypair.clone())
    }
}

/// Transport credentials for one forwarded hop: both ends authenticate with certificates
/// signed by the same CA.
#[derive(Debug, Clone)]
pub struct Credentials {
    ca: Certificate,
    identity: Identity,
    domain_name: Option<String>,
}

impl Credentials {
    /// Fetches the CA and the node keypair from `provider`.
    pub fn mutual(
        provider: &dyn CertificateProvider,
        domain_name: Option<String>,
    ) -> Result<Self, CredentialError> {
        let ca = provider.ca()?;
        let keypair = provider.certificate()?;

        Ok(Self {
            ca: Certificate::from_pem(ca),
            identity: Identity::from_pem(keypair.cert_pem, keypair.key_pem),
            domain_name,
        })
    }

    /// Client side TLS settings for dialing a member node.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        let config = ClientTlsConfig::new()
            .ca_certificate(self.ca.clone())
            .identity(self.identity.clone());

        match &self.domain_name {
            Some(domain) => config.domain_name(domain.clone()),
            None => config,
        }
    }

    /// Server side TLS settings requiring client certificates signed by the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca.clone())
    }
}
