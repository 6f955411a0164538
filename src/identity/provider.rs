//! Identity issuance collaborators.
//!
//! # Responsibilities
//! - Define the `IdentityProvider` seam the server fetches identity material through
//! - Load workload credentials and trust bundles from PEM files
//! - Provide an in-memory provider for embedding and tests
//!
//! # Design Decisions
//! - Providers hand out wire-level material; it is validated by the binding, not here
//! - Failures are typed so startup can surface them as `ProviderError`

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::identity::codec::CodecError;
use crate::identity::wire::{self, SpiffeId, X509Bundle, X509Svid};

/// Identity material handed out by a provider for one service.
#[derive(Debug, Clone)]
pub struct IssuedIdentity {
    /// Trust domain the material was issued for.
    pub trust_domain: wire::TrustDomain,
    /// Authorities for verifying peers. `None` when the provider has no bundle.
    pub bundle: Option<X509Bundle>,
    /// The workload's own credential.
    pub svid: X509Svid,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid identity material: {0}")]
    Invalid(String),

    #[error(transparent)]
    InvalidMaterial(#[from] CodecError),

    #[error("issued trust domain {actual} does not match configured trust domain {expected}")]
    TrustDomainMismatch { expected: String, actual: String },

    #[error("identity provider is closed")]
    Closed,

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Source of workload identity material.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Fetch the credential and trust bundle for `service_name` in `trust_domain`.
    async fn fetch_identity(
        &self,
        service_name: &str,
        trust_domain: &wire::TrustDomain,
    ) -> Result<IssuedIdentity, ProviderError>;

    /// Release provider resources. Called once during shutdown cleanup.
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn workload_id(trust_domain: &wire::TrustDomain, service_name: &str) -> Result<SpiffeId, ProviderError> {
    SpiffeId::from_path(trust_domain.clone(), &format!("/{service_name}"))
        .map_err(|e| ProviderError::Invalid(e.to_string()))
}

/// Reads the certificate chain, private key and trust bundle from PEM files.
///
/// Files are re-read on every fetch so rotated material is picked up.
#[derive(Debug, Clone)]
pub struct PemFileProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
    bundle_path: PathBuf,
}

impl PemFileProvider {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            bundle_path: bundle_path.into(),
        }
    }

    /// The files this provider reads.
    pub fn paths(&self) -> [&Path; 3] {
        [
            self.cert_path.as_path(),
            self.key_path.as_path(),
            self.bundle_path.as_path(),
        ]
    }

    async fn read(path: &Path) -> Result<Vec<u8>, ProviderError> {
        tokio::fs::read(path).await.map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProviderError> {
        let pem = Self::read(path).await?;
        rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ProviderError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProviderError> {
        let pem = Self::read(path).await?;
        rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|source| ProviderError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| ProviderError::NoPrivateKey(path.to_path_buf()))
    }
}

#[async_trait]
impl IdentityProvider for PemFileProvider {
    async fn fetch_identity(
        &self,
        service_name: &str,
        trust_domain: &wire::TrustDomain,
    ) -> Result<IssuedIdentity, ProviderError> {
        let chain = Self::read_certs(&self.cert_path).await?;
        if chain.is_empty() {
            return Err(ProviderError::NoCertificates(self.cert_path.clone()));
        }
        let key = Self::read_key(&self.key_path).await?;
        let authorities = Self::read_certs(&self.bundle_path).await?;

        tracing::debug!(
            service = %service_name,
            trust_domain = %trust_domain,
            chain_len = chain.len(),
            authorities = authorities.len(),
            "Loaded identity material from PEM files"
        );

        Ok(IssuedIdentity {
            trust_domain: trust_domain.clone(),
            bundle: Some(X509Bundle::from_x509_authorities(trust_domain.clone(), authorities)),
            svid: X509Svid::new(workload_id(trust_domain, service_name)?, chain, key),
        })
    }
}

struct MemoryMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    authorities: Option<Vec<CertificateDer<'static>>>,
    issued_domain: Option<wire::TrustDomain>,
    failure: Option<String>,
    fetches: usize,
    closed: bool,
}

/// Serves identity material held in memory.
///
/// Supports swapping material (rotation) and injecting fetch failures.
pub struct MemoryIdentityProvider {
    inner: Mutex<MemoryMaterial>,
}

impl MemoryIdentityProvider {
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        authorities: Vec<CertificateDer<'static>>,
    ) -> Self {
        Self {
            inner: Mutex::new(MemoryMaterial {
                chain,
                key,
                authorities: Some(authorities),
                issued_domain: None,
                failure: None,
                fetches: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryMaterial> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue material for `domain` regardless of the requested trust domain.
    pub fn issue_for_domain(self, domain: wire::TrustDomain) -> Self {
        self.lock().issued_domain = Some(domain);
        self
    }

    /// Hand out material without a trust bundle.
    pub fn without_bundle(self) -> Self {
        self.lock().authorities = None;
        self
    }

    /// Make every subsequent fetch fail with `reason`; `None` clears it.
    pub fn set_failure(&self, reason: Option<&str>) {
        self.lock().failure = reason.map(str::to_string);
    }

    /// Replace the material handed out by later fetches.
    pub fn replace_material(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        authorities: Vec<CertificateDer<'static>>,
    ) {
        let mut inner = self.lock();
        inner.chain = chain;
        inner.key = key;
        inner.authorities = Some(authorities);
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn fetch_identity(
        &self,
        service_name: &str,
        trust_domain: &wire::TrustDomain,
    ) -> Result<IssuedIdentity, ProviderError> {
        let mut inner = self.lock();
        inner.fetches += 1;
        if inner.closed {
            return Err(ProviderError::Closed);
        }
        if let Some(reason) = &inner.failure {
            return Err(ProviderError::Unavailable(reason.clone()));
        }

        let domain = inner
            .issued_domain
            .clone()
            .unwrap_or_else(|| trust_domain.clone());

        Ok(IssuedIdentity {
            bundle: inner
                .authorities
                .clone()
                .map(|authorities| X509Bundle::from_x509_authorities(domain.clone(), authorities)),
            svid: X509Svid::new(
                workload_id(&domain, service_name)?,
                inner.chain.clone(),
                inner.key.clone_key(),
            ),
            trust_domain: domain,
        })
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.lock().closed = true;
        Ok(())
    }
}
