//! Identity-protocol side types.
//!
//! These mirror what a SPIFFE workload API hands out: a trust domain that
//! has already passed the protocol's own validation, an X.509 bundle keyed by
//! that trust domain, and an X.509 SVID. Core code never consumes them
//! directly; everything crosses through [`crate::identity::codec`].

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use url::Url;

const SPIFFE_SCHEME: &str = "spiffe";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("invalid trust domain {name:?}: {reason}")]
    InvalidTrustDomain { name: String, reason: &'static str },

    #[error("invalid SPIFFE ID {id:?}: {reason}")]
    InvalidSpiffeId { id: String, reason: String },
}

/// A trust domain as validated by the identity protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrustDomain {
    name: String,
}

impl TrustDomain {
    /// Validate a trust domain name using the SPIFFE character rules
    /// (lowercase letters, digits, `.`, `-` and `_`).
    pub fn from_string(name: &str) -> Result<Self, WireError> {
        let invalid = |reason| WireError::InvalidTrustDomain {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("trust domain is missing"));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_'))
        {
            return Err(invalid(
                "trust domain characters are limited to lowercase letters, numbers, dots, dashes, and underscores",
            ));
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The trust domain's own SPIFFE ID, `spiffe://<name>`.
    pub fn id_string(&self) -> String {
        format!("{SPIFFE_SCHEME}://{}", self.name)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A SPIFFE ID: `spiffe://<trust-domain>/<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    pub fn parse(id: &str) -> Result<Self, WireError> {
        let invalid = |reason: &str| WireError::InvalidSpiffeId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(id).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != SPIFFE_SCHEME {
            return Err(invalid("scheme must be spiffe"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("user info is not allowed"));
        }
        if url.port().is_some() {
            return Err(invalid("port is not allowed"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }

        let host = url.host_str().ok_or_else(|| invalid("trust domain is missing"))?;
        let trust_domain = TrustDomain::from_string(host).map_err(|e| invalid(&e.to_string()))?;
        Self::from_path(trust_domain, url.path())
    }

    /// Build an ID from a trust domain and an absolute path (may be empty).
    pub fn from_path(trust_domain: TrustDomain, path: &str) -> Result<Self, WireError> {
        let invalid = |reason: &str| WireError::InvalidSpiffeId {
            id: format!("{}{}", trust_domain.id_string(), path),
            reason: reason.to_string(),
        };

        if !path.is_empty() {
            let Some(rest) = path.strip_prefix('/') else {
                return Err(invalid("path must start with '/'"));
            };
            for segment in rest.split('/') {
                if segment.is_empty() {
                    return Err(invalid("path cannot contain empty segments"));
                }
                if segment == "." || segment == ".." {
                    return Err(invalid("path cannot contain dot segments"));
                }
                if !segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
                {
                    return Err(invalid(
                        "path segment characters are limited to letters, numbers, dots, dashes, and underscores",
                    ));
                }
            }
        }

        Ok(Self {
            trust_domain,
            path: path.to_string(),
        })
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.trust_domain.id_string(), self.path)
    }
}

/// X.509 authorities for one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Bundle {
    trust_domain: TrustDomain,
    authorities: Vec<CertificateDer<'static>>,
}

impl X509Bundle {
    pub fn from_x509_authorities(
        trust_domain: TrustDomain,
        authorities: Vec<CertificateDer<'static>>,
    ) -> Self {
        Self {
            trust_domain,
            authorities,
        }
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn x509_authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }
}

/// An X.509 workload credential: SPIFFE ID, certificate chain (leaf first) and key.
#[derive(Debug, Clone)]
pub struct X509Svid {
    id: SpiffeId,
    certificates: Vec<CertificateDer<'static>>,
    private_key: Arc<PrivateKeyDer<'static>>,
}

impl X509Svid {
    pub fn new(
        id: SpiffeId,
        certificates: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            id,
            certificates,
            private_key: Arc::new(private_key),
        }
    }

    pub fn id(&self) -> &SpiffeId {
        &self.id
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    pub fn private_key(&self) -> &Arc<PrivateKeyDer<'static>> {
        &self.private_key
    }
}
