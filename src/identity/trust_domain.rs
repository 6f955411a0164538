//! Trust domain and trust bundle value types.
//!
//! # Responsibilities
//! - Validate and normalize trust domain names
//! - Hold the certificate authorities trusted for one trust domain
//!
//! # Design Decisions
//! - `TrustDomain::default()` is the zero value and means "absent"
//! - Bundles are validated on construction; an empty bundle is an error

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rustls::pki_types::CertificateDer;
use thiserror::Error;

/// Maximum length of a trust domain name.
pub const MAX_TRUST_DOMAIN_LEN: usize = 255;

const SPIFFE_SCHEME: &str = "spiffe://";

/// Reasons a string is not a valid trust domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustDomainError {
    #[error("trust domain cannot be empty")]
    Empty,

    #[error("trust domain must not contain a scheme: {0:?}")]
    Scheme(String),

    #[error("trust domain must not contain a path: {0:?}")]
    Path(String),

    #[error("trust domain must not contain a port: {0:?}")]
    Port(String),

    #[error("trust domain exceeds maximum length of {MAX_TRUST_DOMAIN_LEN} characters")]
    TooLong,

    #[error("invalid trust domain format (must be a DNS name): {0:?}")]
    Format(String),

    #[error("not a SPIFFE ID: {0:?}")]
    NotSpiffeId(String),
}

/// A validated trust domain such as `example.org`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Parse and normalize a trust domain.
    ///
    /// Input is trimmed and lowercased. Schemes, ports and paths are rejected,
    /// and the remainder must be a DNS name.
    pub fn parse(name: &str) -> Result<Self, TrustDomainError> {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(TrustDomainError::Empty);
        }
        if name.contains("://") {
            return Err(TrustDomainError::Scheme(name));
        }
        if name.contains('/') {
            return Err(TrustDomainError::Path(name));
        }
        if name.contains(':') {
            return Err(TrustDomainError::Port(name));
        }
        if name.len() > MAX_TRUST_DOMAIN_LEN {
            return Err(TrustDomainError::TooLong);
        }
        if !is_dns_name(&name) {
            return Err(TrustDomainError::Format(name));
        }
        Ok(Self(name))
    }

    /// Extract the trust domain from a SPIFFE ID such as `spiffe://example.org/service`.
    pub fn from_spiffe_id(id: &str) -> Result<Self, TrustDomainError> {
        let remainder = id
            .strip_prefix(SPIFFE_SCHEME)
            .ok_or_else(|| TrustDomainError::NotSpiffeId(id.to_string()))?;
        let host = remainder.split('/').next().unwrap_or_default();
        Self::parse(host)
    }

    /// Build a trust domain from a name the identity protocol already validated.
    pub(crate) fn from_validated(name: &str) -> Self {
        Self(name.to_string())
    }

    /// Whether this is the zero ("absent") value.
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison.
    pub fn equals(&self, other: &TrustDomain) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }

    /// `spiffe://<domain>`, or `None` for the zero value.
    pub fn to_spiffe_uri(&self) -> Option<String> {
        if self.is_zero() {
            None
        } else {
            Some(format!("{SPIFFE_SCHEME}{}", self.0))
        }
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = TrustDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_dns_name(name: &str) -> bool {
    name.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    })
}

/// Reasons a set of certificates is not a usable trust bundle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustBundleError {
    #[error("trust bundle cannot be empty")]
    Empty,

    #[error("certificate at index {0} is empty")]
    EmptyCertificate(usize),

    #[error("duplicate certificate found in trust bundle at index {0}")]
    Duplicate(usize),
}

/// The certificate authorities trusted to validate identities in one trust domain.
///
/// Order is preserved from construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    authorities: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    pub fn new(authorities: Vec<CertificateDer<'static>>) -> Result<Self, TrustBundleError> {
        if authorities.is_empty() {
            return Err(TrustBundleError::Empty);
        }

        let mut seen = HashSet::with_capacity(authorities.len());
        for (index, cert) in authorities.iter().enumerate() {
            if cert.as_ref().is_empty() {
                return Err(TrustBundleError::EmptyCertificate(index));
            }
            if !seen.insert(cert.as_ref()) {
                return Err(TrustBundleError::Duplicate(index));
            }
        }

        Ok(Self { authorities })
    }

    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    /// Always false for a constructed bundle; kept for symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    pub fn contains(&self, cert: &CertificateDer<'_>) -> bool {
        self.authorities.iter().any(|ca| ca.as_ref() == cert.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn parse_normalizes_case_and_whitespace() {
        let td = TrustDomain::parse("  Example.ORG ").unwrap();
        assert_eq!(td.as_str(), "example.org");
        assert!(!td.is_zero());
    }

    #[test]
    fn parse_rejects_non_domain_input() {
        assert_eq!(TrustDomain::parse(""), Err(TrustDomainError::Empty));
        assert!(matches!(
            TrustDomain::parse("spiffe://example.org"),
            Err(TrustDomainError::Scheme(_))
        ));
        assert!(matches!(
            TrustDomain::parse("example.org/service"),
            Err(TrustDomainError::Path(_))
        ));
        assert!(matches!(
            TrustDomain::parse("example.org:8443"),
            Err(TrustDomainError::Port(_))
        ));
        assert!(matches!(
            TrustDomain::parse("-bad.example"),
            Err(TrustDomainError::Format(_))
        ));
        assert!(matches!(
            TrustDomain::parse("a..b"),
            Err(TrustDomainError::Format(_))
        ));
        assert_eq!(
            TrustDomain::parse(&"a".repeat(256)),
            Err(TrustDomainError::TooLong)
        );
    }

    #[test]
    fn zero_value_has_no_uri() {
        let zero = TrustDomain::default();
        assert!(zero.is_zero());
        assert_eq!(zero.to_spiffe_uri(), None);

        let td: TrustDomain = "prod.example.org".parse().unwrap();
        assert_eq!(td.to_spiffe_uri().as_deref(), Some("spiffe://prod.example.org"));
    }

    #[test]
    fn extracts_domain_from_spiffe_id() {
        let td = TrustDomain::from_spiffe_id("spiffe://example.org/payments/api").unwrap();
        assert_eq!(td.as_str(), "example.org");

        assert!(matches!(
            TrustDomain::from_spiffe_id("https://example.org/x"),
            Err(TrustDomainError::NotSpiffeId(_))
        ));
    }

    #[test]
    fn bundle_rejects_empty_and_duplicates() {
        assert_eq!(TrustBundle::new(vec![]), Err(TrustBundleError::Empty));
        assert_eq!(
            TrustBundle::new(vec![cert(b"ca-1"), cert(b"")]),
            Err(TrustBundleError::EmptyCertificate(1))
        );
        assert_eq!(
            TrustBundle::new(vec![cert(b"ca-1"), cert(b"ca-2"), cert(b"ca-1")]),
            Err(TrustBundleError::Duplicate(2))
        );
    }

    #[test]
    fn bundle_preserves_order() {
        let bundle = TrustBundle::new(vec![cert(b"root"), cert(b"intermediate")]).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.authorities()[0].as_ref(), b"root");
        assert!(bundle.contains(&cert(b"intermediate")));
        assert!(!bundle.contains(&cert(b"other")));
    }
}
