//! Conversion between core identity types and identity-protocol wire types.
//!
//! # Responsibilities
//! - Translate trust domains in both directions
//! - Translate trust bundles in both directions, validating on the way in
//!
//! # Design Decisions
//! - Pure functions; swapping the identity-protocol library only touches this module
//! - `decode` is total because the wire type is only ever constructed validated
//! - `must_*` variants are for call sites that already proved the inputs valid
//!   (for example, a constructed `IdentityBinding`). They panic instead of
//!   returning an error, so a violated precondition surfaces as a bug.

use thiserror::Error;

use crate::identity::trust_domain::{TrustBundle, TrustBundleError, TrustDomain};
use crate::identity::wire;

/// Errors raised while converting identity material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid trust domain: {0}")]
    InvalidDomain(String),

    #[error("trust bundle is nil")]
    NilBundle,

    #[error("invalid trust bundle: {0}")]
    InvalidBundle(#[from] TrustBundleError),
}

/// Wire trust domain → core trust domain.
pub fn decode(td: &wire::TrustDomain) -> TrustDomain {
    TrustDomain::from_validated(td.name())
}

/// Core trust domain → wire trust domain.
///
/// Fails with [`CodecError::InvalidDomain`] for the zero value.
pub fn encode(td: &TrustDomain) -> Result<wire::TrustDomain, CodecError> {
    if td.is_zero() {
        return Err(CodecError::InvalidDomain(
            "cannot convert empty trust domain".to_string(),
        ));
    }
    wire::TrustDomain::from_string(td.as_str()).map_err(|e| CodecError::InvalidDomain(e.to_string()))
}

/// Like [`encode`], but panics if `td` is not a concrete, valid trust domain.
pub fn must_encode(td: &TrustDomain) -> wire::TrustDomain {
    match encode(td) {
        Ok(wire_td) => wire_td,
        Err(e) => panic!("failed to convert trust domain {td:?}: {e}"),
    }
}

pub fn decode_all(tds: &[wire::TrustDomain]) -> Vec<TrustDomain> {
    tds.iter().map(decode).collect()
}

/// Encode every trust domain, failing on the first invalid one.
pub fn encode_all(tds: &[TrustDomain]) -> Result<Vec<wire::TrustDomain>, CodecError> {
    tds.iter()
        .enumerate()
        .map(|(index, td)| {
            encode(td).map_err(|e| match e {
                CodecError::InvalidDomain(reason) => {
                    CodecError::InvalidDomain(format!("trust domain at index {index}: {reason}"))
                }
                other => other,
            })
        })
        .collect()
}

/// Wire bundle → validated core bundle.
pub fn bundle_to_domain(bundle: Option<&wire::X509Bundle>) -> Result<TrustBundle, CodecError> {
    let bundle = bundle.ok_or(CodecError::NilBundle)?;
    Ok(TrustBundle::new(bundle.x509_authorities().to_vec())?)
}

/// Core bundle + trust domain → wire bundle.
///
/// The domain is checked before the bundle, so when both are wrong the
/// result is always [`CodecError::InvalidDomain`].
pub fn domain_to_bundle(
    bundle: Option<&TrustBundle>,
    td: &TrustDomain,
) -> Result<wire::X509Bundle, CodecError> {
    let wire_td = encode(td)?;
    let bundle = bundle.ok_or(CodecError::NilBundle)?;
    Ok(wire::X509Bundle::from_x509_authorities(
        wire_td,
        bundle.authorities().to_vec(),
    ))
}

/// Like [`domain_to_bundle`], but panics on invalid input.
pub fn must_domain_to_bundle(bundle: &TrustBundle, td: &TrustDomain) -> wire::X509Bundle {
    match domain_to_bundle(Some(bundle), td) {
        Ok(wire_bundle) => wire_bundle,
        Err(e) => panic!("failed to convert trust bundle for domain {td:?}: {e}"),
    }
}
