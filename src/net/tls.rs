//! Mutual TLS configuration derived from the identity binding.

use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::identity::IdentityBinding;
use crate::net::transport::TransportError;

/// Build a rustls server config that presents the binding's certificate chain
/// and requires clients to chain to the binding's trust bundle.
pub fn server_config(binding: &IdentityBinding) -> Result<ServerConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let bundle = binding.wire_bundle();
    let mut roots = RootCertStore::empty();
    for (index, authority) in bundle.x509_authorities().iter().enumerate() {
        roots.add(authority.clone()).map_err(|e| {
            TransportError::Tls(format!("failed to add trust bundle authority {index}: {e}"))
        })?;
    }

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| TransportError::Tls(format!("client verifier error: {e}")))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(binding.certificate_chain().to_vec(), binding.private_key())
        .map_err(|e| TransportError::Tls(format!("server config error: {e}")))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    tracing::debug!(
        spiffe_id = %binding.spiffe_id(),
        authorities = bundle.x509_authorities().len(),
        "Built mTLS server configuration"
    );

    Ok(config)
}
