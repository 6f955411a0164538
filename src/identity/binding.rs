//! The server's established workload identity.
//!
//! # Responsibilities
//! - Validate identity settings before anything is fetched
//! - Fetch material from the identity provider and validate it through the codec
//! - Hold the result read-only for transport configuration
//!
//! # Design Decisions
//! - A binding is immutable; rotation builds a new one and swaps it in
//! - Reads go through `ArcSwapOption`, so no lock is taken on the hot path

use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::loader::ConfigError;
use crate::config::validation::ValidationError;
use crate::error::ServerError;
use crate::identity::codec;
use crate::identity::provider::{IdentityProvider, ProviderError};
use crate::identity::trust_domain::{TrustBundle, TrustDomain};
use crate::identity::wire::{self, SpiffeId};

/// What the server needs to know to request an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySettings {
    pub service_name: String,
    /// Trust domain reference, e.g. `example.org`.
    pub trust_domain: String,
}

impl IdentitySettings {
    pub fn new(service_name: impl Into<String>, trust_domain: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            trust_domain: trust_domain.into(),
        }
    }
}

fn configuration_error(field: &str, message: impl Into<String>) -> ServerError {
    ServerError::Configuration(ConfigError::Validation(vec![ValidationError {
        field: field.to_string(),
        message: message.into(),
    }]))
}

/// Validated identity material for one service.
#[derive(Debug)]
pub struct IdentityBinding {
    trust_domain: TrustDomain,
    bundle: TrustBundle,
    service_name: String,
    spiffe_id: SpiffeId,
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: Arc<PrivateKeyDer<'static>>,
    established_at: SystemTime,
}

impl IdentityBinding {
    /// Establish an identity for the configured service.
    ///
    /// Configuration problems are reported before the provider is contacted.
    pub async fn establish(
        settings: &IdentitySettings,
        provider: &dyn IdentityProvider,
    ) -> Result<Self, ServerError> {
        let service_name = settings.service_name.trim();
        if service_name.is_empty() {
            return Err(configuration_error("service.name", "service name is required"));
        }

        let trust_domain = TrustDomain::parse(&settings.trust_domain)
            .map_err(|e| configuration_error("service.domain", e.to_string()))?;
        let wire_domain = codec::encode(&trust_domain)
            .map_err(|e| configuration_error("service.domain", e.to_string()))?;

        let issued = provider
            .fetch_identity(service_name, &wire_domain)
            .await
            .map_err(ServerError::Provider)?;

        let issued_domain = codec::decode(&issued.trust_domain);
        if !issued_domain.equals(&trust_domain) {
            return Err(ProviderError::TrustDomainMismatch {
                expected: trust_domain.to_string(),
                actual: issued_domain.to_string(),
            }
            .into());
        }
        if !codec::decode(issued.svid.id().trust_domain()).equals(&trust_domain) {
            return Err(ProviderError::TrustDomainMismatch {
                expected: trust_domain.to_string(),
                actual: issued.svid.id().trust_domain().to_string(),
            }
            .into());
        }

        let bundle = codec::bundle_to_domain(issued.bundle.as_ref()).map_err(ProviderError::from)?;

        if issued.svid.certificates().is_empty() {
            return Err(ProviderError::Invalid("workload certificate chain is empty".to_string()).into());
        }

        tracing::info!(
            service = %service_name,
            trust_domain = %trust_domain,
            spiffe_id = %issued.svid.id(),
            authorities = bundle.len(),
            "Identity established"
        );

        Ok(Self {
            trust_domain,
            bundle,
            service_name: service_name.to_string(),
            spiffe_id: issued.svid.id().clone(),
            certificate_chain: issued.svid.certificates().to_vec(),
            private_key: Arc::clone(issued.svid.private_key()),
            established_at: SystemTime::now(),
        })
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Leaf first.
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certificate_chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }

    pub fn established_at(&self) -> SystemTime {
        self.established_at
    }

    /// The bundle in identity-protocol form.
    ///
    /// Both halves were validated when the binding was established.
    pub fn wire_bundle(&self) -> wire::X509Bundle {
        codec::must_domain_to_bundle(&self.bundle, &self.trust_domain)
    }
}

/// Holder for the current binding, swapped atomically on rotation.
#[derive(Debug, Default)]
pub struct BindingSlot {
    current: ArcSwapOption<IdentityBinding>,
}

impl BindingSlot {
    pub fn load(&self) -> Option<Arc<IdentityBinding>> {
        self.current.load_full()
    }

    /// Install `binding`, returning the previous one.
    pub fn replace(&self, binding: Arc<IdentityBinding>) -> Option<Arc<IdentityBinding>> {
        self.current.swap(Some(binding))
    }
}
