//! Workload identity subsystem.
//!
//! # Data Flow
//! ```text
//! IdentitySettings (service name + trust domain reference)
//!     → trust_domain.rs (parse & normalize)
//!     → codec.rs (core → wire)
//!     → provider.rs (fetch SVID + bundle)
//!     → codec.rs (wire → core, validate bundle)
//!     → binding.rs (IdentityBinding, read-only)
//!     → net::tls (mTLS server config)
//!
//! On credential change:
//!     watcher.rs detects change
//!     → IdentityServer::rotate_identity
//!     → new binding swapped in, listener reloaded
//! ```
//!
//! # Design Decisions
//! - Wire types never leak into core code; the codec is the only crossing point
//! - Provider material is untrusted until it has passed the codec
//! - The binding exists before the listener accepts

pub mod binding;
pub mod codec;
pub mod provider;
pub mod trust_domain;
pub mod watcher;
pub mod wire;

pub use binding::{BindingSlot, IdentityBinding, IdentitySettings};
pub use codec::CodecError;
pub use provider::{IdentityProvider, IssuedIdentity, MemoryIdentityProvider, PemFileProvider, ProviderError};
pub use trust_domain::{TrustBundle, TrustBundleError, TrustDomain, TrustDomainError};
pub use watcher::IdentityWatcher;
