//! Shared fixtures for lifecycle and transport tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::watch;

use identity_server::identity::{IdentityBinding, MemoryIdentityProvider};
use identity_server::net::{InFlightTracker, ServiceRegistrar, ServingListener, Transport, TransportError};

/// Provider with placeholder material. Enough for fake transports, which never parse it.
pub fn memory_provider() -> MemoryIdentityProvider {
    MemoryIdentityProvider::new(
        vec![CertificateDer::from(b"leaf-1".to_vec())],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(b"key-1".to_vec())),
        vec![CertificateDer::from(b"ca".to_vec())],
    )
}

/// CA-signed leaf, its key and the CA certificate, for real TLS.
pub struct TestPki {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub authorities: Vec<CertificateDer<'static>>,
    pub chain_pem: String,
    pub key_pem: String,
    pub authorities_pem: String,
}

impl TestPki {
    /// Write the PEM files a `PemFileProvider` reads: leaf, key, bundle.
    pub fn write_to(&self, dir: &Path) -> [PathBuf; 3] {
        let paths = [dir.join("svid.pem"), dir.join("svid.key"), dir.join("bundle.pem")];
        std::fs::write(&paths[0], &self.chain_pem).unwrap();
        std::fs::write(&paths[1], &self.key_pem).unwrap();
        std::fs::write(&paths[2], &self.authorities_pem).unwrap();
        paths
    }
}

pub fn generate_pki() -> TestPki {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = rcgen::KeyPair::generate().unwrap();
    let leaf = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .signed_by(&leaf_key, &ca, &ca_key)
        .unwrap();

    TestPki {
        chain: vec![leaf.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        authorities: vec![ca.der().clone()],
        chain_pem: leaf.pem(),
        key_pem: leaf_key.serialize_pem(),
        authorities_pem: ca.pem(),
    }
}

/// A named service with a single route.
pub struct TestService(pub &'static str);

impl ServiceRegistrar for TestService {
    fn service_name(&self) -> &str {
        self.0
    }

    fn routes(&self) -> Router {
        let name = self.0;
        Router::new().route(&format!("/{name}"), get(move || async move { name }))
    }
}

/// In-process transport that records what the controller does to it.
pub struct FakeTransport {
    listener: Arc<FakeListener>,
    handlers: Arc<Mutex<Vec<String>>>,
    start_delay: Duration,
    start_error: Option<String>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            listener: Arc::new(FakeListener::new()),
            handlers: Arc::new(Mutex::new(Vec::new())),
            start_delay: Duration::ZERO,
            start_error: None,
        }
    }

    /// Sleep this long in `start`, keeping the server initializing.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn failing_start(mut self, reason: &str) -> Self {
        self.start_error = Some(reason.to_string());
        self
    }

    pub fn listener(&self) -> Arc<FakeListener> {
        Arc::clone(&self.listener)
    }

    pub fn handlers(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.handlers)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn register_handler(&mut self, registrar: &dyn ServiceRegistrar) -> Result<(), TransportError> {
        self.handlers
            .lock()
            .unwrap()
            .push(registrar.service_name().to_string());
        Ok(())
    }

    async fn start(self, binding: Arc<IdentityBinding>) -> Result<Arc<dyn ServingListener>, TransportError> {
        tokio::time::sleep(self.start_delay).await;
        if let Some(reason) = self.start_error {
            return Err(TransportError::Tls(reason));
        }
        *self.listener.started_with.lock().unwrap() = Some(binding.spiffe_id().to_string());
        Ok(self.listener)
    }
}

pub struct FakeListener {
    pub tracker: InFlightTracker,
    stopped: AtomicBool,
    closed: AtomicBool,
    reloads: AtomicUsize,
    close_error: Mutex<Option<String>>,
    started_with: Mutex<Option<String>>,
    exit: watch::Sender<Option<Result<(), String>>>,
}

impl FakeListener {
    fn new() -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            tracker: InFlightTracker::new(),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reloads: AtomicUsize::new(0),
            close_error: Mutex::new(None),
            started_with: Mutex::new(None),
            exit,
        }
    }

    /// Simulate the accept loop dying on its own.
    pub fn crash(&self, reason: &str) {
        self.exit.send_replace(Some(Err(reason.to_string())));
    }

    pub fn fail_close_with(&self, reason: &str) {
        *self.close_error.lock().unwrap() = Some(reason.to_string());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn started_with(&self) -> Option<String> {
        self.started_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServingListener for FakeListener {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn stop_accepting(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn in_flight(&self) -> usize {
        self.tracker.count()
    }

    async fn wait_for_in_flight(&self) {
        self.tracker.wait_idle().await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(Ok(()));
                true
            } else {
                false
            }
        });
        match self.close_error.lock().unwrap().clone() {
            Some(reason) => Err(TransportError::Serve(reason)),
            None => Ok(()),
        }
    }

    async fn exited(&self) -> Result<(), TransportError> {
        let mut rx = self.exit.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::Serve("exit channel closed".to_string()))?
            .clone();
        match outcome {
            Some(Err(reason)) => Err(TransportError::Serve(reason)),
            _ => Ok(()),
        }
    }

    fn reload(&self, _binding: &IdentityBinding) -> Result<(), TransportError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
