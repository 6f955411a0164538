//! Lifecycle and shutdown behavior against an in-process transport.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::time::Instant;

use identity_server::error::ServerError;
use identity_server::identity::{IdentityProvider, IdentitySettings, MemoryIdentityProvider};
use identity_server::lifecycle::{
    BoxError, IdentityServer, RegistryError, ServerOptions, ServerState, ShutdownConfig, ShutdownPhaseError,
};

use common::{memory_provider, FakeTransport, TestService};

fn options(shutdown: ShutdownConfig) -> ServerOptions {
    ServerOptions::new(IdentitySettings::new("payments", "example.org")).with_shutdown(shutdown)
}

fn server_with(shutdown: ShutdownConfig) -> IdentityServer {
    IdentityServer::new(options(shutdown), Arc::new(memory_provider()))
}

fn spawn_serve(server: &IdentityServer, transport: FakeTransport) -> tokio::task::JoinHandle<Result<(), ServerError>> {
    let server = server.clone();
    tokio::spawn(async move { server.serve(transport).await })
}

fn counting_cleanup(server: &IdentityServer, counter: &Arc<AtomicUsize>) {
    let counter = Arc::clone(counter);
    server
        .register_cleanup_func(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        })
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_twice_runs_shutdown_once() {
    let server = server_with(ShutdownConfig::default());
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    let transport = FakeTransport::new();
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();
    assert_eq!(listener.started_with().as_deref(), Some("spiffe://example.org/payments"));

    let (first, second) = tokio::join!(server.close(), server.close());
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(server.close().await.is_ok());

    assert!(serving.await.unwrap().is_ok());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(listener.is_stopped());
    assert!(listener.is_closed());
}

#[tokio::test(start_paused = true)]
async fn handlers_attach_once_in_registration_order() {
    let server = server_with(ShutdownConfig::default());
    server.register_service(Arc::new(TestService("orders"))).unwrap();
    server.register_service(Arc::new(TestService("billing"))).unwrap();

    let transport = FakeTransport::new();
    let handlers = transport.handlers();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    assert_eq!(*handlers.lock().unwrap(), vec!["orders", "billing"]);
    assert_eq!(server.service_names(), vec!["orders", "billing"]);

    let late = server.register_service(Arc::new(TestService("late")));
    assert!(matches!(
        late,
        Err(ServerError::Registry(RegistryError::AlreadyServing(name))) if name == "late"
    ));

    server.close().await.unwrap();
    serving.await.unwrap().unwrap();
    assert_eq!(handlers.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn blank_service_name_is_rejected() {
    let server = server_with(ShutdownConfig::default());
    assert!(matches!(
        server.register_service(Arc::new(TestService("  "))),
        Err(ServerError::Validation { argument: "registration", .. })
    ));
    assert!(server.service_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cleanups_run_in_order_and_bound_shutdown_time() {
    let completed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&completed);
    let server = server_with(ShutdownConfig::default().on_shutdown_complete(move |err| {
        *seen.lock().unwrap() = Some(err.is_none());
    }));

    let order = Arc::new(Mutex::new(Vec::new()));
    for (name, millis) in [("flush", 500), ("disconnect", 300)] {
        let order = Arc::clone(&order);
        server
            .register_named_cleanup_func(name, move || async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                order.lock().unwrap().push(name);
                Ok::<(), BoxError>(())
            })
            .unwrap();
    }

    let serving = spawn_serve(&server, FakeTransport::new());
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    let started = Instant::now();
    server.close().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(800), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
    assert_eq!(*order.lock().unwrap(), vec!["flush", "disconnect"]);
    assert_eq!(*completed.lock().unwrap(), Some(true));
    assert_eq!(server.state(), ServerState::Stopped);
    serving.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cleanup_failures_are_aggregated() {
    let post_hook_saw = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&post_hook_saw);
    let server = server_with(ShutdownConfig::default().post_shutdown_hook(move |err| {
        seen.store(err.map_or(0, |e| e.len()), Ordering::SeqCst);
        Ok(())
    }));

    let ran = Arc::new(AtomicUsize::new(0));
    server
        .register_named_cleanup_func("cache", || async { Err::<(), BoxError>("cache flush failed".into()) })
        .unwrap();
    counting_cleanup(&server, &ran);
    server
        .register_named_cleanup_func("db", || async { Err::<(), BoxError>("db pool busy".into()) })
        .unwrap();

    let serving = spawn_serve(&server, FakeTransport::new());
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    let err = match server.close().await {
        Err(ServerError::Shutdown(e)) => e,
        other => panic!("expected shutdown error, got {other:?}"),
    };
    assert_eq!(
        err.causes(),
        &[
            ShutdownPhaseError::Cleanup {
                name: "cache".into(),
                reason: "cache flush failed".into()
            },
            ShutdownPhaseError::Cleanup {
                name: "db".into(),
                reason: "db pool busy".into()
            },
        ]
    );
    assert!(err.to_string().contains("2 error(s)"));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(post_hook_saw.load(Ordering::SeqCst), 2);

    // Serve reports the same aggregate.
    assert!(matches!(serving.await.unwrap(), Err(ServerError::Shutdown(e)) if e.len() == 2));
}

#[tokio::test(start_paused = true)]
async fn unnamed_cleanups_are_told_apart() {
    let server = server_with(ShutdownConfig::default());

    let registrations: Vec<_> = (0..3)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move {
                server.register_cleanup_func(|| async { Err::<(), BoxError>("unavailable".into()) })
            })
        })
        .collect();
    for registration in registrations {
        registration.await.unwrap().unwrap();
    }

    let err = match server.close().await {
        Err(ServerError::Shutdown(e)) => e,
        other => panic!("expected shutdown error, got {other:?}"),
    };
    let mut names: Vec<_> = err
        .causes()
        .iter()
        .map(|cause| match cause {
            ShutdownPhaseError::Cleanup { name, .. } => name.clone(),
            other => panic!("unexpected cause {other:?}"),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["cleanup-1", "cleanup-2", "cleanup-3"]);
}

#[tokio::test(start_paused = true)]
async fn force_timeout_preempts_drain_but_cleanup_runs() {
    let server = server_with(
        ShutdownConfig::default()
            .with_drain_timeout(Duration::from_secs(10))
            .with_force_timeout(Duration::from_secs(1)),
    );
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    let transport = FakeTransport::new();
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();
    let _stuck = listener.tracker.track();

    let started = Instant::now();
    let err = match server.close().await {
        Err(ServerError::Shutdown(e)) => e,
        other => panic!("expected shutdown error, got {other:?}"),
    };

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        err.causes(),
        [ShutdownPhaseError::ForceTimeout { in_flight: 1, .. }]
    ));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(listener.is_closed());
    serving.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_is_reported() {
    let server = server_with(
        ShutdownConfig::default()
            .with_drain_timeout(Duration::from_millis(200))
            .with_force_timeout(Duration::from_secs(5)),
    );

    let transport = FakeTransport::new();
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();
    let _stuck = listener.tracker.track();

    match server.close().await {
        Err(ServerError::Shutdown(e)) => assert!(matches!(
            e.causes(),
            [ShutdownPhaseError::DrainTimeout { in_flight: 1, .. }]
        )),
        other => panic!("expected drain timeout, got {other:?}"),
    }
    serving.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_in_flight_requests() {
    let server = server_with(ShutdownConfig::default());
    let transport = FakeTransport::new();
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    let request = listener.tracker.track();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(request);
    });

    let started = Instant::now();
    server.close().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
    serving.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn pre_hook_runs_before_listener_stops() {
    let transport = FakeTransport::new();
    let listener = transport.listener();
    let observed = Arc::new(Mutex::new(None));

    let hook_listener = Arc::clone(&listener);
    let hook_observed = Arc::clone(&observed);
    let server = server_with(ShutdownConfig::default().pre_shutdown_hook(move || {
        let listener = Arc::clone(&hook_listener);
        let observed = Arc::clone(&hook_observed);
        async move {
            *observed.lock().unwrap() = Some(listener.is_stopped());
            Ok::<(), BoxError>(())
        }
    }));

    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();
    server.close().await.unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(false));
    assert!(listener.is_stopped());
    serving.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn deadline_stops_the_server() {
    let server = server_with(ShutdownConfig::default());
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    let started = Instant::now();
    server
        .serve_with_deadline(FakeTransport::new(), started + Duration::from_millis(100))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_racing_close_shuts_down_once() {
    let server = server_with(ShutdownConfig::default());
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    let deadline = Instant::now() + Duration::from_millis(100);
    let closer = server.clone();
    let close = tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        closer.close().await
    });

    let served = server.serve_with_deadline(FakeTransport::new(), deadline).await;
    let closed = close.await.unwrap();

    assert!(served.is_ok());
    assert!(closed.is_ok());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn provider_failure_fails_startup_without_cleanup() {
    let provider = Arc::new(memory_provider());
    provider.set_failure(Some("workload api unavailable"));
    let server = IdentityServer::new(
        options(ShutdownConfig::default()),
        Arc::clone(&provider) as Arc<dyn IdentityProvider>,
    );
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    let err = server.serve(FakeTransport::new()).await.unwrap_err();
    assert!(matches!(err, ServerError::Provider(_)));
    assert_eq!(server.state(), ServerState::Failed);
    assert!(server.binding().is_none());

    assert!(server.close().await.is_ok());
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    assert!(matches!(
        server.wait_until_serving(Duration::from_millis(10)).await,
        Err(ServerError::InvalidState { state: ServerState::Failed, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn transport_start_failure_fails_startup() {
    let server = server_with(ShutdownConfig::default());
    let err = server
        .serve(FakeTransport::new().failing_start("bad key"))
        .await
        .unwrap_err();

    assert!(matches!(err, ServerError::Transport(_)));
    assert_eq!(server.state(), ServerState::Failed);
    assert!(server.binding().is_none());
}

#[tokio::test(start_paused = true)]
async fn dropping_serve_during_startup_fails_the_server() {
    let server = server_with(ShutdownConfig::default());
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    let transport = FakeTransport::new().with_start_delay(Duration::from_secs(5));
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state(), ServerState::Initializing);
    serving.abort();
    assert!(serving.await.unwrap_err().is_cancelled());

    assert_eq!(server.state(), ServerState::Failed);
    assert!(server.binding().is_none());
    assert!(listener.started_with().is_none());

    let closed = tokio::time::timeout(Duration::from_secs(60), server.close()).await;
    assert!(matches!(closed, Ok(Ok(()))));
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn parked_close_returns_when_serve_is_dropped() {
    let server = server_with(ShutdownConfig::default());
    let serving = spawn_serve(&server, FakeTransport::new().with_start_delay(Duration::from_secs(5)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closer = server.clone();
    let close = tokio::spawn(async move { closer.close().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!close.is_finished());

    // Cancel startup the way a select! or timeout would.
    serving.abort();
    let closed = tokio::time::timeout(Duration::from_secs(60), close).await;
    assert!(matches!(closed, Ok(Ok(Ok(())))));
    assert_eq!(server.state(), ServerState::Failed);
}

#[tokio::test(start_paused = true)]
async fn serve_dropped_by_timeout_fails_the_server() {
    let server = server_with(ShutdownConfig::default());
    let attempt = tokio::time::timeout(
        Duration::from_millis(100),
        server.serve(FakeTransport::new().with_start_delay(Duration::from_secs(5))),
    )
    .await;

    assert!(attempt.is_err());
    assert_eq!(server.state(), ServerState::Failed);
    assert!(server.close().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn close_during_startup_is_deferred_until_serving() {
    let server = server_with(ShutdownConfig::default());
    let transport = FakeTransport::new().with_start_delay(Duration::from_millis(200));
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.state(), ServerState::Initializing);

    server.close().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(listener.is_closed());
    serving.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_before_serve_stops_without_listener() {
    let server = server_with(ShutdownConfig::default());
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    server.close().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    assert!(matches!(
        server.serve(FakeTransport::new()).await,
        Err(ServerError::InvalidState {
            operation: "serve",
            state: ServerState::Stopped
        })
    ));
    assert!(matches!(
        server.register_cleanup_func(|| async { Ok::<(), BoxError>(()) }),
        Err(ServerError::ShutdownInProgress)
    ));
}

#[tokio::test(start_paused = true)]
async fn serve_twice_is_rejected() {
    let server = server_with(ShutdownConfig::default());
    let serving = spawn_serve(&server, FakeTransport::new());
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    assert!(matches!(
        server.serve(FakeTransport::new()).await,
        Err(ServerError::InvalidState {
            operation: "serve",
            state: ServerState::Serving
        })
    ));

    server.close().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn transport_exit_triggers_shutdown() {
    let server = server_with(ShutdownConfig::default());
    let cleanups = Arc::new(AtomicUsize::new(0));
    counting_cleanup(&server, &cleanups);

    let transport = FakeTransport::new();
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    listener.crash("accept loop died");
    let err = match serving.await.unwrap() {
        Err(ServerError::Shutdown(e)) => e,
        other => panic!("expected shutdown error, got {other:?}"),
    };

    assert!(matches!(err.causes(), [ShutdownPhaseError::TransportExited(reason)] if reason.contains("accept loop died")));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(server.close().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn listener_close_error_is_reported() {
    let server = server_with(ShutdownConfig::default());
    let transport = FakeTransport::new();
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    listener.fail_close_with("socket busy");
    match server.close().await {
        Err(ServerError::Shutdown(e)) => {
            assert!(matches!(e.causes(), [ShutdownPhaseError::Listener(_)]))
        }
        other => panic!("expected listener error, got {other:?}"),
    }
    serving.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn rotation_swaps_binding_and_reloads_listener() {
    let provider = Arc::new(memory_provider());
    let server = IdentityServer::new(
        options(ShutdownConfig::default()),
        Arc::clone(&provider) as Arc<dyn IdentityProvider>,
    );

    assert!(matches!(
        server.rotate_identity().await,
        Err(ServerError::InvalidState { operation: "rotate_identity", .. })
    ));

    let transport = FakeTransport::new();
    let listener = transport.listener();
    let serving = spawn_serve(&server, transport);
    server.wait_until_serving(Duration::from_secs(1)).await.unwrap();

    let before = server.binding().unwrap();
    provider.replace_material(
        vec![CertificateDer::from(b"leaf-2".to_vec())],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(b"key-2".to_vec())),
        vec![CertificateDer::from(b"ca".to_vec())],
    );
    server.rotate_identity().await.unwrap();

    let after = server.binding().unwrap();
    assert_eq!(before.certificate_chain()[0].as_ref(), b"leaf-1");
    assert_eq!(after.certificate_chain()[0].as_ref(), b"leaf-2");
    assert_eq!(after.spiffe_id(), before.spiffe_id());
    assert_eq!(listener.reloads(), 1);

    provider.set_failure(Some("agent restarting"));
    assert!(server.rotate_identity().await.is_err());
    assert_eq!(server.binding().unwrap().certificate_chain()[0].as_ref(), b"leaf-2");

    server.close().await.unwrap();
    serving.await.unwrap().unwrap();
    assert_eq!(provider.fetch_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn wait_until_serving_times_out() {
    let server = server_with(ShutdownConfig::default());
    assert!(matches!(
        server.wait_until_serving(Duration::from_millis(100)).await,
        Err(ServerError::NotReady(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn provider_cleanup_closes_provider() {
    let provider = Arc::new(MemoryIdentityProvider::new(
        vec![CertificateDer::from(b"leaf".to_vec())],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(b"key".to_vec())),
        vec![CertificateDer::from(b"ca".to_vec())],
    ));
    let server = IdentityServer::new(
        options(ShutdownConfig::default()),
        Arc::clone(&provider) as Arc<dyn IdentityProvider>,
    );
    let closing = Arc::clone(&provider);
    server
        .register_named_cleanup_func("identity-provider", move || async move {
            closing.close().await?;
            Ok::<(), BoxError>(())
        })
        .unwrap();

    server
        .serve_with_deadline(FakeTransport::new(), Instant::now() + Duration::from_millis(10))
        .await
        .unwrap();
    assert!(provider.is_closed());
}
