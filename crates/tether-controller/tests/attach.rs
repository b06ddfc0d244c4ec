//! Attach-by-pid and connect-mode negotiation, end to end.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::sync::Arc;
use std::time::Duration;

use tether_controller::{attach_by_pid, connect_once, ControllerConfig, ControllerError, ControllerListener};
use tether_core::{Address, AttachConfig, AttachMode, ProcessId};
use tether_protocol::{NegotiationError, RawAttachRequest};
use tether_target::{
    InProcessInjection, InjectionError, Injector, SimulatedEngine, Statement, TargetHost,
    ThreadScript,
};

const WAIT: Duration = Duration::from_secs(10);

fn running_engine() -> SimulatedEngine {
    let engine = SimulatedEngine::new();
    engine.spawn(
        ThreadScript::new("main", "main.rs")
            .body(vec![
                Statement::nop(1),
                Statement::sleep(2, Duration::from_millis(2)),
            ])
            .forever(),
    );
    engine
}

fn token_config(token: Option<&str>) -> ControllerConfig {
    ControllerConfig {
        port: 0,
        access_token: token.map(str::to_string),
        exit_on_disconnect: Some(false),
        ..ControllerConfig::default()
    }
}

fn injectable(pid: u32) -> (Arc<TargetHost>, Injector<InProcessInjection>, SimulatedEngine) {
    let engine = running_engine();
    let host = Arc::new(TargetHost::new(Arc::new(engine.clone())).with_pid(ProcessId::new(pid)));
    let primitive = InProcessInjection::new();
    primitive.register(Arc::clone(&host));
    (host, Injector::new(primitive), engine)
}

// ============================================================================
// Connect mode and access tokens
// ============================================================================

#[tokio::test]
async fn test_connect_mode_with_matching_token() {
    let engine = running_engine();
    let host = TargetHost::new(Arc::new(engine.clone()));
    let listener = ControllerListener::bind(token_config(Some("s3cret"))).await.unwrap();
    let address = listener.local_addr().unwrap();

    let target_config = AttachConfig::connect(Address::localhost(address.port()))
        .with_access_token("s3cret");
    let (session, outcome) = tokio::join!(listener.accept(), host.attach(target_config));
    let session = session.unwrap();
    assert!(outcome.unwrap().session().is_some());

    session.ping().await.unwrap();
    assert_eq!(host.state().sessions_bound(), 1);

    session.disconnect(Some(true), false).await.unwrap();
    host.shutdown().await;
}

#[tokio::test]
async fn test_wrong_token_creates_no_session() {
    let engine = running_engine();
    let host = TargetHost::new(Arc::new(engine.clone()));
    let listener = ControllerListener::bind(token_config(Some("s3cret"))).await.unwrap();
    let address = listener.local_addr().unwrap();

    let target_config = AttachConfig::connect(Address::localhost(address.port()))
        .with_access_token("guess");
    let (accepted, outcome) = tokio::join!(listener.accept(), host.attach(target_config));

    match accepted.unwrap_err() {
        ControllerError::Negotiation(e) => assert!(e.is_auth_failure()),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(
        outcome.unwrap_err(),
        NegotiationError::Rejected { .. }
    ));
    assert_eq!(host.state().sessions_bound(), 0);
    assert!(!host.is_client_connected());
    host.shutdown().await;
}

#[tokio::test]
async fn test_missing_token_creates_no_session() {
    let engine = running_engine();
    let host = TargetHost::new(Arc::new(engine.clone()));
    let listener = ControllerListener::bind(token_config(Some("s3cret"))).await.unwrap();
    let address = listener.local_addr().unwrap();

    let target_config = AttachConfig::connect(Address::localhost(address.port()));
    let (accepted, outcome) = tokio::join!(listener.accept(), host.attach(target_config));

    assert!(matches!(
        accepted.unwrap_err(),
        ControllerError::Negotiation(NegotiationError::MissingToken { .. })
    ));
    assert!(outcome.is_err());
    assert_eq!(host.state().sessions_bound(), 0);
    host.shutdown().await;
}

// ============================================================================
// Attach by pid
// ============================================================================

#[tokio::test]
async fn test_attach_by_pid_listen_mode() {
    let (host, injector, _engine) = injectable(4100);
    let config = token_config(None);

    let session = tokio::time::timeout(
        WAIT,
        attach_by_pid(&injector, ProcessId::new(4100), AttachMode::Listen, &config),
    )
    .await
    .unwrap()
    .unwrap();
    session.ping().await.unwrap();
    assert!(host.is_client_connected());

    session.disconnect(Some(true), false).await.unwrap();
    host.shutdown().await;
}

#[tokio::test]
async fn test_attach_by_pid_connect_mode_presents_token() {
    let (host, injector, _engine) = injectable(4200);
    let config = token_config(Some("t0ken"));

    let session = tokio::time::timeout(
        WAIT,
        attach_by_pid(&injector, ProcessId::new(4200), AttachMode::Connect, &config),
    )
    .await
    .unwrap()
    .unwrap();
    let threads = session.threads().await.unwrap();
    assert_eq!(threads.len(), 1);

    session.disconnect(Some(true), false).await.unwrap();
    host.shutdown().await;
}

#[tokio::test]
async fn test_attach_by_unknown_pid_fails_with_injection_error() {
    let (host, injector, _engine) = injectable(4300);
    let err = attach_by_pid(
        &injector,
        ProcessId::new(4301),
        AttachMode::Listen,
        &token_config(None),
    )
    .await
    .unwrap_err();

    match err {
        ControllerError::Injection(e @ InjectionError::ProcessNotFound { .. }) => {
            assert_eq!(e.pid(), ProcessId::new(4301));
            assert!(e.to_string().contains("4301"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    host.shutdown().await;
}

#[tokio::test]
async fn test_attach_without_exit_policy_leaves_target_untouched() {
    let (host, injector, _engine) = injectable(4500);
    let config = ControllerConfig {
        exit_on_disconnect: None,
        ..token_config(None)
    };

    let err = attach_by_pid(&injector, ProcessId::new(4500), AttachMode::Listen, &config)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Unset { option: "exit_on_disconnect" }
    ));
    assert_eq!(host.listening_address(), None);
    assert_eq!(host.state().sessions_bound(), 0);
    host.shutdown().await;
}

#[tokio::test]
async fn test_pid_as_integer_or_string_resolves_same_target() {
    let (host, injector, _engine) = injectable(4400);

    let as_int: RawAttachRequest = serde_json::from_str(
        r#"{"processId": 4400, "mode": "listen", "host": "127.0.0.1", "port": 0}"#,
    )
    .unwrap();
    let as_str: RawAttachRequest = serde_json::from_str(
        r#"{"processId": "4400", "mode": "listen", "host": "127.0.0.1", "port": 0}"#,
    )
    .unwrap();
    assert_eq!(as_int, as_str);

    let first = injector.install_request(as_int).await.unwrap();
    let second = injector.install_request(as_str).await.unwrap();
    assert_eq!(first.address(), second.address());
    assert_eq!(first.address(), host.listening_address());

    let address = first.address().unwrap();
    let config = ControllerConfig {
        port: address.port(),
        exit_on_disconnect: Some(false),
        ..ControllerConfig::default()
    };
    let session = connect_once(&config.address(), &config).await.unwrap();
    session.ping().await.unwrap();

    session.disconnect(Some(true), false).await.unwrap();
    host.shutdown().await;
}
