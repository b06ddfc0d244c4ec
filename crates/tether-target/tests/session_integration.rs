//! Integration tests for target-side sessions over real TCP.
//!
//! A bare protocol-level controller drives a `TargetHost` backed by the
//! simulated engine, so these tests see exactly what goes over the wire.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpStream;

use tether_core::{Address, AttachConfig, AttachPhase, SessionOptions, SourceLocation, StopEvent, StopReason};
use tether_protocol::handshake::{self, Greeting, Handshake, HandshakeTransport};
use tether_protocol::{
    Command, ControllerMessage, ControllerTransport, ErrorCode, Inbound, NegotiationError,
    Response, ResponseBody, TargetEvent, TargetMessage, Transport, TransportRole,
};
use tether_target::sim::TERMINATED_EXIT_CODE;
use tether_target::{ExecutionEngine, SimulatedEngine, Statement, TargetHost, ThreadScript};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for any single wait in these tests
const WAIT: Duration = Duration::from_secs(5);

/// Listen-mode attach must return within this
const BIND_BOUND: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

fn looping_program(engine: &SimulatedEngine) {
    engine.spawn(
        ThreadScript::new("main", "loop.rs")
            .body(vec![
                Statement::print(1, "tick"),
                Statement::sleep(2, Duration::from_millis(2)),
                Statement::nop(3),
            ])
            .forever(),
    );
}

async fn listening_host(engine: &SimulatedEngine) -> (TargetHost, SocketAddr) {
    let host = TargetHost::new(Arc::new(engine.clone()));
    let outcome = tokio::time::timeout(
        BIND_BOUND,
        host.attach(AttachConfig::listen(Address::localhost(0))),
    )
    .await
    .expect("listen attach blocked")
    .expect("listen attach failed");
    let address = outcome.address().expect("listen mode reports an address");
    (host, address)
}

async fn handshake_transport(address: SocketAddr) -> HandshakeTransport {
    let stream = TcpStream::connect(address).await.unwrap();
    Transport::new(stream, TransportRole::Connector).unwrap()
}

async fn raw_controller(address: SocketAddr, exit_on_disconnect: bool) -> ControllerTransport {
    let mut transport = handshake_transport(address).await;
    handshake::initiate(
        &mut transport,
        Greeting::controller(SessionOptions::new(exit_on_disconnect)),
        WAIT,
    )
    .await
    .unwrap();
    transport.retype()
}

async fn next_message(transport: &mut ControllerTransport) -> TargetMessage {
    match transport.recv_timeout(WAIT).await {
        Ok(Some(Ok(Inbound::Message(msg)))) => msg,
        other => panic!("expected a target message, got {other:?}"),
    }
}

/// Sends a command and returns its response, skipping events.
async fn request(transport: &mut ControllerTransport, seq: u64, command: Command) -> Response {
    transport
        .send(ControllerMessage::new(seq, command))
        .await
        .unwrap();
    loop {
        if let TargetMessage::Response(resp) = next_message(transport).await {
            assert_eq!(resp.request_seq, seq);
            return resp;
        }
    }
}

async fn next_stop(transport: &mut ControllerTransport) -> StopEvent {
    loop {
        if let TargetMessage::Event(TargetEvent::Stopped(stop)) = next_message(transport).await {
            return stop;
        }
    }
}

async fn wait_until_detached(host: &TargetHost) {
    tokio::time::timeout(WAIT, async {
        while host.is_client_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never detached");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_listen_mode_binds_and_accepts() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    assert!(!host.is_client_connected());
    let mut controller = raw_controller(address, false).await;
    assert!(host.wait_for_client(Some(WAIT)).await);

    let resp = request(&mut controller, 1, Command::Ping).await;
    assert!(resp.success);
    assert_eq!(resp.body, Some(ResponseBody::Pong));

    host.shutdown().await;
    engine.terminate().await.unwrap();
}

#[tokio::test]
async fn test_second_controller_rejected_while_session_active() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    let mut first = raw_controller(address, false).await;
    assert!(host.wait_for_client(Some(WAIT)).await);

    let mut second = handshake_transport(address).await;
    let err = handshake::initiate(
        &mut second,
        Greeting::controller(SessionOptions::new(false)),
        WAIT,
    )
    .await
    .unwrap_err();
    match err {
        NegotiationError::SessionBusy { .. } => {}
        other => panic!("unexpected error {other:?}"),
    }

    // The first session is unaffected.
    assert!(request(&mut first, 1, Command::Ping).await.success);
    assert_eq!(host.state().sessions_bound(), 1);

    host.shutdown().await;
    engine.terminate().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_handshakes_welcome_exactly_one() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    let mut first = handshake_transport(address).await;
    let mut second = handshake_transport(address).await;
    let (a, b) = tokio::join!(
        handshake::initiate(&mut first, Greeting::controller(SessionOptions::new(false)), WAIT),
        handshake::initiate(&mut second, Greeting::controller(SessionOptions::new(false)), WAIT),
    );

    let (welcomed, refused) = match (a, b) {
        (Ok(_), Err(e)) => (first, e),
        (Err(e), Ok(_)) => (second, e),
        other => panic!("expected one welcome and one refusal, got {other:?}"),
    };
    assert!(matches!(refused, NegotiationError::SessionBusy { .. }));

    // The welcomed controller really holds the session.
    let mut welcomed: ControllerTransport = welcomed.retype();
    assert!(request(&mut welcomed, 1, Command::Ping).await.success);
    assert_eq!(host.state().sessions_bound(), 1);

    host.shutdown().await;
    engine.terminate().await.unwrap();
}

#[tokio::test]
async fn test_silent_connector_does_not_hold_up_other_controllers() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    // Connects but never says hello.
    let _silent = TcpStream::connect(address).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut controller = tokio::time::timeout(Duration::from_secs(2), raw_controller(address, false))
        .await
        .expect("handshake waited behind a silent connector");
    assert!(request(&mut controller, 1, Command::Ping).await.success);

    host.shutdown().await;
    engine.terminate().await.unwrap();
}

#[tokio::test]
async fn test_controller_must_state_exit_on_disconnect() {
    let engine = SimulatedEngine::new();
    let (host, address) = listening_host(&engine).await;

    // No session options at all: rejected with a reason.
    let transport = handshake_transport(address).await;
    let mut raw: Transport<Handshake, serde_json::Value> = transport.retype();
    raw.send(json!({
        "type": "hello",
        "protocol_version": {"major": 1, "minor": 0},
        "role": "controller",
        "capabilities": []
    }))
    .await
    .unwrap();
    match raw.recv_timeout(WAIT).await {
        Ok(Some(Ok(Inbound::Message(Handshake::Rejected { reason, .. })))) => {
            assert!(reason.contains("exit_on_disconnect"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Options present but without the flag: the hello does not decode.
    let transport = handshake_transport(address).await;
    let mut raw: Transport<Handshake, serde_json::Value> = transport.retype();
    raw.send(json!({
        "type": "hello",
        "protocol_version": {"major": 1, "minor": 0},
        "role": "controller",
        "session": {}
    }))
    .await
    .unwrap();
    match raw.recv_timeout(WAIT).await {
        Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("expected the connection to close, got {other:?}"),
    }

    assert_eq!(host.state().sessions_bound(), 0);
    host.shutdown().await;
}

#[tokio::test]
async fn test_malformed_command_does_not_end_session() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    let controller = raw_controller(address, false).await;
    let mut raw: Transport<TargetMessage, serde_json::Value> = controller.retype();
    raw.send(json!({"seq": 9, "command": "fly_away"})).await.unwrap();

    let resp = loop {
        match raw.recv_timeout(WAIT).await {
            Ok(Some(Ok(Inbound::Message(TargetMessage::Response(resp))))) => break resp,
            Ok(Some(Ok(Inbound::Message(_)))) => continue,
            other => panic!("expected a response, got {other:?}"),
        }
    };
    assert_eq!(resp.request_seq, 9);
    assert!(!resp.success);
    assert_eq!(resp.error_code, Some(ErrorCode::Malformed));

    let mut controller: ControllerTransport = raw.retype();
    let resp = request(&mut controller, 10, Command::Ping).await;
    assert!(resp.success);

    host.shutdown().await;
    engine.terminate().await.unwrap();
}

#[tokio::test]
async fn test_transport_loss_resumes_and_rearms() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    let mut controller = raw_controller(address, false).await;
    let add = Command::AddBreakpoint {
        location: SourceLocation::new("elsewhere.rs", 40),
    };
    assert!(request(&mut controller, 1, add).await.success);
    assert!(request(&mut controller, 2, Command::Pause { thread_id: None }).await.success);
    let stop = next_stop(&mut controller).await;
    assert_eq!(stop.reason, StopReason::Pause);

    drop(controller);
    wait_until_detached(&host).await;

    assert_eq!(host.state().phase(), AttachPhase::Hooked);
    assert!(engine.current_stop().await.is_none());
    assert!(engine
        .breakpoints()
        .await
        .contains(&SourceLocation::new("elsewhere.rs", 40)));

    // A new controller binds and sees the surviving breakpoint.
    let mut next = raw_controller(address, false).await;
    let resp = request(&mut next, 1, Command::ListBreakpoints).await;
    assert_eq!(
        resp.body,
        Some(ResponseBody::Breakpoints {
            breakpoints: vec![SourceLocation::new("elsewhere.rs", 40)]
        })
    );
    assert_eq!(host.state().sessions_bound(), 2);

    host.shutdown().await;
    engine.terminate().await.unwrap();
}

#[tokio::test]
async fn test_exit_on_disconnect_terminates_target() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    let controller = raw_controller(address, true).await;
    assert!(host.wait_for_client(Some(WAIT)).await);
    drop(controller);

    assert_eq!(engine.wait_for_exit(WAIT).await, Some(TERMINATED_EXIT_CODE));
    tokio::time::timeout(WAIT, host.state().terminated().cancelled())
        .await
        .expect("attach state never terminated");
    assert_eq!(host.state().phase(), AttachPhase::Terminated);
}

#[tokio::test]
async fn test_wrong_state_command_is_rejected() {
    let engine = SimulatedEngine::new();
    looping_program(&engine);
    let (host, address) = listening_host(&engine).await;

    let mut controller = raw_controller(address, false).await;
    let resp = request(&mut controller, 4, Command::Continue).await;
    assert!(!resp.success);
    assert_eq!(resp.error_code, Some(ErrorCode::WrongState));
    assert_eq!(resp.command, "continue");

    host.shutdown().await;
    engine.terminate().await.unwrap();
}
