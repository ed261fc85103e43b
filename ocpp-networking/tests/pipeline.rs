//! End-to-end pipeline tests
//!
//! Frames go in through `Router::handle_text` (or `process_request`) on an
//! in-memory connection that records everything the router sends back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use ocpp_networking::node::{SignaturePolicy, SignedMessage};
use ocpp_networking::ocpp::actions::{Heartbeat, Reset};
use ocpp_networking::ocpp::types::{ResetRequest, ResetResponse, ResetStatus, ResetType, Signature};
use ocpp_networking::ocpp::Call;
use ocpp_networking::{
    Connection, ConnectionInfo, HandlerError, NetworkingMode, OcppRequest, RequestOutcome,
    ResponseResult, Router, SourceRouting, TransportError,
};

struct MockConnection {
    info: ConnectionInfo,
    frames: Mutex<Vec<String>>,
    broken: bool,
}

impl MockConnection {
    fn new(node: &str, mode: NetworkingMode) -> Arc<Self> {
        Arc::new(Self {
            info: ConnectionInfo::new(node, mode),
            frames: Mutex::new(Vec::new()),
            broken: false,
        })
    }

    fn broken(node: &str) -> Arc<Self> {
        Arc::new(Self {
            info: ConnectionInfo::new(node, NetworkingMode::Standard),
            frames: Mutex::new(Vec::new()),
            broken: true,
        })
    }

    fn frames(&self) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    async fn wait_for_frames(&self, count: usize) -> Vec<Value> {
        for _ in 0..400 {
            let frames = self.frames();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} frames, got {:?}", count, self.frames());
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.broken {
            return Err(TransportError::Closed);
        }
        self.frames.lock().push(text);
        Ok(())
    }
}

#[derive(Default)]
struct StubPolicy {
    reject_requests: Option<String>,
    reject_responses: Option<String>,
    sign_with: Option<Signature>,
    signing_fails: bool,
}

#[async_trait]
impl SignaturePolicy for StubPolicy {
    async fn verify_request_message(&self, _message: SignedMessage<'_>) -> Result<(), String> {
        match &self.reject_requests {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn verify_response_message(&self, _message: SignedMessage<'_>) -> Result<(), String> {
        match &self.reject_responses {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn sign_response_message(
        &self,
        _message: SignedMessage<'_>,
    ) -> Result<Vec<Signature>, String> {
        if self.signing_fails {
            return Err("HSM offline".to_string());
        }
        Ok(self.sign_with.iter().cloned().collect())
    }
}

fn station(policy: StubPolicy) -> Router {
    Router::builder("CS001")
        .with_default_actions()
        .signature_policy(Arc::new(policy))
        .build()
}

fn accept_resets(router: &Router, calls: Arc<AtomicUsize>) {
    router
        .on_request::<Reset, _, _>(move |_ctx, _request, _cancel| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(ResetResponse {
                    status: ResetStatus::Accepted,
                    status_info: None,
                })
            }
        })
        .unwrap();
}

fn reset_call(id: &str) -> Call {
    Call::new(id.into(), "Reset", json!({"type": "OnIdle"}))
}

fn reset_request() -> OcppRequest<Reset> {
    OcppRequest::<Reset>::new(
        SourceRouting::to("CS001"),
        ResetRequest {
            reset_type: ResetType::Immediate,
            evse_id: None,
        },
    )
}

// ============================================================================
// Inbound requests
// ============================================================================

#[tokio::test]
async fn test_answer_is_signed_and_addressed_back_along_the_path() {
    let router = station(StubPolicy {
        sign_with: Some(Signature::new("key-1", "c2lnbmF0dXJl")),
        ..Default::default()
    });
    accept_resets(&router, Arc::new(AtomicUsize::new(0)));

    let sent = Arc::new(Mutex::new(Vec::new()));
    let seen = sent.clone();
    router
        .events::<Reset>()
        .unwrap()
        .response_sent
        .subscribe(move |event| {
            let seen = seen.clone();
            async move {
                seen.lock()
                    .push((event.sent.result.is_success(), event.signing_error.clone()));
            }
        });

    let nn1 = MockConnection::new("NN1", NetworkingMode::OverlayNetwork);
    router
        .handle_text(
            nn1.clone(),
            r#"[2, "r1", "CS001", ["CSMS", "NN1"], "Reset", {"type": "OnIdle"}]"#,
            CancellationToken::new(),
        )
        .await;

    let frames = nn1.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(
        frames[0],
        json!([3, "r1", "CSMS", ["CS001"], {
            "status": "Accepted",
            "signatures": [{"keyId": "key-1", "value": "c2lnbmF0dXJl"}]
        }])
    );
    assert_eq!(*sent.lock(), vec![(true, None)]);
}

#[tokio::test]
async fn test_signing_failure_is_reported_but_response_still_sent() {
    let router = station(StubPolicy {
        signing_fails: true,
        ..Default::default()
    });
    accept_resets(&router, Arc::new(AtomicUsize::new(0)));

    let signing_errors = Arc::new(Mutex::new(Vec::new()));
    let seen = signing_errors.clone();
    router
        .events::<Reset>()
        .unwrap()
        .response_sent
        .subscribe(move |event| {
            let seen = seen.clone();
            async move {
                seen.lock().push(event.signing_error.clone());
            }
        });

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    router
        .handle_text(csms.clone(), r#"[2, "r1", "Reset", {"type": "OnIdle"}]"#, CancellationToken::new())
        .await;

    assert_eq!(csms.frames(), vec![json!([3, "r1", {"status": "Accepted"}])]);
    assert_eq!(*signing_errors.lock(), vec![Some("HSM offline".to_string())]);
}

#[tokio::test]
async fn test_bad_signature_never_reaches_handler() {
    let router = station(StubPolicy {
        reject_requests: Some("bad signature".to_string()),
        ..Default::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    accept_resets(&router, calls.clone());

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    router
        .events::<Reset>()
        .unwrap()
        .request_received
        .subscribe(move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    let outcome = router
        .process_request::<Reset>(csms.clone(), reset_call("r2"), CancellationToken::new())
        .await;
    let outcome = tokio_test::assert_ok!(outcome);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcome.response().unwrap().result,
        ResponseResult::SignatureError {
            reason: "bad signature".to_string()
        }
    );

    let frames = csms.frames();
    assert_eq!(frames[0][0], 4);
    assert_eq!(frames[0][2], "SecurityError");
    assert_eq!(frames[0][3], "bad signature");
}

#[tokio::test]
async fn test_missing_handler_falls_back_to_failed() {
    let router = station(StubPolicy::default());
    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);

    let outcome = router
        .process_request::<Heartbeat>(
            csms.clone(),
            Call::new("abc-1".into(), "Heartbeat", json!({})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    match &outcome.response().unwrap().result {
        ResponseResult::Failed { reason } => assert!(reason.contains("No handler")),
        other => panic!("unexpected result {:?}", other),
    }

    // Plain CALLRESULT with a structurally valid payload
    let frames = csms.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], 3);
    assert_eq!(frames[0][1], "abc-1");
    assert!(frames[0][2]["currentTime"].is_string());
}

#[tokio::test]
async fn test_missing_mandatory_field_is_format_violation() {
    let router = station(StubPolicy::default());
    let calls = Arc::new(AtomicUsize::new(0));
    accept_resets(&router, calls.clone());

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    let outcome = router
        .process_request::<Reset>(
            csms.clone(),
            Call::new("r3".into(), "Reset", json!({"evseId": 1})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    match &outcome {
        RequestOutcome::CouldNotParse { error, json, .. } => {
            assert!(error.contains("type"), "{}", error);
            assert_eq!(json, &json!({"evseId": 1}));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let frames = csms.frames();
    assert_eq!(frames[0][0], 4);
    assert_eq!(frames[0][2], "FormatViolation");
    assert_eq!(frames[0][4]["action"], "Reset");
    assert_eq!(frames[0][4]["json"], json!({"evseId": 1}));
    assert_eq!(
        frames[0][4]["eventTrackingId"],
        outcome.event_tracking_id().as_str()
    );
}

#[tokio::test]
async fn test_handler_error_becomes_internal_error() {
    let router = station(StubPolicy::default());
    router
        .on_request::<Reset, _, _>(|_ctx, _request, _cancel| async move {
            Err::<ResetResponse, HandlerError>("relay stuck".into())
        })
        .unwrap();

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    let outcome = router
        .process_request::<Reset>(csms.clone(), reset_call("r4"), CancellationToken::new())
        .await
        .unwrap();

    let tracking_id = match &outcome {
        RequestOutcome::ExceptionOccurred {
            error,
            event_tracking_id,
            request_id,
            ..
        } => {
            assert_eq!(error, "relay stuck");
            assert_eq!(request_id.as_str(), "r4");
            event_tracking_id.as_str().to_string()
        }
        other => panic!("unexpected outcome {:?}", other),
    };

    let frames = csms.frames();
    assert_eq!(frames[0][2], "InternalError");
    assert_eq!(frames[0][3], "relay stuck");
    assert_eq!(frames[0][4]["eventTrackingId"], tracking_id.as_str());
    assert!(frames[0][4]["requestTimestamp"].is_string());
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let router = station(StubPolicy::default());
    router
        .on_request::<Reset, _, _>(|_ctx, _request, _cancel| async move {
            if true {
                panic!("firmware exploded");
            }
            Ok::<ResetResponse, HandlerError>(ResetResponse {
                status: ResetStatus::Accepted,
                status_info: None,
            })
        })
        .unwrap();

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    let outcome = router
        .process_request::<Reset>(csms.clone(), reset_call("r5"), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        RequestOutcome::ExceptionOccurred { ref error, .. } if error.contains("firmware exploded")
    ));
    assert_eq!(csms.frames()[0][2], "InternalError");
}

#[tokio::test]
async fn test_cancelled_handler_still_answers() {
    let router = station(StubPolicy::default());
    router
        .on_request::<Reset, _, _>(|_ctx, _request, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Ok::<_, HandlerError>(ResetResponse {
                status: ResetStatus::Accepted,
                status_info: None,
            })
        })
        .unwrap();

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    let cancel = CancellationToken::new();
    let task = {
        let router = router.clone();
        let csms = csms.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            router
                .process_request::<Reset>(csms, reset_call("r6"), cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let outcome = task.await.unwrap().unwrap();

    match &outcome.response().unwrap().result {
        ResponseResult::Failed { reason } => assert_eq!(reason, "Request cancelled"),
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_action_is_not_implemented() {
    let router = station(StubPolicy::default());
    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);

    router
        .handle_text(csms.clone(), r#"[2, "u1", "FlyToTheMoon", {}]"#, CancellationToken::new())
        .await;

    let frames = csms.frames();
    assert_eq!(frames[0][0], 4);
    assert_eq!(frames[0][2], "NotImplemented");
}

// ============================================================================
// Requests initiated by this node
// ============================================================================

fn csms_router(policy: StubPolicy) -> (Router, Arc<MockConnection>) {
    let router = Router::builder("CSMS")
        .with_default_actions()
        .signature_policy(Arc::new(policy))
        .build();
    let station = MockConnection::new("CS001", NetworkingMode::Standard);
    router.register_connection(station.clone());
    (router, station)
}

#[tokio::test]
async fn test_send_request_runtime_matches_timestamps() {
    let (router, station) = csms_router(StubPolicy::default());

    let task = {
        let router = router.clone();
        tokio::spawn(async move { router.send_request(reset_request(), &CancellationToken::new()).await })
    };

    let frames = station.wait_for_frames(1).await;
    assert_eq!(frames[0][0], 2);
    assert_eq!(frames[0][2], "Reset");
    let id = frames[0][1].as_str().unwrap().to_string();

    router
        .handle_text(
            station.clone(),
            &json!([3, id, {"status": "Scheduled"}]).to_string(),
            CancellationToken::new(),
        )
        .await;

    let response = task.await.unwrap();
    assert_eq!(
        response.result.payload().map(|p| p.status),
        Some(ResetStatus::Scheduled)
    );
    let request = response.request().unwrap();
    assert_eq!(
        response.runtime,
        Some(response.response_timestamp - request.request_timestamp)
    );
}

#[tokio::test]
async fn test_malformed_response_is_formation_violation() {
    let (router, station) = csms_router(StubPolicy::default());

    let observed = Arc::new(Mutex::new(Vec::new()));
    let seen = observed.clone();
    router
        .events::<Reset>()
        .unwrap()
        .response_received
        .subscribe(move |event| {
            let seen = seen.clone();
            async move {
                seen.lock()
                    .push((event.response.result.kind(), event.request.is_some()));
            }
        });

    let task = {
        let router = router.clone();
        tokio::spawn(async move { router.send_request(reset_request(), &CancellationToken::new()).await })
    };

    let frames = station.wait_for_frames(1).await;
    let id = frames[0][1].as_str().unwrap().to_string();
    router
        .handle_text(
            station.clone(),
            &json!([3, id, {"statusInfo": {"reasonCode": "x"}}]).to_string(),
            CancellationToken::new(),
        )
        .await;

    let response = task.await.unwrap();
    match &response.result {
        ResponseResult::FormationViolation { reason } => assert!(reason.contains("status")),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(response.request().unwrap().request_id.as_str(), id);
    assert_eq!(*observed.lock(), vec![("FormationViolation", true)]);
}

#[tokio::test]
async fn test_rejected_response_signature() {
    let (router, station) = csms_router(StubPolicy {
        reject_responses: Some("unknown key".to_string()),
        ..Default::default()
    });

    let task = {
        let router = router.clone();
        tokio::spawn(async move { router.send_request(reset_request(), &CancellationToken::new()).await })
    };

    let frames = station.wait_for_frames(1).await;
    let id = frames[0][1].as_str().unwrap().to_string();
    router
        .handle_text(
            station.clone(),
            &json!([3, id, {"status": "Accepted"}]).to_string(),
            CancellationToken::new(),
        )
        .await;

    let response = task.await.unwrap();
    assert_eq!(
        response.result,
        ResponseResult::SignatureError {
            reason: "unknown key".to_string()
        }
    );
}

#[tokio::test]
async fn test_call_error_becomes_request_error() {
    let (router, station) = csms_router(StubPolicy::default());

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    router
        .events::<Reset>()
        .unwrap()
        .request_error_received
        .subscribe(move |event| {
            let counter = counter.clone();
            async move {
                assert!(event.request.is_some());
                assert!(event.runtime.is_some());
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

    let task = {
        let router = router.clone();
        tokio::spawn(async move { router.send_request(reset_request(), &CancellationToken::new()).await })
    };

    let frames = station.wait_for_frames(1).await;
    let id = frames[0][1].as_str().unwrap().to_string();
    router
        .handle_text(
            station.clone(),
            &json!([4, id, "NotSupported", "Reset not supported", {"hint": 1}]).to_string(),
            CancellationToken::new(),
        )
        .await;

    let response = task.await.unwrap();
    match &response.result {
        ResponseResult::RequestError {
            error_code,
            description,
            details,
        } => {
            assert_eq!(error_code.to_string(), "NotSupported");
            assert_eq!(description, "Reset not supported");
            assert_eq!(details, &json!({"hint": 1}));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_request_failures_are_failed_responses() {
    let (router, _station) = csms_router(StubPolicy::default());

    // No route
    let request = OcppRequest::<Reset>::new(
        SourceRouting::to("CS404"),
        ResetRequest {
            reset_type: ResetType::OnIdle,
            evse_id: None,
        },
    );
    let response = router.send_request(request, &CancellationToken::new()).await;
    assert_eq!(response.result.kind(), "Failed");

    // Timeout
    let request = reset_request().with_timeout(Duration::from_millis(30));
    let response = router.send_request(request, &CancellationToken::new()).await;
    match &response.result {
        ResponseResult::Failed { reason } => assert!(reason.contains("within"), "{}", reason),
        other => panic!("unexpected result {:?}", other),
    }

    // Send failure
    router.register_connection(MockConnection::broken("CS002"));
    let request = OcppRequest::<Reset>::new(
        SourceRouting::to("CS002"),
        ResetRequest {
            reset_type: ResetType::OnIdle,
            evse_id: None,
        },
    );
    let response = router.send_request(request, &CancellationToken::new()).await;
    match &response.result {
        ResponseResult::Failed { reason } => assert!(reason.contains("Could not send"), "{}", reason),
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_outstanding_id_is_rejected() {
    let (router, station) = csms_router(StubPolicy::default());

    let first = {
        let router = router.clone();
        tokio::spawn(async move {
            let request = reset_request().with_request_id("dup-1".into());
            router.send_request(request, &CancellationToken::new()).await
        })
    };
    station.wait_for_frames(1).await;

    let second = router
        .send_request(
            reset_request().with_request_id("dup-1".into()),
            &CancellationToken::new(),
        )
        .await;
    match &second.result {
        ResponseResult::Failed { reason } => assert!(reason.contains("dup-1")),
        other => panic!("unexpected result {:?}", other),
    }

    router
        .handle_text(
            station.clone(),
            r#"[3, "dup-1", {"status": "Accepted"}]"#,
            CancellationToken::new(),
        )
        .await;
    assert!(first.await.unwrap().result.is_success());
}

// ============================================================================
// Response errors
// ============================================================================

#[tokio::test]
async fn test_orphan_response_error_has_no_runtime() {
    let router = station(StubPolicy::default());

    let runtimes = Arc::new(Mutex::new(Vec::new()));
    let seen = runtimes.clone();
    router.unmatched_response_errors().subscribe(move |event| {
        let seen = seen.clone();
        async move {
            seen.lock().push(event.runtime);
        }
    });

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    router
        .handle_text(
            csms.clone(),
            r#"[5, "never-seen", "FormatViolation", "bad response", {}]"#,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(*runtimes.lock(), vec![None]);
    assert!(csms.frames().is_empty());
}

#[tokio::test]
async fn test_response_error_reaches_answering_action() {
    let router = station(StubPolicy::default());
    accept_resets(&router, Arc::new(AtomicUsize::new(0)));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let seen = observed.clone();
    router
        .events::<Reset>()
        .unwrap()
        .response_error_received
        .subscribe(move |event| {
            let seen = seen.clone();
            async move {
                seen.lock().push((
                    event.request.as_ref().map(|r| r.request_id.to_string()),
                    event.runtime.is_some(),
                    event.error.error_description.clone(),
                ));
            }
        });

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    router
        .handle_text(csms.clone(), r#"[2, "r7", "Reset", {"type": "OnIdle"}]"#, CancellationToken::new())
        .await;
    router
        .handle_text(
            csms.clone(),
            r#"[5, "r7", "PropertyConstraintViolation", "status not allowed", {}]"#,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        *observed.lock(),
        vec![(Some("r7".to_string()), true, "status not allowed".to_string())]
    );
}

// ============================================================================
// Forwarding
// ============================================================================

fn networking_node() -> (Router, Arc<MockConnection>, Arc<MockConnection>) {
    let router = Router::builder("NN1")
        .with_default_actions()
        .networking_mode(NetworkingMode::OverlayNetwork)
        .build();
    let csms = MockConnection::new("CSMS", NetworkingMode::OverlayNetwork);
    let station = MockConnection::new("CS001", NetworkingMode::Standard);
    router.register_connection(csms.clone());
    router.register_connection(station.clone());
    (router, csms, station)
}

#[tokio::test]
async fn test_forward_and_relay_reply() {
    let (router, csms, station) = networking_node();

    router
        .handle_text(
            csms.clone(),
            r#"[2, "f1", "CS001", ["CSMS"], "Reset", {"type": "Immediate"}]"#,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(
        station.frames(),
        vec![json!([2, "f1", "Reset", {"type": "Immediate"}])]
    );

    router
        .handle_text(
            station.clone(),
            r#"[3, "f1", {"status": "Accepted"}]"#,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(
        csms.frames(),
        vec![json!([3, "f1", "CSMS", ["CS001", "NN1"], {"status": "Accepted"}])]
    );
}

#[tokio::test]
async fn test_routing_loop_is_protocol_error() {
    let (router, csms, station) = networking_node();

    router
        .handle_text(
            csms.clone(),
            r#"[2, "f2", "CS001", ["CSMS", "NN1"], "Reset", {"type": "Immediate"}]"#,
            CancellationToken::new(),
        )
        .await;

    assert!(station.frames().is_empty());
    let frames = csms.frames();
    assert_eq!(frames[0][0], 4);
    assert_eq!(frames[0][2], "CSMS");
    assert_eq!(frames[0][4], "ProtocolError");
}

#[tokio::test]
async fn test_unknown_destination_is_generic_error() {
    let (router, csms, _station) = networking_node();

    router
        .handle_text(
            csms.clone(),
            r#"[2, "f3", "CS999", ["CSMS"], "Reset", {"type": "Immediate"}]"#,
            CancellationToken::new(),
        )
        .await;

    let frames = csms.frames();
    assert_eq!(frames[0][0], 4);
    assert_eq!(frames[0][4], "GenericError");
    assert!(frames[0][5].as_str().unwrap().contains("CS999"));
}

#[tokio::test]
async fn test_same_id_from_two_stations_is_forwarded_twice() {
    let router = Router::builder("NN1")
        .with_default_actions()
        .networking_mode(NetworkingMode::OverlayNetwork)
        .build();
    let csms = MockConnection::new("CSMS", NetworkingMode::OverlayNetwork);
    let cs001 = MockConnection::new("CS001", NetworkingMode::OverlayNetwork);
    let cs002 = MockConnection::new("CS002", NetworkingMode::OverlayNetwork);
    router.register_connection(csms.clone());
    router.register_connection(cs001.clone());
    router.register_connection(cs002.clone());

    router
        .handle_text(
            cs001.clone(),
            r#"[2, "1", "CSMS", ["CS001"], "Heartbeat", {}]"#,
            CancellationToken::new(),
        )
        .await;
    router
        .handle_text(
            cs002.clone(),
            r#"[2, "1", "CSMS", ["CS002"], "Heartbeat", {}]"#,
            CancellationToken::new(),
        )
        .await;

    assert!(cs002.frames().is_empty());
    assert_eq!(
        csms.frames(),
        vec![
            json!([2, "1", "CSMS", ["CS001", "NN1"], "Heartbeat", {}]),
            json!([2, "1", "CSMS", ["CS002", "NN1"], "Heartbeat", {}]),
        ]
    );

    // Each answer finds its way back to the station it addresses
    router
        .handle_text(
            csms.clone(),
            r#"[3, "1", "CS002", ["CSMS"], {"currentTime": "2025-01-01T12:00:00Z"}]"#,
            CancellationToken::new(),
        )
        .await;
    router
        .handle_text(
            csms.clone(),
            r#"[3, "1", "CS001", ["CSMS"], {"currentTime": "2025-01-01T12:00:01Z"}]"#,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        cs002.frames(),
        vec![json!([3, "1", "CS002", ["CSMS", "NN1"], {"currentTime": "2025-01-01T12:00:00Z"}])]
    );
    assert_eq!(
        cs001.frames(),
        vec![json!([3, "1", "CS001", ["CSMS", "NN1"], {"currentTime": "2025-01-01T12:00:01Z"}])]
    );
}

#[tokio::test]
async fn test_reply_from_another_link_does_not_resolve_request() {
    let (router, station) = csms_router(StubPolicy::default());
    let other = MockConnection::new("CS002", NetworkingMode::Standard);
    router.register_connection(other.clone());

    let task = {
        let router = router.clone();
        tokio::spawn(async move {
            let request = reset_request().with_request_id("x-1".into());
            router.send_request(request, &CancellationToken::new()).await
        })
    };
    station.wait_for_frames(1).await;

    router
        .handle_text(
            other.clone(),
            r#"[3, "x-1", {"status": "Accepted"}]"#,
            CancellationToken::new(),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!task.is_finished());
    assert!(other.frames().is_empty());

    router
        .handle_text(
            station.clone(),
            r#"[3, "x-1", {"status": "Rejected"}]"#,
            CancellationToken::new(),
        )
        .await;

    let response = task.await.unwrap();
    assert_eq!(
        response.result.payload().map(|p| p.status),
        Some(ResetStatus::Rejected)
    );
}

#[tokio::test]
async fn test_response_error_from_another_link_is_unmatched() {
    let router = station(StubPolicy::default());
    accept_resets(&router, Arc::new(AtomicUsize::new(0)));

    let matched = Arc::new(AtomicUsize::new(0));
    let counter = matched.clone();
    router
        .events::<Reset>()
        .unwrap()
        .response_error_received
        .subscribe(move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

    let unmatched = Arc::new(Mutex::new(Vec::new()));
    let seen = unmatched.clone();
    router.unmatched_response_errors().subscribe(move |event| {
        let seen = seen.clone();
        async move {
            seen.lock().push((event.connection.remote_node.to_string(), event.runtime));
        }
    });

    let csms = MockConnection::new("CSMS", NetworkingMode::Standard);
    let lc = MockConnection::new("LC1", NetworkingMode::Standard);
    router
        .handle_text(csms.clone(), r#"[2, "1", "Reset", {"type": "OnIdle"}]"#, CancellationToken::new())
        .await;
    router
        .handle_text(
            lc.clone(),
            r#"[5, "1", "FormatViolation", "not ours", {}]"#,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(matched.load(Ordering::SeqCst), 0);
    assert_eq!(*unmatched.lock(), vec![("LC1".to_string(), None)]);

    // The exchange is still there for its own link
    router
        .handle_text(
            csms.clone(),
            r#"[5, "1", "FormatViolation", "ours", {}]"#,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(matched.load(Ordering::SeqCst), 1);
}
