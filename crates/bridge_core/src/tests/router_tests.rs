use super::*;
use crate::engine::Invite;
use crate::test_harness::{world, world_with, TestChannel, TestEngine, TestIdentity, TestStore};
use shared::domain::PeerId;

fn envelope(seq: u64, request: BridgeRequest) -> RequestEnvelope {
    RequestEnvelope { seq, request }
}

fn expect_payload(response: &ResponseEnvelope) -> &ResponsePayload {
    match &response.response {
        BridgeResponse::Ok { payload } => payload,
        BridgeResponse::Error { error } => panic!("unexpected error response: {error:?}"),
    }
}

fn expect_error(response: &ResponseEnvelope) -> &ResponseError {
    match &response.response {
        BridgeResponse::Error { error } => error,
        BridgeResponse::Ok { payload } => panic!("unexpected ok response: {payload:?}"),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

#[tokio::test]
async fn gated_operations_are_rejected_before_init() {
    let world = world();
    let response = world
        .bridge
        .handle(envelope(41, BridgeRequest::GetChannels))
        .await;
    assert_eq!(response.seq, 41);
    assert_eq!(expect_error(&response).code, ErrorCode::NotReady);
}

#[tokio::test]
async fn status_works_before_init() {
    let world = world();
    let response = world
        .bridge
        .handle(envelope(1, BridgeRequest::GetStatus))
        .await;
    match expect_payload(&response) {
        ResponsePayload::Status(status) => assert!(!status.ready),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn init_starts_loops_joins_swarm_and_sets_ready() {
    let engine = TestEngine::new();
    let world = world_with(engine, TestStore::new());
    let channel = TestChannel::new("general", b"key-a");
    channel.set_counts(4, 1).await;
    world.engine.add_channel(Arc::clone(&channel)).await;

    let response = world.bridge.handle(envelope(2, BridgeRequest::Init)).await;
    assert!(matches!(expect_payload(&response), ResponsePayload::Done));
    assert!(world.bridge.is_ready());
    assert!(world.bridge.channel_updates.is_watching(&channel.id()).await);
    assert!(world.swarm.joined.lock().await.contains(&channel.id()));
    assert_eq!(world.sink.latest().await, Some(3));
    assert_eq!(*world.store.ops.lock().await, vec!["open"]);

    // Second init is a quiet no-op.
    let again = world.bridge.handle(envelope(3, BridgeRequest::Init)).await;
    assert!(matches!(expect_payload(&again), ResponsePayload::Done));
}

#[tokio::test]
async fn init_failure_is_fatal_and_leaves_bridge_not_ready() {
    let world = world_with(TestEngine::new(), TestStore::failing_open());
    let response = world.bridge.handle(envelope(4, BridgeRequest::Init)).await;
    assert_eq!(expect_error(&response).code, ErrorCode::Fatal);
    assert!(!world.bridge.is_ready());

    let world = world_with(
        TestEngine::failing_bootstrap("chain store corrupt"),
        TestStore::new(),
    );
    let response = world.bridge.handle(envelope(5, BridgeRequest::Init)).await;
    let error = expect_error(&response);
    assert_eq!(error.code, ErrorCode::Fatal);
    assert!(error.message.contains("bootstrap"));
}

#[tokio::test]
async fn erase_is_pre_init_only() {
    let world = world();
    let response = world.bridge.handle(envelope(6, BridgeRequest::Erase)).await;
    assert!(matches!(expect_payload(&response), ResponsePayload::Done));
    assert!(world.store.ops.lock().await.contains(&"clear"));

    world.bridge.handle(envelope(7, BridgeRequest::Init)).await;
    let refused = world.bridge.handle(envelope(8, BridgeRequest::Erase)).await;
    assert_eq!(expect_error(&refused).code, ErrorCode::Fatal);
}

#[tokio::test]
async fn unknown_channel_is_not_found() {
    let world = world();
    world.bridge.handle(envelope(9, BridgeRequest::Init)).await;
    let response = world
        .bridge
        .handle(envelope(
            10,
            BridgeRequest::GetMessageCount {
                channel_id: ChannelId::from("deadbeef"),
            },
        ))
        .await;
    assert_eq!(expect_error(&response).code, ErrorCode::NotFound);
}

#[tokio::test]
async fn post_message_returns_the_record_and_refreshes_the_badge() {
    let world = world();
    let identity = TestIdentity::new("alice", b"alice-key");
    let channel = TestChannel::new("general", b"key-a");
    world.engine.add_identity(Arc::clone(&identity)).await;
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(11, BridgeRequest::Init)).await;

    let response = world
        .bridge
        .handle(envelope(
            12,
            BridgeRequest::PostMessage {
                channel_id: channel.id(),
                identity_key: identity.key_string.clone(),
                text: "hello there".to_string(),
            },
        ))
        .await;
    match expect_payload(&response) {
        ResponsePayload::Message(message) => {
            assert_eq!(message.body["text"], "hello there");
            assert_eq!(message.height, 1);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    assert_eq!(world.sink.latest().await, Some(1));
}

#[tokio::test]
async fn malformed_invite_request_is_an_encoding_error() {
    let world = world();
    let identity = TestIdentity::new("alice", b"alice-key");
    let channel = TestChannel::new("general", b"key-a");
    world.engine.add_identity(Arc::clone(&identity)).await;
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(13, BridgeRequest::Init)).await;

    let response = world
        .bridge
        .handle(envelope(
            14,
            BridgeRequest::Invite {
                channel_id: channel.id(),
                identity_key: identity.key_string.clone(),
                encoded_request: "!!not-base64!!".to_string(),
            },
        ))
        .await;
    assert_eq!(expect_error(&response).code, ErrorCode::InvalidEncoding);
}

#[tokio::test]
async fn accept_invite_issues_and_hands_to_the_swarm() {
    let world = world();
    let identity = TestIdentity::new("alice", b"alice-key");
    let channel = TestChannel::new("general", b"key-a");
    world.engine.add_identity(Arc::clone(&identity)).await;
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(15, BridgeRequest::Init)).await;

    let encoded_request = crate::serialize::encode_blob(b"joiner-request");
    let response = world
        .bridge
        .handle(envelope(
            16,
            BridgeRequest::AcceptInvite {
                channel_id: channel.id(),
                identity_key: identity.key_string.clone(),
                encoded_request,
            },
        ))
        .await;
    assert!(matches!(expect_payload(&response), ResponsePayload::Done));

    let sent = world.swarm.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, PeerId::from("peer:joiner-request"));
}

#[tokio::test]
async fn wait_for_incoming_message_round_trip() {
    let world = world();
    let channel = TestChannel::new("general", b"key-a");
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(17, BridgeRequest::Init)).await;

    let waiter = {
        let bridge = Arc::clone(&world.bridge);
        let channel_id = channel.id();
        tokio::spawn(async move {
            bridge
                .handle(envelope(
                    18,
                    BridgeRequest::WaitForIncomingMessage {
                        channel_id,
                        timeout_ms: Some(500),
                    },
                ))
                .await
        })
    };
    settle().await;
    channel.deliver();

    let response = waiter.await.expect("join");
    assert_eq!(response.seq, 18);
    assert!(matches!(
        expect_payload(&response),
        ResponsePayload::Updated(true)
    ));

    // The delivery also left the level-triggered flag set for the next poll.
    let flagged = world
        .bridge
        .handle(envelope(
            19,
            BridgeRequest::WaitForIncomingMessage {
                channel_id: channel.id(),
                timeout_ms: Some(1),
            },
        ))
        .await;
    assert!(matches!(
        expect_payload(&flagged),
        ResponsePayload::Updated(true)
    ));

    // With no pending update the caller's own deadline applies.
    let timed_out = world
        .bridge
        .handle(envelope(
            20,
            BridgeRequest::WaitForIncomingMessage {
                channel_id: channel.id(),
                timeout_ms: Some(20),
            },
        ))
        .await;
    assert_eq!(expect_error(&timed_out).code, ErrorCode::Timeout);
}

#[tokio::test]
async fn wait_for_chain_update_round_trip() {
    let world = world();
    world.bridge.handle(envelope(20, BridgeRequest::Init)).await;

    let waiter = {
        let bridge = Arc::clone(&world.bridge);
        tokio::spawn(async move {
            bridge
                .handle(envelope(
                    21,
                    BridgeRequest::WaitForChainUpdate {
                        timeout_ms: Some(500),
                    },
                ))
                .await
        })
    };
    settle().await;
    world.engine.chain_update();

    let response = waiter.await.expect("join");
    assert!(matches!(
        expect_payload(&response),
        ResponsePayload::Updated(true)
    ));
}

#[tokio::test]
async fn remove_identity_pair_tears_down_loop_and_pending_invite() {
    let world = world();
    world.bridge.handle(envelope(22, BridgeRequest::Init)).await;

    let created = world
        .bridge
        .handle(envelope(
            23,
            BridgeRequest::CreateIdentityPair {
                name: "alice".to_string(),
            },
        ))
        .await;
    let (identity_key, channel_id) = match expect_payload(&created) {
        ResponsePayload::IdentityPair { identity, channel } => {
            (identity.public_key.clone(), channel.id.clone())
        }
        other => panic!("unexpected payload: {other:?}"),
    };
    assert!(world.bridge.channel_updates.is_watching(&channel_id).await);

    world
        .bridge
        .handle(envelope(
            24,
            BridgeRequest::RequestInvite {
                identity_key: identity_key.clone(),
            },
        ))
        .await;
    assert!(world.bridge.invites.has_pending(&identity_key).await);

    let response = world
        .bridge
        .handle(envelope(
            25,
            BridgeRequest::RemoveIdentityPair {
                channel_id: channel_id.clone(),
            },
        ))
        .await;
    assert!(matches!(expect_payload(&response), ResponsePayload::Done));
    assert!(!world.bridge.channel_updates.is_watching(&channel_id).await);
    assert!(!world.bridge.invites.has_pending(&identity_key).await);
}

#[tokio::test]
async fn rename_updates_channel_and_identity() {
    let world = world();
    world.bridge.handle(envelope(26, BridgeRequest::Init)).await;
    let created = world
        .bridge
        .handle(envelope(
            27,
            BridgeRequest::CreateIdentityPair {
                name: "alice".to_string(),
            },
        ))
        .await;
    let channel_id = match expect_payload(&created) {
        ResponsePayload::IdentityPair { channel, .. } => channel.id.clone(),
        other => panic!("unexpected payload: {other:?}"),
    };

    let response = world
        .bridge
        .handle(envelope(
            28,
            BridgeRequest::RenameIdentityPair {
                channel_id,
                name: "alice-2".to_string(),
            },
        ))
        .await;
    match expect_payload(&response) {
        ResponsePayload::Channel(channel) => assert_eq!(channel.name, "alice-2"),
        other => panic!("unexpected payload: {other:?}"),
    }
    assert_eq!(world.engine.identities.lock().await[0].name(), "alice-2");
}

#[tokio::test]
async fn update_channel_metadata_moves_the_badge() {
    let world = world();
    let channel = TestChannel::new("general", b"key-a");
    channel.set_counts(10, 0).await;
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(29, BridgeRequest::Init)).await;
    assert_eq!(world.sink.latest().await, Some(10));

    let mut metadata = channel.metadata().await;
    metadata.read_count = 7;
    world
        .bridge
        .handle(envelope(
            30,
            BridgeRequest::UpdateChannelMetadata {
                channel_id: channel.id(),
                metadata,
            },
        ))
        .await;
    assert_eq!(world.sink.latest().await, Some(3));
}

#[tokio::test]
async fn handler_error_becomes_exactly_one_tagged_response() {
    let world = world();
    let channel = TestChannel::with_failing_count("general", b"key-a");
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(31, BridgeRequest::Init)).await;

    let response = world
        .bridge
        .handle(envelope(
            32,
            BridgeRequest::GetMessageCount {
                channel_id: channel.id(),
            },
        ))
        .await;
    assert_eq!(response.seq, 32);
    let error = expect_error(&response);
    assert_eq!(error.code, ErrorCode::Internal);
    assert!(error.message.contains("message store unavailable"));
}

#[tokio::test]
async fn serve_loop_answers_out_of_order_and_survives_errors() {
    let world = world();
    let channel = TestChannel::new("general", b"key-a");
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(33, BridgeRequest::Init)).await;

    let (requests, mut responses) = world.bridge.open_session();

    // A long wait must not stall the requests behind it.
    requests
        .send(envelope(
            34,
            BridgeRequest::WaitForIncomingMessage {
                channel_id: channel.id(),
                timeout_ms: Some(2_000),
            },
        ))
        .await
        .expect("send");
    requests
        .send(envelope(
            35,
            BridgeRequest::GetMessageCount {
                channel_id: ChannelId::from("deadbeef"),
            },
        ))
        .await
        .expect("send");
    requests
        .send(envelope(36, BridgeRequest::GetStatus))
        .await
        .expect("send");

    let first = responses.recv().await.expect("response");
    let second = responses.recv().await.expect("response");
    let mut seen = vec![first.seq, second.seq];
    seen.sort_unstable();
    assert_eq!(seen, vec![35, 36]);

    channel.deliver();
    let third = responses.recv().await.expect("response");
    assert_eq!(third.seq, 34);
    assert!(matches!(
        expect_payload(&third),
        ResponsePayload::Updated(true)
    ));
}

#[tokio::test]
async fn shutdown_releases_parked_waiters() {
    let world = world();
    let channel = TestChannel::new("general", b"key-a");
    world.engine.add_channel(Arc::clone(&channel)).await;
    world.bridge.handle(envelope(37, BridgeRequest::Init)).await;

    let waiter = {
        let bridge = Arc::clone(&world.bridge);
        let channel_id = channel.id();
        tokio::spawn(async move {
            bridge
                .handle(envelope(
                    38,
                    BridgeRequest::WaitForIncomingMessage {
                        channel_id,
                        timeout_ms: None,
                    },
                ))
                .await
        })
    };
    settle().await;

    world.bridge.shutdown().await;
    let response = waiter.await.expect("join");
    assert_eq!(expect_error(&response).code, ErrorCode::Cancelled);
    assert!(world.store.ops.lock().await.contains(&"close"));
}

#[tokio::test]
async fn wait_for_invite_round_trips_through_the_router() {
    let world = world();
    let identity = TestIdentity::new("wanderer", b"wanderer-key");
    identity
        .set_invite(Invite {
            channel_name: "hideout".to_string(),
            channel_key: b"hideout-key".to_vec(),
            payload: Vec::new(),
        })
        .await;
    world.engine.add_identity(Arc::clone(&identity)).await;
    world.bridge.handle(envelope(39, BridgeRequest::Init)).await;

    world
        .bridge
        .handle(envelope(
            40,
            BridgeRequest::RequestInvite {
                identity_key: identity.key_string.clone(),
            },
        ))
        .await;

    let waiter = {
        let bridge = Arc::clone(&world.bridge);
        let identity_key = identity.key_string.clone();
        tokio::spawn(async move {
            bridge
                .handle(envelope(
                    41,
                    BridgeRequest::WaitForInvite {
                        identity_key,
                        timeout_ms: Some(2_000),
                    },
                ))
                .await
        })
    };
    settle().await;
    world
        .swarm
        .deliver_invite(&identity.invite_request.request_id, b"encrypted")
        .await;

    let response = waiter.await.expect("join");
    match expect_payload(&response) {
        ResponsePayload::InviteWait { channel } => {
            let channel = channel.as_ref().expect("channel expected");
            assert_eq!(channel.name, "hideout");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}
