//! Integration tests for hostile and degraded conditions
//!
//! Tests for:
//! - Tampered and undecryptable traffic, and the violation handling
//!   that follows
//! - Malformed peer method arguments
//! - Conversations that stall, overflow the deferred queue, or arrive
//!   while security is disabled

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tether_bus::auth::{AuthMechanism, AuthStep, EcdhKeyExchange};
use tether_bus::coordinator::{
    METHOD_AUTH_CHALLENGE, METHOD_EXCHANGE_GROUP_KEYS, METHOD_EXCHANGE_GUIDS,
    METHOD_GEN_SESSION_KEY,
};
use tether_bus::{
    BusConfig, BusContext, BusError, BusResult, MethodCaller, SecurityCoordinator,
};
use tether_crypto::aead::AeadKey;
use tether_crypto::{random, Guid, KeyBlob};
use tether_wire::{Message, MessageBuilder, MessageFlags, MessageType, Value};

use tether_integration_tests::{
    wait_until, CollectRouter, RecordingListener, TwoBusFixture, NAME_A, NAME_B,
};

/// A broadcast signal from side A, sealed under A's own group key.
fn sealed_broadcast(fixture: &TwoBusFixture) -> Vec<u8> {
    let (group_key, group_nonce) = fixture.a.context.peers().group_key_and_nonce().unwrap();
    let mut signal = MessageBuilder::new(MessageType::Signal)
        .serial(fixture.a.context.next_serial())
        .path("/org/test/Demo")
        .interface("org.test.Demo")
        .member("Ping")
        .sender(NAME_A)
        .body(vec![Value::String("broadcast payload".to_string())])
        .build(fixture.a.context.compression())
        .unwrap();
    let key = AeadKey::from_blob(&group_key).unwrap();
    signal.encrypt_body(&key, group_nonce.as_bytes()).unwrap();
    signal.into_bytes()
}

#[tokio::test]
async fn test_tampered_broadcast_from_secure_peer_clears_keys() {
    let fixture = TwoBusFixture::new().unwrap();
    fixture.enable_security(EcdhKeyExchange::NAME).unwrap();
    fixture.secure_a_to_b().await.unwrap();

    let mut bytes = sealed_broadcast(&fixture);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x40;

    let mut inbound = Message::unmarshal(bytes, fixture.b.context.compression()).unwrap();
    let status = fixture
        .b
        .coordinator
        .decrypt_inbound(&mut inbound, NAME_A)
        .unwrap_err();
    assert!(matches!(status, BusError::DecryptionFailed(_)));

    // Authentication failure on a message from a secured peer drops the
    // keys and surfaces the violation.
    let b_state = fixture.b.context.peers().lookup(NAME_A).unwrap();
    assert!(b_state.is_secure());
    fixture
        .b
        .coordinator
        .handle_security_violation(&inbound, &status, NAME_A);
    assert!(!b_state.is_secure());
    assert_eq!(fixture.b.listener.violations().len(), 1);
}

#[tokio::test]
async fn test_undecryptable_broadcast_from_stranger_triggers_securing() {
    let fixture = TwoBusFixture::new().unwrap();
    fixture.enable_security(EcdhKeyExchange::NAME).unwrap();

    // B has never heard of A, so the broadcast cannot be opened.
    let bytes = sealed_broadcast(&fixture);
    let mut inbound = Message::unmarshal(bytes, fixture.b.context.compression()).unwrap();
    let status = fixture
        .b
        .coordinator
        .decrypt_inbound(&mut inbound, NAME_A)
        .unwrap_err();
    assert!(matches!(status, BusError::DecryptionFailed(_)));

    fixture
        .b
        .coordinator
        .handle_security_violation(&inbound, &status, NAME_A);

    // The drop stays silent; instead B works to secure the connection
    // so the next broadcast can be opened.
    wait_until(|| {
        fixture
            .b
            .context
            .peers()
            .lookup(NAME_A)
            .is_some_and(|state| state.is_secure())
    })
    .await;
    assert!(fixture.b.listener.violations().is_empty());
    assert_eq!(
        fixture.b.listener.completions(),
        vec![(EcdhKeyExchange::NAME.to_string(), NAME_A.to_string(), true)]
    );
}

#[tokio::test]
async fn test_sealed_unicast_without_keys_is_a_reported_violation() {
    let fixture = TwoBusFixture::new().unwrap();
    fixture.enable_security(EcdhKeyExchange::NAME).unwrap();

    // B knows the name but holds no keys for it.
    fixture.b.context.peers().get_peer_state(NAME_A, None);

    let mut call = MessageBuilder::new(MessageType::MethodCall)
        .serial(fixture.a.context.next_serial())
        .path("/org/test/Demo")
        .interface("org.test.Demo")
        .member("Poke")
        .destination(NAME_B)
        .sender(NAME_A)
        .body(vec![Value::Uint32(99)])
        .build(fixture.a.context.compression())
        .unwrap();
    let key = AeadKey::new(random::random_32().unwrap());
    call.encrypt_body(&key, &random::random_24().unwrap()).unwrap();

    let mut inbound =
        Message::unmarshal(call.into_bytes(), fixture.b.context.compression()).unwrap();
    let status = fixture
        .b
        .coordinator
        .decrypt_inbound(&mut inbound, NAME_A)
        .unwrap_err();
    assert!(matches!(status, BusError::DecryptionFailed(_)));

    fixture
        .b
        .coordinator
        .handle_security_violation(&inbound, &status, NAME_A);

    // Directed traffic is not grounds for speculative securing; the
    // violation goes straight to the listener.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.b.listener.violations().len(), 1);
    assert!(fixture.b.listener.completions().is_empty());
    assert!(!fixture.b.context.peers().lookup(NAME_A).unwrap().is_secure());
}

#[tokio::test]
async fn test_peer_methods_reject_malformed_arguments() {
    let fixture = TwoBusFixture::new().unwrap();
    fixture.enable_security(EcdhKeyExchange::NAME).unwrap();
    let b_guid = fixture.b.context.local_guid().to_string();

    // Wrong argument type.
    let err = fixture
        .b
        .coordinator
        .dispatch_peer_call(NAME_A, METHOD_EXCHANGE_GUIDS, &[Value::Uint32(7)])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::BadArgument(_)));

    // Unparseable GUID.
    let err = fixture
        .b
        .coordinator
        .dispatch_peer_call(
            NAME_A,
            METHOD_EXCHANGE_GUIDS,
            &[Value::String("not a guid".to_string()), Value::Uint32(1)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::BadArgument(_)));

    // Nonce that is not valid hex of the right length.
    let err = fixture
        .b
        .coordinator
        .dispatch_peer_call(
            NAME_A,
            METHOD_GEN_SESSION_KEY,
            &[
                Value::String(fixture.a.context.local_guid().to_string()),
                Value::String(b_guid),
                Value::String("zz".to_string()),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::BadArgument(_)));

    // Group key payload of the wrong size, from an otherwise valid
    // secured sender.
    fixture.secure_a_to_b().await.unwrap();
    let err = fixture
        .b
        .coordinator
        .dispatch_peer_call(
            NAME_A,
            METHOD_EXCHANGE_GROUP_KEYS,
            &[Value::byte_array(&[0u8; 10])],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::BadArgument(_)));
}

#[tokio::test]
async fn test_gen_session_key_for_unknown_initiator_fails() {
    let fixture = TwoBusFixture::new().unwrap();
    fixture.enable_security(EcdhKeyExchange::NAME).unwrap();

    let stranger = Guid::random().unwrap();
    let err = fixture
        .b
        .coordinator
        .dispatch_peer_call(
            NAME_A,
            METHOD_GEN_SESSION_KEY,
            &[
                Value::String(stranger.to_string()),
                Value::String(fixture.b.context.local_guid().to_string()),
                Value::String(hex::encode([7u8; 28])),
            ],
        )
        .await
        .unwrap_err();
    // No master for that GUID means the cheap path cannot run; the
    // caller falls back to a full conversation on its side.
    assert!(matches!(err, BusError::Crypto(_)));
}

#[tokio::test]
async fn test_auth_challenge_with_security_disabled() {
    let fixture = TwoBusFixture::new().unwrap();

    let err = fixture
        .b
        .coordinator
        .dispatch_peer_call(
            NAME_A,
            METHOD_AUTH_CHALLENGE,
            &[Value::String("AUTH TETHER_KEYX_ECDH".to_string())],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NoAuthMechanism));
}

/// A mechanism that answers every step with more data and never
/// completes.
struct EndlessAuth;

const ENDLESS_NAME: &str = "TETHER_ENDLESS";

impl AuthMechanism for EndlessAuth {
    fn name(&self) -> &'static str {
        ENDLESS_NAME
    }

    fn initial_response(&mut self) -> BusResult<AuthStep> {
        Ok(AuthStep::Continue(vec![0]))
    }

    fn response(&mut self, _challenge: &[u8]) -> BusResult<AuthStep> {
        Ok(AuthStep::Continue(vec![0]))
    }

    fn challenge(&mut self, _response: &[u8]) -> BusResult<AuthStep> {
        Ok(AuthStep::Continue(vec![0]))
    }

    fn master_secret(&self) -> BusResult<KeyBlob> {
        Err(BusError::key_unavailable("conversation never completes"))
    }
}

#[tokio::test]
async fn test_endless_conversation_times_out() {
    let config = BusConfig {
        auth_timeout: Duration::from_millis(200),
        ..BusConfig::default()
    };
    let fixture = TwoBusFixture::with_configs(config, BusConfig::default()).unwrap();
    for context in [&fixture.a.context, &fixture.b.context] {
        context
            .registry()
            .register(ENDLESS_NAME, Box::new(|| Box::new(EndlessAuth)));
    }
    fixture.enable_security(ENDLESS_NAME).unwrap();

    let outcome = fixture.secure_a_to_b().await;
    assert!(matches!(outcome, Err(BusError::Timeout(_))));
    assert!(!fixture.a.context.peers().lookup(NAME_B).unwrap().is_secure());
    assert_eq!(
        fixture.a.listener.completions(),
        vec![(String::new(), NAME_B.to_string(), false)]
    );
}

/// A caller whose calls never come back, pinning the supervisor on its
/// current task.
struct HangingCaller;

#[async_trait]
impl MethodCaller for HangingCaller {
    async fn call_method(
        &self,
        _destination: &str,
        _member: &str,
        _args: Vec<Value>,
        _flags: MessageFlags,
        _timeout: Duration,
    ) -> BusResult<Vec<Value>> {
        std::future::pending::<BusResult<Vec<Value>>>().await
    }
}

#[tokio::test]
async fn test_deferred_queue_overflow_is_reported() {
    let config = BusConfig {
        deferred_queue_depth: 1,
        ..BusConfig::default()
    };
    let context = Arc::new(BusContext::new(config).unwrap());
    let coordinator = SecurityCoordinator::new(
        context.clone(),
        Arc::new(HangingCaller),
        Arc::new(CollectRouter::default()),
    );
    let listener = Arc::new(RecordingListener::default());
    coordinator
        .setup_peer_authentication(EcdhKeyExchange::NAME, listener)
        .unwrap();

    // The first securing request parks the supervisor on a call that
    // never returns; the second fills the channel; the third overflows.
    coordinator.queue_secure_peer(":1.50", false).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    coordinator.queue_secure_peer(":1.51", false).unwrap();
    let overflow = coordinator.queue_secure_peer(":1.52", false).unwrap_err();
    assert!(matches!(overflow, BusError::QueueExhausted(_)));
}
