//! Integration tests across the wire codec and the crypto core
//!
//! Tests for:
//! - Sealing and opening messages with session matter derived on two
//!   independent sides
//! - The header compression token path between two tables
//! - Key store persistence through real files

use std::fs::File;

use tether_crypto::aead::{AeadKey, Nonce, NONCE_SIZE};
use tether_crypto::{prf, random, Guid, KeyBlob, KeyBlobKind, KeyDerivationParams, KeyStore};
use tether_wire::{
    CompressionTable, HeaderFields, Message, MessageBuilder, MessageFlags, MessageType, Value,
    WireError,
};

/// A shared master, expanded into session matter on two sides from the
/// same seed.
fn matched_matter() -> (prf::SessionMatter, prf::SessionMatter) {
    let master = KeyBlob::new(
        KeyBlobKind::Generic,
        random::random_32().unwrap().to_vec(),
    );
    let seed = b"initiator-nonce-hex:responder-nonce-hex";
    let ours = prf::derive_session_matter(&master, seed).unwrap();
    let theirs = prf::derive_session_matter(&master, seed).unwrap();
    (ours, theirs)
}

#[test]
fn test_derived_session_matter_seals_messages_end_to_end() {
    let (ours, theirs) = matched_matter();
    assert!(prf::verifiers_match(&ours.verifier, &theirs.verifier));

    let body = vec![
        Value::String("unit heartbeat".to_string()),
        Value::Uint32(831),
        Value::byte_array(&[0xde, 0xad, 0xbe, 0xef]),
    ];
    let sender_table = CompressionTable::new();
    let mut message = MessageBuilder::new(MessageType::MethodCall)
        .serial(7)
        .path("/org/tether/demo")
        .interface("org.tether.Demo")
        .member("Beat")
        .destination(":1.4")
        .body(body.clone())
        .build(&sender_table)
        .unwrap();

    let sender_key = AeadKey::from_blob(&ours.key).unwrap();
    message.encrypt_body(&sender_key, ours.nonce.as_bytes()).unwrap();
    assert!(message.is_encrypted());

    // The other side rebuilds the message from raw bytes and opens it
    // with its independently derived copy of the key.
    let receiver_table = CompressionTable::new();
    let mut received = Message::unmarshal(message.into_bytes(), &receiver_table).unwrap();
    let receiver_key = AeadKey::from_blob(&theirs.key).unwrap();
    received
        .decrypt_body(&receiver_key, theirs.nonce.as_bytes())
        .unwrap();
    assert_eq!(received.body_values().unwrap(), body);
}

#[test]
fn test_mismatched_seed_produces_disagreeing_verifiers() {
    let master = KeyBlob::new(
        KeyBlobKind::Generic,
        random::random_32().unwrap().to_vec(),
    );
    let ours = prf::derive_session_matter(&master, b"seed one").unwrap();
    let theirs = prf::derive_session_matter(&master, b"seed two").unwrap();
    assert!(!prf::verifiers_match(&ours.verifier, &theirs.verifier));
}

#[test]
fn test_tampered_serial_breaks_decryption() {
    let (ours, theirs) = matched_matter();
    let table = CompressionTable::new();
    let mut message = MessageBuilder::new(MessageType::MethodCall)
        .serial(41)
        .path("/org/tether/demo")
        .interface("org.tether.Demo")
        .member("Beat")
        .destination(":1.4")
        .body(vec![Value::Uint32(1)])
        .build(&table)
        .unwrap();
    let key = AeadKey::from_blob(&ours.key).unwrap();
    message.encrypt_body(&key, ours.nonce.as_bytes()).unwrap();

    // The serial lives in the envelope, which the seal authenticates.
    let mut bytes = message.into_bytes();
    bytes[8] ^= 0x01;

    let mut received = Message::unmarshal(bytes, &CompressionTable::new()).unwrap();
    let receiver_key = AeadKey::from_blob(&theirs.key).unwrap();
    assert!(received
        .decrypt_body(&receiver_key, theirs.nonce.as_bytes())
        .is_err());
}

#[test]
fn test_compression_token_crosses_tables_via_expansion() {
    let sender_table = CompressionTable::new();
    let receiver_table = CompressionTable::new();

    let message = MessageBuilder::new(MessageType::Signal)
        .serial(11)
        .path("/org/tether/demo")
        .interface("org.tether.Demo")
        .member("Tick")
        .sender(":1.3")
        .flags(MessageFlags::new().with_compressed())
        .body(vec![Value::Uint32(5)])
        .build(&sender_table)
        .unwrap();

    let mut received = Message::unmarshal(message.into_bytes(), &receiver_table).unwrap();
    let token = received.needs_expansion().expect("token must be unknown");

    // What GetExpansion would do: ship the fields as a value, install
    // them in the receiver's table, and finish the message.
    let expansion = sender_table.expand(token).expect("sender knows its token");
    let shipped = expansion.to_expansion_value();
    let fields = HeaderFields::from_expansion_value(&shipped).unwrap();
    receiver_table.add_expansion(token, fields);

    let learned = receiver_table.expand(token).unwrap();
    received.finish_expansion(learned);
    assert!(received.needs_expansion().is_none());
    assert_eq!(received.fields().interface(), Some("org.tether.Demo"));
    assert_eq!(received.fields().member(), Some("Tick"));
    assert_eq!(received.fields().sender(), Some(":1.3"));
    assert_eq!(received.body_values().unwrap(), vec![Value::Uint32(5)]);

    // A second message with the same fields reuses the same token, and
    // this time the receiver already knows it.
    let again = MessageBuilder::new(MessageType::Signal)
        .serial(12)
        .path("/org/tether/demo")
        .interface("org.tether.Demo")
        .member("Tick")
        .sender(":1.3")
        .flags(MessageFlags::new().with_compressed())
        .body(vec![Value::Uint32(6)])
        .build(&sender_table)
        .unwrap();
    let mut repeat = Message::unmarshal(again.into_bytes(), &receiver_table).unwrap();
    if let Some(known) = repeat.needs_expansion() {
        assert_eq!(known, token);
        let fields = receiver_table.expand(known).unwrap();
        repeat.finish_expansion(fields);
    }
    assert_eq!(repeat.fields().member(), Some("Tick"));
}

#[test]
fn test_encrypted_compressed_message_must_expand_before_opening() {
    let (ours, theirs) = matched_matter();
    let sender_table = CompressionTable::new();
    let mut message = MessageBuilder::new(MessageType::Signal)
        .serial(21)
        .path("/org/tether/demo")
        .interface("org.tether.Demo")
        .member("Tock")
        .sender(":1.3")
        .flags(MessageFlags::new().with_compressed())
        .body(vec![Value::String("sealed and squeezed".to_string())])
        .build(&sender_table)
        .unwrap();
    let key = AeadKey::from_blob(&ours.key).unwrap();
    message.encrypt_body(&key, ours.nonce.as_bytes()).unwrap();

    let receiver_table = CompressionTable::new();
    let mut received = Message::unmarshal(message.into_bytes(), &receiver_table).unwrap();
    let token = received.needs_expansion().expect("token must be unknown");
    let receiver_key = AeadKey::from_blob(&theirs.key).unwrap();

    // Opening before the headers are whole must be refused, since the
    // seal covers the expanded header fields.
    assert!(matches!(
        received.decrypt_body(&receiver_key, theirs.nonce.as_bytes()),
        Err(WireError::CannotExpand { .. })
    ));

    let fields = sender_table.expand(token).unwrap();
    received.finish_expansion(fields);
    received
        .decrypt_body(&receiver_key, theirs.nonce.as_bytes())
        .unwrap();
    assert_eq!(
        received.body_values().unwrap(),
        vec![Value::String("sealed and squeezed".to_string())]
    );
}

#[test]
fn test_key_store_round_trips_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.keystore");

    let store = KeyStore::with_params(KeyDerivationParams::low_security());
    store
        .load(&mut std::io::Cursor::new(Vec::new()), b"letmein")
        .unwrap();
    let identity = store.store_guid().unwrap();

    let peer = Guid::random().unwrap();
    let master = KeyBlob::new(KeyBlobKind::Generic, vec![0x5a; 32]).with_tag("TETHER_KEYX_ECDH");
    store.add_key(peer, master).unwrap();

    let mut sink = File::create(&path).unwrap();
    store.store(&mut sink).unwrap();
    drop(sink);

    // Reload with the right password.
    let reloaded = KeyStore::with_params(KeyDerivationParams::low_security());
    reloaded
        .load(&mut File::open(&path).unwrap(), b"letmein")
        .unwrap();
    assert_eq!(reloaded.store_guid().unwrap(), identity);
    assert!(reloaded.has_key(&peer).unwrap());
    let blob = reloaded.get_key(&peer).unwrap();
    assert_eq!(blob.as_bytes(), vec![0x5a; 32].as_slice());
    assert_eq!(blob.tag(), "TETHER_KEYX_ECDH");

    // A wrong password cannot open the payload. The identity sits in the
    // clear so it survives, but the keys are gone and the store comes up
    // empty, ready to be rewritten.
    let wrong = KeyStore::with_params(KeyDerivationParams::low_security());
    wrong
        .load(&mut File::open(&path).unwrap(), b"LETMEIN")
        .unwrap();
    assert_eq!(wrong.store_guid().unwrap(), identity);
    assert!(!wrong.has_key(&peer).unwrap());
}

#[test]
fn test_message_nonces_are_serial_bound() {
    let base = random::random_24().unwrap();
    let first = Nonce::for_message(&base, 1, None).unwrap();
    let second = Nonce::for_message(&base, 2, None).unwrap();
    assert_ne!(first.as_bytes(), second.as_bytes());
    assert_eq!(first.as_bytes().len(), NONCE_SIZE);

    // The same inputs always reproduce the same nonce.
    let replayed = Nonce::for_message(&base, 1, None).unwrap();
    assert_eq!(first.as_bytes(), replayed.as_bytes());
}
