//! Exercises the session state machine, the two-phase attribute protocol
//! and the object taxonomy against the in-memory token.

use std::sync::Arc;

use tokendrill_token::{
    AttributeTag, AttributeValue, ObjectClass, ObjectView, SearchTemplate, SessionState,
    SlotManager, TkError, TokenProvider, attributes, object,
};

use crate::SoftToken;

const PIN: &str = "1234";

fn token_with_slot() -> (Arc<SoftToken>, u64) {
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", PIN);
    (token, slot)
}

fn manager(token: &Arc<SoftToken>, slot: u64) -> SlotManager {
    let provider: Arc<dyn TokenProvider> = token.clone();
    let slot = provider
        .slots(false)
        .expect("listing slots")
        .into_iter()
        .find(|candidate| candidate.id == slot)
        .expect("slot not enumerated");
    SlotManager::new(provider, slot)
}

#[test]
fn two_phase_query_returns_exact_bytes() {
    let (token, slot) = token_with_slot();
    let handle = token.add_certificate(slot, Some(&[0x01]), &[0xAA, 0xBB, 0xCC], "my cert");

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    let values = session
        .read_attributes(handle, &[AttributeTag::Label, AttributeTag::SerialNumber])
        .expect("query");
    assert_eq!(values[0], AttributeValue::Bytes(b"my cert".to_vec()));
    assert_eq!(values[1], AttributeValue::Bytes(vec![0xAA, 0xBB, 0xCC]));
    session.close_session().expect("close");
}

#[test]
fn zero_length_value_is_empty_not_absent() {
    let (token, slot) = token_with_slot();
    let handle = token.add_certificate(slot, None, &[0x01], "cert");
    token.set_attribute(slot, handle, AttributeTag::SerialNumber, &[]);

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    let value = session
        .read_attribute(handle, AttributeTag::SerialNumber)
        .expect("query");
    assert_eq!(value, AttributeValue::Bytes(Vec::new()));
    assert_ne!(value, AttributeValue::Absent);
    session.close_session().expect("close");
}

#[test]
fn removed_attribute_reports_absent() {
    let (token, slot) = token_with_slot();
    let handle = token.add_certificate(slot, Some(&[0x01]), &[0x01, 0x02], "cert");
    token.remove_attribute(slot, handle, AttributeTag::Id);

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    let value = session
        .read_attribute(handle, AttributeTag::Id)
        .expect("query");
    assert_eq!(value, AttributeValue::Absent);
    session.close_session().expect("close");
}

#[test]
fn query_on_dead_session_is_query_failed() {
    let (token, _slot) = token_with_slot();
    let provider: Arc<dyn TokenProvider> = token;
    let result = attributes::query(provider.as_ref(), 0xDEAD, 1, &[AttributeTag::Class]);
    match result {
        Err(TkError::QueryFailed { call, rv }) => {
            assert_eq!(call, "C_GetAttributeValue");
            assert_ne!(rv, 0);
        }
        other => panic!("expected QueryFailed, got {other:?}"),
    }
}

#[test]
fn login_and_logout_require_an_open_session() {
    let (token, slot) = token_with_slot();
    let mut session = manager(&token, slot);

    assert!(matches!(
        session.login(PIN),
        Err(TkError::InvalidState(_))
    ));
    assert!(matches!(session.logout(), Err(TkError::InvalidState(_))));
}

#[test]
fn reopening_a_session_keeps_the_existing_handle() {
    let (token, slot) = token_with_slot();
    let mut session = manager(&token, slot);

    session.open_session(false).expect("open");
    let first = session.state();
    session.open_session(true).expect("second open is a no-op");
    assert_eq!(session.state(), first);
    assert_eq!(token.open_session_count(), 1);

    session.close_session().expect("close");
    session.close_session().expect("second close is a no-op");
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(token.open_session_count(), 0);
}

#[test]
fn token_absence_fails_every_transition() {
    let token = Arc::new(SoftToken::new());
    let slot = token.add_empty_slot("Empty reader");
    let mut session = manager(&token, slot);

    assert!(matches!(
        session.open_session(false),
        Err(TkError::NoTokenPresent(id)) if id == slot
    ));
    assert!(matches!(
        session.login(PIN),
        Err(TkError::NoTokenPresent(_))
    ));
    assert!(matches!(
        session.token_info(),
        Err(TkError::NoTokenPresent(_))
    ));
}

#[test]
fn wrong_pin_is_a_provider_error_and_state_stays_open() {
    let (token, slot) = token_with_slot();
    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");

    match session.login("0000") {
        Err(TkError::Provider { call, rv }) => {
            assert_eq!(call, "C_Login");
            assert_eq!(rv, 0xA0);
        }
        other => panic!("expected a provider error, got {other:?}"),
    }
    assert!(matches!(session.state(), SessionState::Open(_)));
    session.close_session().expect("close");
}

#[test]
fn dropping_a_manager_force_closes_the_session() {
    let (token, slot) = token_with_slot();
    {
        let mut session = manager(&token, slot);
        session.open_session(false).expect("open");
        assert_eq!(token.open_session_count(), 1);
    }
    assert_eq!(token.open_session_count(), 0);
}

#[test]
fn resolve_builds_the_matching_certificate_view() {
    let (token, slot) = token_with_slot();
    let handle = token.add_certificate(slot, Some(&[0x01]), &[0x0A, 0x1B, 0x2C], "identity");

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    let object = object::resolve(&session, handle).expect("resolve");
    assert_eq!(object.class, ObjectClass::Certificate);
    match &object.view {
        ObjectView::Certificate(certificate) => {
            assert_eq!(certificate.serial_hex(), "0A1B2C");
            assert_eq!(certificate.storage.label, "identity");
            assert!(certificate.storage.token_resident);
        }
        other => panic!("expected a certificate view, got {other:?}"),
    }
    session.close_session().expect("close");
}

#[test]
fn resolve_builds_the_matching_key_views() {
    let (token, slot) = token_with_slot();
    let (public, private) = token
        .add_rsa_keypair(slot, &[0x42], "test key")
        .expect("keypair");

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    for (handle, class) in [
        (public, ObjectClass::PublicKey),
        (private, ObjectClass::PrivateKey),
    ] {
        let object = object::resolve(&session, handle).expect("resolve");
        assert_eq!(object.class, class);
        match &object.view {
            ObjectView::Key(key) => {
                assert_eq!(key.kind.label(), "RSA");
                assert_eq!(key.id_hex().as_deref(), Some("42"));
            }
            other => panic!("expected a key view, got {other:?}"),
        }
    }
    session.close_session().expect("close");
}

#[test]
fn resolve_builds_the_matching_data_view() {
    let (token, slot) = token_with_slot();
    let handle = token.add_data_object(slot, "blob", "tokendrill", &[0x06, 0x07], &[1, 2, 3]);

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    let object = object::resolve(&session, handle).expect("resolve");
    assert_eq!(object.class, ObjectClass::Data);
    match &object.view {
        ObjectView::Data(data) => {
            assert_eq!(data.application.as_deref(), Some("tokendrill"));
            assert_eq!(data.object_id.as_deref(), Some(&[0x06, 0x07][..]));
            assert_eq!(data.value.as_deref(), Some(&[1, 2, 3][..]));
        }
        other => panic!("expected a data view, got {other:?}"),
    }
    session.close_session().expect("close");
}

#[test]
fn unknown_class_is_a_taxonomy_error() {
    let (token, slot) = token_with_slot();
    let good = token.add_certificate(slot, None, &[0x05], "cert");
    let bad = token.add_raw_class_object(slot, 0x0000_1234);

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    match object::resolve(&session, bad) {
        Err(TkError::Taxonomy(raw)) => assert_eq!(raw, 0x1234),
        other => panic!("expected a taxonomy error, got {other:?}"),
    }
    // The failed resolution leaves the session usable.
    assert!(object::resolve(&session, good).is_ok());
    session.close_session().expect("close");
}

#[test]
fn find_objects_filters_by_class_and_id_in_order() {
    let (token, slot) = token_with_slot();
    let cert = token.add_certificate(slot, Some(&[0x01]), &[0x09], "cert");
    let (public, private) = token
        .add_rsa_keypair(slot, &[0x01], "keys")
        .expect("keypair");
    let (other_public, _) = token
        .add_rsa_keypair(slot, &[0x02], "other keys")
        .expect("keypair");

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");

    let certs = session
        .find_objects(&SearchTemplate::with_class(ObjectClass::Certificate))
        .expect("search");
    assert_eq!(certs, vec![cert]);

    let publics = session
        .find_objects(&SearchTemplate::with_class(ObjectClass::PublicKey))
        .expect("search");
    assert_eq!(publics, vec![public, other_public]);

    let matching = session
        .find_objects(&SearchTemplate::with_class(ObjectClass::PrivateKey).and_id(&[0x01]))
        .expect("search");
    assert_eq!(matching, vec![private]);

    let none = session
        .find_objects(&SearchTemplate::with_class(ObjectClass::SecretKey))
        .expect("search");
    assert!(none.is_empty());

    session.close_session().expect("close");
}

#[test]
fn rsa_round_trip_and_signature_verification() {
    let (token, slot) = token_with_slot();
    let (public, private) = token
        .add_rsa_keypair(slot, &[0x01], "keys")
        .expect("keypair");

    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");
    session.login(PIN).expect("login");

    let plaintext = session.generate_random(128).expect("random");
    assert_eq!(plaintext.len(), 128);

    let ciphertext = session.encrypt(public, &plaintext).expect("encrypt");
    assert_ne!(ciphertext, plaintext);
    let decrypted = session.decrypt(private, &ciphertext).expect("decrypt");
    assert_eq!(decrypted, plaintext);

    let digest = session.digest(&ciphertext).expect("digest");
    assert_eq!(digest.len(), 20);

    let signature = session.sign(private, &digest).expect("sign");
    assert!(session.verify(public, &digest, &signature).expect("verify"));

    // A mismatch is a boolean outcome, not an error.
    let mut tampered = digest.clone();
    tampered[0] ^= 0xFF;
    assert!(!session.verify(public, &tampered, &signature).expect("verify"));

    session.logout().expect("logout");
    session.close_session().expect("close");
}

#[test]
fn generated_key_pair_uses_the_fixed_test_template() {
    let (token, slot) = token_with_slot();
    let mut session = manager(&token, slot);
    session.open_session(false).expect("open");

    let handles = session.generate_key_pair().expect("generate");
    let object = object::resolve(&session, handles.private).expect("resolve");
    match &object.view {
        ObjectView::Key(key) => {
            assert_eq!(key.storage.label, "TestKey");
            assert_eq!(key.id_hex().as_deref(), Some("01"));
        }
        other => panic!("expected a key view, got {other:?}"),
    }
    session.close_session().expect("close");
}
