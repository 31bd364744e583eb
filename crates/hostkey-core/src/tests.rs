//! Engine-level scenario tests driving the bridge over the soft keystore.

use std::sync::Arc;

use cryptoki_sys::{
    CKA_CLASS, CKA_EXTRACTABLE, CKA_ID, CKA_LABEL, CKA_SENSITIVE, CKA_VALUE, CKF_SERIAL_SESSION,
    CKG_MGF1_SHA256, CKM_RSA_PKCS, CKM_RSA_PKCS_OAEP, CKM_SHA256, CKM_SHA256_RSA_PKCS, CKM_SHA512,
    CKO_CERTIFICATE, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKU_USER, CK_OBJECT_HANDLE,
    CK_SESSION_HANDLE,
};
use once_cell::sync::Lazy;
use rsa::RsaPrivateKey;

use crate::attribute::find_attribute;
use crate::bridge::{AttrOutcome, AttributeQuery, Bridge, CryptoOutput};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::mechanism::{MechanismParams, MechanismRequest};
use crate::soft::{SoftCertificate, SoftIdentity, SoftKeystore, SoftToken};
use crate::token::{Token, CERTIFICATE_SLOT};

static KEY_1024: Lazy<RsaPrivateKey> =
    Lazy::new(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap());
static KEY_2048: Lazy<RsaPrivateKey> =
    Lazy::new(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap());

fn identity_1024(label: &str) -> SoftIdentity {
    SoftIdentity::from_key(label, KEY_1024.clone())
}

fn bridge_with_token() -> (Arc<SoftKeystore>, Arc<Bridge>) {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"card").with_identity(identity_1024("Test Identity")));
    let bridge = Bridge::new(keystore.clone(), BridgeConfig::disabled());
    bridge.start();
    (keystore, bridge)
}

fn open(bridge: &Bridge, slot: u64) -> CK_SESSION_HANDLE {
    bridge.open_session(slot, CKF_SERIAL_SESSION).unwrap()
}

/// Object handles for the first identity's public and private keys.
fn key_handles(bridge: &Bridge, session: CK_SESSION_HANDLE) -> (CK_OBJECT_HANDLE, CK_OBJECT_HANDLE) {
    bridge.find_objects_init(session, Vec::new()).unwrap();
    let handles = bridge.find_objects(session, 16).unwrap();
    bridge.find_objects_final(session).unwrap();
    assert_eq!(handles.len(), 3);
    (handles[1], handles[2])
}

#[test]
fn enumerate_empty_registry() {
    let keystore = SoftKeystore::new();
    let bridge = Bridge::new(keystore, BridgeConfig::disabled());
    bridge.start();

    assert_eq!(bridge.slot_list(false), vec![0]);
    assert!(bridge.slot_list(true).is_empty());
    assert!(matches!(bridge.slot_info(1), Err(BridgeError::SlotIdInvalid(1))));
    assert!(matches!(bridge.token_info(0), Err(BridgeError::TokenNotPresent(0))));
    let info = bridge.slot_info(0).unwrap();
    assert!(!info.token_present);
    assert!(info.description.contains("Virtual Slot #0"));
}

#[test]
fn hot_plug_insert_and_remove() {
    let (keystore, bridge) = bridge_with_token();
    assert_eq!(bridge.slot_list(true), vec![0]);

    let session = open(&bridge, 0);
    let token_id = crate::host::TokenId::new(*b"card");
    keystore.remove_token(&token_id);

    // The slot empties immediately, but the open session still reads
    // objects from the removed token.
    assert!(bridge.slot_list(true).is_empty());
    let mut query = [AttributeQuery::probe(CKA_VALUE)];
    bridge.get_attribute_values(session, 1, &mut query).unwrap();
    assert!(matches!(query[0].outcome, AttrOutcome::Length(_)));

    bridge.close_session(session).unwrap();
    assert!(matches!(
        bridge.open_session(0, CKF_SERIAL_SESSION),
        Err(BridgeError::TokenNotPresent(0))
    ));

    // Re-insertion lands back in the freed slot.
    keystore.insert_token(SoftToken::new(*b"card").with_identity(identity_1024("Back Again")));
    assert_eq!(bridge.slot_list(true), vec![0]);
}

#[test]
fn token_refcount_follows_sessions() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"refc").with_identity(identity_1024("Refcount")));
    let token = Token::build(keystore.as_ref(), crate::host::TokenId::new(*b"refc")).unwrap();

    assert_eq!(token.ref_count(), 1);
    token.retain();
    token.retain();
    assert_eq!(token.ref_count(), 3);

    token.mark_logged_in();
    token.release();
    assert!(token.logged_in());
    // Dropping to one remaining reference logs the token out.
    token.release();
    assert!(!token.logged_in());
    assert_eq!(token.ref_count(), 1);
}

#[test]
fn last_session_close_logs_out() {
    let (_keystore, bridge) = bridge_with_token();
    let first = open(&bridge, 0);
    let second = open(&bridge, 0);

    bridge.login(first, CKU_USER, None).unwrap();
    assert!(bridge.session_info(first).unwrap().user_functions);
    assert!(bridge.session_info(second).unwrap().user_functions);

    bridge.close_session(first).unwrap();
    assert!(bridge.session_info(second).unwrap().user_functions);
    bridge.close_session(second).unwrap();

    let fresh = open(&bridge, 0);
    assert!(!bridge.session_info(fresh).unwrap().user_functions);
}

#[test]
fn login_checks_the_pin() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(
        SoftToken::new(*b"pin0").with_identity(identity_1024("PIN Identity").with_pin(b"271828")),
    );
    let bridge = Bridge::new(keystore, BridgeConfig::disabled());
    bridge.start();

    let session = open(&bridge, 0);
    assert!(matches!(
        bridge.login(session, CKU_USER, Some(b"000000")),
        Err(BridgeError::PinIncorrect)
    ));
    assert!(!bridge.session_info(session).unwrap().user_functions);

    bridge.login(session, CKU_USER, Some(b"271828")).unwrap();
    assert!(bridge.session_info(session).unwrap().user_functions);

    bridge.logout(session).unwrap();
    assert!(!bridge.session_info(session).unwrap().user_functions);
}

#[test]
fn parallel_sessions_are_rejected() {
    let (_keystore, bridge) = bridge_with_token();
    assert!(matches!(
        bridge.open_session(0, 0),
        Err(BridgeError::ParallelNotSupported)
    ));
}

#[test]
fn object_triples_share_an_id() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let objects: Vec<_> = (1..=3)
        .map(|handle| {
            let mut query = [
                AttributeQuery::sized(CKA_CLASS, 8),
                AttributeQuery::sized(CKA_ID, 8),
            ];
            bridge.get_attribute_values(session, handle, &mut query).unwrap();
            let AttrOutcome::Value(class) = query[0].outcome.clone() else { panic!() };
            let AttrOutcome::Value(id) = query[1].outcome.clone() else { panic!() };
            (class, id)
        })
        .collect();

    let expected = [CKO_CERTIFICATE, CKO_PUBLIC_KEY, CKO_PRIVATE_KEY];
    for ((class, _), want) in objects.iter().zip(expected) {
        assert_eq!(class.as_slice(), want.to_ne_bytes().as_slice());
    }
    // All three objects of identity 0 carry the one-byte id 0x00.
    assert!(objects.iter().all(|(_, id)| id.as_slice() == [0x00]));
}

#[test]
fn private_keys_are_sensitive_and_not_extractable() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let (_public, private) = key_handles(&bridge, session);

    let mut query = [
        AttributeQuery::sized(CKA_SENSITIVE, 1),
        AttributeQuery::sized(CKA_EXTRACTABLE, 1),
    ];
    bridge.get_attribute_values(session, private, &mut query).unwrap();
    assert_eq!(query[0].outcome, AttrOutcome::Value(vec![1]));
    assert_eq!(query[1].outcome, AttrOutcome::Value(vec![0]));
}

#[test]
fn attribute_probe_reports_exact_length_and_missing_types() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);

    let mut probe = [AttributeQuery::probe(CKA_LABEL)];
    bridge.get_attribute_values(session, 1, &mut probe).unwrap();
    let AttrOutcome::Length(len) = probe[0].outcome else { panic!() };
    assert_eq!(len, "Test Identity".len());

    // Undersized buffer: length is written back, summary is
    // buffer-too-small.
    let mut small = [AttributeQuery::sized(CKA_LABEL, 1)];
    assert!(matches!(
        bridge.get_attribute_values(session, 1, &mut small),
        Err(BridgeError::BufferTooSmall(_))
    ));
    assert_eq!(small[0].outcome, AttrOutcome::TooSmall(len));

    // A certificate has no CKA_SENSITIVE; the other attribute still
    // comes back.
    let mut mixed = [
        AttributeQuery::sized(CKA_LABEL, 64),
        AttributeQuery::probe(CKA_SENSITIVE),
    ];
    assert!(matches!(
        bridge.get_attribute_values(session, 1, &mut mixed),
        Err(BridgeError::AttributeTypeInvalid)
    ));
    assert!(matches!(mixed[0].outcome, AttrOutcome::Value(_)));
    assert_eq!(mixed[1].outcome, AttrOutcome::Unavailable);
}

#[test]
fn find_objects_enumerates_every_object_once() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(
        SoftToken::new(*b"two!")
            .with_identity(identity_1024("First"))
            .with_identity(identity_1024("Second")),
    );
    let bridge = Bridge::new(keystore, BridgeConfig::disabled());
    bridge.start();
    let session = open(&bridge, 0);

    bridge.find_objects_init(session, Vec::new()).unwrap();
    let mut seen = Vec::new();
    loop {
        let chunk = bridge.find_objects(session, 2).unwrap();
        if chunk.is_empty() {
            break;
        }
        seen.extend(chunk);
    }
    bridge.find_objects_final(session).unwrap();

    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn find_with_max_zero_is_arguments_bad() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    bridge.find_objects_init(session, Vec::new()).unwrap();
    assert!(matches!(bridge.find_objects(session, 0), Err(BridgeError::ArgumentsBad)));
}

#[test]
fn find_by_class_template() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);

    let template = vec![crate::attribute::TemplateAttribute::new(
        CKA_CLASS,
        CKO_PRIVATE_KEY.to_ne_bytes(),
    )];
    bridge.find_objects_init(session, template).unwrap();
    let found = bridge.find_objects(session, 16).unwrap();
    bridge.find_objects_final(session).unwrap();
    assert_eq!(found, vec![3]);
}

#[test]
fn sign_verify_single_shot_and_multipart_agree() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let (public, private) = key_handles(&bridge, session);
    let mechanism = MechanismRequest::plain(CKM_SHA256_RSA_PKCS);

    bridge.sign_init(session, &mechanism, private).unwrap();
    let CryptoOutput::Data(single) = bridge.sign(session, b"hello world", Some(1024)).unwrap()
    else {
        panic!()
    };

    bridge.sign_init(session, &mechanism, private).unwrap();
    bridge.sign_update(session, b"hello ").unwrap();
    bridge.sign_update(session, b"world").unwrap();
    let CryptoOutput::Data(multi) = bridge.sign_final(session, Some(1024)).unwrap() else {
        panic!()
    };
    // PKCS#1 v1.5 is deterministic, so the chunked digest path must
    // produce the identical signature.
    assert_eq!(single, multi);

    bridge.verify_init(session, &mechanism, public).unwrap();
    bridge.verify(session, b"hello world", &single).unwrap();

    let mut corrupted = single.clone();
    corrupted[0] ^= 0x01;
    bridge.verify_init(session, &mechanism, public).unwrap();
    assert!(matches!(
        bridge.verify(session, b"hello world", &corrupted),
        Err(BridgeError::SignatureInvalid)
    ));

    // Multi-part verify mirrors multi-part sign.
    bridge.verify_init(session, &mechanism, public).unwrap();
    bridge.verify_update(session, b"hello ").unwrap();
    bridge.verify_update(session, b"world").unwrap();
    bridge.verify_final(session, &multi).unwrap();
}

#[test]
fn encrypt_decrypt_round_trips() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let (public, private) = key_handles(&bridge, session);

    for mechanism in [
        MechanismRequest::plain(CKM_RSA_PKCS),
        MechanismRequest {
            mechanism: CKM_RSA_PKCS_OAEP,
            params: MechanismParams::Oaep {
                hash_alg: CKM_SHA256,
                mgf: CKG_MGF1_SHA256,
                source: 0,
                source_data_present: false,
                source_data_len: 0,
            },
        },
    ] {
        bridge.encrypt_init(session, &mechanism, public).unwrap();
        let CryptoOutput::Data(ciphertext) =
            bridge.encrypt(session, b"secret message", Some(1024)).unwrap()
        else {
            panic!()
        };
        assert_ne!(ciphertext.as_slice(), b"secret message");

        bridge.decrypt_init(session, &mechanism, private).unwrap();
        let CryptoOutput::Data(plaintext) =
            bridge.decrypt(session, &ciphertext, Some(1024)).unwrap()
        else {
            panic!()
        };
        assert_eq!(plaintext, b"secret message");
    }
}

#[test]
fn oaep_hash_mgf_mismatch_is_rejected_at_init() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let (public, _private) = key_handles(&bridge, session);

    let mechanism = MechanismRequest {
        mechanism: CKM_RSA_PKCS_OAEP,
        params: MechanismParams::Oaep {
            hash_alg: CKM_SHA512,
            mgf: CKG_MGF1_SHA256,
            source: 0,
            source_data_present: false,
            source_data_len: 0,
        },
    };
    assert!(matches!(
        bridge.encrypt_init(session, &mechanism, public),
        Err(BridgeError::MechanismParamInvalid)
    ));
}

#[test]
fn crypto_state_machine_legality() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let (public, private) = key_handles(&bridge, session);
    let sign_mech = MechanismRequest::plain(CKM_SHA256_RSA_PKCS);
    let enc_mech = MechanismRequest::plain(CKM_RSA_PKCS);

    // Nothing initialized yet.
    assert!(matches!(
        bridge.sign(session, b"x", Some(1024)),
        Err(BridgeError::OperationNotInitialized)
    ));

    // A pending sign blocks any other init, but the sign still goes
    // through afterwards.
    bridge.sign_init(session, &sign_mech, private).unwrap();
    assert!(matches!(
        bridge.encrypt_init(session, &enc_mech, public),
        Err(BridgeError::OperationActive)
    ));
    assert!(bridge.sign(session, b"x", Some(1024)).is_ok());

    // Completion clears the state.
    assert!(matches!(
        bridge.sign(session, b"x", Some(1024)),
        Err(BridgeError::OperationNotInitialized)
    ));

    // Class and capability checks.
    assert!(matches!(
        bridge.sign_init(session, &sign_mech, public),
        Err(BridgeError::KeyTypeInconsistent)
    ));
    assert!(matches!(
        bridge.encrypt_init(session, &enc_mech, private),
        Err(BridgeError::KeyTypeInconsistent)
    ));
    assert!(matches!(
        bridge.sign_init(session, &sign_mech, 99),
        Err(BridgeError::KeyHandleInvalid(99))
    ));
}

#[test]
fn raw_rsa_rejects_multipart() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let (_public, private) = key_handles(&bridge, session);

    bridge.sign_init(session, &MechanismRequest::plain(CKM_RSA_PKCS), private).unwrap();
    assert!(matches!(
        bridge.sign_update(session, b"chunk"),
        Err(BridgeError::DataLenRange)
    ));
}

#[test]
fn size_probe_sequence_on_rsa_2048() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(
        SoftToken::new(*b"2048")
            .with_identity(SoftIdentity::from_key("Probe Identity", KEY_2048.clone())),
    );
    let bridge = Bridge::new(keystore, BridgeConfig::disabled());
    bridge.start();
    let session = open(&bridge, 0);
    let (_public, private) = key_handles(&bridge, session);

    bridge
        .sign_init(session, &MechanismRequest::plain(CKM_SHA256_RSA_PKCS), private)
        .unwrap();

    // Null buffer: the known output size comes back without disturbing
    // the operation.
    assert_eq!(bridge.sign(session, b"data", None).unwrap(), CryptoOutput::Size(256));

    // One byte short: retryable buffer-too-small with the required size.
    assert!(matches!(
        bridge.sign(session, b"data", Some(255)),
        Err(BridgeError::BufferTooSmall(256))
    ));

    // Exact size succeeds.
    let CryptoOutput::Data(signature) = bridge.sign(session, b"data", Some(256)).unwrap() else {
        panic!()
    };
    assert_eq!(signature.len(), 256);
}

#[test]
fn certificate_slot_scan_and_snapshot() {
    let keystore = SoftKeystore::new();
    keystore.add_trusted_certificate(SoftCertificate::authority("DoD Root CA 3"));
    keystore.add_trusted_certificate(SoftCertificate::issued_by("DOD ID CA-59", "DoD Root CA 3"));

    let config = BridgeConfig {
        ask_pin: false,
        cert_slot_enabled: true,
        cert_match: vec!["DoD Root CA".to_string()],
    };
    let bridge = Bridge::new(keystore, config);

    // Enabled but unscanned: listed, yet not present.
    assert_eq!(bridge.slot_list(false), vec![0, CERTIFICATE_SLOT]);
    assert!(matches!(
        bridge.open_session(CERTIFICATE_SLOT, CKF_SERIAL_SESSION),
        Err(BridgeError::TokenNotPresent(CERTIFICATE_SLOT))
    ));

    bridge.start();
    // The scan runs on a background task.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !bridge.slot_info(CERTIFICATE_SLOT).unwrap().token_present {
        assert!(std::time::Instant::now() < deadline, "certificate scan never published");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let session = open(&bridge, CERTIFICATE_SLOT);
    bridge.find_objects_init(session, Vec::new()).unwrap();
    let objects = bridge.find_objects(session, 16).unwrap();
    // Two certificates, each with a certificate and a trust object.
    assert_eq!(objects.len(), 4);

    // Crypto against certificate-slot objects is refused.
    assert!(matches!(
        bridge.encrypt_init(session, &MechanismRequest::plain(CKM_RSA_PKCS), 1),
        Err(BridgeError::KeyTypeInconsistent)
    ));

    let info = bridge.token_info(CERTIFICATE_SLOT).unwrap();
    assert_eq!(info.label, "Keychain Certificates");
    assert!(!info.login_required);
}

#[test]
fn close_all_only_touches_the_slot() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"tokA").with_identity(identity_1024("A")));
    keystore.insert_token(SoftToken::new(*b"tokB").with_identity(identity_1024("B")));
    let bridge = Bridge::new(keystore, BridgeConfig::disabled());
    bridge.start();

    let a1 = open(&bridge, 0);
    let a2 = open(&bridge, 0);
    let b1 = open(&bridge, 1);

    bridge.close_all_sessions(0).unwrap();
    assert!(matches!(bridge.session_info(a1), Err(BridgeError::SessionHandleInvalid(_))));
    assert!(matches!(bridge.session_info(a2), Err(BridgeError::SessionHandleInvalid(_))));
    assert!(bridge.session_info(b1).is_ok());
}

#[test]
fn buffer_too_small_encrypt_is_retryable() {
    let (_keystore, bridge) = bridge_with_token();
    let session = open(&bridge, 0);
    let (public, _private) = key_handles(&bridge, session);

    bridge
        .encrypt_init(session, &MechanismRequest::plain(CKM_RSA_PKCS), public)
        .unwrap();
    assert!(matches!(
        bridge.encrypt(session, b"msg", Some(16)),
        Err(BridgeError::BufferTooSmall(128))
    ));
    // The operation survives the probe failure.
    assert!(bridge.encrypt(session, b"msg", Some(1024)).is_ok());
}

#[test]
fn token_label_comes_from_certificate_summary() {
    let (_keystore, bridge) = bridge_with_token();
    let info = bridge.token_info(0).unwrap();
    assert_eq!(info.label, "Test Identity");
    assert!(info.login_required);
    assert!(info.protected_auth_path);
}

#[test]
fn object_count_is_three_per_identity() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(
        SoftToken::new(*b"cnt0")
            .with_identity(identity_1024("One"))
            .with_identity(identity_1024("Two"))
            .with_identity(identity_1024("Three")),
    );
    let token = Token::build(keystore.as_ref(), crate::host::TokenId::new(*b"cnt0")).unwrap();
    assert_eq!(token.objects().len(), 3 * token.identities().len());
    // Identity 2's objects share the id byte 0x02.
    let id = find_attribute(&token.objects()[6].attributes, CKA_ID)
        .unwrap()
        .value
        .clone();
    assert_eq!(id, vec![0x02]);
}
