//! Object search, attribute retrieval, and crypto flows through the C ABI.

mod common;

use std::ptr;

use common::{identity_1024, identity_2048, open_session, with_library};
use cryptoki_sys::{
    CKA_CLASS, CKA_ID, CKA_LABEL, CKA_MODULUS_BITS, CKG_MGF1_SHA256, CKM_RSA_PKCS,
    CKM_RSA_PKCS_OAEP, CKM_SHA256, CKM_SHA512, CKM_SHA256_RSA_PKCS, CKO_PRIVATE_KEY,
    CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL,
    CKR_MECHANISM_PARAM_INVALID, CKR_OK, CKR_OPERATION_ACTIVE, CKR_SIGNATURE_INVALID,
    CK_ATTRIBUTE, CK_MECHANISM, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_RSA_PKCS_OAEP_PARAMS,
    CK_SESSION_HANDLE, CK_ULONG, CK_UNAVAILABLE_INFORMATION, CK_VOID_PTR,
};
use hostkey_core::soft::{SoftKeystore, SoftToken};
use hostkey_pkcs11::functions::{
    C_Decrypt, C_DecryptInit, C_Encrypt, C_EncryptInit, C_FindObjects, C_FindObjectsFinal,
    C_FindObjectsInit, C_GetAttributeValue, C_GetSlotList, C_Sign, C_SignFinal, C_SignInit,
    C_SignUpdate, C_Verify, C_VerifyInit,
};

fn plain_mechanism(mechanism: cryptoki_sys::CK_MECHANISM_TYPE) -> CK_MECHANISM {
    CK_MECHANISM { mechanism, pParameter: ptr::null_mut(), ulParameterLen: 0 }
}

fn find_all(session: CK_SESSION_HANDLE) -> Vec<CK_OBJECT_HANDLE> {
    assert_eq!(C_FindObjectsInit(session, ptr::null_mut(), 0), CKR_OK);
    let mut handles = [0 as CK_OBJECT_HANDLE; 16];
    let mut count: CK_ULONG = 0;
    assert_eq!(
        C_FindObjects(session, handles.as_mut_ptr(), handles.len() as CK_ULONG, &mut count),
        CKR_OK
    );
    assert_eq!(C_FindObjectsFinal(session), CKR_OK);
    handles[..count as usize].to_vec()
}

#[test]
fn find_objects_and_read_attributes() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"objs").with_identity(identity_1024()));
    with_library(keystore, || {
        let session = open_session(0);
        let handles = find_all(session);
        assert_eq!(handles, vec![1, 2, 3]);

        // find with a zero-capacity buffer is an argument error.
        let mut count: CK_ULONG = 0;
        assert_eq!(C_FindObjectsInit(session, ptr::null_mut(), 0), CKR_OK);
        let mut sink = [0 as CK_OBJECT_HANDLE; 1];
        assert_eq!(
            C_FindObjects(session, sink.as_mut_ptr(), 0, &mut count),
            CKR_ARGUMENTS_BAD
        );
        assert_eq!(C_FindObjectsFinal(session), CKR_OK);

        // Probe the label length, then fetch it.
        let mut attr = CK_ATTRIBUTE {
            type_: CKA_LABEL,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        };
        assert_eq!(C_GetAttributeValue(session, 1, &mut attr, 1), CKR_OK);
        let label_len = attr.ulValueLen;
        assert_eq!(label_len as usize, "Integration Identity".len());

        let mut label = vec![0u8; label_len as usize];
        attr.pValue = label.as_mut_ptr() as CK_VOID_PTR;
        attr.ulValueLen = label_len;
        assert_eq!(C_GetAttributeValue(session, 1, &mut attr, 1), CKR_OK);
        assert_eq!(&label, b"Integration Identity");

        // A missing attribute leaves the unavailable marker and flags
        // the whole call.
        let mut missing = CK_ATTRIBUTE {
            type_: CKA_MODULUS_BITS,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        };
        assert_eq!(
            C_GetAttributeValue(session, 1, &mut missing, 1),
            CKR_ATTRIBUTE_TYPE_INVALID
        );
        assert_eq!(missing.ulValueLen, CK_UNAVAILABLE_INFORMATION);
    });
}

#[test]
fn find_by_class_returns_matching_objects() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"clas").with_identity(identity_1024()));
    with_library(keystore, || {
        let session = open_session(0);

        let mut class: CK_OBJECT_CLASS = CKO_PRIVATE_KEY;
        let mut template = CK_ATTRIBUTE {
            type_: CKA_CLASS,
            pValue: &mut class as *mut CK_OBJECT_CLASS as CK_VOID_PTR,
            ulValueLen: std::mem::size_of::<CK_OBJECT_CLASS>() as CK_ULONG,
        };
        assert_eq!(C_FindObjectsInit(session, &mut template, 1), CKR_OK);
        let mut handles = [0 as CK_OBJECT_HANDLE; 4];
        let mut count: CK_ULONG = 0;
        assert_eq!(C_FindObjects(session, handles.as_mut_ptr(), 4, &mut count), CKR_OK);
        assert_eq!(C_FindObjectsFinal(session), CKR_OK);
        assert_eq!(&handles[..count as usize], &[3]);
    });
}

#[test]
fn sign_probe_retry_and_verify() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"s2k!").with_identity(identity_2048()));
    with_library(keystore, || {
        let session = open_session(0);
        let handles = find_all(session);
        let (public, private) = (handles[1], handles[2]);
        let data = *b"hello world";

        let mut mechanism = plain_mechanism(CKM_SHA256_RSA_PKCS);
        assert_eq!(C_SignInit(session, &mut mechanism, private), CKR_OK);

        // Size probe with a null signature buffer.
        let mut sig_len: CK_ULONG = 0;
        assert_eq!(
            C_Sign(session, data.as_ptr() as *mut u8, data.len() as CK_ULONG, ptr::null_mut(), &mut sig_len),
            CKR_OK
        );
        assert_eq!(sig_len, 256);

        // One byte short: retryable.
        let mut short = vec![0u8; 255];
        let mut short_len: CK_ULONG = short.len() as CK_ULONG;
        assert_eq!(
            C_Sign(
                session,
                data.as_ptr() as *mut u8,
                data.len() as CK_ULONG,
                short.as_mut_ptr(),
                &mut short_len
            ),
            CKR_BUFFER_TOO_SMALL
        );
        assert_eq!(short_len, 256);

        let mut signature = vec![0u8; 256];
        let mut signature_len: CK_ULONG = signature.len() as CK_ULONG;
        assert_eq!(
            C_Sign(
                session,
                data.as_ptr() as *mut u8,
                data.len() as CK_ULONG,
                signature.as_mut_ptr(),
                &mut signature_len
            ),
            CKR_OK
        );
        assert_eq!(signature_len, 256);

        // Verify the produced signature, then a corrupted copy.
        assert_eq!(C_VerifyInit(session, &mut mechanism, public), CKR_OK);
        assert_eq!(
            C_Verify(
                session,
                data.as_ptr() as *mut u8,
                data.len() as CK_ULONG,
                signature.as_mut_ptr(),
                signature_len
            ),
            CKR_OK
        );

        signature[10] ^= 0xFF;
        assert_eq!(C_VerifyInit(session, &mut mechanism, public), CKR_OK);
        assert_eq!(
            C_Verify(
                session,
                data.as_ptr() as *mut u8,
                data.len() as CK_ULONG,
                signature.as_mut_ptr(),
                signature_len
            ),
            CKR_SIGNATURE_INVALID
        );
    });
}

#[test]
fn multipart_sign_matches_single_shot() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"mp1!").with_identity(identity_1024()));
    with_library(keystore, || {
        let session = open_session(0);
        let handles = find_all(session);
        let private = handles[2];
        let mut mechanism = plain_mechanism(CKM_SHA256_RSA_PKCS);

        let whole = *b"hello world";
        let mut single = vec![0u8; 128];
        let mut single_len: CK_ULONG = single.len() as CK_ULONG;
        assert_eq!(C_SignInit(session, &mut mechanism, private), CKR_OK);
        assert_eq!(
            C_Sign(
                session,
                whole.as_ptr() as *mut u8,
                whole.len() as CK_ULONG,
                single.as_mut_ptr(),
                &mut single_len
            ),
            CKR_OK
        );

        assert_eq!(C_SignInit(session, &mut mechanism, private), CKR_OK);
        // A second init while the first is pending must fail.
        assert_eq!(
            C_SignInit(session, &mut mechanism, private),
            CKR_OPERATION_ACTIVE
        );
        let first = *b"hello ";
        let second = *b"world";
        assert_eq!(
            C_SignUpdate(session, first.as_ptr() as *mut u8, first.len() as CK_ULONG),
            CKR_OK
        );
        assert_eq!(
            C_SignUpdate(session, second.as_ptr() as *mut u8, second.len() as CK_ULONG),
            CKR_OK
        );
        let mut multi = vec![0u8; 128];
        let mut multi_len: CK_ULONG = multi.len() as CK_ULONG;
        assert_eq!(C_SignFinal(session, multi.as_mut_ptr(), &mut multi_len), CKR_OK);

        assert_eq!(single_len, multi_len);
        assert_eq!(single, multi);
    });
}

#[test]
fn encrypt_decrypt_round_trip_via_abi() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"enc!").with_identity(identity_1024()));
    with_library(keystore, || {
        let session = open_session(0);
        let handles = find_all(session);
        let (public, private) = (handles[1], handles[2]);
        let plaintext = *b"attack at dawn";

        let mut mechanism = plain_mechanism(CKM_RSA_PKCS);
        assert_eq!(C_EncryptInit(session, &mut mechanism, public), CKR_OK);
        let mut ciphertext = vec![0u8; 128];
        let mut ciphertext_len: CK_ULONG = ciphertext.len() as CK_ULONG;
        assert_eq!(
            C_Encrypt(
                session,
                plaintext.as_ptr() as *mut u8,
                plaintext.len() as CK_ULONG,
                ciphertext.as_mut_ptr(),
                &mut ciphertext_len
            ),
            CKR_OK
        );

        assert_eq!(C_DecryptInit(session, &mut mechanism, private), CKR_OK);
        let mut recovered = vec![0u8; 128];
        let mut recovered_len: CK_ULONG = recovered.len() as CK_ULONG;
        assert_eq!(
            C_Decrypt(
                session,
                ciphertext.as_mut_ptr(),
                ciphertext_len,
                recovered.as_mut_ptr(),
                &mut recovered_len
            ),
            CKR_OK
        );
        assert_eq!(&recovered[..recovered_len as usize], &plaintext);
    });
}

#[test]
fn oaep_parameter_mismatch_is_rejected() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"oaep").with_identity(identity_1024()));
    with_library(keystore, || {
        let session = open_session(0);
        let handles = find_all(session);
        let public = handles[1];

        // SHA-512 hash with an MGF1-SHA-256 mask has no mapping.
        let mut params = CK_RSA_PKCS_OAEP_PARAMS {
            hashAlg: CKM_SHA512,
            mgf: CKG_MGF1_SHA256,
            source: 0,
            pSourceData: ptr::null_mut(),
            ulSourceDataLen: 0,
        };
        let mut mechanism = CK_MECHANISM {
            mechanism: CKM_RSA_PKCS_OAEP,
            pParameter: &mut params as *mut CK_RSA_PKCS_OAEP_PARAMS as CK_VOID_PTR,
            ulParameterLen: std::mem::size_of::<CK_RSA_PKCS_OAEP_PARAMS>() as CK_ULONG,
        };
        assert_eq!(
            C_EncryptInit(session, &mut mechanism, public),
            CKR_MECHANISM_PARAM_INVALID
        );

        // A matched pair works.
        params.hashAlg = CKM_SHA256;
        assert_eq!(C_EncryptInit(session, &mut mechanism, public), CKR_OK);
    });
}

#[test]
fn session_survives_token_removal() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(SoftToken::new(*b"yank").with_identity(identity_1024()));
    with_library(keystore.clone(), || {
        let session = open_session(0);
        keystore.remove_token(&hostkey_core::TokenId::new(*b"yank"));

        // The slot is empty now.
        let mut count: CK_ULONG = 0;
        assert_eq!(C_GetSlotList(1, ptr::null_mut(), &mut count), CKR_OK);
        assert_eq!(count, 0);

        // But the session still reads object attributes.
        let mut attr = CK_ATTRIBUTE {
            type_: CKA_ID,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        };
        assert_eq!(C_GetAttributeValue(session, 2, &mut attr, 1), CKR_OK);
        assert_eq!(attr.ulValueLen, 1);
    });
}
