//! Library lifecycle and function-surface conformance through the C ABI.

mod common;

use std::ptr;

use common::{identity_1024, token_with_identity, with_library};
use cryptoki_sys::{
    CKR_ARGUMENTS_BAD, CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_CRYPTOKI_NOT_INITIALIZED, CKR_FUNCTION_NOT_SUPPORTED, CKR_OK, CKR_SLOT_ID_INVALID,
    CK_C_INITIALIZE_ARGS, CK_FUNCTION_LIST_PTR, CK_INFO, CK_MECHANISM_INFO, CK_RV, CK_SLOT_ID,
    CK_ULONG, CK_VOID_PTR, CK_VOID_PTR_PTR,
};
use hostkey_core::soft::SoftKeystore;
use hostkey_pkcs11::functions::{
    C_Finalize, C_GenerateRandom, C_GetFunctionList, C_GetInfo, C_GetMechanismInfo,
    C_GetMechanismList, C_GetSlotList, C_InitToken, C_Initialize, C_WaitForSlotEvent,
};

#[test]
fn initialize_finalize_cycle() {
    let _guard = common::serialize();
    hostkey_pkcs11::register_host_keystore(SoftKeystore::new());
    assert_eq!(C_Initialize(ptr::null_mut()), CKR_OK);
    // Double initialize is rejected while the library is live.
    assert_eq!(C_Initialize(ptr::null_mut()), CKR_CRYPTOKI_ALREADY_INITIALIZED);
    assert_eq!(C_Finalize(ptr::null_mut()), CKR_OK);

    // After finalize everything needs a fresh initialize.
    assert_eq!(C_Finalize(ptr::null_mut()), CKR_CRYPTOKI_NOT_INITIALIZED);
    let mut count: CK_ULONG = 0;
    assert_eq!(
        C_GetSlotList(0, ptr::null_mut(), &mut count),
        CKR_CRYPTOKI_NOT_INITIALIZED
    );
}

#[test]
fn finalize_rejects_reserved_argument() {
    with_library(SoftKeystore::new(), || {
        let mut bogus = 0u8;
        assert_eq!(
            C_Finalize(&mut bogus as *mut u8 as CK_VOID_PTR),
            CKR_ARGUMENTS_BAD
        );
    });
}

#[test]
fn partial_mutex_callbacks_are_rejected() {
    let _guard = common::serialize();
    extern "C" fn create_mutex(_arg: CK_VOID_PTR_PTR) -> CK_RV {
        CKR_OK
    }
    let mut args: CK_C_INITIALIZE_ARGS = unsafe { std::mem::zeroed() };
    args.CreateMutex = Some(create_mutex);
    // Only one of the four callbacks: arguments-bad, library stays down.
    assert_eq!(
        C_Initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as CK_VOID_PTR),
        CKR_ARGUMENTS_BAD
    );
    assert_eq!(C_Finalize(ptr::null_mut()), CKR_CRYPTOKI_NOT_INITIALIZED);
}

#[test]
fn library_info_reports_fixed_strings() {
    with_library(SoftKeystore::new(), || {
        let mut info: CK_INFO = unsafe { std::mem::zeroed() };
        assert_eq!(C_GetInfo(&mut info), CKR_OK);
        assert_eq!(info.cryptokiVersion.major, 2);
        assert_eq!(info.cryptokiVersion.minor, 40);
        assert_eq!(info.libraryVersion.major, 1);
        assert_eq!(info.libraryVersion.minor, 0);
        // Space padded, no NUL terminator.
        assert!(info.manufacturerID.starts_with(b"U.S. Naval Research Lab"));
        assert!(info.manufacturerID.ends_with(b"  "));
        assert!(!info.libraryDescription.contains(&0));
    });
}

#[test]
fn function_list_is_complete() {
    let mut list: CK_FUNCTION_LIST_PTR = ptr::null_mut();
    assert_eq!(C_GetFunctionList(&mut list), CKR_OK);
    let list = unsafe { &*list };
    assert_eq!(list.version.major, 2);
    assert_eq!(list.version.minor, 40);
    assert!(list.C_Initialize.is_some());
    assert!(list.C_SignFinal.is_some());
    assert!(list.C_WaitForSlotEvent.is_some());
}

#[test]
fn unsupported_functions_answer_uniformly() {
    with_library(SoftKeystore::new(), || {
        assert_eq!(
            C_InitToken(0, ptr::null_mut(), 0, ptr::null_mut()),
            CKR_FUNCTION_NOT_SUPPORTED
        );
        assert_eq!(C_GenerateRandom(1, ptr::null_mut(), 0), CKR_FUNCTION_NOT_SUPPORTED);
        assert_eq!(
            C_WaitForSlotEvent(0, ptr::null_mut(), ptr::null_mut()),
            CKR_FUNCTION_NOT_SUPPORTED
        );
    });
}

#[test]
fn slot_list_buffer_protocol() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(token_with_identity(identity_1024()));
    with_library(keystore, || {
        let mut count: CK_ULONG = 0;
        assert_eq!(C_GetSlotList(1, ptr::null_mut(), &mut count), CKR_OK);
        assert_eq!(count, 1);

        // Undersized buffer reports the required count.
        let mut short: [CK_SLOT_ID; 0] = [];
        let mut short_count: CK_ULONG = 0;
        assert_eq!(
            C_GetSlotList(1, short.as_mut_ptr(), &mut short_count),
            CKR_BUFFER_TOO_SMALL
        );
        assert_eq!(short_count, 1);

        let mut slots = [0 as CK_SLOT_ID; 4];
        let mut full_count: CK_ULONG = slots.len() as CK_ULONG;
        assert_eq!(C_GetSlotList(1, slots.as_mut_ptr(), &mut full_count), CKR_OK);
        assert_eq!(full_count, 1);
        assert_eq!(slots[0], 0);
    });
}

#[test]
fn mechanism_list_and_info() {
    let keystore = SoftKeystore::new();
    keystore.insert_token(token_with_identity(identity_1024()));
    with_library(keystore, || {
        let mut count: CK_ULONG = 0;
        assert_eq!(C_GetMechanismList(0, ptr::null_mut(), &mut count), CKR_OK);
        assert!(count > 0);

        let mut mechanisms = vec![0 as cryptoki_sys::CK_MECHANISM_TYPE; count as usize];
        assert_eq!(
            C_GetMechanismList(0, mechanisms.as_mut_ptr(), &mut count),
            CKR_OK
        );
        assert!(mechanisms.contains(&cryptoki_sys::CKM_RSA_PKCS));

        let mut info: CK_MECHANISM_INFO = unsafe { std::mem::zeroed() };
        assert_eq!(
            C_GetMechanismInfo(0, cryptoki_sys::CKM_SHA256_RSA_PKCS, &mut info),
            CKR_OK
        );
        assert!(info.ulMinKeySize >= 1024);
        assert!(info.flags & cryptoki_sys::CKF_SIGN != 0);

        // A null info pointer is arguments-bad, not a crash.
        assert_eq!(
            C_GetMechanismInfo(0, cryptoki_sys::CKM_SHA256_RSA_PKCS, ptr::null_mut()),
            CKR_ARGUMENTS_BAD
        );

        // An invalid slot is flagged before the mechanism lookup.
        assert_eq!(
            C_GetMechanismInfo(77, cryptoki_sys::CKM_SHA256_RSA_PKCS, &mut info),
            CKR_SLOT_ID_INVALID
        );
    });
}
