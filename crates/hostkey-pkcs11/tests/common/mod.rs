//! Shared setup for the ABI integration tests. Library state is process
//! global, so tests serialize on one lock and run a full
//! initialize/finalize cycle each.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::ptr;
use std::sync::{Mutex, MutexGuard};

use cryptoki_sys::{CKF_SERIAL_SESSION, CKR_OK, CK_SESSION_HANDLE, CK_SLOT_ID};
use hostkey_core::soft::{SoftIdentity, SoftKeystore, SoftToken};
use hostkey_core::MemoryPreferences;
use hostkey_pkcs11::functions::{C_Finalize, C_Initialize, C_OpenSession};
use hostkey_pkcs11::{register_host_keystore, register_preferences};
use once_cell::sync::Lazy;
use std::sync::Arc;

static TEST_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

static SHARED_IDENTITY_1024: Lazy<SoftIdentity> =
    Lazy::new(|| SoftIdentity::generate("Integration Identity", 1024));
static SHARED_IDENTITY_2048: Lazy<SoftIdentity> =
    Lazy::new(|| SoftIdentity::generate("Probe Identity", 2048));

pub fn identity_1024() -> SoftIdentity {
    SHARED_IDENTITY_1024.clone()
}

pub fn identity_2048() -> SoftIdentity {
    SHARED_IDENTITY_2048.clone()
}

pub fn token_with_identity(identity: SoftIdentity) -> SoftToken {
    SoftToken::new(*b"itok").with_identity(identity)
}

/// Take the process-wide test lock; every test touching library state
/// must hold it for its full duration.
pub fn serialize() -> MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serialize the test, install the keystore, and run `f` inside an
/// initialize/finalize window.
pub fn with_library(keystore: Arc<SoftKeystore>, f: impl FnOnce()) {
    let _guard = serialize();
    register_host_keystore(keystore);
    register_preferences(Arc::new(MemoryPreferences::new()));
    assert_eq!(C_Initialize(ptr::null_mut()), CKR_OK);
    f();
    assert_eq!(C_Finalize(ptr::null_mut()), CKR_OK);
}

pub fn open_session(slot: CK_SLOT_ID) -> CK_SESSION_HANDLE {
    let mut handle: CK_SESSION_HANDLE = 0;
    let rv = C_OpenSession(slot, CKF_SERIAL_SESSION, ptr::null_mut(), None, &mut handle);
    assert_eq!(rv, CKR_OK);
    handle
}
