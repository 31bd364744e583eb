//! Cryptoki v2.40 C ABI over the HostKey engine.
//!
//! This crate owns the process-global library state and the `C_*` entry
//! points; every semantic decision is delegated to `hostkey-core`. The
//! platform integration registers its keystore with
//! [`register_host_keystore`] before the application calls
//! `C_Initialize`; without a registration the library falls back to the
//! in-memory soft keystore, which is what the test suite runs against.

#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::sync::Arc;

use cryptoki_sys::{
    CKF_OS_LOCKING_OK, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DATA_LEN_RANGE,
    CKR_FUNCTION_FAILED, CKR_FUNCTION_NOT_SUPPORTED, CKR_GENERAL_ERROR,
    CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID, CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID, CKR_OBJECT_HANDLE_INVALID,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT,
    CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SIGNATURE_INVALID,
    CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT, CK_C_INITIALIZE_ARGS, CK_RV,
};
use hostkey_core::config::{current_program_name, FilePreferences};
use hostkey_core::soft::SoftKeystore;
use hostkey_core::{Bridge, BridgeConfig, BridgeError, BridgeResult, HostKeystore, Preferences};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

pub mod functions;
mod util;

pub use functions::C_GetFunctionList;

/// How the caller asked us to lock, per `CK_C_INITIALIZE_ARGS`. Internal
/// locking is always native; the selection is validated and recorded so
/// misuse (a partial callback set) is rejected the way the spec demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingModel {
    SingleThreaded,
    Os,
    Callbacks,
}

struct LibraryState {
    bridge: Arc<Bridge>,
    locking: LockingModel,
}

static STATE: Lazy<RwLock<Option<LibraryState>>> = Lazy::new(|| RwLock::new(None));

static KEYSTORE: Lazy<RwLock<Option<Arc<dyn HostKeystore>>>> = Lazy::new(|| RwLock::new(None));
static PREFERENCES: Lazy<RwLock<Option<Arc<dyn Preferences>>>> = Lazy::new(|| RwLock::new(None));

/// Install the host keystore the next `C_Initialize` will bridge to.
/// Platform integrations call this from their load path.
pub fn register_host_keystore(keystore: Arc<dyn HostKeystore>) {
    *KEYSTORE.write() = Some(keystore);
}

/// Install a preference source, overriding the default preference file.
pub fn register_preferences(preferences: Arc<dyn Preferences>) {
    *PREFERENCES.write() = Some(preferences);
}

pub(crate) fn bridge() -> Result<Arc<Bridge>, CK_RV> {
    STATE
        .read()
        .as_ref()
        .map(|state| Arc::clone(&state.bridge))
        .ok_or(CKR_CRYPTOKI_NOT_INITIALIZED)
}

pub(crate) fn initialized() -> bool {
    STATE.read().is_some()
}

/// Decode the caller's locking arrangement. Supplying any mutex callback
/// means all four must be supplied.
fn locking_model(args: &CK_C_INITIALIZE_ARGS) -> BridgeResult<LockingModel> {
    if args.flags & CKF_OS_LOCKING_OK != 0 {
        return Ok(LockingModel::Os);
    }
    let supplied = [
        args.CreateMutex.is_some(),
        args.DestroyMutex.is_some(),
        args.LockMutex.is_some(),
        args.UnlockMutex.is_some(),
    ];
    if supplied.iter().any(|&s| s) {
        if supplied.iter().all(|&s| s) {
            Ok(LockingModel::Callbacks)
        } else {
            Err(BridgeError::ArgumentsBad)
        }
    } else {
        Ok(LockingModel::SingleThreaded)
    }
}

pub(crate) fn initialize(init_args: Option<&CK_C_INITIALIZE_ARGS>) -> BridgeResult<()> {
    let mut state = STATE.write();
    if state.is_some() {
        return Err(BridgeError::AlreadyInitialized);
    }

    let locking = match init_args {
        Some(args) => {
            if !args.pReserved.is_null() {
                return Err(BridgeError::ArgumentsBad);
            }
            locking_model(args)?
        }
        None => LockingModel::SingleThreaded,
    };
    debug!(?locking, "locking model selected");

    let preferences = PREFERENCES
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(FilePreferences::load_default()) as Arc<dyn Preferences>);
    let program = current_program_name();
    let config = BridgeConfig::resolve(preferences.as_ref(), &program);

    let keystore = KEYSTORE.read().clone().unwrap_or_else(|| {
        debug!("no host keystore registered, using the soft keystore");
        SoftKeystore::new() as Arc<dyn HostKeystore>
    });

    let bridge = Bridge::new(keystore, config);
    bridge.start();
    *state = Some(LibraryState { bridge, locking });
    Ok(())
}

pub(crate) fn finalize() -> BridgeResult<()> {
    let state = STATE.write().take().ok_or(BridgeError::NotInitialized)?;
    state.bridge.shutdown();
    Ok(())
}

/// The locking model recorded at initialize time, for diagnostics.
pub fn locking_model_in_effect() -> Option<LockingModel> {
    STATE.read().as_ref().map(|state| state.locking)
}

pub(crate) fn translate_error(err: &BridgeError) -> CK_RV {
    match err {
        BridgeError::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
        BridgeError::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
        BridgeError::ArgumentsBad => CKR_ARGUMENTS_BAD,
        BridgeError::SlotIdInvalid(_) => CKR_SLOT_ID_INVALID,
        BridgeError::TokenNotPresent(_) => CKR_TOKEN_NOT_PRESENT,
        BridgeError::SessionHandleInvalid(_) => CKR_SESSION_HANDLE_INVALID,
        BridgeError::ParallelNotSupported => CKR_SESSION_PARALLEL_NOT_SUPPORTED,
        BridgeError::ObjectHandleInvalid(_) => CKR_OBJECT_HANDLE_INVALID,
        BridgeError::KeyHandleInvalid(_) => CKR_KEY_HANDLE_INVALID,
        BridgeError::KeyTypeInconsistent => CKR_KEY_TYPE_INCONSISTENT,
        BridgeError::KeyFunctionNotPermitted => CKR_KEY_FUNCTION_NOT_PERMITTED,
        BridgeError::MechanismInvalid => CKR_MECHANISM_INVALID,
        BridgeError::MechanismParamInvalid => CKR_MECHANISM_PARAM_INVALID,
        BridgeError::DataLenRange => CKR_DATA_LEN_RANGE,
        BridgeError::OperationActive => CKR_OPERATION_ACTIVE,
        BridgeError::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
        BridgeError::BufferTooSmall(_) => CKR_BUFFER_TOO_SMALL,
        BridgeError::AttributeTypeInvalid => CKR_ATTRIBUTE_TYPE_INVALID,
        BridgeError::SignatureInvalid => CKR_SIGNATURE_INVALID,
        BridgeError::PinIncorrect => CKR_PIN_INCORRECT,
        BridgeError::General(_) => CKR_GENERAL_ERROR,
        BridgeError::FunctionFailed(_) => CKR_FUNCTION_FAILED,
        BridgeError::FunctionNotSupported => CKR_FUNCTION_NOT_SUPPORTED,
    }
}

pub(crate) fn rv_from<T>(result: BridgeResult<T>) -> CK_RV {
    match result {
        Ok(_) => cryptoki_sys::CKR_OK,
        Err(err) => translate_error(&err),
    }
}
