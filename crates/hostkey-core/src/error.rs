use cryptoki_sys::{CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID};
use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the session/object engine. Each variant corresponds to
/// one Cryptoki return code; the translation itself lives in the ABI crate.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("library not initialized")]
    NotInitialized,
    #[error("library already initialized")]
    AlreadyInitialized,
    #[error("bad arguments")]
    ArgumentsBad,
    #[error("slot {0} is invalid")]
    SlotIdInvalid(CK_SLOT_ID),
    #[error("no token present in slot {0}")]
    TokenNotPresent(CK_SLOT_ID),
    #[error("session handle {0} is invalid")]
    SessionHandleInvalid(CK_SESSION_HANDLE),
    #[error("parallel sessions not supported")]
    ParallelNotSupported,
    #[error("object handle {0} is invalid")]
    ObjectHandleInvalid(CK_OBJECT_HANDLE),
    #[error("key handle {0} is invalid")]
    KeyHandleInvalid(CK_OBJECT_HANDLE),
    #[error("key type inconsistent with operation")]
    KeyTypeInconsistent,
    #[error("key does not permit this function")]
    KeyFunctionNotPermitted,
    #[error("mechanism invalid")]
    MechanismInvalid,
    #[error("mechanism parameters invalid")]
    MechanismParamInvalid,
    #[error("data length out of range")]
    DataLenRange,
    #[error("another operation is already active")]
    OperationActive,
    #[error("operation not initialized")]
    OperationNotInitialized,
    /// The required size is carried for the caller's length write-back;
    /// zero means the size is not known.
    #[error("buffer too small ({0} bytes required)")]
    BufferTooSmall(usize),
    #[error("attribute type invalid")]
    AttributeTypeInvalid,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("PIN incorrect")]
    PinIncorrect,
    #[error("general error: {0}")]
    General(String),
    #[error("function failed: {0}")]
    FunctionFailed(String),
    #[error("function not supported")]
    FunctionNotSupported,
}

impl BridgeError {
    pub fn general<E: std::fmt::Display>(err: E) -> Self {
        Self::General(err.to_string())
    }

    pub fn failed<E: std::fmt::Display>(err: E) -> Self {
        Self::FunctionFailed(err.to_string())
    }
}
