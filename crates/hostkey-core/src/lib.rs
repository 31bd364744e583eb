//! HostKey core: the session and object engine behind the PKCS#11
//! surface. Tracks slots, tokens, sessions, objects, and in-flight
//! operations over a host keystore abstraction; the C ABI lives in the
//! `hostkey-pkcs11` crate and calls exclusively into this one.

pub mod attribute;
pub mod bridge;
pub mod certscan;
pub mod config;
pub mod digest;
pub mod error;
pub mod host;
pub mod identity;
pub mod mechanism;
pub mod object;
pub mod session;
pub mod soft;
pub mod token;

#[cfg(test)]
mod tests;

pub use attribute::{Attribute, TemplateAttribute};
pub use bridge::{
    AttrOutcome, AttributeQuery, Bridge, CryptoOutput, SessionDescription, SlotDescription,
    TokenDescription,
};
pub use config::{BridgeConfig, FilePreferences, MemoryPreferences, Preferences};
pub use error::{BridgeError, BridgeResult};
pub use host::{
    CertificateInfo, CertificateRecord, HashAlg, HostAlgorithm, HostError, HostKey, HostKeystore,
    HostResult, IdentityRecord, LocalAuthContext, ResolvedIdentity, TokenEventSink, TokenId,
    TokenWatcher,
};
pub use mechanism::{MechanismParams, MechanismRequest, MechanismSpec, ParameterKind, MECHANISMS};
pub use token::CERTIFICATE_SLOT;
