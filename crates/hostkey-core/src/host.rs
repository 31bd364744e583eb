//! Trait seams for the host platform's identity/key store.
//!
//! The engine never talks to platform APIs directly; everything it needs
//! from the host (identity queries, key primitives, local authentication,
//! certificate parsing, token insertion/removal events) comes through the
//! traits in this module. The bundled [`crate::soft`] keystore implements
//! them in memory for tests and development builds.

use std::fmt;
use std::sync::Arc;

use cryptoki_sys::{CKK_ECDSA, CKK_RSA, CKK_VENDOR_DEFINED, CK_KEY_TYPE};
use thiserror::Error;

pub type HostResult<T> = Result<T, HostError>;

/// Failures reported by the host keystore.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("item not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("algorithm not supported by this key")]
    UnsupportedAlgorithm,
    #[error("{0}")]
    Failed(String),
}

impl HostError {
    pub fn failed<E: fmt::Display>(err: E) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Opaque token identifier delivered by the insertion watcher. The engine
/// only ever compares these for equality.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenId(Vec<u8>);

impl TokenId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Hash algorithms the host digest primitive understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

/// Concrete algorithm identifiers exposed by the host crypto framework.
///
/// The "message" variants hash internally; the "digest" variants expect the
/// caller to supply the already-computed digest (used by the multi-part
/// sign/verify paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAlgorithm {
    RsaPkcs1Encrypt,
    RsaOaepEncrypt(HashAlg),
    /// PKCS#1 v1.5 over caller-supplied data (DigestInfo included by the
    /// caller), the CKM_RSA_PKCS signing convention.
    RsaPkcs1SignRaw,
    RsaPkcs1SignMessage(HashAlg),
    RsaPkcs1SignDigest(HashAlg),
    RsaPssSignMessage(HashAlg),
    RsaPssSignDigest(HashAlg),
}

/// Which private-key capability a PIN presentation is meant to unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsageIntent {
    Sign,
    Decrypt,
}

/// Opaque reference to the host's access-control object for a private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessControlRef(pub Vec<u8>);

/// Numeric key types as reported by the host keystore (CSSM algorithm
/// numbers on the original platform).
pub mod host_key_type {
    pub const RSA: u32 = 42;
    pub const DSA: u32 = 43;
    pub const ECDSA: u32 = 73;
}

/// Map the host's numeric key type onto the Cryptoki key type, defaulting
/// to vendor-defined for anything we do not recognize.
pub fn convert_key_type(host_type: u32) -> CK_KEY_TYPE {
    match host_type {
        host_key_type::RSA => CKK_RSA,
        host_key_type::DSA => cryptoki_sys::CKK_DSA,
        host_key_type::ECDSA => CKK_ECDSA,
        other => {
            tracing::debug!(host_type = other, "unknown host key type, reporting vendor-defined");
            CKK_VENDOR_DEFINED
        }
    }
}

/// One record from the host's "identities in the token access group"
/// query: the persistent reference plus the attributes we care about.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub persistent_ref: Vec<u8>,
    pub label: Option<String>,
    pub key_type: u32,
    pub public_key_hash: Vec<u8>,
    pub can_sign: bool,
    pub can_decrypt: bool,
}

/// Capability flags of a public key, as reported by the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicKeyCapabilities {
    pub can_verify: bool,
    pub can_encrypt: bool,
    pub can_wrap: bool,
}

/// The strong identity handle obtained by re-querying the host with a
/// persistent reference (and, when available, a local-auth context).
pub struct ResolvedIdentity {
    pub certificate_der: Vec<u8>,
    pub private_key: Arc<dyn HostKey>,
    pub public_key: Arc<dyn HostKey>,
    pub public_key_caps: PublicKeyCapabilities,
    pub access_control: AccessControlRef,
}

/// Fields the host's certificate-parsing helpers extract from DER.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: Vec<u8>,
    pub issuer: Vec<u8>,
    pub serial_number: Vec<u8>,
    pub common_name: Option<String>,
    /// Human-readable subject summary, used for token labels.
    pub subject_summary: String,
    pub is_ca: bool,
}

/// One trusted certificate from the host store, as seen by the scanner.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub der: Vec<u8>,
    pub public_key_hash: Vec<u8>,
    /// True when the certificate lives on a hardware token; those are
    /// excluded from the certificate slot.
    pub on_hardware_token: bool,
}

/// An opaque key handle. Cloning the `Arc` is the "extra reference held
/// for an in-flight operation" of the protocol; the host key stays alive
/// for as long as any operation or identity refers to it.
pub trait HostKey: Send + Sync {
    /// Key block size in bytes (the modulus size for RSA).
    fn block_size(&self) -> usize;

    /// The host's printable label for this key, if it has one.
    fn label(&self) -> Option<String>;

    fn sign(&self, algorithm: HostAlgorithm, data: &[u8]) -> HostResult<Vec<u8>>;

    fn verify(&self, algorithm: HostAlgorithm, data: &[u8], signature: &[u8]) -> HostResult<()>;

    fn encrypt(&self, algorithm: HostAlgorithm, data: &[u8]) -> HostResult<Vec<u8>>;

    fn decrypt(&self, algorithm: HostAlgorithm, data: &[u8]) -> HostResult<Vec<u8>>;

    /// The host's external representation of the key. For RSA public keys
    /// this is the PKCS#1 `RSAPublicKey` encoding, which the object builder
    /// parses for the modulus/exponent attributes.
    fn external_representation(&self) -> HostResult<Vec<u8>>;
}

/// Host-level object binding a credential to an identity for subsequent
/// private-key use.
pub trait LocalAuthContext: Send + Sync {
    fn authenticate(
        &self,
        pin: &[u8],
        access: &AccessControlRef,
        usage: KeyUsageIntent,
    ) -> HostResult<()>;

    /// Drop the stored credential.
    fn invalidate(&self);
}

/// The host identity/key query interface.
pub trait HostKeystore: Send + Sync {
    /// All identities in the token access group carrying this token
    /// identifier, with persistent references and attribute records.
    fn find_identities(&self, token: &TokenId) -> HostResult<Vec<IdentityRecord>>;

    /// Exchange a persistent reference for the strong identity handle,
    /// binding the given local-auth context when one is supplied.
    fn resolve_identity(
        &self,
        persistent_ref: &[u8],
        auth: Option<&Arc<dyn LocalAuthContext>>,
    ) -> HostResult<ResolvedIdentity>;

    /// Allocate a local-authentication context. May return `None`; the
    /// token then simply cannot take PINs through this API.
    fn new_auth_context(&self) -> Option<Arc<dyn LocalAuthContext>>;

    /// All trusted certificates, for the certificate scan.
    fn trusted_certificates(&self) -> HostResult<Vec<CertificateRecord>>;

    /// Parse certificate DER into the fields the object builder needs.
    fn certificate_info(&self, der: &[u8]) -> HostResult<CertificateInfo>;

    /// The token insertion/removal notification source, when the host
    /// provides one.
    fn watcher(&self) -> Option<Arc<dyn TokenWatcher>>;
}

/// Receiver for token insertion/removal events.
pub trait TokenEventSink: Send + Sync {
    fn token_added(&self, token: TokenId);
    fn token_removed(&self, token: TokenId);
}

/// The asynchronous notification source. `stop` must guarantee that no
/// further sink callbacks are delivered once it returns.
pub trait TokenWatcher: Send + Sync {
    fn start(&self, sink: Arc<dyn TokenEventSink>);
    fn stop(&self);
}
