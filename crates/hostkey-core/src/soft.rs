//! In-memory host keystore for tests and development builds.
//!
//! `SoftKeystore` stands in for the platform: it holds RSA-backed
//! identities grouped into tokens, a set of trusted certificates for the
//! scanner, a PIN-checking local-auth context, and a watcher that replays
//! insertion events for tokens already present when it starts.
//!
//! Certificate blobs handed out by the soft store are not real DER; the
//! engine treats certificate data as opaque and routes all parsing back
//! through [`HostKeystore::certificate_info`], so the soft store uses a
//! simple length-prefixed encoding of the fields it needs to return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use tracing::debug;
use uuid::Uuid;

use crate::digest::digest;
use crate::host::{
    host_key_type, AccessControlRef, CertificateInfo, CertificateRecord, HashAlg, HostAlgorithm,
    HostError, HostKey, HostKeystore, HostResult, IdentityRecord, KeyUsageIntent,
    LocalAuthContext, PublicKeyCapabilities, ResolvedIdentity, TokenEventSink, TokenId,
    TokenWatcher,
};

const CERT_MAGIC: &[u8] = b"SOFTCERT1";

/// A certificate fixture: opaque blob plus the parsed fields the host
/// would extract from real DER.
#[derive(Clone)]
pub struct SoftCertificate {
    der: Vec<u8>,
    info: CertificateInfo,
    public_key_hash: Vec<u8>,
    hardware: bool,
}

impl SoftCertificate {
    fn build(common_name: &str, issuer_cn: &str, is_ca: bool, public_key_hash: Vec<u8>) -> Self {
        let info = CertificateInfo {
            subject: format!("CN={common_name}").into_bytes(),
            issuer: format!("CN={issuer_cn}").into_bytes(),
            serial_number: digest(HashAlg::Sha1, common_name.as_bytes())[..8].to_vec(),
            common_name: Some(common_name.to_string()),
            subject_summary: common_name.to_string(),
            is_ca,
        };
        let der = encode_cert(&info);
        Self { der, info, public_key_hash, hardware: false }
    }

    /// A self-signed certificate authority.
    pub fn authority(common_name: &str) -> Self {
        let hash = digest(HashAlg::Sha1, common_name.as_bytes());
        Self::build(common_name, common_name, true, hash)
    }

    /// An end-entity certificate issued by the named authority.
    pub fn issued_by(common_name: &str, issuer_cn: &str) -> Self {
        let hash = digest(HashAlg::Sha1, common_name.as_bytes());
        Self::build(common_name, issuer_cn, false, hash)
    }

    /// Mark an issued certificate as itself being a CA.
    pub fn as_authority(mut self) -> Self {
        self.info.is_ca = true;
        self.der = encode_cert(&self.info);
        self
    }

    /// Mark the certificate as living on a hardware token, which excludes
    /// it from the certificate scan.
    pub fn on_hardware_token(mut self) -> Self {
        self.hardware = true;
        self
    }

    fn for_identity(common_name: &str, public_key_hash: Vec<u8>) -> Self {
        Self::build(common_name, common_name, false, public_key_hash)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

fn push_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

fn encode_cert(info: &CertificateInfo) -> Vec<u8> {
    let mut out = CERT_MAGIC.to_vec();
    push_field(&mut out, &info.subject);
    push_field(&mut out, &info.issuer);
    push_field(&mut out, &info.serial_number);
    push_field(
        &mut out,
        info.common_name.as_deref().unwrap_or_default().as_bytes(),
    );
    push_field(&mut out, info.subject_summary.as_bytes());
    out.push(u8::from(info.is_ca));
    out
}

fn read_field<'a>(data: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (len, rest) = data.split_first_chunk::<4>()?;
    let len = u32::from_be_bytes(*len) as usize;
    if rest.len() < len {
        return None;
    }
    let (field, rest) = rest.split_at(len);
    *data = rest;
    Some(field)
}

fn decode_cert(der: &[u8]) -> Option<CertificateInfo> {
    let mut data = der.strip_prefix(CERT_MAGIC)?;
    let subject = read_field(&mut data)?.to_vec();
    let issuer = read_field(&mut data)?.to_vec();
    let serial_number = read_field(&mut data)?.to_vec();
    let common_name = read_field(&mut data)?;
    let common_name = if common_name.is_empty() {
        None
    } else {
        Some(String::from_utf8(common_name.to_vec()).ok()?)
    };
    let subject_summary = String::from_utf8(read_field(&mut data)?.to_vec()).ok()?;
    let is_ca = *data.first()? != 0;
    Some(CertificateInfo { subject, issuer, serial_number, common_name, subject_summary, is_ca })
}

/// An RSA key handle. The public half carries no private key; asking it
/// for a private-key operation is an algorithm error, like the platform
/// would report.
pub struct SoftRsaKey {
    private: Option<RsaPrivateKey>,
    public: RsaPublicKey,
    label: Option<String>,
}

impl SoftRsaKey {
    fn pkcs1_scheme(hash: HashAlg) -> Pkcs1v15Sign {
        match hash {
            HashAlg::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
            HashAlg::Sha224 => Pkcs1v15Sign::new::<Sha224>(),
            HashAlg::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            HashAlg::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            HashAlg::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }

    fn pss_scheme(hash: HashAlg) -> Pss {
        match hash {
            HashAlg::Sha1 => Pss::new::<Sha1>(),
            HashAlg::Sha224 => Pss::new::<Sha224>(),
            HashAlg::Sha256 => Pss::new::<Sha256>(),
            HashAlg::Sha384 => Pss::new::<Sha384>(),
            HashAlg::Sha512 => Pss::new::<Sha512>(),
        }
    }

    fn oaep_scheme(hash: HashAlg) -> Oaep {
        match hash {
            HashAlg::Sha1 => Oaep::new::<Sha1>(),
            HashAlg::Sha224 => Oaep::new::<Sha224>(),
            HashAlg::Sha256 => Oaep::new::<Sha256>(),
            HashAlg::Sha384 => Oaep::new::<Sha384>(),
            HashAlg::Sha512 => Oaep::new::<Sha512>(),
        }
    }

    fn private(&self) -> HostResult<&RsaPrivateKey> {
        self.private.as_ref().ok_or(HostError::UnsupportedAlgorithm)
    }
}

impl HostKey for SoftRsaKey {
    fn block_size(&self) -> usize {
        self.public.size()
    }

    fn label(&self) -> Option<String> {
        self.label.clone()
    }

    fn sign(&self, algorithm: HostAlgorithm, data: &[u8]) -> HostResult<Vec<u8>> {
        let key = self.private()?;
        let mut rng = rand::thread_rng();
        match algorithm {
            HostAlgorithm::RsaPkcs1SignRaw => key
                .sign(Pkcs1v15Sign::new_unprefixed(), data)
                .map_err(HostError::failed),
            HostAlgorithm::RsaPkcs1SignMessage(hash) => key
                .sign(Self::pkcs1_scheme(hash), &digest(hash, data))
                .map_err(HostError::failed),
            HostAlgorithm::RsaPkcs1SignDigest(hash) => {
                key.sign(Self::pkcs1_scheme(hash), data).map_err(HostError::failed)
            }
            HostAlgorithm::RsaPssSignMessage(hash) => key
                .sign_with_rng(&mut rng, Self::pss_scheme(hash), &digest(hash, data))
                .map_err(HostError::failed),
            HostAlgorithm::RsaPssSignDigest(hash) => key
                .sign_with_rng(&mut rng, Self::pss_scheme(hash), data)
                .map_err(HostError::failed),
            _ => Err(HostError::UnsupportedAlgorithm),
        }
    }

    fn verify(&self, algorithm: HostAlgorithm, data: &[u8], signature: &[u8]) -> HostResult<()> {
        let result = match algorithm {
            HostAlgorithm::RsaPkcs1SignRaw => {
                self.public.verify(Pkcs1v15Sign::new_unprefixed(), data, signature)
            }
            HostAlgorithm::RsaPkcs1SignMessage(hash) => {
                self.public
                    .verify(Self::pkcs1_scheme(hash), &digest(hash, data), signature)
            }
            HostAlgorithm::RsaPkcs1SignDigest(hash) => {
                self.public.verify(Self::pkcs1_scheme(hash), data, signature)
            }
            HostAlgorithm::RsaPssSignMessage(hash) => {
                self.public
                    .verify(Self::pss_scheme(hash), &digest(hash, data), signature)
            }
            HostAlgorithm::RsaPssSignDigest(hash) => {
                self.public.verify(Self::pss_scheme(hash), data, signature)
            }
            _ => return Err(HostError::UnsupportedAlgorithm),
        };
        result.map_err(|_| HostError::SignatureInvalid)
    }

    fn encrypt(&self, algorithm: HostAlgorithm, data: &[u8]) -> HostResult<Vec<u8>> {
        let mut rng = rand::thread_rng();
        match algorithm {
            HostAlgorithm::RsaPkcs1Encrypt => self
                .public
                .encrypt(&mut rng, Pkcs1v15Encrypt, data)
                .map_err(HostError::failed),
            HostAlgorithm::RsaOaepEncrypt(hash) => self
                .public
                .encrypt(&mut rng, Self::oaep_scheme(hash), data)
                .map_err(HostError::failed),
            _ => Err(HostError::UnsupportedAlgorithm),
        }
    }

    fn decrypt(&self, algorithm: HostAlgorithm, data: &[u8]) -> HostResult<Vec<u8>> {
        let key = self.private()?;
        match algorithm {
            HostAlgorithm::RsaPkcs1Encrypt => {
                key.decrypt(Pkcs1v15Encrypt, data).map_err(HostError::failed)
            }
            HostAlgorithm::RsaOaepEncrypt(hash) => {
                key.decrypt(Self::oaep_scheme(hash), data).map_err(HostError::failed)
            }
            _ => Err(HostError::UnsupportedAlgorithm),
        }
    }

    fn external_representation(&self) -> HostResult<Vec<u8>> {
        self.public
            .to_pkcs1_der()
            .map(|der| der.into_vec())
            .map_err(HostError::failed)
    }
}

/// One identity fixture: an RSA key pair, its certificate, an optional
/// PIN, and the capability flags the host would report.
#[derive(Clone)]
pub struct SoftIdentity {
    persistent_ref: Vec<u8>,
    label: Option<String>,
    key_label: Option<String>,
    pin: Option<Vec<u8>>,
    private: RsaPrivateKey,
    certificate: SoftCertificate,
    can_sign: bool,
    can_decrypt: bool,
    can_verify: bool,
    can_encrypt: bool,
    can_wrap: bool,
}

impl SoftIdentity {
    /// Generate a fresh RSA identity. Key generation dominates test time,
    /// so callers pick the smallest size that exercises their case.
    pub fn generate(label: &str, bits: usize) -> Self {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits).expect("RSA key generation");
        Self::from_key(label, private)
    }

    /// Build an identity around an existing key, letting tests share one
    /// generated key across fixtures.
    pub fn from_key(label: &str, private: RsaPrivateKey) -> Self {
        let public_der = private
            .to_public_key()
            .to_pkcs1_der()
            .expect("PKCS#1 encoding")
            .into_vec();
        let certificate =
            SoftCertificate::for_identity(label, digest(HashAlg::Sha1, &public_der));
        Self {
            persistent_ref: Uuid::new_v4().as_bytes().to_vec(),
            label: Some(label.to_string()),
            key_label: Some(format!("{label} (key)")),
            pin: None,
            private,
            certificate,
            can_sign: true,
            can_decrypt: true,
            can_verify: true,
            can_encrypt: true,
            can_wrap: false,
        }
    }

    pub fn with_pin(mut self, pin: &[u8]) -> Self {
        self.pin = Some(pin.to_vec());
        self
    }

    pub fn without_label(mut self) -> Self {
        self.label = None;
        self
    }

    pub fn signing_only(mut self) -> Self {
        self.can_decrypt = false;
        self.can_encrypt = false;
        self
    }

    pub fn wrap_only(mut self) -> Self {
        self.can_encrypt = false;
        self.can_wrap = true;
        self
    }

    fn public_key_hash(&self) -> Vec<u8> {
        self.certificate.public_key_hash.clone()
    }
}

/// A token fixture: an identifier plus its identities.
pub struct SoftToken {
    id: TokenId,
    identities: Vec<SoftIdentity>,
}

impl SoftToken {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self { id: TokenId::new(id.into()), identities: Vec::new() }
    }

    pub fn with_identity(mut self, identity: SoftIdentity) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn id(&self) -> &TokenId {
        &self.id
    }
}

#[derive(Default)]
struct Inner {
    tokens: Vec<SoftToken>,
    trusted: Vec<SoftCertificate>,
}

/// The in-memory keystore. Doubles as its own token watcher: starting the
/// watcher replays insertion events for tokens already present, the way
/// the platform watcher announces current tokens at registration.
pub struct SoftKeystore {
    inner: Mutex<Inner>,
    sink: Mutex<Option<Arc<dyn TokenEventSink>>>,
    weak: Weak<SoftKeystore>,
}

impl SoftKeystore {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(Inner::default()),
            sink: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub fn add_trusted_certificate(&self, certificate: SoftCertificate) {
        self.inner.lock().trusted.push(certificate);
    }

    /// Add a token and deliver the insertion event.
    pub fn insert_token(&self, token: SoftToken) {
        let id = token.id.clone();
        self.inner.lock().tokens.push(token);
        if let Some(sink) = self.sink.lock().clone() {
            sink.token_added(id);
        }
    }

    /// Remove a token and deliver the removal event.
    pub fn remove_token(&self, id: &TokenId) {
        let mut inner = self.inner.lock();
        inner.tokens.retain(|token| token.id != *id);
        drop(inner);
        if let Some(sink) = self.sink.lock().clone() {
            sink.token_removed(id.clone());
        }
    }

    fn with_identity<T>(
        &self,
        persistent_ref: &[u8],
        f: impl FnOnce(&SoftIdentity) -> T,
    ) -> HostResult<T> {
        let inner = self.inner.lock();
        inner
            .tokens
            .iter()
            .flat_map(|token| token.identities.iter())
            .find(|identity| identity.persistent_ref == persistent_ref)
            .map(f)
            .ok_or(HostError::NotFound)
    }
}

impl HostKeystore for SoftKeystore {
    fn find_identities(&self, token: &TokenId) -> HostResult<Vec<IdentityRecord>> {
        let inner = self.inner.lock();
        let token = inner
            .tokens
            .iter()
            .find(|candidate| candidate.id == *token)
            .ok_or(HostError::NotFound)?;
        Ok(token
            .identities
            .iter()
            .map(|identity| IdentityRecord {
                persistent_ref: identity.persistent_ref.clone(),
                label: identity.label.clone(),
                key_type: host_key_type::RSA,
                public_key_hash: identity.public_key_hash(),
                can_sign: identity.can_sign,
                can_decrypt: identity.can_decrypt,
            })
            .collect())
    }

    fn resolve_identity(
        &self,
        persistent_ref: &[u8],
        _auth: Option<&Arc<dyn LocalAuthContext>>,
    ) -> HostResult<ResolvedIdentity> {
        self.with_identity(persistent_ref, |identity| {
            let public = identity.private.to_public_key();
            ResolvedIdentity {
                certificate_der: identity.certificate.der.clone(),
                private_key: Arc::new(SoftRsaKey {
                    private: Some(identity.private.clone()),
                    public: public.clone(),
                    label: identity.key_label.clone(),
                }),
                public_key: Arc::new(SoftRsaKey {
                    private: None,
                    public,
                    label: None,
                }),
                public_key_caps: PublicKeyCapabilities {
                    can_verify: identity.can_verify,
                    can_encrypt: identity.can_encrypt,
                    can_wrap: identity.can_wrap,
                },
                access_control: AccessControlRef(identity.persistent_ref.clone()),
            }
        })
    }

    fn new_auth_context(&self) -> Option<Arc<dyn LocalAuthContext>> {
        let store = self.weak.upgrade()?;
        Some(Arc::new(SoftAuthContext { store, valid: AtomicBool::new(true) }))
    }

    fn trusted_certificates(&self) -> HostResult<Vec<CertificateRecord>> {
        Ok(self
            .inner
            .lock()
            .trusted
            .iter()
            .map(|certificate| CertificateRecord {
                der: certificate.der.clone(),
                public_key_hash: certificate.public_key_hash.clone(),
                on_hardware_token: certificate.hardware,
            })
            .collect())
    }

    fn certificate_info(&self, der: &[u8]) -> HostResult<CertificateInfo> {
        decode_cert(der).ok_or_else(|| HostError::failed("malformed certificate blob"))
    }

    fn watcher(&self) -> Option<Arc<dyn TokenWatcher>> {
        self.weak.upgrade().map(|store| store as Arc<dyn TokenWatcher>)
    }
}

impl TokenWatcher for SoftKeystore {
    fn start(&self, sink: Arc<dyn TokenEventSink>) {
        let current: Vec<TokenId> = {
            let inner = self.inner.lock();
            inner.tokens.iter().map(|token| token.id.clone()).collect()
        };
        *self.sink.lock() = Some(Arc::clone(&sink));
        for id in current {
            debug!(token = %id, "replaying insertion for existing token");
            sink.token_added(id);
        }
    }

    fn stop(&self) {
        *self.sink.lock() = None;
    }
}

struct SoftAuthContext {
    store: Arc<SoftKeystore>,
    valid: AtomicBool,
}

impl LocalAuthContext for SoftAuthContext {
    fn authenticate(
        &self,
        pin: &[u8],
        access: &AccessControlRef,
        _usage: KeyUsageIntent,
    ) -> HostResult<()> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(HostError::AccessDenied);
        }
        self.store.with_identity(&access.0, |identity| match &identity.pin {
            Some(expected) if expected.as_slice() == pin => Ok(()),
            Some(_) => Err(HostError::AccessDenied),
            None => Ok(()),
        })?
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}
