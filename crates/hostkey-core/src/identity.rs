//! Identity loading: materializing certificate/key handles and capability
//! flags for every identity the host reports on a token.

use std::sync::Arc;

use cryptoki_sys::CK_KEY_TYPE;
use tracing::{debug, warn};

use crate::host::{
    convert_key_type, AccessControlRef, CertificateInfo, HostKey, HostKeystore, LocalAuthContext,
    TokenId,
};

const DEFAULT_LABEL: &str = "Hardware token";

/// One identity on a hardware token: a certificate plus the key pair
/// backing it, with the capability flags the host reported.
pub struct Identity {
    pub label: String,
    pub key_type: CK_KEY_TYPE,
    pub public_key_hash: Vec<u8>,
    pub certificate_der: Vec<u8>,
    pub certificate: CertificateInfo,
    pub private_key: Arc<dyn HostKey>,
    pub public_key: Arc<dyn HostKey>,
    pub access_control: AccessControlRef,
    pub can_sign: bool,
    pub can_decrypt: bool,
    pub can_verify: bool,
    pub can_encrypt: bool,
}

/// Query the host for every identity carrying this token identifier and
/// resolve each into strong handles bound to the token's auth context.
///
/// A failure in any single identity drops that identity but keeps the
/// rest, matching the behavior applications expect from a partially
/// readable card.
pub fn load_identities(
    keystore: &dyn HostKeystore,
    token: &TokenId,
    auth: Option<&Arc<dyn LocalAuthContext>>,
) -> Vec<Arc<Identity>> {
    let records = match keystore.find_identities(token) {
        Ok(records) => records,
        Err(err) => {
            warn!(%token, %err, "identity query failed");
            return Vec::new();
        }
    };

    debug!(%token, count = records.len(), "identities found");

    let mut identities = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let resolved = match keystore.resolve_identity(&record.persistent_ref, auth) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(%token, index, %err, "resolving identity failed, dropping it");
                continue;
            }
        };
        let certificate = match keystore.certificate_info(&resolved.certificate_der) {
            Ok(info) => info,
            Err(err) => {
                warn!(%token, index, %err, "certificate unparseable, dropping identity");
                continue;
            }
        };

        let label = record.label.unwrap_or_else(|| {
            debug!(index, "identity has no label, using default");
            DEFAULT_LABEL.to_string()
        });

        // A key that may wrap may also do generic encryption.
        let can_encrypt = resolved.public_key_caps.can_encrypt || resolved.public_key_caps.can_wrap;

        identities.push(Arc::new(Identity {
            label,
            key_type: convert_key_type(record.key_type),
            public_key_hash: record.public_key_hash,
            certificate_der: resolved.certificate_der,
            certificate,
            private_key: resolved.private_key,
            public_key: resolved.public_key,
            access_control: resolved.access_control,
            can_sign: record.can_sign,
            can_decrypt: record.can_decrypt,
            can_verify: resolved.public_key_caps.can_verify,
            can_encrypt,
        }));
    }

    identities
}
