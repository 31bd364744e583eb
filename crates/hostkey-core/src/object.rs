//! Object construction: the per-token object lists exposed through the
//! object handle namespace.
//!
//! Hardware tokens get three objects per identity (certificate, public
//! key, private key, in that order) sharing one `CKA_ID`. The certificate
//! slot gets a certificate plus an NSS trust record per scanned
//! certificate.

use std::sync::Arc;

use cryptoki_sys::{
    CKA_ALWAYS_AUTHENTICATE, CKA_ALWAYS_SENSITIVE, CKA_CERTIFICATE_TYPE, CKA_CLASS, CKA_DECRYPT,
    CKA_DERIVE, CKA_ENCRYPT, CKA_EXTRACTABLE, CKA_ID, CKA_ISSUER, CKA_KEY_TYPE, CKA_LABEL,
    CKA_LOCAL, CKA_MODULUS, CKA_MODULUS_BITS, CKA_NEVER_EXTRACTABLE, CKA_PRIVATE,
    CKA_PUBLIC_EXPONENT, CKA_SENSITIVE, CKA_SERIAL_NUMBER, CKA_SIGN, CKA_SUBJECT, CKA_TOKEN,
    CKA_UNWRAP, CKA_VALUE, CKA_VERIFY, CKA_WRAP, CKC_X_509, CKO_CERTIFICATE, CKO_PRIVATE_KEY,
    CKO_PUBLIC_KEY, CK_ATTRIBUTE_TYPE, CK_OBJECT_CLASS, CK_ULONG,
};
use pkcs1::der::Decode;
use tracing::{debug, warn};

use crate::attribute::Attribute;
use crate::digest::digest;
use crate::host::{CertificateRecord, HashAlg, HostKeystore};
use crate::identity::Identity;

/// NSS vendor definitions for the trust records the certificate slot
/// publishes (pkcs11n.h values; NSS consumers expect exactly these).
pub const CKO_NSS_TRUST: CK_OBJECT_CLASS = 0xCE53_4353;
pub const CKA_TRUST_SERVER_AUTH: CK_ATTRIBUTE_TYPE = 0xCE53_6358;
pub const CKA_TRUST_CLIENT_AUTH: CK_ATTRIBUTE_TYPE = 0xCE53_6359;
pub const CKA_TRUST_CODE_SIGNING: CK_ATTRIBUTE_TYPE = 0xCE53_635A;
pub const CKA_TRUST_EMAIL_PROTECTION: CK_ATTRIBUTE_TYPE = 0xCE53_635B;
pub const CKA_CERT_SHA1_HASH: CK_ATTRIBUTE_TYPE = 0xCE53_63B4;
pub const CKT_NSS_TRUSTED_DELEGATOR: CK_ULONG = 0xCE53_4352;

/// A typed, attribute-bearing entry in a token's object list. Handles are
/// 1-based indices into that list and stay stable for the token's
/// lifetime.
pub struct Object {
    /// Owning identity; absent for certificate-slot objects, which cannot
    /// perform crypto.
    pub identity: Option<Arc<Identity>>,
    pub class: CK_OBJECT_CLASS,
    pub attributes: Vec<Attribute>,
}

/// Minimum-length big-endian encoding of a 0-based object index, shared as
/// `CKA_ID` by all objects of one identity. The low byte is always
/// included, so index 0 encodes as `[0x00]`.
pub fn index_bytes(index: usize) -> Vec<u8> {
    let bytes = index.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

/// Build the object list for a hardware token from its identities.
pub fn build_identity_objects(identities: &[Arc<Identity>]) -> Vec<Object> {
    let mut objects = Vec::with_capacity(identities.len() * 3);

    for (index, identity) in identities.iter().enumerate() {
        let id = index_bytes(index);
        let cert = &identity.certificate;

        objects.push(Object {
            identity: Some(Arc::clone(identity)),
            class: CKO_CERTIFICATE,
            attributes: vec![
                Attribute::ulong(CKA_CLASS, CKO_CERTIFICATE),
                Attribute::bytes(CKA_ID, id.clone()),
                Attribute::ulong(CKA_CERTIFICATE_TYPE, CKC_X_509),
                Attribute::bool(CKA_TOKEN, true),
                Attribute::label(CKA_LABEL, &identity.label),
                Attribute::bytes(CKA_VALUE, identity.certificate_der.clone()),
                Attribute::bytes(CKA_SUBJECT, cert.subject.clone()),
                Attribute::bytes(CKA_ISSUER, cert.issuer.clone()),
                Attribute::bytes(CKA_SERIAL_NUMBER, cert.serial_number.clone()),
            ],
        });

        let rsa = rsa_components(identity);

        let mut attrs = vec![
            Attribute::ulong(CKA_CLASS, CKO_PUBLIC_KEY),
            Attribute::bytes(CKA_ID, id.clone()),
            Attribute::ulong(CKA_KEY_TYPE, identity.key_type),
            Attribute::bool(CKA_TOKEN, true),
            Attribute::bool(CKA_LOCAL, true),
            Attribute::bool(CKA_ENCRYPT, identity.can_encrypt),
            Attribute::bool(CKA_VERIFY, identity.can_verify),
            Attribute::bytes(CKA_SUBJECT, cert.subject.clone()),
            // Public halves of identities come without their own label;
            // they inherit the identity label.
            Attribute::label(CKA_LABEL, &identity.label),
            Attribute::ulong(CKA_MODULUS_BITS, (identity.public_key.block_size() * 8) as CK_ULONG),
        ];
        if let Some((modulus, exponent)) = &rsa {
            attrs.push(Attribute::bytes(CKA_MODULUS, modulus.clone()));
            attrs.push(Attribute::bytes(CKA_PUBLIC_EXPONENT, exponent.clone()));
        }
        attrs.push(Attribute::bool(CKA_WRAP, false));
        attrs.push(Attribute::bool(CKA_DERIVE, false));
        objects.push(Object {
            identity: Some(Arc::clone(identity)),
            class: CKO_PUBLIC_KEY,
            attributes: attrs,
        });

        let key_label = identity
            .private_key
            .label()
            .unwrap_or_else(|| "Unknown key".to_string());

        let mut attrs = vec![
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::bytes(CKA_ID, id),
            Attribute::ulong(CKA_KEY_TYPE, identity.key_type),
            Attribute::bool(CKA_TOKEN, true),
            Attribute::bool(CKA_PRIVATE, true),
            Attribute::bool(CKA_DECRYPT, identity.can_decrypt),
            Attribute::bool(CKA_SIGN, identity.can_sign),
            Attribute::bytes(CKA_SUBJECT, cert.subject.clone()),
            Attribute::label(CKA_LABEL, &key_label),
        ];
        if let Some((modulus, exponent)) = rsa {
            attrs.push(Attribute::bytes(CKA_MODULUS, modulus));
            attrs.push(Attribute::bytes(CKA_PUBLIC_EXPONENT, exponent));
        }
        attrs.push(Attribute::bool(CKA_SENSITIVE, true));
        attrs.push(Attribute::bool(CKA_ALWAYS_SENSITIVE, true));
        attrs.push(Attribute::bool(CKA_NEVER_EXTRACTABLE, true));
        attrs.push(Attribute::bool(CKA_LOCAL, true));
        attrs.push(Attribute::bool(CKA_ALWAYS_AUTHENTICATE, false));
        attrs.push(Attribute::bool(CKA_UNWRAP, false));
        attrs.push(Attribute::bool(CKA_DERIVE, false));
        attrs.push(Attribute::bool(CKA_EXTRACTABLE, false));
        objects.push(Object {
            identity: Some(Arc::clone(identity)),
            class: CKO_PRIVATE_KEY,
            attributes: attrs,
        });
    }

    objects
}

/// Modulus and public exponent, pulled out of the host's external
/// representation of the public key (PKCS#1 `RSAPublicKey`). Keys whose
/// representation is unavailable or not RSA simply go without these
/// attributes.
fn rsa_components(identity: &Identity) -> Option<(Vec<u8>, Vec<u8>)> {
    let der = match identity.public_key.external_representation() {
        Ok(der) => der,
        Err(err) => {
            debug!(%err, "no external representation for public key");
            return None;
        }
    };
    match pkcs1::RsaPublicKey::from_der(&der) {
        Ok(key) => Some((
            key.modulus.as_bytes().to_vec(),
            key.public_exponent.as_bytes().to_vec(),
        )),
        Err(err) => {
            debug!(%err, "external representation is not an RSA public key");
            None
        }
    }
}

/// Build the certificate-slot object list: a certificate and an NSS trust
/// record per scanned certificate.
pub fn build_certificate_objects(
    keystore: &dyn HostKeystore,
    records: &[CertificateRecord],
) -> Vec<Object> {
    let mut objects = Vec::with_capacity(records.len() * 2);

    for (index, record) in records.iter().enumerate() {
        let info = match keystore.certificate_info(&record.der) {
            Ok(info) => info,
            Err(err) => {
                warn!(index, %err, "scanned certificate unparseable, skipping");
                continue;
            }
        };
        let id = index_bytes(index);
        let sha1 = digest(HashAlg::Sha1, &record.der);

        objects.push(Object {
            identity: None,
            class: CKO_CERTIFICATE,
            attributes: vec![
                Attribute::ulong(CKA_CLASS, CKO_CERTIFICATE),
                Attribute::bytes(CKA_ID, id),
                Attribute::ulong(CKA_CERTIFICATE_TYPE, CKC_X_509),
                Attribute::bool(CKA_TOKEN, true),
                Attribute::label(CKA_LABEL, &info.subject_summary),
                Attribute::bytes(CKA_VALUE, record.der.clone()),
                Attribute::bytes(CKA_SUBJECT, info.subject.clone()),
                Attribute::bytes(CKA_ISSUER, info.issuer.clone()),
                Attribute::bytes(CKA_SERIAL_NUMBER, info.serial_number.clone()),
            ],
        });

        let mut attrs = vec![
            Attribute::ulong(CKA_CLASS, CKO_NSS_TRUST),
            Attribute::bool(CKA_TOKEN, true),
            Attribute::bytes(CKA_ISSUER, info.issuer),
            Attribute::bytes(CKA_SERIAL_NUMBER, info.serial_number),
            Attribute::bytes(CKA_CERT_SHA1_HASH, sha1),
        ];
        if info.is_ca {
            for kind in [
                CKA_TRUST_SERVER_AUTH,
                CKA_TRUST_CLIENT_AUTH,
                CKA_TRUST_EMAIL_PROTECTION,
                CKA_TRUST_CODE_SIGNING,
            ] {
                attrs.push(Attribute::ulong(kind, CKT_NSS_TRUSTED_DELEGATOR));
            }
        }
        objects.push(Object { identity: None, class: CKO_NSS_TRUST, attributes: attrs });
    }

    objects
}
