//! Static registry of supported mechanisms and the parameter validator
//! that maps a caller's mechanism + parameter block onto the host's
//! algorithm identifiers.
//!
//! The host framework does not let us set every OAEP/PSS knob, so the
//! validator works off a fixed table: a request either matches a row
//! exactly (and resolves to the row's algorithms) or is rejected with
//! mechanism-param-invalid.

use cryptoki_sys::{
    CKF_DECRYPT, CKF_ENCRYPT, CKF_HW, CKF_SIGN, CKF_VERIFY, CKG_MGF1_SHA1, CKG_MGF1_SHA224,
    CKG_MGF1_SHA256, CKG_MGF1_SHA384, CKG_MGF1_SHA512, CKM_RSA_PKCS, CKM_RSA_PKCS_OAEP,
    CKM_RSA_PKCS_PSS, CKM_SHA1_RSA_PKCS, CKM_SHA1_RSA_PKCS_PSS, CKM_SHA224, CKM_SHA256,
    CKM_SHA256_RSA_PKCS, CKM_SHA256_RSA_PKCS_PSS, CKM_SHA384, CKM_SHA384_RSA_PKCS,
    CKM_SHA384_RSA_PKCS_PSS, CKM_SHA512, CKM_SHA512_RSA_PKCS, CKM_SHA512_RSA_PKCS_PSS, CKM_SHA_1,
    CKZ_DATA_SPECIFIED, CK_FLAGS, CK_MECHANISM_TYPE, CK_RSA_PKCS_MGF_TYPE, CK_ULONG,
};

use crate::error::{BridgeError, BridgeResult};
use crate::host::{HashAlg, HostAlgorithm};

/// Parameter schema a mechanism expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    None,
    Oaep,
    Pss,
}

/// Mechanism parameters, already lifted out of the caller's raw pointer by
/// the ABI layer. `Unexpected` records that parameter bytes were supplied
/// to a mechanism that takes none.
#[derive(Debug, Clone, Copy)]
pub enum MechanismParams {
    None,
    Unexpected,
    Oaep {
        hash_alg: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        source: CK_ULONG,
        source_data_present: bool,
        source_data_len: CK_ULONG,
    },
    Pss {
        hash_alg: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        salt_len: CK_ULONG,
    },
}

/// A caller-supplied mechanism after ABI-level decoding.
#[derive(Debug, Clone, Copy)]
pub struct MechanismRequest {
    pub mechanism: CK_MECHANISM_TYPE,
    pub params: MechanismParams,
}

impl MechanismRequest {
    pub fn plain(mechanism: CK_MECHANISM_TYPE) -> Self {
        Self { mechanism, params: MechanismParams::None }
    }
}

/// Host algorithms and output sizing resolved for one operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvedAlgorithms {
    pub encrypt: Option<HostAlgorithm>,
    pub sign: Option<HostAlgorithm>,
    pub digest_sign: Option<HostAlgorithm>,
    pub digest: Option<HashAlg>,
}

/// One row of the mechanism registry.
pub struct MechanismSpec {
    pub mechanism: CK_MECHANISM_TYPE,
    pub min_key_bits: CK_ULONG,
    pub max_key_bits: CK_ULONG,
    pub flags: CK_FLAGS,
    pub parameters: ParameterKind,
    /// Whether the operation's output size equals the key block size,
    /// which drives the null-buffer size probe.
    pub blocksize_out: bool,
    encrypt: Option<HostAlgorithm>,
    sign: Option<HostAlgorithm>,
    digest_sign: Option<HostAlgorithm>,
    digest: Option<HashAlg>,
}

const RSA_MIN_BITS: CK_ULONG = 1024;
const RSA_MAX_BITS: CK_ULONG = 8192;

const fn plain(
    mechanism: CK_MECHANISM_TYPE,
    flags: CK_FLAGS,
    encrypt: Option<HostAlgorithm>,
    sign: Option<HostAlgorithm>,
    digest_sign: Option<HostAlgorithm>,
    digest: Option<HashAlg>,
) -> MechanismSpec {
    MechanismSpec {
        mechanism,
        min_key_bits: RSA_MIN_BITS,
        max_key_bits: RSA_MAX_BITS,
        flags: flags | CKF_HW,
        parameters: ParameterKind::None,
        blocksize_out: true,
        encrypt,
        sign,
        digest_sign,
        digest,
    }
}

const fn parameterized(
    mechanism: CK_MECHANISM_TYPE,
    flags: CK_FLAGS,
    parameters: ParameterKind,
) -> MechanismSpec {
    MechanismSpec {
        mechanism,
        min_key_bits: RSA_MIN_BITS,
        max_key_bits: RSA_MAX_BITS,
        flags: flags | CKF_HW,
        parameters,
        blocksize_out: true,
        encrypt: None,
        sign: None,
        digest_sign: None,
        digest: None,
    }
}

/// The registry, in Cryptoki numeric order.
pub static MECHANISMS: &[MechanismSpec] = &[
    plain(
        CKM_RSA_PKCS,
        CKF_ENCRYPT | CKF_DECRYPT | CKF_SIGN | CKF_VERIFY,
        Some(HostAlgorithm::RsaPkcs1Encrypt),
        Some(HostAlgorithm::RsaPkcs1SignRaw),
        // No digest-taking variant: CKM_RSA_PKCS cannot run multi-part.
        None,
        None,
    ),
    plain(
        CKM_SHA1_RSA_PKCS,
        CKF_SIGN | CKF_VERIFY,
        None,
        Some(HostAlgorithm::RsaPkcs1SignMessage(HashAlg::Sha1)),
        Some(HostAlgorithm::RsaPkcs1SignDigest(HashAlg::Sha1)),
        Some(HashAlg::Sha1),
    ),
    parameterized(CKM_RSA_PKCS_OAEP, CKF_ENCRYPT | CKF_DECRYPT, ParameterKind::Oaep),
    parameterized(CKM_RSA_PKCS_PSS, CKF_SIGN | CKF_VERIFY, ParameterKind::Pss),
    parameterized(CKM_SHA1_RSA_PKCS_PSS, CKF_SIGN | CKF_VERIFY, ParameterKind::Pss),
    plain(
        CKM_SHA256_RSA_PKCS,
        CKF_SIGN | CKF_VERIFY,
        None,
        Some(HostAlgorithm::RsaPkcs1SignMessage(HashAlg::Sha256)),
        Some(HostAlgorithm::RsaPkcs1SignDigest(HashAlg::Sha256)),
        Some(HashAlg::Sha256),
    ),
    plain(
        CKM_SHA384_RSA_PKCS,
        CKF_SIGN | CKF_VERIFY,
        None,
        Some(HostAlgorithm::RsaPkcs1SignMessage(HashAlg::Sha384)),
        Some(HostAlgorithm::RsaPkcs1SignDigest(HashAlg::Sha384)),
        Some(HashAlg::Sha384),
    ),
    plain(
        CKM_SHA512_RSA_PKCS,
        CKF_SIGN | CKF_VERIFY,
        None,
        Some(HostAlgorithm::RsaPkcs1SignMessage(HashAlg::Sha512)),
        Some(HostAlgorithm::RsaPkcs1SignDigest(HashAlg::Sha512)),
        Some(HashAlg::Sha512),
    ),
    parameterized(CKM_SHA256_RSA_PKCS_PSS, CKF_SIGN | CKF_VERIFY, ParameterKind::Pss),
    parameterized(CKM_SHA384_RSA_PKCS_PSS, CKF_SIGN | CKF_VERIFY, ParameterKind::Pss),
    parameterized(CKM_SHA512_RSA_PKCS_PSS, CKF_SIGN | CKF_VERIFY, ParameterKind::Pss),
];

/// One row of the OAEP/PSS parameter map. A request must match `base`,
/// `hash_alg`, `mgf` (and `salt_len` for PSS) exactly.
struct ParamMapEntry {
    base: CK_MECHANISM_TYPE,
    hash_alg: CK_MECHANISM_TYPE,
    mgf: CK_RSA_PKCS_MGF_TYPE,
    salt_len: Option<CK_ULONG>,
    resolved: ResolvedAlgorithms,
}

const fn oaep_row(hash_alg: CK_MECHANISM_TYPE, mgf: CK_RSA_PKCS_MGF_TYPE, hash: HashAlg) -> ParamMapEntry {
    ParamMapEntry {
        base: CKM_RSA_PKCS_OAEP,
        hash_alg,
        mgf,
        salt_len: None,
        resolved: ResolvedAlgorithms {
            encrypt: Some(HostAlgorithm::RsaOaepEncrypt(hash)),
            sign: None,
            digest_sign: None,
            digest: None,
        },
    }
}

/// CKM_RSA_PKCS_PSS takes the already-hashed data, so its single-shot
/// algorithm is the digest-taking variant and multi-part is unavailable.
const fn pss_raw_row(hash_alg: CK_MECHANISM_TYPE, mgf: CK_RSA_PKCS_MGF_TYPE, hash: HashAlg) -> ParamMapEntry {
    ParamMapEntry {
        base: CKM_RSA_PKCS_PSS,
        hash_alg,
        mgf,
        salt_len: Some(hash.digest_len() as CK_ULONG),
        resolved: ResolvedAlgorithms {
            encrypt: None,
            sign: Some(HostAlgorithm::RsaPssSignDigest(hash)),
            digest_sign: None,
            digest: None,
        },
    }
}

const fn pss_hash_row(
    base: CK_MECHANISM_TYPE,
    hash_alg: CK_MECHANISM_TYPE,
    mgf: CK_RSA_PKCS_MGF_TYPE,
    hash: HashAlg,
) -> ParamMapEntry {
    ParamMapEntry {
        base,
        hash_alg,
        mgf,
        salt_len: Some(hash.digest_len() as CK_ULONG),
        resolved: ResolvedAlgorithms {
            encrypt: None,
            sign: Some(HostAlgorithm::RsaPssSignMessage(hash)),
            digest_sign: Some(HostAlgorithm::RsaPssSignDigest(hash)),
            digest: Some(hash),
        },
    }
}

static PARAM_MAP: &[ParamMapEntry] = &[
    oaep_row(CKM_SHA_1, CKG_MGF1_SHA1, HashAlg::Sha1),
    oaep_row(CKM_SHA224, CKG_MGF1_SHA224, HashAlg::Sha224),
    oaep_row(CKM_SHA256, CKG_MGF1_SHA256, HashAlg::Sha256),
    oaep_row(CKM_SHA384, CKG_MGF1_SHA384, HashAlg::Sha384),
    oaep_row(CKM_SHA512, CKG_MGF1_SHA512, HashAlg::Sha512),
    pss_raw_row(CKM_SHA_1, CKG_MGF1_SHA1, HashAlg::Sha1),
    pss_raw_row(CKM_SHA256, CKG_MGF1_SHA256, HashAlg::Sha256),
    pss_raw_row(CKM_SHA384, CKG_MGF1_SHA384, HashAlg::Sha384),
    pss_raw_row(CKM_SHA512, CKG_MGF1_SHA512, HashAlg::Sha512),
    pss_hash_row(CKM_SHA1_RSA_PKCS_PSS, CKM_SHA_1, CKG_MGF1_SHA1, HashAlg::Sha1),
    pss_hash_row(CKM_SHA256_RSA_PKCS_PSS, CKM_SHA256, CKG_MGF1_SHA256, HashAlg::Sha256),
    pss_hash_row(CKM_SHA384_RSA_PKCS_PSS, CKM_SHA384, CKG_MGF1_SHA384, HashAlg::Sha384),
    pss_hash_row(CKM_SHA512_RSA_PKCS_PSS, CKM_SHA512, CKG_MGF1_SHA512, HashAlg::Sha512),
];

/// Look up a mechanism in the registry.
pub fn find(mechanism: CK_MECHANISM_TYPE) -> Option<&'static MechanismSpec> {
    MECHANISMS.iter().find(|spec| spec.mechanism == mechanism)
}

/// The parameter schema for a mechanism, used by the ABI layer to decide
/// how to decode the caller's parameter block.
pub fn parameter_kind(mechanism: CK_MECHANISM_TYPE) -> Option<ParameterKind> {
    find(mechanism).map(|spec| spec.parameters)
}

impl MechanismSpec {
    /// Validate the caller's parameters against this mechanism and resolve
    /// the host algorithms. Rejections carry no side effects.
    pub fn resolve(&self, params: &MechanismParams) -> BridgeResult<ResolvedAlgorithms> {
        match (self.parameters, params) {
            (ParameterKind::None, MechanismParams::None) => Ok(ResolvedAlgorithms {
                encrypt: self.encrypt,
                sign: self.sign,
                digest_sign: self.digest_sign,
                digest: self.digest,
            }),
            (ParameterKind::None, _) => {
                tracing::debug!(
                    mechanism = self.mechanism,
                    "mechanism takes no parameter but one was supplied"
                );
                Err(BridgeError::MechanismParamInvalid)
            }
            (
                ParameterKind::Oaep,
                &MechanismParams::Oaep { hash_alg, mgf, source, source_data_present, source_data_len },
            ) => {
                // No support for an OAEP source label: accept a source of 0,
                // or data-specified with a null pointer and zero length.
                if source != 0 && source != CKZ_DATA_SPECIFIED {
                    tracing::debug!(source, "invalid OAEP source");
                    return Err(BridgeError::MechanismParamInvalid);
                }
                if source == CKZ_DATA_SPECIFIED && (source_data_present || source_data_len != 0) {
                    tracing::debug!("OAEP source data supplied but not supported");
                    return Err(BridgeError::MechanismParamInvalid);
                }
                self.lookup_row(hash_alg, mgf, None)
            }
            (ParameterKind::Pss, &MechanismParams::Pss { hash_alg, mgf, salt_len }) => {
                self.lookup_row(hash_alg, mgf, Some(salt_len))
            }
            _ => Err(BridgeError::MechanismParamInvalid),
        }
    }

    fn lookup_row(
        &self,
        hash_alg: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        salt_len: Option<CK_ULONG>,
    ) -> BridgeResult<ResolvedAlgorithms> {
        for row in PARAM_MAP {
            if row.base == self.mechanism
                && row.hash_alg == hash_alg
                && row.mgf == mgf
                && (salt_len.is_none() || row.salt_len == salt_len)
            {
                return Ok(row.resolved);
            }
        }
        tracing::debug!(
            mechanism = self.mechanism,
            hash_alg,
            mgf,
            ?salt_len,
            "no parameter-map row matches"
        );
        Err(BridgeError::MechanismParamInvalid)
    }
}
