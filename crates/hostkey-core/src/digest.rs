//! Running message-digest contexts for the multi-part sign/verify paths.

use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::host::HashAlg;

/// An in-progress digest, owned by a session while it is in an update
/// state. Finalizing consumes the context; dropping it mid-operation
/// discards the partial state, which is exactly what session teardown
/// needs.
pub enum DigestContext {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl DigestContext {
    pub fn new(alg: HashAlg) -> Self {
        match alg {
            HashAlg::Sha1 => Self::Sha1(Sha1::new()),
            HashAlg::Sha224 => Self::Sha224(Sha224::new()),
            HashAlg::Sha256 => Self::Sha256(Sha256::new()),
            HashAlg::Sha384 => Self::Sha384(Sha384::new()),
            HashAlg::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(d) => d.update(data),
            Self::Sha224(d) => d.update(data),
            Self::Sha256(d) => d.update(data),
            Self::Sha384(d) => d.update(data),
            Self::Sha512(d) => d.update(data),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        match self {
            Self::Sha1(d) => d.finalize().to_vec(),
            Self::Sha224(d) => d.finalize().to_vec(),
            Self::Sha256(d) => d.finalize().to_vec(),
            Self::Sha384(d) => d.finalize().to_vec(),
            Self::Sha512(d) => d.finalize().to_vec(),
        }
    }
}

/// One-shot helper for places that need a digest without the streaming
/// context (the certificate SHA-1 hash attribute).
pub fn digest(alg: HashAlg, data: &[u8]) -> Vec<u8> {
    let mut ctx = DigestContext::new(alg);
    ctx.update(data);
    ctx.finish()
}
