//! Sessions and the session registry.
//!
//! A session is a serialized handle into one token's object list and the
//! scope of at most one in-progress cryptographic operation. The protocol
//! state machine lives here; its legality rules are enforced by the bridge
//! entry points.

use std::sync::Arc;

use cryptoki_sys::{CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID};
use parking_lot::{Mutex, MutexGuard};

use crate::attribute::TemplateAttribute;
use crate::digest::DigestContext;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HashAlg, HostAlgorithm, HostKey};
use crate::object::Object;
use crate::token::Token;

/// Per-session operation state. One pending operation per session; the
/// update states exist only for sign/verify, which are the operations with
/// multi-part support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpState {
    #[default]
    None,
    EncryptInit,
    DecryptInit,
    SignInit,
    SignUpdate,
    VerifyInit,
    VerifyUpdate,
}

/// Mutable per-session state, guarded by the session mutex.
#[derive(Default)]
pub struct SessionOp {
    pub state: OpState,
    /// Deep copy of the current search template; `None` outside a
    /// find-init/find-final window.
    pub search_template: Option<Vec<TemplateAttribute>>,
    /// Cursor into the session's object list. Survives find-final so the
    /// namespace stays stable across searches.
    pub search_cursor: usize,
    /// Key handle for the in-progress operation; the clone holds the host
    /// key alive for the duration.
    pub key: Option<Arc<dyn HostKey>>,
    /// Expected output size in bytes; zero when unknown.
    pub out_size: usize,
    /// Single-shot algorithm for the operation.
    pub alg: Option<HostAlgorithm>,
    /// Digest-taking variant, present when the mechanism supports
    /// multi-part operation.
    pub digest_alg: Option<HostAlgorithm>,
    pub hash: Option<HashAlg>,
    /// Running digest while in an update state. Dropping it discards the
    /// partial digest, which is all session teardown needs.
    pub digest: Option<DigestContext>,
}

impl SessionOp {
    /// Clear the operation and drop the held key reference.
    pub fn reset(&mut self) {
        self.state = OpState::None;
        self.key = None;
        self.out_size = 0;
        self.alg = None;
        self.digest_alg = None;
        self.hash = None;
        self.digest = None;
    }
}

pub struct Session {
    slot_id: CK_SLOT_ID,
    /// The token backing this session; `None` for the certificate slot.
    token: Option<Arc<Token>>,
    /// Snapshot of the token's object list taken at open time.
    objects: Arc<Vec<Object>>,
    op: Mutex<SessionOp>,
}

impl Session {
    pub fn new(slot_id: CK_SLOT_ID, token: Option<Arc<Token>>, objects: Arc<Vec<Object>>) -> Self {
        Self { slot_id, token, objects, op: Mutex::new(SessionOp::default()) }
    }

    pub fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    pub fn token(&self) -> Option<&Arc<Token>> {
        self.token.as_ref()
    }

    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    /// Resolve a 1-based object handle against the session's snapshot.
    pub fn object(&self, handle: CK_OBJECT_HANDLE) -> Option<&Object> {
        let index = (handle as usize).checked_sub(1)?;
        self.objects.get(index)
    }

    pub fn lock_op(&self) -> MutexGuard<'_, SessionOp> {
        self.op.lock()
    }
}

const SESSION_TABLE_GROWTH: usize = 5;

/// The session array. Handles are 1-based indices; freed entries are
/// reused lowest-first, and the array grows in increments of five.
#[derive(Default)]
pub struct SessionTable {
    entries: Vec<Option<Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, session: Arc<Session>) -> CK_SESSION_HANDLE {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(session);
                return (index + 1) as CK_SESSION_HANDLE;
            }
        }
        let index = self.entries.len();
        self.entries.reserve(SESSION_TABLE_GROWTH);
        self.entries.push(Some(session));
        for _ in 1..SESSION_TABLE_GROWTH {
            self.entries.push(None);
        }
        (index + 1) as CK_SESSION_HANDLE
    }

    pub fn get(&self, handle: CK_SESSION_HANDLE) -> BridgeResult<Arc<Session>> {
        let index = (handle as usize)
            .checked_sub(1)
            .ok_or(BridgeError::SessionHandleInvalid(handle))?;
        self.entries
            .get(index)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(BridgeError::SessionHandleInvalid(handle))
    }

    pub fn take(&mut self, handle: CK_SESSION_HANDLE) -> BridgeResult<Arc<Session>> {
        let index = (handle as usize)
            .checked_sub(1)
            .ok_or(BridgeError::SessionHandleInvalid(handle))?;
        self.entries
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(BridgeError::SessionHandleInvalid(handle))
    }

    /// Remove and return every session bound to the given slot.
    pub fn take_for_slot(&mut self, slot_id: CK_SLOT_ID) -> Vec<Arc<Session>> {
        let mut taken = Vec::new();
        for entry in &mut self.entries {
            if entry.as_ref().is_some_and(|session| session.slot_id() == slot_id) {
                if let Some(session) = entry.take() {
                    taken.push(session);
                }
            }
        }
        taken
    }

    /// Remove and return every open session, for library teardown.
    pub fn drain(&mut self) -> Vec<Arc<Session>> {
        self.entries.iter_mut().filter_map(Option::take).collect()
    }
}
