//! Tokens and the slot registry.
//!
//! A slot is an index into a dense array; it holds at most one token. A
//! token owns its identities and the object list built from them, and is
//! kept alive by an explicit reference count: one reference for the
//! registry entry plus one per open session. The count dropping to one
//! means no sessions remain, which logs the token out.

use std::sync::Arc;

use cryptoki_sys::CK_SLOT_ID;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::host::{HostKeystore, LocalAuthContext, TokenId};
use crate::identity::{load_identities, Identity};
use crate::object::{build_identity_objects, Object};

/// The reserved pseudo-slot exposing scanned certificates.
pub const CERTIFICATE_SLOT: CK_SLOT_ID = 254;

struct TokenState {
    logged_in: bool,
    refcount: u32,
    auth: Option<Arc<dyn LocalAuthContext>>,
}

pub struct Token {
    token_id: TokenId,
    label: String,
    identities: Vec<Arc<Identity>>,
    objects: Arc<Vec<Object>>,
    state: Mutex<TokenState>,
}

impl Token {
    /// Build a token for an inserted token identifier: load its
    /// identities, construct the object list, and take the first
    /// identity's label as the token label. Returns `None` when the host
    /// reports no usable identities, in which case no slot is touched.
    pub fn build(keystore: &dyn HostKeystore, token_id: TokenId) -> Option<Arc<Self>> {
        let auth = keystore.new_auth_context();
        if auth.is_none() {
            debug!(token = %token_id, "host refused a local-auth context, PIN entry unavailable");
        }

        let identities = load_identities(keystore, &token_id, auth.as_ref());
        if identities.is_empty() {
            debug!(token = %token_id, "no identities added, not creating token");
            return None;
        }

        let label = identities[0].label.clone();
        let objects = Arc::new(build_identity_objects(&identities));

        Some(Arc::new(Self {
            token_id,
            label,
            identities,
            objects,
            state: Mutex::new(TokenState { logged_in: false, refcount: 1, auth }),
        }))
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn identities(&self) -> &[Arc<Identity>] {
        &self.identities
    }

    /// The object list is immutable after construction; sessions share it
    /// by cloning the `Arc`.
    pub fn objects(&self) -> Arc<Vec<Object>> {
        Arc::clone(&self.objects)
    }

    pub fn logged_in(&self) -> bool {
        self.state.lock().logged_in
    }

    pub fn auth_context(&self) -> Option<Arc<dyn LocalAuthContext>> {
        self.state.lock().auth.clone()
    }

    pub fn mark_logged_in(&self) {
        self.state.lock().logged_in = true;
    }

    /// Release the local-auth credential and clear the logged-in flag.
    pub fn logout(&self) {
        let mut state = self.state.lock();
        if let Some(auth) = state.auth.take() {
            auth.invalidate();
        }
        state.logged_in = false;
    }

    /// Take a reference for a new session.
    pub fn retain(&self) {
        let mut state = self.state.lock();
        state.refcount += 1;
    }

    /// Drop one reference. The transition to a single remaining reference
    /// means the last session is gone, so the token logs out.
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug!(token = %self.token_id, refcount = state.refcount, "releasing token reference");
        if state.refcount == 0 {
            warn!(token = %self.token_id, "token reference count underflow");
            return;
        }
        state.refcount -= 1;
        if state.refcount == 1 {
            if let Some(auth) = state.auth.take() {
                auth.invalidate();
            }
            state.logged_in = false;
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().refcount
    }
}

/// Dense array of slots. Kept behind the bridge's slot mutex; the registry
/// itself is just the data.
pub struct SlotRegistry {
    slots: Vec<Option<Arc<Token>>>,
}

impl SlotRegistry {
    /// Starts with a single empty slot so applications always have a slot
    /// to poll even before any token arrives.
    pub fn new() -> Self {
        Self { slots: vec![None] }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot_id: CK_SLOT_ID) -> Option<&Arc<Token>> {
        self.slots.get(slot_id as usize).and_then(Option::as_ref)
    }

    /// Hardware slot ids in ascending order; `present_only` filters out
    /// empty slots.
    pub fn slot_ids(&self, present_only: bool) -> Vec<CK_SLOT_ID> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| !present_only || entry.is_some())
            .map(|(index, _)| index as CK_SLOT_ID)
            .collect()
    }

    /// Place a token in the first empty slot, growing the array by one
    /// when every slot is occupied.
    pub fn insert(&mut self, token: Arc<Token>) -> CK_SLOT_ID {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(token);
                return index as CK_SLOT_ID;
            }
        }
        self.slots.push(Some(token));
        (self.slots.len() - 1) as CK_SLOT_ID
    }

    /// Clear the slot whose token matches the removed identifier and hand
    /// the entry back to the caller, which must release it.
    pub fn remove(&mut self, token_id: &TokenId) -> Option<Arc<Token>> {
        for entry in &mut self.slots {
            if entry.as_ref().is_some_and(|token| token.token_id() == token_id) {
                return entry.take();
            }
        }
        None
    }

    /// Empty every slot, for library teardown. The caller releases each
    /// returned token.
    pub fn drain(&mut self) -> Vec<Arc<Token>> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}
