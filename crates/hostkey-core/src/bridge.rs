//! The engine facade: slot, session, object, and operation management with
//! the exact pre-/post-conditions of the token API.
//!
//! Lock order, outermost first: slot registry, session registry, token,
//! session. No method acquires in reverse order. The single-shot crypto
//! paths hold the per-session lock across the host call (the session is
//! logically busy for the duration); no token lock is held across host
//! crypto calls.

use std::sync::Arc;

use cryptoki_sys::{
    CKF_SERIAL_SESSION, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CK_ATTRIBUTE_TYPE, CK_FLAGS,
    CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG, CK_USER_TYPE,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::attribute::{find_attribute, TemplateAttribute};
use crate::certscan::{run_scan, CertSlot};
use crate::config::BridgeConfig;
use crate::digest::DigestContext;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostError, HostKeystore, KeyUsageIntent, TokenEventSink, TokenId, TokenWatcher};
use crate::mechanism::{self, MechanismRequest, MechanismSpec};
use crate::session::{OpState, Session, SessionTable};
use crate::token::{SlotRegistry, Token, CERTIFICATE_SLOT};

/// Slot information at the semantic level; the ABI layer turns this into
/// a `CK_SLOT_INFO`.
#[derive(Debug, Clone)]
pub struct SlotDescription {
    pub description: String,
    pub hardware: bool,
    pub token_present: bool,
}

/// Token information at the semantic level.
#[derive(Debug, Clone)]
pub struct TokenDescription {
    pub label: String,
    pub login_required: bool,
    pub protected_auth_path: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionDescription {
    pub slot_id: CK_SLOT_ID,
    pub user_functions: bool,
}

/// Result of a single-shot (or final) crypto call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoOutput {
    /// Size probe: the caller passed no output buffer and the expected
    /// output size is known.
    Size(usize),
    Data(Vec<u8>),
}

/// One attribute of a `get-attribute-values` request. `capacity` is the
/// caller's buffer size, `None` for a length probe.
pub struct AttributeQuery {
    pub kind: CK_ATTRIBUTE_TYPE,
    pub capacity: Option<usize>,
    pub outcome: AttrOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrOutcome {
    Pending,
    Unavailable,
    Length(usize),
    TooSmall(usize),
    Value(Vec<u8>),
}

impl AttributeQuery {
    pub fn probe(kind: CK_ATTRIBUTE_TYPE) -> Self {
        Self { kind, capacity: None, outcome: AttrOutcome::Pending }
    }

    pub fn sized(kind: CK_ATTRIBUTE_TYPE, capacity: usize) -> Self {
        Self { kind, capacity: Some(capacity), outcome: AttrOutcome::Pending }
    }
}

/// The process-wide engine. One instance exists between initialize and
/// finalize, owned by the ABI layer.
pub struct Bridge {
    keystore: Arc<dyn HostKeystore>,
    config: BridgeConfig,
    slots: Mutex<SlotRegistry>,
    sessions: Mutex<SessionTable>,
    cert_slot: CertSlot,
    watcher: Mutex<Option<Arc<dyn TokenWatcher>>>,
}

impl Bridge {
    pub fn new(keystore: Arc<dyn HostKeystore>, config: BridgeConfig) -> Arc<Self> {
        let cert_slot = CertSlot::new(config.cert_slot_enabled);
        Arc::new(Self {
            keystore,
            config,
            slots: Mutex::new(SlotRegistry::new()),
            sessions: Mutex::new(SessionTable::new()),
            cert_slot,
            watcher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Attach to the host: register for token events and, when the
    /// certificate slot is on, launch the one-shot background scan. Only
    /// the winner of the scan-state transition launches it; a scan still
    /// running from a previous initialize is left alone.
    pub fn start(self: &Arc<Self>) {
        if self.cert_slot.enabled() && self.cert_slot.try_begin_scan() {
            let bridge = Arc::clone(self);
            std::thread::spawn(move || {
                run_scan(bridge.keystore.as_ref(), &bridge.config.cert_match, &bridge.cert_slot);
            });
        }

        if let Some(watcher) = self.keystore.watcher() {
            watcher.start(Arc::clone(self) as Arc<dyn TokenEventSink>);
            *self.watcher.lock() = Some(watcher);
        }
    }

    /// Detach from the host and release everything. The watcher is
    /// stopped first so no insertion callback can arrive during teardown.
    /// A certificate scan still in flight is allowed to finish on its own;
    /// its allocations are bounded by the host's certificate count.
    pub fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }

        let open = self.sessions.lock().drain();
        for session in open {
            self.finalize_session(&session);
        }

        for token in self.slots.lock().drain() {
            token.release();
        }
    }

    // ----- slots and tokens -------------------------------------------

    fn check_slot(
        &self,
        registry: &SlotRegistry,
        slot_id: CK_SLOT_ID,
        require_present: bool,
    ) -> BridgeResult<()> {
        if slot_id != CERTIFICATE_SLOT && slot_id as usize >= registry.len() {
            return Err(BridgeError::SlotIdInvalid(slot_id));
        }
        if slot_id == CERTIFICATE_SLOT && !self.cert_slot.enabled() {
            return Err(BridgeError::SlotIdInvalid(slot_id));
        }
        if require_present {
            if slot_id == CERTIFICATE_SLOT {
                if !self.cert_slot.initialized() {
                    return Err(BridgeError::TokenNotPresent(slot_id));
                }
            } else if registry.get(slot_id).is_none() {
                return Err(BridgeError::TokenNotPresent(slot_id));
            }
        }
        Ok(())
    }

    /// Slot identifiers in ascending order, the certificate slot last.
    /// The certificate slot always counts as present while enabled.
    pub fn slot_list(&self, present_only: bool) -> Vec<CK_SLOT_ID> {
        let slots = self.slots.lock();
        let mut ids = slots.slot_ids(present_only);
        if self.cert_slot.enabled() {
            ids.push(CERTIFICATE_SLOT);
        }
        ids
    }

    pub fn slot_info(&self, slot_id: CK_SLOT_ID) -> BridgeResult<SlotDescription> {
        let slots = self.slots.lock();
        self.check_slot(&slots, slot_id, false)?;

        if slot_id == CERTIFICATE_SLOT {
            return Ok(SlotDescription {
                description: "Keychain Certificates".to_string(),
                hardware: false,
                token_present: self.cert_slot.initialized(),
            });
        }
        Ok(match slots.get(slot_id) {
            Some(token) => SlotDescription {
                description: token.label().to_string(),
                hardware: true,
                token_present: true,
            },
            None => SlotDescription {
                description: format!("Keychain Bridge Library Virtual Slot #{slot_id}"),
                hardware: true,
                token_present: false,
            },
        })
    }

    pub fn token_info(&self, slot_id: CK_SLOT_ID) -> BridgeResult<TokenDescription> {
        let slots = self.slots.lock();
        self.check_slot(&slots, slot_id, true)?;

        if slot_id == CERTIFICATE_SLOT {
            return Ok(TokenDescription {
                label: "Keychain Certificates".to_string(),
                login_required: false,
                protected_auth_path: false,
            });
        }

        let token = slots.get(slot_id).ok_or(BridgeError::TokenNotPresent(slot_id))?;
        // The label shows up in application chooser dialogs, so use the
        // first certificate's subject summary rather than a serial blob.
        let label = token
            .identities()
            .first()
            .map(|identity| identity.certificate.subject_summary.clone())
            .unwrap_or_else(|| "Unknown Keychain Token".to_string());

        Ok(TokenDescription {
            label,
            login_required: true,
            protected_auth_path: !self.config.ask_pin,
        })
    }

    pub fn check_slot_present(&self, slot_id: CK_SLOT_ID) -> BridgeResult<()> {
        let slots = self.slots.lock();
        self.check_slot(&slots, slot_id, true)
    }

    pub fn mechanisms(&self, slot_id: CK_SLOT_ID) -> BridgeResult<&'static [MechanismSpec]> {
        self.check_slot_present(slot_id)?;
        Ok(mechanism::MECHANISMS)
    }

    pub fn mechanism_info(
        &self,
        slot_id: CK_SLOT_ID,
        mechanism_type: CK_ULONG,
    ) -> BridgeResult<&'static MechanismSpec> {
        self.check_slot_present(slot_id)?;
        mechanism::find(mechanism_type).ok_or(BridgeError::MechanismInvalid)
    }

    // ----- sessions ---------------------------------------------------

    /// Open a serial session against a present slot. The session
    /// snapshots the slot's object list; for the certificate slot this
    /// means a scan completing later is visible only to sessions opened
    /// afterwards.
    pub fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> BridgeResult<CK_SESSION_HANDLE> {
        let slots = self.slots.lock();
        self.check_slot(&slots, slot_id, true)?;

        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(BridgeError::ParallelNotSupported);
        }

        let session = if slot_id == CERTIFICATE_SLOT {
            let objects = if self.cert_slot.initialized() {
                self.cert_slot.objects()
            } else {
                Arc::new(Vec::new())
            };
            Session::new(slot_id, None, objects)
        } else {
            let token = slots.get(slot_id).ok_or(BridgeError::TokenNotPresent(slot_id))?;
            token.retain();
            Session::new(slot_id, Some(Arc::clone(token)), token.objects())
        };

        let handle = self.sessions.lock().allocate(Arc::new(session));
        debug!(slot_id, handle, "session opened");
        Ok(handle)
    }

    pub fn close_session(&self, handle: CK_SESSION_HANDLE) -> BridgeResult<()> {
        let session = self.sessions.lock().take(handle)?;
        self.finalize_session(&session);
        debug!(handle, "session closed");
        Ok(())
    }

    /// Close every session bound to the slot. Sessions are removed from
    /// the registry first and finalized without the registry lock held.
    pub fn close_all_sessions(&self, slot_id: CK_SLOT_ID) -> BridgeResult<()> {
        self.check_slot_present(slot_id)?;
        let taken = self.sessions.lock().take_for_slot(slot_id);
        for session in taken {
            self.finalize_session(&session);
        }
        Ok(())
    }

    pub fn session_info(&self, handle: CK_SESSION_HANDLE) -> BridgeResult<SessionDescription> {
        let session = self.session(handle)?;
        let user_functions = session.token().is_some_and(|token| token.logged_in());
        Ok(SessionDescription { slot_id: session.slot_id(), user_functions })
    }

    fn session(&self, handle: CK_SESSION_HANDLE) -> BridgeResult<Arc<Session>> {
        self.sessions.lock().get(handle)
    }

    /// Release a session's held resources and drop its token reference.
    /// Any running digest is discarded with the operation state.
    fn finalize_session(&self, session: &Arc<Session>) {
        session.lock_op().reset();
        if let Some(token) = session.token() {
            token.release();
        }
    }

    // ----- login ------------------------------------------------------

    /// Present a PIN for the session's token. A missing token (the
    /// certificate slot) succeeds silently; a null PIN marks the token
    /// logged in and leaves authentication to the platform.
    pub fn login(
        &self,
        handle: CK_SESSION_HANDLE,
        _user_type: CK_USER_TYPE,
        pin: Option<&[u8]>,
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let _op = session.lock_op();

        let Some(token) = session.token() else {
            return Ok(());
        };

        if let Some(pin) = pin {
            let Some(auth) = token.auth_context() else {
                debug!("no local-auth context, cannot set PIN, skipping");
                return Ok(());
            };
            for (index, identity) in token.identities().iter().enumerate() {
                debug!(index, slot_id = session.slot_id(), "setting PIN for identity");
                let usage = if identity.can_sign {
                    KeyUsageIntent::Sign
                } else {
                    KeyUsageIntent::Decrypt
                };
                auth.authenticate(pin, &identity.access_control, usage)
                    .map_err(|err| match err {
                        HostError::AccessDenied => BridgeError::PinIncorrect,
                        other => BridgeError::failed(other),
                    })?;
            }
        } else {
            debug!("no PIN supplied, delegating authentication to the platform");
        }

        token.mark_logged_in();
        Ok(())
    }

    pub fn logout(&self, handle: CK_SESSION_HANDLE) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let _op = session.lock_op();
        if let Some(token) = session.token() {
            token.logout();
        }
        Ok(())
    }

    // ----- object attributes and search -------------------------------

    /// Fill in attribute values for one object. Per-attribute outcomes
    /// are always produced; the returned error, if any, is the summary
    /// code (missing attribute or undersized buffer), with later failures
    /// overriding earlier ones.
    pub fn get_attribute_values(
        &self,
        handle: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        queries: &mut [AttributeQuery],
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let _op = session.lock_op();

        let Some(obj) = session.object(object) else {
            return Err(BridgeError::ObjectHandleInvalid(object));
        };

        let mut summary = Ok(());
        for query in queries.iter_mut() {
            match find_attribute(&obj.attributes, query.kind) {
                Some(attr) => match query.capacity {
                    None => query.outcome = AttrOutcome::Length(attr.value.len()),
                    Some(capacity) if capacity < attr.value.len() => {
                        query.outcome = AttrOutcome::TooSmall(attr.value.len());
                        summary = Err(BridgeError::BufferTooSmall(0));
                    }
                    Some(_) => query.outcome = AttrOutcome::Value(attr.value.clone()),
                },
                None => {
                    query.outcome = AttrOutcome::Unavailable;
                    summary = Err(BridgeError::AttributeTypeInvalid);
                }
            }
        }
        summary
    }

    /// Begin a search: deep-copy the template and rewind the cursor.
    pub fn find_objects_init(
        &self,
        handle: CK_SESSION_HANDLE,
        template: Vec<TemplateAttribute>,
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();
        op.search_template = Some(template);
        op.search_cursor = 0;
        Ok(())
    }

    /// Advance the search cursor and return up to `max` matching handles.
    pub fn find_objects(
        &self,
        handle: CK_SESSION_HANDLE,
        max: usize,
    ) -> BridgeResult<Vec<CK_OBJECT_HANDLE>> {
        if max == 0 {
            return Err(BridgeError::ArgumentsBad);
        }
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        let template = op.search_template.clone().unwrap_or_default();
        let objects = session.objects();
        let mut found = Vec::new();

        while op.search_cursor < objects.len() {
            let object = &objects[op.search_cursor];
            if crate::attribute::matches_template(&object.attributes, &template) {
                found.push((op.search_cursor + 1) as CK_OBJECT_HANDLE);
                if found.len() >= max {
                    op.search_cursor += 1;
                    debug!(count = found.len(), "objects found");
                    return Ok(found);
                }
            }
            op.search_cursor += 1;
        }

        debug!(count = found.len(), "objects found");
        Ok(found)
    }

    /// Release the template copy. The cursor is left in place.
    pub fn find_objects_final(&self, handle: CK_SESSION_HANDLE) -> BridgeResult<()> {
        let session = self.session(handle)?;
        session.lock_op().search_template = None;
        Ok(())
    }

    // ----- operation initialization -----------------------------------

    pub fn encrypt_init(
        &self,
        handle: CK_SESSION_HANDLE,
        mechanism: &MechanismRequest,
        key: CK_OBJECT_HANDLE,
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        let object = session.object(key).ok_or(BridgeError::KeyHandleInvalid(key))?;
        if op.state != OpState::None {
            return Err(BridgeError::OperationActive);
        }
        if object.class != CKO_PUBLIC_KEY {
            return Err(BridgeError::KeyTypeInconsistent);
        }
        // Certificate-slot objects have no identity and cannot do crypto.
        let identity = object.identity.as_ref().ok_or(BridgeError::ArgumentsBad)?;

        let spec = usable_mechanism(mechanism.mechanism, cryptoki_sys::CKF_ENCRYPT)?;
        let resolved = spec.resolve(&mechanism.params)?;

        op.key = Some(Arc::clone(&identity.public_key));
        op.alg = resolved.encrypt;
        op.digest_alg = None;
        op.hash = None;
        op.out_size = if spec.blocksize_out { identity.public_key.block_size() } else { 0 };
        op.state = OpState::EncryptInit;
        Ok(())
    }

    pub fn decrypt_init(
        &self,
        handle: CK_SESSION_HANDLE,
        mechanism: &MechanismRequest,
        key: CK_OBJECT_HANDLE,
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        let object = session.object(key).ok_or(BridgeError::KeyHandleInvalid(key))?;
        if op.state != OpState::None {
            return Err(BridgeError::OperationActive);
        }
        if object.class != CKO_PRIVATE_KEY {
            return Err(BridgeError::KeyTypeInconsistent);
        }
        let identity = object.identity.as_ref().ok_or(BridgeError::ArgumentsBad)?;
        if !identity.can_decrypt {
            return Err(BridgeError::KeyFunctionNotPermitted);
        }

        let spec = usable_mechanism(mechanism.mechanism, cryptoki_sys::CKF_DECRYPT)?;
        let resolved = spec.resolve(&mechanism.params)?;

        op.key = Some(Arc::clone(&identity.private_key));
        op.alg = resolved.encrypt;
        op.digest_alg = None;
        op.hash = None;
        op.out_size = if spec.blocksize_out { identity.private_key.block_size() } else { 0 };
        op.state = OpState::DecryptInit;
        Ok(())
    }

    pub fn sign_init(
        &self,
        handle: CK_SESSION_HANDLE,
        mechanism: &MechanismRequest,
        key: CK_OBJECT_HANDLE,
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        if op.state != OpState::None {
            return Err(BridgeError::OperationActive);
        }
        let object = session.object(key).ok_or(BridgeError::KeyHandleInvalid(key))?;
        let identity = object.identity.as_ref().ok_or(BridgeError::ArgumentsBad)?;
        if !identity.can_sign {
            return Err(BridgeError::KeyFunctionNotPermitted);
        }
        if object.class != CKO_PRIVATE_KEY {
            return Err(BridgeError::KeyTypeInconsistent);
        }

        let spec = usable_mechanism(mechanism.mechanism, cryptoki_sys::CKF_SIGN)?;
        let resolved = spec.resolve(&mechanism.params)?;

        op.key = Some(Arc::clone(&identity.private_key));
        op.alg = resolved.sign;
        op.digest_alg = resolved.digest_sign;
        op.hash = resolved.digest;
        op.out_size = if spec.blocksize_out { identity.private_key.block_size() } else { 0 };
        op.state = OpState::SignInit;
        Ok(())
    }

    pub fn verify_init(
        &self,
        handle: CK_SESSION_HANDLE,
        mechanism: &MechanismRequest,
        key: CK_OBJECT_HANDLE,
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        if op.state != OpState::None {
            return Err(BridgeError::OperationActive);
        }
        let object = session.object(key).ok_or(BridgeError::KeyHandleInvalid(key))?;
        let identity = object.identity.as_ref().ok_or(BridgeError::ArgumentsBad)?;
        if !identity.can_verify {
            return Err(BridgeError::KeyFunctionNotPermitted);
        }
        if object.class != CKO_PUBLIC_KEY {
            return Err(BridgeError::KeyTypeInconsistent);
        }

        let spec = usable_mechanism(mechanism.mechanism, cryptoki_sys::CKF_VERIFY)?;
        let resolved = spec.resolve(&mechanism.params)?;

        op.key = Some(Arc::clone(&identity.public_key));
        op.alg = resolved.sign;
        op.digest_alg = resolved.digest_sign;
        op.hash = resolved.digest;
        op.out_size = if spec.blocksize_out { identity.public_key.block_size() } else { 0 };
        op.state = OpState::VerifyInit;
        Ok(())
    }

    // ----- single-shot operations -------------------------------------

    pub fn encrypt(
        &self,
        handle: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<usize>,
    ) -> BridgeResult<CryptoOutput> {
        self.single_shot(handle, OpState::EncryptInit, data, capacity, |key, alg, data| {
            key.encrypt(alg, data)
        })
    }

    pub fn decrypt(
        &self,
        handle: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<usize>,
    ) -> BridgeResult<CryptoOutput> {
        self.single_shot(handle, OpState::DecryptInit, data, capacity, |key, alg, data| {
            key.decrypt(alg, data)
        })
    }

    pub fn sign(
        &self,
        handle: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<usize>,
    ) -> BridgeResult<CryptoOutput> {
        self.single_shot(handle, OpState::SignInit, data, capacity, |key, alg, data| {
            key.sign(alg, data)
        })
    }

    /// Verify a signature over the whole buffer. The held key and state
    /// are released whether or not the signature checks out.
    pub fn verify(
        &self,
        handle: CK_SESSION_HANDLE,
        data: &[u8],
        signature: &[u8],
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        if op.state != OpState::VerifyInit {
            return Err(BridgeError::OperationNotInitialized);
        }
        let key = op.key.clone().ok_or(BridgeError::OperationNotInitialized)?;
        let alg = op.alg.ok_or(BridgeError::OperationNotInitialized)?;

        let result = key.verify(alg, data, signature);
        op.reset();
        result.map_err(|err| {
            debug!(%err, "signature verification failed");
            BridgeError::SignatureInvalid
        })
    }

    /// Shared body of the single-shot encrypt/decrypt/sign paths: size
    /// probing, the host call, and the retryable buffer-too-small case.
    fn single_shot(
        &self,
        handle: CK_SESSION_HANDLE,
        wanted: OpState,
        data: &[u8],
        capacity: Option<usize>,
        perform: impl Fn(
            &Arc<dyn crate::host::HostKey>,
            crate::host::HostAlgorithm,
            &[u8],
        ) -> crate::host::HostResult<Vec<u8>>,
    ) -> BridgeResult<CryptoOutput> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        if op.state != wanted {
            return Err(BridgeError::OperationNotInitialized);
        }

        // Size probes and undersized buffers return without touching the
        // operation state so the caller can retry with a bigger buffer.
        let capacity = match capacity {
            None => {
                if op.out_size == 0 {
                    return Err(BridgeError::BufferTooSmall(0));
                }
                debug!(out_size = op.out_size, "null output buffer, returning the output size");
                return Ok(CryptoOutput::Size(op.out_size));
            }
            Some(capacity) => {
                if op.out_size != 0 && op.out_size > capacity {
                    return Err(BridgeError::BufferTooSmall(op.out_size));
                }
                capacity
            }
        };

        let key = op.key.clone().ok_or(BridgeError::OperationNotInitialized)?;
        let alg = op.alg.ok_or(BridgeError::OperationNotInitialized)?;

        match perform(&key, alg, data) {
            Ok(output) => {
                if capacity < output.len() {
                    return Err(BridgeError::BufferTooSmall(output.len()));
                }
                op.reset();
                Ok(CryptoOutput::Data(output))
            }
            Err(err) => {
                // Clear the operation so a host failure (a declined PIN
                // prompt, a yanked card) cannot jam the session.
                warn!(%err, "host crypto call failed");
                op.reset();
                Err(BridgeError::general(err))
            }
        }
    }

    // ----- multi-part sign/verify -------------------------------------

    pub fn sign_update(&self, handle: CK_SESSION_HANDLE, data: &[u8]) -> BridgeResult<()> {
        self.op_update(handle, OpState::SignInit, OpState::SignUpdate, data)
    }

    pub fn verify_update(&self, handle: CK_SESSION_HANDLE, data: &[u8]) -> BridgeResult<()> {
        self.op_update(handle, OpState::VerifyInit, OpState::VerifyUpdate, data)
    }

    fn op_update(
        &self,
        handle: CK_SESSION_HANDLE,
        init_state: OpState,
        update_state: OpState,
        data: &[u8],
    ) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        if op.state != init_state && op.state != update_state {
            return Err(BridgeError::OperationNotInitialized);
        }
        // Mechanisms without a digest-taking variant (CKM_RSA_PKCS and
        // the pre-hashed PSS form) cannot run multi-part.
        if op.digest_alg.is_none() {
            return Err(BridgeError::DataLenRange);
        }

        if op.state == init_state {
            let Some(hash) = op.hash else {
                op.reset();
                return Err(BridgeError::general("no digest algorithm for mechanism"));
            };
            op.digest = Some(DigestContext::new(hash));
            op.state = update_state;
        }

        op.digest
            .as_mut()
            .ok_or(BridgeError::OperationNotInitialized)?
            .update(data);
        Ok(())
    }

    /// Finalize a multi-part signature: finish the digest and feed it to
    /// the digest-taking host algorithm.
    pub fn sign_final(
        &self,
        handle: CK_SESSION_HANDLE,
        capacity: Option<usize>,
    ) -> BridgeResult<CryptoOutput> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        if op.state != OpState::SignUpdate {
            return Err(BridgeError::OperationNotInitialized);
        }

        let capacity = match capacity {
            None => {
                if op.out_size == 0 {
                    return Err(BridgeError::BufferTooSmall(0));
                }
                return Ok(CryptoOutput::Size(op.out_size));
            }
            Some(capacity) => {
                if op.out_size != 0 && op.out_size > capacity {
                    return Err(BridgeError::BufferTooSmall(op.out_size));
                }
                capacity
            }
        };

        let key = op.key.clone().ok_or(BridgeError::OperationNotInitialized)?;
        let alg = op.digest_alg.ok_or(BridgeError::OperationNotInitialized)?;
        let digest = op
            .digest
            .take()
            .ok_or(BridgeError::OperationNotInitialized)?
            .finish();

        let result = key.sign(alg, &digest);
        op.reset();
        match result {
            Ok(signature) => {
                if capacity < signature.len() {
                    warn!(capacity, produced = signature.len(), "signature exceeds probed size");
                    return Err(BridgeError::failed("signature larger than probed size"));
                }
                Ok(CryptoOutput::Data(signature))
            }
            Err(err) => {
                warn!(%err, "digest signature failed");
                Err(BridgeError::failed(err))
            }
        }
    }

    /// Finalize a multi-part verification.
    pub fn verify_final(&self, handle: CK_SESSION_HANDLE, signature: &[u8]) -> BridgeResult<()> {
        let session = self.session(handle)?;
        let mut op = session.lock_op();

        if op.state != OpState::VerifyUpdate {
            return Err(BridgeError::OperationNotInitialized);
        }

        let key = op.key.clone().ok_or(BridgeError::OperationNotInitialized)?;
        let alg = op.digest_alg.ok_or(BridgeError::OperationNotInitialized)?;
        let digest = op
            .digest
            .take()
            .ok_or(BridgeError::OperationNotInitialized)?
            .finish();

        let result = key.verify(alg, &digest, signature);
        op.reset();
        result.map_err(|err| {
            debug!(%err, "digest signature verification failed");
            BridgeError::SignatureInvalid
        })
    }
}

fn usable_mechanism(
    mechanism_type: CK_ULONG,
    required_flag: CK_FLAGS,
) -> BridgeResult<&'static MechanismSpec> {
    mechanism::find(mechanism_type)
        .filter(|spec| spec.flags & required_flag != 0)
        .ok_or(BridgeError::MechanismInvalid)
}

impl TokenEventSink for Bridge {
    /// Insertion: load identities and build the token outside the slot
    /// lock, then place it in the first empty slot.
    fn token_added(&self, token_id: TokenId) {
        debug!(token = %token_id, "token insertion event");
        let Some(token) = Token::build(self.keystore.as_ref(), token_id) else {
            return;
        };
        let slot_id = self.slots.lock().insert(token);
        debug!(slot_id, "token added");
    }

    /// Removal: empty the slot and drop the registry's reference. Open
    /// sessions keep the token alive until they close.
    fn token_removed(&self, token_id: TokenId) {
        debug!(token = %token_id, "token removal event");
        let removed = self.slots.lock().remove(&token_id);
        match removed {
            Some(token) => token.release(),
            None => debug!(token = %token_id, "no matching slot found for removed token"),
        }
    }
}
