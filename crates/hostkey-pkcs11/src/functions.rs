//! The Cryptoki v2.40 entry points.
//!
//! Each function validates its raw pointers, lifts the arguments into the
//! engine's types, and translates the result back into a `CKR_*` code.
//! Functions outside the supported surface return
//! `CKR_FUNCTION_NOT_SUPPORTED` uniformly.

use std::sync::Arc;

use cryptoki_sys::{
    CKF_HW_SLOT, CKF_LOGIN_REQUIRED, CKF_PROTECTED_AUTHENTICATION_PATH, CKF_REMOVABLE_DEVICE,
    CKF_SERIAL_SESSION, CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED,
    CKF_WRITE_PROTECTED, CKR_ARGUMENTS_BAD, CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_NOT_INITIALIZED,
    CKR_FUNCTION_NOT_SUPPORTED, CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID, CKR_OK,
    CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS, CK_ATTRIBUTE_PTR, CK_BBOOL, CK_BYTE_PTR,
    CK_C_INITIALIZE_ARGS, CK_EFFECTIVELY_INFINITE, CK_FLAGS, CK_FUNCTION_LIST,
    CK_FUNCTION_LIST_PTR_PTR, CK_INFO_PTR, CK_MECHANISM_INFO_PTR, CK_MECHANISM_PTR,
    CK_MECHANISM_TYPE, CK_MECHANISM_TYPE_PTR, CK_NOTIFY, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE_PTR,
    CK_RSA_PKCS_OAEP_PARAMS, CK_RSA_PKCS_PSS_PARAMS, CK_RV, CK_SESSION_HANDLE,
    CK_SESSION_HANDLE_PTR, CK_SESSION_INFO_PTR, CK_SLOT_ID, CK_SLOT_ID_PTR, CK_SLOT_INFO_PTR,
    CK_TOKEN_INFO_PTR, CK_ULONG, CK_ULONG_PTR, CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE,
    CK_UTF8CHAR_PTR, CK_VERSION, CK_VOID_PTR,
};
use hostkey_core::bridge::{AttrOutcome, AttributeQuery, CryptoOutput};
use hostkey_core::mechanism::{parameter_kind, MechanismParams, MechanismRequest, ParameterKind};
use hostkey_core::{BridgeError, BridgeResult, TemplateAttribute};
use tracing::debug;

use crate::util::{pad_str, write_list};
use crate::{bridge, finalize, initialize, initialized, rv_from, translate_error};

const MANUFACTURER: &str = "U.S. Naval Research Lab";
const LIBRARY_DESCRIPTION: &str = "Keychain PKCS#11 Bridge Library";

/// Environment variables for the sign-path debug hooks.
const SIGN_DATAFILE_ENV: &str = "HOSTKEY_PKCS11_SIGN_DATAFILE";
const SIGN_SIGFILE_ENV: &str = "HOSTKEY_PKCS11_SIGN_SIGFILE";

// ----- library lifecycle ----------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn C_Initialize(p_init_args: CK_VOID_PTR) -> CK_RV {
    debug!("C_Initialize called");
    let args = p_init_args as *const CK_C_INITIALIZE_ARGS;
    let args = if args.is_null() { None } else { Some(unsafe { &*args }) };
    rv_from(initialize(args))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Finalize(p_reserved: CK_VOID_PTR) -> CK_RV {
    debug!("C_Finalize called");
    if !initialized() {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    if !p_reserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    rv_from(finalize())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetInfo(p_info: CK_INFO_PTR) -> CK_RV {
    debug!("C_GetInfo called");
    if !initialized() {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    if p_info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let info = unsafe { &mut *p_info };
    info.cryptokiVersion = CK_VERSION { major: 2, minor: 40 };
    info.flags = 0;
    pad_str(&mut info.manufacturerID, MANUFACTURER);
    pad_str(&mut info.libraryDescription, LIBRARY_DESCRIPTION);
    info.libraryVersion = CK_VERSION { major: 1, minor: 0 };
    CKR_OK
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetFunctionList(pp_function_list: CK_FUNCTION_LIST_PTR_PTR) -> CK_RV {
    if pp_function_list.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    unsafe {
        *pp_function_list = std::ptr::addr_of!(FUNCTION_LIST) as *mut CK_FUNCTION_LIST;
    }
    CKR_OK
}

// ----- slots and tokens -----------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotList(
    token_present: CK_BBOOL,
    p_slot_list: CK_SLOT_ID_PTR,
    pul_count: CK_ULONG_PTR,
) -> CK_RV {
    debug!(token_present, "C_GetSlotList called");
    if pul_count.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    let slots = bridge.slot_list(token_present != 0);
    unsafe { write_list(&slots, p_slot_list, pul_count) }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotInfo(slot_id: CK_SLOT_ID, p_info: CK_SLOT_INFO_PTR) -> CK_RV {
    debug!(slot_id, "C_GetSlotInfo called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let description = match bridge.slot_info(slot_id) {
        Ok(description) => description,
        Err(err) => return translate_error(&err),
    };

    let info = unsafe { &mut *p_info };
    pad_str(&mut info.slotDescription, &description.description);
    pad_str(&mut info.manufacturerID, MANUFACTURER);
    info.flags = CKF_REMOVABLE_DEVICE;
    if description.hardware {
        info.flags |= CKF_HW_SLOT;
    }
    if description.token_present {
        info.flags |= CKF_TOKEN_PRESENT;
    }
    info.hardwareVersion = CK_VERSION { major: 1, minor: 0 };
    info.firmwareVersion = CK_VERSION { major: 1, minor: 0 };
    CKR_OK
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetTokenInfo(slot_id: CK_SLOT_ID, p_info: CK_TOKEN_INFO_PTR) -> CK_RV {
    debug!(slot_id, "C_GetTokenInfo called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let description = match bridge.token_info(slot_id) {
        Ok(description) => description,
        Err(err) => return translate_error(&err),
    };

    let info = unsafe { &mut *p_info };
    // Nothing here is writable through this API, so the token presents
    // itself as initialized and read-only.
    info.flags = CKF_WRITE_PROTECTED | CKF_USER_PIN_INITIALIZED | CKF_TOKEN_INITIALIZED;
    if description.login_required {
        info.flags |= CKF_LOGIN_REQUIRED;
    }
    if description.protected_auth_path {
        info.flags |= CKF_PROTECTED_AUTHENTICATION_PATH;
    }
    pad_str(&mut info.label, &description.label);
    pad_str(&mut info.manufacturerID, "Unknown Manufacturer");
    pad_str(&mut info.model, "Unknown Model");
    pad_str(&mut info.serialNumber, "000001");
    info.ulMaxSessionCount = CK_EFFECTIVELY_INFINITE as CK_ULONG;
    info.ulSessionCount = CK_UNAVAILABLE_INFORMATION;
    info.ulMaxRwSessionCount = 0;
    info.ulRwSessionCount = 0;
    info.ulMaxPinLen = 255;
    info.ulMinPinLen = 1;
    info.ulTotalPublicMemory = CK_UNAVAILABLE_INFORMATION;
    info.ulFreePublicMemory = CK_UNAVAILABLE_INFORMATION;
    info.ulTotalPrivateMemory = CK_UNAVAILABLE_INFORMATION;
    info.ulFreePrivateMemory = CK_UNAVAILABLE_INFORMATION;
    info.hardwareVersion = CK_VERSION { major: 1, minor: 0 };
    info.firmwareVersion = CK_VERSION { major: 1, minor: 0 };
    pad_str(&mut info.utcTime, "1970010100000000");
    CKR_OK
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismList(
    slot_id: CK_SLOT_ID,
    p_mechanism_list: CK_MECHANISM_TYPE_PTR,
    pul_count: CK_ULONG_PTR,
) -> CK_RV {
    debug!(slot_id, "C_GetMechanismList called");
    if pul_count.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    let mechanisms = match bridge.mechanisms(slot_id) {
        Ok(mechanisms) => mechanisms,
        Err(err) => return translate_error(&err),
    };
    let types: Vec<CK_MECHANISM_TYPE> = mechanisms.iter().map(|spec| spec.mechanism).collect();
    unsafe { write_list(&types, p_mechanism_list, pul_count) }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismInfo(
    slot_id: CK_SLOT_ID,
    mechanism_type: CK_MECHANISM_TYPE,
    p_info: CK_MECHANISM_INFO_PTR,
) -> CK_RV {
    debug!(slot_id, mechanism_type, "C_GetMechanismInfo called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match bridge.mechanism_info(slot_id, mechanism_type) {
        Ok(spec) => {
            let info = unsafe { &mut *p_info };
            info.ulMinKeySize = spec.min_key_bits;
            info.ulMaxKeySize = spec.max_key_bits;
            info.flags = spec.flags;
            CKR_OK
        }
        Err(err) => translate_error(&err),
    }
}

// ----- sessions -------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn C_OpenSession(
    slot_id: CK_SLOT_ID,
    flags: CK_FLAGS,
    _p_application: CK_VOID_PTR,
    _notify: CK_NOTIFY,
    ph_session: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    debug!(slot_id, flags, "C_OpenSession called");
    if ph_session.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    match bridge.open_session(slot_id, flags) {
        Ok(handle) => {
            unsafe { *ph_session = handle };
            CKR_OK
        }
        Err(err) => translate_error(&err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseSession(h_session: CK_SESSION_HANDLE) -> CK_RV {
    debug!(h_session, "C_CloseSession called");
    match bridge() {
        Ok(bridge) => rv_from(bridge.close_session(h_session)),
        Err(rv) => rv,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseAllSessions(slot_id: CK_SLOT_ID) -> CK_RV {
    debug!(slot_id, "C_CloseAllSessions called");
    match bridge() {
        Ok(bridge) => rv_from(bridge.close_all_sessions(slot_id)),
        Err(rv) => rv,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSessionInfo(
    h_session: CK_SESSION_HANDLE,
    p_info: CK_SESSION_INFO_PTR,
) -> CK_RV {
    debug!(h_session, "C_GetSessionInfo called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match bridge.session_info(h_session) {
        Ok(description) => {
            let info = unsafe { &mut *p_info };
            info.slotID = description.slot_id;
            info.state = if description.user_functions {
                CKS_RO_USER_FUNCTIONS
            } else {
                CKS_RO_PUBLIC_SESSION
            };
            info.flags = CKF_SERIAL_SESSION;
            info.ulDeviceError = 0;
            CKR_OK
        }
        Err(err) => translate_error(&err),
    }
}

// ----- login ----------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn C_Login(
    h_session: CK_SESSION_HANDLE,
    user_type: CK_USER_TYPE,
    p_pin: CK_UTF8CHAR_PTR,
    ul_pin_len: CK_ULONG,
) -> CK_RV {
    debug!(h_session, user_type, "C_Login called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    // A null PIN delegates authentication to the platform.
    let pin = if p_pin.is_null() {
        None
    } else {
        Some(unsafe { std::slice::from_raw_parts(p_pin, ul_pin_len as usize) })
    };
    rv_from(bridge.login(h_session, user_type, pin))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Logout(h_session: CK_SESSION_HANDLE) -> CK_RV {
    debug!(h_session, "C_Logout called");
    match bridge() {
        Ok(bridge) => rv_from(bridge.logout(h_session)),
        Err(rv) => rv,
    }
}

// ----- objects --------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn C_GetAttributeValue(
    h_session: CK_SESSION_HANDLE,
    h_object: CK_OBJECT_HANDLE,
    p_template: CK_ATTRIBUTE_PTR,
    ul_count: CK_ULONG,
) -> CK_RV {
    debug!(h_session, h_object, ul_count, "C_GetAttributeValue called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_template.is_null() && ul_count != 0 {
        return CKR_ARGUMENTS_BAD;
    }

    let template: &mut [cryptoki_sys::CK_ATTRIBUTE] = if ul_count == 0 {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(p_template, ul_count as usize) }
    };
    let mut queries: Vec<AttributeQuery> = template
        .iter()
        .map(|attr| {
            if attr.pValue.is_null() {
                AttributeQuery::probe(attr.type_)
            } else {
                AttributeQuery::sized(attr.type_, attr.ulValueLen as usize)
            }
        })
        .collect();

    let summary = bridge.get_attribute_values(h_session, h_object, &mut queries);
    if let Err(err) = &summary {
        // Session and object failures happen before any outcome is set.
        if !matches!(err, BridgeError::AttributeTypeInvalid | BridgeError::BufferTooSmall(_)) {
            return translate_error(err);
        }
    }

    for (attr, query) in template.iter_mut().zip(&queries) {
        match &query.outcome {
            AttrOutcome::Value(value) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        value.as_ptr(),
                        attr.pValue as *mut u8,
                        value.len(),
                    );
                }
                attr.ulValueLen = value.len() as CK_ULONG;
            }
            AttrOutcome::Length(len) | AttrOutcome::TooSmall(len) => {
                attr.ulValueLen = *len as CK_ULONG;
            }
            AttrOutcome::Unavailable => attr.ulValueLen = CK_UNAVAILABLE_INFORMATION,
            AttrOutcome::Pending => {}
        }
    }
    rv_from(summary)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsInit(
    h_session: CK_SESSION_HANDLE,
    p_template: CK_ATTRIBUTE_PTR,
    ul_count: CK_ULONG,
) -> CK_RV {
    debug!(h_session, ul_count, "C_FindObjectsInit called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_template.is_null() && ul_count != 0 {
        return CKR_ARGUMENTS_BAD;
    }

    let raw: &[cryptoki_sys::CK_ATTRIBUTE] = if ul_count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(p_template, ul_count as usize) }
    };
    let template: Vec<TemplateAttribute> = raw
        .iter()
        .map(|attr| {
            // A null value pointer is kept as an explicit "no value"
            // entry, matching only attributes that also have none.
            if attr.pValue.is_null() || attr.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                TemplateAttribute { kind: attr.type_, value: None }
            } else {
                let value = unsafe {
                    std::slice::from_raw_parts(attr.pValue as *const u8, attr.ulValueLen as usize)
                };
                TemplateAttribute::new(attr.type_, value)
            }
        })
        .collect();

    rv_from(bridge.find_objects_init(h_session, template))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjects(
    h_session: CK_SESSION_HANDLE,
    ph_object: CK_OBJECT_HANDLE_PTR,
    ul_max_object_count: CK_ULONG,
    pul_object_count: CK_ULONG_PTR,
) -> CK_RV {
    debug!(h_session, ul_max_object_count, "C_FindObjects called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if ph_object.is_null() || pul_object_count.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match bridge.find_objects(h_session, ul_max_object_count as usize) {
        Ok(handles) => {
            unsafe {
                std::ptr::copy_nonoverlapping(handles.as_ptr(), ph_object, handles.len());
                *pul_object_count = handles.len() as CK_ULONG;
            }
            CKR_OK
        }
        Err(err) => translate_error(&err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsFinal(h_session: CK_SESSION_HANDLE) -> CK_RV {
    debug!(h_session, "C_FindObjectsFinal called");
    match bridge() {
        Ok(bridge) => rv_from(bridge.find_objects_final(h_session)),
        Err(rv) => rv,
    }
}

// ----- mechanism decoding ---------------------------------------------

/// Lift the caller's `CK_MECHANISM` into the engine's request type,
/// performing the pointer/size validation that only this layer can do.
fn decode_mechanism(p_mechanism: CK_MECHANISM_PTR) -> Result<MechanismRequest, CK_RV> {
    if p_mechanism.is_null() {
        return Err(CKR_MECHANISM_INVALID);
    }
    let mechanism = unsafe { &*p_mechanism };

    let params = match parameter_kind(mechanism.mechanism) {
        // Unknown mechanisms carry no parameters; the engine rejects
        // them with mechanism-invalid after its own lookup.
        None => MechanismParams::None,
        Some(ParameterKind::None) => {
            if mechanism.pParameter.is_null() && mechanism.ulParameterLen == 0 {
                MechanismParams::None
            } else {
                MechanismParams::Unexpected
            }
        }
        Some(ParameterKind::Oaep) => {
            if mechanism.pParameter.is_null()
                || mechanism.ulParameterLen as usize != std::mem::size_of::<CK_RSA_PKCS_OAEP_PARAMS>()
            {
                return Err(CKR_MECHANISM_PARAM_INVALID);
            }
            let oaep = unsafe { &*(mechanism.pParameter as *const CK_RSA_PKCS_OAEP_PARAMS) };
            MechanismParams::Oaep {
                hash_alg: oaep.hashAlg,
                mgf: oaep.mgf,
                source: oaep.source,
                source_data_present: !oaep.pSourceData.is_null(),
                source_data_len: oaep.ulSourceDataLen,
            }
        }
        Some(ParameterKind::Pss) => {
            if mechanism.pParameter.is_null()
                || mechanism.ulParameterLen as usize != std::mem::size_of::<CK_RSA_PKCS_PSS_PARAMS>()
            {
                return Err(CKR_MECHANISM_PARAM_INVALID);
            }
            let pss = unsafe { &*(mechanism.pParameter as *const CK_RSA_PKCS_PSS_PARAMS) };
            MechanismParams::Pss { hash_alg: pss.hashAlg, mgf: pss.mgf, salt_len: pss.sLen }
        }
    };

    Ok(MechanismRequest { mechanism: mechanism.mechanism, params })
}

// ----- crypto entry points --------------------------------------------

fn crypto_init(
    p_mechanism: CK_MECHANISM_PTR,
    init: impl FnOnce(&Arc<hostkey_core::Bridge>, &MechanismRequest) -> BridgeResult<()>,
) -> CK_RV {
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    let request = match decode_mechanism(p_mechanism) {
        Ok(request) => request,
        Err(rv) => return rv,
    };
    rv_from(init(&bridge, &request))
}

/// Read the caller's output buffer description: null buffer means probe,
/// otherwise the current `*pul_len` is the capacity.
unsafe fn out_capacity(p_out: CK_BYTE_PTR, pul_len: CK_ULONG_PTR) -> Option<usize> {
    if p_out.is_null() {
        None
    } else {
        Some(unsafe { *pul_len } as usize)
    }
}

/// Write a crypto result through the `(buffer, length)` out-parameters,
/// honoring the retryable buffer-too-small protocol.
unsafe fn finish_output(
    result: BridgeResult<CryptoOutput>,
    p_out: CK_BYTE_PTR,
    pul_len: CK_ULONG_PTR,
) -> CK_RV {
    match result {
        Ok(CryptoOutput::Size(size)) => {
            unsafe { *pul_len = size as CK_ULONG };
            CKR_OK
        }
        Ok(CryptoOutput::Data(data)) => {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), p_out, data.len());
                *pul_len = data.len() as CK_ULONG;
            }
            CKR_OK
        }
        Err(BridgeError::BufferTooSmall(required)) => {
            if required > 0 {
                unsafe { *pul_len = required as CK_ULONG };
            }
            CKR_BUFFER_TOO_SMALL
        }
        Err(err) => translate_error(&err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_EncryptInit(
    h_session: CK_SESSION_HANDLE,
    p_mechanism: CK_MECHANISM_PTR,
    h_key: CK_OBJECT_HANDLE,
) -> CK_RV {
    debug!(h_session, h_key, "C_EncryptInit called");
    crypto_init(p_mechanism, |bridge, request| {
        bridge.encrypt_init(h_session, request, h_key)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Encrypt(
    h_session: CK_SESSION_HANDLE,
    p_data: CK_BYTE_PTR,
    ul_data_len: CK_ULONG,
    p_encrypted_data: CK_BYTE_PTR,
    pul_encrypted_data_len: CK_ULONG_PTR,
) -> CK_RV {
    debug!(h_session, ul_data_len, "C_Encrypt called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_data.is_null() || pul_encrypted_data_len.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let data = unsafe { std::slice::from_raw_parts(p_data, ul_data_len as usize) };
    let capacity = unsafe { out_capacity(p_encrypted_data, pul_encrypted_data_len) };
    let result = bridge.encrypt(h_session, data, capacity);
    unsafe { finish_output(result, p_encrypted_data, pul_encrypted_data_len) }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptInit(
    h_session: CK_SESSION_HANDLE,
    p_mechanism: CK_MECHANISM_PTR,
    h_key: CK_OBJECT_HANDLE,
) -> CK_RV {
    debug!(h_session, h_key, "C_DecryptInit called");
    crypto_init(p_mechanism, |bridge, request| {
        bridge.decrypt_init(h_session, request, h_key)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Decrypt(
    h_session: CK_SESSION_HANDLE,
    p_encrypted_data: CK_BYTE_PTR,
    ul_encrypted_data_len: CK_ULONG,
    p_data: CK_BYTE_PTR,
    pul_data_len: CK_ULONG_PTR,
) -> CK_RV {
    debug!(h_session, ul_encrypted_data_len, "C_Decrypt called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_encrypted_data.is_null() || pul_data_len.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let data = unsafe { std::slice::from_raw_parts(p_encrypted_data, ul_encrypted_data_len as usize) };
    let capacity = unsafe { out_capacity(p_data, pul_data_len) };
    let result = bridge.decrypt(h_session, data, capacity);
    unsafe { finish_output(result, p_data, pul_data_len) }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignInit(
    h_session: CK_SESSION_HANDLE,
    p_mechanism: CK_MECHANISM_PTR,
    h_key: CK_OBJECT_HANDLE,
) -> CK_RV {
    debug!(h_session, h_key, "C_SignInit called");
    crypto_init(p_mechanism, |bridge, request| {
        bridge.sign_init(h_session, request, h_key)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Sign(
    h_session: CK_SESSION_HANDLE,
    p_data: CK_BYTE_PTR,
    ul_data_len: CK_ULONG,
    p_signature: CK_BYTE_PTR,
    pul_signature_len: CK_ULONG_PTR,
) -> CK_RV {
    debug!(h_session, ul_data_len, "C_Sign called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_data.is_null() || pul_signature_len.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let data = unsafe { std::slice::from_raw_parts(p_data, ul_data_len as usize) };
    dump_to_env_file(SIGN_DATAFILE_ENV, data);

    let capacity = unsafe { out_capacity(p_signature, pul_signature_len) };
    let result = bridge.sign(h_session, data, capacity);
    if let Ok(CryptoOutput::Data(signature)) = &result {
        dump_to_env_file(SIGN_SIGFILE_ENV, signature);
    }
    unsafe { finish_output(result, p_signature, pul_signature_len) }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignUpdate(
    h_session: CK_SESSION_HANDLE,
    p_part: CK_BYTE_PTR,
    ul_part_len: CK_ULONG,
) -> CK_RV {
    debug!(h_session, ul_part_len, "C_SignUpdate called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_part.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let data = unsafe { std::slice::from_raw_parts(p_part, ul_part_len as usize) };
    rv_from(bridge.sign_update(h_session, data))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignFinal(
    h_session: CK_SESSION_HANDLE,
    p_signature: CK_BYTE_PTR,
    pul_signature_len: CK_ULONG_PTR,
) -> CK_RV {
    debug!(h_session, "C_SignFinal called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if pul_signature_len.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let capacity = unsafe { out_capacity(p_signature, pul_signature_len) };
    let result = bridge.sign_final(h_session, capacity);
    unsafe { finish_output(result, p_signature, pul_signature_len) }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyInit(
    h_session: CK_SESSION_HANDLE,
    p_mechanism: CK_MECHANISM_PTR,
    h_key: CK_OBJECT_HANDLE,
) -> CK_RV {
    debug!(h_session, h_key, "C_VerifyInit called");
    crypto_init(p_mechanism, |bridge, request| {
        bridge.verify_init(h_session, request, h_key)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Verify(
    h_session: CK_SESSION_HANDLE,
    p_data: CK_BYTE_PTR,
    ul_data_len: CK_ULONG,
    p_signature: CK_BYTE_PTR,
    ul_signature_len: CK_ULONG,
) -> CK_RV {
    debug!(h_session, ul_data_len, ul_signature_len, "C_Verify called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_data.is_null() || p_signature.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let data = unsafe { std::slice::from_raw_parts(p_data, ul_data_len as usize) };
    let signature = unsafe { std::slice::from_raw_parts(p_signature, ul_signature_len as usize) };
    rv_from(bridge.verify(h_session, data, signature))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyUpdate(
    h_session: CK_SESSION_HANDLE,
    p_part: CK_BYTE_PTR,
    ul_part_len: CK_ULONG,
) -> CK_RV {
    debug!(h_session, ul_part_len, "C_VerifyUpdate called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_part.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let data = unsafe { std::slice::from_raw_parts(p_part, ul_part_len as usize) };
    rv_from(bridge.verify_update(h_session, data))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyFinal(
    h_session: CK_SESSION_HANDLE,
    p_signature: CK_BYTE_PTR,
    ul_signature_len: CK_ULONG,
) -> CK_RV {
    debug!(h_session, ul_signature_len, "C_VerifyFinal called");
    let bridge = match bridge() {
        Ok(bridge) => bridge,
        Err(rv) => return rv,
    };
    if p_signature.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let signature = unsafe { std::slice::from_raw_parts(p_signature, ul_signature_len as usize) };
    rv_from(bridge.verify_final(h_session, signature))
}

/// Write a buffer to the file named by an environment variable, for
/// offline inspection of signing traffic. Failures only log.
fn dump_to_env_file(var: &str, data: &[u8]) {
    if let Ok(path) = std::env::var(var) {
        if let Err(err) = std::fs::write(&path, data) {
            debug!(path, %err, "failed to write debug dump");
        }
    }
}

// ----- unsupported functions ------------------------------------------

macro_rules! not_supported {
    ($(fn $name:ident($($arg:ty),*);)+) => {$(
        #[unsafe(no_mangle)]
        pub extern "C" fn $name($(_: $arg),*) -> CK_RV {
            if !initialized() {
                return CKR_CRYPTOKI_NOT_INITIALIZED;
            }
            debug!(concat!(stringify!($name), " is not supported"));
            CKR_FUNCTION_NOT_SUPPORTED
        }
    )+};
}

not_supported! {
    fn C_InitToken(CK_SLOT_ID, CK_UTF8CHAR_PTR, CK_ULONG, CK_UTF8CHAR_PTR);
    fn C_InitPIN(CK_SESSION_HANDLE, CK_UTF8CHAR_PTR, CK_ULONG);
    fn C_SetPIN(CK_SESSION_HANDLE, CK_UTF8CHAR_PTR, CK_ULONG, CK_UTF8CHAR_PTR, CK_ULONG);
    fn C_GetOperationState(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_SetOperationState(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE);
    fn C_CreateObject(CK_SESSION_HANDLE, CK_ATTRIBUTE_PTR, CK_ULONG, CK_OBJECT_HANDLE_PTR);
    fn C_CopyObject(CK_SESSION_HANDLE, CK_OBJECT_HANDLE, CK_ATTRIBUTE_PTR, CK_ULONG, CK_OBJECT_HANDLE_PTR);
    fn C_DestroyObject(CK_SESSION_HANDLE, CK_OBJECT_HANDLE);
    fn C_GetObjectSize(CK_SESSION_HANDLE, CK_OBJECT_HANDLE, CK_ULONG_PTR);
    fn C_SetAttributeValue(CK_SESSION_HANDLE, CK_OBJECT_HANDLE, CK_ATTRIBUTE_PTR, CK_ULONG);
    fn C_EncryptUpdate(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_EncryptFinal(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_DecryptUpdate(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_DecryptFinal(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_DigestInit(CK_SESSION_HANDLE, CK_MECHANISM_PTR);
    fn C_Digest(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_DigestUpdate(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG);
    fn C_DigestKey(CK_SESSION_HANDLE, CK_OBJECT_HANDLE);
    fn C_DigestFinal(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_SignRecoverInit(CK_SESSION_HANDLE, CK_MECHANISM_PTR, CK_OBJECT_HANDLE);
    fn C_SignRecover(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_VerifyRecoverInit(CK_SESSION_HANDLE, CK_MECHANISM_PTR, CK_OBJECT_HANDLE);
    fn C_VerifyRecover(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_DigestEncryptUpdate(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_DecryptDigestUpdate(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_SignEncryptUpdate(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_DecryptVerifyUpdate(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_GenerateKey(CK_SESSION_HANDLE, CK_MECHANISM_PTR, CK_ATTRIBUTE_PTR, CK_ULONG, CK_OBJECT_HANDLE_PTR);
    fn C_GenerateKeyPair(CK_SESSION_HANDLE, CK_MECHANISM_PTR, CK_ATTRIBUTE_PTR, CK_ULONG, CK_ATTRIBUTE_PTR, CK_ULONG, CK_OBJECT_HANDLE_PTR, CK_OBJECT_HANDLE_PTR);
    fn C_WrapKey(CK_SESSION_HANDLE, CK_MECHANISM_PTR, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR);
    fn C_UnwrapKey(CK_SESSION_HANDLE, CK_MECHANISM_PTR, CK_OBJECT_HANDLE, CK_BYTE_PTR, CK_ULONG, CK_ATTRIBUTE_PTR, CK_ULONG, CK_OBJECT_HANDLE_PTR);
    fn C_DeriveKey(CK_SESSION_HANDLE, CK_MECHANISM_PTR, CK_OBJECT_HANDLE, CK_ATTRIBUTE_PTR, CK_ULONG, CK_OBJECT_HANDLE_PTR);
    fn C_SeedRandom(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG);
    fn C_GenerateRandom(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG);
    fn C_GetFunctionStatus(CK_SESSION_HANDLE);
    fn C_CancelFunction(CK_SESSION_HANDLE);
    fn C_WaitForSlotEvent(CK_FLAGS, CK_SLOT_ID_PTR, CK_VOID_PTR);
}

// ----- function list --------------------------------------------------

static FUNCTION_LIST: CK_FUNCTION_LIST = CK_FUNCTION_LIST {
    version: CK_VERSION { major: 2, minor: 40 },
    C_Initialize: Some(C_Initialize),
    C_Finalize: Some(C_Finalize),
    C_GetInfo: Some(C_GetInfo),
    C_GetFunctionList: Some(C_GetFunctionList),
    C_GetSlotList: Some(C_GetSlotList),
    C_GetSlotInfo: Some(C_GetSlotInfo),
    C_GetTokenInfo: Some(C_GetTokenInfo),
    C_GetMechanismList: Some(C_GetMechanismList),
    C_GetMechanismInfo: Some(C_GetMechanismInfo),
    C_InitToken: Some(C_InitToken),
    C_InitPIN: Some(C_InitPIN),
    C_SetPIN: Some(C_SetPIN),
    C_OpenSession: Some(C_OpenSession),
    C_CloseSession: Some(C_CloseSession),
    C_CloseAllSessions: Some(C_CloseAllSessions),
    C_GetSessionInfo: Some(C_GetSessionInfo),
    C_GetOperationState: Some(C_GetOperationState),
    C_SetOperationState: Some(C_SetOperationState),
    C_Login: Some(C_Login),
    C_Logout: Some(C_Logout),
    C_CreateObject: Some(C_CreateObject),
    C_CopyObject: Some(C_CopyObject),
    C_DestroyObject: Some(C_DestroyObject),
    C_GetObjectSize: Some(C_GetObjectSize),
    C_GetAttributeValue: Some(C_GetAttributeValue),
    C_SetAttributeValue: Some(C_SetAttributeValue),
    C_FindObjectsInit: Some(C_FindObjectsInit),
    C_FindObjects: Some(C_FindObjects),
    C_FindObjectsFinal: Some(C_FindObjectsFinal),
    C_EncryptInit: Some(C_EncryptInit),
    C_Encrypt: Some(C_Encrypt),
    C_EncryptUpdate: Some(C_EncryptUpdate),
    C_EncryptFinal: Some(C_EncryptFinal),
    C_DecryptInit: Some(C_DecryptInit),
    C_Decrypt: Some(C_Decrypt),
    C_DecryptUpdate: Some(C_DecryptUpdate),
    C_DecryptFinal: Some(C_DecryptFinal),
    C_DigestInit: Some(C_DigestInit),
    C_Digest: Some(C_Digest),
    C_DigestUpdate: Some(C_DigestUpdate),
    C_DigestKey: Some(C_DigestKey),
    C_DigestFinal: Some(C_DigestFinal),
    C_SignInit: Some(C_SignInit),
    C_Sign: Some(C_Sign),
    C_SignUpdate: Some(C_SignUpdate),
    C_SignFinal: Some(C_SignFinal),
    C_SignRecoverInit: Some(C_SignRecoverInit),
    C_SignRecover: Some(C_SignRecover),
    C_VerifyInit: Some(C_VerifyInit),
    C_Verify: Some(C_Verify),
    C_VerifyUpdate: Some(C_VerifyUpdate),
    C_VerifyFinal: Some(C_VerifyFinal),
    C_VerifyRecoverInit: Some(C_VerifyRecoverInit),
    C_VerifyRecover: Some(C_VerifyRecover),
    C_DigestEncryptUpdate: Some(C_DigestEncryptUpdate),
    C_DecryptDigestUpdate: Some(C_DecryptDigestUpdate),
    C_SignEncryptUpdate: Some(C_SignEncryptUpdate),
    C_DecryptVerifyUpdate: Some(C_DecryptVerifyUpdate),
    C_GenerateKey: Some(C_GenerateKey),
    C_GenerateKeyPair: Some(C_GenerateKeyPair),
    C_WrapKey: Some(C_WrapKey),
    C_UnwrapKey: Some(C_UnwrapKey),
    C_DeriveKey: Some(C_DeriveKey),
    C_SeedRandom: Some(C_SeedRandom),
    C_GenerateRandom: Some(C_GenerateRandom),
    C_GetFunctionStatus: Some(C_GetFunctionStatus),
    C_CancelFunction: Some(C_CancelFunction),
    C_WaitForSlotEvent: Some(C_WaitForSlotEvent),
};
