//! A minimal PKCS#11 provider: one slot holding an eID-style token with two
//! data objects.
//!
//! Built as a `cdylib` so tests can load it through the real platform
//! loader, and as an `rlib` so in-process tests can reach the same table and
//! inspect its call state. State is per thread, which keeps parallel tests
//! apart.

#![allow(non_snake_case)]

use std::cell::RefCell;
use std::ffi::OsStr;
use std::ptr;

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_BBOOL, CK_FLAGS, CK_FUNCTION_LIST, CK_INFO, CK_NOTIFY, CK_OBJECT_HANDLE,
    CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CK_VERSION,
    CK_VOID_PTR, CKA_CLASS, CKA_LABEL, CKA_VALUE, CKF_HW_SLOT, CKF_SERIAL_SESSION,
    CKF_TOKEN_PRESENT, CKO_DATA, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_GENERAL_ERROR, CKR_OK,
    CKR_OPERATION_NOT_INITIALIZED, CKR_SESSION_HANDLE_INVALID, CKR_SLOT_ID_INVALID,
    CKR_TEMPLATE_INCONSISTENT,
};

/// The only slot, which always holds a token.
pub const SLOT: CK_SLOT_ID = 3;

pub const SESSION: CK_SESSION_HANDLE = 0xc0de;

/// Data objects on the token: handle, label, value.
pub const OBJECTS: &[(CK_OBJECT_HANDLE, &str, &[u8])] = &[
    (0x10, "carddata_appl_version", &[0x17]),
    (0x11, "PHOTO_FILE", &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F']),
];

/// Switches `C_GetFunctionList` into a failure mode when set: `error`
/// returns `CKR_GENERAL_ERROR`, `null` returns `CKR_OK` without a table.
pub const ENTRY_POINT_MODE: &str = "HSM_FIXTURE_ENTRY_POINT";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub initialized: bool,
    pub open_sessions: u32,
    pub find_active: bool,
    pub cursor: usize,
    pub find_inits: u32,
    pub find_finals: u32,
    pub finalizes: u32,
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State::default());
}

/// Runs `f` against the calling thread's provider state.
pub fn state<R>(f: impl FnOnce(&mut State) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    field[..text.len()].copy_from_slice(text.as_bytes());
    field
}

/// Returns the provider's function table.
///
/// # Safety
///
/// `list` must be null or valid for a pointer-sized write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn C_GetFunctionList(list: *mut *mut CK_FUNCTION_LIST) -> CK_RV {
    if list.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let table = match std::env::var_os(ENTRY_POINT_MODE).as_deref().and_then(OsStr::to_str) {
        Some("error") => return CKR_GENERAL_ERROR,
        Some("null") => ptr::null_mut(),
        _ => ptr::addr_of!(FUNCTION_LIST).cast_mut(),
    };
    // SAFETY: checked non-null above.
    unsafe { *list = table };
    CKR_OK
}

unsafe extern "C" fn initialize(_args: CK_VOID_PTR) -> CK_RV {
    state(|state| state.initialized = true);
    CKR_OK
}

unsafe extern "C" fn finalize(_reserved: CK_VOID_PTR) -> CK_RV {
    state(|state| {
        state.finalizes += 1;
        if std::mem::take(&mut state.initialized) {
            CKR_OK
        } else {
            CKR_CRYPTOKI_NOT_INITIALIZED
        }
    })
}

unsafe extern "C" fn get_info(info: *mut CK_INFO) -> CK_RV {
    if info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // SAFETY: non-null, and callers pass a valid CK_INFO.
    let info = unsafe { &mut *info };
    info.cryptokiVersion = CK_VERSION { major: 2, minor: 40 };
    info.manufacturerID = padded("Fixture Provider");
    info.flags = 0;
    info.libraryDescription = padded("hsm-bridge test module");
    info.libraryVersion = CK_VERSION { major: 1, minor: 7 };
    CKR_OK
}

unsafe extern "C" fn get_slot_list(
    token_present: CK_BBOOL,
    slots: *mut CK_SLOT_ID,
    count: *mut CK_ULONG,
) -> CK_RV {
    if token_present == 0 || count.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // SAFETY: `count` is non-null; `slots` holds `*count` entries when set.
    unsafe {
        if !slots.is_null() {
            if *count < 1 {
                *count = 1;
                return CKR_BUFFER_TOO_SMALL;
            }
            *slots = SLOT;
        }
        *count = 1;
    }
    CKR_OK
}

unsafe extern "C" fn get_slot_info(slot: CK_SLOT_ID, info: *mut CK_SLOT_INFO) -> CK_RV {
    if slot != SLOT {
        return CKR_SLOT_ID_INVALID;
    }
    // SAFETY: callers pass a valid CK_SLOT_INFO.
    let info = unsafe { &mut *info };
    info.slotDescription = padded("Fixture Reader 00");
    info.manufacturerID = padded("Fixture Provider");
    info.flags = CKF_TOKEN_PRESENT | CKF_HW_SLOT;
    info.hardwareVersion = CK_VERSION { major: 1, minor: 0 };
    info.firmwareVersion = CK_VERSION { major: 0, minor: 3 };
    CKR_OK
}

unsafe extern "C" fn get_token_info(slot: CK_SLOT_ID, info: *mut CK_TOKEN_INFO) -> CK_RV {
    if slot != SLOT {
        return CKR_SLOT_ID_INVALID;
    }
    // SAFETY: callers pass a valid CK_TOKEN_INFO.
    let info = unsafe { &mut *info };
    info.label = padded("BELPIC");
    info.manufacturerID = padded("Fixture Provider");
    info.model = padded("eID v1.8");
    info.serialNumber = padded("534c0000a1b2");
    CKR_OK
}

unsafe extern "C" fn open_session(
    slot: CK_SLOT_ID,
    flags: CK_FLAGS,
    _application: CK_VOID_PTR,
    _notify: CK_NOTIFY,
    session: *mut CK_SESSION_HANDLE,
) -> CK_RV {
    if slot != SLOT {
        return CKR_SLOT_ID_INVALID;
    }
    if flags & CKF_SERIAL_SESSION == 0 || session.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    state(|state| state.open_sessions += 1);
    // SAFETY: checked non-null above.
    unsafe { *session = SESSION };
    CKR_OK
}

unsafe extern "C" fn close_session(session: CK_SESSION_HANDLE) -> CK_RV {
    if session != SESSION {
        return CKR_SESSION_HANDLE_INVALID;
    }
    state(|state| state.open_sessions -= 1);
    CKR_OK
}

unsafe extern "C" fn find_objects_init(
    session: CK_SESSION_HANDLE,
    template: *mut CK_ATTRIBUTE,
    count: CK_ULONG,
) -> CK_RV {
    if session != SESSION || count != 1 || template.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // SAFETY: one attribute, as checked above.
    let attribute = unsafe { ptr::read_unaligned(template) };
    if attribute.type_ != CKA_CLASS || attribute.ulValueLen as usize != size_of::<CK_ULONG>() {
        return CKR_TEMPLATE_INCONSISTENT;
    }
    // SAFETY: the value is a CK_ULONG, per the length check.
    let class = unsafe { ptr::read_unaligned(attribute.pValue.cast::<CK_ULONG>()) };
    if class != CKO_DATA {
        return CKR_TEMPLATE_INCONSISTENT;
    }
    state(|state| {
        state.find_active = true;
        state.cursor = 0;
        state.find_inits += 1;
    });
    CKR_OK
}

unsafe extern "C" fn find_objects(
    _session: CK_SESSION_HANDLE,
    objects: *mut CK_OBJECT_HANDLE,
    max_count: CK_ULONG,
    count: *mut CK_ULONG,
) -> CK_RV {
    state(|state| {
        if !state.find_active {
            return CKR_OPERATION_NOT_INITIALIZED;
        }
        let next = OBJECTS.get(state.cursor).filter(|_| max_count > 0);
        // SAFETY: callers pass room for `max_count` handles and a count.
        unsafe {
            match next {
                Some((handle, _, _)) => {
                    *objects = *handle;
                    *count = 1;
                    state.cursor += 1;
                }
                None => *count = 0,
            }
        }
        CKR_OK
    })
}

unsafe extern "C" fn find_objects_final(_session: CK_SESSION_HANDLE) -> CK_RV {
    state(|state| {
        if !std::mem::take(&mut state.find_active) {
            return CKR_OPERATION_NOT_INITIALIZED;
        }
        state.find_finals += 1;
        CKR_OK
    })
}

/// Answers one attribute at a time, with `CKR_BUFFER_TOO_SMALL` when the
/// caller's buffer cannot hold the whole value.
unsafe extern "C" fn get_attribute_value(
    _session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    template: *mut CK_ATTRIBUTE,
    count: CK_ULONG,
) -> CK_RV {
    if count != 1 || template.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let Some((_, label, value)) = OBJECTS.iter().find(|(handle, _, _)| *handle == object) else {
        return CKR_ARGUMENTS_BAD;
    };
    // SAFETY: exactly one attribute, as checked above.
    let mut attribute = unsafe { ptr::read_unaligned(template) };
    let data: &[u8] = match attribute.type_ {
        CKA_LABEL => label.as_bytes(),
        CKA_VALUE => value,
        _ => return CKR_ATTRIBUTE_TYPE_INVALID,
    };
    let rv = if attribute.pValue.is_null() {
        CKR_OK
    } else if (attribute.ulValueLen as usize) < data.len() {
        CKR_BUFFER_TOO_SMALL
    } else {
        // SAFETY: the destination holds at least `data.len()` bytes.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), attribute.pValue.cast::<u8>(), data.len())
        };
        CKR_OK
    };
    attribute.ulValueLen = data.len() as CK_ULONG;
    // SAFETY: same attribute as read above.
    unsafe { ptr::write_unaligned(template, attribute) };
    rv
}

static FUNCTION_LIST: CK_FUNCTION_LIST = {
    // SAFETY: every entry is an optional function pointer, for which all
    // zero bits is `None`.
    let mut list: CK_FUNCTION_LIST = unsafe { std::mem::zeroed() };
    list.version = CK_VERSION { major: 2, minor: 40 };
    list.C_Initialize = Some(initialize);
    list.C_Finalize = Some(finalize);
    list.C_GetInfo = Some(get_info);
    list.C_GetFunctionList = Some(C_GetFunctionList);
    list.C_GetSlotList = Some(get_slot_list);
    list.C_GetSlotInfo = Some(get_slot_info);
    list.C_GetTokenInfo = Some(get_token_info);
    list.C_OpenSession = Some(open_session);
    list.C_CloseSession = Some(close_session);
    list.C_GetAttributeValue = Some(get_attribute_value);
    list.C_FindObjectsInit = Some(find_objects_init);
    list.C_FindObjects = Some(find_objects);
    list.C_FindObjectsFinal = Some(find_objects_final);
    list
};
