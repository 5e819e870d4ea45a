//! Binary layout of the provider function table.
//!
//! A provider hands back a pointer to a `CK_FUNCTION_LIST` whose layout was
//! fixed when the provider was compiled. Nothing at runtime can detect a
//! mismatch, so the table below is checked against the `cryptoki-sys`
//! definition at compile time: any drift in size or in the offset of an
//! entry the bridge calls fails the build.
//!
//! Only the entries the bridge calls carry a typed signature. The remaining
//! named entries and the reserved tail keep the table the size of the full
//! v2.40 interface.

#![allow(non_snake_case)]

use std::mem::{offset_of, size_of};

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_BBOOL, CK_FLAGS, CK_FUNCTION_LIST, CK_INFO, CK_NOTIFICATION,
    CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO,
    CK_ULONG, CK_VERSION, CK_VOID_PTR,
};

pub use cryptoki_sys::{
    CK_UNAVAILABLE_INFORMATION, CKA_CLASS, CKA_LABEL, CKA_VALUE, CKF_HW_SLOT,
    CKF_REMOVABLE_DEVICE, CKF_SERIAL_SESSION, CKF_TOKEN_PRESENT, CKO_DATA, CKR_BUFFER_TOO_SMALL,
    CKR_FUNCTION_NOT_SUPPORTED, CKR_GENERAL_ERROR, CKR_OK,
};

/// Exported symbol every provider module must carry.
pub const ENTRY_POINT: &[u8] = b"C_GetFunctionList\0";

/// `CK_TRUE` in the width `C_GetSlotList` expects.
pub const TOKEN_PRESENT: CK_BBOOL = 1;

/// Entries of the v2.40 table that follow `C_FindObjectsFinal`.
pub const RESERVED_ENTRIES: usize = 39;

pub type InitializeFn = unsafe extern "C" fn(init_args: CK_VOID_PTR) -> CK_RV;
pub type FinalizeFn = unsafe extern "C" fn(reserved: CK_VOID_PTR) -> CK_RV;
pub type GetInfoFn = unsafe extern "C" fn(info: *mut CK_INFO) -> CK_RV;
pub type GetFunctionListFn = unsafe extern "C" fn(list: *mut *mut FunctionTable) -> CK_RV;
pub type GetSlotListFn = unsafe extern "C" fn(
    token_present: CK_BBOOL,
    slot_list: *mut CK_SLOT_ID,
    count: *mut CK_ULONG,
) -> CK_RV;
pub type GetSlotInfoFn = unsafe extern "C" fn(slot: CK_SLOT_ID, info: *mut CK_SLOT_INFO) -> CK_RV;
pub type GetTokenInfoFn =
    unsafe extern "C" fn(slot: CK_SLOT_ID, info: *mut CK_TOKEN_INFO) -> CK_RV;
pub type NotifyFn = Option<
    unsafe extern "C" fn(
        session: CK_SESSION_HANDLE,
        event: CK_NOTIFICATION,
        application: CK_VOID_PTR,
    ) -> CK_RV,
>;
pub type OpenSessionFn = unsafe extern "C" fn(
    slot: CK_SLOT_ID,
    flags: CK_FLAGS,
    application: CK_VOID_PTR,
    notify: NotifyFn,
    session: *mut CK_SESSION_HANDLE,
) -> CK_RV;
pub type CloseSessionFn = unsafe extern "C" fn(session: CK_SESSION_HANDLE) -> CK_RV;
pub type GetAttributeValueFn = unsafe extern "C" fn(
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    template: *mut CK_ATTRIBUTE,
    count: CK_ULONG,
) -> CK_RV;
pub type FindObjectsInitFn = unsafe extern "C" fn(
    session: CK_SESSION_HANDLE,
    template: *mut CK_ATTRIBUTE,
    count: CK_ULONG,
) -> CK_RV;
pub type FindObjectsFn = unsafe extern "C" fn(
    session: CK_SESSION_HANDLE,
    objects: *mut CK_OBJECT_HANDLE,
    max_count: CK_ULONG,
    count: *mut CK_ULONG,
) -> CK_RV;
pub type FindObjectsFinalFn = unsafe extern "C" fn(session: CK_SESSION_HANDLE) -> CK_RV;

/// Placeholder signature for entries the bridge never calls.
pub type UncalledFn = unsafe extern "C" fn() -> CK_RV;

/// `CK_FUNCTION_LIST` as laid out by the v2.40 headers.
///
/// The headers pack structures to one byte on Windows, so the table does too.
#[cfg_attr(windows, repr(C, packed))]
#[cfg_attr(not(windows), repr(C))]
#[derive(Clone, Copy)]
pub struct FunctionTable {
    pub version: CK_VERSION,
    pub C_Initialize: Option<InitializeFn>,
    pub C_Finalize: Option<FinalizeFn>,
    pub C_GetInfo: Option<GetInfoFn>,
    pub C_GetFunctionList: Option<GetFunctionListFn>,
    pub C_GetSlotList: Option<GetSlotListFn>,
    pub C_GetSlotInfo: Option<GetSlotInfoFn>,
    pub C_GetTokenInfo: Option<GetTokenInfoFn>,
    pub C_GetMechanismList: Option<UncalledFn>,
    pub C_GetMechanismInfo: Option<UncalledFn>,
    pub C_InitToken: Option<UncalledFn>,
    pub C_InitPIN: Option<UncalledFn>,
    pub C_SetPIN: Option<UncalledFn>,
    pub C_OpenSession: Option<OpenSessionFn>,
    pub C_CloseSession: Option<CloseSessionFn>,
    pub C_CloseAllSessions: Option<UncalledFn>,
    pub C_GetSessionInfo: Option<UncalledFn>,
    pub C_GetOperationState: Option<UncalledFn>,
    pub C_SetOperationState: Option<UncalledFn>,
    pub C_Login: Option<UncalledFn>,
    pub C_Logout: Option<UncalledFn>,
    pub C_CreateObject: Option<UncalledFn>,
    pub C_CopyObject: Option<UncalledFn>,
    pub C_DestroyObject: Option<UncalledFn>,
    pub C_GetObjectSize: Option<UncalledFn>,
    pub C_GetAttributeValue: Option<GetAttributeValueFn>,
    pub C_SetAttributeValue: Option<UncalledFn>,
    pub C_FindObjectsInit: Option<FindObjectsInitFn>,
    pub C_FindObjects: Option<FindObjectsFn>,
    pub C_FindObjectsFinal: Option<FindObjectsFinalFn>,
    pub reserved: [Option<UncalledFn>; RESERVED_ENTRIES],
}

impl FunctionTable {
    /// A table with every entry absent. Fixtures fill in what they implement.
    pub const fn unpopulated(version: CK_VERSION) -> Self {
        Self {
            version,
            C_Initialize: None,
            C_Finalize: None,
            C_GetInfo: None,
            C_GetFunctionList: None,
            C_GetSlotList: None,
            C_GetSlotInfo: None,
            C_GetTokenInfo: None,
            C_GetMechanismList: None,
            C_GetMechanismInfo: None,
            C_InitToken: None,
            C_InitPIN: None,
            C_SetPIN: None,
            C_OpenSession: None,
            C_CloseSession: None,
            C_CloseAllSessions: None,
            C_GetSessionInfo: None,
            C_GetOperationState: None,
            C_SetOperationState: None,
            C_Login: None,
            C_Logout: None,
            C_CreateObject: None,
            C_CopyObject: None,
            C_DestroyObject: None,
            C_GetObjectSize: None,
            C_GetAttributeValue: None,
            C_SetAttributeValue: None,
            C_FindObjectsInit: None,
            C_FindObjects: None,
            C_FindObjectsFinal: None,
            reserved: [None; RESERVED_ENTRIES],
        }
    }
}

macro_rules! assert_same_offset {
    ($($field:ident),* $(,)?) => {
        $(
            assert!(
                offset_of!(FunctionTable, $field) == offset_of!(CK_FUNCTION_LIST, $field),
                concat!("function table entry out of place: ", stringify!($field)),
            );
        )*
    };
}

const _: () = {
    assert!(size_of::<FunctionTable>() == size_of::<CK_FUNCTION_LIST>());
    assert!(size_of::<Option<UncalledFn>>() == size_of::<*const ()>());
    assert_same_offset!(
        version,
        C_Initialize,
        C_Finalize,
        C_GetInfo,
        C_GetFunctionList,
        C_GetSlotList,
        C_GetSlotInfo,
        C_GetTokenInfo,
        C_OpenSession,
        C_CloseSession,
        C_GetAttributeValue,
        C_FindObjectsInit,
        C_FindObjects,
        C_FindObjectsFinal,
    );
};
