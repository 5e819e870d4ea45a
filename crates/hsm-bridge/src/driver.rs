//! Session and object enumeration against a provider.
//!
//! `initialize` and `finalize_provider` pass the provider status straight
//! through. The enumeration operations come in two forms: `try_*` reports
//! which step failed, while [`get_slot_list`] and [`list_data_objects`]
//! collapse any failure into an empty (or partial) result. Callers of the
//! latter cannot tell "nothing there" apart from "a provider call failed".
//!
//! Sessions and find operations are opened and closed within a single call.
//! Both are held by guards, so `C_FindObjectsFinal` and `C_CloseSession`
//! run exactly once whenever the matching init succeeded.

use cryptoki_sys::{
    CK_INFO, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_SLOT_INFO,
    CK_TOKEN_INFO, CK_ULONG,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::abi::{CKA_CLASS, CKA_LABEL, CKA_VALUE, CKF_SERIAL_SESSION, CKO_DATA, CKR_OK};
use crate::marshal::{
    self, LibraryInfo, MAX_ATTRIBUTE_LEN, MAX_SLOT_COUNT, ProbeError, SlotInfo, TemplateAttribute,
    TokenInfo,
};
use crate::provider::TokenProvider;

/// Capacity of the label buffer.
///
/// A conformant provider answers a longer label with `CKR_BUFFER_TOO_SMALL`,
/// and the object is then skipped like any other unreadable label. Only a
/// provider that copies a partial label and still returns `CKR_OK` yields a
/// label cut at this length.
pub const LABEL_CAPACITY: usize = 64;

/// A `CKO_DATA` object read from a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataObject {
    pub handle: CK_OBJECT_HANDLE,
    pub label: String,
    /// `None` when the value could not be read.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    OpenSession,
    FindObjectsInit,
}

impl Step {
    pub fn function(self) -> &'static str {
        match self {
            Step::OpenSession => "C_OpenSession",
            Step::FindObjectsInit => "C_FindObjectsInit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnumerationError {
    #[error("C_GetSlotList: {0}")]
    SlotList(ProbeError),
    #[error("{} failed with CK_RV {rv:#x}", .step.function())]
    Provider { step: Step, rv: CK_RV },
    /// `C_FindObjects` failed after `found` objects had been read.
    #[error("C_FindObjects failed with CK_RV {rv:#x} after {} object(s)", .found.len())]
    Interrupted { rv: CK_RV, found: Vec<DataObject> },
}

pub fn initialize<P: TokenProvider + ?Sized>(provider: &P) -> CK_RV {
    let rv = provider.initialize();
    debug!(rv, "C_Initialize");
    rv
}

/// Calling this without a successful [`initialize`] is the caller's concern.
pub fn finalize_provider<P: TokenProvider + ?Sized>(provider: &P) -> CK_RV {
    let rv = provider.finalize();
    debug!(rv, "C_Finalize");
    rv
}

/// Slots with a token present, via the count-then-fill protocol.
pub fn try_get_slot_list<P: TokenProvider + ?Sized>(
    provider: &P,
) -> Result<Vec<CK_SLOT_ID>, EnumerationError> {
    marshal::probe_then_fetch(MAX_SLOT_COUNT, |slots, count| {
        provider.get_slot_list(true, slots, count)
    })
    .map_err(EnumerationError::SlotList)
}

/// Like [`try_get_slot_list`], but any failure yields an empty list.
pub fn get_slot_list<P: TokenProvider + ?Sized>(provider: &P) -> Vec<CK_SLOT_ID> {
    try_get_slot_list(provider).unwrap_or_else(|err| {
        warn!(error = %err, "slot enumeration failed; reporting no slots");
        Vec::new()
    })
}

/// Reads every `CKO_DATA` object visible in a fresh session on `slot`.
pub fn try_list_data_objects<P: TokenProvider + ?Sized>(
    provider: &P,
    slot: CK_SLOT_ID,
) -> Result<Vec<DataObject>, EnumerationError> {
    let session = SessionGuard::open(provider, slot).map_err(|rv| EnumerationError::Provider {
        step: Step::OpenSession,
        rv,
    })?;

    let class = marshal::ulong_bytes(CKO_DATA);
    let template = [TemplateAttribute::new(CKA_CLASS, &class)];
    let search = FindGuard::init(provider, session.handle, &template).map_err(|rv| {
        EnumerationError::Provider {
            step: Step::FindObjectsInit,
            rv,
        }
    })?;

    let mut found = Vec::new();
    loop {
        let mut next: [CK_OBJECT_HANDLE; 1] = [0];
        let mut count: CK_ULONG = 0;
        let rv = provider.find_objects(search.session, &mut next, &mut count);
        if rv != CKR_OK {
            return Err(EnumerationError::Interrupted { rv, found });
        }
        if count == 0 {
            break;
        }
        if let Some(object) = read_data_object(provider, session.handle, next[0]) {
            found.push(object);
        }
    }
    debug!(slot, objects = found.len(), "data object enumeration complete");
    Ok(found)
}

/// Like [`try_list_data_objects`], but failures degrade: objects read before
/// a failing `C_FindObjects` are kept, any other failure yields nothing.
pub fn list_data_objects<P: TokenProvider + ?Sized>(
    provider: &P,
    slot: CK_SLOT_ID,
) -> Vec<DataObject> {
    match try_list_data_objects(provider, slot) {
        Ok(objects) => objects,
        Err(EnumerationError::Interrupted { rv, found }) => {
            warn!(slot, rv, kept = found.len(), "object search interrupted");
            found
        }
        Err(err) => {
            warn!(slot, error = %err, "data object enumeration failed; reporting no objects");
            Vec::new()
        }
    }
}

/// Objects whose label cannot be read are skipped; an unreadable value
/// leaves `value` empty.
fn read_data_object<P: TokenProvider + ?Sized>(
    provider: &P,
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
) -> Option<DataObject> {
    let label = match marshal::bounded_fetch::<LABEL_CAPACITY, _>(|buffer, len| {
        provider.get_attribute_value(session, object, CKA_LABEL, Some(buffer), len)
    }) {
        Ok((buffer, len)) => String::from_utf8_lossy(&buffer[..len]).into_owned(),
        Err(rv) => {
            debug!(object, rv, "skipping object with unreadable label");
            return None;
        }
    };

    let value = marshal::probe_then_fetch(MAX_ATTRIBUTE_LEN, |buffer, len| {
        provider.get_attribute_value(session, object, CKA_VALUE, buffer, len)
    })
    .map_err(|err| debug!(object, error = %err, "object value unavailable"))
    .ok();

    Some(DataObject {
        handle: object,
        label,
        value,
    })
}

pub fn get_info<P: TokenProvider + ?Sized>(provider: &P) -> Result<LibraryInfo, CK_RV> {
    // SAFETY: CK_INFO is plain old data; all-zero is a valid value.
    let mut info: CK_INFO = unsafe { std::mem::zeroed() };
    match provider.get_info(&mut info) {
        CKR_OK => Ok(LibraryInfo::from(&info)),
        rv => Err(rv),
    }
}

pub fn get_slot_info<P: TokenProvider + ?Sized>(
    provider: &P,
    slot: CK_SLOT_ID,
) -> Result<SlotInfo, CK_RV> {
    // SAFETY: CK_SLOT_INFO is plain old data; all-zero is a valid value.
    let mut info: CK_SLOT_INFO = unsafe { std::mem::zeroed() };
    match provider.get_slot_info(slot, &mut info) {
        CKR_OK => Ok(SlotInfo::from(&info)),
        rv => Err(rv),
    }
}

pub fn get_token_info<P: TokenProvider + ?Sized>(
    provider: &P,
    slot: CK_SLOT_ID,
) -> Result<TokenInfo, CK_RV> {
    // SAFETY: CK_TOKEN_INFO is plain old data; all-zero is a valid value.
    let mut info: CK_TOKEN_INFO = unsafe { std::mem::zeroed() };
    match provider.get_token_info(slot, &mut info) {
        CKR_OK => Ok(TokenInfo::from(&info)),
        rv => Err(rv),
    }
}

/// An open read-only session; closed on drop.
struct SessionGuard<'p, P: TokenProvider + ?Sized> {
    provider: &'p P,
    handle: CK_SESSION_HANDLE,
}

impl<'p, P: TokenProvider + ?Sized> SessionGuard<'p, P> {
    fn open(provider: &'p P, slot: CK_SLOT_ID) -> Result<Self, CK_RV> {
        let mut handle: CK_SESSION_HANDLE = 0;
        match provider.open_session(slot, CKF_SERIAL_SESSION, &mut handle) {
            CKR_OK => {
                debug!(slot, session = handle, "session opened");
                Ok(Self { provider, handle })
            }
            rv => Err(rv),
        }
    }
}

impl<P: TokenProvider + ?Sized> Drop for SessionGuard<'_, P> {
    fn drop(&mut self) {
        let rv = self.provider.close_session(self.handle);
        if rv != CKR_OK {
            warn!(session = self.handle, rv, "C_CloseSession failed");
        }
    }
}

/// An active find operation; finalized on drop.
struct FindGuard<'p, P: TokenProvider + ?Sized> {
    provider: &'p P,
    session: CK_SESSION_HANDLE,
}

impl<'p, P: TokenProvider + ?Sized> FindGuard<'p, P> {
    fn init(
        provider: &'p P,
        session: CK_SESSION_HANDLE,
        template: &[TemplateAttribute<'_>],
    ) -> Result<Self, CK_RV> {
        match provider.find_objects_init(session, template) {
            CKR_OK => Ok(Self { provider, session }),
            rv => Err(rv),
        }
    }
}

impl<P: TokenProvider + ?Sized> Drop for FindGuard<'_, P> {
    fn drop(&mut self) {
        let rv = self.provider.find_objects_final(self.session);
        if rv != CKR_OK {
            warn!(session = self.session, rv, "C_FindObjectsFinal failed");
        }
    }
}
