//! Safe access to a provider's function table.

use std::ptr::{self, NonNull};

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_INFO, CK_OBJECT_HANDLE, CK_RV,
    CK_SESSION_HANDLE, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG,
};

use crate::abi::{CKR_FUNCTION_NOT_SUPPORTED, FunctionTable, TOKEN_PRESENT};
use crate::marshal::{TemplateAttribute, Version};

/// The provider entries the bridge drives. Every method returns the raw
/// provider status; interpretation is left to the driver.
pub trait TokenProvider {
    fn initialize(&self) -> CK_RV;

    fn finalize(&self) -> CK_RV;

    fn get_info(&self, info: &mut CK_INFO) -> CK_RV;

    /// With `slots == None` only the count is written. Otherwise the slice
    /// length is the capacity and `count` receives the number written.
    fn get_slot_list(
        &self,
        token_present: bool,
        slots: Option<&mut [CK_SLOT_ID]>,
        count: &mut CK_ULONG,
    ) -> CK_RV;

    fn get_slot_info(&self, slot: CK_SLOT_ID, info: &mut CK_SLOT_INFO) -> CK_RV;

    fn get_token_info(&self, slot: CK_SLOT_ID, info: &mut CK_TOKEN_INFO) -> CK_RV;

    fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
        session: &mut CK_SESSION_HANDLE,
    ) -> CK_RV;

    fn close_session(&self, session: CK_SESSION_HANDLE) -> CK_RV;

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[TemplateAttribute<'_>],
    ) -> CK_RV;

    /// Fills at most `objects.len()` handles; `count` receives how many.
    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        objects: &mut [CK_OBJECT_HANDLE],
        count: &mut CK_ULONG,
    ) -> CK_RV;

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> CK_RV;

    /// Reads a single attribute. `value == None` probes for the length.
    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attr_type: CK_ATTRIBUTE_TYPE,
        value: Option<&mut [u8]>,
        len: &mut CK_ULONG,
    ) -> CK_RV;
}

/// A provider's function table as returned by `C_GetFunctionList`.
///
/// The pointer stays valid only while the owning module is loaded;
/// [`crate::handle::ProviderHandle`] enforces that.
#[derive(Debug, Clone, Copy)]
pub struct FunctionList {
    table: NonNull<FunctionTable>,
}

impl FunctionList {
    /// # Safety
    ///
    /// `table` must be null or point to a table laid out as
    /// [`FunctionTable`] that stays valid for as long as the returned value
    /// (and its copies) are used.
    pub unsafe fn from_raw(table: *const FunctionTable) -> Option<Self> {
        NonNull::new(table.cast_mut()).map(|table| Self { table })
    }

    fn table(&self) -> &FunctionTable {
        // SAFETY: validity is the contract of `from_raw`.
        unsafe { self.table.as_ref() }
    }

    /// Interface version the provider declares in the table header.
    pub fn version(&self) -> Version {
        Version::from(self.table().version)
    }
}

fn capacity(len: usize) -> CK_ULONG {
    CK_ULONG::try_from(len).unwrap_or(CK_ULONG::MAX)
}

impl TokenProvider for FunctionList {
    fn initialize(&self) -> CK_RV {
        let Some(entry) = self.table().C_Initialize else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: null init args request default (no threading callbacks) setup.
        unsafe { entry(ptr::null_mut()) }
    }

    fn finalize(&self) -> CK_RV {
        let Some(entry) = self.table().C_Finalize else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: the reserved argument must be null.
        unsafe { entry(ptr::null_mut()) }
    }

    fn get_info(&self, info: &mut CK_INFO) -> CK_RV {
        let Some(entry) = self.table().C_GetInfo else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: `info` is a valid, exclusive CK_INFO.
        unsafe { entry(info) }
    }

    fn get_slot_list(
        &self,
        token_present: bool,
        slots: Option<&mut [CK_SLOT_ID]>,
        count: &mut CK_ULONG,
    ) -> CK_RV {
        let Some(entry) = self.table().C_GetSlotList else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        let present = if token_present { TOKEN_PRESENT } else { 0 };
        let list = match slots {
            Some(slots) => {
                *count = capacity(slots.len());
                slots.as_mut_ptr()
            }
            None => ptr::null_mut(),
        };
        // SAFETY: `list` is null or holds `*count` writable slots.
        unsafe { entry(present, list, count) }
    }

    fn get_slot_info(&self, slot: CK_SLOT_ID, info: &mut CK_SLOT_INFO) -> CK_RV {
        let Some(entry) = self.table().C_GetSlotInfo else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: `info` is a valid, exclusive CK_SLOT_INFO.
        unsafe { entry(slot, info) }
    }

    fn get_token_info(&self, slot: CK_SLOT_ID, info: &mut CK_TOKEN_INFO) -> CK_RV {
        let Some(entry) = self.table().C_GetTokenInfo else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: `info` is a valid, exclusive CK_TOKEN_INFO.
        unsafe { entry(slot, info) }
    }

    fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
        session: &mut CK_SESSION_HANDLE,
    ) -> CK_RV {
        let Some(entry) = self.table().C_OpenSession else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: no application pointer and no notify callback are registered.
        unsafe { entry(slot, flags, ptr::null_mut(), None, session) }
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> CK_RV {
        let Some(entry) = self.table().C_CloseSession else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: plain handle argument.
        unsafe { entry(session) }
    }

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[TemplateAttribute<'_>],
    ) -> CK_RV {
        let Some(entry) = self.table().C_FindObjectsInit else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        let mut attributes: Vec<CK_ATTRIBUTE> = template
            .iter()
            .map(|attribute| CK_ATTRIBUTE {
                type_: attribute.attr_type,
                pValue: attribute.value.as_ptr().cast_mut().cast(),
                ulValueLen: capacity(attribute.value.len()),
            })
            .collect();
        // SAFETY: the template is only read by the provider and outlives the call.
        unsafe {
            entry(
                session,
                attributes.as_mut_ptr(),
                capacity(attributes.len()),
            )
        }
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        objects: &mut [CK_OBJECT_HANDLE],
        count: &mut CK_ULONG,
    ) -> CK_RV {
        let Some(entry) = self.table().C_FindObjects else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: `objects` has room for the advertised maximum.
        unsafe {
            entry(
                session,
                objects.as_mut_ptr(),
                capacity(objects.len()),
                count,
            )
        }
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> CK_RV {
        let Some(entry) = self.table().C_FindObjectsFinal else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        // SAFETY: plain handle argument.
        unsafe { entry(session) }
    }

    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attr_type: CK_ATTRIBUTE_TYPE,
        value: Option<&mut [u8]>,
        len: &mut CK_ULONG,
    ) -> CK_RV {
        let Some(entry) = self.table().C_GetAttributeValue else {
            return CKR_FUNCTION_NOT_SUPPORTED;
        };
        let (p_value, value_len) = match value {
            Some(value) => (value.as_mut_ptr().cast(), capacity(value.len())),
            None => (ptr::null_mut(), 0),
        };
        let mut attribute = CK_ATTRIBUTE {
            type_: attr_type,
            pValue: p_value,
            ulValueLen: value_len,
        };
        // SAFETY: `pValue` is null or points to `ulValueLen` writable bytes.
        let rv = unsafe { entry(session, object, &mut attribute, 1) };
        *len = attribute.ulValueLen;
        rv
    }
}
