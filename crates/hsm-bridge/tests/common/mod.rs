#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::OnceLock;

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_INFO, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
    CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL,
    CKR_OK, CKR_SESSION_HANDLE_INVALID,
};
use escargot::CargoBuild;
use escargot::format::Message;
use hsm_bridge::TokenProvider;
use hsm_bridge::abi::{CK_UNAVAILABLE_INFORMATION, CKA_LABEL, CKA_VALUE};
use hsm_bridge::marshal::TemplateAttribute;

pub const SESSION: CK_SESSION_HANDLE = 0x5e55;

/// Builds `hsm-fixture-provider` once per test binary and returns the path
/// of its shared library.
pub fn fixture_module() -> PathBuf {
    static MODULE: OnceLock<PathBuf> = OnceLock::new();
    MODULE
        .get_or_init(|| {
            let messages = CargoBuild::new()
                .package("hsm-fixture-provider")
                .current_release()
                .exec()
                .unwrap();
            for message in messages {
                let message = message.unwrap();
                let Ok(Message::CompilerArtifact(artifact)) = message.decode() else {
                    continue;
                };
                if artifact.target.name != "hsm_fixture_provider" {
                    continue;
                }
                let module = artifact.filenames.iter().find(|file| {
                    file.extension() == Some(OsStr::new(std::env::consts::DLL_EXTENSION))
                });
                if let Some(module) = module {
                    return module.to_path_buf();
                }
            }
            panic!("hsm-fixture-provider produced no shared library");
        })
        .clone()
}

/// How the fake answers a `CKA_VALUE` request.
#[derive(Debug, Clone)]
pub enum Value {
    Bytes(Vec<u8>),
    LengthFails(CK_RV),
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct FakeObject {
    pub handle: CK_OBJECT_HANDLE,
    /// `None` makes the label fetch fail.
    pub label: Option<Vec<u8>>,
    pub value: Value,
}

impl FakeObject {
    pub fn new(handle: CK_OBJECT_HANDLE, label: &str, value: &[u8]) -> Self {
        Self {
            handle,
            label: Some(label.as_bytes().to_vec()),
            value: Value::Bytes(value.to_vec()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub slot_list: u32,
    pub open_session: u32,
    pub close_session: u32,
    pub find_init: u32,
    pub find: u32,
    pub find_final: u32,
    pub length_queries: u32,
    pub value_fetches: u32,
}

/// A scripted token. Fields configure the answers; `calls` records what the
/// driver asked for.
#[derive(Debug, Default)]
pub struct FakeToken {
    pub slots: Vec<CK_SLOT_ID>,
    pub slot_list_rv: Option<CK_RV>,
    pub open_session_rv: Option<CK_RV>,
    pub find_init_rv: Option<CK_RV>,
    /// `C_FindObjects` fails once this many objects have been returned.
    pub find_fails_after: Option<usize>,
    pub objects: Vec<FakeObject>,
    /// Copy a partial label and return `CKR_OK` instead of
    /// `CKR_BUFFER_TOO_SMALL` when the buffer is short.
    pub lenient_labels: bool,
    pub(crate) cursor: Cell<usize>,
    pub(crate) calls: RefCell<Calls>,
}

impl FakeToken {
    pub fn with_objects(objects: Vec<FakeObject>) -> Self {
        Self {
            slots: vec![0],
            objects,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Calls {
        *self.calls.borrow()
    }

    fn record(&self, update: impl FnOnce(&mut Calls)) {
        update(&mut self.calls.borrow_mut());
    }

    fn object(&self, handle: CK_OBJECT_HANDLE) -> Option<&FakeObject> {
        self.objects.iter().find(|object| object.handle == handle)
    }
}

impl TokenProvider for FakeToken {
    fn initialize(&self) -> CK_RV {
        CKR_OK
    }

    fn finalize(&self) -> CK_RV {
        CKR_OK
    }

    fn get_info(&self, _info: &mut CK_INFO) -> CK_RV {
        CKR_OK
    }

    fn get_slot_list(
        &self,
        _token_present: bool,
        slots: Option<&mut [CK_SLOT_ID]>,
        count: &mut CK_ULONG,
    ) -> CK_RV {
        self.record(|calls| calls.slot_list += 1);
        if let Some(rv) = self.slot_list_rv {
            return rv;
        }
        if let Some(slots) = slots {
            if slots.len() < self.slots.len() {
                return CKR_BUFFER_TOO_SMALL;
            }
            slots[..self.slots.len()].copy_from_slice(&self.slots);
        }
        *count = self.slots.len() as CK_ULONG;
        CKR_OK
    }

    fn get_slot_info(&self, _slot: CK_SLOT_ID, _info: &mut CK_SLOT_INFO) -> CK_RV {
        CKR_OK
    }

    fn get_token_info(&self, _slot: CK_SLOT_ID, _info: &mut CK_TOKEN_INFO) -> CK_RV {
        CKR_OK
    }

    fn open_session(
        &self,
        _slot: CK_SLOT_ID,
        _flags: CK_FLAGS,
        session: &mut CK_SESSION_HANDLE,
    ) -> CK_RV {
        self.record(|calls| calls.open_session += 1);
        if let Some(rv) = self.open_session_rv {
            return rv;
        }
        *session = SESSION;
        CKR_OK
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> CK_RV {
        self.record(|calls| calls.close_session += 1);
        if session == SESSION {
            CKR_OK
        } else {
            CKR_SESSION_HANDLE_INVALID
        }
    }

    fn find_objects_init(
        &self,
        _session: CK_SESSION_HANDLE,
        _template: &[TemplateAttribute<'_>],
    ) -> CK_RV {
        self.record(|calls| calls.find_init += 1);
        self.cursor.set(0);
        self.find_init_rv.unwrap_or(CKR_OK)
    }

    fn find_objects(
        &self,
        _session: CK_SESSION_HANDLE,
        objects: &mut [CK_OBJECT_HANDLE],
        count: &mut CK_ULONG,
    ) -> CK_RV {
        self.record(|calls| calls.find += 1);
        let cursor = self.cursor.get();
        if self.find_fails_after == Some(cursor) {
            return CKR_SESSION_HANDLE_INVALID;
        }
        match self.objects.get(cursor) {
            Some(object) if !objects.is_empty() => {
                objects[0] = object.handle;
                *count = 1;
                self.cursor.set(cursor + 1);
            }
            _ => *count = 0,
        }
        CKR_OK
    }

    fn find_objects_final(&self, _session: CK_SESSION_HANDLE) -> CK_RV {
        self.record(|calls| calls.find_final += 1);
        CKR_OK
    }

    fn get_attribute_value(
        &self,
        _session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attr_type: CK_ATTRIBUTE_TYPE,
        value: Option<&mut [u8]>,
        len: &mut CK_ULONG,
    ) -> CK_RV {
        let Some(object) = self.object(object) else {
            return CKR_ATTRIBUTE_TYPE_INVALID;
        };
        match attr_type {
            CKA_LABEL => {
                let Some(label) = &object.label else {
                    return CKR_ATTRIBUTE_TYPE_INVALID;
                };
                *len = label.len() as CK_ULONG;
                let Some(buffer) = value else {
                    return CKR_OK;
                };
                if buffer.len() >= label.len() {
                    buffer[..label.len()].copy_from_slice(label);
                    CKR_OK
                } else if self.lenient_labels {
                    let written = buffer.len();
                    buffer.copy_from_slice(&label[..written]);
                    CKR_OK
                } else {
                    CKR_BUFFER_TOO_SMALL
                }
            }
            CKA_VALUE => match (&object.value, value) {
                (Value::LengthFails(rv), None) => {
                    self.record(|calls| calls.length_queries += 1);
                    *rv
                }
                (Value::Unavailable, None) => {
                    self.record(|calls| calls.length_queries += 1);
                    *len = CK_UNAVAILABLE_INFORMATION;
                    CKR_OK
                }
                (Value::Bytes(bytes), None) => {
                    self.record(|calls| calls.length_queries += 1);
                    *len = bytes.len() as CK_ULONG;
                    CKR_OK
                }
                (Value::Bytes(bytes), Some(buffer)) => {
                    self.record(|calls| calls.value_fetches += 1);
                    if buffer.len() < bytes.len() {
                        return CKR_BUFFER_TOO_SMALL;
                    }
                    buffer[..bytes.len()].copy_from_slice(bytes);
                    *len = bytes.len() as CK_ULONG;
                    CKR_OK
                }
                (_, Some(_)) => {
                    self.record(|calls| calls.value_fetches += 1);
                    CKR_ATTRIBUTE_TYPE_INVALID
                }
            },
            _ => CKR_ATTRIBUTE_TYPE_INVALID,
        }
    }
}
