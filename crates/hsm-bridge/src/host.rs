//! The surface a script engine registers: opaque handles plus a small set
//! of named functions taking and returning [`HostValue`]s.
//!
//! The engine owns object identity and garbage collection. It sees a
//! provider only as a [`HandleId`] and calls [`HostModule::finalize_handle`]
//! when the object wrapping that id is collected.

use std::collections::BTreeMap;
use std::path::Path;

use cryptoki_sys::{CK_SLOT_ID, CK_ULONG};
use libloading::Library;
use serde::Serialize;
use tracing::debug;

use crate::driver::DataObject;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::ProviderHandle;
use crate::loader;
use crate::marshal::{self, LibraryInfo, SlotInfo, TokenInfo, Version};

pub type HandleId = u64;

/// Functions callable through [`HostModule::call`].
pub const EXPORTS: &[&str] = &[
    "loadLibrary",
    "C_Initialize",
    "C_Finalize",
    "C_GetSlotList",
    "listDataObjects",
    "C_GetInfo",
    "C_GetSlotInfo",
    "C_GetTokenInfo",
    "release",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<HostValue>),
    Object(BTreeMap<String, HostValue>),
    Handle(HandleId),
}

impl HostValue {
    /// Provider integers keep their bit pattern; vendor codes above
    /// `i64::MAX` come out negative.
    pub fn ulong(value: CK_ULONG) -> Self {
        HostValue::Int(value as i64)
    }

    fn object<const N: usize>(fields: [(&str, HostValue); N]) -> Self {
        HostValue::Object(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<Version> for HostValue {
    fn from(version: Version) -> Self {
        HostValue::String(version.to_string())
    }
}

impl From<DataObject> for HostValue {
    fn from(object: DataObject) -> Self {
        HostValue::object([
            ("handle", HostValue::ulong(object.handle)),
            ("label", object.label.into()),
            ("value", object.value.map_or(HostValue::Null, HostValue::Bytes)),
        ])
    }
}

impl From<LibraryInfo> for HostValue {
    fn from(info: LibraryInfo) -> Self {
        HostValue::object([
            ("cryptokiVersion", info.cryptoki_version.into()),
            ("manufacturerID", info.manufacturer.into()),
            ("libraryDescription", info.description.into()),
            ("libraryVersion", info.library_version.into()),
        ])
    }
}

impl From<SlotInfo> for HostValue {
    fn from(info: SlotInfo) -> Self {
        HostValue::object([
            ("slotDescription", info.description.into()),
            ("manufacturerID", info.manufacturer.into()),
            ("tokenPresent", info.token_present.into()),
            ("removableDevice", info.removable.into()),
            ("hardwareSlot", info.hardware.into()),
            ("hardwareVersion", info.hardware_version.into()),
            ("firmwareVersion", info.firmware_version.into()),
        ])
    }
}

impl From<TokenInfo> for HostValue {
    fn from(info: TokenInfo) -> Self {
        HostValue::object([
            ("label", info.label.into()),
            ("manufacturerID", info.manufacturer.into()),
            ("model", info.model.into()),
            ("serialNumber", info.serial_number.into()),
            ("flags", HostValue::Int(info.flags as i64)),
            ("hardwareVersion", info.hardware_version.into()),
            ("firmwareVersion", info.firmware_version.into()),
        ])
    }
}

/// Produces provider handles from module paths.
pub trait ModuleLoader {
    type Module;

    fn load(&mut self, path: &Path) -> BridgeResult<ProviderHandle<Self::Module>>;
}

/// Loads modules through the platform loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl ModuleLoader for NativeLoader {
    type Module = Library;

    fn load(&mut self, path: &Path) -> BridgeResult<ProviderHandle<Library>> {
        loader::load_library(path)
    }
}

/// Handle table and dispatcher for one script engine instance.
pub struct HostModule<L: ModuleLoader = NativeLoader> {
    loader: L,
    handles: BTreeMap<HandleId, ProviderHandle<L::Module>>,
    next_id: HandleId,
}

impl HostModule<NativeLoader> {
    pub fn new() -> Self {
        Self::with_loader(NativeLoader)
    }
}

impl Default for HostModule<NativeLoader> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ModuleLoader> HostModule<L> {
    pub fn with_loader(loader: L) -> Self {
        Self {
            loader,
            handles: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Number of handles the engine has not finalized yet.
    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    /// Each call yields a distinct handle, even for a path that is already
    /// loaded; the platform loader reference-counts the module itself.
    pub fn load_library(&mut self, path: &str) -> BridgeResult<HandleId> {
        let path = marshal::host_path(path)?;
        let provider = self.loader.load(&path)?;
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(id, provider);
        debug!(id, path = %path.display(), "handle registered");
        Ok(id)
    }

    pub fn handle(&self, id: HandleId) -> BridgeResult<&ProviderHandle<L::Module>> {
        self.handles.get(&id).ok_or(BridgeError::InvalidHandle(id))
    }

    pub fn initialize(&self, id: HandleId) -> BridgeResult<CK_ULONG> {
        self.handle(id)?.initialize()
    }

    pub fn finalize_provider(&self, id: HandleId) -> BridgeResult<CK_ULONG> {
        self.handle(id)?.finalize_provider()
    }

    pub fn get_slot_list(&self, id: HandleId) -> BridgeResult<Vec<CK_SLOT_ID>> {
        self.handle(id)?.get_slot_list()
    }

    pub fn list_data_objects(&self, id: HandleId, slot: CK_SLOT_ID) -> BridgeResult<Vec<DataObject>> {
        self.handle(id)?.list_data_objects(slot)
    }

    pub fn get_info(&self, id: HandleId) -> BridgeResult<LibraryInfo> {
        self.handle(id)?.get_info()
    }

    pub fn get_slot_info(&self, id: HandleId, slot: CK_SLOT_ID) -> BridgeResult<SlotInfo> {
        self.handle(id)?.get_slot_info(slot)
    }

    pub fn get_token_info(&self, id: HandleId, slot: CK_SLOT_ID) -> BridgeResult<TokenInfo> {
        self.handle(id)?.get_token_info(slot)
    }

    /// Explicit close. The id stays registered so later calls report
    /// [`BridgeError::Released`] rather than an unknown handle.
    pub fn release(&mut self, id: HandleId) -> BridgeResult<bool> {
        self.handles
            .get_mut(&id)
            .map(ProviderHandle::release)
            .ok_or(BridgeError::InvalidHandle(id))
    }

    /// Collection hook: forgets the id and drops the handle, unloading the
    /// module unless it was already released. Unknown ids are ignored.
    pub fn finalize_handle(&mut self, id: HandleId) -> bool {
        match self.handles.remove(&id) {
            Some(provider) => {
                debug!(id, released = provider.is_released(), "handle finalized");
                true
            }
            None => false,
        }
    }

    /// Dispatches an exported function by name.
    pub fn call(&mut self, name: &str, args: &[HostValue]) -> BridgeResult<HostValue> {
        match name {
            "loadLibrary" => {
                let path = string_arg(args, 0)?;
                self.load_library(path).map(HostValue::Handle)
            }
            "C_Initialize" => self.initialize(handle_arg(args, 0)?).map(HostValue::ulong),
            "C_Finalize" => self
                .finalize_provider(handle_arg(args, 0)?)
                .map(HostValue::ulong),
            "C_GetSlotList" => {
                let slots = self.get_slot_list(handle_arg(args, 0)?)?;
                Ok(HostValue::Array(
                    slots.into_iter().map(HostValue::ulong).collect(),
                ))
            }
            "listDataObjects" => {
                let objects = self.list_data_objects(handle_arg(args, 0)?, slot_arg(args, 1)?)?;
                Ok(HostValue::Array(
                    objects.into_iter().map(HostValue::from).collect(),
                ))
            }
            "C_GetInfo" => self.get_info(handle_arg(args, 0)?).map(HostValue::from),
            "C_GetSlotInfo" => self
                .get_slot_info(handle_arg(args, 0)?, slot_arg(args, 1)?)
                .map(HostValue::from),
            "C_GetTokenInfo" => self
                .get_token_info(handle_arg(args, 0)?, slot_arg(args, 1)?)
                .map(HostValue::from),
            "release" => self.release(handle_arg(args, 0)?).map(HostValue::Bool),
            other => Err(BridgeError::UnknownFunction(other.to_string())),
        }
    }
}

fn arg(args: &[HostValue], index: usize) -> BridgeResult<&HostValue> {
    args.get(index)
        .ok_or_else(|| BridgeError::InvalidArgument(format!("missing argument {index}")))
}

fn string_arg(args: &[HostValue], index: usize) -> BridgeResult<&str> {
    match arg(args, index)? {
        HostValue::String(value) => Ok(value),
        other => Err(BridgeError::InvalidArgument(format!(
            "argument {index}: expected a string, got {other:?}"
        ))),
    }
}

fn handle_arg(args: &[HostValue], index: usize) -> BridgeResult<HandleId> {
    match arg(args, index)? {
        HostValue::Handle(id) => Ok(*id),
        other => Err(BridgeError::InvalidArgument(format!(
            "argument {index}: expected a provider handle, got {other:?}"
        ))),
    }
}

fn slot_arg(args: &[HostValue], index: usize) -> BridgeResult<CK_SLOT_ID> {
    match arg(args, index)? {
        HostValue::Int(slot) => CK_SLOT_ID::try_from(*slot).map_err(|_| {
            BridgeError::InvalidArgument(format!("argument {index}: slot id {slot} out of range"))
        }),
        other => Err(BridgeError::InvalidArgument(format!(
            "argument {index}: expected an integer slot id, got {other:?}"
        ))),
    }
}
