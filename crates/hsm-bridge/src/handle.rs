//! Ownership of a loaded provider module.

use std::path::{Path, PathBuf};

use cryptoki_sys::{CK_RV, CK_SLOT_ID};
use libloading::Library;
use tracing::info;

use crate::abi::FunctionTable;
use crate::driver::{self, DataObject};
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::{LibraryInfo, SlotInfo, TokenInfo};
use crate::provider::FunctionList;

/// A loaded provider: the module that keeps the code mapped and the
/// function table it exported.
///
/// The module is released exactly once, by [`ProviderHandle::release`] or on
/// drop, whichever comes first. After release the table is unreachable.
/// `M` is the module owner; it is [`Library`] outside of tests.
pub struct ProviderHandle<M = Library> {
    path: PathBuf,
    module: Option<M>,
    functions: FunctionList,
}

impl<M> ProviderHandle<M> {
    /// Binds `module` and the table it returned. Yields `None` (dropping
    /// `module`) when `table` is null.
    ///
    /// # Safety
    ///
    /// `table` must be null or point to a [`FunctionTable`] that stays valid
    /// for as long as `module` is alive.
    pub unsafe fn from_raw_parts(
        path: impl Into<PathBuf>,
        module: M,
        table: *const FunctionTable,
    ) -> Option<Self> {
        // SAFETY: forwarded from the caller.
        let functions = unsafe { FunctionList::from_raw(table) }?;
        Some(Self {
            path: path.into(),
            module: Some(module),
            functions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.module.is_none()
    }

    /// The function table, as long as the module is still loaded.
    pub fn functions(&self) -> BridgeResult<&FunctionList> {
        if self.module.is_some() {
            Ok(&self.functions)
        } else {
            Err(BridgeError::Released)
        }
    }

    /// Unloads the module. Returns `false` when it was already released.
    pub fn release(&mut self) -> bool {
        match self.module.take() {
            Some(module) => {
                drop(module);
                info!(path = %self.path.display(), "provider module released");
                true
            }
            None => false,
        }
    }

    pub fn initialize(&self) -> BridgeResult<CK_RV> {
        Ok(driver::initialize(self.functions()?))
    }

    pub fn finalize_provider(&self) -> BridgeResult<CK_RV> {
        Ok(driver::finalize_provider(self.functions()?))
    }

    pub fn get_slot_list(&self) -> BridgeResult<Vec<CK_SLOT_ID>> {
        Ok(driver::get_slot_list(self.functions()?))
    }

    pub fn list_data_objects(&self, slot: CK_SLOT_ID) -> BridgeResult<Vec<DataObject>> {
        Ok(driver::list_data_objects(self.functions()?, slot))
    }

    pub fn get_info(&self) -> BridgeResult<LibraryInfo> {
        driver::get_info(self.functions()?).map_err(|rv| BridgeError::Provider {
            function: "C_GetInfo",
            rv,
        })
    }

    pub fn get_slot_info(&self, slot: CK_SLOT_ID) -> BridgeResult<SlotInfo> {
        driver::get_slot_info(self.functions()?, slot).map_err(|rv| BridgeError::Provider {
            function: "C_GetSlotInfo",
            rv,
        })
    }

    pub fn get_token_info(&self, slot: CK_SLOT_ID) -> BridgeResult<TokenInfo> {
        driver::get_token_info(self.functions()?, slot).map_err(|rv| BridgeError::Provider {
            function: "C_GetTokenInfo",
            rv,
        })
    }
}

impl<M> Drop for ProviderHandle<M> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<M> std::fmt::Debug for ProviderHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("path", &self.path)
            .field("released", &self.is_released())
            .finish()
    }
}
