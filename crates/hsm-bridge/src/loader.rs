//! Opening provider modules and resolving their function table.

use std::path::Path;
use std::ptr;

use libloading::Library;
use tracing::{debug, info, warn};

use crate::abi::{CKR_OK, ENTRY_POINT, FunctionTable, GetFunctionListFn};
use crate::error::{BridgeError, BridgeResult};
use crate::handle::ProviderHandle;

/// Opens the module with immediate symbol binding.
#[cfg(unix)]
fn open_module(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    // SAFETY: running the module's initialisers is inherent to loading a provider.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL) }.map(Library::from)
}

/// Opens the module; the Windows loader always binds imports eagerly.
#[cfg(windows)]
fn open_module(path: &Path) -> Result<Library, libloading::Error> {
    // SAFETY: running the module's initialisers is inherent to loading a provider.
    unsafe { Library::new(path) }
}

/// Loads the provider module at `path` and obtains its function table.
///
/// On every failure after the module was opened, the module is unloaded
/// before the error is returned.
pub fn load_library(path: &Path) -> BridgeResult<ProviderHandle<Library>> {
    debug!(path = %path.display(), "opening provider module");
    let library = open_module(path).map_err(|source| {
        warn!(path = %path.display(), error = %source, "provider module could not be opened");
        BridgeError::LibraryLoad {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let entry_point = match resolve_entry_point(&library) {
        Ok(entry_point) => entry_point,
        Err(reason) => return Err(reject(path, library, reason)),
    };

    let mut table: *mut FunctionTable = ptr::null_mut();
    // SAFETY: the symbol carries the standard entry point signature.
    let rv = unsafe { entry_point(&mut table) };
    if rv != CKR_OK {
        return Err(reject(
            path,
            library,
            format!("C_GetFunctionList returned CK_RV {rv:#x}"),
        ));
    }

    // SAFETY: the table belongs to `library`, which the handle keeps loaded
    // for as long as the table is reachable.
    match unsafe { ProviderHandle::from_raw_parts(path, library, table) } {
        Some(handle) => {
            info!(
                path = %path.display(),
                version = %handle.functions()?.version(),
                "provider module loaded"
            );
            Ok(handle)
        }
        None => {
            warn!(path = %path.display(), "provider returned a null function table");
            Err(BridgeError::InvalidProvider {
                path: path.to_path_buf(),
                reason: "C_GetFunctionList returned a null table".to_string(),
            })
        }
    }
}

fn resolve_entry_point(library: &Library) -> Result<GetFunctionListFn, String> {
    // SAFETY: the symbol type matches the standard's declaration.
    let symbol = unsafe { library.get::<GetFunctionListFn>(ENTRY_POINT) }
        .map_err(|err| format!("missing C_GetFunctionList: {err}"))?;
    Ok(*symbol)
}

fn reject(path: &Path, library: Library, reason: String) -> BridgeError {
    warn!(path = %path.display(), %reason, "rejecting provider module");
    drop(library);
    BridgeError::InvalidProvider {
        path: path.to_path_buf(),
        reason,
    }
}
