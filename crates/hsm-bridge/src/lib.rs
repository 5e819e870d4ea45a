//! Bridge between a host scripting environment and vendor PKCS#11 provider
//! modules (smart-card middleware, HSM drivers). The bridge never performs
//! cryptography; it loads somebody else's provider, drives its session and
//! object protocol, and hands the results to the host as plain values.
//!
//! Everything here is single-threaded: provider handles are neither `Send`
//! nor `Sync`, and callers serialize access.

pub mod abi;
pub mod driver;
pub mod error;
pub mod handle;
pub mod host;
pub mod loader;
pub mod marshal;
pub mod provider;

pub use driver::{DataObject, EnumerationError, Step};
pub use error::{BridgeError, BridgeResult};
pub use handle::ProviderHandle;
pub use host::{EXPORTS, HandleId, HostModule, HostValue, ModuleLoader, NativeLoader};
pub use loader::load_library;
pub use marshal::{LibraryInfo, ProbeError, SlotInfo, TokenInfo, Version};
pub use provider::{FunctionList, TokenProvider};
