//! Conversions between provider memory layouts and host values.
//!
//! Variable-length provider outputs all follow the same two-call protocol:
//! call once with no destination to learn the length, allocate exactly that
//! much, call again to fill. [`probe_then_fetch`] is the only place that
//! protocol is implemented.

use std::path::PathBuf;

use cryptoki_sys::{CK_ATTRIBUTE_TYPE, CK_INFO, CK_RV, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CK_VERSION};
use serde::Serialize;
use thiserror::Error;

use crate::abi::{CK_UNAVAILABLE_INFORMATION, CKF_HW_SLOT, CKF_REMOVABLE_DEVICE, CKF_TOKEN_PRESENT, CKR_OK};
use crate::error::BridgeError;

/// Upper bound on a single attribute value.
pub const MAX_ATTRIBUTE_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on the number of slots a provider may report.
pub const MAX_SLOT_COUNT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("provider returned CK_RV {0:#x}")]
    Status(CK_RV),
    #[error("provider reported the length as unavailable")]
    Unavailable,
    #[error("reported length {len} exceeds limit {limit}")]
    TooLarge { len: CK_ULONG, limit: usize },
    #[error("could not allocate {0} elements")]
    Allocation(usize),
}

/// Runs the probe/allocate/fetch sequence.
///
/// `call` receives `None` on the probe and the allocated buffer on the fetch;
/// it writes the required (probe) or written (fetch) element count into the
/// length argument. Only the fetch status decides the outcome once the probe
/// has succeeded.
pub fn probe_then_fetch<T, F>(limit: usize, mut call: F) -> Result<Vec<T>, ProbeError>
where
    T: Copy + Default,
    F: FnMut(Option<&mut [T]>, &mut CK_ULONG) -> CK_RV,
{
    let mut len: CK_ULONG = 0;
    let rv = call(None, &mut len);
    if rv != CKR_OK {
        return Err(ProbeError::Status(rv));
    }
    if len == CK_UNAVAILABLE_INFORMATION {
        return Err(ProbeError::Unavailable);
    }
    let wanted = usize::try_from(len)
        .ok()
        .filter(|wanted| *wanted <= limit)
        .ok_or(ProbeError::TooLarge { len, limit })?;
    if wanted == 0 {
        return Ok(Vec::new());
    }

    let mut buffer: Vec<T> = Vec::new();
    buffer
        .try_reserve_exact(wanted)
        .map_err(|_| ProbeError::Allocation(wanted))?;
    buffer.resize(wanted, T::default());

    let rv = call(Some(&mut buffer), &mut len);
    if rv != CKR_OK {
        return Err(ProbeError::Status(rv));
    }
    let written = usize::try_from(len).map_or(wanted, |written| written.min(wanted));
    buffer.truncate(written);
    Ok(buffer)
}

/// Single fetch into a fixed stack buffer.
///
/// A non-OK status, including `CKR_BUFFER_TOO_SMALL` for a value longer
/// than `N`, is returned as the error. A reported length above `N` with
/// `CKR_OK` is clamped to `N`.
pub fn bounded_fetch<const N: usize, F>(call: F) -> Result<([u8; N], usize), CK_RV>
where
    F: FnOnce(&mut [u8], &mut CK_ULONG) -> CK_RV,
{
    let mut buffer = [0u8; N];
    let mut len: CK_ULONG = 0;
    let rv = call(&mut buffer, &mut len);
    if rv != CKR_OK {
        return Err(rv);
    }
    let written = usize::try_from(len).map_or(N, |written| written.min(N));
    Ok((buffer, written))
}

/// One entry of a search template: an attribute type and its encoded value.
#[derive(Debug, Clone, Copy)]
pub struct TemplateAttribute<'a> {
    pub attr_type: CK_ATTRIBUTE_TYPE,
    pub value: &'a [u8],
}

impl<'a> TemplateAttribute<'a> {
    pub fn new(attr_type: CK_ATTRIBUTE_TYPE, value: &'a [u8]) -> Self {
        Self { attr_type, value }
    }
}

/// `CK_ULONG` attribute encoding: native width and byte order.
pub fn ulong_bytes(value: CK_ULONG) -> [u8; size_of::<CK_ULONG>()] {
    value.to_ne_bytes()
}

/// Decodes a blank-padded `CK_UTF8CHAR[N]` field.
pub fn padded_text(field: &[u8]) -> String {
    let end = field
        .iter()
        .rposition(|byte| *byte != b' ' && *byte != 0)
        .map_or(0, |last| last + 1);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Validates a host-supplied module path before it reaches the platform loader.
pub fn host_path(path: &str) -> Result<PathBuf, BridgeError> {
    if path.is_empty() {
        return Err(BridgeError::invalid("module path is empty"));
    }
    if path.contains('\0') {
        return Err(BridgeError::invalid("module path contains a NUL byte"));
    }
    Ok(PathBuf::from(path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl From<CK_VERSION> for Version {
    fn from(version: CK_VERSION) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Host form of `CK_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryInfo {
    pub cryptoki_version: Version,
    pub manufacturer: String,
    pub description: String,
    pub library_version: Version,
}

impl From<&CK_INFO> for LibraryInfo {
    fn from(info: &CK_INFO) -> Self {
        Self {
            cryptoki_version: { info.cryptokiVersion }.into(),
            manufacturer: padded_text(&{ info.manufacturerID }),
            description: padded_text(&{ info.libraryDescription }),
            library_version: { info.libraryVersion }.into(),
        }
    }
}

/// Host form of `CK_SLOT_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub description: String,
    pub manufacturer: String,
    pub token_present: bool,
    pub removable: bool,
    pub hardware: bool,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

impl From<&CK_SLOT_INFO> for SlotInfo {
    fn from(info: &CK_SLOT_INFO) -> Self {
        let flags = info.flags;
        Self {
            description: padded_text(&{ info.slotDescription }),
            manufacturer: padded_text(&{ info.manufacturerID }),
            token_present: flags & CKF_TOKEN_PRESENT != 0,
            removable: flags & CKF_REMOVABLE_DEVICE != 0,
            hardware: flags & CKF_HW_SLOT != 0,
            hardware_version: { info.hardwareVersion }.into(),
            firmware_version: { info.firmwareVersion }.into(),
        }
    }
}

/// Host form of the identifying part of `CK_TOKEN_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub flags: u64,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

impl From<&CK_TOKEN_INFO> for TokenInfo {
    fn from(info: &CK_TOKEN_INFO) -> Self {
        Self {
            label: padded_text(&{ info.label }),
            manufacturer: padded_text(&{ info.manufacturerID }),
            model: padded_text(&{ info.model }),
            serial_number: padded_text(&{ info.serialNumber }),
            flags: u64::from(info.flags),
            hardware_version: { info.hardwareVersion }.into(),
            firmware_version: { info.firmwareVersion }.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CKR_BUFFER_TOO_SMALL;

    fn fixture_call(
        data: &[u8],
    ) -> impl FnMut(Option<&mut [u8]>, &mut CK_ULONG) -> CK_RV + '_ {
        move |buffer, len| {
            match buffer {
                None => *len = data.len() as CK_ULONG,
                Some(buffer) => {
                    if buffer.len() < data.len() {
                        return CKR_BUFFER_TOO_SMALL;
                    }
                    buffer[..data.len()].copy_from_slice(data);
                    *len = data.len() as CK_ULONG;
                }
            }
            CKR_OK
        }
    }

    #[test]
    fn probe_then_fetch_returns_exact_bytes() {
        let data = b"\x01\x02\x03 identity file";
        let value = probe_then_fetch(MAX_ATTRIBUTE_LEN, fixture_call(data)).unwrap();
        assert_eq!(value, data);
    }

    #[test]
    fn zero_length_skips_the_fetch() {
        let mut calls = 0;
        let value: Vec<u8> = probe_then_fetch(MAX_ATTRIBUTE_LEN, |buffer, len| {
            calls += 1;
            assert!(buffer.is_none());
            *len = 0;
            CKR_OK
        })
        .unwrap();
        assert!(value.is_empty());
        assert_eq!(calls, 1);
    }

    #[test]
    fn unavailable_length_is_rejected() {
        let err = probe_then_fetch::<u8, _>(MAX_ATTRIBUTE_LEN, |_, len| {
            *len = CK_UNAVAILABLE_INFORMATION;
            CKR_OK
        })
        .unwrap_err();
        assert_eq!(err, ProbeError::Unavailable);
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let err = probe_then_fetch::<u8, _>(16, |buffer, len| {
            assert!(buffer.is_none(), "no fetch after an oversized probe");
            *len = 17;
            CKR_OK
        })
        .unwrap_err();
        assert_eq!(err, ProbeError::TooLarge { len: 17, limit: 16 });
    }

    #[test]
    fn fetch_status_is_propagated() {
        let err = probe_then_fetch::<u8, _>(MAX_ATTRIBUTE_LEN, |buffer, len| match buffer {
            None => {
                *len = 4;
                CKR_OK
            }
            Some(_) => CKR_BUFFER_TOO_SMALL,
        })
        .unwrap_err();
        assert_eq!(err, ProbeError::Status(CKR_BUFFER_TOO_SMALL));
    }

    #[test]
    fn short_fetch_truncates_to_written_length() {
        let value = probe_then_fetch::<u8, _>(MAX_ATTRIBUTE_LEN, |buffer, len| {
            match buffer {
                None => *len = 8,
                Some(buffer) => {
                    buffer[..3].copy_from_slice(b"abc");
                    *len = 3;
                }
            }
            CKR_OK
        })
        .unwrap();
        assert_eq!(value, b"abc");
    }

    #[test]
    fn bounded_fetch_truncates_silently() {
        let (buffer, len) = bounded_fetch::<4, _>(|buffer, len| {
            buffer.copy_from_slice(b"abcd");
            *len = 10;
            CKR_OK
        })
        .unwrap();
        assert_eq!(&buffer[..len], b"abcd");
    }

    #[test]
    fn padded_text_trims_blanks_and_nuls() {
        assert_eq!(padded_text(b"OpenSC Project                  "), "OpenSC Project");
        assert_eq!(padded_text(b"eID\0\0\0"), "eID");
        assert_eq!(padded_text(b"        "), "");
    }

    #[test]
    fn host_path_rejects_nul_and_empty() {
        assert!(matches!(host_path(""), Err(BridgeError::InvalidArgument(_))));
        assert!(matches!(
            host_path("/usr/lib/lib\0beid.so"),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert_eq!(
            host_path("/usr/lib/libbeidpkcs11.so").unwrap(),
            PathBuf::from("/usr/lib/libbeidpkcs11.so")
        );
    }
}
