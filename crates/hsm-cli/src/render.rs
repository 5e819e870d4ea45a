//! Table and JSON rendering of bridge results.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use comfy_table::{presets::UTF8_FULL, Table};
use hsm_bridge::{DataObject, LibraryInfo, SlotInfo, TokenInfo};
use serde::Serialize;

use crate::config::OutputFormat;

#[derive(Debug, Serialize)]
pub struct SlotRow {
    pub slot: u64,
    pub info: Option<SlotInfo>,
    pub token: Option<TokenInfo>,
}

#[derive(Debug, Serialize)]
struct ObjectView<'a> {
    handle: u64,
    label: &'a str,
    size: usize,
    /// Base64 of the raw value.
    value: Option<String>,
}

impl<'a> From<&'a DataObject> for ObjectView<'a> {
    fn from(object: &'a DataObject) -> Self {
        Self {
            handle: u64::from(object.handle),
            label: object.label.trim(),
            size: object.value.as_ref().map_or(0, Vec::len),
            value: object.value.as_ref().map(|value| B64.encode(value)),
        }
    }
}

/// First `limit` bytes with non-printable ASCII shown as `.`.
pub fn preview(value: &[u8], limit: usize) -> String {
    let mut text: String = value
        .iter()
        .take(limit)
        .map(|byte| {
            if (0x20..=0x7e).contains(byte) {
                char::from(*byte)
            } else {
                '.'
            }
        })
        .collect();
    if value.len() > limit {
        text.push_str("...");
    }
    text
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

pub fn info(info: &LibraryInfo, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(info)?);
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Cryptoki version".to_string(), info.cryptoki_version.to_string()]);
    table.add_row(vec!["Manufacturer".to_string(), info.manufacturer.clone()]);
    table.add_row(vec!["Description".to_string(), info.description.clone()]);
    table.add_row(vec!["Library version".to_string(), info.library_version.to_string()]);
    Ok(table.to_string())
}

pub fn slots(rows: &[SlotRow], format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(rows)?);
    }
    if rows.is_empty() {
        return Ok("No slot with a token present.".to_string());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Slot", "Reader", "Token", "Model", "Serial"]);
    for row in rows {
        table.add_row(vec![
            row.slot.to_string(),
            or_dash(row.info.as_ref().map(|info| info.description.clone())),
            or_dash(row.token.as_ref().map(|token| token.label.clone())),
            or_dash(row.token.as_ref().map(|token| token.model.clone())),
            or_dash(row.token.as_ref().map(|token| token.serial_number.clone())),
        ]);
    }
    Ok(table.to_string())
}

pub fn objects(
    objects: &[DataObject],
    format: OutputFormat,
    preview_bytes: usize,
) -> Result<String> {
    if format == OutputFormat::Json {
        let views: Vec<ObjectView<'_>> = objects.iter().map(ObjectView::from).collect();
        return Ok(serde_json::to_string_pretty(&views)?);
    }
    if objects.is_empty() {
        return Ok("No data objects found. Is the card inserted?".to_string());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Label", "Handle", "Size", "Preview"]);
    for (index, object) in objects.iter().enumerate() {
        let view = ObjectView::from(object);
        let label = if view.label.is_empty() {
            "unnamed"
        } else {
            view.label
        };
        table.add_row(vec![
            index.to_string(),
            label.to_string(),
            view.handle.to_string(),
            view.size.to_string(),
            object
                .value
                .as_deref()
                .map_or_else(String::new, |value| preview(value, preview_bytes)),
        ]);
    }
    Ok(table.to_string())
}
