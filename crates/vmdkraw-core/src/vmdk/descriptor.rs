//! Embedded text descriptor.
//!
//! A monolithic sparse extent carries its text descriptor inside the file,
//! at `descriptorOffset` for `descriptorSize` sectors, NUL-padded. The
//! decoder does not need it to produce the raw image; it is read for
//! reporting and to check that the extent claims to be `streamOptimized`.

use std::collections::BTreeMap;

use tracing::debug;

use super::format::SECTOR_SIZE;
use super::layout::EffectiveLayout;
use super::source::{read_exact_at, ExtentSource};
use crate::error::{Error, Result};

/// The `createType` written by stream-optimized writers.
pub const STREAM_OPTIMIZED: &str = "streamOptimized";

/// Kind of storage an extent line refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentKind {
    Sparse,
    Flat,
    Zero,
    Vmfs,
    VmfsSparse,
    /// Any other type keyword, kept verbatim.
    Other(String),
}

impl ExtentKind {
    fn parse(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "SPARSE" => ExtentKind::Sparse,
            "FLAT" => ExtentKind::Flat,
            "ZERO" => ExtentKind::Zero,
            "VMFS" => ExtentKind::Vmfs,
            "VMFSSPARSE" => ExtentKind::VmfsSparse,
            _ => ExtentKind::Other(keyword.to_string()),
        }
    }
}

/// One extent line, e.g. `RW 8388608 SPARSE "disk.vmdk"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentLine {
    /// Access mode: `RW`, `RDONLY` or `NOACCESS`.
    pub access: String,
    /// Extent size in sectors.
    pub size_sectors: u64,
    pub kind: ExtentKind,
    /// File name; empty for `ZERO` extents.
    pub filename: String,
    /// Offset into the file in sectors, when given.
    pub offset: Option<u64>,
}

/// A parsed embedded descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedDescriptor {
    /// `key = value` entries with quotes removed, in key order.
    pub properties: BTreeMap<String, String>,
    /// Extent lines in file order.
    pub extents: Vec<ExtentLine>,
}

impl EmbeddedDescriptor {
    /// Parses descriptor text.
    ///
    /// `offset` is where the text was read from, for error context.
    pub fn parse(text: &str, offset: u64) -> Result<Self> {
        let mut descriptor = EmbeddedDescriptor::default();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if ["RW ", "RDONLY ", "NOACCESS "].iter().any(|p| line.starts_with(p)) {
                descriptor.extents.push(parse_extent(line, offset)?);
            } else if let Some((key, value)) = line.split_once('=') {
                descriptor
                    .properties
                    .insert(key.trim().to_string(), unquote(value.trim()).to_string());
            }
        }

        Ok(descriptor)
    }

    /// Returns a property by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns the `createType`, e.g. `streamOptimized`.
    pub fn create_type(&self) -> Option<&str> {
        self.get("createType")
    }

    /// Returns true if the descriptor declares a stream-optimized extent.
    pub fn is_stream_optimized(&self) -> bool {
        self.create_type()
            .is_some_and(|t| t.eq_ignore_ascii_case(STREAM_OPTIMIZED))
    }

    /// Returns the content ID, which is written in hex.
    pub fn cid(&self) -> Option<u32> {
        self.get("CID").and_then(|v| u32::from_str_radix(v, 16).ok())
    }

    /// Returns the parent content ID; `ffffffff` means no parent.
    pub fn parent_cid(&self) -> Option<u32> {
        self.get("parentCID").and_then(|v| u32::from_str_radix(v, 16).ok())
    }

    /// Returns the disk adapter type, e.g. `lsilogic`.
    pub fn adapter_type(&self) -> Option<&str> {
        self.get("ddb.adapterType")
    }

    /// Sum of all extent sizes in bytes.
    pub fn extents_size_bytes(&self) -> u64 {
        self.extents
            .iter()
            .fold(0u64, |total, e| total.saturating_add(e.size_sectors))
            .saturating_mul(SECTOR_SIZE)
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_extent(line: &str, offset: u64) -> Result<ExtentLine> {
    let bad = |reason: String| Error::malformed("descriptor", offset, reason);

    let mut fields = line.splitn(4, char::is_whitespace).filter(|f| !f.is_empty());
    let access = fields.next().unwrap_or_default().to_string();
    let size = fields
        .next()
        .ok_or_else(|| bad(format!("extent line has no size: {}", line)))?;
    let size_sectors = size
        .parse()
        .map_err(|_| bad(format!("invalid extent size: {}", size)))?;
    let kind = ExtentKind::parse(
        fields
            .next()
            .ok_or_else(|| bad(format!("extent line has no type: {}", line)))?,
    );

    let rest = fields.next().unwrap_or_default().trim();
    let (filename, tail) = match rest.strip_prefix('"') {
        Some(quoted) => {
            let end = quoted
                .find('"')
                .ok_or_else(|| bad(format!("unclosed quote in extent line: {}", line)))?;
            (quoted[..end].to_string(), quoted[end + 1..].trim())
        }
        None => (String::new(), rest),
    };
    let offset_sectors = match tail {
        "" => None,
        t => Some(
            t.parse()
                .map_err(|_| bad(format!("invalid extent offset: {}", t)))?,
        ),
    };

    Ok(ExtentLine {
        access,
        size_sectors,
        kind,
        filename,
        offset: offset_sectors,
    })
}

/// Reads the descriptor embedded in the extent, if the layout points at one.
pub fn read_embedded_descriptor<S: ExtentSource + ?Sized>(
    source: &S,
    layout: &EffectiveLayout,
) -> Result<Option<EmbeddedDescriptor>> {
    if layout.descriptor_offset_sectors == 0 || layout.descriptor_size_sectors == 0 {
        return Ok(None);
    }

    let offset = layout.descriptor_offset_sectors.checked_mul(SECTOR_SIZE);
    let len = layout.descriptor_size_sectors.checked_mul(SECTOR_SIZE);
    let (offset, len) = match (offset, len) {
        (Some(offset), Some(len)) if offset.checked_add(len).is_some_and(|end| end <= source.len()) => {
            (offset, len)
        }
        _ => {
            debug!(
                descriptor_offset_sectors = layout.descriptor_offset_sectors,
                descriptor_size_sectors = layout.descriptor_size_sectors,
                source_len = source.len(),
                "embedded descriptor lies outside the extent"
            );
            return Ok(None);
        }
    };
    let buf = read_exact_at(source, offset, len as usize)?;
    let text_len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let text = String::from_utf8_lossy(&buf[..text_len]);

    let descriptor = EmbeddedDescriptor::parse(&text, offset)?;
    debug!(
        offset,
        create_type = descriptor.create_type().unwrap_or(""),
        extents = descriptor.extents.len(),
        "read embedded descriptor"
    );
    Ok(Some(descriptor))
}
