// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Overlay export lookup.
//!
//! Overlays are native-code commands loaded into a fixed window. Each
//! one advertises a header (magic, version, export count) followed by an
//! array of named function records sorted by name; lookup is a binary
//! search over the 16-byte padded names.

use nanoos_abi::{
    overlay_export_name, KernelError, OverlayHeader, OVERLAY_MAGIC, OVERLAY_NAME_LENGTH,
};

/// An overlay-exported function. The argument and result are opaque
/// words, matching the wire-level calling convention.
pub type OverlayFunction = fn(u64) -> u64;

/// One export record.
#[derive(Copy, Clone)]
pub struct OverlayExport {
    pub name: [u8; OVERLAY_NAME_LENGTH],
    pub function: OverlayFunction,
}

impl OverlayExport {
    pub fn new(name: &str, function: OverlayFunction) -> Self {
        Self {
            name: overlay_export_name(name),
            function,
        }
    }
}

/// A validated overlay: its header plus the sorted export table.
pub struct Overlay {
    header: OverlayHeader,
    exports: Vec<OverlayExport>,
}

impl Overlay {
    /// Validates the header and the sort order of the export table.
    pub fn new(
        header: OverlayHeader,
        mut exports: Vec<OverlayExport>,
    ) -> Result<Self, KernelError> {
        if !header.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        if usize::from(header.num_exports) != exports.len() {
            return Err(KernelError::InvalidArgument);
        }
        exports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { header, exports })
    }

    /// Convenience constructor that builds the header for a table.
    pub fn with_exports(version: u32, exports: Vec<OverlayExport>) -> Self {
        let header = OverlayHeader {
            magic: OVERLAY_MAGIC,
            version,
            num_exports: exports.len() as u16,
        };
        Self::new(header, exports).expect("header built from the table is valid")
    }

    pub fn header(&self) -> &OverlayHeader {
        &self.header
    }

    /// Exact lookup by name; binary search over the sorted exports.
    pub fn lookup(&self, name: &str) -> Option<OverlayFunction> {
        let needle = overlay_export_name(name);
        self.exports
            .binary_search_by(|export| export.name.cmp(&needle))
            .ok()
            .map(|index| self.exports[index].function)
    }
}
