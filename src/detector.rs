//! Decides whether a file on disk is a Mach-O core candidate.

use crate::mach::{MH_CORE, RawHeader, SIZEOF_HEADER_64};
use std::{fs::File, io::Read, path::Path};

/// Returns true when `path` begins with a Mach-O header whose filetype is
/// `MH_CORE`.
///
/// The larger 64-bit header size is read, and the read must yield exactly
/// that many bytes. Rejection is silent: the plugin registry simply moves on
/// to the next handler, so an I/O failure is treated the same as a bad
/// magic.
pub fn file_is_mach_core(path: &Path) -> bool {
    let mut header = [0u8; SIZEOF_HEADER_64];

    let Ok(mut file) = File::open(path) else {
        return false;
    };
    if file.read_exact(&mut header).is_err() {
        return false;
    }

    matches!(RawHeader::parse(&header), Some(header) if header.filetype == MH_CORE)
}
