//! Locating the dynamic linker or kernel image inside captured memory.
//!
//! A user-space core carries dyld somewhere in its address space; a kernel
//! core carries the kernel image itself. Neither records where, so the
//! loader sweeps the captured ranges reading Mach-O headers at page
//! granularity and classifies what it finds.

use crate::{
    INVALID_ADDRESS,
    mach::{MH_DYLDLINK, MH_DYLINKER, MH_EXECUTE, RawHeader, SIZEOF_HEADER_32},
    process::CoreProcess,
    reader::CorefileReader,
};

/// Dynamic-loader plugin handling user-space processes loaded by dyld.
pub const DYLD_PLUGIN_NAME: &str = "dyld-macosx";
/// Dynamic-loader plugin handling xnu kernels and their kexts.
pub const KERNEL_PLUGIN_NAME: &str = "darwin-kernel";

/// Implemented by the Darwin kernel dynamic-loader plugin: given the
/// stopped session, runs its own search for the primary kernel image.
pub trait KernelSearcher {
    /// The address of the kernel image, or [`INVALID_ADDRESS`] when none
    /// was found.
    fn search_for_kernel(&self, process: &CoreProcess) -> u64;
}

/// What the image sweep found: at most one dynamic-linker address and at
/// most one kernel address, plus the loader plugin chosen between them.
#[derive(Debug, Clone)]
pub struct DiscoveryState {
    pub dyld_addr: u64,
    pub kernel_addr: u64,
    pub loader_plugin: &'static str,
}

impl Default for DiscoveryState {
    fn default() -> Self {
        Self {
            dyld_addr: INVALID_ADDRESS,
            kernel_addr: INVALID_ADDRESS,
            loader_plugin: "",
        }
    }
}

impl DiscoveryState {
    /// Inspects `addr` for a Mach-O header and classifies the image.
    ///
    /// The first hit in each slot wins; a recorded address is never
    /// replaced by a later one.
    pub fn probe(&mut self, addr: u64, reader: &CorefileReader<'_>) {
        let mut bytes = [0u8; SIZEOF_HEADER_32];
        match reader.read(addr, &mut bytes) {
            Ok(n) if n == bytes.len() => {}
            _ => return,
        }

        let Some(header) = RawHeader::parse(&bytes) else {
            return;
        };

        match header.filetype {
            MH_DYLINKER => {
                if self.dyld_addr == INVALID_ADDRESS {
                    log::debug!("found dyld image at {addr:#x}");
                    self.dyld_addr = addr;
                }
            }
            // A kernel is an executable that is not itself dynamically
            // linked. MH_EXECUTE images with MH_DYLDLINK set are ordinary
            // binaries loaded by dyld, not the loader.
            MH_EXECUTE if header.flags & MH_DYLDLINK == 0 => {
                if self.kernel_addr == INVALID_ADDRESS {
                    log::debug!("found kernel image at {addr:#x}");
                    self.kernel_addr = addr;
                }
            }
            _ => {}
        }
    }
}
