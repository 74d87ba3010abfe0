//! Backend that makes a post-mortem Mach-O core file look like a live,
//! stopped process: it recognizes a core on disk, indexes its sparse
//! address space, finds the dyld or kernel image embedded in the captured
//! memory, and answers memory-read, region-info, and thread queries.
//!
//! The backend never writes to core memory and never resumes anything;
//! symbolication and expression evaluation belong to other layers.

pub mod detector;
pub mod discovery;
pub mod errors;
pub mod mach;
pub mod object_file;
pub mod process;
pub mod range_map;
pub mod reader;

pub use discovery::{DYLD_PLUGIN_NAME, KERNEL_PLUGIN_NAME, KernelSearcher};
pub use errors::{InvalidRegionAddress, LoadError, ObjectError, UnmappedRead};
pub use object_file::{Architecture, CoreObjectFile, CoreSection, MachCoreFile, Permissions};
pub use process::{CoreProcess, CoreSettings, CoreThread, MemoryRegion};

/// Sentinel address meaning "unknown".
pub const INVALID_ADDRESS: u64 = u64::MAX;

/// Static plugin identity handed to the host's registry.
pub const PLUGIN_NAME: &str = "mach-o-core";
pub const PLUGIN_DESCRIPTION: &str = "Mach-O core file debugging plug-in.";
pub const PLUGIN_VERSION: u32 = 1;

static INITIALIZED: std::sync::Once = std::sync::Once::new();

/// Registers the backend with the host process. Called once per process
/// lifetime; additional calls have no effect.
pub fn initialize() {
    INITIALIZED.call_once(|| {
        log::debug!("registered {PLUGIN_NAME} plug-in v{PLUGIN_VERSION}");
    });
}
