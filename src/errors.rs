use thiserror::Error;

/// Failures producing a [`MachCoreFile`](crate::object_file::MachCoreFile)
/// from bytes on disk.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("i/o error reading core file")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] goblin::error::Error),
    #[error("file is not a Mach-O core (filetype {0:#x})")]
    NotACore(u32),
    #[error("fat slice does not hold a Mach-O image")]
    NotMachO,
}

/// Fatal failures while turning a core candidate into a stopped process.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No module could be produced for the core file.
    #[error("invalid core module")]
    InvalidCoreModule(#[source] Option<std::io::Error>),
    /// The module has bytes behind it, but they do not parse into an object
    /// file.
    #[error("invalid core object file")]
    InvalidCoreObjectFile(#[source] ObjectError),
    #[error(
        "core file doesn't contain any LC_THREAD load commands, or the LC_THREAD architecture is not supported"
    )]
    NoThreadContexts,
    #[error("core file has no sections")]
    NoSections,
}

/// Returned from a memory read only when not a single byte could be served.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("core file does not contain 0x{address:x}")]
pub struct UnmappedRead {
    pub address: u64,
}

/// Returned from a region query for addresses past the last known mapping.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid address")]
pub struct InvalidRegionAddress;
