//! Mach-O header plumbing shared by the on-disk detector and the in-memory
//! image scan.

use scroll::Pread;

pub use goblin::mach::header::{
    MH_CIGAM, MH_CIGAM_64, MH_CORE, MH_DYLDLINK, MH_DYLINKER, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64,
    SIZEOF_HEADER_32, SIZEOF_HEADER_64,
};

// usr/include/mach/machine.h
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
pub const CPU_TYPE_POWERPC: u32 = 18;

// usr/include/mach/machine.h, capability bits carried in the subtype
pub const CPU_SUBTYPE_MASK: u32 = 0xff00_0000;
// usr/include/mach/machine.h, i386 family
pub const CPU_SUBTYPE_486: u32 = 4;

/// The header fields shared by the 32- and 64-bit Mach-O forms, corrected
/// for byte order.
///
/// The fields end at offset 28, so parsing needs only
/// [`SIZEOF_HEADER_32`] bytes even for a 64-bit image (the extra word is
/// reserved padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl RawHeader {
    /// Parses the common header fields out of `bytes`.
    ///
    /// Images captured from the other byte order carry an `MH_CIGAM` /
    /// `MH_CIGAM_64` magic; every 32-bit field of those is byte-swapped so
    /// callers always see native values. Returns `None` when `bytes` is too
    /// short or the magic is not a Mach-O magic.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SIZEOF_HEADER_32 {
            return None;
        }

        let raw_magic: u32 = bytes.pread_with(0, scroll::LE).ok()?;
        let endian = match raw_magic {
            MH_MAGIC | MH_MAGIC_64 => scroll::LE,
            MH_CIGAM | MH_CIGAM_64 => scroll::BE,
            _ => return None,
        };

        let field = |offset: usize| bytes.pread_with::<u32>(offset, endian).ok();
        Some(Self {
            magic: field(0)?,
            cputype: field(4)?,
            cpusubtype: field(8)?,
            filetype: field(12)?,
            ncmds: field(16)?,
            sizeofcmds: field(20)?,
            flags: field(24)?,
        })
    }

    #[inline]
    pub fn is_64bit(&self) -> bool {
        self.magic == MH_MAGIC_64
    }
}
