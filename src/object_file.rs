//! The object-file seam: what the process backend needs from a parsed core
//! file, and the memory-mapped Mach-O implementation of it.

use crate::{
    errors::ObjectError,
    mach::{self, MH_CORE},
};
use goblin::mach::{Mach, MachO, SingleArch, load_command::CommandVariant};
use memmap2::Mmap;
use std::path::Path;

bitflags::bitflags! {
    /// Memory protection bits as recorded in a segment load command
    /// (`vm_prot_t`, usr/include/mach/vm_prot.h).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Permissions: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

/// One contiguous mapping described by a load command in the core: a VM
/// range paired with the file range holding its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreSection {
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub permissions: Permissions,
}

/// The CPU an image was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Architecture {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self.cpu_type {
            mach::CPU_TYPE_X86_64 => "x86_64",
            mach::CPU_TYPE_X86 => match self.cpu_subtype & !mach::CPU_SUBTYPE_MASK {
                mach::CPU_SUBTYPE_486 => "i486",
                _ => "i386",
            },
            mach::CPU_TYPE_ARM64 => "arm64",
            mach::CPU_TYPE_ARM => "arm",
            mach::CPU_TYPE_POWERPC => "powerpc",
            _ => "unknown",
        }
    }

    /// Target triple for the captured process. Cores only come from Darwin.
    pub fn triple(&self) -> String {
        format!("{}-apple-macosx", self.name())
    }
}

/// What the process backend consumes from the object-file parser.
///
/// [`MachCoreFile`] is the production implementation; tests substitute
/// in-memory fakes the way a borrowed byte slice stands in for a module in
/// other backends.
pub trait CoreObjectFile {
    /// Number of `LC_THREAD` register contexts recorded in the core.
    fn num_thread_contexts(&self) -> u32;

    /// The raw register blob for the context at `index`.
    fn thread_context(&self, index: u32) -> Option<&[u8]>;

    /// The mappings recorded in the core, in load-command order.
    fn sections(&self) -> &[CoreSection];

    /// Copies bytes starting at `file_offset` into `dst`, returning how many
    /// were available. Zero means `file_offset` is at or past end of file.
    fn copy(&self, file_offset: u64, dst: &mut [u8]) -> usize;

    fn architecture(&self) -> Architecture;
}

/// A parsed Mach-O core file backed by a read-only memory mapping.
pub struct MachCoreFile {
    data: Mmap,
    architecture: Architecture,
    sections: Vec<CoreSection>,
    thread_contexts: Vec<Vec<u8>>,
}

impl MachCoreFile {
    /// Maps `path` and parses it as a Mach-O core.
    pub fn open(path: &Path) -> Result<Self, ObjectError> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the mapping is never written through, and the debugger
        // owns the core file for the lifetime of the session
        let data = unsafe { Mmap::map(&file)? };
        Self::parse(data)
    }

    /// Parses an already-mapped core image.
    pub fn parse(data: Mmap) -> Result<Self, ObjectError> {
        let macho = match Mach::parse(&data)? {
            Mach::Binary(macho) => macho,
            // Cores are single-arch; a fat wrapper contributes its first
            // slice only
            Mach::Fat(fat) => match fat.get(0)? {
                SingleArch::MachO(macho) => macho,
                SingleArch::Archive(_) => return Err(ObjectError::NotMachO),
            },
        };

        if macho.header.filetype != MH_CORE {
            return Err(ObjectError::NotACore(macho.header.filetype));
        }

        let architecture = Architecture {
            cpu_type: macho.header.cputype as u32,
            cpu_subtype: macho.header.cpusubtype as u32,
        };
        let sections = Self::collect_sections(&macho);
        let thread_contexts = Self::collect_thread_contexts(&macho);

        Ok(Self {
            data,
            architecture,
            sections,
            thread_contexts,
        })
    }

    fn collect_sections(macho: &MachO<'_>) -> Vec<CoreSection> {
        macho
            .segments
            .iter()
            .map(|segment| CoreSection {
                vm_addr: segment.vmaddr,
                vm_size: segment.vmsize,
                file_offset: segment.fileoff,
                file_size: segment.filesize,
                permissions: Permissions::from_bits_truncate(segment.initprot as u32),
            })
            .collect()
    }

    fn collect_thread_contexts(macho: &MachO<'_>) -> Vec<Vec<u8>> {
        macho
            .load_commands
            .iter()
            .filter_map(|lc| match &lc.command {
                CommandVariant::Thread(cmd) | CommandVariant::Unixthread(cmd) => {
                    let count = (cmd.count as usize).min(cmd.thread_state.len());
                    Some(
                        cmd.thread_state[..count]
                            .iter()
                            .flat_map(|word| word.to_le_bytes())
                            .collect(),
                    )
                }
                _ => None,
            })
            .collect()
    }
}

impl CoreObjectFile for MachCoreFile {
    fn num_thread_contexts(&self) -> u32 {
        self.thread_contexts.len() as u32
    }

    fn thread_context(&self, index: u32) -> Option<&[u8]> {
        self.thread_contexts
            .get(index as usize)
            .map(Vec::as_slice)
    }

    fn sections(&self) -> &[CoreSection] {
        &self.sections
    }

    fn copy(&self, file_offset: u64, dst: &mut [u8]) -> usize {
        let Ok(offset) = usize::try_from(file_offset) else {
            return 0;
        };
        if offset >= self.data.len() {
            return 0;
        }

        let avail = dst.len().min(self.data.len() - offset);
        dst[..avail].copy_from_slice(&self.data[offset..offset + avail]);
        avail
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mach::{CPU_SUBTYPE_486, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64};

    #[test]
    fn architecture_names() {
        let arch = |cpu_type, cpu_subtype| Architecture {
            cpu_type,
            cpu_subtype,
        };

        assert_eq!(arch(CPU_TYPE_X86_64, 3).name(), "x86_64");
        assert_eq!(arch(CPU_TYPE_ARM64, 0).name(), "arm64");
        assert_eq!(arch(CPU_TYPE_X86, 3).name(), "i386");
        assert_eq!(arch(CPU_TYPE_X86, CPU_SUBTYPE_486).name(), "i486");
        // Capability bits in the subtype do not change the family.
        assert_eq!(arch(CPU_TYPE_X86, CPU_SUBTYPE_486 | 0x8000_0000).name(), "i486");
        assert_eq!(arch(CPU_TYPE_ARM64, 0).triple(), "arm64-apple-macosx");
    }
}
