//! The core-file process facade: makes a post-mortem core image answer the
//! memory, region, and thread queries a live stopped process would.

use crate::{
    INVALID_ADDRESS, detector,
    discovery::{DYLD_PLUGIN_NAME, DiscoveryState, KERNEL_PLUGIN_NAME, KernelSearcher},
    errors::{InvalidRegionAddress, LoadError, UnmappedRead},
    object_file::{Architecture, CoreObjectFile, MachCoreFile, Permissions},
    range_map::AddressRange,
    reader::{CorefileReader, FileRange, PermissionIndex, SegmentIndex},
};
use memmap2::Mmap;
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Host-debugger settings consumed by the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreSettings {
    /// When the dump holds both a kernel and a dyld image, hand the kernel
    /// to the dynamic loader instead of dyld.
    pub prefer_kernel_corefile: bool,
}

/// Handle to one recorded thread context, numbered in the order the
/// LC_THREAD commands appear in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreThread {
    id: u32,
}

impl CoreThread {
    fn new(id: u32) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Answer to a region-info query.
///
/// Gaps between known mappings come back as a synthetic no-access region
/// running up to the next mapping, so clients can walk all of memory by
/// repeatedly querying the end of the previous region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub mapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SessionState {
    Candidate,
    Loaded,
    Alive,
}

/// A Mach-O core file posing as a stopped process.
///
/// Between construction and [`load`](Self::load) only the path and the
/// object-file handle are valid; `load` builds the address indices,
/// discovers the loader image, and synthesizes the thread list.
pub struct CoreProcess {
    path: PathBuf,
    settings: CoreSettings,
    object: Option<Arc<dyn CoreObjectFile>>,
    segments: SegmentIndex,
    permissions: PermissionIndex,
    discovery: DiscoveryState,
    threads: Vec<CoreThread>,
    triple: Option<String>,
    state: SessionState,
}

impl CoreProcess {
    /// Factory entry point used by the plugin registry: yields a candidate
    /// session only when the detector recognizes `path` as a Mach-O core.
    pub fn candidate(path: impl Into<PathBuf>, settings: CoreSettings) -> Option<Self> {
        let path = path.into();
        detector::file_is_mach_core(&path).then(|| Self::new(path, settings))
    }

    /// Builds a session around an object file the enclosing module cache
    /// already parsed.
    pub fn with_object(
        path: impl Into<PathBuf>,
        object: Arc<dyn CoreObjectFile>,
        settings: CoreSettings,
    ) -> Self {
        let mut process = Self::new(path.into(), settings);
        process.object = Some(object);
        process
    }

    fn new(path: PathBuf, settings: CoreSettings) -> Self {
        Self {
            path,
            settings,
            object: None,
            segments: SegmentIndex::new(),
            permissions: PermissionIndex::new(),
            discovery: DiscoveryState::default(),
            threads: Vec::new(),
            triple: None,
            state: SessionState::Candidate,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The target triple taken from the core. Cores are single-arch, so
    /// this always overrides whatever the target guessed beforehand.
    pub fn triple(&self) -> Option<&str> {
        self.triple.as_deref()
    }

    pub fn segment_index(&self) -> &SegmentIndex {
        &self.segments
    }

    pub fn permission_index(&self) -> &PermissionIndex {
        &self.permissions
    }

    pub fn dyld_address(&self) -> u64 {
        self.discovery.dyld_addr
    }

    pub fn kernel_address(&self) -> u64 {
        self.discovery.kernel_addr
    }

    /// Name of the dynamic-loader plugin chosen for this core, or an empty
    /// string when no loader image was found.
    pub fn dynamic_loader_name(&self) -> &'static str {
        self.discovery.loader_plugin
    }

    pub fn set_prefer_kernel_corefile(&mut self, prefer: bool) {
        self.settings.prefer_kernel_corefile = prefer;
        self.select_dynamic_loader();
    }

    /// Turns the candidate into a stopped process: attaches the object
    /// file, builds the segment and permission indices, locates the loader
    /// image, and synthesizes the thread list.
    pub fn load(&mut self, kernel_search: Option<&dyn KernelSearcher>) -> Result<(), LoadError> {
        if self.object.is_none() {
            let file = File::open(&self.path)
                .map_err(|err| LoadError::InvalidCoreModule(Some(err)))?;
            // SAFETY: the mapping is read-only and the core file outlives
            // the session
            let data = unsafe { Mmap::map(&file) }
                .map_err(|err| LoadError::InvalidCoreModule(Some(err)))?;
            let object = MachCoreFile::parse(data).map_err(|err| {
                log::warn!("unable to parse {}: {err}", self.path.display());
                LoadError::InvalidCoreObjectFile(err)
            })?;
            self.object = Some(Arc::new(object));
        }
        let Some(object) = self.object.clone() else {
            return Err(LoadError::InvalidCoreModule(None));
        };

        if object.num_thread_contexts() == 0 {
            return Err(LoadError::NoThreadContexts);
        }
        let sections = object.sections();
        if sections.is_empty() {
            return Err(LoadError::NoSections);
        }

        self.build_indices(sections);
        self.state = SessionState::Loaded;

        self.triple = Some(normalized_triple(&object.architecture()));

        if self.discovery.dyld_addr == INVALID_ADDRESS
            || self.discovery.kernel_addr == INVALID_ADDRESS
        {
            self.scan_for_images(object.as_ref());
        }
        if self.discovery.kernel_addr != INVALID_ADDRESS {
            if let Some(searcher) = kernel_search {
                self.refine_kernel_address(searcher);
            }
        }
        self.select_dynamic_loader();

        let old_list = std::mem::take(&mut self.threads);
        let mut new_list = Vec::new();
        self.update_thread_list(&old_list, &mut new_list);
        self.threads = new_list;

        self.state = SessionState::Alive;
        Ok(())
    }

    fn build_indices(&mut self, sections: &[crate::object_file::CoreSection]) {
        self.segments = SegmentIndex::new();
        self.permissions = PermissionIndex::new();

        // Sections usually arrive in ascending VM order, which lets
        // adjacent entries coalesce as they are appended. If the order ever
        // breaks we stop merging and sort both indices afterwards instead.
        let mut sorted = true;
        let mut last_base = 0u64;

        for section in sections {
            if section.vm_addr < last_base {
                sorted = false;
            }
            last_base = section.vm_addr;

            // Every section lands in both indices, even an empty one: its
            // base still bounds the following-entry lookups region queries
            // rely on. Only merging into the previous entry is skipped.
            let mut coalesced = false;
            if sorted && section.vm_size != 0 {
                if let Some(back) = self.segments.back_mut() {
                    if back.range.end() == section.vm_addr
                        && back.value.offset + back.value.size == section.file_offset
                    {
                        back.range.size += section.vm_size;
                        back.value.size += section.file_size;
                        coalesced = true;
                    }
                }
            }
            if !coalesced {
                self.segments.append(
                    AddressRange::new(section.vm_addr, section.vm_size),
                    FileRange {
                        offset: section.file_offset,
                        size: section.file_size,
                    },
                );
            }

            // Some producers leave the protection bits zeroed; assume RX so
            // the pages can still be disassembled.
            let permissions = if section.permissions.is_empty() {
                Permissions::READ | Permissions::EXECUTE
            } else {
                section.permissions
            };
            self.permissions
                .append(AddressRange::new(section.vm_addr, section.vm_size), permissions);
        }

        if !sorted {
            self.segments.sort();
            self.permissions.sort();
        }
    }

    /// Sweeps every mapped range at page granularity looking for the
    /// Mach-O header of dyld or of a kernel. Both images may be present in
    /// one dump, so the sweep keeps going after a hit to let the other
    /// slot fill too.
    fn scan_for_images(&mut self, object: &dyn CoreObjectFile) {
        let reader = CorefileReader::new(&self.segments, object);
        for entry in self.segments.iter() {
            let mut addr = entry.range.base;
            while addr < entry.range.end() {
                self.discovery.probe(addr, &reader);
                match addr.checked_add(0x1000) {
                    Some(next) => addr = next,
                    None => break,
                }
            }
        }
    }

    /// A 4K-stride sweep can false-hit a non-primary kernel image present
    /// elsewhere in the dump. Hide the recorded addresses so the kernel
    /// plugin runs its own search, restore them, and keep its answer when
    /// it found one.
    fn refine_kernel_address(&mut self, searcher: &dyn KernelSearcher) {
        let recorded_kernel = self.discovery.kernel_addr;
        let recorded_dyld = self.discovery.dyld_addr;
        self.discovery.kernel_addr = INVALID_ADDRESS;
        self.discovery.dyld_addr = INVALID_ADDRESS;

        let found = searcher.search_for_kernel(self);

        self.discovery.kernel_addr = recorded_kernel;
        self.discovery.dyld_addr = recorded_dyld;
        if found != INVALID_ADDRESS {
            self.discovery.kernel_addr = found;
        }
    }

    fn select_dynamic_loader(&mut self) {
        let (preferred, fallback, preferred_name, fallback_name) = self.preference_order();
        self.discovery.loader_plugin = if preferred != INVALID_ADDRESS {
            preferred_name
        } else if fallback != INVALID_ADDRESS {
            fallback_name
        } else {
            ""
        };
    }

    fn preference_order(&self) -> (u64, u64, &'static str, &'static str) {
        if self.settings.prefer_kernel_corefile {
            (
                self.discovery.kernel_addr,
                self.discovery.dyld_addr,
                KERNEL_PLUGIN_NAME,
                DYLD_PLUGIN_NAME,
            )
        } else {
            (
                self.discovery.dyld_addr,
                self.discovery.kernel_addr,
                DYLD_PLUGIN_NAME,
                KERNEL_PLUGIN_NAME,
            )
        }
    }

    /// The address the chosen loader image begins at, handed to the
    /// downstream dynamic-loader plugin. [`INVALID_ADDRESS`] only when
    /// neither image was found.
    pub fn image_info_address(&self) -> u64 {
        let (preferred, fallback, _, _) = self.preference_order();
        if preferred != INVALID_ADDRESS {
            preferred
        } else {
            fallback
        }
    }

    /// Refreshes `new_list` from the recorded thread contexts.
    ///
    /// The first refresh allocates one handle per recorded context,
    /// numbered `0..N`; later refreshes carry the old handles over
    /// verbatim. Returns true when the resulting list is non-empty.
    pub fn update_thread_list(
        &self,
        old_list: &[CoreThread],
        new_list: &mut Vec<CoreThread>,
    ) -> bool {
        if old_list.is_empty() {
            let contexts = self
                .object
                .as_deref()
                .map_or(0, CoreObjectFile::num_thread_contexts);
            new_list.extend((0..contexts).map(CoreThread::new));
        } else {
            new_list.extend_from_slice(old_list);
        }
        !new_list.is_empty()
    }

    pub fn threads(&self) -> &[CoreThread] {
        &self.threads
    }

    /// The raw register blob recorded for `thread`.
    pub fn thread_context(&self, thread: &CoreThread) -> Option<&[u8]> {
        self.object.as_deref()?.thread_context(thread.id)
    }

    /// Copies bytes mapped at `[addr, addr + dst.len())` into `dst`.
    ///
    /// The core file is its own cache, so this goes straight to the sparse
    /// reader, bypassing any upstream memory caching. See
    /// [`CorefileReader::read`] for the short-read contract.
    pub fn read_memory(&self, addr: u64, dst: &mut [u8]) -> Result<usize, UnmappedRead> {
        let Some(object) = self.object.as_deref() else {
            return Err(UnmappedRead { address: addr });
        };
        CorefileReader::new(&self.segments, object).read(addr, dst)
    }

    /// Describes the memory region containing `addr`.
    pub fn get_region_info(&self, addr: u64) -> Result<MemoryRegion, InvalidRegionAddress> {
        let Some(entry) = self.permissions.find_contains_or_follows(addr) else {
            return Err(InvalidRegionAddress);
        };

        if entry.range.contains(addr) {
            Ok(MemoryRegion {
                start: entry.range.base,
                end: entry.range.end(),
                read: entry.value.contains(Permissions::READ),
                write: entry.value.contains(Permissions::WRITE),
                execute: entry.value.contains(Permissions::EXECUTE),
                mapped: true,
            })
        } else {
            // The hit is the next mapping up: report the gap as a
            // no-access region ending where that mapping begins.
            Ok(MemoryRegion {
                start: addr,
                end: entry.range.base,
                read: false,
                write: false,
                execute: false,
                mapped: false,
            })
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state >= SessionState::Loaded
    }

    /// Tearing down a process that was never alive is a no-op.
    pub fn destroy(&mut self) {}

    /// Detaching from a core never loses state worth warning about.
    pub fn warn_before_detach(&self) -> bool {
        false
    }
}

fn normalized_triple(architecture: &Architecture) -> String {
    let triple = architecture.triple();
    // Cores captured from an i486 slice still debug as generic i386; keep
    // the vendor and platform components.
    match triple.split_once('-') {
        Some(("i486", rest)) => format!("i386-{rest}"),
        _ => triple,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mach::{CPU_SUBTYPE_486, CPU_TYPE_ARM64, CPU_TYPE_X86};

    #[test]
    fn i486_cores_debug_as_i386() {
        let triple = normalized_triple(&Architecture {
            cpu_type: CPU_TYPE_X86,
            cpu_subtype: CPU_SUBTYPE_486,
        });
        assert_eq!(triple, "i386-apple-macosx");

        let triple = normalized_triple(&Architecture {
            cpu_type: CPU_TYPE_ARM64,
            cpu_subtype: 0,
        });
        assert_eq!(triple, "arm64-apple-macosx");
    }
}
