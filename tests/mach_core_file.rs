//! Builds a minimal Mach-O core byte-by-byte and drives the whole pipeline
//! against it: detection, parsing, index construction, reads, and regions.

use macho_core::{
    CoreObjectFile, CoreProcess, CoreSettings, MachCoreFile, ObjectError,
    mach::{CPU_TYPE_X86_64, MH_CORE, MH_EXECUTE, MH_MAGIC_64},
};
use std::io::Write;

// usr/include/mach-o/loader.h
const LC_SEGMENT_64: u32 = 0x19;
const LC_THREAD: u32 = 0x4;
// usr/include/mach/i386/thread_status.h
const X86_THREAD_STATE64: u32 = 4;
const X86_THREAD_STATE64_COUNT: u32 = 42;

#[derive(Default)]
struct CoreBuilder {
    bytes: Vec<u8>,
}

impl CoreBuilder {
    fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn header(&mut self, filetype: u32, ncmds: u32, sizeofcmds: u32) -> &mut Self {
        self.u32(MH_MAGIC_64)
            .u32(CPU_TYPE_X86_64)
            .u32(3)
            .u32(filetype)
            .u32(ncmds)
            .u32(sizeofcmds)
            .u32(0) // flags
            .u32(0) // reserved
    }

    fn segment(&mut self, vmaddr: u64, vmsize: u64, fileoff: u64, initprot: u32) -> &mut Self {
        self.u32(LC_SEGMENT_64).u32(72);
        self.bytes.extend_from_slice(&[0u8; 16]); // segname
        self.u64(vmaddr)
            .u64(vmsize)
            .u64(fileoff)
            .u64(vmsize) // filesize
            .u32(7) // maxprot
            .u32(initprot)
            .u32(0) // nsects
            .u32(0) // flags
    }

    fn thread(&mut self) -> &mut Self {
        self.u32(LC_THREAD)
            .u32(16 + X86_THREAD_STATE64_COUNT * 4)
            .u32(X86_THREAD_STATE64)
            .u32(X86_THREAD_STATE64_COUNT);
        for word in 0..X86_THREAD_STATE64_COUNT {
            self.u32(word);
        }
        self
    }

    /// Pads to `offset`, then appends `len` bytes whose value is their file
    /// offset truncated to a byte.
    fn data_at(&mut self, offset: usize, len: usize) -> &mut Self {
        assert!(self.bytes.len() <= offset);
        self.bytes.resize(offset, 0);
        self.bytes
            .extend((offset..offset + len).map(|o| (o & 0xff) as u8));
        self
    }

    fn write(&self) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        file.write_all(&self.bytes).expect("failed to write core");
        file
    }
}

/// Two VM- and file-adjacent segments plus one thread context, with the
/// mapped bytes starting at file offset 0x1000.
fn minimal_core() -> tempfile::NamedTempFile {
    let mut builder = CoreBuilder::default();
    builder
        .header(MH_CORE, 3, 72 * 2 + 16 + X86_THREAD_STATE64_COUNT * 4)
        .segment(0x1000, 0x1000, 0x1000, 0x5)
        .segment(0x2000, 0x1000, 0x2000, 0x3)
        .thread()
        .data_at(0x1000, 0x2000);
    builder.write()
}

#[test]
fn detector_accepts_cores_and_rejects_everything_else() {
    let core = minimal_core();
    assert!(macho_core::detector::file_is_mach_core(core.path()));

    let mut builder = CoreBuilder::default();
    builder.header(MH_EXECUTE, 0, 0);
    let executable = builder.write();
    assert!(!macho_core::detector::file_is_mach_core(executable.path()));

    let mut truncated = tempfile::NamedTempFile::new().unwrap();
    truncated.write_all(&MH_MAGIC_64.to_le_bytes()).unwrap();
    assert!(!macho_core::detector::file_is_mach_core(truncated.path()));

    assert!(CoreProcess::candidate(executable.path(), CoreSettings::default()).is_none());
}

#[test]
fn parses_segments_and_thread_contexts() {
    let core = minimal_core();
    let object = MachCoreFile::open(core.path()).expect("core should parse");

    assert_eq!(object.num_thread_contexts(), 1);
    let context = object.thread_context(0).expect("context blob");
    assert_eq!(context.len(), X86_THREAD_STATE64_COUNT as usize * 4);
    assert_eq!(&context[..8], &[0, 0, 0, 0, 1, 0, 0, 0]);

    let sections = object.sections();
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].vm_addr, 0x1000);
    assert_eq!(sections[0].file_offset, 0x1000);
    assert_eq!(sections[1].permissions.bits(), 0x3);
}

#[test]
fn non_core_mach_files_do_not_parse() {
    let mut builder = CoreBuilder::default();
    builder.header(MH_EXECUTE, 0, 0);
    let executable = builder.write();

    match MachCoreFile::open(executable.path()) {
        Err(ObjectError::NotACore(filetype)) => assert_eq!(filetype, MH_EXECUTE),
        Err(other) => panic!("expected NotACore, got {other}"),
        Ok(_) => panic!("expected NotACore, got a parsed core"),
    }
}

#[test]
fn loads_and_serves_memory_from_disk() {
    macho_core::initialize();
    // Once-guarded; calling again must be harmless.
    macho_core::initialize();

    let core = minimal_core();
    let mut process = CoreProcess::candidate(core.path(), CoreSettings::default())
        .expect("detector should accept the core");
    process.load(None).expect("core should load");

    assert!(process.is_alive());
    assert_eq!(process.triple(), Some("x86_64-apple-macosx"));
    assert_eq!(process.threads().len(), 1);

    // The two segments are adjacent in VM and in file, so the index holds
    // a single coalesced entry.
    assert_eq!(process.segment_index().len(), 1);
    assert_eq!(process.permission_index().len(), 2);

    let mut buf = [0u8; 32];
    let read = process.read_memory(0x1ff0, &mut buf).expect("mapped");
    assert_eq!(read, 32);
    for (i, &byte) in buf.iter().enumerate() {
        assert_eq!(byte, ((0x1ff0 + i) & 0xff) as u8);
    }

    let region = process.get_region_info(0x2800).unwrap();
    assert_eq!((region.start, region.end), (0x2000, 0x3000));
    assert!(region.read && region.write && !region.execute);

    let mut buf = [0u8; 8];
    let err = process.read_memory(0x8000, &mut buf).unwrap_err();
    assert_eq!(err.to_string(), "core file does not contain 0x8000");
}
