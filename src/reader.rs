//! Sparse memory reads against the VM-to-file-offset index.

use crate::{
    errors::UnmappedRead,
    object_file::{CoreObjectFile, Permissions},
    range_map::RangeMap,
};

/// The file range backing one VM range of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileRange {
    pub offset: u64,
    pub size: u64,
}

/// VM address -> backing file range. Adjacent-in-both entries are coalesced
/// at construction time.
pub type SegmentIndex = RangeMap<u64, FileRange>;

/// VM address -> protection bits, one entry per original section.
pub type PermissionIndex = RangeMap<u64, Permissions>;

/// Reads process memory out of the core file, splicing a request across
/// segments that are adjacent in VM but scattered in the file.
pub struct CorefileReader<'a> {
    segments: &'a SegmentIndex,
    object: &'a dyn CoreObjectFile,
}

impl<'a> CorefileReader<'a> {
    pub fn new(segments: &'a SegmentIndex, object: &'a dyn CoreObjectFile) -> Self {
        Self { segments, object }
    }

    /// Copies the bytes mapped at `[addr, addr + dst.len())` into `dst`.
    ///
    /// Success is measured in bytes returned, never in whether the request
    /// was fully satisfied: a read that runs into an unmapped gap or end of
    /// file comes back short with no error. The error is populated only
    /// when the very first address is unmapped.
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, UnmappedRead> {
        let size = dst.len();
        let mut bytes_read = 0usize;

        while bytes_read < size {
            let curr_addr = addr + bytes_read as u64;
            let Some(entry) = self.segments.find_contains(curr_addr) else {
                if bytes_read == 0 {
                    return Err(UnmappedRead { address: addr });
                }
                break;
            };

            let offset_in_segment = curr_addr - entry.range.base;
            let bytes_left = entry.range.end() - curr_addr;
            let bytes_to_read = (size - bytes_read).min(bytes_left as usize);

            let got = self.object.copy(
                entry.value.offset + offset_in_segment,
                &mut dst[bytes_read..bytes_read + bytes_to_read],
            );
            if got == 0 {
                break;
            }
            bytes_read += got;
        }

        Ok(bytes_read)
    }
}
