//! Physical page storage over segment files.
//!
//! A segment is a bounded run of fixed-size page slots in one file under
//! `<root>/segments/`. Each file starts with a checksummed header; slot `n`
//! lives at byte offset `SEGMENT_HEADER_BYTES + n * page_size`.
//!
//! On-disk header layout (32 bytes, all fixed-width integers little-endian):
//! ```text
//!   magic       : [u8; 4]  - "SSEG"
//!   version     : u32      - format version (1)
//!   segment_id  : u32
//!   page_size   : u32
//!   capacity    : u32      - max pages in this segment
//!   reserved    : u32      - zero
//!   header_xxh3 : u64      - xxh3 of bytes [0..24]
//! ```
//!
//! The segment store never overwrites a slot that a sealed version can still
//! resolve; callers only direct writes at slots allocated for (or exclusively
//! owned by) the active version.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use strata_error::{Result, StrataError};
use strata_types::{PageSize, PhysicalPageId, SegmentCapacity, SegmentId};

/// Magic bytes for a segment file header.
pub const SEGMENT_MAGIC: [u8; 4] = *b"SSEG";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Byte size of the segment header on disk.
pub const SEGMENT_HEADER_BYTES: usize = 32;

/// Name of the segment directory under the store root.
pub const SEGMENT_DIR: &str = "segments";

fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("seg-{}", id.get()))
}

// ---------------------------------------------------------------------------
// SegmentHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentHeader {
    segment_id: SegmentId,
    page_size: PageSize,
    capacity: SegmentCapacity,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_BYTES] {
        let mut buf = [0u8; SEGMENT_HEADER_BYTES];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..8].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.segment_id.get().to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.get().to_le_bytes());
        buf[16..20].copy_from_slice(&self.capacity.get().to_le_bytes());
        // bytes 20..24 reserved, zero
        let hash = xxhash_rust::xxh3::xxh3_64(&buf[..24]);
        buf[24..32].copy_from_slice(&hash.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SEGMENT_HEADER_BYTES {
            return Err(StrataError::CorruptSegment {
                detail: format!(
                    "header too short: {} of {SEGMENT_HEADER_BYTES} bytes",
                    data.len()
                ),
            });
        }
        if data[0..4] != SEGMENT_MAGIC {
            return Err(StrataError::CorruptSegment {
                detail: "bad magic".to_owned(),
            });
        }
        let format = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes"));
        if format != SEGMENT_FORMAT_VERSION {
            return Err(StrataError::CorruptSegment {
                detail: format!("unsupported format version {format}"),
            });
        }
        let stored_hash = u64::from_le_bytes(data[24..32].try_into().expect("8 bytes"));
        let computed = xxhash_rust::xxh3::xxh3_64(&data[..24]);
        if stored_hash != computed {
            return Err(StrataError::CorruptSegment {
                detail: format!("header checksum mismatch: stored {stored_hash:#018x}, computed {computed:#018x}"),
            });
        }

        let segment_id = SegmentId::new(u32::from_le_bytes(data[8..12].try_into().expect("4 bytes")));
        let raw_page_size = u32::from_le_bytes(data[12..16].try_into().expect("4 bytes"));
        let page_size = PageSize::new(raw_page_size).ok_or_else(|| StrataError::CorruptSegment {
            detail: format!("invalid page size {raw_page_size}"),
        })?;
        let raw_capacity = u32::from_le_bytes(data[16..20].try_into().expect("4 bytes"));
        let capacity =
            SegmentCapacity::new(raw_capacity).ok_or_else(|| StrataError::CorruptSegment {
                detail: format!("invalid capacity {raw_capacity}"),
            })?;

        Ok(Self {
            segment_id,
            page_size,
            capacity,
        })
    }
}

// ---------------------------------------------------------------------------
// SegmentFile
// ---------------------------------------------------------------------------

/// One open segment file: positional page I/O plus a dirty flag for flush.
struct SegmentFile {
    id: SegmentId,
    file: File,
    dirty: bool,
}

impl SegmentFile {
    fn create(dir: &Path, id: SegmentId, page_size: PageSize, capacity: SegmentCapacity) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let header = SegmentHeader {
            segment_id: id,
            page_size,
            capacity,
        };
        file.write_all_at(&header.encode(), 0)?;
        debug!(segment = id.get(), path = %path.display(), "segment created");
        Ok(Self {
            id,
            file,
            dirty: true,
        })
    }

    fn open(dir: &Path, id: SegmentId, page_size: PageSize, capacity: SegmentCapacity) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = [0u8; SEGMENT_HEADER_BYTES];
        let n = file.read_at(&mut buf, 0)?;
        let header = SegmentHeader::decode(&buf[..n])?;
        if header.segment_id != id {
            return Err(StrataError::CorruptSegment {
                detail: format!(
                    "segment id mismatch: file says {}, expected {}",
                    header.segment_id, id
                ),
            });
        }
        if header.page_size != page_size || header.capacity != capacity {
            return Err(StrataError::CorruptSegment {
                detail: format!(
                    "geometry mismatch in segment {}: file has page_size={} capacity={}",
                    id, header.page_size, header.capacity
                ),
            });
        }
        Ok(Self {
            id,
            file,
            dirty: false,
        })
    }

    fn page_offset(page_size: PageSize, slot: u32) -> u64 {
        SEGMENT_HEADER_BYTES as u64 + u64::from(slot) * u64::from(page_size.get())
    }

    fn read_page(&self, page_size: PageSize, slot: u32, buf: &mut [u8]) -> Result<()> {
        let offset = Self::page_offset(page_size, slot);
        let mut total = 0usize;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                return Err(StrataError::ShortRead {
                    expected: buf.len(),
                    actual: total,
                });
            }
            total += n;
        }
        Ok(())
    }

    fn write_page(&mut self, page_size: PageSize, slot: u32, data: &[u8]) -> Result<()> {
        let offset = Self::page_offset(page_size, slot);
        self.file.write_all_at(data, offset)?;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Allocation state
// ---------------------------------------------------------------------------

/// Persistable allocation state of one segment: the append frontier plus the
/// set of freed slots below it. Recorded in the manifest and restored on open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentAllocation {
    pub id: SegmentId,
    /// First never-allocated slot; all slots >= this are unused.
    pub next_slot: u32,
    /// Freed slots below `next_slot`, available for reuse.
    pub free_slots: Vec<u32>,
}

#[derive(Debug, Default)]
struct SlotState {
    next_slot: u32,
    free: BTreeSet<u32>,
}

impl SlotState {
    fn in_use(&self, capacity: SegmentCapacity) -> u32 {
        debug_assert!(self.next_slot <= capacity.get());
        self.next_slot - u32::try_from(self.free.len()).expect("free set fits u32")
    }
}

// ---------------------------------------------------------------------------
// SegmentStore
// ---------------------------------------------------------------------------

/// Owns all segment files of a store and the physical allocation state.
pub struct SegmentStore {
    dir: PathBuf,
    page_size: PageSize,
    capacity: SegmentCapacity,
    files: BTreeMap<SegmentId, SegmentFile>,
    slots: BTreeMap<SegmentId, SlotState>,
}

impl SegmentStore {
    /// Create the segment directory and the first segment.
    pub fn create(root: &Path, page_size: PageSize, capacity: SegmentCapacity) -> Result<Self> {
        let dir = root.join(SEGMENT_DIR);
        std::fs::create_dir_all(&dir)?;
        let mut store = Self {
            dir,
            page_size,
            capacity,
            files: BTreeMap::new(),
            slots: BTreeMap::new(),
        };
        store.grow_segment()?;
        Ok(store)
    }

    /// Open existing segments, restoring allocation state from the manifest.
    pub fn open(
        root: &Path,
        page_size: PageSize,
        capacity: SegmentCapacity,
        allocations: &[SegmentAllocation],
    ) -> Result<Self> {
        let dir = root.join(SEGMENT_DIR);
        let mut files = BTreeMap::new();
        let mut slots = BTreeMap::new();
        for alloc in allocations {
            if alloc.next_slot > capacity.get() {
                return Err(StrataError::CorruptManifest {
                    detail: format!(
                        "segment {} allocation frontier {} exceeds capacity {}",
                        alloc.id, alloc.next_slot, capacity
                    ),
                });
            }
            let in_use = alloc.next_slot as usize - alloc.free_slots.len();
            let file = match SegmentFile::open(&dir, alloc.id, page_size, capacity) {
                Ok(file) => file,
                // A fully-empty segment can vanish between a vacuum's file
                // removal and its manifest write; recreate it rather than
                // refuse to open.
                Err(StrataError::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound && in_use == 0 =>
                {
                    SegmentFile::create(&dir, alloc.id, page_size, capacity)?
                }
                Err(e) => return Err(e),
            };
            files.insert(alloc.id, file);
            slots.insert(
                alloc.id,
                SlotState {
                    next_slot: alloc.next_slot,
                    free: alloc.free_slots.iter().copied().collect(),
                },
            );
        }
        Ok(Self {
            dir,
            page_size,
            capacity,
            files,
            slots,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[must_use]
    pub fn capacity(&self) -> SegmentCapacity {
        self.capacity
    }

    /// Number of segments currently on disk.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.files.len()
    }

    /// Total pages currently allocated (frontier minus free slots), across
    /// all segments.
    #[must_use]
    pub fn pages_in_use(&self) -> u64 {
        self.slots
            .values()
            .map(|s| u64::from(s.in_use(self.capacity)))
            .sum()
    }

    /// Snapshot of allocation state, for the manifest.
    #[must_use]
    pub fn allocations(&self) -> Vec<SegmentAllocation> {
        self.slots
            .iter()
            .map(|(&id, s)| SegmentAllocation {
                id,
                next_slot: s.next_slot,
                free_slots: s.free.iter().copied().collect(),
            })
            .collect()
    }

    /// Allocate one page: first fit across segments in id order, preferring
    /// freed slots; append a new segment once every existing one is full.
    pub fn allocate_page(&mut self) -> Result<PhysicalPageId> {
        for (&id, state) in &mut self.slots {
            if let Some(&slot) = state.free.iter().next() {
                state.free.remove(&slot);
                return Ok(PhysicalPageId::new(id, slot));
            }
            if state.next_slot < self.capacity.get() {
                let slot = state.next_slot;
                state.next_slot += 1;
                return Ok(PhysicalPageId::new(id, slot));
            }
        }

        let id = self.grow_segment()?;
        let state = self.slots.get_mut(&id).expect("segment just created");
        let slot = state.next_slot;
        state.next_slot += 1;
        Ok(PhysicalPageId::new(id, slot))
    }

    /// Append a new, empty segment and return its id.
    pub fn grow_segment(&mut self) -> Result<SegmentId> {
        let id = self
            .files
            .keys()
            .next_back()
            .map_or(SegmentId::new(0), |last| SegmentId::new(last.get() + 1));
        let file = SegmentFile::create(&self.dir, id, self.page_size, self.capacity)?;
        self.files.insert(id, file);
        self.slots.insert(id, SlotState::default());
        Ok(id)
    }

    fn check_allocated(&self, page: PhysicalPageId) -> Result<&SlotState> {
        let state = self
            .slots
            .get(&page.segment())
            .ok_or_else(|| StrataError::CorruptSegment {
                detail: format!("page {page} references unknown segment"),
            })?;
        if page.slot() >= state.next_slot || state.free.contains(&page.slot()) {
            return Err(StrataError::CorruptSegment {
                detail: format!("page {page} is not allocated"),
            });
        }
        Ok(state)
    }

    /// Read one full page into `buf` (`buf.len()` must equal the page size).
    pub fn read_page(&self, page: PhysicalPageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size.as_usize());
        self.check_allocated(page)?;
        let file = self
            .files
            .get(&page.segment())
            .expect("allocated segment has an open file");
        file.read_page(self.page_size, page.slot(), buf)
    }

    /// Write one full page (`data.len()` must equal the page size).
    pub fn write_page(&mut self, page: PhysicalPageId, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size.as_usize());
        self.check_allocated(page)?;
        let file = self
            .files
            .get_mut(&page.segment())
            .expect("allocated segment has an open file");
        file.write_page(self.page_size, page.slot(), data)
    }

    /// Return a page's slot to the free set.
    pub fn free_page(&mut self, page: PhysicalPageId) -> Result<()> {
        self.check_allocated(page)?;
        let state = self
            .slots
            .get_mut(&page.segment())
            .expect("segment exists after check");
        state.free.insert(page.slot());
        Ok(())
    }

    /// Durability barrier: fsync every dirty segment file.
    pub fn flush(&mut self) -> Result<()> {
        for file in self.files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Drop trailing segments that hold no allocated pages, deleting their
    /// files. Returns the ids removed. The first segment is always kept so
    /// the store never has zero segments.
    pub fn remove_empty_tail_segments(&mut self) -> Result<Vec<SegmentId>> {
        let mut removed = Vec::new();
        while self.files.len() > 1 {
            let (&last, _) = self.files.iter().next_back().expect("non-empty");
            let state = &self.slots[&last];
            if state.in_use(self.capacity) != 0 {
                break;
            }
            self.files.remove(&last);
            self.slots.remove(&last);
            std::fs::remove_file(segment_path(&self.dir, last))?;
            debug!(segment = last.get(), "empty tail segment removed");
            removed.push(last);
        }
        Ok(removed)
    }
}
