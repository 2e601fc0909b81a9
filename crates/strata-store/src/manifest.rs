//! The manifest: durable root record of the store.
//!
//! Single file (`strata.manifest`) holding everything needed to reopen a
//! store: geometry, the retained version range, every version's delta table,
//! segment allocation state, and the file catalog. Replaced atomically
//! (write temp, fsync, rename, fsync directory), so a crash at any point
//! leaves either the old or the new manifest - never a torn one. The rename
//! is the commit point of the seal protocol.
//!
//! On-disk encoding: all fixed-width integers little-endian, sizes
//! byte-exact, xxh3 checksum over the whole body as the trailer.
//!
//! ```text
//!   magic          : [u8; 4]  - "SMAN"
//!   format         : u32      - 1
//!   page_size      : u32
//!   capacity       : u32      - pages per segment
//!   min_version    : u32      - retained floor
//!   active_version : u32
//!   segments       : u32 count, then per segment:
//!                      id u32, next_slot u32, free_count u32, free_slot u32 ...
//!   catalog        : next_id u32, count u32, then per file:
//!                      id u32, created u32, deleted u32 (0 = live),
//!                      name_len u16, name bytes
//!   versions       : u32 count, then per version:
//!                      id u32, state u8 (1 = sealed, 2 = active),
//!                      table_count u32, then per table:
//!                        file u32, entry_count u32, then per entry:
//!                          page u32, kind u8 (0 = tombstone, 1 = page),
//!                          phys u64 (present only when kind = 1)
//!   body_xxh3      : u64
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::{debug, info};

use strata_error::{Result, StrataError};
use strata_types::{
    FileId, LogicalPageId, PageSize, PhysicalPageId, SegmentCapacity, SegmentId, VersionId,
};

use crate::catalog::FileRecord;
use crate::segment::SegmentAllocation;
use crate::version::{Mapping, PageTable, VersionRecord, VersionState};

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"SMAN";

/// Current manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Manifest file name under the store root.
pub const MANIFEST_FILE: &str = "strata.manifest";

const MANIFEST_TMP_FILE: &str = "strata.manifest.tmp";

const STATE_SEALED: u8 = 1;
const STATE_ACTIVE: u8 = 2;

/// A decoded (or to-be-encoded) manifest: plain data, no live handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub page_size: PageSize,
    pub capacity: SegmentCapacity,
    pub min_version: VersionId,
    pub active_version: VersionId,
    pub segments: Vec<SegmentAllocation>,
    pub catalog_next_id: u32,
    pub files: BTreeMap<FileId, FileRecord>,
    pub versions: BTreeMap<VersionId, VersionRecord>,
}

impl Manifest {
    /// Encode to the byte-exact on-disk form, checksum trailer included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        put_u32(&mut buf, MANIFEST_FORMAT_VERSION);
        put_u32(&mut buf, self.page_size.get());
        put_u32(&mut buf, self.capacity.get());
        put_u32(&mut buf, self.min_version.get());
        put_u32(&mut buf, self.active_version.get());

        put_u32(&mut buf, u32::try_from(self.segments.len()).expect("segment count fits u32"));
        for seg in &self.segments {
            put_u32(&mut buf, seg.id.get());
            put_u32(&mut buf, seg.next_slot);
            put_u32(&mut buf, u32::try_from(seg.free_slots.len()).expect("free count fits u32"));
            for &slot in &seg.free_slots {
                put_u32(&mut buf, slot);
            }
        }

        put_u32(&mut buf, self.catalog_next_id);
        put_u32(&mut buf, u32::try_from(self.files.len()).expect("file count fits u32"));
        for (&id, record) in &self.files {
            put_u32(&mut buf, id.get());
            put_u32(&mut buf, record.created_at.get());
            put_u32(&mut buf, record.deleted_at.map_or(0, VersionId::get));
            let name = record.name.as_bytes();
            put_u16(&mut buf, u16::try_from(name.len()).expect("file name fits u16"));
            buf.extend_from_slice(name);
        }

        put_u32(&mut buf, u32::try_from(self.versions.len()).expect("version count fits u32"));
        for (&v, record) in &self.versions {
            put_u32(&mut buf, v.get());
            buf.push(match record.state {
                VersionState::Sealed => STATE_SEALED,
                // A manifest is only ever written outside the sealing window,
                // so Sealing never hits disk.
                VersionState::Active | VersionState::Sealing => STATE_ACTIVE,
            });
            put_u32(&mut buf, u32::try_from(record.tables.len()).expect("table count fits u32"));
            for (&file, table) in &record.tables {
                put_u32(&mut buf, file.get());
                put_u32(
                    &mut buf,
                    u32::try_from(table.entries.len()).expect("entry count fits u32"),
                );
                for (&page, &mapping) in &table.entries {
                    put_u32(&mut buf, page.get());
                    match mapping {
                        Mapping::Tombstone => buf.push(0),
                        Mapping::Page(p) => {
                            buf.push(1);
                            put_u64(&mut buf, p.to_raw());
                        }
                    }
                }
            }
        }

        let hash = xxhash_rust::xxh3::xxh3_64(&buf);
        put_u64(&mut buf, hash);
        buf
    }

    /// Decode and fully validate a manifest image.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(corrupt("truncated manifest"));
        }
        let (body, trailer) = data.split_at(data.len() - 8);
        let stored = u64::from_le_bytes(trailer.try_into().expect("8 bytes"));
        let computed = xxhash_rust::xxh3::xxh3_64(body);
        if stored != computed {
            return Err(corrupt(&format!(
                "checksum mismatch: stored {stored:#018x}, computed {computed:#018x}"
            )));
        }

        let mut r = Reader::new(body);
        if r.bytes(4)? != MANIFEST_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let format = r.u32()?;
        if format != MANIFEST_FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported format version {format}")));
        }
        let page_size = PageSize::new(r.u32()?)
            .ok_or_else(|| corrupt("invalid page size"))?;
        let capacity = SegmentCapacity::new(r.u32()?)
            .ok_or_else(|| corrupt("invalid segment capacity"))?;
        let min_version =
            VersionId::new(r.u32()?).ok_or_else(|| corrupt("retained floor is zero"))?;
        let active_version =
            VersionId::new(r.u32()?).ok_or_else(|| corrupt("active version is zero"))?;
        if min_version > active_version {
            return Err(corrupt("retained floor above active version"));
        }

        let segment_count = r.u32()? as usize;
        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            let id = SegmentId::new(r.u32()?);
            let next_slot = r.u32()?;
            if next_slot > capacity.get() {
                return Err(corrupt(&format!(
                    "segment {id} frontier {next_slot} exceeds capacity"
                )));
            }
            let free_count = r.u32()? as usize;
            let mut free_slots = Vec::with_capacity(free_count);
            for _ in 0..free_count {
                let slot = r.u32()?;
                if slot >= next_slot {
                    return Err(corrupt(&format!(
                        "segment {id} free slot {slot} beyond frontier"
                    )));
                }
                free_slots.push(slot);
            }
            segments.push(SegmentAllocation {
                id,
                next_slot,
                free_slots,
            });
        }

        let catalog_next_id = r.u32()?;
        let file_count = r.u32()? as usize;
        let mut files = BTreeMap::new();
        for _ in 0..file_count {
            let id = FileId::new(r.u32()?);
            if id.get() >= catalog_next_id {
                return Err(corrupt(&format!("file id {id} beyond catalog frontier")));
            }
            let created_at =
                VersionId::new(r.u32()?).ok_or_else(|| corrupt("file created at version 0"))?;
            let deleted_at = VersionId::new(r.u32()?);
            let name_len = r.u16()? as usize;
            let name = std::str::from_utf8(r.bytes(name_len)?)
                .map_err(|_| corrupt("file name is not UTF-8"))?
                .to_owned();
            files.insert(
                id,
                FileRecord {
                    name,
                    created_at,
                    deleted_at,
                },
            );
        }

        let version_count = r.u32()? as usize;
        let expected_count = (active_version.get() - min_version.get() + 1) as usize;
        if version_count != expected_count {
            return Err(corrupt(&format!(
                "expected {expected_count} version records for range {min_version}..={active_version}, found {version_count}"
            )));
        }
        let mut versions = BTreeMap::new();
        for _ in 0..version_count {
            let v = VersionId::new(r.u32()?).ok_or_else(|| corrupt("version id 0"))?;
            if v < min_version || v > active_version {
                return Err(corrupt(&format!("version {v} outside retained range")));
            }
            let state = match r.u8()? {
                STATE_SEALED => VersionState::Sealed,
                STATE_ACTIVE => VersionState::Active,
                other => return Err(corrupt(&format!("unknown version state {other}"))),
            };
            let expected = if v == active_version {
                VersionState::Active
            } else {
                VersionState::Sealed
            };
            if state != expected {
                return Err(corrupt(&format!(
                    "version {v} has state {state:?}, expected {expected:?}"
                )));
            }
            let table_count = r.u32()? as usize;
            let mut tables = BTreeMap::new();
            for _ in 0..table_count {
                let file = FileId::new(r.u32()?);
                if !files.contains_key(&file) {
                    return Err(corrupt(&format!(
                        "version {v} references unknown file {file}"
                    )));
                }
                let entry_count = r.u32()? as usize;
                let mut table = PageTable::default();
                for _ in 0..entry_count {
                    let page = LogicalPageId::new(r.u32()?);
                    let mapping = match r.u8()? {
                        0 => Mapping::Tombstone,
                        1 => Mapping::Page(PhysicalPageId::from_raw(r.u64()?)),
                        other => return Err(corrupt(&format!("unknown mapping kind {other}"))),
                    };
                    table.entries.insert(page, mapping);
                }
                tables.insert(file, table);
            }
            versions.insert(v, VersionRecord { state, tables });
        }
        if versions.len() != expected_count {
            return Err(corrupt("duplicate version records"));
        }
        if !r.is_empty() {
            return Err(corrupt("trailing bytes after version table"));
        }

        Ok(Self {
            page_size,
            capacity,
            min_version,
            active_version,
            segments,
            catalog_next_id,
            files,
            versions,
        })
    }

    /// Load and validate the manifest under `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::StoreNotFound {
                    path: root.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = Self::decode(&data)?;
        debug!(
            root = %root.display(),
            active = manifest.active_version.get(),
            floor = manifest.min_version.get(),
            "manifest loaded"
        );
        Ok(manifest)
    }

    /// Durably replace the manifest under `root`.
    ///
    /// Write-temp + fsync + rename + fsync(dir): readers observe either the
    /// previous manifest or this one in full.
    pub fn persist(&self, root: &Path) -> Result<()> {
        let tmp_path = root.join(MANIFEST_TMP_FILE);
        let final_path = root.join(MANIFEST_FILE);

        let data = self.encode();
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_data()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &final_path)?;
        File::open(root)?.sync_all()?;

        info!(
            root = %root.display(),
            active = self.active_version.get(),
            bytes = data.len(),
            "manifest persisted"
        );
        Ok(())
    }
}

fn corrupt(detail: &str) -> StrataError {
    StrataError::CorruptManifest {
        detail: detail.to_owned(),
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Bounds-checked little-endian reader over the manifest body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| corrupt("length overflow"))?;
        if end > self.data.len() {
            return Err(corrupt("unexpected end of manifest"));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().expect("8 bytes")))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}
