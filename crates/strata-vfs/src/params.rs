//! Connection-parameter parsing for the VFS boundary.
//!
//! The host engine passes parameters as URI query pairs on the database
//! path: `ver`, `mode`, `pagesz`, `pps`, plus the host's own `journal_mode`
//! and `auto_vacuum` knobs. The last two are recognized and retained but
//! only steer the host's write-ahead mechanics and the default reclamation
//! policy; they never change the versioning contract.

use strata_error::{Result, StrataError};
use strata_types::{AccessMode, PageSize, SegmentCapacity, VersionId};

/// Host journal mode, accepted as configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    #[default]
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

/// Host auto-vacuum mode; selects the default reclamation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoVacuumMode {
    #[default]
    None,
    Full,
    Incremental,
}

/// Parsed connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    /// Requested version. `None` means the current active version.
    pub version: Option<VersionId>,
    /// Read-write on the active version, or read-only pinned to `version`.
    pub mode: AccessMode,
    /// Physical page size; fixed at store creation, must match on reopen.
    pub page_size: PageSize,
    /// Pages per segment; fixed at store creation.
    pub segment_capacity: SegmentCapacity,
    pub journal_mode: JournalMode,
    pub auto_vacuum: AutoVacuumMode,
}

impl OpenParams {
    /// Parse from key/value pairs, e.g. decoded URI query parameters.
    ///
    /// `pagesz` is mandatory; `ver` defaults to "the active version" in
    /// read-write mode and to version 1 in read-only mode; `pps` defaults to
    /// 65536 pages per segment.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut version: Option<VersionId> = None;
        let mut mode = AccessMode::ReadWrite;
        let mut page_size: Option<PageSize> = None;
        let mut segment_capacity = SegmentCapacity::DEFAULT;
        let mut journal_mode = JournalMode::default();
        let mut auto_vacuum = AutoVacuumMode::default();

        for (key, value) in pairs {
            match key {
                "ver" => {
                    let raw: u32 = value.parse().map_err(|_| invalid("ver", value))?;
                    version = Some(VersionId::new(raw).ok_or_else(|| invalid("ver", value))?);
                }
                "mode" => {
                    mode = match value {
                        "" => AccessMode::ReadWrite,
                        "ro" => AccessMode::ReadOnly,
                        other => return Err(invalid("mode", other)),
                    };
                }
                "pagesz" => {
                    let raw: u32 = value.parse().map_err(|_| invalid("pagesz", value))?;
                    page_size = Some(PageSize::new(raw).ok_or_else(|| invalid("pagesz", value))?);
                }
                "pps" => {
                    let raw: u32 = value.parse().map_err(|_| invalid("pps", value))?;
                    segment_capacity =
                        SegmentCapacity::new(raw).ok_or_else(|| invalid("pps", value))?;
                }
                "journal_mode" => {
                    journal_mode = match value.to_ascii_lowercase().as_str() {
                        "delete" => JournalMode::Delete,
                        "truncate" => JournalMode::Truncate,
                        "persist" => JournalMode::Persist,
                        "memory" => JournalMode::Memory,
                        "wal" => JournalMode::Wal,
                        "off" => JournalMode::Off,
                        other => return Err(invalid("journal_mode", other)),
                    };
                }
                "auto_vacuum" => {
                    auto_vacuum = match value.to_ascii_lowercase().as_str() {
                        "none" | "0" => AutoVacuumMode::None,
                        "full" | "1" => AutoVacuumMode::Full,
                        "incremental" | "2" => AutoVacuumMode::Incremental,
                        other => return Err(invalid("auto_vacuum", other)),
                    };
                }
                // Unknown keys (e.g. the host's own `vfs=` selector) pass
                // through untouched.
                _ => {}
            }
        }

        let page_size = page_size.ok_or(StrataError::InvalidParameter {
            name: "pagesz",
            detail: "mandatory parameter missing".to_owned(),
        })?;

        Ok(Self {
            version,
            mode,
            page_size,
            segment_capacity,
            journal_mode,
            auto_vacuum,
        })
    }

    /// Parse from a raw query string, e.g. `"ver=2&mode=ro&pagesz=4096"`.
    pub fn from_query(query: &str) -> Result<Self> {
        Self::from_pairs(
            query
                .split('&')
                .filter(|s| !s.is_empty())
                .map(|pair| pair.split_once('=').unwrap_or((pair, ""))),
        )
    }

    /// The version a read-only handle pins when `ver` was omitted.
    #[must_use]
    pub fn pinned_version(&self) -> VersionId {
        self.version.unwrap_or(VersionId::FIRST)
    }
}

fn invalid(name: &'static str, value: &str) -> StrataError {
    StrataError::InvalidParameter {
        name,
        detail: format!("unrecognized value '{value}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_query_parses() {
        let params =
            OpenParams::from_query("ver=3&mode=ro&pagesz=4096&pps=1024&journal_mode=wal").unwrap();
        assert_eq!(params.version, VersionId::new(3));
        assert_eq!(params.mode, AccessMode::ReadOnly);
        assert_eq!(params.page_size.get(), 4096);
        assert_eq!(params.segment_capacity.get(), 1024);
        assert_eq!(params.journal_mode, JournalMode::Wal);
        assert_eq!(params.auto_vacuum, AutoVacuumMode::None);
    }

    #[test]
    fn pagesz_is_mandatory() {
        assert!(matches!(
            OpenParams::from_query("ver=1"),
            Err(StrataError::InvalidParameter { name: "pagesz", .. })
        ));
    }

    #[test]
    fn defaults_apply() {
        let params = OpenParams::from_query("pagesz=4096").unwrap();
        assert_eq!(params.version, None);
        assert_eq!(params.mode, AccessMode::ReadWrite);
        assert_eq!(params.segment_capacity, SegmentCapacity::DEFAULT);
        assert_eq!(params.pinned_version(), VersionId::FIRST);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(OpenParams::from_query("pagesz=0").is_err());
        assert!(OpenParams::from_query("pagesz=4096&ver=0").is_err());
        assert!(OpenParams::from_query("pagesz=4096&mode=rw").is_err());
        assert!(OpenParams::from_query("pagesz=4096&auto_vacuum=7").is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let params = OpenParams::from_query("vfs=strata&pagesz=4096&cache=shared").unwrap();
        assert_eq!(params.page_size.get(), 4096);
    }
}
