//! `strata` - control and inspection tool for strata stores.
//!
//! The one privileged operation is `commit`: it seals the store's active
//! version from outside any read/write handle, holding the same durable
//! file lock the embedded engine uses. The remaining commands are read-only
//! inspection over the manifest.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use strata_error::{Result, StrataError};
use strata_store::{Manifest, Mapping, Store, VacuumPolicy, VacuumScope};
use strata_types::{FileId, LogicalPageId, VersionId};

const USAGE: &str = "\
usage: strata <store> <command> [options]

commands:
  commit                      seal the active version and open the next one
  state [--json]              print the manifest summary
  files [--ver N]             list files visible at a version
  pages <file> [--ver N]      dump a file's resolved page table
  get <file> <page> [--ver N] resolve one logical page
  diff <file> <from> <to>     compare a file's mapping between two versions
  vacuum [--full | --purge]   run a reclamation pass

options:
  --ver N    version to inspect (default: the active version)
  --json     machine-readable output
  -h, --help print this help
";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Commit,
    State { json: bool },
    Files { ver: Option<u32> },
    Pages { file: String, ver: Option<u32>, json: bool },
    Get { file: String, page: u32, ver: Option<u32> },
    Diff { file: String, from: u32, to: u32 },
    Vacuum { full: bool, purge: bool },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliOptions {
    store: PathBuf,
    command: Command,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let code = run(std::env::args_os(), &mut stdout, &mut stderr);
    if code != 0 {
        std::process::exit(code);
    }
}

fn run<I, W, E>(args: I, out: &mut W, err: &mut E) -> i32
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let options = match parse_args(args) {
        Ok(options) => options,
        Err(message) => {
            let _ = writeln!(err, "error: {message}");
            let _ = err.write_all(USAGE.as_bytes());
            return 2;
        }
    };

    if options.command == Command::Help {
        let _ = out.write_all(USAGE.as_bytes());
        return 0;
    }

    match dispatch(&options, out) {
        Ok(()) => 0,
        Err(e) => {
            let _ = writeln!(err, "error: {e}");
            1
        }
    }
}

fn parse_args<I: IntoIterator<Item = OsString>>(args: I) -> std::result::Result<CliOptions, String> {
    let mut args = args
        .into_iter()
        .skip(1)
        .map(|a| a.into_string().map_err(|_| "arguments must be UTF-8".to_owned()))
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter();

    let store = match args.next() {
        None => {
            return Ok(CliOptions {
                store: PathBuf::new(),
                command: Command::Help,
            });
        }
        Some(s) if s == "-h" || s == "--help" => {
            return Ok(CliOptions {
                store: PathBuf::new(),
                command: Command::Help,
            });
        }
        Some(s) => PathBuf::from(s),
    };

    let command = args.next().ok_or("missing command")?;
    let rest: Vec<String> = args.collect();

    let parse_ver = |rest: &[String]| -> std::result::Result<Option<u32>, String> {
        let mut ver = None;
        let mut iter = rest.iter();
        while let Some(flag) = iter.next() {
            match flag.as_str() {
                "--ver" => {
                    let value = iter.next().ok_or("--ver requires a value")?;
                    ver = Some(value.parse().map_err(|_| format!("bad version '{value}'"))?);
                }
                "--json" => {}
                other => return Err(format!("unknown option '{other}'")),
            }
        }
        Ok(ver)
    };
    let has_flag = |rest: &[String], flag: &str| rest.iter().any(|a| a == flag);

    let command = match command.as_str() {
        "commit" => {
            if !rest.is_empty() {
                return Err("commit takes no options".to_owned());
            }
            Command::Commit
        }
        "state" => Command::State {
            json: has_flag(&rest, "--json"),
        },
        "files" => Command::Files {
            ver: parse_ver(&rest)?,
        },
        "pages" => {
            let (file, flags) = rest.split_first().ok_or("pages requires a file name")?;
            Command::Pages {
                file: file.clone(),
                ver: parse_ver(flags)?,
                json: has_flag(flags, "--json"),
            }
        }
        "get" => {
            let file = rest.first().ok_or("get requires a file name")?.clone();
            let page = rest
                .get(1)
                .ok_or("get requires a page number")?
                .parse()
                .map_err(|_| "bad page number".to_owned())?;
            Command::Get {
                file,
                page,
                ver: parse_ver(&rest[2..])?,
            }
        }
        "diff" => {
            if rest.len() != 3 {
                return Err("diff requires <file> <from> <to>".to_owned());
            }
            Command::Diff {
                file: rest[0].clone(),
                from: rest[1].parse().map_err(|_| "bad 'from' version".to_owned())?,
                to: rest[2].parse().map_err(|_| "bad 'to' version".to_owned())?,
            }
        }
        "vacuum" => {
            let full = has_flag(&rest, "--full");
            let purge = has_flag(&rest, "--purge");
            if full && purge {
                return Err("--full and --purge are mutually exclusive".to_owned());
            }
            Command::Vacuum { full, purge }
        }
        other => return Err(format!("unknown command '{other}'")),
    };

    Ok(CliOptions { store, command })
}

fn dispatch<W: Write>(options: &CliOptions, out: &mut W) -> Result<()> {
    let root = options.store.as_path();
    match &options.command {
        Command::Help => unreachable!("handled by run"),
        Command::Commit => cmd_commit(root, out),
        Command::State { json } => cmd_state(root, *json, out),
        Command::Files { ver } => cmd_files(root, *ver, out),
        Command::Pages { file, ver, json } => cmd_pages(root, file, *ver, *json, out),
        Command::Get { file, page, ver } => cmd_get(root, file, *page, *ver, out),
        Command::Diff { file, from, to } => cmd_diff(root, file, *from, *to, out),
        Command::Vacuum { full, purge } => cmd_vacuum(root, *full, *purge, out),
    }
}

fn version_arg(raw: Option<u32>, manifest: &Manifest) -> Result<VersionId> {
    match raw {
        None => Ok(manifest.active_version),
        Some(n) => VersionId::new(n).ok_or(StrataError::VersionUnknown { version: n }),
    }
}

fn cmd_commit<W: Write>(root: &Path, out: &mut W) -> Result<()> {
    let store = Store::open(root)?;
    writeln!(out, "active version before commit: {}", store.active_version())?;
    let active = store.commit()?;
    writeln!(out, "active version after commit: {active}")?;
    Ok(())
}

fn cmd_state<W: Write>(root: &Path, json: bool, out: &mut W) -> Result<()> {
    let manifest = Manifest::load(root)?;
    let pages_in_use: u64 = manifest
        .segments
        .iter()
        .map(|s| u64::from(s.next_slot) - s.free_slots.len() as u64)
        .sum();

    if json {
        let value = serde_json::json!({
            "page_size": manifest.page_size.get(),
            "segment_capacity": manifest.capacity.get(),
            "min_version": manifest.min_version.get(),
            "active_version": manifest.active_version.get(),
            "sealed_versions": manifest.active_version.get() - manifest.min_version.get(),
            "segments": manifest.segments.len(),
            "pages_in_use": pages_in_use,
            "files": manifest.files.len(),
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&value).expect("json encodes"))?;
        return Ok(());
    }

    writeln!(out, "Page size        : {}", manifest.page_size)?;
    writeln!(out, "Segment capacity : {}", manifest.capacity)?;
    writeln!(out, "Minimum version  : {}", manifest.min_version)?;
    writeln!(out, "Active version   : {}", manifest.active_version)?;
    writeln!(
        out,
        "Sealed versions  : {}",
        manifest.active_version.get() - manifest.min_version.get()
    )?;
    writeln!(out, "Segments         : {}", manifest.segments.len())?;
    writeln!(out, "Pages in use     : {pages_in_use}")?;
    writeln!(out, "Files            : {}", manifest.files.len())?;
    Ok(())
}

fn visible_at(manifest: &Manifest, name: &str, v: VersionId) -> Option<FileId> {
    manifest
        .files
        .iter()
        .find(|(_, r)| {
            r.name == name && r.created_at <= v && r.deleted_at.is_none_or(|d| v < d)
        })
        .map(|(&id, _)| id)
}

/// Resolve a file's full logical → physical mapping at a version, tagging
/// each page with the version whose delta supplied it.
fn resolved_mapping(
    manifest: &Manifest,
    file: FileId,
    v: VersionId,
) -> BTreeMap<LogicalPageId, Option<(strata_types::PhysicalPageId, VersionId)>> {
    let mut mapping = BTreeMap::new();
    for (&ver, record) in manifest.versions.range(..=v) {
        if let Some(table) = record.tables.get(&file) {
            for (&page, &entry) in &table.entries {
                match entry {
                    Mapping::Page(p) => mapping.insert(page, Some((p, ver))),
                    Mapping::Tombstone => mapping.insert(page, None),
                };
            }
        }
    }
    mapping
}

fn lookup_file(manifest: &Manifest, name: &str, v: VersionId) -> Result<FileId> {
    if v < manifest.min_version || v > manifest.active_version {
        return Err(StrataError::VersionUnknown { version: v.get() });
    }
    visible_at(manifest, name, v).ok_or_else(|| StrataError::FileNotFound {
        name: name.to_owned(),
    })
}

fn cmd_files<W: Write>(root: &Path, ver: Option<u32>, out: &mut W) -> Result<()> {
    let manifest = Manifest::load(root)?;
    let v = version_arg(ver, &manifest)?;
    for (id, record) in &manifest.files {
        if record.created_at <= v && record.deleted_at.is_none_or(|d| v < d) {
            writeln!(out, "{id}  {}  (created at version {})", record.name, record.created_at)?;
        }
    }
    Ok(())
}

fn cmd_pages<W: Write>(
    root: &Path,
    file: &str,
    ver: Option<u32>,
    json: bool,
    out: &mut W,
) -> Result<()> {
    let manifest = Manifest::load(root)?;
    let v = version_arg(ver, &manifest)?;
    let id = lookup_file(&manifest, file, v)?;
    let mapping = resolved_mapping(&manifest, id, v);

    if json {
        let entries: Vec<serde_json::Value> = mapping
            .iter()
            .filter_map(|(page, entry)| {
                entry.map(|(phys, from)| {
                    serde_json::json!({
                        "page": page.get(),
                        "segment": phys.segment().get(),
                        "slot": phys.slot(),
                        "version": from.get(),
                    })
                })
            })
            .collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&entries).expect("json encodes"))?;
        return Ok(());
    }

    for (page, entry) in &mapping {
        if let Some((phys, from)) = entry {
            writeln!(out, "{page}  ->  {phys}  (version {from})")?;
        }
    }
    Ok(())
}

fn cmd_get<W: Write>(
    root: &Path,
    file: &str,
    page: u32,
    ver: Option<u32>,
    out: &mut W,
) -> Result<()> {
    let manifest = Manifest::load(root)?;
    let v = version_arg(ver, &manifest)?;
    let id = lookup_file(&manifest, file, v)?;
    let mapping = resolved_mapping(&manifest, id, v);

    match mapping.get(&LogicalPageId::new(page)).copied().flatten() {
        Some((phys, from)) => writeln!(out, "{page}  ->  {phys}  (version {from})")?,
        None => writeln!(out, "page {page} not found at version {v}")?,
    }
    Ok(())
}

fn cmd_diff<W: Write>(root: &Path, file: &str, from: u32, to: u32, out: &mut W) -> Result<()> {
    if from >= to {
        return Err(StrataError::InvalidParameter {
            name: "from",
            detail: "'from' version must be below 'to' version".to_owned(),
        });
    }
    let manifest = Manifest::load(root)?;
    let from_v = VersionId::new(from).ok_or(StrataError::VersionUnknown { version: from })?;
    let to_v = VersionId::new(to).ok_or(StrataError::VersionUnknown { version: to })?;
    let id = lookup_file(&manifest, file, to_v)?;
    if from_v < manifest.min_version {
        return Err(StrataError::VersionUnknown { version: from });
    }

    let before = resolved_mapping(&manifest, id, from_v);
    let after = resolved_mapping(&manifest, id, to_v);

    let pages: std::collections::BTreeSet<LogicalPageId> =
        before.keys().chain(after.keys()).copied().collect();
    for page in pages {
        let b = before.get(&page).copied().flatten();
        let a = after.get(&page).copied().flatten();
        match (b, a) {
            (None, Some((phys, ver))) => writeln!(out, "A {page}  ->  {phys}  (version {ver})")?,
            (Some(_), None) => writeln!(out, "D {page}")?,
            (Some((bp, bv)), Some((ap, av))) if bp != ap => {
                writeln!(out, "M {page}  {bp} (version {bv})  ->  {ap} (version {av})")?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn cmd_vacuum<W: Write>(root: &Path, full: bool, purge: bool, out: &mut W) -> Result<()> {
    let store = Store::open(root)?;
    let (scope, policy) = if purge {
        (VacuumScope::Purge, VacuumPolicy::Incremental)
    } else if full {
        (VacuumScope::Active, VacuumPolicy::Full)
    } else {
        (VacuumScope::Active, VacuumPolicy::Incremental)
    };
    let stats = store.vacuum(scope, policy)?;
    writeln!(out, "pages freed      : {}", stats.pages_freed)?;
    writeln!(out, "pages moved      : {}", stats.pages_moved)?;
    writeln!(out, "versions dropped : {}", stats.versions_dropped)?;
    writeln!(out, "segments removed : {}", stats.segments_removed)?;
    Ok(())
}
