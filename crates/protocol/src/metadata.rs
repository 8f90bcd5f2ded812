//! Folder metadata: describing a directory tree on the sender and rebuilding
//! it on the receiver.
//!
//! # Wire Format
//!
//! The metadata travels as a plain frame named `metadata.json` whose payload
//! is a JSON array:
//!
//! ```text
//! [
//!   {"path": "notes.txt", "size": 120},
//!   {"path": "photos/", "size": 0},
//!   {"path": "photos/cat.jpg", "size": 48213},
//!   {"base_folder_name": "holiday", "path": ".delete", "size": 0}
//! ]
//! ```
//!
//! Directories end in `/` and have size 0. The last record carries the name
//! of the folder being sent; its `path` is a sentinel that receivers skip.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::crypto::CRYPT_SUFFIX;
use crate::error::{ProtocolError, Result};
use crate::framing::normalize_name;

/// Path value of the terminal root record.
pub const ROOT_SENTINEL_PATH: &str = ".delete";

/// One file or directory in a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Forward-slash relative path; directories end with `/`.
    pub relative_path: String,
    /// Size in bytes, 0 for directories.
    pub size: u64,
}

impl FileEntry {
    pub fn file(relative_path: impl Into<String>, size: u64) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
        }
    }

    pub fn directory(relative_path: impl Into<String>) -> Self {
        let mut relative_path = relative_path.into();
        if !relative_path.ends_with('/') {
            relative_path.push('/');
        }
        Self {
            relative_path,
            size: 0,
        }
    }

    /// Directory markers end with `/`.
    pub fn is_directory(&self) -> bool {
        self.relative_path.ends_with('/')
    }

    /// Last path segment, without the trailing slash for directories.
    pub fn base_name(&self) -> &str {
        let trimmed = self.relative_path.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

/// Terminal record naming the folder being transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDescriptor {
    pub base_folder_name: String,
}

/// Ordered description of a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub entries: Vec<FileEntry>,
    pub root: Option<RootDescriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base_folder_name: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    size: u64,
}

impl Metadata {
    /// Files only, in transfer order.
    pub fn file_entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| !e.is_directory())
    }

    /// Directory markers only.
    pub fn directory_entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| e.is_directory())
    }

    /// Sum of all file sizes.
    pub fn total_size(&self) -> u64 {
        self.file_entries().map(|e| e.size).sum()
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut records: Vec<WireRecord> = self
            .entries
            .iter()
            .map(|e| WireRecord {
                base_folder_name: None,
                path: e.relative_path.clone(),
                size: e.size,
            })
            .collect();

        if let Some(root) = &self.root {
            records.push(WireRecord {
                base_folder_name: Some(root.base_folder_name.clone()),
                path: ROOT_SENTINEL_PATH.to_string(),
                size: 0,
            });
        }

        serde_json::to_vec(&records).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse the JSON wire format.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let records: Vec<WireRecord> = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Metadata(format!("malformed metadata: {}", e)))?;

        let mut metadata = Metadata::default();
        for record in records {
            if let Some(name) = record.base_folder_name.filter(|n| !n.is_empty()) {
                metadata.root = Some(RootDescriptor {
                    base_folder_name: name,
                });
                continue;
            }
            if record.path.is_empty() || record.path == ROOT_SENTINEL_PATH {
                continue;
            }
            metadata.entries.push(FileEntry {
                relative_path: normalize_name(&record.path),
                size: record.size,
            });
        }

        Ok(metadata)
    }

    /// Name of the folder to create on the receiver.
    ///
    /// Taken from the root descriptor, or else from the first segment of the
    /// first directory entry.
    pub fn root_folder_name(&self) -> Option<&str> {
        if let Some(root) = &self.root {
            return Some(root.base_folder_name.as_str());
        }
        self.directory_entries()
            .next()
            .and_then(|e| e.relative_path.split('/').next())
            .filter(|s| !s.is_empty())
    }

    /// The same metadata with its root folder made explicit.
    ///
    /// Without a root descriptor the root is inferred from the first
    /// directory entry. Entries under it become relative to it and its own
    /// directory marker is dropped; other entries are left unchanged.
    pub fn into_rooted(self) -> Metadata {
        if self.root.is_some() {
            return self;
        }
        let Some(name) = self.root_folder_name().map(str::to_string) else {
            return self;
        };

        let prefix = format!("{}/", name);
        let entries = self
            .entries
            .into_iter()
            .filter(|e| e.relative_path != prefix)
            .map(|mut e| {
                if let Some(rest) = e.relative_path.strip_prefix(&prefix) {
                    e.relative_path = rest.to_string();
                }
                e
            })
            .collect();

        Metadata {
            entries,
            root: Some(RootDescriptor {
                base_folder_name: name,
            }),
        }
    }
}

/// Per-platform rule for cleaning folder names received from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathRule {
    /// Names are used as sent.
    #[default]
    Plain,
    /// Android peers may send storage document ids such as
    /// `primary%3ADocuments%2FTrip`; only the last segment is kept.
    AndroidDocumentUri,
}

impl PathRule {
    /// Reduce a received folder name to a single safe path segment.
    pub fn clean_folder_name(self, name: &str) -> String {
        let name = match self {
            PathRule::Plain => name.to_string(),
            PathRule::AndroidDocumentUri => name
                .replace("primary%3A", "")
                .replace("%3A", ":")
                .replace("%2F", "/"),
        };
        let name = normalize_name(&name);
        name.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Walk `root` and describe it.
///
/// Entries are relative to `root`; the root descriptor carries its base name.
pub fn build_metadata(root: &Path) -> Result<Metadata> {
    let base_folder_name = base_name(root)?;
    let entries = walk_entries(root, "")?;

    Ok(Metadata {
        entries,
        root: Some(RootDescriptor { base_folder_name }),
    })
}

/// Describe every path of a transfer request.
///
/// A request made of a single directory is described exactly like
/// [`build_metadata`]. Otherwise entries are relative to the receiver's save
/// directory: loose files by name, directories under their own name, and no
/// root descriptor is emitted.
pub fn build_request_metadata(paths: &[PathBuf]) -> Result<Metadata> {
    if let [single] = paths {
        if single.is_dir() {
            return build_metadata(single);
        }
    }

    let mut metadata = Metadata::default();
    for path in paths {
        let name = base_name(path)?;
        if path.is_dir() {
            metadata.entries.push(FileEntry::directory(name.clone()));
            metadata
                .entries
                .extend(walk_entries(path, &format!("{}/", name))?);
        } else {
            let size = fs::metadata(path)
                .map_err(|e| ProtocolError::filesystem(path, e))?
                .len();
            metadata.entries.push(FileEntry::file(name, size));
        }
    }
    Ok(metadata)
}

fn walk_entries(root: &Path, prefix: &str) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ProtocolError::Filesystem(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ProtocolError::Filesystem(e.to_string()))?;
        let relative = to_wire_path(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push(FileEntry::directory(format!("{}{}", prefix, relative)));
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .map_err(|e| ProtocolError::Filesystem(e.to_string()))?
                .len();
            entries.push(FileEntry::file(format!("{}{}", prefix, relative), size));
        } else {
            debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }

    Ok(entries)
}

fn to_wire_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Last component of `path`, resolving `.` and `..` first.
fn base_name(path: &Path) -> Result<String> {
    if let Some(name) = path.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    let resolved = path
        .canonicalize()
        .map_err(|e| ProtocolError::filesystem(path, e))?;
    resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ProtocolError::Filesystem(format!("{} has no base name", path.display())))
}

/// Turn a forward-slash relative path into a path under `root`.
///
/// Rejects absolute paths and anything that would climb out of `root`.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = normalize_name(relative);
    let mut output = root.to_path_buf();

    for segment in relative.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        let candidate = Path::new(segment);
        match candidate.components().next() {
            Some(Component::Normal(_)) if candidate.components().count() == 1 => {
                output.push(segment)
            }
            _ => {
                return Err(ProtocolError::Metadata(format!(
                    "path {:?} escapes the destination folder",
                    relative
                )))
            }
        }
    }

    if output == root {
        return Err(ProtocolError::Metadata(format!(
            "path {:?} does not name a file",
            relative
        )));
    }
    Ok(output)
}

/// Create the destination folder for a folder transfer and every directory
/// the metadata names. Returns the created root.
///
/// If `base_save_dir/<name>` exists, `<name> (1)`, `<name> (2)`, … is used.
pub fn reconstruct_destination(
    metadata: &Metadata,
    base_save_dir: &Path,
    rule: PathRule,
) -> Result<PathBuf> {
    let metadata = metadata.clone().into_rooted();
    let raw_name = metadata.root_folder_name().ok_or_else(|| {
        ProtocolError::Metadata("no root folder descriptor or directory entry".to_string())
    })?;

    let folder_name = rule.clean_folder_name(raw_name);
    if folder_name.is_empty() || folder_name == "." || folder_name == ".." {
        return Err(ProtocolError::Metadata(format!(
            "unusable root folder name {:?}",
            raw_name
        )));
    }

    let destination = unique_dir(&base_save_dir.join(&folder_name));
    fs::create_dir_all(&destination).map_err(|e| ProtocolError::filesystem(&destination, e))?;
    debug!("Created destination folder {}", destination.display());

    for entry in &metadata.entries {
        let relative = entry.relative_path.as_str();
        let dir = if entry.is_directory() {
            relative.trim_end_matches('/')
        } else {
            match relative.rsplit_once('/') {
                Some((parent, _)) => parent,
                None => continue,
            }
        };
        if dir.is_empty() {
            continue;
        }
        let path = safe_join(&destination, dir)?;
        fs::create_dir_all(&path).map_err(|e| ProtocolError::filesystem(&path, e))?;
    }

    Ok(destination)
}

/// Map an incoming frame name to the path it is written to.
///
/// The name is looked up in the metadata: first as an exact relative path,
/// then by base name, preferring an entry whose size matches `size_hint`.
/// Entry paths are taken relative to `destination_root` as they are.
/// A `.crypt` suffix is ignored for the lookup and kept on the result. An
/// existing file at the target is never overwritten; a numbered name is
/// chosen instead.
pub fn resolve_entry_path(
    destination_root: &Path,
    metadata: &Metadata,
    relative_name: &str,
    size_hint: Option<u64>,
) -> Result<PathBuf> {
    let name = normalize_name(relative_name);
    let name = name.trim_start_matches("./");
    let (lookup, suffix) = match name.strip_suffix(CRYPT_SUFFIX) {
        Some(stripped) => (stripped, CRYPT_SUFFIX),
        None => (name, ""),
    };

    let relative = match find_entry(metadata, lookup, size_hint) {
        Some(entry) => format!("{}{}", entry.relative_path, suffix),
        None => name.to_string(),
    };

    let target = safe_join(destination_root, &relative)?;
    Ok(unique_path(&target))
}

fn find_entry<'a>(
    metadata: &'a Metadata,
    lookup: &str,
    size_hint: Option<u64>,
) -> Option<&'a FileEntry> {
    if let Some(entry) = metadata.file_entries().find(|e| e.relative_path == lookup) {
        return Some(entry);
    }

    let base = lookup.rsplit('/').next().unwrap_or(lookup);
    let mut candidates = metadata.file_entries().filter(|e| e.base_name() == base);
    match size_hint {
        Some(size) => {
            let candidates: Vec<&FileEntry> = candidates.collect();
            candidates
                .iter()
                .find(|e| e.size == size)
                .or_else(|| candidates.first())
                .copied()
        }
        None => candidates.next(),
    }
}

/// First free variant of `path`: `name.ext`, `name (1).ext`, `name (2).ext`, …
///
/// A trailing `.crypt` is kept outside the counter so the decrypted name
/// stays `name (n).ext`.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (inner, crypt) = match file_name.strip_suffix(CRYPT_SUFFIX) {
        Some(inner) if !inner.is_empty() => (inner.to_string(), CRYPT_SUFFIX),
        _ => (file_name.clone(), ""),
    };
    let (stem, extension) = split_extension(&inner);

    (1u32..)
        .map(|i| path.with_file_name(format!("{} ({}){}{}", stem, i, extension, crypt)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// First free variant of a directory path: `name`, `name (1)`, `name (2)`, …
pub fn unique_dir(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    (1u32..)
        .map(|i| path.with_file_name(format!("{} ({})", name, i)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Splits `archive.tar.gz` into (`archive.tar`, `.gz`). Dotfiles have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => (&name[..idx], &name[idx..]),
    }
}
