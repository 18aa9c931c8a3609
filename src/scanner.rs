//! Directory scanning.
//!
//! Walks one directory tree and produces the candidate [`FileRecord`] set.
//! The walk is depth-first with entries sorted by name so output order is
//! deterministic. Per-entry faults are counted and skipped; only a failure
//! to open the root aborts the scan.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::models::FileRecord;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot open scan root {0}")]
    DirectoryUnavailable(PathBuf),

    #[error("invalid path pattern: {0}")]
    Pattern(#[from] globset::Error),
}

/// Scan behavior knobs, normally derived from `[watch]` config.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recursive: bool,
    /// Allowed extensions, lowercased, without the dot.
    pub extensions: Vec<String>,
    pub max_file_size: u64,
    pub follow_symlinks: bool,
    /// Non-empty include list is exclusive; exclude always wins.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            extensions: vec!["txt".to_string(), "md".to_string()],
            max_file_size: 10 * 1024 * 1024,
            follow_symlinks: false,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl From<&WatchConfig> for ScanOptions {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            recursive: cfg.recursive,
            extensions: cfg
                .supported_formats
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_file_size: cfg.max_file_size,
            follow_symlinks: false,
            include: cfg.include.clone(),
            exclude: cfg.exclude.clone(),
        }
    }
}

/// Progress event emitted while scanning, when the caller supplies a
/// channel. Scanning behaves identically without one.
#[derive(Debug, Clone, Copy)]
pub struct ScanProgress {
    pub seen: u64,
    pub accepted: u64,
}

/// What a completed scan found.
#[derive(Debug)]
pub struct ScanOutcome {
    /// Accepted candidates, in walk order.
    pub files: Vec<FileRecord>,
    /// Files over the size bound; the pipeline records these as skipped
    /// without parsing them.
    pub oversize: Vec<FileRecord>,
    pub entries_seen: u64,
    pub entries_unreadable: u64,
}

/// Walk `dir` and collect candidate files.
pub fn scan(
    dir: &Path,
    options: &ScanOptions,
    progress: Option<&mpsc::UnboundedSender<ScanProgress>>,
) -> Result<ScanOutcome, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::DirectoryUnavailable(dir.to_path_buf()));
    }

    let include = build_globset(&options.include)?;
    let exclude = build_globset(&options.exclude)?;

    let mut outcome = ScanOutcome {
        files: Vec::new(),
        oversize: Vec::new(),
        entries_seen: 0,
        entries_unreadable: 0,
    };

    let mut walker = WalkDir::new(dir)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name();
    if !options.recursive {
        walker = walker.max_depth(1);
    }

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // Root failure aborts; anything deeper is a per-entry skip.
                if e.depth() == 0 {
                    return Err(ScanError::DirectoryUnavailable(dir.to_path_buf()));
                }
                warn!(error = %e, "unreadable entry skipped");
                outcome.entries_unreadable += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        outcome.entries_seen += 1;

        let path = entry.path();
        if !accepted_by_patterns(dir, path, include.as_ref(), exclude.as_ref()) {
            debug!(file = %path.display(), "filtered by path pattern");
            continue;
        }

        let Some(extension) = matching_extension(path, &options.extensions) else {
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "stat failed, skipping");
                outcome.entries_unreadable += 1;
                continue;
            }
        };

        let modified_at: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        let record = FileRecord {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified_at,
            extension,
            content_hash: None,
        };

        if record.size > options.max_file_size {
            outcome.oversize.push(record);
        } else {
            outcome.files.push(record);
        }

        if let Some(tx) = progress {
            let _ = tx.send(ScanProgress {
                seen: outcome.entries_seen,
                accepted: outcome.files.len() as u64,
            });
        }
    }

    Ok(outcome)
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

fn accepted_by_patterns(
    root: &Path,
    path: &Path,
    include: Option<&GlobSet>,
    exclude: Option<&GlobSet>,
) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    if let Some(exclude) = exclude {
        if exclude.is_match(relative) {
            return false;
        }
    }
    if let Some(include) = include {
        return include.is_match(relative);
    }
    true
}

/// Case-insensitive extension check; returns the normalized extension.
fn matching_extension(path: &Path, allowed: &[String]) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    allowed.contains(&ext).then_some(ext)
}
