use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub mod deobfuscate;


use deobfuscate::{DeobfuscateError, Deobfuscator, Dialect, PipelineResult, Result};

/// Directories never worth scanning for sources
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    ".git",
    ".hg",
    ".svn",
    ".vscode",
    ".idea",
    ".next",
    "coverage",
];

/// Skip files above this size when scanning
const MAX_SCAN_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: PathBuf,
    pub relative_path: String,
    pub dialect: Dialect,
    pub size: u64,
    pub line_count: Option<usize>,
}

/// One transformed file
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub path: PathBuf,
    pub dialect: Dialect,
    pub lines_before: usize,
    pub lines_after: usize,
    pub result: PipelineResult,
}

fn count_lines(path: &Path) -> Option<usize> {
    let file = File::open(path).ok()?;
    let mut reader = io::BufReader::new(file);
    let mut buffer = [0; 32 * 1024];
    let mut count = 0;

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                count += buffer[..n].iter().filter(|&&b| b == b'\n').count();
            }
            Err(_) => return None,
        }
    }
    Some(count + 1)
}

fn dialect_of(path: &Path) -> Option<Dialect> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(Dialect::from_extension)
}

/// List JavaScript-family files under `dir`, sorted by relative path
pub fn scan_project(dir: &Path) -> Result<Vec<FileEntry>> {
    if !dir.exists() {
        return Err(DeobfuscateError::Io {
            path: dir.display().to_string(),
            reason: "path does not exist".to_string(),
        });
    }

    let walker = WalkBuilder::new(dir)
        .standard_filters(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !IGNORED_DIRS.contains(&name.as_ref())
        })
        .build();

    let mut entries = Vec::new();
    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "error walking path");
                continue;
            }
        };
        let p = entry.path();
        if p.is_dir() {
            continue;
        }
        let Some(dialect) = dialect_of(p) else {
            continue;
        };
        let Ok(relative) = p.strip_prefix(dir) else {
            continue;
        };
        let size = p.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_SCAN_FILE_SIZE {
            warn!(path = %p.display(), size, "skipping oversized file");
            continue;
        }
        entries.push(FileEntry {
            path: p.to_path_buf(),
            relative_path: relative.to_string_lossy().to_string(),
            dialect,
            size,
            line_count: count_lines(p),
        });
    }

    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(entries)
}

/// Read and transform one file; the dialect follows its extension
pub fn deobfuscate_file(path: &Path, deobfuscator: &Deobfuscator) -> Result<FileReport> {
    let content = std::fs::read_to_string(path).map_err(|e| DeobfuscateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let dialect = dialect_of(path).unwrap_or(deobfuscator.options().dialect);
    let options = deobfuscator.options().clone().with_dialect(dialect);
    let file_deobfuscator = deobfuscator.clone().with_options(options);

    let result = file_deobfuscator.transform(&content);
    info!(
        path = %path.display(),
        renames = result.renames.len(),
        findings = result.findings.len(),
        ok = result.is_success(),
        "file processed"
    );

    Ok(FileReport {
        path: path.to_path_buf(),
        dialect,
        lines_before: content.lines().count(),
        lines_after: result.code.lines().count(),
        result,
    })
}

/// Batch transform; each file runs its own independent pipeline
pub fn deobfuscate_files(paths: &[PathBuf], deobfuscator: &Deobfuscator) -> Vec<Result<FileReport>> {
    paths
        .par_iter()
        .map(|path| deobfuscate_file(path, deobfuscator))
        .collect()
}
