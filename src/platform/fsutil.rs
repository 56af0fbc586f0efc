//! Small filesystem utilities.

use globset::{Glob, GlobSet, GlobSetBuilder};

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use crate::{ArtifactRecord, ProfError, ProfResult};

/// Coarse filesystem timestamps can lag the wall clock slightly.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// Every regular file under `dir`, with size and content digest, sorted by name.
pub fn dir_artifacts(dir: &Path) -> ProfResult<Vec<ArtifactRecord>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let mut hasher = blake3::Hasher::new();
        let mut file = File::open(entry.path())?;
        let bytes = std::io::copy(&mut file, &mut hasher)?;
        out.push(ArtifactRecord {
            name: rel.to_string_lossy().replace('\\', "/"),
            bytes,
            blake3: hasher.finalize().to_hex().to_string(),
        });
    }
    Ok(out)
}

/// Names of files directly inside `dir` matching any of `patterns`.
///
/// With `since`, files last modified before that instant are ignored so that
/// leftovers from an earlier run never count as fresh output.
pub fn match_artifacts(
    dir: &Path,
    patterns: &[String],
    since: Option<SystemTime>,
) -> ProfResult<Vec<String>> {
    let mut out = BTreeSet::new();
    let fresh = |path: &Path| match since {
        None => true,
        Some(since) => std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|modified| modified + MTIME_SLACK >= since)
            .unwrap_or(false),
    };

    let (globs, literals): (Vec<String>, Vec<String>) =
        patterns.iter().cloned().partition(|p| has_glob_meta(p));
    for name in literals {
        let path = dir.join(&name);
        if path.is_file() && fresh(&path) {
            out.insert(name);
        }
    }

    if !globs.is_empty() && dir.is_dir() {
        let set = compile_globset(&globs)?;
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if set.is_match(&name) && fresh(entry.path()) {
                out.insert(name);
            }
        }
    }
    Ok(out.into_iter().collect())
}

fn compile_globset(patterns: &[String]) -> ProfResult<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let g = Glob::new(p)
            .map_err(|e| ProfError::InvalidArgument(format!("invalid glob {p:?}: {e}")))?;
        b.add(g);
    }
    b.build()
        .map_err(|e| ProfError::InvalidArgument(format!("invalid globset: {e}")))
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains('*')
        || pattern.contains('?')
        || pattern.contains('[')
        || pattern.contains(']')
        || pattern.contains('{')
        || pattern.contains('}')
}
