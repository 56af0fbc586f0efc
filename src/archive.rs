//! Packaging of the output directory once every step has run.

use serde::{Deserialize, Serialize};

use std::ffi::OsStr;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::{ProcessSpec, ProfError, ProfResult, Sink, ToolLocator, run};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    #[default]
    TarGz,
    Zip,
    #[serde(rename = "none")]
    Disabled,
}

impl clap::ValueEnum for ArchiveFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::TarGz, Self::Zip, Self::Disabled]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::TarGz => clap::builder::PossibleValue::new("tar-gz"),
            Self::Zip => clap::builder::PossibleValue::new("zip"),
            Self::Disabled => clap::builder::PossibleValue::new("none"),
        })
    }
}

impl ArchiveFormat {
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::TarGz => Some("tar.gz"),
            Self::Zip => Some("zip"),
            Self::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArchiveStatus {
    Created,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveOutcome {
    pub format: ArchiveFormat,
    pub path: Option<String>,
    pub status: ArchiveStatus,
}

/// `<parent>/<dirname>.<ext>` next to the output directory.
pub fn archive_path(outdir: &Path, format: ArchiveFormat) -> ProfResult<Option<PathBuf>> {
    let Some(ext) = format.extension() else {
        return Ok(None);
    };
    let (parent, name) = split_outdir(outdir)?;
    Ok(Some(parent.join(format!("{name}.{ext}"))))
}

/// Archives the output directory. Failures are reported, never raised.
pub fn archive_outdir(
    outdir: &Path,
    format: ArchiveFormat,
    locator: &ToolLocator,
    deadline: Duration,
) -> ArchiveOutcome {
    let dest = match archive_path(outdir, format) {
        Ok(Some(dest)) => dest,
        Ok(None) => {
            return ArchiveOutcome {
                format,
                path: None,
                status: ArchiveStatus::Skipped {
                    reason: "archiving disabled".to_string(),
                },
            };
        }
        Err(err) => {
            return ArchiveOutcome {
                format,
                path: None,
                status: ArchiveStatus::Failed {
                    reason: err.to_string(),
                },
            };
        }
    };
    let path = Some(dest.to_string_lossy().to_string());

    let result = match format {
        ArchiveFormat::TarGz => match locator.locate("tar") {
            Some(tar) => tar_gz(&tar, outdir, &dest, deadline),
            None => {
                return ArchiveOutcome {
                    format,
                    path: None,
                    status: ArchiveStatus::Skipped {
                        reason: "tar not found, skipping".to_string(),
                    },
                };
            }
        },
        ArchiveFormat::Zip => zip_dir(outdir, &dest),
        ArchiveFormat::Disabled => Ok(()),
    };

    match result {
        Ok(()) => {
            tracing::info!("archived {} to {}", outdir.display(), dest.display());
            ArchiveOutcome {
                format,
                path,
                status: ArchiveStatus::Created,
            }
        }
        Err(err) => {
            tracing::warn!("archiving {} failed: {err}", outdir.display());
            ArchiveOutcome {
                format,
                path,
                status: ArchiveStatus::Failed {
                    reason: err.to_string(),
                },
            }
        }
    }
}

fn split_outdir(outdir: &Path) -> ProfResult<(PathBuf, String)> {
    let abs = std::fs::canonicalize(outdir)?;
    let name = abs
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            ProfError::Archive(format!("cannot name an archive after {}", outdir.display()))
        })?
        .to_string();
    let parent = abs
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ProfError::Archive(format!("{} has no parent directory", abs.display())))?;
    Ok((parent, name))
}

fn tar_gz(tar: &Path, outdir: &Path, dest: &Path, deadline: Duration) -> ProfResult<()> {
    let (parent, name) = split_outdir(outdir)?;
    let spec = ProcessSpec::new(tar)
        .args([
            OsStr::new("-czf"),
            dest.as_os_str(),
            OsStr::new("-C"),
            parent.as_os_str(),
            OsStr::new(&name),
        ])
        .deadline(Some(deadline))
        .stdout(Sink::Null)
        .stderr(Sink::Null);
    tracing::debug!("{}", spec.display());
    let outcome = run(&spec)?;
    if !outcome.success() {
        let _ = std::fs::remove_file(dest);
        return Err(ProfError::Archive(format!(
            "tar exited with {:?}{}",
            outcome.exit_code,
            if outcome.timed_out { " (timed out)" } else { "" }
        )));
    }
    Ok(())
}

fn zip_dir(outdir: &Path, dest: &Path) -> ProfResult<()> {
    let (_, name) = split_outdir(outdir)?;
    let file = File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    zip.add_directory(format!("{name}/"), options)?;
    for entry in WalkDir::new(outdir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(outdir).unwrap_or(entry.path());
        let entry_name = format!("{name}/{}", rel.to_string_lossy().replace('\\', "/"));
        if entry.file_type().is_dir() {
            zip.add_directory(format!("{entry_name}/"), options)?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        zip.start_file(entry_name, options)?;
        let mut src = File::open(entry.path())?;
        std::io::copy(&mut src, &mut zip)?;
    }

    let mut file = zip.finish()?;
    file.flush()?;
    Ok(())
}
