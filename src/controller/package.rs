//! Job package builder.
//!
//! A job package is the gzip tarball pushed to a worker along with the job
//! config. It carries the VM disk image named by the config's `disk_image`
//! key, stored under its file name, and every file below `input_dir`, stored
//! under `testcases/`.

use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder as TarBuilder;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Archive directory holding the testcases.
pub const TESTCASE_DIR: &str = "testcases";

/// Errors that can occur while building a job package.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The job config lacks a required key.
    #[error("Job config is missing '{0}'")]
    MissingKey(&'static str),

    /// The disk image is not a regular file.
    #[error("VM image not found: {0}")]
    ImageNotFound(PathBuf),

    /// The input directory does not exist.
    #[error("Input directory not found: {0}")]
    InputDirNotFound(PathBuf),

    /// Walking the input directory failed.
    #[error("Failed to walk input directory: {0}")]
    Walk(#[from] walkdir::Error),

    /// IO error while reading files or writing the archive.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An in-memory `.tar.gz` ready to push.
#[derive(Debug, Clone)]
pub struct JobPackage {
    bytes: Vec<u8>,
    file_count: usize,
}

impl JobPackage {
    /// Builds the package described by a job config.
    ///
    /// This does blocking file IO; async callers should run it on
    /// `spawn_blocking`.
    pub fn build(config: &serde_json::Value) -> Result<Self, PackageError> {
        let disk_image = expand_home(config_path(config, "disk_image")?);
        let input_dir = expand_home(config_path(config, "input_dir")?);

        if !disk_image.is_file() {
            return Err(PackageError::ImageNotFound(disk_image));
        }
        if !input_dir.is_dir() {
            return Err(PackageError::InputDirNotFound(input_dir));
        }

        let enc = GzEncoder::new(Vec::new(), Compression::default());
        let mut tar = TarBuilder::new(enc);

        let image_name = disk_image
            .file_name()
            .ok_or_else(|| PackageError::ImageNotFound(disk_image.clone()))?;
        tar.append_path_with_name(&disk_image, image_name)?;
        let mut file_count = 1;

        for entry in WalkDir::new(&input_dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&input_dir)
                .unwrap_or(entry.path());
            tar.append_path_with_name(entry.path(), Path::new(TESTCASE_DIR).join(relative))?;
            file_count += 1;
        }

        let bytes = tar.into_inner()?.finish()?;
        debug!(
            disk_image = %disk_image.display(),
            files = file_count,
            bytes = bytes.len(),
            "Built job package"
        );

        Ok(Self { bytes, file_count })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of files in the archive, disk image included.
    pub fn file_count(&self) -> usize {
        self.file_count
    }
}

fn config_path<'a>(config: &'a serde_json::Value, key: &'static str) -> Result<&'a str, PackageError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(PackageError::MissingKey(key))
}

/// Expands a leading `~/` against `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}
