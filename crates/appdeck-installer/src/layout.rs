use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

// The fixed on-disk layout owned by the installer:
//
//   <manifest-dir>/<app-id>/header.toml
//   <manifest-dir>/<app-id>/installation-report
//   <manifest-dir>/.staging/<task-id>/{package.tar,tree}
//   <image-mount-dir>/<app-id>/            (active loopback mount points)
//
// Application content itself lives under the installation locations, not
// here. Both base directories must sit on storage the manager user can
// write to.
#[derive(Debug, Clone)]
pub struct InstallerPaths {
    manifest_dir: PathBuf,
    image_mount_dir: PathBuf,
}

impl InstallerPaths {
    pub fn new(manifest_dir: impl Into<PathBuf>, image_mount_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            image_mount_dir: image_mount_dir.into(),
        }
    }

    pub fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    pub fn image_mount_dir(&self) -> &Path {
        &self.image_mount_dir
    }

    pub fn app_manifest_dir(&self, application_id: &str) -> PathBuf {
        self.manifest_dir.join(application_id)
    }

    pub fn header_path(&self, application_id: &str) -> PathBuf {
        self.app_manifest_dir(application_id).join("header.toml")
    }

    pub fn report_path(&self, application_id: &str) -> PathBuf {
        self.app_manifest_dir(application_id)
            .join("installation-report")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.manifest_dir.join(".staging")
    }

    pub fn task_staging_dir(&self, task_id: &str) -> PathBuf {
        self.staging_dir().join(task_id)
    }

    pub fn mount_point(&self, application_id: &str) -> PathBuf {
        self.image_mount_dir.join(application_id)
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [&self.manifest_dir, &self.image_mount_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}
