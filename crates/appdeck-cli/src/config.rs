use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use appdeck_installer::{
    EngineSettings, InstallationLocation, InstallerPaths, LocationKind, LocationRegistry,
    UserIdSeparation,
};

// The daemonless equivalent of a system configuration: one TOML file naming
// the managed directories, the trusted signing keys and the installation
// locations. Everything else is derived from it.
#[derive(Debug, Deserialize)]
pub struct InstallerConfig {
    pub manifest_dir: PathBuf,
    pub image_mount_dir: PathBuf,
    #[serde(default)]
    pub trusted_keys: Vec<String>,
    #[serde(default)]
    pub allow_unsigned: bool,
    #[serde(default)]
    pub development_mode: bool,
    #[serde(default)]
    pub hardware_id: String,
    #[serde(default)]
    pub user_id_separation: Option<UserIdSeparationConfig>,
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LocationConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub index: u32,
    #[serde(default)]
    pub is_default: bool,
    pub installation_path: PathBuf,
    pub document_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct UserIdSeparationConfig {
    pub min_user_id: u32,
    pub max_user_id: u32,
    pub common_group_id: u32,
}

impl InstallerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse configuration {}", path.display()))?;
        Ok(config)
    }

    pub fn paths(&self) -> InstallerPaths {
        InstallerPaths::new(&self.manifest_dir, &self.image_mount_dir)
    }

    pub fn location_registry(&self) -> Result<LocationRegistry> {
        let mut locations = Vec::new();
        for config in &self.locations {
            locations.push(InstallationLocation {
                kind: LocationKind::parse(&config.kind)?,
                index: config.index,
                is_default: config.is_default,
                installation_path: config.installation_path.clone(),
                document_path: config.document_path.clone(),
            });
        }
        LocationRegistry::new(locations)
    }

    pub fn settings(&self) -> EngineSettings {
        let hardware_id = if self.hardware_id.is_empty() {
            fs::read_to_string("/etc/machine-id")
                .map(|raw| raw.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        } else {
            self.hardware_id.clone()
        };

        EngineSettings {
            trusted_keys: self.trusted_keys.clone(),
            allow_unsigned: self.allow_unsigned,
            development_mode: self.development_mode,
            hardware_id,
            user_id_separation: self.user_id_separation.as_ref().map(|separation| {
                UserIdSeparation {
                    min_user_id: separation.min_user_id,
                    max_user_id: separation.max_user_id,
                    common_group_id: separation.common_group_id,
                }
            }),
        }
    }

    // Every directory the privileged helper may touch.
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.manifest_dir.clone(), self.image_mount_dir.clone()];
        for location in &self.locations {
            roots.push(location.installation_path.clone());
            roots.push(location.document_path.clone());
        }
        roots
    }
}
