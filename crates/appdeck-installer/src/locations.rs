use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::registry::ApplicationRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Internal,
    Removable,
    Invalid,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationKind::Internal => "internal",
            LocationKind::Removable => "removable",
            LocationKind::Invalid => "invalid",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "internal" => Ok(LocationKind::Internal),
            "removable" => Ok(LocationKind::Removable),
            other => Err(anyhow!("unknown installation location type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

// One configured place applications can be installed to. Identified by
// "<type>-<index>"; exactly one location in a registry is the default.
// Removable locations hold a mountable image per application instead of a
// plain directory tree and are only usable while their medium is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationLocation {
    pub kind: LocationKind,
    pub index: u32,
    pub is_default: bool,
    pub installation_path: PathBuf,
    pub document_path: PathBuf,
}

impl InstallationLocation {
    // The sentinel returned by lookups that find nothing. Callers check
    // is_valid() instead of juggling Options, mirroring the "-1 index"
    // convention of numeric handle APIs.
    pub fn invalid() -> Self {
        Self {
            kind: LocationKind::Invalid,
            index: 0,
            is_default: false,
            installation_path: PathBuf::new(),
            document_path: PathBuf::new(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.index)
    }

    pub fn is_valid(&self) -> bool {
        self.kind != LocationKind::Invalid
    }

    pub fn is_removable(&self) -> bool {
        self.kind == LocationKind::Removable
    }

    pub fn is_mounted(&self, mounts: &MountTable) -> bool {
        if !self.is_valid() {
            return false;
        }
        if !self.is_removable() {
            return true;
        }
        mounts.is_mount_point(&self.installation_path)
    }

    // Where the installed content of one application lives within this
    // location: a directory tree for internal locations, a single loopback
    // image for removable ones.
    pub fn application_dir(&self, application_id: &str) -> PathBuf {
        self.installation_path.join(application_id)
    }

    pub fn image_path(&self, application_id: &str) -> PathBuf {
        self.installation_path
            .join(format!("{application_id}.appimg"))
    }

    pub fn document_dir(&self, application_id: &str) -> PathBuf {
        self.document_path.join(application_id)
    }

    pub fn disk_usage(&self) -> Result<DiskUsage> {
        disk_usage(&self.installation_path)
    }
}

// Snapshot of /proc/self/mounts, keyed by mount point. Paths in that file
// carry octal escapes for spaces and the like; they are decoded here so
// lookups work on plain paths.
#[derive(Debug, Default)]
pub struct MountTable {
    entries: BTreeMap<PathBuf, String>,
}

impl MountTable {
    pub fn read() -> Result<Self> {
        let raw = fs::read_to_string("/proc/self/mounts")
            .context("failed to read /proc/self/mounts")?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in raw.lines() {
            let mut fields = line.split_ascii_whitespace();
            let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
                continue;
            };
            entries.insert(
                PathBuf::from(decode_mount_path(mount_point)),
                decode_mount_path(device),
            );
        }
        Self { entries }
    }

    pub fn device_for(&self, mount_point: &Path) -> Option<&str> {
        self.entries.get(mount_point).map(String::as_str)
    }

    pub fn is_mount_point(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }
}

fn decode_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(ch);
    }
    out
}

// All configured installation locations. Lookups never fail; they return the
// invalid sentinel so callers can report a proper task error instead of
// panicking deep inside a worker thread.
#[derive(Debug)]
pub struct LocationRegistry {
    locations: Vec<InstallationLocation>,
    invalid: InstallationLocation,
}

impl LocationRegistry {
    pub fn new(locations: Vec<InstallationLocation>) -> Result<Self> {
        if locations.is_empty() {
            return Err(anyhow!("at least one installation location must be configured"));
        }

        let mut seen = Vec::new();
        let mut default_count = 0;
        for location in &locations {
            if !location.is_valid() {
                return Err(anyhow!("the invalid location sentinel cannot be configured"));
            }
            let id = location.id();
            if seen.contains(&id) {
                return Err(anyhow!("duplicate installation location id '{id}'"));
            }
            seen.push(id);
            if location.is_default {
                default_count += 1;
            }
        }
        if default_count != 1 {
            return Err(anyhow!(
                "exactly one installation location must be marked as default (found {default_count})"
            ));
        }

        Ok(Self {
            locations,
            invalid: InstallationLocation::invalid(),
        })
    }

    pub fn list(&self) -> &[InstallationLocation] {
        &self.locations
    }

    pub fn ids(&self) -> Vec<String> {
        self.locations.iter().map(InstallationLocation::id).collect()
    }

    pub fn by_id(&self, id: &str) -> &InstallationLocation {
        self.locations
            .iter()
            .find(|location| location.id() == id)
            .unwrap_or(&self.invalid)
    }

    pub fn default_location(&self) -> &InstallationLocation {
        self.locations
            .iter()
            .find(|location| location.is_default)
            .unwrap_or(&self.invalid)
    }

    // Resolves the location an installed application lives in, via its
    // installation report. Unknown applications and applications whose
    // report names a location that is no longer configured both map to the
    // invalid sentinel.
    pub fn by_application(
        &self,
        registry: &dyn ApplicationRegistry,
        application_id: &str,
    ) -> &InstallationLocation {
        let Some(record) = registry.by_id(application_id) else {
            return &self.invalid;
        };
        let Some(report) = record.report else {
            return &self.invalid;
        };
        self.by_id(&report.installation_location_id)
    }
}

pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .with_context(|| format!("failed to query disk usage of {}", path.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "failed to query disk usage of {}: status={} stderr='{}'",
            path.display(),
            output.status,
            stderr.trim()
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| anyhow!("df produced no data row for {}", path.display()))?;
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    // device, 1024-blocks, used, available, capacity, mount point
    if fields.len() < 4 {
        return Err(anyhow!("unexpected df output line '{line}'"));
    }
    let total_kib: u64 = fields[1]
        .parse()
        .with_context(|| format!("unexpected df total '{}'", fields[1]))?;
    let free_kib: u64 = fields[3]
        .parse()
        .with_context(|| format!("unexpected df free '{}'", fields[3]))?;

    Ok(DiskUsage {
        total_bytes: total_kib * 1024,
        free_bytes: free_kib * 1024,
    })
}
