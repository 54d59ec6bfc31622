use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing::warn;

use appdeck_core::{InstallationReport, PackageHeader};

use crate::layout::InstallerPaths;

#[derive(Debug, Clone)]
pub struct ApplicationRecord {
    pub header: PackageHeader,
    // None when the report file is missing or unreadable; the reconciler
    // treats such applications as broken and removes them.
    pub report: Option<InstallationReport>,
}

// The collaborator that tracks which applications are installed. The task
// engine drives it through this narrow surface so tests can substitute an
// in-memory double.
pub trait ApplicationRegistry: Send + Sync {
    fn applications(&self) -> Vec<ApplicationRecord>;
    fn by_id(&self, application_id: &str) -> Option<ApplicationRecord>;

    // Persists a freshly installed application. raw_header is the exact
    // header.toml payload from the package; it is stored byte for byte so
    // later signature and equality checks see what was signed.
    fn register(&self, record: &ApplicationRecord, raw_header: &str) -> Result<()>;

    // Marks an application as going away. Returns false when the
    // application is unknown or already being removed.
    fn starting_removal(&self, application_id: &str) -> bool;

    // Reverts a removal that could not complete, so it can be retried.
    fn canceled_removal(&self, application_id: &str) -> bool;

    // Completes the pending operation on an application: drops the entry if
    // a removal was started, otherwise confirms the installed entry exists.
    fn finished_install(&self, application_id: &str) -> bool;
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    record: ApplicationRecord,
    removal_pending: bool,
}

// The production registry, backed by the manifest directory. One
// subdirectory per application holding header.toml and the installation
// report; the in-memory map is rebuilt from disk at startup.
pub struct FileApplicationRegistry {
    paths: InstallerPaths,
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
}

impl FileApplicationRegistry {
    pub fn load(paths: &InstallerPaths) -> Result<Self> {
        let mut entries = BTreeMap::new();

        if paths.manifest_dir().is_dir() {
            let listing = fs::read_dir(paths.manifest_dir()).with_context(|| {
                format!("failed to list {}", paths.manifest_dir().display())
            })?;
            for dir_entry in listing {
                let dir_entry = dir_entry.with_context(|| {
                    format!("failed to list {}", paths.manifest_dir().display())
                })?;
                let name = dir_entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || !dir_entry.path().is_dir() {
                    continue;
                }

                let header_path = paths.header_path(&name);
                let header = match fs::read_to_string(&header_path)
                    .map_err(anyhow::Error::from)
                    .and_then(|raw| PackageHeader::from_toml_str(&raw))
                {
                    Ok(header) => header,
                    Err(err) => {
                        // Left for the reconciler's orphan sweep.
                        warn!(target: "registry", application_id = %name, error = %format!("{err:#}"),
                            "skipping application with unreadable header");
                        continue;
                    }
                };
                if header.application_id != name {
                    warn!(target: "registry", application_id = %name,
                        header_id = %header.application_id,
                        "skipping application whose header id does not match its directory");
                    continue;
                }

                let report = fs::read_to_string(paths.report_path(&name))
                    .map_err(anyhow::Error::from)
                    .and_then(|raw| InstallationReport::parse(&raw))
                    .ok();

                entries.insert(
                    name,
                    RegistryEntry {
                        record: ApplicationRecord { header, report },
                        removal_pending: false,
                    },
                );
            }
        }

        Ok(Self {
            paths: paths.clone(),
            entries: Mutex::new(entries),
        })
    }
}

impl ApplicationRegistry for FileApplicationRegistry {
    fn applications(&self) -> Vec<ApplicationRecord> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    fn by_id(&self, application_id: &str) -> Option<ApplicationRecord> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(application_id)
            .map(|entry| entry.record.clone())
    }

    fn register(&self, record: &ApplicationRecord, raw_header: &str) -> Result<()> {
        let id = record.header.application_id.clone();
        let report = record
            .report
            .as_ref()
            .ok_or_else(|| anyhow!("cannot register application {id} without a report"))?;

        let app_dir = self.paths.app_manifest_dir(&id);
        fs::create_dir_all(&app_dir)
            .with_context(|| format!("failed to create directory {}", app_dir.display()))?;
        let header_path = self.paths.header_path(&id);
        fs::write(&header_path, raw_header)
            .with_context(|| format!("failed to write {}", header_path.display()))?;
        let report_path = self.paths.report_path(&id);
        fs::write(&report_path, report.serialize())
            .with_context(|| format!("failed to write {}", report_path.display()))?;

        self.entries.lock().expect("registry lock poisoned").insert(
            id,
            RegistryEntry {
                record: record.clone(),
                removal_pending: false,
            },
        );
        Ok(())
    }

    fn starting_removal(&self, application_id: &str) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get_mut(application_id) {
            Some(entry) if !entry.removal_pending => {
                entry.removal_pending = true;
                true
            }
            _ => false,
        }
    }

    fn canceled_removal(&self, application_id: &str) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get_mut(application_id) {
            Some(entry) if entry.removal_pending => {
                entry.removal_pending = false;
                true
            }
            _ => false,
        }
    }

    fn finished_install(&self, application_id: &str) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get(application_id) {
            Some(entry) if entry.removal_pending => {
                entries.remove(application_id);
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}
