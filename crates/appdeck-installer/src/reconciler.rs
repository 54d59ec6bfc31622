use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use appdeck_sudo::SudoClient;

use crate::layout::InstallerPaths;
use crate::locations::{InstallationLocation, LocationRegistry, MountTable};
use crate::registry::{ApplicationRecord, ApplicationRegistry};

// Startup crash recovery. Runs before the task engine accepts any work:
// unmounts leftovers of a previous run, removes applications whose on-disk
// state is broken, and sweeps every managed directory for entries no
// surviving application accounts for. Running it twice in a row is a no-op
// the second time.
pub struct Reconciler<'a> {
    sudo: &'a SudoClient,
    locations: &'a LocationRegistry,
    registry: &'a dyn ApplicationRegistry,
    paths: &'a InstallerPaths,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        sudo: &'a SudoClient,
        locations: &'a LocationRegistry,
        registry: &'a dyn ApplicationRegistry,
        paths: &'a InstallerPaths,
    ) -> Self {
        Self {
            sudo,
            locations,
            registry,
            paths,
        }
    }

    pub fn run(&self) -> Result<()> {
        self.cleanup_stale_mounts()?;
        let survivors = self.remove_broken_applications()?;
        let valid_paths = self.build_valid_path_set(&survivors);
        self.sweep_orphans(&valid_paths)
    }

    // Everything under the image mount directory belongs to a previous run.
    // A mount or mount point we cannot get rid of makes the whole managed
    // area untrustworthy, so that is fatal.
    fn cleanup_stale_mounts(&self) -> Result<()> {
        let mount_dir = self.paths.image_mount_dir();
        if !mount_dir.is_dir() {
            return Ok(());
        }
        let mounts = MountTable::read()?;

        let listing = fs::read_dir(mount_dir)
            .with_context(|| format!("failed to list {}", mount_dir.display()))?;
        for entry in listing {
            let entry =
                entry.with_context(|| format!("failed to list {}", mount_dir.display()))?;
            let path = entry.path();

            if let Some(device) = mounts.device_for(&path).map(str::to_string) {
                info!(target: "installer", mount_point = %path.display(), "unmounting stale mount");
                if !self.sudo.unmount(&path, false) && !self.sudo.unmount(&path, true) {
                    return Err(anyhow!(
                        "failed to unmount stale mount {}: {}",
                        path.display(),
                        self.sudo.last_error()
                    ));
                }
                if device.starts_with("/dev/loop")
                    && !self.sudo.detach_loopback(std::path::Path::new(&device))
                {
                    warn!(target: "installer", device = %device,
                        error = %self.sudo.last_error(), "failed to detach stale loopback device");
                }
            }

            if !self.sudo.remove_recursive(&path) {
                return Err(anyhow!(
                    "failed to remove stale mount point {}: {}",
                    path.display(),
                    self.sudo.last_error()
                ));
            }
        }
        Ok(())
    }

    // Checks every registered application against its on-disk state.
    // Applications on unmounted removable media cannot be checked and are
    // left alone; broken ones are excised from the registry and their
    // remains fall to the orphan sweep.
    fn remove_broken_applications(&self) -> Result<Vec<(ApplicationRecord, InstallationLocation)>> {
        let mounts = MountTable::read()?;
        let mut survivors = Vec::new();

        for record in self.registry.applications() {
            let id = record.header.application_id.clone();
            let location = match &record.report {
                Some(report) => self.locations.by_id(&report.installation_location_id).clone(),
                None => InstallationLocation::invalid(),
            };

            if location.is_removable() && location.is_valid() && !location.is_mounted(&mounts) {
                continue;
            }

            if self.application_is_intact(&record, &location) {
                survivors.push((record, location));
                continue;
            }

            info!(target: "installer", application_id = %id, "removing broken application");
            if !self.registry.starting_removal(&id) || !self.registry.finished_install(&id) {
                return Err(anyhow!(
                    "failed to remove broken application {id} from the registry"
                ));
            }
        }
        Ok(survivors)
    }

    fn application_is_intact(
        &self,
        record: &ApplicationRecord,
        location: &InstallationLocation,
    ) -> bool {
        if record.report.is_none() || !location.is_valid() {
            return false;
        }
        let id = &record.header.application_id;
        if !self.paths.app_manifest_dir(id).is_dir()
            || !self.paths.header_path(id).is_file()
            || !self.paths.report_path(id).is_file()
        {
            return false;
        }
        if !location.document_dir(id).is_dir() {
            return false;
        }
        if location.is_removable() {
            location.image_path(id).is_file()
        } else {
            location.application_dir(id).is_dir()
        }
    }

    // The multimap of every directory the installer owns to the entry names
    // that are allowed to exist in it. Directory names carry a trailing
    // slash so a file cannot impersonate an expected directory. Bases of
    // unmounted removable locations are not registered and therefore never
    // swept.
    fn build_valid_path_set(
        &self,
        survivors: &[(ApplicationRecord, InstallationLocation)],
    ) -> BTreeMap<PathBuf, BTreeSet<String>> {
        let mut valid: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();
        let mounts = MountTable::read().unwrap_or_default();

        valid.entry(self.paths.manifest_dir().to_path_buf()).or_default();
        for location in self.locations.list() {
            if location.is_removable() && !location.is_mounted(&mounts) {
                continue;
            }
            valid.entry(location.installation_path.clone()).or_default();
            valid.entry(location.document_path.clone()).or_default();
        }

        for (record, location) in survivors {
            let id = &record.header.application_id;
            valid
                .entry(self.paths.manifest_dir().to_path_buf())
                .or_default()
                .insert(format!("{id}/"));
            valid
                .entry(location.document_path.clone())
                .or_default()
                .insert(format!("{id}/"));
            let content_name = if location.is_removable() {
                format!("{id}.appimg")
            } else {
                format!("{id}/")
            };
            valid
                .entry(location.installation_path.clone())
                .or_default()
                .insert(content_name);
        }
        valid
    }

    fn sweep_orphans(&self, valid: &BTreeMap<PathBuf, BTreeSet<String>>) -> Result<()> {
        for (base, names) in valid {
            if !base.is_dir() {
                continue;
            }
            let listing =
                fs::read_dir(base).with_context(|| format!("failed to list {}", base.display()))?;
            for entry in listing {
                let entry =
                    entry.with_context(|| format!("failed to list {}", base.display()))?;
                let mut name = entry.file_name().to_string_lossy().to_string();
                let file_type = entry
                    .file_type()
                    .with_context(|| format!("failed to stat {}", entry.path().display()))?;
                if file_type.is_dir() {
                    name.push('/');
                }
                if names.contains(&name) {
                    continue;
                }

                info!(target: "installer", path = %entry.path().display(), "removing orphaned entry");
                if !self.sudo.remove_recursive(&entry.path()) {
                    return Err(anyhow!(
                        "failed to remove orphaned entry {}: {}",
                        entry.path().display(),
                        self.sudo.last_error()
                    ));
                }
            }
        }
        Ok(())
    }
}
