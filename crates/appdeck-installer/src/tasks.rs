use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tracing::warn;

use appdeck_core::{compare_versions, InstallationReport, PackageHeader, TaskError};
use appdeck_security::{sha256_hex, verify_against_trusted_keys};

use crate::fetch;
use crate::locations::{InstallationLocation, MountTable};
use crate::registry::ApplicationRecord;
use crate::scheduler::TaskEnv;
use crate::users::find_unused_user_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Executing,
    AwaitingAcknowledge,
    Installing,
    CleaningUp,
    Finished,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Executing => "executing",
            TaskState::AwaitingAcknowledge => "awaiting-acknowledge",
            TaskState::Installing => "installing",
            TaskState::CleaningUp => "cleaning-up",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Installation,
    Deinstallation,
    Activation,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Installation => "installation",
            TaskKind::Deinstallation => "deinstallation",
            TaskKind::Activation => "activation",
        }
    }
}

// What a queued task is supposed to do, captured at enqueue time.
#[derive(Debug, Clone)]
pub(crate) enum TaskSpec {
    Installation {
        location_id: String,
        source_url: String,
    },
    Deinstallation {
        application_id: String,
        keep_documents: bool,
        force: bool,
    },
    Activation {
        application_id: String,
        activate: bool,
    },
}

impl TaskSpec {
    pub(crate) fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::Installation { .. } => TaskKind::Installation,
            TaskSpec::Deinstallation { .. } => TaskKind::Deinstallation,
            TaskSpec::Activation { .. } => TaskKind::Activation,
        }
    }
}

// Snapshot of one task as reported to callers.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub application_id: String,
    pub progress: f64,
    pub error: Option<TaskError>,
}

// The scheduler-side services a running task body needs. Kept as a trait so
// the bodies can be exercised without spinning up a full engine.
pub(crate) trait TaskHooks {
    fn set_state(&self, state: TaskState);
    fn set_progress(&self, progress: f64);
    fn set_application_id(&self, application_id: &str);
    fn check_canceled(&self) -> Result<(), TaskError>;

    // Publishes the parsed header and blocks until the caller acknowledges
    // or cancels. On success the task owns the filesystem-mutating slot and
    // is in the Installing state.
    fn await_acknowledge(&self, header: &PackageHeader) -> Result<(), TaskError>;
}

// The verified result of the staging phase, ready to be committed once the
// caller has acknowledged the package.
struct StagedPackage {
    header: PackageHeader,
    raw_header: String,
    content_size: u64,
}

pub(crate) fn run_installation(
    env: &TaskEnv,
    hooks: &dyn TaskHooks,
    task_id: &str,
    location_id: &str,
    source_url: &str,
) -> Result<(), TaskError> {
    let location = env.locations.by_id(location_id).clone();
    if !location.is_valid() {
        return Err(TaskError::package(format!(
            "unknown installation location '{location_id}'"
        )));
    }
    if location.is_removable() {
        let mounts = MountTable::read().map_err(|err| TaskError::io(format!("{err:#}")))?;
        if !location.is_mounted(&mounts) {
            return Err(TaskError::package(format!(
                "installation location '{location_id}' is not mounted"
            )));
        }
    }

    let staging = env.paths.task_staging_dir(task_id);
    let archive = staging.join("package.tar");
    let tree = staging.join("tree");
    fs::create_dir_all(&tree)
        .map_err(|err| TaskError::io(format!("failed to create staging directory: {err}")))?;

    // CleaningUp is only observable between Installing and the terminal
    // state; a task that fails or is canceled before it entered Installing
    // cleans up its staging area without a state change.
    let staged = match stage_package(env, hooks, &location, source_url, &archive, &tree) {
        Ok(staged) => staged,
        Err(err) => {
            remove_staging(env, &staging);
            return Err(err);
        }
    };
    if let Err(err) = hooks.check_canceled() {
        remove_staging(env, &staging);
        return Err(err);
    }
    if let Err(err) = hooks.await_acknowledge(&staged.header) {
        remove_staging(env, &staging);
        return Err(err);
    }

    let result = commit_installation(
        env,
        &location,
        &staged.header,
        &staged.raw_header,
        &tree.join("content"),
        staged.content_size,
    );

    hooks.set_state(TaskState::CleaningUp);
    remove_staging(env, &staging);
    result
}

fn remove_staging(env: &TaskEnv, staging: &Path) {
    if !env.sudo.remove_recursive(staging) {
        // The reconciler sweeps leftover staging directories at next start.
        warn!(target: "installer", staging = %staging.display(), error = %env.sudo.last_error(),
            "failed to remove staging directory");
    }
}

fn stage_package(
    env: &TaskEnv,
    hooks: &dyn TaskHooks,
    location: &InstallationLocation,
    source_url: &str,
    archive: &Path,
    tree: &Path,
) -> Result<StagedPackage, TaskError> {
    let fetched = fetch::fetch_payload(
        source_url,
        archive,
        &mut |done, total| {
            hooks
                .check_canceled()
                .map_err(|err| anyhow!("{err}"))?;
            if let Some(total) = total {
                if total > 0 {
                    hooks.set_progress(done as f64 / total as f64);
                }
            }
            Ok(())
        },
    );
    if let Err(err) = fetched {
        hooks.check_canceled()?;
        return Err(TaskError::io(format!("{err:#}")));
    }
    hooks.set_progress(1.0);

    fetch::extract_package(archive, tree).map_err(|err| TaskError::io(format!("{err:#}")))?;

    let header_path = tree.join("header.toml");
    let raw_header = fs::read_to_string(&header_path)
        .map_err(|err| TaskError::package(format!("package has no readable header: {err}")))?;
    let header = PackageHeader::from_toml_str(&raw_header)
        .map_err(|err| TaskError::parse(format!("{err:#}")))?;
    hooks.set_application_id(&header.application_id);

    verify_signature(env, tree, &raw_header)?;

    let content = tree.join("content");
    if !content.is_dir() {
        return Err(TaskError::package(
            "package does not contain a content directory".to_string(),
        ));
    }
    let digest = fetch::compute_content_digest(&content)
        .map_err(|err| TaskError::io(format!("{err:#}")))?;
    if digest != header.content_sha256 {
        return Err(TaskError::signature(format!(
            "package content does not match its header (expected {}, found {digest})",
            header.content_sha256
        )));
    }

    if location.is_removable() && header.image.is_none() {
        return Err(TaskError::package(format!(
            "application {} cannot be installed to a removable location: its package carries no image",
            header.application_id
        )));
    }

    let content_size =
        fetch::directory_size(&content).map_err(|err| TaskError::io(format!("{err:#}")))?;
    let usage = location
        .disk_usage()
        .map_err(|err| TaskError::io(format!("{err:#}")))?;
    if usage.free_bytes < content_size {
        return Err(TaskError::io(format!(
            "not enough disk space on location '{}': {} bytes needed, {} bytes free",
            location.id(),
            content_size,
            usage.free_bytes
        )));
    }

    if let Some(existing) = env.registry.by_id(&header.application_id) {
        if compare_versions(&header.version, &existing.header.version) != Ordering::Greater {
            warn!(target: "installer", application_id = %header.application_id,
                installed = %existing.header.version, offered = %header.version,
                "installing a version that is not newer than the installed one");
        }
    }

    Ok(StagedPackage {
        header,
        raw_header,
        content_size,
    })
}

fn verify_signature(env: &TaskEnv, tree: &Path, raw_header: &str) -> Result<(), TaskError> {
    let signature_path = tree.join("header.sig");
    if !signature_path.exists() {
        if env.settings.allow_unsigned || env.settings.development_mode {
            return Ok(());
        }
        return Err(TaskError::signature(
            "package is not signed and unsigned packages are not allowed".to_string(),
        ));
    }

    let signature = fs::read_to_string(&signature_path)
        .map_err(|err| TaskError::io(format!("failed to read package signature: {err}")))?;
    match verify_against_trusted_keys(
        raw_header.as_bytes(),
        signature.trim(),
        &env.settings.trusted_keys,
    ) {
        Ok(true) => Ok(()),
        Ok(false) => Err(TaskError::signature(
            "package signature does not match any trusted key".to_string(),
        )),
        Err(err) => Err(TaskError::signature(format!(
            "package signature is malformed: {err:#}"
        ))),
    }
}

fn commit_installation(
    env: &TaskEnv,
    location: &InstallationLocation,
    header: &PackageHeader,
    raw_header: &str,
    content: &Path,
    content_size: u64,
) -> Result<(), TaskError> {
    let id = &header.application_id;
    let target = if location.is_removable() {
        location.image_path(id)
    } else {
        location.application_dir(id)
    };
    let previous = sidelined_path(&target);

    let is_update = target.exists() || target.is_symlink();
    if is_update {
        fs::rename(&target, &previous).map_err(|err| {
            TaskError::io(format!(
                "failed to set aside previous version of {id}: {err}"
            ))
        })?;
    }

    let committed = place_content(env, location, header, raw_header, content, content_size, &target);
    if let Err(err) = committed {
        return Err(roll_back(env, &target, &previous, is_update, err));
    }

    if is_update && !env.sudo.remove_recursive(&previous) {
        // Not in any valid path set, so the reconciler picks it up later.
        warn!(target: "installer", path = %previous.display(), error = %env.sudo.last_error(),
            "failed to remove superseded version");
    }
    Ok(())
}

fn place_content(
    env: &TaskEnv,
    location: &InstallationLocation,
    header: &PackageHeader,
    raw_header: &str,
    content: &Path,
    content_size: u64,
    target: &Path,
) -> Result<(), TaskError> {
    let id = &header.application_id;

    if location.is_removable() {
        let image_name = header
            .image
            .as_deref()
            .ok_or_else(|| TaskError::package("package carries no image".to_string()))?;
        let staged_image = content.join(image_name);
        if !staged_image.is_file() {
            return Err(TaskError::package(format!(
                "package names image '{image_name}' but does not contain it"
            )));
        }
        fetch::move_file(&staged_image, target)
            .map_err(|err| TaskError::io(format!("{err:#}")))?;
    } else {
        fetch::move_dir(content, target).map_err(|err| TaskError::io(format!("{err:#}")))?;
    }

    let documents = location.document_dir(id);
    fs::create_dir_all(&documents)
        .map_err(|err| TaskError::io(format!("failed to create document directory: {err}")))?;

    let mut user_id = None;
    if let Some(separation) = &env.settings.user_id_separation {
        let uid = find_unused_user_id(separation, env.registry.as_ref())
            .map_err(|err| TaskError::package(format!("{err:#}")))?;
        if !env
            .sudo
            .set_owner_and_permissions(target, uid, separation.common_group_id, 0o750)
        {
            return Err(TaskError::permissions(env.sudo.last_error()));
        }
        if !env
            .sudo
            .set_owner_and_permissions(&documents, uid, separation.common_group_id, 0o700)
        {
            return Err(TaskError::permissions(env.sudo.last_error()));
        }
        user_id = Some(uid);
    }

    let record = ApplicationRecord {
        header: header.clone(),
        report: Some(InstallationReport {
            application_id: id.clone(),
            installation_location_id: location.id(),
            disk_space_used: content_size,
            digest: sha256_hex(raw_header.as_bytes()),
            hardware_id: env.settings.hardware_id.clone(),
            user_id,
            extra: header.extra.clone(),
            extra_signed: header.extra_signed.clone(),
        }),
    };
    env.registry
        .register(&record, raw_header)
        .map_err(|err| TaskError::io(format!("{err:#}")))?;
    Ok(())
}

// Undo a half-finished commit: the partially written target goes away and
// the previous version comes back. A failing rollback is reported on top of
// the original error since the location is now in an undefined state.
fn roll_back(
    env: &TaskEnv,
    target: &Path,
    previous: &Path,
    is_update: bool,
    original: TaskError,
) -> TaskError {
    let mut failures = Vec::new();
    if !env.sudo.remove_recursive(target) {
        failures.push(format!(
            "failed to remove partial content {}: {}",
            target.display(),
            env.sudo.last_error()
        ));
    }
    if is_update {
        if let Err(err) = fs::rename(previous, target) {
            failures.push(format!(
                "failed to restore previous version {}: {err}",
                previous.display()
            ));
        }
    }

    if failures.is_empty() {
        original
    } else {
        TaskError::new(
            original.code,
            format!("{}; rollback also failed: {}", original.message, failures.join("; ")),
        )
    }
}

fn sidelined_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".old");
    target.with_file_name(name)
}

pub(crate) fn run_deinstallation(
    env: &TaskEnv,
    hooks: &dyn TaskHooks,
    application_id: &str,
    keep_documents: bool,
    force: bool,
) -> Result<(), TaskError> {
    hooks.set_application_id(application_id);
    hooks.check_canceled()?;

    let Some(record) = env.registry.by_id(application_id) else {
        return Err(TaskError::package(format!(
            "application {application_id} is not installed"
        )));
    };
    let location = match record.report {
        Some(report) => env.locations.by_id(&report.installation_location_id).clone(),
        None if force => InstallationLocation::invalid(),
        None => {
            return Err(TaskError::package(format!(
                "the installation report of {application_id} is unreadable (use force to remove anyway)"
            )));
        }
    };
    if !location.is_valid() && !force {
        return Err(TaskError::package(format!(
            "application {application_id} is installed to a location that is no longer configured"
        )));
    }

    if !env.registry.starting_removal(application_id) {
        return Err(TaskError::package(format!(
            "application {application_id} is already being removed"
        )));
    }

    // A failed removal attempt must not wedge the application: the pending
    // mark is reverted so the removal can be retried.
    let result = remove_application(env, &location, application_id, keep_documents, force);
    if result.is_err() {
        env.registry.canceled_removal(application_id);
    }
    result
}

fn remove_application(
    env: &TaskEnv,
    location: &InstallationLocation,
    application_id: &str,
    keep_documents: bool,
    force: bool,
) -> Result<(), TaskError> {
    deactivate_if_mounted(env, application_id, force)?;

    if location.is_valid() {
        let target = if location.is_removable() {
            location.image_path(application_id)
        } else {
            location.application_dir(application_id)
        };
        if !env.sudo.remove_recursive(&target) && !force {
            return Err(TaskError::io(env.sudo.last_error()));
        }
        if !keep_documents
            && !env.sudo.remove_recursive(&location.document_dir(application_id))
            && !force
        {
            return Err(TaskError::io(env.sudo.last_error()));
        }
    }

    if !env
        .sudo
        .remove_recursive(&env.paths.app_manifest_dir(application_id))
        && !force
    {
        return Err(TaskError::io(env.sudo.last_error()));
    }
    if !env.registry.finished_install(application_id) {
        return Err(TaskError::package(format!(
            "application {application_id} vanished from the registry during removal"
        )));
    }
    Ok(())
}

fn deactivate_if_mounted(env: &TaskEnv, application_id: &str, force: bool) -> Result<(), TaskError> {
    let mount_point = env.paths.mount_point(application_id);
    let mounts = match MountTable::read() {
        Ok(mounts) => mounts,
        Err(err) if force => {
            warn!(target: "installer", error = %format!("{err:#}"), "cannot read mount table");
            return Ok(());
        }
        Err(err) => return Err(TaskError::io(format!("{err:#}"))),
    };
    if !mounts.is_mount_point(&mount_point) {
        return Ok(());
    }

    let device = mounts.device_for(&mount_point).map(str::to_string);
    if !env.sudo.unmount(&mount_point, false) && !env.sudo.unmount(&mount_point, true) && !force {
        return Err(TaskError::io(env.sudo.last_error()));
    }
    if let Some(device) = device {
        if device.starts_with("/dev/loop")
            && !env.sudo.detach_loopback(Path::new(&device))
        {
            warn!(target: "installer", device = %device, error = %env.sudo.last_error(),
                "failed to detach loopback device");
        }
    }
    let _ = fs::remove_dir(&mount_point);
    Ok(())
}

// Loopback images must be small enough to compare in memory; headers are a
// few KiB in practice.
const MAX_HEADER_SIZE: u64 = 64 * 1024;

pub(crate) fn run_activation(
    env: &TaskEnv,
    hooks: &dyn TaskHooks,
    application_id: &str,
    activate: bool,
) -> Result<(), TaskError> {
    hooks.set_application_id(application_id);
    hooks.check_canceled()?;

    if env.registry.by_id(application_id).is_none() {
        return Err(TaskError::package(format!(
            "application {application_id} is not installed"
        )));
    }
    let location = env
        .locations
        .by_application(env.registry.as_ref(), application_id)
        .clone();
    if !location.is_valid() {
        return Err(TaskError::package(format!(
            "application {application_id} has no resolvable installation location"
        )));
    }
    if !location.is_removable() {
        return Err(TaskError::package(format!(
            "application {application_id} is not installed to a removable location"
        )));
    }

    let mount_point = env.paths.mount_point(application_id);
    let mounts = MountTable::read().map_err(|err| TaskError::io(format!("{err:#}")))?;

    if activate {
        activate_image(env, &location, application_id, &mount_point, &mounts)
    } else {
        deactivate_image(env, &mount_point, &mounts)
    }
}

fn activate_image(
    env: &TaskEnv,
    location: &InstallationLocation,
    application_id: &str,
    mount_point: &Path,
    mounts: &MountTable,
) -> Result<(), TaskError> {
    if mounts.is_mount_point(mount_point) {
        return Err(TaskError::package(format!(
            "application {application_id} is already activated"
        )));
    }
    let image = location.image_path(application_id);
    if !image.is_file() {
        return Err(TaskError::io(format!(
            "application image {} does not exist",
            image.display()
        )));
    }
    fs::create_dir_all(mount_point)
        .map_err(|err| TaskError::io(format!("failed to create mount point: {err}")))?;

    let device = env.sudo.attach_loopback(&image, true);
    if device.is_empty() {
        return Err(TaskError::permissions(env.sudo.last_error()));
    }
    let device = PathBuf::from(device);
    if !env.sudo.mount(&device, mount_point, true) {
        let error = env.sudo.last_error();
        let _ = env.sudo.detach_loopback(&device);
        return Err(TaskError::permissions(error));
    }

    // The mounted image must carry the exact header that was installed, or
    // someone swapped the image on the medium.
    let check = headers_match(env, application_id, mount_point);
    match check {
        Ok(true) => Ok(()),
        Ok(false) => {
            let _ = env.sudo.unmount(mount_point, true);
            let _ = env.sudo.detach_loopback(&device);
            Err(TaskError::signature(format!(
                "the image header of {application_id} does not match its installed manifest"
            )))
        }
        Err(err) => {
            let _ = env.sudo.unmount(mount_point, true);
            let _ = env.sudo.detach_loopback(&device);
            Err(err)
        }
    }
}

fn headers_match(
    env: &TaskEnv,
    application_id: &str,
    mount_point: &Path,
) -> Result<bool, TaskError> {
    let manifest_header = env.paths.header_path(application_id);
    let image_header = mount_point.join("header.toml");
    for path in [&manifest_header, &image_header] {
        let metadata = fs::metadata(path)
            .map_err(|err| TaskError::io(format!("failed to stat {}: {err}", path.display())))?;
        if metadata.len() > MAX_HEADER_SIZE {
            return Ok(false);
        }
    }
    let installed = fs::read(&manifest_header)
        .map_err(|err| TaskError::io(format!("failed to read installed header: {err}")))?;
    let mounted = fs::read(&image_header)
        .map_err(|err| TaskError::io(format!("failed to read image header: {err}")))?;
    Ok(installed == mounted)
}

fn deactivate_image(env: &TaskEnv, mount_point: &Path, mounts: &MountTable) -> Result<(), TaskError> {
    if !mounts.is_mount_point(mount_point) {
        return Err(TaskError::package(format!(
            "{} is not activated",
            mount_point.display()
        )));
    }
    let device = mounts.device_for(mount_point).map(str::to_string);

    if !env.sudo.unmount(mount_point, false) && !env.sudo.unmount(mount_point, true) {
        return Err(TaskError::io(env.sudo.last_error()));
    }
    if let Some(device) = device {
        if device.starts_with("/dev/loop")
            && !env.sudo.detach_loopback(Path::new(&device))
        {
            warn!(target: "installer", device = %device, error = %env.sudo.last_error(),
                "failed to detach loopback device");
        }
    }
    let _ = fs::remove_dir(mount_point);
    Ok(())
}
