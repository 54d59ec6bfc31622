use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::protocol::{validate_request_paths, SudoRequest, SudoResponse};

// Executes the privileged primitives. The server never retries and never
// queues; it answers exactly one request at a time and reports every failure
// with a human-readable string. Requests touching paths outside the
// configured roots are refused outright, so a compromised unprivileged side
// cannot turn the helper into a generic root file eraser.
pub struct SudoServer {
    allowed_roots: Vec<PathBuf>,
}

impl SudoServer {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots }
    }

    pub fn handle(&self, request: &SudoRequest) -> SudoResponse {
        if let Err(err) = validate_request_paths(request) {
            return SudoResponse::failure(format!("{err:#}"));
        }
        match self.dispatch(request) {
            Ok(value) => SudoResponse::success(value),
            Err(err) => SudoResponse::failure(format!("{err:#}")),
        }
    }

    fn dispatch(&self, request: &SudoRequest) -> Result<Option<String>> {
        match request {
            SudoRequest::Mount {
                device,
                target,
                read_only,
            } => {
                // Loopback images are the only devices ever mounted here.
                check_loop_device(device)?;
                self.check_allowed(target)?;
                mount(device, target, *read_only)?;
                Ok(None)
            }
            SudoRequest::Unmount { target, force } => {
                self.check_allowed(target)?;
                unmount(target, *force)?;
                Ok(None)
            }
            SudoRequest::AttachLoopback { image, read_only } => {
                self.check_allowed(image)?;
                attach_loopback(image, *read_only).map(Some)
            }
            SudoRequest::DetachLoopback { device } => {
                check_loop_device(device)?;
                detach_loopback(device)?;
                Ok(None)
            }
            SudoRequest::RemoveRecursive { path } => {
                self.check_allowed(path)?;
                remove_recursive(path)?;
                Ok(None)
            }
            SudoRequest::SetOwnerAndPermissions {
                path,
                uid,
                gid,
                mode,
            } => {
                self.check_allowed(path)?;
                set_owner_and_permissions(path, *uid, *gid, *mode)?;
                Ok(None)
            }
            SudoRequest::Ping => Ok(Some("pong".to_string())),
        }
    }

    fn check_allowed(&self, path: &Path) -> Result<()> {
        if self
            .allowed_roots
            .iter()
            .any(|root| path.starts_with(root))
        {
            return Ok(());
        }
        Err(anyhow!(
            "path is outside the allowed installation roots: {}",
            path.display()
        ))
    }
}

fn check_loop_device(device: &Path) -> Result<()> {
    // string prefix, not a path component check: the device is /dev/loopN
    if !device.to_string_lossy().starts_with("/dev/loop") {
        return Err(anyhow!("not a loopback device: {}", device.display()));
    }
    Ok(())
}

fn mount(device: &Path, target: &Path, read_only: bool) -> Result<()> {
    let mut command = Command::new("mount");
    if read_only {
        command.arg("-o").arg("ro");
    }
    command.arg(device).arg(target);
    run_command(&mut command, "failed to mount").map(|_| ())
}

fn unmount(target: &Path, force: bool) -> Result<()> {
    let mut command = Command::new("umount");
    if force {
        command.arg("-f");
    }
    command.arg(target);
    match run_command(&mut command, "failed to unmount") {
        Ok(_) => Ok(()),
        // unmounting something that is not mounted reports success
        Err(err) if format!("{err:#}").contains("not mounted") => Ok(()),
        Err(err) => Err(err),
    }
}

fn attach_loopback(image: &Path, read_only: bool) -> Result<String> {
    let mut command = Command::new("losetup");
    command.arg("--find").arg("--show");
    if read_only {
        command.arg("--read-only");
    }
    command.arg(image);
    let stdout = run_command(&mut command, "failed to attach loopback device")?;
    let device = stdout.trim().to_string();
    if device.is_empty() {
        return Err(anyhow!(
            "losetup did not report a device name for {}",
            image.display()
        ));
    }
    Ok(device)
}

fn detach_loopback(device: &Path) -> Result<()> {
    // detaching an already-detached loopback reports success
    if !device.exists() {
        return Ok(());
    }
    let mut command = Command::new("losetup");
    command.arg("-d").arg(device);
    match run_command(&mut command, "failed to detach loopback device") {
        Ok(_) => Ok(()),
        Err(err) if format!("{err:#}").contains("No such device") => Ok(()),
        Err(err) => Err(err),
    }
}

// Depth-first removal that never follows symlinks: a symlink is removed as a
// file, so a link pointing outside the target subtree cannot make us delete
// foreign data. Directories get full permissions before we enter them, files
// go before their parent, and a directory is removed only once it is empty.
pub(crate) fn remove_recursive(path: &Path) -> Result<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };

    if metadata.is_dir() && !metadata.file_type().is_symlink() {
        fs::set_permissions(path, fs::Permissions::from_mode(0o777))
            .with_context(|| format!("failed to grant traversal on {}", path.display()))?;

        for entry in
            fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?
        {
            let entry = entry?;
            let entry_path = entry.path();
            let entry_meta = fs::symlink_metadata(&entry_path)
                .with_context(|| format!("failed to stat {}", entry_path.display()))?;
            if entry_meta.is_dir() && !entry_meta.file_type().is_symlink() {
                remove_recursive(&entry_path)?;
            } else {
                fs::remove_file(&entry_path)
                    .with_context(|| format!("failed to remove {}", entry_path.display()))?;
            }
        }

        fs::remove_dir(path)
            .with_context(|| format!("failed to remove directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }
}

fn set_owner_and_permissions(path: &Path, uid: u32, gid: u32, mode: u32) -> Result<()> {
    let mut chown = Command::new("chown");
    chown.arg("-R").arg(format!("{uid}:{gid}")).arg(path);
    run_command(&mut chown, "failed to change ownership")?;

    let mut chmod = Command::new("chmod");
    chmod.arg("-R").arg(format!("{mode:o}")).arg(path);
    run_command(&mut chmod, "failed to change permissions").map(|_| ())
}

fn run_command(command: &mut Command, context_message: &str) -> Result<String> {
    // Failure classification matches on the tools' untranslated messages.
    let output = command
        .env("LC_ALL", "C")
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
