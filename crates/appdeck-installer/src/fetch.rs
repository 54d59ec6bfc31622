use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use appdeck_security::sha256_hex;

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

// Fetches the package payload into destination. http(s) sources are
// downloaded, file:// and plain paths are copied. progress receives
// (bytes_done, total_bytes) after every chunk and may abort the transfer by
// returning an error, which is how cancellation reaches into a running
// download.
pub(crate) fn fetch_payload(
    source: &str,
    destination: &Path,
    progress: &mut dyn FnMut(u64, Option<u64>) -> Result<()>,
) -> Result<()> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::blocking::get(source)
            .with_context(|| format!("failed to download {source}"))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to download {source}: server answered {}",
                response.status()
            ));
        }
        let total = response.content_length();
        return copy_with_progress(response, destination, total, progress);
    }

    let path = match source.strip_prefix("file://") {
        Some(stripped) => PathBuf::from(stripped),
        None => PathBuf::from(source),
    };
    let file =
        File::open(&path).with_context(|| format!("failed to open package {}", path.display()))?;
    let total = file
        .metadata()
        .with_context(|| format!("failed to stat package {}", path.display()))?
        .len();
    copy_with_progress(file, destination, Some(total), progress)
}

fn copy_with_progress(
    mut reader: impl Read,
    destination: &Path,
    total: Option<u64>,
    progress: &mut dyn FnMut(u64, Option<u64>) -> Result<()>,
) -> Result<()> {
    let mut out = File::create(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let mut done: u64 = 0;
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed to read package payload")?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])
            .with_context(|| format!("failed to write {}", destination.display()))?;
        done += read as u64;
        progress(done, total)?;
    }
    out.flush()
        .with_context(|| format!("failed to write {}", destination.display()))?;
    Ok(())
}

pub(crate) fn extract_package(archive: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(destination),
        &format!("failed to extract {}", archive.display()),
    )
}

// Digest over the extracted content tree: every entry in sorted relative
// path order, directories by name, files by name plus content hash. Symlinks
// are rejected outright since installed trees must be self-contained.
pub(crate) fn compute_content_digest(root: &Path) -> Result<String> {
    let mut entries = Vec::new();
    collect_entries(root, root, &mut entries)?;
    entries.sort();

    let mut fold = String::new();
    for relative in entries {
        let full = root.join(&relative);
        let metadata = fs::symlink_metadata(&full)
            .with_context(|| format!("failed to stat {}", full.display()))?;
        if metadata.file_type().is_symlink() {
            return Err(anyhow!(
                "package content must not contain symlinks ({})",
                relative.display()
            ));
        }
        if metadata.is_dir() {
            fold.push_str(&format!("{}/\n", relative.display()));
        } else {
            let data = fs::read(&full)
                .with_context(|| format!("failed to read {}", full.display()))?;
            fold.push_str(&format!("{} {}\n", relative.display(), sha256_hex(&data)));
        }
    }
    Ok(sha256_hex(fold.as_bytes()))
}

fn collect_entries(root: &Path, dir: &Path, entries: &mut Vec<PathBuf>) -> Result<()> {
    let listing =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in listing {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .context("directory walk escaped its root")?
            .to_path_buf();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        entries.push(relative);
        if file_type.is_dir() {
            collect_entries(root, &path, entries)?;
        }
    }
    Ok(())
}

pub(crate) fn directory_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    let listing =
        fs::read_dir(root).with_context(|| format!("failed to list {}", root.display()))?;
    for entry in listing {
        let entry = entry.with_context(|| format!("failed to list {}", root.display()))?;
        let metadata = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if metadata.is_dir() {
            total += directory_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

// Moves a directory tree, falling back to copy-and-delete when source and
// destination are on different filesystems (staging lives on the manifest
// filesystem, installation locations usually do not).
pub(crate) fn move_dir(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    copy_dir_recursive(source, destination)?;
    fs::remove_dir_all(source)
        .with_context(|| format!("failed to remove {}", source.display()))?;
    Ok(())
}

pub(crate) fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    fs::remove_file(source)
        .with_context(|| format!("failed to remove {}", source.display()))?;
    Ok(())
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    let listing =
        fs::read_dir(source).with_context(|| format!("failed to list {}", source.display()))?;
    for entry in listing {
        let entry = entry.with_context(|| format!("failed to list {}", source.display()))?;
        let target = destination.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
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
