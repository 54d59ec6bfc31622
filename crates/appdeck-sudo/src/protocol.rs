use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

// The complete, fixed operation set of the privileged helper. Everything is
// synchronous request/response over a single duplex channel; the unprivileged
// side owns sequencing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum SudoRequest {
    Mount {
        device: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
    Unmount {
        target: PathBuf,
        force: bool,
    },
    AttachLoopback {
        image: PathBuf,
        read_only: bool,
    },
    DetachLoopback {
        device: PathBuf,
    },
    RemoveRecursive {
        path: PathBuf,
    },
    SetOwnerAndPermissions {
        path: PathBuf,
        uid: u32,
        gid: u32,
        mode: u32,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SudoResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SudoResponse {
    pub fn success(value: Option<String>) -> Self {
        Self {
            ok: true,
            value,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

// No shell interpretation anywhere: every path argument must be absolute and
// free of relative components. Checked on both sides of the channel.
pub fn validate_request_paths(request: &SudoRequest) -> Result<()> {
    match request {
        SudoRequest::Mount { device, target, .. } => {
            validate_path(device)?;
            validate_path(target)
        }
        SudoRequest::Unmount { target, .. } => validate_path(target),
        SudoRequest::AttachLoopback { image, .. } => validate_path(image),
        SudoRequest::DetachLoopback { device } => validate_path(device),
        SudoRequest::RemoveRecursive { path } => validate_path(path),
        SudoRequest::SetOwnerAndPermissions { path, .. } => validate_path(path),
        SudoRequest::Ping => Ok(()),
    }
}

fn validate_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(anyhow!("path must be absolute: {}", path.display()));
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::CurDir))
    {
        return Err(anyhow!(
            "path must not contain relative components: {}",
            path.display()
        ));
    }
    Ok(())
}
