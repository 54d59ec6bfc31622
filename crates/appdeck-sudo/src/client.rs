use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use tracing::debug;

use crate::protocol::{validate_request_paths, SudoRequest, SudoResponse};
use crate::server::SudoServer;

pub(crate) trait SudoTransport: Send {
    fn call(&mut self, request: &SudoRequest) -> Result<SudoResponse>;
    fn is_fallback(&self) -> bool {
        false
    }
}

pub(crate) struct FallbackTransport {
    pub(crate) server: SudoServer,
}

impl SudoTransport for FallbackTransport {
    fn call(&mut self, request: &SudoRequest) -> Result<SudoResponse> {
        Ok(self.server.handle(request))
    }

    fn is_fallback(&self) -> bool {
        true
    }
}

// The single unprivileged caller of the privileged helper. All methods are
// synchronous; a failed call leaves its reason in last_error(). The caller is
// responsible for any retry policy.
pub struct SudoClient {
    transport: Mutex<Box<dyn SudoTransport>>,
    last_error: Mutex<String>,
    fallback: bool,
}

impl SudoClient {
    pub(crate) fn from_transport(transport: Box<dyn SudoTransport>) -> Self {
        let fallback = transport.is_fallback();
        Self {
            transport: Mutex::new(transport),
            last_error: Mutex::new(String::new()),
            fallback,
        }
    }

    // Runs the server logic in-process. Used when the helper process could
    // not be spawned with elevated rights; everything behaves identically
    // apart from the missing privilege boundary.
    pub fn fallback(server: SudoServer) -> Self {
        Self::from_transport(Box::new(FallbackTransport { server }))
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().expect("sudo client lock poisoned").clone()
    }

    fn request(&self, request: SudoRequest) -> Option<Option<String>> {
        if let Err(err) = validate_request_paths(&request) {
            self.set_last_error(format!("{err:#}"));
            return None;
        }

        let response = {
            let mut transport = self.transport.lock().expect("sudo client lock poisoned");
            transport.call(&request)
        };
        match response {
            Ok(SudoResponse { ok: true, value, .. }) => {
                self.set_last_error(String::new());
                Some(value)
            }
            Ok(SudoResponse { error, .. }) => {
                let message = error.unwrap_or_else(|| "unknown privileged operation failure".to_string());
                debug!(target: "sudo", %message, "privileged operation failed");
                self.set_last_error(message);
                None
            }
            Err(err) => {
                let message = format!("privileged channel failure: {err:#}");
                debug!(target: "sudo", %message, "privileged channel failed");
                self.set_last_error(message);
                None
            }
        }
    }

    fn set_last_error(&self, message: String) {
        *self.last_error.lock().expect("sudo client lock poisoned") = message;
    }

    pub fn ping(&self) -> bool {
        self.request(SudoRequest::Ping).is_some()
    }

    pub fn mount(&self, device: &Path, target: &Path, read_only: bool) -> bool {
        self.request(SudoRequest::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            read_only,
        })
        .is_some()
    }

    pub fn unmount(&self, target: &Path, force: bool) -> bool {
        self.request(SudoRequest::Unmount {
            target: target.to_path_buf(),
            force,
        })
        .is_some()
    }

    // Returns the attached device name, or "" on failure (see last_error()).
    pub fn attach_loopback(&self, image: &Path, read_only: bool) -> String {
        self.request(SudoRequest::AttachLoopback {
            image: image.to_path_buf(),
            read_only,
        })
        .flatten()
        .unwrap_or_default()
    }

    pub fn detach_loopback(&self, device: &Path) -> bool {
        self.request(SudoRequest::DetachLoopback {
            device: device.to_path_buf(),
        })
        .is_some()
    }

    pub fn remove_recursive(&self, path: &Path) -> bool {
        self.request(SudoRequest::RemoveRecursive {
            path: path.to_path_buf(),
        })
        .is_some()
    }

    pub fn set_owner_and_permissions(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> bool {
        self.request(SudoRequest::SetOwnerAndPermissions {
            path: path.to_path_buf(),
            uid,
            gid,
            mode,
        })
        .is_some()
    }
}
