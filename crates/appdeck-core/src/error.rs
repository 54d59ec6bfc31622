use std::fmt;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    Canceled,
    Parse,
    Signature,
    IO,
    Permissions,
    Package,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Canceled => "canceled",
            Self::Parse => "parse",
            Self::Signature => "signature",
            Self::IO => "io",
            Self::Permissions => "permissions",
            Self::Package => "package",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Self::None),
            "canceled" => Ok(Self::Canceled),
            "parse" => Ok(Self::Parse),
            "signature" => Ok(Self::Signature),
            "io" => Ok(Self::IO),
            "permissions" => Ok(Self::Permissions),
            "package" => Ok(Self::Package),
            _ => Err(anyhow!("invalid error code: {value}")),
        }
    }
}

// Terminal failure of a task. Errors are captured on the task and surfaced
// through the Failed state, never thrown across the scheduler boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(ErrorCode::Canceled, "task canceled")
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Parse, message)
    }

    pub fn signature(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Signature, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IO, message)
    }

    pub fn permissions(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Permissions, message)
    }

    pub fn package(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Package, message)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}
