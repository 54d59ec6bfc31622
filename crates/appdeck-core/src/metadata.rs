use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

// The parsed package header. This is the opaque "package metadata" structure
// carried inside every application package as header.toml; the engine only
// interprets the fields it needs for installation and hands the rest through
// to the acknowledging caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageHeader {
    pub application_id: String,
    pub version: String,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    // name of the mountable image file inside content/, for packages that
    // install to removable media as a loopback image
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub content_sha256: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_signed: BTreeMap<String, String>,
}

impl PackageHeader {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let header: Self = toml::from_str(input).context("failed to parse package header")?;
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(reason) = is_valid_application_id(&self.application_id) {
            return Err(anyhow!(
                "the identifier '{}' is not a valid application id: {reason}",
                self.application_id
            ));
        }
        if self.version.trim().is_empty() {
            return Err(anyhow!(
                "the 'version' field must not be empty on application {}",
                self.application_id
            ));
        }
        if self.content_sha256.trim().is_empty() {
            return Err(anyhow!(
                "the 'content_sha256' field must not be empty on application {}",
                self.application_id
            ));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.names
            .get("en")
            .map(String::as_str)
            .unwrap_or(&self.application_id)
    }
}

// Application ids double as directory names, and inode names are limited to
// 255 characters on Linux; keep a safety margin for prefixes and suffixes.
const MAX_APPLICATION_ID_LENGTH: usize = 150;

const FORBIDDEN_ID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub fn is_valid_application_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("must not be empty".to_string());
    }
    if id.len() > MAX_APPLICATION_ID_LENGTH {
        return Err(format!(
            "the maximum length is {MAX_APPLICATION_ID_LENGTH} characters (found {} characters)",
            id.len()
        ));
    }

    let mut space_only = true;
    for ch in id.chars() {
        let code = ch as u32;
        if code < 0x20 || code > 0x7f || FORBIDDEN_ID_CHARS.contains(&ch) {
            return Err(format!(
                "must consist of printable ASCII characters only, except any of '{}'",
                FORBIDDEN_ID_CHARS.iter().collect::<String>()
            ));
        }
        if space_only {
            space_only = ch.is_whitespace();
        }
    }
    if space_only {
        return Err("must not consist of only white-space characters".to_string());
    }

    Ok(())
}
