use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};

// Bump whenever the serialized shape changes. A report written with any other
// version is treated as unreadable, which routes the owning application into
// the reconciler's removal path instead of guessing at field meanings.
const REPORT_FORMAT_VERSION: u32 = 2;

// The durable record of a completed installation. Written exactly once at
// install commit, next to the application's header.toml, and removed as a
// unit with the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallationReport {
    pub application_id: String,
    pub installation_location_id: String,
    pub disk_space_used: u64,
    pub digest: String,
    pub hardware_id: String,
    // uid allocated for this application when user-id separation is enabled
    pub user_id: Option<u32>,
    pub extra: BTreeMap<String, String>,
    pub extra_signed: BTreeMap<String, String>,
}

impl InstallationReport {
    pub fn serialize(&self) -> String {
        let mut payload = String::new();
        payload.push_str(&format!("format_version={REPORT_FORMAT_VERSION}\n"));
        payload.push_str(&format!("application_id={}\n", self.application_id));
        payload.push_str(&format!(
            "installation_location_id={}\n",
            self.installation_location_id
        ));
        payload.push_str(&format!("disk_space_used={}\n", self.disk_space_used));
        payload.push_str(&format!("digest={}\n", self.digest));
        payload.push_str(&format!("hardware_id={}\n", self.hardware_id));
        if let Some(uid) = self.user_id {
            payload.push_str(&format!("user_id={uid}\n"));
        }
        for (key, value) in &self.extra {
            payload.push_str(&format!("extra.{key}={value}\n"));
        }
        for (key, value) in &self.extra_signed {
            payload.push_str(&format!("extra_signed.{key}={value}\n"));
        }
        payload
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines().map(str::trim).filter(|line| !line.is_empty());

        let Some(first) = lines.next() else {
            return Err(anyhow!("installation report is empty"));
        };
        let version = first
            .strip_prefix("format_version=")
            .ok_or_else(|| anyhow!("installation report does not start with format_version"))?
            .parse::<u32>()
            .context("format_version must be u32")?;
        if version != REPORT_FORMAT_VERSION {
            return Err(anyhow!(
                "unsupported installation report format_version {version} (expected {REPORT_FORMAT_VERSION})"
            ));
        }

        let mut application_id = None;
        let mut installation_location_id = None;
        let mut disk_space_used = None;
        let mut digest = None;
        let mut hardware_id = None;
        let mut user_id = None;
        let mut extra = BTreeMap::new();
        let mut extra_signed = BTreeMap::new();

        for line in lines {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            match k {
                "application_id" => application_id = Some(v.to_string()),
                "installation_location_id" => installation_location_id = Some(v.to_string()),
                "disk_space_used" => {
                    disk_space_used = Some(v.parse().context("disk_space_used must be u64")?)
                }
                "digest" => digest = Some(v.to_string()),
                "hardware_id" => hardware_id = Some(v.to_string()),
                "user_id" => user_id = Some(v.parse().context("user_id must be u32")?),
                _ => {
                    if let Some(key) = k.strip_prefix("extra_signed.") {
                        extra_signed.insert(key.to_string(), v.to_string());
                    } else if let Some(key) = k.strip_prefix("extra.") {
                        extra.insert(key.to_string(), v.to_string());
                    }
                }
            }
        }

        Ok(Self {
            application_id: application_id.context("missing application_id")?,
            installation_location_id: installation_location_id
                .context("missing installation_location_id")?,
            disk_space_used: disk_space_used.context("missing disk_space_used")?,
            digest: digest.context("missing digest")?,
            hardware_id: hardware_id.unwrap_or_default(),
            user_id,
            extra,
            extra_signed,
        })
    }
}
