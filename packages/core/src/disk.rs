//! Host disk probing using lsblk.
//!
//! Probes are read-only and bypass the guarded executor; they never change
//! host state.

use std::process::Command;

use serde::Deserialize;

use crate::error::{CommandExitSnafu, CommandSpawnSnafu, LsblkParseSnafu, ProbeOutputSnafu, Result};
use snafu::ResultExt;

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

fn run_lsblk(args: &[&str]) -> Result<LsblkOutput> {
    let command = format!("lsblk {}", args.join(" "));
    let output = Command::new("lsblk")
        .args(args)
        .output()
        .context(CommandSpawnSnafu {
            command: command.clone(),
        })?;

    if !output.status.success() {
        return CommandExitSnafu {
            command,
            code: output.status.code().unwrap_or(-1),
        }
        .fail();
    }

    serde_json::from_slice(&output.stdout).map_err(|e| {
        LsblkParseSnafu {
            message: e.to_string(),
        }
        .build()
    })
}

/// Filesystem UUID of a device node (e.g. `/dev/sdb1`, `/dev/mapper/dongleboot`).
pub fn uuid_by_dev(device: &str) -> Result<String> {
    let parsed = run_lsblk(&["--json", "--nodeps", "--output", "NAME,UUID", device])?;
    parsed
        .blockdevices
        .first()
        .and_then(|dev| dev.uuid.clone())
        .filter(|uuid| !uuid.is_empty())
        .ok_or_else(|| {
            ProbeOutputSnafu {
                command: format!("lsblk {device}"),
                message: format!("no filesystem UUID reported for {device}"),
            }
            .build()
        })
}

/// Total size of a device in bytes.
pub fn device_size_bytes(device: &str) -> Result<u64> {
    let parsed = run_lsblk(&["--json", "--bytes", "--nodeps", "--output", "NAME,SIZE", device])?;
    parsed
        .blockdevices
        .first()
        .and_then(|dev| dev.size)
        .ok_or_else(|| {
            ProbeOutputSnafu {
                command: format!("lsblk {device}"),
                message: format!("no size reported for {device}"),
            }
            .build()
        })
}

/// Captures the host's filesystem overview (`lsblk -f`) for display.
pub fn filesystem_overview() -> Result<String> {
    let output = Command::new("lsblk")
        .arg("-f")
        .output()
        .context(CommandSpawnSnafu {
            command: "lsblk -f".to_string(),
        })?;

    if !output.status.success() {
        return CommandExitSnafu {
            command: "lsblk -f".to_string(),
            code: output.status.code().unwrap_or(-1),
        }
        .fail();
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_UUID_JSON: &str = r#"{
        "blockdevices": [
            {"name": "sdb1", "uuid": "D0E1-F2A3"}
        ]
    }"#;

    const SAMPLE_SIZE_JSON: &str = r#"{
        "blockdevices": [
            {"name": "sdb", "size": 62109253632}
        ]
    }"#;

    #[test]
    fn test_parse_uuid_from_lsblk_json() {
        let parsed: LsblkOutput = serde_json::from_str(SAMPLE_UUID_JSON).unwrap();
        assert_eq!(parsed.blockdevices[0].uuid.as_deref(), Some("D0E1-F2A3"));
    }

    #[test]
    fn test_parse_size_from_lsblk_json() {
        let parsed: LsblkOutput = serde_json::from_str(SAMPLE_SIZE_JSON).unwrap();
        assert_eq!(parsed.blockdevices[0].size, Some(62_109_253_632));
    }

    #[test]
    fn test_missing_fields_deserialize_as_none() {
        let parsed: LsblkOutput =
            serde_json::from_str(r#"{"blockdevices": [{"name": "sdb"}]}"#).unwrap();
        assert!(parsed.blockdevices[0].uuid.is_none());
        assert!(parsed.blockdevices[0].size.is_none());
    }
}
