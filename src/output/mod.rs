//! Output formatting module
//!
//! Handles:
//! - Human-readable rendering of process and binary records
//! - JSON rendering, one object per record, with ISO 8601 timestamps
//! - Path-prefix filtering of records for the CLI

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;
use time::format_description::well_known::Iso8601;
use time::OffsetDateTime;

use crate::models::{Binary, Process, SignatureStatus};

/// ISO 8601 rendering of a system time
pub fn format_timestamp(timestamp: SystemTime) -> Result<String> {
    OffsetDateTime::from(timestamp)
        .format(&Iso8601::DEFAULT)
        .context("Failed to format timestamp")
}

/// Keep records whose executable lies under one of `prefixes`; no prefixes keeps all
pub fn matches_path_filters(process: &Process, prefixes: &[PathBuf]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|prefix| process.path.starts_with(prefix))
}

/// Render a process record as a single-line JSON object
pub fn format_process_json(process: &Process) -> Result<String> {
    let mut value = serde_json::to_value(process).context("Failed to serialize process")?;
    if let Value::Object(fields) = &mut value {
        fields.insert(
            "timestamp".to_string(),
            Value::String(format_timestamp(process.timestamp)?),
        );
    }
    Ok(value.to_string())
}

/// Render a binary record as a single-line JSON object
pub fn format_binary_json(binary: &Binary) -> Result<String> {
    serde_json::to_string(binary).context("Failed to serialize binary")
}

/// Render a process record for people
pub fn format_process_human(process: &Process) -> Result<String> {
    let kind = process
        .event_type
        .map(|event| event.as_str())
        .unwrap_or("running");
    let name = if process.binary.name.is_empty() {
        "(unknown)"
    } else {
        &process.binary.name
    };

    let mut out = format!(
        "[{}] {}: {} (PID: {}, PPID: {}, UID: {})\n",
        format_timestamp(process.timestamp)?,
        kind,
        name,
        process.pid,
        process.ppid,
        process.uid
    );
    out.push_str(&format!("  Path: {}\n", display_path(&process.path)));
    if !process.arguments.is_empty() {
        out.push_str(&format!("  Arguments: {}\n", process.arguments.join(" ")));
    }
    if let Some(code) = process.exit_code {
        out.push_str(&format!("  Exit code: {}\n", code));
    }

    let ancestors = process
        .ancestors
        .iter()
        .map(|pid| pid.to_string())
        .collect::<Vec<_>>();
    if ancestors.is_empty() {
        out.push_str("  Ancestors: (none)\n");
    } else {
        out.push_str(&format!("  Ancestors: {}\n", ancestors.join(" -> ")));
    }

    out.push_str(&format_identity_lines(&process.binary));
    Ok(out)
}

/// Render a binary record for people
pub fn format_binary_human(binary: &Binary) -> String {
    let mut out = format!("{}:\n", display_path(&binary.path));
    if let Some(attributes) = &binary.attributes {
        out.push_str(&format!(
            "  Size: {} bytes, mode {:o}, owner {}:{}\n",
            attributes.size,
            attributes.mode & 0o7777,
            attributes.owner_uid,
            attributes.owner_gid
        ));
    }
    out.push_str(&format_identity_lines(binary));
    out
}

/// Lines shared by process and binary output; only computed fields are shown
fn format_identity_lines(binary: &Binary) -> String {
    let mut out = String::new();

    if !binary.sha256.is_empty() {
        out.push_str(&format!("  SHA-256: {}\n", binary.sha256));
    }
    if !binary.identifier.is_empty() {
        out.push_str(&format!("  Identifier: {}\n", binary.identifier));
    }
    if let Some(signing) = &binary.signing_info {
        out.push_str(&format!("  Signature: {}\n", status_label(signing.status)));
        if !signing.authorities.is_empty() {
            out.push_str(&format!("  Authorities: {}\n", signing.authorities.join(" > ")));
        }
        if let Some(team) = &signing.team_identifier {
            out.push_str(&format!("  Team: {}\n", team));
        }
        out.push_str(&format!(
            "  Apple: {}, App Store: {}, Developer ID: {}\n",
            yes_no(binary.is_apple),
            yes_no(binary.is_app_store),
            yes_no(binary.is_developer_id)
        ));
    }
    if let Some(bundle) = &binary.bundle {
        out.push_str(&format!("  Bundle: {}", bundle.path.display()));
        if let Some(identifier) = &bundle.identifier {
            out.push_str(&format!(" ({})", identifier));
        }
        out.push('\n');
    }
    if binary.signing_info.is_some() {
        out.push_str(&format_entitlements(&binary.entitlements));
    }

    out
}

fn format_entitlements(entitlements: &HashMap<String, Value>) -> String {
    if entitlements.is_empty() {
        return "  Entitlements: (none)\n".to_string();
    }

    // Sort entitlements for consistent output
    let mut sorted: Vec<_> = entitlements.iter().collect();
    sorted.sort_by_key(|(key, _)| *key);

    let mut out = String::from("  Entitlements:\n");
    for (key, value) in sorted {
        match value {
            Value::String(s) => out.push_str(&format!("    {}: {}\n", key, s)),
            _ => out.push_str(&format!("    {}: {}\n", key, value)),
        }
    }
    out
}

fn status_label(status: SignatureStatus) -> &'static str {
    match status {
        SignatureStatus::Valid => "valid",
        SignatureStatus::Invalid => "invalid",
        SignatureStatus::Untrusted => "untrusted",
        SignatureStatus::NotSigned => "not signed",
        SignatureStatus::Unknown => "unknown",
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn display_path(path: &std::path::Path) -> String {
    if path.as_os_str().is_empty() {
        "(unresolved)".to_string()
    } else {
        path.display().to_string()
    }
}
