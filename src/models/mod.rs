//! Data models module
//!
//! Defines core data structures:
//! - EventType / RawEvent: Kernel lifecycle notifications before enrichment
//! - Process: Enriched process record delivered to consumers
//! - Binary: Identity and trust status of an executable image
//! - SigningInfo: Code-signing verdict and authority chain
//! - EnrichmentMode: Full vs. lightweight enrichment cost

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::constants::{
    APPLE_ROOT_AUTHORITY, APPLE_SOFTWARE_SIGNING, APP_STORE_SIGNING, AUE_EXEC, AUE_EXECVE,
    AUE_EXIT, AUE_FORK, AUE_POSIX_SPAWN, DEVELOPER_ID_PREFIX,
};
use crate::error::{ProcInfoError, Result};


/// Process identifier, matching the host's pid_t
pub type Pid = i32;

/// Process lifecycle event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Fork,
    Exec,
    Exit,
    Spawn,
}

impl EventType {
    /// Map a raw audit event code to an event type.
    /// Both exec codes (execve and the back-compat exec) map to `Exec`.
    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            AUE_EXIT => Ok(EventType::Exit),
            AUE_FORK => Ok(EventType::Fork),
            AUE_EXECVE | AUE_EXEC => Ok(EventType::Exec),
            AUE_POSIX_SPAWN => Ok(EventType::Spawn),
            code => Err(ProcInfoError::MalformedEvent { code }),
        }
    }

    /// Canonical raw code for this event type
    pub fn code(self) -> u16 {
        match self {
            EventType::Exit => AUE_EXIT,
            EventType::Fork => AUE_FORK,
            EventType::Exec => AUE_EXECVE,
            EventType::Spawn => AUE_POSIX_SPAWN,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Fork => "fork",
            EventType::Exec => "exec",
            EventType::Exit => "exit",
            EventType::Spawn => "spawn",
        }
    }
}

impl TryFrom<u16> for EventType {
    type Error = ProcInfoError;

    fn try_from(code: u16) -> Result<Self> {
        EventType::from_code(code)
    }
}

/// Lifecycle notification as delivered by an event source, before decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub pid: Pid,
    /// Parent pid, when the source reports it
    pub ppid: Option<Pid>,
    pub uid: u32,
    pub event_code: u16,
    pub timestamp: SystemTime,
    pub path: Option<PathBuf>,
    pub arguments: Vec<String>,
    /// Exit status, for exit events
    pub exit_status: Option<i32>,
}

impl RawEvent {
    /// Create a raw event with only the mandatory fields populated
    pub fn new(pid: Pid, event_code: u16) -> Self {
        Self {
            pid,
            ppid: None,
            uid: 0,
            event_code,
            timestamp: SystemTime::now(),
            path: None,
            arguments: Vec::new(),
            exit_status: None,
        }
    }

    pub fn with_ppid(mut self, ppid: Pid) -> Self {
        self.ppid = Some(ppid);
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_exit_status(mut self, status: i32) -> Self {
        self.exit_status = Some(status);
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// How much enrichment to perform per record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentMode {
    /// Hashing, code signing and entitlements always computed
    Full,
    /// Scalars, path and ancestry only
    #[default]
    Lightweight,
}

/// Enriched description of one process lifecycle event or snapshot entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub uid: u32,
    /// None for snapshot entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    /// Only set for exit events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Empty when the executable could not be resolved
    pub path: PathBuf,
    pub arguments: Vec<String>,
    /// Nearest parent first
    pub ancestors: Vec<Pid>,
    pub binary: Binary,
    pub timestamp: SystemTime,
}

/// Basic filesystem metadata of an executable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size: u64,
    /// Permission bits (st_mode)
    pub mode: u32,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// Application bundle enclosing an executable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub path: PathBuf,
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub executable: Option<String>,
}

/// Code-signing verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    Valid,
    Invalid,
    Untrusted,
    NotSigned,
    Unknown,
}

/// Structured code-signing result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInfo {
    pub status: SignatureStatus,
    /// Signer names, root first, leaf last
    pub authorities: Vec<String>,
    /// Empty when the signature carries none
    pub signing_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_identifier: Option<String>,
}

impl SigningInfo {
    /// Verdict for when no trustworthy answer could be obtained
    pub fn unknown() -> Self {
        Self::with_status(SignatureStatus::Unknown)
    }

    pub fn with_status(status: SignatureStatus) -> Self {
        Self {
            status,
            authorities: Vec::new(),
            signing_identifier: String::new(),
            team_identifier: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == SignatureStatus::Valid
    }

    pub fn root_authority(&self) -> Option<&str> {
        self.authorities.first().map(String::as_str)
    }

    pub fn leaf_authority(&self) -> Option<&str> {
        self.authorities.last().map(String::as_str)
    }

    /// Valid signature chained from Apple's root to Apple's own software signing leaf
    pub fn is_apple_signed(&self) -> bool {
        self.is_valid()
            && self.root_authority() == Some(APPLE_ROOT_AUTHORITY)
            && self.leaf_authority() == Some(APPLE_SOFTWARE_SIGNING)
    }

    /// Valid signature from the App Store signing leaf, or a valid signature on a
    /// bundle that carries a store receipt
    pub fn is_app_store_signed(&self, has_store_receipt: bool) -> bool {
        self.is_valid()
            && (self.leaf_authority() == Some(APP_STORE_SIGNING) || has_store_receipt)
    }

    pub fn is_developer_id(&self) -> bool {
        self.leaf_authority()
            .map(|leaf| leaf.starts_with(DEVELOPER_ID_PREFIX))
            .unwrap_or(false)
    }
}

/// Identity and trust status of an executable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binary {
    pub path: PathBuf,
    pub name: String,
    pub attributes: Option<FileAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<PathBuf>,
    /// None until signing has been evaluated
    pub signing_info: Option<SigningInfo>,
    pub entitlements: HashMap<String, serde_json::Value>,
    /// Lowercase hex, empty until computed
    pub sha256: String,
    /// Signing identifier or sha256, empty until computed
    pub identifier: String,
    pub is_apple: bool,
    pub is_app_store: bool,
    /// Valid signature with a Developer ID Application leaf
    pub is_developer_id: bool,
}

impl Binary {
    /// Create a binary record with the cheap fields (name, attributes) filled in
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = binary_name(&path);
        let attributes = if path.as_os_str().is_empty() {
            None
        } else {
            crate::binary::file_attributes(&path)
        };

        Self {
            path,
            name,
            attributes,
            metadata: None,
            bundle: None,
            icon: None,
            signing_info: None,
            entitlements: HashMap::new(),
            sha256: String::new(),
            identifier: String::new(),
            is_apple: false,
            is_app_store: false,
            is_developer_id: false,
        }
    }
}

fn binary_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
