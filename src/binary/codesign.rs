//! Code-signature verification through the platform `codesign` tool
//!
//! The trust-evaluation service is reached via the [`TrustEvaluator`] trait.
//! [`CodesignEvaluator`] is the host implementation: it asks `codesign`
//! for a verdict, the signing details and the entitlements, each under a
//! deadline so an unresponsive trust service cannot stall the caller.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use wait_timeout::ChildExt;

use crate::binary::entitlements::parse_plist_dict;
use crate::error::{ProcInfoError, Result};
use crate::models::{SignatureStatus, SigningInfo};

/// Verdict plus entitlements for one executable
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureReport {
    pub signing: SigningInfo,
    pub entitlements: HashMap<String, Value>,
}

impl SignatureReport {
    pub fn unknown() -> Self {
        Self {
            signing: SigningInfo::unknown(),
            entitlements: HashMap::new(),
        }
    }
}

/// Backend that verifies code signatures
///
/// Each call runs on its own helper thread. When it misses the signing
/// timeout the caller moves on with `Unknown`, but the thread is not
/// cancelled and keeps running until `verify_signature` returns.
/// Implementations must bound their own work, as [`CodesignEvaluator`]
/// does by killing `codesign` at its deadline. The resolver refuses new
/// evaluations while too many are still running.
pub trait TrustEvaluator: Send + Sync {
    /// Verify the signature of `path`. Entitlements are only extracted when
    /// `include_entitlements` is set.
    fn verify_signature(&self, path: &Path, include_entitlements: bool) -> Result<SignatureReport>;
}

/// Trust evaluation via `/usr/bin/codesign`
#[derive(Debug, Clone)]
pub struct CodesignEvaluator {
    tool: PathBuf,
    deadline: Duration,
}

impl CodesignEvaluator {
    pub fn new(deadline: Duration) -> Self {
        Self {
            tool: PathBuf::from("codesign"),
            deadline,
        }
    }

    /// Use a specific codesign binary
    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self
    }

    fn codesign(&self, args: &[&str], path: &Path) -> Result<Output> {
        let mut command = Command::new(&self.tool);
        command.args(args).arg(path);
        run_with_deadline(command, self.deadline).map_err(|e| {
            ProcInfoError::TrustService(format!(
                "{} on {}: {}",
                self.tool.display(),
                path.display(),
                e
            ))
        })
    }

    fn extract_entitlements(&self, path: &Path) -> HashMap<String, Value> {
        let output = match self.codesign(&["-d", "--entitlements", "-", "--xml"], path) {
            Ok(output) if output.status.success() => output,
            Ok(_) => return HashMap::new(),
            Err(e) => {
                log::debug!("entitlement extraction failed: {}", e);
                return HashMap::new();
            }
        };

        parse_plist_dict(&output.stdout).unwrap_or_else(|e| {
            log::debug!("unparseable entitlements for {}: {}", path.display(), e);
            HashMap::new()
        })
    }
}

impl Default for CodesignEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TrustEvaluator for CodesignEvaluator {
    fn verify_signature(
        &self,
        path: &Path,
        include_entitlements: bool,
    ) -> Result<SignatureReport> {
        std::fs::metadata(path).map_err(|e| ProcInfoError::io(path.display().to_string(), e))?;

        let verify = self.codesign(&["--verify", "--verbose=1"], path)?;
        let verify_stderr = String::from_utf8_lossy(&verify.stderr);
        let status = if verify.status.success() {
            SignatureStatus::Valid
        } else if file_vanished(&verify_stderr) {
            return Err(ProcInfoError::io(
                path.display().to_string(),
                io::Error::new(io::ErrorKind::NotFound, "file vanished during verification"),
            ));
        } else {
            classify_verify_failure(&verify_stderr)
        };

        let mut signing = SigningInfo::with_status(status);
        if status == SignatureStatus::NotSigned {
            return Ok(SignatureReport {
                signing,
                entitlements: HashMap::new(),
            });
        }

        // Details are readable even when the signature does not verify
        let details = self.codesign(&["-d", "--verbose=2"], path)?;
        let details = parse_signature_details(&String::from_utf8_lossy(&details.stderr));
        signing.signing_identifier = details.identifier.unwrap_or_default();
        signing.team_identifier = details.team_identifier;
        signing.authorities = details.authorities_leaf_first.into_iter().rev().collect();

        let entitlements = if include_entitlements {
            self.extract_entitlements(path)
        } else {
            HashMap::new()
        };

        Ok(SignatureReport {
            signing,
            entitlements,
        })
    }
}

/// Fields of interest from `codesign -d --verbose=2`
#[derive(Debug, Default, PartialEq)]
pub struct SignatureDetails {
    pub identifier: Option<String>,
    pub team_identifier: Option<String>,
    /// In the order codesign prints them: leaf first
    pub authorities_leaf_first: Vec<String>,
}

pub fn parse_signature_details(text: &str) -> SignatureDetails {
    let mut details = SignatureDetails::default();

    for line in text.lines().map(str::trim) {
        if let Some(identifier) = line.strip_prefix("Identifier=") {
            details.identifier = Some(identifier.to_string());
        } else if let Some(authority) = line.strip_prefix("Authority=") {
            details.authorities_leaf_first.push(authority.to_string());
        } else if let Some(team) = line.strip_prefix("TeamIdentifier=") {
            if team != "not set" {
                details.team_identifier = Some(team.to_string());
            }
        }
    }

    details
}

/// Map a failed `codesign --verify` diagnostic to a verdict
pub fn classify_verify_failure(stderr: &str) -> SignatureStatus {
    const UNTRUSTED_MARKERS: &[&str] = &[
        "CSSMERR_TP_NOT_TRUSTED",
        "CSSMERR_TP_CERT_REVOKED",
        "CSSMERR_TP_CERT_EXPIRED",
        "not trusted",
        "revoked",
    ];

    if stderr.contains("not signed at all") {
        SignatureStatus::NotSigned
    } else if UNTRUSTED_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        SignatureStatus::Untrusted
    } else {
        SignatureStatus::Invalid
    }
}

fn file_vanished(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
}

/// Run a command, collecting its output, and kill it if it outlives `deadline`.
pub fn run_with_deadline(mut command: Command, deadline: Duration) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain pipes concurrently so a chatty child cannot block on a full pipe
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = thread::spawn(move || read_pipe(stdout));
    let stderr_reader = thread::spawn(move || read_pipe(stderr));

    let Some(status) = child.wait_timeout(deadline)? else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out after {:.1}s", deadline.as_secs_f64()),
        ));
    };

    Ok(Output {
        status,
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
    })
}

fn read_pipe<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}
