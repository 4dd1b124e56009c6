//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procinfo::{
    ChannelSource, EventSender, ProcInfo, ProcInfoConfig, ProcInfoError, SignatureReport,
    SignatureStatus, SigningInfo, StaticProcessTable, TrustEvaluator,
};
use tempfile::NamedTempFile;

/// Trust evaluator with per-path verdicts. Paths without a verdict are
/// reported as not signed; missing files fail like the real evaluator.
#[derive(Default)]
pub struct FakeEvaluator {
    verdicts: HashMap<PathBuf, SignatureReport>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FakeEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed(mut self, path: &Path, identifier: &str, authorities: &[&str]) -> Self {
        let signing = SigningInfo {
            status: SignatureStatus::Valid,
            authorities: authorities.iter().map(|a| a.to_string()).collect(),
            signing_identifier: identifier.to_string(),
            team_identifier: None,
        };
        self.verdicts.insert(
            path.to_path_buf(),
            SignatureReport {
                signing,
                entitlements: HashMap::from([(
                    "com.apple.security.network.client".to_string(),
                    serde_json::Value::Bool(true),
                )]),
            },
        );
        self
    }

    /// Every evaluation sleeps this long first
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl TrustEvaluator for FakeEvaluator {
    fn verify_signature(
        &self,
        path: &Path,
        include_entitlements: bool,
    ) -> procinfo::Result<SignatureReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        std::fs::metadata(path).map_err(|e| ProcInfoError::io(path.display().to_string(), e))?;

        let mut report = self.verdicts.get(path).cloned().unwrap_or_else(|| SignatureReport {
            signing: SigningInfo::with_status(SignatureStatus::NotSigned),
            entitlements: HashMap::new(),
        });
        if !include_entitlements {
            report.entitlements.clear();
        }
        Ok(report)
    }
}

/// A small file standing in for an executable
pub fn fake_executable(contents: &[u8]) -> NamedTempFile {
    let mut tmp = NamedTempFile::new().expect("temp file");
    tmp.write_all(contents).expect("write");
    tmp.flush().expect("flush");
    tmp
}

/// Configuration with short timeouts suitable for tests
pub fn test_config() -> ProcInfoConfig {
    let mut config = ProcInfoConfig::default();
    config.monitor.receive_timeout_ms = 10;
    config.signing.timeout_secs = 2.0;
    config
}

/// Coordinator over a fixed table, fed through a channel
pub fn channel_procinfo(
    table: StaticProcessTable,
    evaluator: FakeEvaluator,
    config: &ProcInfoConfig,
) -> (ProcInfo, EventSender) {
    let (source, sender) = ChannelSource::new();
    let procinfo = ProcInfo::with_components(
        Arc::new(table),
        Arc::new(evaluator),
        Box::new(source),
        config,
    );
    (procinfo, sender)
}
