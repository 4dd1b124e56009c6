//! Binary identity resolution
//!
//! Handles:
//! - Content hashing of executables
//! - Code-signing verdicts through a pluggable trust evaluator
//! - Entitlement extraction
//! - Canonical identifier (signing identifier, else content hash)
//! - Apple / App Store classification
//!
//! The steps are independently callable because most of them cost
//! O(file size) or a round trip to the trust service, and lightweight
//! callers want none of them.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::constants::{MAX_PENDING_EVALUATIONS, SIGNATURE_CACHE_CAPACITY};
use crate::error::{ProcInfoError, Result};
use crate::models::{Binary, EnrichmentMode, FileAttributes, SignatureStatus, SigningInfo};

pub mod bundle;
pub mod codesign;
pub mod entitlements;
pub mod hash;

pub use codesign::{CodesignEvaluator, SignatureReport, TrustEvaluator};

/// Cheap filesystem metadata; None when the file cannot be stat'ed
pub fn file_attributes(path: &Path) -> Option<FileAttributes> {
    let meta = std::fs::metadata(path).ok()?;

    Some(FileAttributes {
        size: meta.len(),
        mode: meta.mode(),
        owner_uid: meta.uid(),
        owner_gid: meta.gid(),
        created: meta.created().ok().map(DateTime::<Utc>::from),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

/// Signing identifier when the signature is valid and carries one, else the hash.
pub fn compose_identifier(signing: &SigningInfo, sha256: &str) -> Option<String> {
    if signing.is_valid() && !signing.signing_identifier.is_empty() {
        Some(signing.signing_identifier.clone())
    } else if !sha256.is_empty() {
        Some(sha256.to_string())
    } else {
        None
    }
}

struct CachedReport {
    report: SignatureReport,
    with_entitlements: bool,
    stored_at: Instant,
}

/// Signature reports keyed by (path, content hash). A changed file hashes
/// differently and always misses; entries expire after `ttl` so that
/// revocations are picked up.
struct SignatureCache {
    ttl: Duration,
    entries: Mutex<HashMap<(PathBuf, String), CachedReport>>,
}

impl SignatureCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, path: &Path, sha256: &str, need_entitlements: bool) -> Option<SignatureReport> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().ok()?;
        let cached = entries.get(&(path.to_path_buf(), sha256.to_string()))?;
        let expired = cached.stored_at.elapsed() > self.ttl;
        if expired || (need_entitlements && !cached.with_entitlements) {
            return None;
        }
        Some(cached.report.clone())
    }

    fn insert(&self, path: &Path, sha256: &str, report: &SignatureReport, with_entitlements: bool) {
        if self.ttl.is_zero() {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() >= SIGNATURE_CACHE_CAPACITY {
            let ttl = self.ttl;
            entries.retain(|_, cached| cached.stored_at.elapsed() <= ttl);
            if entries.len() >= SIGNATURE_CACHE_CAPACITY {
                entries.clear();
            }
        }
        entries.insert(
            (path.to_path_buf(), sha256.to_string()),
            CachedReport {
                report: report.clone(),
                with_entitlements,
                stored_at: Instant::now(),
            },
        );
    }

    fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

/// Counts one running evaluation until dropped
struct PendingSlot(Arc<AtomicUsize>);

impl PendingSlot {
    fn acquire(pending: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        Some(Self(Arc::clone(pending)))
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves the identity and trust status of executables
pub struct BinaryIdentityResolver {
    evaluator: Arc<dyn TrustEvaluator>,
    signing_timeout: Duration,
    cache: SignatureCache,
    spotlight_metadata: bool,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl BinaryIdentityResolver {
    pub fn new(evaluator: Arc<dyn TrustEvaluator>) -> Self {
        Self {
            evaluator,
            signing_timeout: Duration::from_secs(10),
            cache: SignatureCache::new(Duration::from_secs(30)),
            spotlight_metadata: false,
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: MAX_PENDING_EVALUATIONS,
        }
    }

    /// Upper bound on a single trust evaluation; expiry yields `Unknown`
    pub fn with_signing_timeout(mut self, timeout: Duration) -> Self {
        self.signing_timeout = timeout;
        self
    }

    /// How long a verdict stays cached; zero re-verifies every time
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = SignatureCache::new(ttl);
        self
    }

    pub fn with_spotlight_metadata(mut self, enabled: bool) -> Self {
        self.spotlight_metadata = enabled;
        self
    }

    /// Cap on evaluations still running, timed out or not; at least one
    pub fn with_max_pending_evaluations(mut self, limit: usize) -> Self {
        self.max_pending = limit.max(1);
        self
    }

    /// SHA-256 of the file contents
    pub fn hash(&self, path: &Path) -> Result<String> {
        hash::sha256_file(path)
    }

    /// Code-signing verdict. Never fails: evaluator errors, vanished files and
    /// timeouts all produce `Unknown`.
    pub fn signing_info(&self, path: &Path, verify_entitlements: bool) -> SigningInfo {
        self.evaluate(path, verify_entitlements, None).signing
    }

    /// Entitlements of the file; empty if unsigned or none present
    pub fn entitlements(&self, path: &Path) -> HashMap<String, Value> {
        self.evaluate(path, true, None).entitlements
    }

    /// Canonical identity: signing identifier if validly signed, else sha256
    pub fn identifier(&self, path: &Path) -> Result<String> {
        let signing = self.signing_info(path, false);
        if let Some(identifier) = compose_identifier(&signing, "") {
            return Ok(identifier);
        }
        self.hash(path)
    }

    /// Build a binary record with the enrichment `mode` asks for
    pub fn resolve(&self, path: &Path, mode: EnrichmentMode) -> Binary {
        let mut binary = Binary::new(path);
        if mode == EnrichmentMode::Full {
            self.enrich(&mut binary);
        }
        binary
    }

    /// Compute hash, signing info, entitlements, identifier and
    /// classification for a binary record
    pub fn enrich(&self, binary: &mut Binary) {
        if binary.path.as_os_str().is_empty() {
            binary.signing_info = Some(SigningInfo::unknown());
            return;
        }

        match self.hash(&binary.path) {
            Ok(sha256) => binary.sha256 = sha256,
            Err(e) => log::debug!("hash unavailable: {}", e),
        }

        let key = (!binary.sha256.is_empty()).then(|| binary.sha256.clone());
        let report = self.evaluate(&binary.path, true, key.as_deref());

        let located = bundle::locate_bundle(&binary.path);
        let has_store_receipt = located
            .as_ref()
            .map(|bundle| bundle.has_store_receipt)
            .unwrap_or(false);

        binary.is_apple = report.signing.is_apple_signed();
        binary.is_app_store = report.signing.is_app_store_signed(has_store_receipt);
        binary.is_developer_id = report.signing.is_valid() && report.signing.is_developer_id();
        binary.identifier = compose_identifier(&report.signing, &binary.sha256).unwrap_or_default();
        binary.entitlements = report.entitlements;
        binary.signing_info = Some(report.signing);

        if let Some(located) = located {
            binary.icon = located.icon;
            binary.bundle = Some(located.info);
        }
        if self.spotlight_metadata {
            binary.metadata = bundle::spotlight_metadata(&binary.path, self.signing_timeout);
        }
    }

    /// Number of cached signature reports
    pub fn cached_reports(&self) -> usize {
        self.cache.len()
    }

    /// Evaluations whose helper thread has not returned yet
    pub fn pending_evaluations(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn evaluate(
        &self,
        path: &Path,
        include_entitlements: bool,
        sha256: Option<&str>,
    ) -> SignatureReport {
        if let Some(sha256) = sha256 {
            if let Some(report) = self.cache.get(path, sha256, include_entitlements) {
                return report;
            }
        }

        let report = match self.evaluate_with_deadline(path, include_entitlements) {
            Ok(report) => report,
            Err(e @ ProcInfoError::Io { .. }) => {
                log::debug!("signature unavailable: {}", e);
                SignatureReport::unknown()
            }
            Err(e) => {
                log::warn!("signature check degraded to unknown: {}", e);
                SignatureReport::unknown()
            }
        };

        if let Some(sha256) = sha256 {
            if report.signing.status != SignatureStatus::Unknown {
                self.cache.insert(path, sha256, &report, include_entitlements);
            }
        }

        report
    }

    /// Run the evaluator on a helper thread and give up after the signing
    /// timeout. An abandoned evaluation finishes in the background and keeps
    /// its pending slot until then.
    fn evaluate_with_deadline(
        &self,
        path: &Path,
        include_entitlements: bool,
    ) -> Result<SignatureReport> {
        let slot = PendingSlot::acquire(&self.pending, self.max_pending).ok_or_else(|| {
            ProcInfoError::TrustService(format!(
                "{} signature evaluations still running, skipping {}",
                self.max_pending,
                path.display()
            ))
        })?;
        let (tx, rx) = mpsc::channel();
        let evaluator = Arc::clone(&self.evaluator);
        let owned_path = path.to_path_buf();

        thread::Builder::new()
            .name("procinfo-trust".to_string())
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(evaluator.verify_signature(&owned_path, include_entitlements));
            })
            .map_err(|e| ProcInfoError::TrustService(format!("cannot spawn evaluation: {}", e)))?;

        match rx.recv_timeout(self.signing_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ProcInfoError::TrustService(format!(
                "verification of {} timed out after {:.1}s",
                path.display(),
                self.signing_timeout.as_secs_f64()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(ProcInfoError::TrustService(format!(
                "evaluator aborted while verifying {}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Evaluator returning a fixed verdict and counting calls
    struct FixedEvaluator {
        signing: SigningInfo,
        entitlements: HashMap<String, Value>,
        calls: AtomicUsize,
    }

    impl FixedEvaluator {
        fn new(status: SignatureStatus, identifier: &str, authorities: &[&str]) -> Self {
            Self {
                signing: SigningInfo {
                    status,
                    authorities: authorities.iter().map(|a| a.to_string()).collect(),
                    signing_identifier: identifier.to_string(),
                    team_identifier: None,
                },
                entitlements: HashMap::from([(
                    "com.apple.security.app-sandbox".to_string(),
                    Value::Bool(true),
                )]),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TrustEvaluator for FixedEvaluator {
        fn verify_signature(
            &self,
            path: &Path,
            include_entitlements: bool,
        ) -> Result<SignatureReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::metadata(path).map_err(|e| ProcInfoError::io(path.display().to_string(), e))?;
            Ok(SignatureReport {
                signing: self.signing.clone(),
                entitlements: if include_entitlements {
                    self.entitlements.clone()
                } else {
                    HashMap::new()
                },
            })
        }
    }

    struct FailingEvaluator;

    impl TrustEvaluator for FailingEvaluator {
        fn verify_signature(
            &self,
            _path: &Path,
            _include_entitlements: bool,
        ) -> Result<SignatureReport> {
            Err(ProcInfoError::TrustService("service unreachable".to_string()))
        }
    }

    struct SlowEvaluator;

    impl TrustEvaluator for SlowEvaluator {
        fn verify_signature(
            &self,
            _path: &Path,
            _include_entitlements: bool,
        ) -> Result<SignatureReport> {
            thread::sleep(Duration::from_secs(2));
            Ok(SignatureReport {
                signing: SigningInfo::with_status(SignatureStatus::Valid),
                entitlements: HashMap::new(),
            })
        }
    }

    /// Evaluator that overruns short deadlines and counts calls
    struct CountingSlowEvaluator {
        calls: AtomicUsize,
    }

    impl TrustEvaluator for CountingSlowEvaluator {
        fn verify_signature(
            &self,
            _path: &Path,
            _include_entitlements: bool,
        ) -> Result<SignatureReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(500));
            Ok(SignatureReport {
                signing: SigningInfo::with_status(SignatureStatus::Valid),
                entitlements: HashMap::new(),
            })
        }
    }

    fn temp_binary(contents: &[u8]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    fn resolver_with(evaluator: impl TrustEvaluator + 'static) -> BinaryIdentityResolver {
        BinaryIdentityResolver::new(Arc::new(evaluator))
    }

    #[test]
    fn test_identifier_of_signed_binary_is_signing_identifier() {
        let tmp = temp_binary(b"signed binary");
        let resolver = resolver_with(FixedEvaluator::new(
            SignatureStatus::Valid,
            "com.example.app",
            &[],
        ));

        assert_eq!(resolver.identifier(tmp.path()).unwrap(), "com.example.app");
    }

    #[test]
    fn test_identifier_of_unsigned_binary_is_hash() {
        let tmp = temp_binary(b"unsigned binary");
        let resolver = resolver_with(FixedEvaluator::new(SignatureStatus::NotSigned, "", &[]));

        let identifier = resolver.identifier(tmp.path()).unwrap();
        assert_eq!(identifier, resolver.hash(tmp.path()).unwrap());
    }

    #[test]
    fn test_identifier_of_invalid_signature_is_hash() {
        let tmp = temp_binary(b"tampered binary");
        let resolver = resolver_with(FixedEvaluator::new(
            SignatureStatus::Invalid,
            "com.example.app",
            &[],
        ));

        let identifier = resolver.identifier(tmp.path()).unwrap();
        assert_eq!(identifier, resolver.hash(tmp.path()).unwrap());
    }

    #[test]
    fn test_identifier_is_stable() {
        let tmp = temp_binary(b"stable contents");
        let resolver = resolver_with(FixedEvaluator::new(SignatureStatus::NotSigned, "", &[]));

        let first = resolver.identifier(tmp.path()).unwrap();
        let second = resolver.identifier(tmp.path()).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_identifier_of_missing_file_fails() {
        let resolver = resolver_with(FixedEvaluator::new(SignatureStatus::NotSigned, "", &[]));
        let result = resolver.identifier(Path::new("/nonexistent/procinfo/tool"));
        assert!(matches!(result, Err(ProcInfoError::Io { .. })));
    }

    #[test]
    fn test_evaluator_failure_yields_unknown() {
        let tmp = temp_binary(b"anything");
        let resolver = resolver_with(FailingEvaluator);

        let signing = resolver.signing_info(tmp.path(), true);
        assert_eq!(signing.status, SignatureStatus::Unknown);
        assert!(resolver.entitlements(tmp.path()).is_empty());
    }

    #[test]
    fn test_slow_evaluator_times_out_to_unknown() {
        let tmp = temp_binary(b"anything");
        let resolver = resolver_with(SlowEvaluator).with_signing_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let signing = resolver.signing_info(tmp.path(), false);
        assert_eq!(signing.status, SignatureStatus::Unknown);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_timed_out_evaluations_are_capped() {
        let tmp = temp_binary(b"anything");
        let evaluator = Arc::new(CountingSlowEvaluator {
            calls: AtomicUsize::new(0),
        });
        let resolver = BinaryIdentityResolver::new(evaluator.clone())
            .with_signing_timeout(Duration::from_millis(50))
            .with_max_pending_evaluations(1);

        assert_eq!(resolver.signing_info(tmp.path(), false).status, SignatureStatus::Unknown);
        assert_eq!(resolver.pending_evaluations(), 1);

        // The first evaluation still holds the only slot
        assert_eq!(resolver.signing_info(tmp.path(), false).status, SignatureStatus::Unknown);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(800));
        assert_eq!(resolver.pending_evaluations(), 0);
        resolver.signing_info(tmp.path(), false);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lightweight_resolve_skips_expensive_fields() {
        let tmp = temp_binary(b"lightweight");
        let resolver = resolver_with(FixedEvaluator::new(
            SignatureStatus::Valid,
            "com.example.app",
            &[],
        ));

        let binary = resolver.resolve(tmp.path(), EnrichmentMode::Lightweight);
        assert!(binary.sha256.is_empty());
        assert!(binary.signing_info.is_none());
        assert!(binary.entitlements.is_empty());
        assert!(binary.identifier.is_empty());
        assert!(binary.attributes.is_some(), "attributes are always computed");
    }

    #[test]
    fn test_full_resolve_populates_identity() {
        let tmp = temp_binary(b"full");
        let resolver = resolver_with(FixedEvaluator::new(
            SignatureStatus::Valid,
            "com.apple.ls",
            &["Apple Root CA", "Apple Code Signing Certification Authority", "Software Signing"],
        ));

        let binary = resolver.resolve(tmp.path(), EnrichmentMode::Full);
        assert_eq!(binary.sha256.len(), 64);
        assert_eq!(binary.identifier, "com.apple.ls");
        assert_eq!(binary.signing_info.as_ref().unwrap().status, SignatureStatus::Valid);
        assert!(binary.entitlements.contains_key("com.apple.security.app-sandbox"));
        assert!(binary.is_apple);
        assert!(!binary.is_app_store);
        assert!(!binary.is_developer_id);
    }

    #[test]
    fn test_developer_id_binary_is_flagged_and_serialized() {
        let tmp = temp_binary(b"third party");
        let resolver = resolver_with(FixedEvaluator::new(
            SignatureStatus::Valid,
            "com.example.tool",
            &[
                "Apple Root CA",
                "Developer ID Certification Authority",
                "Developer ID Application: Example Corp (ABCDE12345)",
            ],
        ));

        let binary = resolver.resolve(tmp.path(), EnrichmentMode::Full);
        assert!(binary.is_developer_id);
        assert!(!binary.is_apple);

        let json = serde_json::to_value(&binary).unwrap();
        assert_eq!(json["is_developer_id"], Value::Bool(true));
    }

    #[test]
    fn test_invalid_developer_id_signature_is_not_flagged() {
        let tmp = temp_binary(b"tampered");
        let resolver = resolver_with(FixedEvaluator::new(
            SignatureStatus::Invalid,
            "com.example.tool",
            &["Developer ID Application: Example Corp (ABCDE12345)"],
        ));

        let binary = resolver.resolve(tmp.path(), EnrichmentMode::Full);
        assert!(!binary.is_developer_id);
    }

    #[test]
    fn test_full_resolve_of_vanished_file_degrades() {
        let resolver = resolver_with(FixedEvaluator::new(
            SignatureStatus::Valid,
            "com.example.app",
            &[],
        ));

        let missing = Path::new("/nonexistent/procinfo/tool");
        let binary = resolver.resolve(missing, EnrichmentMode::Full);
        assert!(binary.sha256.is_empty());
        assert!(binary.identifier.is_empty());
        assert_eq!(binary.signing_info.unwrap().status, SignatureStatus::Unknown);
    }

    #[test]
    fn test_cache_reuses_verdict_for_same_content() {
        let tmp = temp_binary(b"cached");
        let evaluator = Arc::new(FixedEvaluator::new(
            SignatureStatus::Valid,
            "com.example.app",
            &[],
        ));
        let resolver = BinaryIdentityResolver::new(evaluator.clone());

        let first = resolver.resolve(tmp.path(), EnrichmentMode::Full);
        let second = resolver.resolve(tmp.path(), EnrichmentMode::Full);

        assert_eq!(first.identifier, second.identifier);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_reports(), 1);
    }

    #[test]
    fn test_zero_ttl_reverifies_every_time() {
        let tmp = temp_binary(b"uncached");
        let evaluator = Arc::new(FixedEvaluator::new(
            SignatureStatus::Valid,
            "com.example.app",
            &[],
        ));
        let resolver =
            BinaryIdentityResolver::new(evaluator.clone()).with_cache_ttl(Duration::ZERO);

        resolver.resolve(tmp.path(), EnrichmentMode::Full);
        resolver.resolve(tmp.path(), EnrichmentMode::Full);

        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached_reports(), 0);
    }

    #[test]
    fn test_changed_contents_miss_the_cache() {
        let mut tmp = temp_binary(b"version one");
        let evaluator = Arc::new(FixedEvaluator::new(SignatureStatus::NotSigned, "", &[]));
        let resolver = BinaryIdentityResolver::new(evaluator.clone());

        let before = resolver.resolve(tmp.path(), EnrichmentMode::Full);
        tmp.write_all(b" and version two").unwrap();
        tmp.flush().unwrap();
        let after = resolver.resolve(tmp.path(), EnrichmentMode::Full);

        assert_ne!(before.identifier, after.identifier);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_compose_identifier() {
        let mut signing = SigningInfo::with_status(SignatureStatus::Valid);
        assert_eq!(compose_identifier(&signing, "abc"), Some("abc".to_string()));

        signing.signing_identifier = "com.example.app".to_string();
        assert_eq!(compose_identifier(&signing, "abc"), Some("com.example.app".to_string()));

        let unknown = SigningInfo::unknown();
        assert_eq!(compose_identifier(&unknown, ""), None);
    }

    #[test]
    fn test_file_attributes_of_temp_file() {
        let tmp = temp_binary(b"12345");
        let attributes = file_attributes(tmp.path()).unwrap();
        assert_eq!(attributes.size, 5);
        assert!(attributes.modified.is_some());
    }
}
