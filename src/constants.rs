//! Global constants for procinfo
//!
//! Centralized location for application-wide constants

/// Application subsystem identifier for macOS Unified Logging System
pub const APP_SUBSYSTEM: &str = "com.procinfo.monitor";

/// Audit event codes from the host kernel's audit_kevents.h.
/// These values are fixed by the kernel ABI.
pub const AUE_EXIT: u16 = 1;
pub const AUE_FORK: u16 = 2;
pub const AUE_EXECVE: u16 = 23;
pub const AUE_EXEC: u16 = 27;
pub const AUE_POSIX_SPAWN: u16 = 43190;

/// Default audit pipe device
pub const DEFAULT_AUDIT_PIPE: &str = "/dev/auditpipe";

/// Decoded audit events held between the pipe reader and the monitor
/// worker; the reader stops reading while the queue is full
pub const AUDIT_QUEUE_CAPACITY: usize = 1024;

/// Polling interval bounds in seconds
pub const POLLING_INTERVAL_MIN: f64 = 0.1;
pub const POLLING_INTERVAL_MAX: f64 = 300.0;

/// Receive timeout bounds in milliseconds
pub const RECEIVE_TIMEOUT_MIN_MS: u64 = 10;
pub const RECEIVE_TIMEOUT_MAX_MS: u64 = 5000;

/// Upper bound on a single trust evaluation, in seconds
pub const SIGNING_TIMEOUT_MAX: f64 = 300.0;

/// Hard cap on ancestry depth, independent of the cycle guard
pub const MAX_ANCESTRY_DEPTH: usize = 4096;

/// Maximum number of cached signature reports
pub const SIGNATURE_CACHE_CAPACITY: usize = 4096;

/// Trust evaluations allowed to run at once, including ones that already
/// missed their deadline
pub const MAX_PENDING_EVALUATIONS: usize = 16;

/// Authority names used for Apple / App Store classification
pub const APPLE_ROOT_AUTHORITY: &str = "Apple Root CA";
pub const APPLE_SOFTWARE_SIGNING: &str = "Software Signing";
pub const APP_STORE_SIGNING: &str = "Apple Mac OS Application Signing";
pub const DEVELOPER_ID_PREFIX: &str = "Developer ID Application:";

/// Store receipt marker, relative to an application bundle
pub const APP_STORE_RECEIPT: &str = "Contents/_MASReceipt/receipt";
