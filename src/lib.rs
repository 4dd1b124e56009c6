//! procinfo: process lifecycle monitoring with binary identity enrichment
//!
//! Kernel lifecycle events (fork, exec, spawn, exit) are turned into
//! [`Process`] records carrying the process ancestry and the identity of
//! the executable: content hash, code-signing status, entitlements and
//! Apple / App Store classification.

#![forbid(unsafe_code)]

pub mod ancestry;
pub mod binary;
pub mod builder;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod output;
pub mod process_table;
pub mod procinfo;
pub mod source;

pub use ancestry::AncestryResolver;
pub use binary::{BinaryIdentityResolver, CodesignEvaluator, SignatureReport, TrustEvaluator};
pub use builder::ProcessRecordBuilder;
pub use config::{ConfigError, ProcInfoConfig};
pub use error::{ProcInfoError, Result};
pub use models::{
    Binary, EnrichmentMode, EventType, Pid, Process, RawEvent, SignatureStatus, SigningInfo,
};
pub use procinfo::ProcInfo;
pub use process_table::{ProcessTable, StaticProcessTable, SysinfoProcessTable};
pub use source::{ChannelSource, EventSender, EventSource};
