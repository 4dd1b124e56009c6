//! Basic Security Module (BSM) audit record decoding
//!
//! Only the tokens that process lifecycle records carry are understood.
//! All multi-byte fields are big-endian. Parsing a record stops at the
//! first unknown token; whatever was decoded before it is kept.

use std::io::{self, Read};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::{AUE_EXEC, AUE_EXECVE, AUE_EXIT, AUE_FORK, AUE_POSIX_SPAWN};
use crate::models::{Pid, RawEvent};

const AUT_TRAILER: u8 = 0x13;
const AUT_HEADER32: u8 = 0x14;
const AUT_HEADER32_EX: u8 = 0x15;
const AUT_PATH: u8 = 0x23;
const AUT_SUBJECT32: u8 = 0x24;
const AUT_PROCESS32: u8 = 0x26;
const AUT_RETURN32: u8 = 0x27;
const AUT_TEXT: u8 = 0x28;
const AUT_ARG32: u8 = 0x2d;
const AUT_EXEC_ARGS: u8 = 0x3c;
const AUT_EXEC_ENV: u8 = 0x3d;
const AUT_ATTR32: u8 = 0x3e;
const AUT_EXIT: u8 = 0x52;
const AUT_ARG64: u8 = 0x71;
const AUT_RETURN64: u8 = 0x72;
const AUT_ATTR64: u8 = 0x73;
const AUT_HEADER64: u8 = 0x74;
const AUT_SUBJECT64: u8 = 0x75;
const AUT_PROCESS64: u8 = 0x77;
const AUT_HEADER64_EX: u8 = 0x79;
const AUT_SUBJECT32_EX: u8 = 0x7a;
const AUT_PROCESS32_EX: u8 = 0x7b;
const AUT_SUBJECT64_EX: u8 = 0x7c;
const AUT_PROCESS64_EX: u8 = 0x7d;

const AU_IPV4: u32 = 4;
const AU_IPV6: u32 = 16;

const TRAILER_MAGIC: u16 = 0xb105;
const TRAILER_LEN: usize = 1 + 2 + 4;
/// 32-bit header plus trailer
const MIN_RECORD_SIZE: u32 = 18 + TRAILER_LEN as u32;
/// Records larger than this are treated as corrupt framing
pub const MAX_RECORD_SIZE: u32 = 1 << 20;
const READ_CHUNK: usize = 64 * 1024;

/// Text of the argument token carrying a new child's pid
const CHILD_PID_ARG: &str = "child PID";

/// Errors decoding a BSM record
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BsmError {
    #[error("record truncated at offset {0}")]
    Truncated(usize),

    #[error("record does not start with a header token (found 0x{0:02x})")]
    NotAHeader(u8),

    #[error("invalid address type {0}")]
    InvalidAddressType(u32),

    #[error("record timestamp {0}s is out of range")]
    InvalidTimestamp(u64),
}

/// Acting process of an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    pub auid: u32,
    pub euid: u32,
    pub ruid: u32,
    pub pid: Pid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub number: u8,
    pub value: u64,
    pub text: String,
}

/// Decoded contents of one audit record
#[derive(Debug, Clone, PartialEq)]
pub struct BsmRecord {
    pub event_code: u16,
    pub timestamp: SystemTime,
    pub subject: Option<Subject>,
    pub arguments: Vec<Argument>,
    pub paths: Vec<PathBuf>,
    pub exec_args: Vec<String>,
    pub exit_status: Option<i32>,
    /// (error number, return value) from the return token
    pub return_value: Option<(u8, u64)>,
    pub texts: Vec<String>,
}

impl BsmRecord {
    fn new(event_code: u16, timestamp: SystemTime) -> Self {
        Self {
            event_code,
            timestamp,
            subject: None,
            arguments: Vec::new(),
            paths: Vec::new(),
            exec_args: Vec::new(),
            exit_status: None,
            return_value: None,
            texts: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.return_value.map(|(errno, _)| errno == 0).unwrap_or(true)
    }

    fn argument(&self, text: &str) -> Option<&Argument> {
        self.arguments.iter().find(|arg| arg.text == text)
    }

    /// Lifecycle event carried by this record. None for failed calls,
    /// non-lifecycle records, and records missing the acting process.
    pub fn to_raw_event(&self) -> Option<RawEvent> {
        if !self.succeeded() {
            return None;
        }
        let subject = self.subject?;

        let event = match self.event_code {
            AUE_FORK | AUE_POSIX_SPAWN => {
                let child = self.argument(CHILD_PID_ARG)?;
                let mut event = RawEvent::new(child.value as Pid, self.event_code)
                    .with_ppid(subject.pid)
                    .with_arguments(self.exec_args.clone());
                event.path = self.paths.first().cloned();
                event
            }
            AUE_EXECVE | AUE_EXEC => {
                let mut event = RawEvent::new(subject.pid, self.event_code)
                    .with_arguments(self.exec_args.clone());
                event.path = self.paths.first().cloned();
                event
            }
            AUE_EXIT => {
                let mut event = RawEvent::new(subject.pid, self.event_code);
                event.exit_status = self.exit_status;
                event
            }
            _ => return None,
        };

        Some(event.with_uid(subject.euid).with_timestamp(self.timestamp))
    }
}

/// Big-endian cursor over a record
struct TokenReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TokenReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BsmError> {
        let end = self.pos.checked_add(n).ok_or(BsmError::Truncated(self.pos))?;
        let slice = self.buf.get(self.pos..end).ok_or(BsmError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BsmError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BsmError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BsmError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, BsmError> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Length-prefixed string; trailing NULs are dropped
    fn counted_string(&mut self) -> Result<String, BsmError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        Ok(c_string(raw))
    }

    /// NUL-terminated string
    fn nul_string(&mut self) -> Result<String, BsmError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(BsmError::Truncated(self.pos))?;
        let raw = self.bytes(len + 1)?;
        Ok(c_string(raw))
    }

    fn address(&mut self) -> Result<(), BsmError> {
        match self.u32()? {
            AU_IPV4 => self.bytes(4).map(|_| ()),
            AU_IPV6 => self.bytes(16).map(|_| ()),
            other => Err(BsmError::InvalidAddressType(other)),
        }
    }

    /// Subject and process tokens share one layout
    fn subject(&mut self, wide_port: bool, extended: bool) -> Result<Subject, BsmError> {
        let auid = self.u32()?;
        let euid = self.u32()?;
        let _egid = self.u32()?;
        let ruid = self.u32()?;
        let _rgid = self.u32()?;
        let pid = self.u32()?;
        let _sid = self.u32()?;
        if wide_port {
            self.u64()?;
        } else {
            self.u32()?;
        }
        if extended {
            self.address()?;
        } else {
            self.u32()?;
        }
        Ok(Subject {
            auid,
            euid,
            ruid,
            pid: pid as Pid,
        })
    }
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn timestamp(secs: u64, millis: u64) -> Result<SystemTime, BsmError> {
    Duration::from_secs(secs)
        .checked_add(Duration::from_millis(millis))
        .and_then(|offset| UNIX_EPOCH.checked_add(offset))
        .ok_or(BsmError::InvalidTimestamp(secs))
}

/// Decode one complete audit record
pub fn parse_record(buf: &[u8]) -> Result<BsmRecord, BsmError> {
    let mut reader = TokenReader::new(buf);

    let id = reader.u8()?;
    let mut record = match id {
        AUT_HEADER32 | AUT_HEADER32_EX | AUT_HEADER64 | AUT_HEADER64_EX => {
            let _size = reader.u32()?;
            let _version = reader.u8()?;
            let event_code = reader.u16()?;
            let _modifier = reader.u16()?;
            if matches!(id, AUT_HEADER32_EX | AUT_HEADER64_EX) {
                reader.address()?;
            }
            let (secs, millis) = if matches!(id, AUT_HEADER32 | AUT_HEADER32_EX) {
                (reader.u32()? as u64, reader.u32()? as u64)
            } else {
                (reader.u64()?, reader.u64()?)
            };
            BsmRecord::new(event_code, timestamp(secs, millis)?)
        }
        other => return Err(BsmError::NotAHeader(other)),
    };

    while !reader.is_empty() {
        match reader.u8()? {
            AUT_SUBJECT32 => record.subject = Some(reader.subject(false, false)?),
            AUT_SUBJECT32_EX => record.subject = Some(reader.subject(false, true)?),
            AUT_SUBJECT64 => record.subject = Some(reader.subject(true, false)?),
            AUT_SUBJECT64_EX => record.subject = Some(reader.subject(true, true)?),
            AUT_PROCESS32 => {
                reader.subject(false, false)?;
            }
            AUT_PROCESS32_EX => {
                reader.subject(false, true)?;
            }
            AUT_PROCESS64 => {
                reader.subject(true, false)?;
            }
            AUT_PROCESS64_EX => {
                reader.subject(true, true)?;
            }
            AUT_ARG32 => {
                let number = reader.u8()?;
                let value = reader.u32()? as u64;
                let text = reader.counted_string()?;
                record.arguments.push(Argument { number, value, text });
            }
            AUT_ARG64 => {
                let number = reader.u8()?;
                let value = reader.u64()?;
                let text = reader.counted_string()?;
                record.arguments.push(Argument { number, value, text });
            }
            AUT_EXEC_ARGS => {
                let count = reader.u32()?;
                for _ in 0..count {
                    record.exec_args.push(reader.nul_string()?);
                }
            }
            AUT_EXEC_ENV => {
                let count = reader.u32()?;
                for _ in 0..count {
                    reader.nul_string()?;
                }
            }
            AUT_PATH => record.paths.push(PathBuf::from(reader.counted_string()?)),
            AUT_ATTR32 => {
                reader.bytes(4 * 4 + 8 + 4)?;
            }
            AUT_ATTR64 => {
                reader.bytes(4 * 4 + 8 + 8)?;
            }
            AUT_EXIT => {
                record.exit_status = Some(reader.u32()? as i32);
                let _ret = reader.u32()?;
            }
            AUT_RETURN32 => {
                let errno = reader.u8()?;
                record.return_value = Some((errno, reader.u32()? as u64));
            }
            AUT_RETURN64 => {
                let errno = reader.u8()?;
                record.return_value = Some((errno, reader.u64()?));
            }
            AUT_TEXT => record.texts.push(reader.counted_string()?),
            AUT_TRAILER => break,
            other => {
                log::debug!("unknown BSM token 0x{:02x} in event {}", other, record.event_code);
                break;
            }
        }
    }

    Ok(record)
}

fn is_header(id: u8) -> bool {
    matches!(id, AUT_HEADER32 | AUT_HEADER32_EX | AUT_HEADER64 | AUT_HEADER64_EX)
}

/// A frame is only accepted when it ends in a trailer that repeats its size
fn has_trailer(frame: &[u8]) -> bool {
    let Some(trailer) = frame.len().checked_sub(TRAILER_LEN).map(|at| &frame[at..]) else {
        return false;
    };
    trailer[0] == AUT_TRAILER
        && u16::from_be_bytes([trailer[1], trailer[2]]) == TRAILER_MAGIC
        && u32::from_be_bytes([trailer[3], trailer[4], trailer[5], trailer[6]]) as usize
            == frame.len()
}

/// Splits a stream of back-to-back audit records into whole records.
///
/// Bytes that do not frame a record (no header, implausible size, missing
/// trailer) are skipped one at a time until the stream lines up again.
pub struct RecordReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
    skipped: usize,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
            skipped: 0,
        }
    }

    /// Next complete record, or `Ok(None)` at end of stream. Only I/O
    /// failures of the underlying reader are errors.
    pub fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.buf.iter().position(|&b| is_header(b)) {
                Some(0) => {}
                Some(at) => self.skip(at),
                None => {
                    self.skip(self.buf.len());
                    if !self.fill(1)? {
                        self.report_skipped();
                        return Ok(None);
                    }
                    continue;
                }
            }

            if !self.fill(5)? {
                self.skip(1);
                continue;
            }
            let size = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
            if !(MIN_RECORD_SIZE..=MAX_RECORD_SIZE).contains(&size) {
                self.skip(1);
                continue;
            }

            let size = size as usize;
            if !self.fill(size)? || !has_trailer(&self.buf[..size]) {
                self.skip(1);
                continue;
            }

            self.report_skipped();
            return Ok(Some(self.buf.drain(..size).collect()));
        }
    }

    /// Buffer at least `n` bytes; false if the stream ends first
    fn fill(&mut self, n: usize) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.buf.len() < n {
            if self.eof {
                return Ok(false);
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(read) => self.buf.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn skip(&mut self, n: usize) {
        self.buf.drain(..n);
        self.skipped += n;
    }

    fn report_skipped(&mut self) {
        if self.skipped > 0 {
            log::warn!("skipped {} bytes of unframed audit data", self.skipped);
            self.skipped = 0;
        }
    }
}
