//! Wire protocol between the engine and its worker processes.
//!
//! Frames are length-prefixed key/value maps: a little-endian u32 payload
//! length, then for each pair a u16 key length, a u32 value length, and the
//! raw bytes. The encoding is internal to fleetmon; both ends are this
//! binary.

use std::io::{self, Read, Write};

use crate::core::errors::{FmError, Result};

/// Upper bound on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Well-known frame keys.
pub mod key {
    /// Frame discriminator: `register`, `job`, or `reply`.
    pub const KIND: &str = "kind";
    /// Worker-scoped job id.
    pub const JOB_ID: &str = "job_id";
    /// Command line to execute.
    pub const COMMAND: &str = "command";
    /// Job deadline in seconds.
    pub const TIMEOUT: &str = "timeout";
    /// Worker name.
    pub const NAME: &str = "name";
    /// Worker pid.
    pub const PID: &str = "pid";
    /// Concurrent job capacity.
    pub const MAX_JOBS: &str = "max_jobs";
    /// Job start, epoch seconds with fraction.
    pub const START: &str = "start";
    /// Job stop, epoch seconds with fraction.
    pub const STOP: &str = "stop";
    /// Process exited normally.
    pub const EXITED_OK: &str = "exited_ok";
    /// Job was killed at its deadline.
    pub const EARLY_TIMEOUT: &str = "early_timeout";
    /// Exit code when exited normally.
    pub const EXIT_CODE: &str = "exit_code";
    /// Terminating signal, when signalled.
    pub const SIGNAL: &str = "signal";
    /// Captured stdout.
    pub const OUTSTD: &str = "outstd";
    /// Captured stderr.
    pub const OUTERR: &str = "outerr";
    /// Worker-side error description, when the job never ran properly.
    pub const ERROR_MSG: &str = "error_msg";
}

/// Frame kind values.
pub mod kind {
    /// First frame a worker sends.
    pub const REGISTER: &str = "register";
    /// Engine-to-worker job submission.
    pub const JOB: &str = "job";
    /// Worker-to-engine job outcome.
    pub const REPLY: &str = "reply";
}

/// An ordered key/value frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvFrame {
    pairs: Vec<(String, String)>,
}

impl KvFrame {
    /// Empty frame.
    #[must_use]
    pub const fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Append a pair.
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.pairs.push((key.to_string(), value.into()));
    }

    /// First value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the value under `key`, erroring when absent or malformed.
    pub fn require<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        self.get(key)
            .ok_or_else(|| FmError::FrameDecode {
                details: format!("missing key '{key}'"),
            })?
            .parse()
            .map_err(|_| FmError::FrameDecode {
                details: format!("unparseable value for key '{key}'"),
            })
    }

    /// Encode into a byte buffer including the length prefix.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let payload_len: usize = self
            .pairs
            .iter()
            .map(|(k, v)| 2 + 4 + k.len() + v.len())
            .sum();
        let mut buf = Vec::with_capacity(4 + payload_len);
        buf.extend_from_slice(&u32::try_from(payload_len).unwrap_or(u32::MAX).to_le_bytes());
        for (k, v) in &self.pairs {
            buf.extend_from_slice(&u16::try_from(k.len()).unwrap_or(u16::MAX).to_le_bytes());
            buf.extend_from_slice(&u32::try_from(v.len()).unwrap_or(u32::MAX).to_le_bytes());
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        buf
    }

    /// Write the frame to `w` and flush.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.encode())?;
        w.flush()
    }

    /// Read one frame from `r`. `Ok(None)` means clean EOF at a frame
    /// boundary; EOF mid-frame is an error.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match r.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let payload_len = u32::from_le_bytes(len_buf) as usize;
        if payload_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {payload_len} exceeds limit"),
            ));
        }
        let mut payload = vec![0u8; payload_len];
        r.read_exact(&mut payload)?;

        let mut frame = Self::new();
        let mut off = 0usize;
        while off < payload.len() {
            if off + 6 > payload.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated pair header",
                ));
            }
            let klen = u16::from_le_bytes([payload[off], payload[off + 1]]) as usize;
            let vlen = u32::from_le_bytes([
                payload[off + 2],
                payload[off + 3],
                payload[off + 4],
                payload[off + 5],
            ]) as usize;
            off += 6;
            if off + klen + vlen > payload.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "pair extends past frame end",
                ));
            }
            let k = String::from_utf8_lossy(&payload[off..off + klen]).into_owned();
            off += klen;
            let v = String::from_utf8_lossy(&payload[off..off + vlen]).into_owned();
            off += vlen;
            frame.pairs.push((k, v));
        }
        Ok(Some(frame))
    }
}

/// A worker's registration announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Worker name.
    pub name: String,
    /// Worker pid.
    pub pid: u32,
    /// Concurrent job capacity.
    pub max_jobs: usize,
}

impl Registration {
    /// Encode as a frame.
    #[must_use]
    pub fn to_frame(&self) -> KvFrame {
        let mut f = KvFrame::new();
        f.push(key::KIND, kind::REGISTER);
        f.push(key::NAME, self.name.clone());
        f.push(key::PID, self.pid.to_string());
        f.push(key::MAX_JOBS, self.max_jobs.to_string());
        f
    }

    /// Decode from a frame.
    pub fn from_frame(frame: &KvFrame) -> Result<Self> {
        Ok(Self {
            name: frame
                .get(key::NAME)
                .unwrap_or("anonymous-worker")
                .to_string(),
            pid: frame.require(key::PID)?,
            max_jobs: frame.require(key::MAX_JOBS)?,
        })
    }
}

/// An engine-to-worker job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Worker-scoped job id.
    pub job_id: u32,
    /// Command line for `/bin/sh -c`.
    pub command: String,
    /// Deadline in seconds.
    pub timeout_s: u64,
}

impl JobSpec {
    /// Encode as a frame.
    #[must_use]
    pub fn to_frame(&self) -> KvFrame {
        let mut f = KvFrame::new();
        f.push(key::KIND, kind::JOB);
        f.push(key::JOB_ID, self.job_id.to_string());
        f.push(key::COMMAND, self.command.clone());
        f.push(key::TIMEOUT, self.timeout_s.to_string());
        f
    }

    /// Decode from a frame.
    pub fn from_frame(frame: &KvFrame) -> Result<Self> {
        Ok(Self {
            job_id: frame.require(key::JOB_ID)?,
            command: frame.get(key::COMMAND).unwrap_or_default().to_string(),
            timeout_s: frame.require(key::TIMEOUT)?,
        })
    }
}

/// A worker-to-engine job outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReply {
    /// Worker-scoped job id.
    pub job_id: u32,
    /// Job start, epoch seconds with fraction.
    pub start: f64,
    /// Job stop, epoch seconds with fraction.
    pub stop: f64,
    /// Process exited normally.
    pub exited_ok: bool,
    /// Job was killed at its deadline.
    pub early_timeout: bool,
    /// Exit code (meaningful when `exited_ok`).
    pub exit_code: i32,
    /// Terminating signal, when signalled.
    pub signal: Option<i32>,
    /// Captured stdout.
    pub outstd: String,
    /// Captured stderr.
    pub outerr: String,
    /// Worker-side failure description.
    pub error_msg: Option<String>,
}

impl JobReply {
    /// Encode as a frame.
    #[must_use]
    pub fn to_frame(&self) -> KvFrame {
        let mut f = KvFrame::new();
        f.push(key::KIND, kind::REPLY);
        f.push(key::JOB_ID, self.job_id.to_string());
        f.push(key::START, format!("{:.6}", self.start));
        f.push(key::STOP, format!("{:.6}", self.stop));
        f.push(key::EXITED_OK, if self.exited_ok { "1" } else { "0" });
        f.push(key::EARLY_TIMEOUT, if self.early_timeout { "1" } else { "0" });
        f.push(key::EXIT_CODE, self.exit_code.to_string());
        if let Some(sig) = self.signal {
            f.push(key::SIGNAL, sig.to_string());
        }
        f.push(key::OUTSTD, self.outstd.clone());
        f.push(key::OUTERR, self.outerr.clone());
        if let Some(msg) = &self.error_msg {
            f.push(key::ERROR_MSG, msg.clone());
        }
        f
    }

    /// Decode from a frame.
    pub fn from_frame(frame: &KvFrame) -> Result<Self> {
        let flag = |k: &str| -> bool { frame.get(k) == Some("1") };
        Ok(Self {
            job_id: frame.require(key::JOB_ID)?,
            start: frame.require(key::START).unwrap_or(0.0),
            stop: frame.require(key::STOP).unwrap_or(0.0),
            exited_ok: flag(key::EXITED_OK),
            early_timeout: flag(key::EARLY_TIMEOUT),
            exit_code: frame.require(key::EXIT_CODE).unwrap_or(-1),
            signal: frame.get(key::SIGNAL).and_then(|s| s.parse().ok()),
            outstd: frame.get(key::OUTSTD).unwrap_or_default().to_string(),
            outerr: frame.get(key::OUTERR).unwrap_or_default().to_string(),
            error_msg: frame.get(key::ERROR_MSG).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_survive_a_pipe() {
        let spec = JobSpec {
            job_id: 7,
            command: "/bin/check_ping -H 10.0.0.1".to_string(),
            timeout_s: 30,
        };
        let mut buf = Vec::new();
        spec.to_frame().write_to(&mut buf).unwrap();

        let mut cur = Cursor::new(buf);
        let frame = KvFrame::read_from(&mut cur).unwrap().unwrap();
        assert_eq!(frame.get(key::KIND), Some(kind::JOB));
        assert_eq!(JobSpec::from_frame(&frame).unwrap(), spec);
        // Clean EOF after the frame.
        assert!(KvFrame::read_from(&mut cur).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let spec = JobSpec {
            job_id: 1,
            command: "x".to_string(),
            timeout_s: 1,
        };
        let buf = spec.to_frame().encode();
        let mut cur = Cursor::new(&buf[..buf.len() - 2]);
        assert!(KvFrame::read_from(&mut cur).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut cur = Cursor::new(buf);
        assert!(KvFrame::read_from(&mut cur).is_err());
    }

    #[test]
    fn reply_round_trip_including_optionals() {
        let reply = JobReply {
            job_id: 3,
            start: 100.5,
            stop: 101.25,
            exited_ok: false,
            early_timeout: true,
            exit_code: -1,
            signal: Some(9),
            outstd: String::new(),
            outerr: "killed".to_string(),
            error_msg: None,
        };
        let decoded = JobReply::from_frame(&reply.to_frame()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn missing_required_key_names_the_key() {
        let mut f = KvFrame::new();
        f.push(key::KIND, kind::REPLY);
        let err = JobReply::from_frame(&f).unwrap_err();
        assert_eq!(err.code(), "FM-3004");
        assert!(err.to_string().contains("job_id"));
    }
}
