use std::borrow::Cow;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::config::{Mode, Role};

/// Interpret a buffer as a NUL-terminated string.
pub fn message_of(buf: &[u8]) -> Cow<'_, str> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end])
}

fn as_nanos<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

fn as_message<S: Serializer>(buf: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&message_of(buf))
}

/// Outcome of a run on one side.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub mode: Mode,
    pub role: Role,

    /// Completed post+poll cycles.
    pub iterations: u32,

    /// Time spent polling for completions.
    #[serde(rename = "elapsed_ns", serialize_with = "as_nanos")]
    pub elapsed: Duration,

    /// The registered buffer at the end of the transfer.
    #[serde(rename = "message", serialize_with = "as_message")]
    pub buffer: Vec<u8>,
}

impl Report {
    /// Get the buffer up to its first NUL.
    pub fn message(&self) -> Cow<'_, str> {
        message_of(&self.buffer)
    }

    /// Average polling time of one cycle.
    pub fn latency(&self) -> Option<Duration> {
        (self.iterations > 0).then(|| self.elapsed / self.iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_output() {
        let report = Report {
            mode: Mode::Send,
            role: Role::Client,
            iterations: 4,
            elapsed: Duration::from_nanos(4000),
            buffer: b"hi\0junk".to_vec(),
        };
        assert_eq!(report.message(), "hi");
        assert_eq!(report.latency(), Some(Duration::from_nanos(1000)));

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "send");
        assert_eq!(json["role"], "client");
        assert_eq!(json["iterations"], 4);
        assert_eq!(json["elapsed_ns"], 4000);
        assert_eq!(json["message"], "hi");
    }

    #[test]
    fn message_without_nul() {
        assert_eq!(message_of(b"abc"), "abc");
        assert_eq!(message_of(b""), "");
    }
}
