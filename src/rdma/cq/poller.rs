use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use std::{hint, io, thread};

use log::{debug, error};
use quanta::Instant;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Cq, Wc, WcStatus};
use crate::rdma::type_alias::WrId;

/// Completion polling error type.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The provider failed to poll the CQ.
    #[error("poll CQ failed")]
    Poll(#[source] io::Error),

    /// No completion arrived in time.
    #[error("completion wasn't found in the CQ after {timeout:?} ({polls} polls)")]
    Timeout { timeout: Duration, polls: u64 },

    /// A completion arrived with an error status.
    #[error("got bad completion with status {code:#x} ({status}), vendor syndrome {vendor_err:#x}")]
    Status {
        status: WcStatus,
        code: u32,
        vendor_err: u32,
        wr_id: WrId,
    },
}

/// What a [`Poller`] does between two empty polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Backoff {
    /// Busy poll.
    #[default]
    Spin,

    /// Yield the thread.
    Yield,

    /// Sleep for the given duration.
    Sleep(Duration),
}

impl Backoff {
    #[inline]
    fn pause(self) {
        match self {
            Backoff::Spin => hint::spin_loop(),
            Backoff::Yield => thread::yield_now(),
            Backoff::Sleep(d) => thread::sleep(d),
        }
    }
}

/// `spin`, `yield`, or `sleep:<microseconds>`.
impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spin" => Ok(Backoff::Spin),
            "yield" => Ok(Backoff::Yield),
            _ => s
                .strip_prefix("sleep:")
                .and_then(|us| us.parse::<u64>().ok())
                .map(|us| Backoff::Sleep(Duration::from_micros(us)))
                .ok_or_else(|| format!("invalid backoff `{}`, expected spin, yield or sleep:<us>", s)),
        }
    }
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Spin => f.write_str("spin"),
            Backoff::Yield => f.write_str("yield"),
            Backoff::Sleep(d) => write!(f, "sleep:{}", d.as_micros()),
        }
    }
}

impl TryFrom<String> for Backoff {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Backoff> for String {
    fn from(b: Backoff) -> Self {
        b.to_string()
    }
}

/// Bounded-time completion poller.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    timeout: Duration,
    backoff: Backoff,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT, Backoff::Spin)
    }
}

impl Poller {
    /// The default time to wait for a completion.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

    pub fn new(timeout: Duration, backoff: Backoff) -> Self {
        Self { timeout, backoff }
    }

    /// Poll the CQ until one completion arrives or the timeout elapses.
    ///
    /// A completion with a non-success status is consumed and returned as
    /// [`CompletionError::Status`].
    pub fn poll(&self, cq: &Cq) -> Result<Wc, CompletionError> {
        let start = Instant::now();
        let mut polls = 0u64;
        loop {
            polls += 1;
            match cq.poll_one() {
                Err(e) => {
                    error!("poll CQ failed: {}", e);
                    return Err(CompletionError::Poll(e));
                }
                Ok(Some(wc)) => {
                    debug!("completion was found in CQ after {} poll(s)", polls);
                    if wc.status_code != WcStatus::Success.code() {
                        let err = CompletionError::Status {
                            status: wc.status(),
                            code: wc.status_code,
                            vendor_err: wc.vendor_err,
                            wr_id: wc.wr_id,
                        };
                        error!("{}", err);
                        return Err(err);
                    }
                    return Ok(wc);
                }
                Ok(None) if start.elapsed() >= self.timeout => {
                    error!(
                        "completion wasn't found in the CQ after timeout ({} polls)",
                        polls
                    );
                    return Err(CompletionError::Timeout {
                        timeout: self.timeout,
                        polls,
                    });
                }
                Ok(None) => self.backoff.pause(),
            }
        }
    }
}
