//! Run one side of a transfer from start to end.

mod report;

use std::sync::Arc;
use std::time::Duration;

use log::info;
use quanta::Instant;

pub use self::report::*;
use crate::config::{Config, Mode, Role};
use crate::ctrl;
use crate::error::Result;
use crate::rdma::provider::Provider;
use crate::rdma::wr::WrOpcode;
use crate::resources::Resources;

/// Message of the `send` mode.
pub const MSG: &str = "SEND operation ";

/// Message the server exposes in `read` mode.
pub const RDMA_READ_MSG: &str = "RDMA read operation ";

/// Message the client writes in `write` mode.
pub const RDMA_WRITE_MSG: &str = "RDMA write operation";

/// Barrier tag around RDMA READ iterations.
const READ_TAG: u8 = b'R';

/// Barrier tag around RDMA WRITE iterations.
const WRITE_TAG: u8 = b'W';

/// Copy `msg` into the buffer with a terminating NUL.
fn put_message(buf: &mut [u8], msg: &str) {
    let len = msg.len();
    buf[..len].copy_from_slice(msg.as_bytes());
    buf[len] = 0;
}

/// Post-and-poll `iterations` times, returning the total time spent polling.
fn post_and_poll(res: &Resources, opcode: Option<WrOpcode>, iterations: u32) -> Result<Duration> {
    let mut elapsed = Duration::ZERO;
    for _ in 0..iterations {
        match opcode {
            Some(opcode) => res.post_send(opcode)?,
            None => res.post_receive()?,
        }
        let start = Instant::now();
        res.poll_completion()?;
        elapsed += start.elapsed();
    }
    Ok(elapsed)
}

/// Do the mode-specific part on connected resources.
///
/// Returns the number of post+poll cycles done and the time spent polling.
fn transfer(res: &mut Resources, mode: Mode, role: Role, iterations: u32) -> Result<(u32, Duration)> {
    match (mode, role) {
        (Mode::Send, _) => {
            put_message(res.buf_mut(), MSG);
            let elapsed = post_and_poll(res, Some(WrOpcode::Send), iterations)?;
            info!("RDMA send operation took {} ns", elapsed.as_nanos());
            Ok((iterations, elapsed))
        }
        (Mode::Receive, _) => {
            let elapsed = post_and_poll(res, None, iterations)?;
            info!("Message is: {}", message_of(res.buf()));
            Ok((iterations, elapsed))
        }
        (Mode::Read, Role::Server) => {
            put_message(res.buf_mut(), RDMA_READ_MSG);
            res.channel_mut().barrier(READ_TAG)?;
            res.channel_mut().barrier(READ_TAG)?;
            Ok((0, Duration::ZERO))
        }
        (Mode::Read, Role::Client) => {
            res.channel_mut().barrier(READ_TAG)?;
            let elapsed = post_and_poll(res, Some(WrOpcode::RdmaRead), iterations)?;
            res.channel_mut().barrier(READ_TAG)?;
            info!("Contents of server's buffer: {}", message_of(res.buf()));
            Ok((iterations, elapsed))
        }
        (Mode::Write, Role::Server) => {
            res.channel_mut().barrier(WRITE_TAG)?;
            res.channel_mut().barrier(WRITE_TAG)?;
            info!("Contents of server buffer: {}", message_of(res.buf()));
            Ok((0, Duration::ZERO))
        }
        (Mode::Write, Role::Client) => {
            put_message(res.buf_mut(), RDMA_WRITE_MSG);
            res.channel_mut().barrier(WRITE_TAG)?;
            let elapsed = post_and_poll(res, Some(WrOpcode::RdmaWrite), iterations)?;
            res.channel_mut().barrier(WRITE_TAG)?;
            Ok((iterations, elapsed))
        }
    }
}

/// Run one side: create resources, connect, transfer, and tear down.
///
/// Teardown always runs. If the transfer failed, its error is returned and
/// teardown failures are only logged.
pub fn run(cfg: &Config, provider: Arc<dyn Provider>) -> Result<Report> {
    cfg.validate()?;
    let role = cfg.role();

    let mut res = Resources::create(cfg, provider)?;
    let outcome = ctrl::connect(&mut res, cfg)
        .and_then(|()| transfer(&mut res, cfg.mode, role, cfg.iterations));
    let buffer = res.buf().to_vec();
    let teardown = res.destroy();

    let (iterations, elapsed) = outcome?;
    teardown?;
    Ok(Report {
        mode: cfg.mode,
        role,
        iterations,
        elapsed,
        buffer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_nul_terminated() {
        let mut buf = [0xffu8; 32];
        put_message(&mut buf, RDMA_WRITE_MSG);
        assert_eq!(buf[RDMA_WRITE_MSG.len()], 0);
        assert_eq!(message_of(&buf), RDMA_WRITE_MSG);
    }
}
