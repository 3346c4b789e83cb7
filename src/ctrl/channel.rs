use std::io::{self, prelude::*, ErrorKind};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use quanta::Instant;
use thiserror::Error;

use super::meta::ConnMeta;

/// Out-of-band channel error type.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to listen on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept a connection on port {port}")]
    Accept {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve {addr}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("couldn't connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Writing or reading a fixed-size exchange failed, including when the
    /// peer closed the connection midway.
    #[error("failed to sync {len} bytes with the peer")]
    Sync {
        len: usize,
        #[source]
        source: io::Error,
    },
}

/// Write `local` in full, then read exactly `remote.len()` bytes into
/// `remote`, however the stream splits them.
///
/// Both sides call this with buffers of the same length, so neither can block
/// the other: the writes are small enough to sit in the socket buffers.
pub fn sync_data<S: Read + Write>(stream: &mut S, local: &[u8], remote: &mut [u8]) -> io::Result<()> {
    if local.len() != remote.len() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "local and remote buffers differ in length",
        ));
    }
    stream.write_all(local)?;
    stream.flush()?;

    let mut total = 0;
    while total < remote.len() {
        match stream.read(&mut remote[total..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("peer closed the connection after {} of {} bytes", total, remote.len()),
                ))
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Blocking TCP byte stream to the peer, used to exchange connection
/// metadata and one-byte barriers.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
}

impl Channel {
    /// The default TCP port to use.
    pub const DEFAULT_PORT: u16 = 2345;

    /// Interval between two connection attempts.
    const RETRY_INTERVAL: Duration = Duration::from_millis(200);

    /// Listen on all interfaces, accept exactly one connection and close the
    /// listening socket.
    pub fn listen(port: u16) -> Result<Self, ChannelError> {
        let inaddr_any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let listener =
            TcpListener::bind(inaddr_any).map_err(|source| ChannelError::Bind { port, source })?;
        info!("waiting on port {} for TCP connection", port);

        let (stream, peer) = listener
            .accept()
            .map_err(|source| ChannelError::Accept { port, source })?;
        drop(listener);
        info!("TCP connection was established with {}", peer);
        Ok(Self::from_stream(stream))
    }

    /// Connect to `host:port`, trying every resolved address in order.
    ///
    /// Refused connections are retried until `timeout` elapses, so the peer
    /// may start listening a little later.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ChannelError> {
        let addr = format!("{}:{}", host, port);
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| ChannelError::Resolve {
                addr: addr.clone(),
                source,
            })?
            .collect::<Vec<SocketAddr>>();

        let start = Instant::now();
        loop {
            let mut last_err = io::Error::new(ErrorKind::NotFound, "no address resolved");
            for sock_addr in &addrs {
                match TcpStream::connect(sock_addr) {
                    Ok(stream) => {
                        info!("TCP connection was established with {}", sock_addr);
                        return Ok(Self::from_stream(stream));
                    }
                    Err(e) => {
                        debug!("connect to {} failed: {}", sock_addr, e);
                        last_err = e;
                    }
                }
            }
            if addrs.is_empty() || start.elapsed() >= timeout {
                return Err(ChannelError::Connect {
                    addr,
                    source: last_err,
                });
            }
            thread::sleep(Self::RETRY_INTERVAL);
        }
    }

    /// Connect to `peer` if given, otherwise wait for the peer to connect.
    pub fn establish(peer: Option<&str>, port: u16, timeout: Duration) -> Result<Self, ChannelError> {
        match peer {
            Some(host) => Self::connect(host, port, timeout),
            None => Self::listen(port),
        }
    }

    fn from_stream(stream: TcpStream) -> Self {
        // Barriers are single bytes; do not let Nagle hold them back.
        if let Err(e) = stream.set_nodelay(true) {
            warn!("cannot set TCP_NODELAY: {}", e);
        }
        Self { stream }
    }

    /// Exchange equal-length buffers with the peer. See [`sync_data`].
    pub fn sync(&mut self, local: &[u8], remote: &mut [u8]) -> Result<(), ChannelError> {
        sync_data(&mut self.stream, local, remote).map_err(|source| ChannelError::Sync {
            len: local.len(),
            source,
        })
    }

    /// Rendezvous with the peer by exchanging one byte.
    pub fn barrier(&mut self, tag: u8) -> Result<(), ChannelError> {
        let mut remote = [0u8];
        self.sync(&[tag], &mut remote)?;
        debug!("barrier '{}' passed", tag as char);
        Ok(())
    }

    /// Send local connection metadata and receive the peer's.
    pub fn exchange(&mut self, local: &ConnMeta) -> Result<ConnMeta, ChannelError> {
        let mut remote = [0u8; ConnMeta::WIRE_SIZE];
        self.sync(&local.encode(), &mut remote)?;
        Ok(ConnMeta::decode(&remote))
    }

    /// Shut the connection down. A peer that already went away is not an
    /// error.
    pub fn close(self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}
