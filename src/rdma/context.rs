use std::sync::Arc;
use std::{fmt, io};

use log::{info, warn};
use thiserror::Error;

use super::gid::Gid;
use super::nic::{PortAttr, PortState};
use super::provider::{CtxHandle, Provider};
use super::type_alias::*;

/// Device lookup and query error type.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The provider failed to enumerate devices.
    #[error("failed to get IB devices list")]
    List(#[source] io::Error),

    /// No device with the requested name, or no device at all.
    #[error("IB device {} wasn't found", .0.as_deref().unwrap_or("(any)"))]
    NotFound(Option<String>),

    #[error("failed to open device {name}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to query port {port}")]
    QueryPort {
        port: PortNum,
        #[source]
        source: io::Error,
    },

    #[error("port {port} is not active ({state:?})")]
    PortNotActive { port: PortNum, state: PortState },

    #[error("failed to query GID index {index} of port {port}")]
    QueryGid {
        port: PortNum,
        index: GidIndex,
        #[source]
        source: io::Error,
    },
}

/// Ownership holder of an opened device.
struct ContextInner {
    provider: Arc<dyn Provider>,
    ctx: CtxHandle,
    name: String,
    port_num: PortNum,
    port_attr: PortAttr,
    closed: bool,
}

impl ContextInner {
    fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.provider.close_device(self.ctx)
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.provider.close_device(self.ctx) {
                warn!("cannot close device {} on drop: {}", self.name, e);
            }
        }
    }
}

/// Device context.
///
/// This type is a simple wrapper of an `Arc`. Every resource created from a
/// context holds a clone of it, so the device is closed only after all of
/// them are gone.
///
/// Rather than a pure device handle, a context also remembers one port and
/// its attributes, queried when the context is opened.
#[derive(Clone)]
#[repr(transparent)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("port_num", &self.inner.port_num)
            .field("lid", &self.inner.port_attr.lid)
            .finish()
    }
}

impl Context {
    /// Open a device and query the attributes of the given port.
    ///
    /// If `dev_name` is `None`, the first device found is used. Otherwise, the
    /// device with the given name is used.
    pub fn open(
        provider: Arc<dyn Provider>,
        dev_name: Option<&str>,
        port_num: PortNum,
    ) -> Result<Self, DeviceError> {
        let names = provider.device_names().map_err(DeviceError::List)?;
        info!("found {} device(s)", names.len());

        let name = match dev_name {
            Some(want) => names.iter().find(|name| *name == want),
            None => names.first(),
        }
        .cloned()
        .ok_or_else(|| DeviceError::NotFound(dev_name.map(String::from)))?;

        let ctx = provider
            .open_device(&name)
            .map_err(|source| DeviceError::Open {
                name: name.clone(),
                source,
            })?;

        let port_attr = match provider.query_port(ctx, port_num) {
            Ok(attr) if attr.state == PortState::Active => Ok(attr),
            Ok(attr) => Err(DeviceError::PortNotActive {
                port: port_num,
                state: attr.state,
            }),
            Err(source) => Err(DeviceError::QueryPort {
                port: port_num,
                source,
            }),
        };
        let port_attr = match port_attr {
            Ok(attr) => attr,
            Err(e) => {
                if let Err(close_err) = provider.close_device(ctx) {
                    warn!("cannot close device {} after failure: {}", name, close_err);
                }
                return Err(e);
            }
        };
        info!(
            "opened device {} via {}, port {} LID {:#x} MTU {}",
            name,
            provider.name(),
            port_num,
            port_attr.lid,
            port_attr.active_mtu
        );

        Ok(Context {
            inner: Arc::new(ContextInner {
                provider,
                ctx,
                name,
                port_num,
                port_attr,
                closed: false,
            }),
        })
    }

    /// Get the transport provider this device was opened with.
    #[inline]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.inner.provider
    }

    /// Get the provider handle of this context.
    #[inline]
    pub fn handle(&self) -> CtxHandle {
        self.inner.ctx
    }

    /// Get the device name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the port number passed by the user when opening this context.
    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.inner.port_num
    }

    /// Get the attributes of the port, as queried when opening.
    #[inline]
    pub fn port_attr(&self) -> &PortAttr {
        &self.inner.port_attr
    }

    /// Get the LID of the port.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.inner.port_attr.lid
    }

    /// Query the GID at the given index of the port.
    pub fn query_gid(&self, index: GidIndex) -> Result<Gid, DeviceError> {
        self.inner
            .provider
            .query_gid(self.inner.ctx, self.inner.port_num, index)
            .map_err(|source| DeviceError::QueryGid {
                port: self.inner.port_num,
                index,
                source,
            })
    }

    /// Close the device.
    ///
    /// If other resources still hold this context, only this reference is
    /// released; the device is closed when the last one goes away.
    pub fn close(self) -> io::Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.close(),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::provider::{SoftFabric, Verb};

    #[test]
    fn open_by_name_or_first() {
        let fabric = Arc::new(SoftFabric::with_devices(["soft0", "soft1"]));
        let ctx = Context::open(fabric.clone(), None, 1).unwrap();
        assert_eq!(ctx.name(), "soft0");
        let ctx1 = Context::open(fabric.clone(), Some("soft1"), 1).unwrap();
        assert_eq!(ctx1.name(), "soft1");
        assert_ne!(ctx.lid(), ctx1.lid());

        ctx.close().unwrap();
        drop(ctx1);
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn missing_device() {
        let fabric = Arc::new(SoftFabric::new());
        let err = Context::open(fabric.clone(), Some("mlx5_0"), 1).unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(Some(ref n)) if n == "mlx5_0"));

        let empty = Arc::new(SoftFabric::with_devices(Vec::<String>::new()));
        let err = Context::open(empty, None, 1).unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(None)));
        assert_eq!(err.to_string(), "IB device (any) wasn't found");
    }

    #[test]
    fn failed_port_query_closes_device() {
        let fabric = Arc::new(SoftFabric::new());
        fabric.fail_next(Verb::QueryPort, libc::EIO);
        let err = Context::open(fabric.clone(), None, 1).unwrap_err();
        assert!(matches!(err, DeviceError::QueryPort { port: 1, .. }));
        assert_eq!(fabric.live_resources(), 0);

        let err = Context::open(fabric.clone(), None, 2).unwrap_err();
        assert!(matches!(err, DeviceError::QueryPort { port: 2, .. }));
        assert_eq!(fabric.live_resources(), 0);
    }
}
