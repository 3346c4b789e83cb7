use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ctrl::{ChannelError, MetadataError};
use crate::rdma::context::DeviceError;
use crate::rdma::cq::CompletionError;
use crate::rdma::qp::{PostError, QpTransitionError};
use crate::resources::{ResourceStep, TeardownError};

/// Error type of a run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Creating a local resource failed.
    #[error("failed to {step}")]
    Resource {
        step: ResourceStep,
        #[source]
        source: io::Error,
    },

    #[error("bad connection metadata from the peer")]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    QpTransition(#[from] QpTransitionError),

    #[error(transparent)]
    Post(#[from] PostError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
