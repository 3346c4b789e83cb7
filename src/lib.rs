//! Point-to-point RDMA over a single reliable-connected queue pair.
//!
//! `rcpair` sets up one RC queue pair between two processes and moves a
//! small message over it with SEND/RECV, RDMA READ or RDMA WRITE. One side
//! listens on a TCP port and the other connects to it; the TCP stream is
//! used to exchange queue pair metadata and to order the two sides with
//! one-byte barriers.
//!
//! RDMA resource holder types ([`Context`], [`Pd`], [`Cq`], [`Mr`], and
//! [`Qp`]) release their resources when dropped, and every resource keeps
//! the resources it was created from alive. The verbs themselves go through
//! a [`Provider`]: [`SoftFabric`] runs everything in-process, and
//! `VerbsProvider` (with the `verbs` feature) drives real NICs through
//! `libibverbs`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rcpair::{bench, Config, Mode, SoftFabric};
//!
//! fn main() -> rcpair::Result<()> {
//!     let cfg = Config {
//!         server_name: Some("10.0.2.1".to_owned()),
//!         mode: Mode::Write,
//!         ..Config::default()
//!     };
//!     let report = bench::run(&cfg, Arc::new(SoftFabric::new()))?;
//!     println!("{} iteration(s) in {:?}", report.iterations, report.elapsed);
//!     Ok(())
//! }
//! ```

#[macro_use]
mod utils;

#[cfg(feature = "verbs")]
mod bindings;

pub mod bench;
pub mod config;
pub mod ctrl;
pub mod error;
pub mod rdma;
pub mod resources;

pub use bench::Report;
pub use config::{Config, Mode, Role};
pub use error::{Error, Result};
pub use rdma::gid::Gid;
pub use rdma::provider::{Provider, SoftFabric};
#[cfg(feature = "verbs")]
pub use rdma::provider::VerbsProvider;
pub use rdma::{context::Context, cq::*, mr::*, pd::Pd, qp::*, wr::*};
pub use resources::Resources;
