//! grouter Core - Protocol-Agnostic Request Router
//!
//! Accepts client connections speaking a "source" protocol, turns client
//! operations into uniform [`Request`] records and forwards them in batches
//! to a pluggable "target" backend, returning each backend response to the
//! client that asked.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Dispatcher                             │
//! │                                                                  │
//! │  clients                                                         │
//! │    │                                                             │
//! │    ▼                                                             │
//! │  ┌────────────────────┐     ┌───────────────┐                    │
//! │  │ Admission          │     │ Workload      │                    │
//! │  │ (≤ max_conns)      │     │ (synthetic)   │                    │
//! │  │  └─► AsciiSource   │     │               │                    │
//! │  └─────────┬──────────┘     └───────┬───────┘                    │
//! │            │   submit(Batch)        │                            │
//! │            └───────────┬────────────┘                            │
//! │                        ▼                                         │
//! │              ┌───────────────────┐                               │
//! │              │  Routing Queue    │  bounded: the only            │
//! │              │  (capacity C)     │  backpressure point           │
//! │              └─────────┬─────────┘                               │
//! │                        │ take()                                  │
//! │            ┌───────────┴───────────┐                             │
//! │            ▼                       ▼                             │
//! │     TargetWorker 0   ...    TargetWorker N-1                     │
//! │            │  Backoff::connect     │                             │
//! │            ▼                       ▼                             │
//! │     memory / memcached-ascii / memcached-binary                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each request carries a private one-shot response channel; the target
//! that executes it writes the outcome exactly once and the originating
//! source reads it.
//!
//! # Module Overview
//!
//! - [`admission`]: bounded-concurrency accept loop
//! - [`backoff`]: capped exponential-backoff connector
//! - [`config`]: TOML configuration and CLI overrides
//! - [`dispatch`]: kind registry and the [`Dispatcher`]
//! - [`error`]: error types
//! - [`protocol`]: memcached ascii and binary codecs
//! - [`queue`]: the routing queue
//! - [`request`]: request records, commands and responses
//! - [`source`]: the producing side (ascii clients, workload)
//! - [`stats`]: counter sink and collector
//! - [`target`]: the consuming side (memory, memcached)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod request;
pub mod source;
pub mod stats;
pub mod target;

pub use admission::{accept_conns, bind, ConnectionId, Listener};
pub use backoff::Backoff;
pub use config::{
    load_config, load_config_from_path, ConfigError, ConfigOverrides, RouterConfig, StatsConfig,
    WorkloadConfig,
};
pub use dispatch::{Dispatcher, Registry, SourceSpec, TargetSpec};
pub use error::{BackendError, QueueClosed, RouterError, SourceError};
pub use queue::{routing_queue, QueueReceiver, QueueSender};
pub use request::{Batch, Command, Opcode, Outcome, PendingResponse, Request, Response, Status};
pub use source::{AsciiSource, Connection, Source, WorkloadSource};
pub use stats::{stats_channel, StatsCollector, StatsSample, StatsSink};
pub use target::{Backend, Dialer, TargetWorker};
