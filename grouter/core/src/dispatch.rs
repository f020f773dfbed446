//! Dispatcher
//!
//! Turns `KIND[:PARAMS]` specifications into running sources and targets.
//!
//! Kinds are looked up in a [`Registry`], an immutable table built once and
//! passed in explicitly. Every specification is resolved and validated in
//! [`Dispatcher::new`], so a typo fails before any task starts.
//!
//! ```text
//!                ┌──────────── Dispatcher::run ────────────┐
//!                │                                          │
//!   clients ──► source entry point ──► QueueSender          │
//!                │   (admission controller                 │
//!                │    or workload)        │                 │
//!                │                  routing queue (C)       │
//!                │                        │                 │
//!                │            target_workers × TargetWorker ──► backend
//!                └──────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::{accept_conns, bind};
use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::queue::{routing_queue, QueueReceiver};
use crate::source::{AsciiSource, WorkloadSource};
use crate::stats::{stats_channel, DEFAULT_CHANNEL_CAPACITY};
use crate::target::{AsciiDialer, BinaryDialer, Dialer, MemoryDialer, TargetWorker};

// ============================================================================
// Specifications
// ============================================================================

/// Registered source kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// memcached ascii clients over TCP
    MemcachedAscii,
    /// Synthetic GET load
    Workload,
}

/// Registered target kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// In-process key/value store
    Memory,
    /// Remote memcached, ascii protocol
    MemcachedAscii,
    /// Remote memcached, binary protocol
    MemcachedBinary,
}

/// A resolved source specification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    /// Serve memcached ascii clients on `listen` (`HOST:PORT`)
    MemcachedAscii {
        /// Listen address; an empty host means every interface
        listen: String,
    },
    /// Run the synthetic workload
    Workload,
}

/// A resolved target specification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetSpec {
    /// In-process key/value store
    Memory,
    /// Remote memcached at `addr`, ascii protocol
    MemcachedAscii {
        /// `HOST:PORT`
        addr: String,
    },
    /// Remote memcached at `addr`, binary protocol
    MemcachedBinary {
        /// `HOST:PORT`
        addr: String,
    },
}

// ============================================================================
// Registry
// ============================================================================

/// Table of known source and target kinds
#[derive(Clone, Debug)]
pub struct Registry {
    sources: BTreeMap<&'static str, SourceKind>,
    targets: BTreeMap<&'static str, TargetKind>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    /// Every kind this crate implements
    #[must_use]
    pub fn builtin() -> Self {
        let sources = BTreeMap::from([
            ("memcached", SourceKind::MemcachedAscii),
            ("memcached-ascii", SourceKind::MemcachedAscii),
            ("workload", SourceKind::Workload),
        ]);
        let targets = BTreeMap::from([
            ("memory", TargetKind::Memory),
            ("memcached", TargetKind::MemcachedBinary),
            ("memcached-ascii", TargetKind::MemcachedAscii),
            ("memcached-binary", TargetKind::MemcachedBinary),
        ]);
        Self { sources, targets }
    }

    /// Registered source kind names, sorted
    pub fn source_kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sources.keys().copied()
    }

    /// Registered target kind names, sorted
    pub fn target_kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.targets.keys().copied()
    }

    /// Parse and validate a source specification
    ///
    /// # Errors
    ///
    /// [`RouterError::UnknownSourceKind`] or
    /// [`RouterError::MissingListenAddress`].
    pub fn resolve_source(&self, spec: &str) -> Result<SourceSpec, RouterError> {
        let (kind, params) = split_spec(spec);
        match self.sources.get(kind) {
            Some(SourceKind::MemcachedAscii) => match params.filter(|p| is_host_port(p)) {
                Some(listen) => Ok(SourceSpec::MemcachedAscii {
                    listen: listen.to_owned(),
                }),
                None => Err(RouterError::MissingListenAddress(
                    params.unwrap_or_default().to_owned(),
                )),
            },
            Some(SourceKind::Workload) => Ok(SourceSpec::Workload),
            None => Err(RouterError::UnknownSourceKind(spec.to_owned())),
        }
    }

    /// Parse and validate a target specification
    ///
    /// # Errors
    ///
    /// [`RouterError::UnknownTargetKind`] or
    /// [`RouterError::MissingTargetAddress`].
    pub fn resolve_target(&self, spec: &str) -> Result<TargetSpec, RouterError> {
        let (kind, params) = split_spec(spec);
        let addr = || match params.filter(|p| is_host_port(p) && !p.starts_with(':')) {
            Some(addr) => Ok(addr.to_owned()),
            None => Err(RouterError::MissingTargetAddress(
                params.unwrap_or_default().to_owned(),
            )),
        };

        match self.targets.get(kind) {
            Some(TargetKind::Memory) => Ok(TargetSpec::Memory),
            Some(TargetKind::MemcachedAscii) => Ok(TargetSpec::MemcachedAscii { addr: addr()? }),
            Some(TargetKind::MemcachedBinary) => Ok(TargetSpec::MemcachedBinary { addr: addr()? }),
            None => Err(RouterError::UnknownTargetKind(spec.to_owned())),
        }
    }
}

fn split_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once(':') {
        Some((kind, params)) => (kind, Some(params)),
        None => (spec, None),
    }
}

fn is_host_port(params: &str) -> bool {
    matches!(params.rsplit_once(':'), Some((_, port)) if !port.is_empty())
}

// ============================================================================
// Dispatcher
// ============================================================================

/// A validated router ready to run
#[derive(Clone, Debug)]
pub struct Dispatcher {
    config: RouterConfig,
    source: SourceSpec,
    target: TargetSpec,
}

impl Dispatcher {
    /// Validate `config` and resolve its specifications against `registry`
    ///
    /// # Errors
    ///
    /// Any configuration or specification error; nothing has been started.
    pub fn new(config: RouterConfig, registry: &Registry) -> Result<Self, RouterError> {
        config.validate()?;
        let source = registry.resolve_source(&config.source)?;
        let target = registry.resolve_target(&config.target)?;
        Ok(Self {
            config,
            source,
            target,
        })
    }

    /// The resolved source
    #[must_use]
    pub fn source(&self) -> &SourceSpec {
        &self.source
    }

    /// The resolved target
    #[must_use]
    pub fn target(&self) -> &TargetSpec {
        &self.target
    }

    /// Run until `cancel` fires or the source entry point fails
    ///
    /// # Errors
    ///
    /// [`RouterError::Bind`] if a network source cannot listen, and whatever
    /// ends the source entry point.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RouterError> {
        let listener = match &self.source {
            SourceSpec::MemcachedAscii { listen } => Some(bind(listen).await?),
            SourceSpec::Workload => None,
        };
        self.run_with(listener, cancel).await
    }

    /// Like [`Dispatcher::run`], serving a network source on an existing
    /// listener instead of binding the configured address
    ///
    /// # Errors
    ///
    /// [`RouterError::ListenerNotUsed`] if the source is not a network
    /// source, otherwise as [`Dispatcher::run`].
    pub async fn run_on(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), RouterError> {
        if self.source == SourceSpec::Workload {
            return Err(RouterError::ListenerNotUsed(self.config.source));
        }
        self.run_with(Some(listener), cancel).await
    }

    async fn run_with(
        self,
        listener: Option<TcpListener>,
        cancel: CancellationToken,
    ) -> Result<(), RouterError> {
        let config = &self.config;
        info!(
            source = %config.source,
            source_max_conns = config.source_max_conns,
            target = %config.target,
            target_queue_capacity = config.target_queue_capacity,
            target_workers = config.target_workers,
            "grouter starting"
        );

        let shutdown = cancel.child_token();
        let (tx, rx) = routing_queue(config.target_queue_capacity)?;
        let (sink, collector) = stats_channel(DEFAULT_CHANNEL_CAPACITY);
        let stats = tokio::spawn(collector.run(config.stats.report_interval(), shutdown.clone()));

        let mut targets = JoinSet::new();
        let workers = config.target_workers;
        match &self.target {
            TargetSpec::Memory => {
                let dialer = MemoryDialer::default();
                spawn_targets(&mut targets, workers, &dialer, &rx, &shutdown);
            }
            TargetSpec::MemcachedAscii { addr } => {
                let dialer = AsciiDialer::new(addr.as_str());
                spawn_targets(&mut targets, workers, &dialer, &rx, &shutdown);
            }
            TargetSpec::MemcachedBinary { addr } => {
                let dialer = BinaryDialer::new(addr.as_str());
                spawn_targets(&mut targets, workers, &dialer, &rx, &shutdown);
            }
        }
        drop(rx);

        let result = match (&self.source, listener) {
            (SourceSpec::MemcachedAscii { .. }, Some(listener)) => {
                let source = Arc::new(AsciiSource::new());
                accept_conns(listener, config.source_max_conns, source, tx, shutdown.clone()).await
            }
            (SourceSpec::MemcachedAscii { listen }, None) => {
                let listener = bind(listen).await?;
                let source = Arc::new(AsciiSource::new());
                accept_conns(listener, config.source_max_conns, source, tx, shutdown.clone()).await
            }
            (SourceSpec::Workload, _) => {
                let workload = WorkloadSource::new(
                    config.workload.clone(),
                    config.workload_workers(),
                    sink,
                );
                workload.run(tx, shutdown.clone()).await.map_err(RouterError::from)
            }
        };

        shutdown.cancel();
        while let Some(joined) = targets.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Target worker failed"),
                Err(e) => warn!(error = %e, "Target worker panicked"),
            }
        }
        if let Err(e) = stats.await {
            warn!(error = %e, "Stats collector panicked");
        }

        info!("grouter stopped");
        result
    }
}

fn spawn_targets<D>(
    tasks: &mut JoinSet<Result<(), RouterError>>,
    workers: usize,
    dialer: &D,
    queue: &QueueReceiver,
    cancel: &CancellationToken,
) where
    D: Dialer + Clone,
{
    for id in 0..workers {
        let worker = TargetWorker::new(id, dialer.clone());
        tasks.spawn(worker.run(queue.clone(), cancel.clone()));
    }
}
