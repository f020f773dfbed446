//! In-Memory Target
//!
//! A bucket-scoped key/value store shared by every memory target worker.
//! Items carry client flags and a cas token; each successful mutation gives
//! the item a fresh token. Expiration times are accepted and ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Backend, Dialer};
use crate::error::BackendError;
use crate::request::{Command, Opcode, Response, Status};

#[derive(Clone, Debug)]
struct Item {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

/// Shared store behind [`MemoryBackend`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: DashMap<(String, Vec<u8>), Item>,
    next_cas: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items across all buckets
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn fresh_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Apply `command` to `bucket`
    pub fn apply(&self, bucket: &str, command: &Command) -> Response {
        let key = (bucket.to_owned(), command.key.clone());

        match command.opcode {
            Opcode::Get => match self.items.get(&key) {
                Some(item) => Response::success()
                    .with_value(item.value.clone())
                    .with_flags(item.flags)
                    .with_cas(item.cas),
                None => Response::new(Status::KeyNotFound),
            },
            Opcode::Set | Opcode::Add | Opcode::Replace => self.store(key, command),
            Opcode::Append | Opcode::Prepend => match self.items.entry(key) {
                Entry::Occupied(mut entry) => {
                    let cas = self.fresh_cas();
                    let item = entry.get_mut();
                    if command.opcode == Opcode::Append {
                        item.value.extend_from_slice(&command.value);
                    } else {
                        let mut value = command.value.clone();
                        value.extend_from_slice(&item.value);
                        item.value = value;
                    }
                    item.cas = cas;
                    Response::success().with_cas(cas)
                }
                Entry::Vacant(_) => Response::new(Status::NotStored),
            },
            Opcode::Delete => match self.items.remove(&key) {
                Some(_) => Response::success(),
                None => Response::new(Status::KeyNotFound),
            },
            Opcode::Incr | Opcode::Decr => self.arithmetic(key, command),
            Opcode::Version => Response::success().with_value(env!("CARGO_PKG_VERSION")),
            Opcode::Noop => Response::success(),
        }
    }

    fn store(&self, key: (String, Vec<u8>), command: &Command) -> Response {
        let item = |cas| Item {
            value: command.value.clone(),
            flags: command.flags,
            cas,
        };

        match self.items.entry(key) {
            Entry::Occupied(mut entry) => {
                if command.opcode == Opcode::Add {
                    return Response::new(Status::NotStored);
                }
                if command.cas != 0 && entry.get().cas != command.cas {
                    return Response::new(Status::KeyExists);
                }
                let cas = self.fresh_cas();
                entry.insert(item(cas));
                Response::success().with_cas(cas)
            }
            Entry::Vacant(entry) => {
                if command.cas != 0 {
                    return Response::new(Status::KeyNotFound);
                }
                if command.opcode == Opcode::Replace {
                    return Response::new(Status::NotStored);
                }
                let cas = self.fresh_cas();
                entry.insert(item(cas));
                Response::success().with_cas(cas)
            }
        }
    }

    fn arithmetic(&self, key: (String, Vec<u8>), command: &Command) -> Response {
        let Entry::Occupied(mut entry) = self.items.entry(key) else {
            return Response::new(Status::KeyNotFound);
        };

        let current = std::str::from_utf8(&entry.get().value)
            .ok()
            .and_then(|s| s.trim_end().parse::<u64>().ok());
        let Some(current) = current else {
            return Response::new(Status::DeltaBadValue);
        };

        let next = if command.opcode == Opcode::Incr {
            current.wrapping_add(command.delta)
        } else {
            current.saturating_sub(command.delta)
        };
        let digits = next.to_string();
        let cas = self.fresh_cas();

        let item = entry.get_mut();
        item.value = digits.clone().into_bytes();
        item.cas = cas;
        Response::success().with_value(digits).with_cas(cas)
    }
}

/// A memory target "connection": a handle on the shared store
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
}

impl MemoryBackend {
    /// Wrap a shared store
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn execute(&mut self, bucket: &str, command: &Command) -> Result<Response, BackendError> {
        Ok(self.store.apply(bucket, command))
    }
}

/// Hands out [`MemoryBackend`]s over one shared store; never fails
#[derive(Clone, Debug, Default)]
pub struct MemoryDialer {
    store: Arc<MemoryStore>,
}

impl MemoryDialer {
    /// Dial into `store`
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// The store every dialed backend shares
    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Backend = MemoryBackend;

    fn endpoint(&self) -> &str {
        "memory"
    }

    async fn dial(&self) -> Result<MemoryBackend, BackendError> {
        Ok(MemoryBackend::new(Arc::clone(&self.store)))
    }
}
