//! Request Records
//!
//! The uniform unit of work flowing through the router. A source decodes a
//! client operation into a [`Command`], wraps it in a [`Request`] together
//! with the bucket it targets, and submits it (inside a [`Batch`]) to the
//! routing queue. Whichever target takes the batch answers every request
//! exactly once through the request's private response channel.
//!
//! # Response Channel
//!
//! ```text
//!   Source                                     Target
//!     │  Request::new() ──► (Request, PendingResponse)
//!     │                         │
//!     │        submit(batch) ───┼──────────────► take()
//!     │                         │                  │ execute
//!     │  PendingResponse::wait ◄┼──────────────── Request::respond(outcome)
//! ```
//!
//! [`Request::respond`] consumes the request, so a second write cannot be
//! expressed. A request dropped without an answer resolves the pending side
//! to [`BackendError::NoResponse`] instead of leaving the source blocked.

use std::fmt;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::BackendError;

/// Operations understood by every source and target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Fetch a value
    Get,
    /// Store unconditionally (or conditionally on `cas`)
    Set,
    /// Store only if the key is absent
    Add,
    /// Store only if the key is present
    Replace,
    /// Append to an existing value
    Append,
    /// Prepend to an existing value
    Prepend,
    /// Remove a key
    Delete,
    /// Increment a decimal value
    Incr,
    /// Decrement a decimal value (floors at zero)
    Decr,
    /// Ask the backend for its version string
    Version,
    /// Do nothing
    #[default]
    Noop,
}

impl Opcode {
    /// Commands that carry a value to store
    #[must_use]
    pub fn is_storage(self) -> bool {
        matches!(
            self,
            Self::Set | Self::Add | Self::Replace | Self::Append | Self::Prepend
        )
    }

    /// Commands that carry a delta
    #[must_use]
    pub fn is_arithmetic(self) -> bool {
        matches!(self, Self::Incr | Self::Decr)
    }

    /// The ascii protocol name of this operation
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Delete => "delete",
            Self::Incr => "incr",
            Self::Decr => "decr",
            Self::Version => "version",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded client operation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    /// What to do
    pub opcode: Opcode,
    /// Key the operation applies to (empty for keyless operations)
    pub key: Vec<u8>,
    /// Value for storage operations
    pub value: Vec<u8>,
    /// Opaque client flags stored alongside the value
    pub flags: u32,
    /// Expiration time as sent by the client
    pub expiry: u32,
    /// Compare-and-swap token (0 = unconditional)
    pub cas: u64,
    /// Amount for incr/decr
    pub delta: u64,
}

impl Command {
    /// Create a command with no key or value
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            ..Default::default()
        }
    }

    /// Shorthand for a GET of `key`
    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Get).with_key(key)
    }

    /// Shorthand for a SET of `key` to `value`
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Set).with_key(key).with_value(value)
    }

    /// Set the key
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the value
    #[must_use]
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Set the client flags
    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Set the expiration time
    #[must_use]
    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    /// Set the compare-and-swap token
    #[must_use]
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Set the incr/decr amount
    #[must_use]
    pub fn with_delta(mut self, delta: u64) -> Self {
        self.delta = delta;
        self
    }
}

/// Result classes a backend can report for a command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The command did what it was asked
    Success,
    /// Key does not exist
    KeyNotFound,
    /// Key exists (add) or cas mismatch
    KeyExists,
    /// Conditional store did not happen
    NotStored,
    /// incr/decr on a non-numeric value
    DeltaBadValue,
    /// Backend does not know the command
    UnknownCommand,
}

/// A backend's answer to one command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Result class
    pub status: Status,
    /// Value for GET, decimal result for incr/decr, version string for VERSION
    pub value: Vec<u8>,
    /// Client flags of the returned value
    pub flags: u32,
    /// Compare-and-swap token of the returned or stored item
    pub cas: u64,
}

impl Response {
    /// A response with the given status and no payload
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self {
            status,
            value: Vec::new(),
            flags: 0,
            cas: 0,
        }
    }

    /// A successful response with no payload
    #[must_use]
    pub fn success() -> Self {
        Self::new(Status::Success)
    }

    /// Attach a value
    #[must_use]
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Attach client flags
    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Attach a cas token
    #[must_use]
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Whether the status is [`Status::Success`]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// What a target delivers for one request
pub type Outcome = Result<Response, BackendError>;

/// An ordered group of requests; one routing queue element
pub type Batch = Vec<Request>;

/// One client operation on its way to a target
pub struct Request {
    /// Logical namespace the operation targets
    pub bucket: String,
    /// The decoded operation
    pub command: Command,
    /// Identifier of the producing task, for diagnostics
    pub origin: Option<u32>,
    responder: oneshot::Sender<Outcome>,
}

impl Request {
    /// Create a request and the handle its source waits on
    pub fn new(bucket: impl Into<String>, command: Command) -> (Self, PendingResponse) {
        let (responder, rx) = oneshot::channel();
        let request = Self {
            bucket: bucket.into(),
            command,
            origin: None,
            responder,
        };
        (request, PendingResponse { rx })
    }

    /// Tag the request with the id of the task that produced it
    #[must_use]
    pub fn with_origin(mut self, origin: u32) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Deliver the outcome to the waiting source
    ///
    /// Consumes the request: every request is answered at most once. A
    /// source that already went away is not an error for the target.
    pub fn respond(self, outcome: Outcome) {
        if self.responder.send(outcome).is_err() {
            debug!(
                opcode = %self.command.opcode,
                origin = ?self.origin,
                "Response receiver dropped"
            );
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("bucket", &self.bucket)
            .field("command", &self.command)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// The source's end of a request's response channel
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Outcome>,
}

impl PendingResponse {
    /// Wait for the target's outcome
    ///
    /// There is no timeout: a stalled target keeps the caller waiting.
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Err(BackendError::NoResponse))
    }
}
