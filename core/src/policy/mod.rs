//! The policy interception surface.
//!
//! The broker consults the installed [`Policy`] at two kinds of dispatch
//! points: *security actions* (what to do about a protocol violation) and
//! *artifacts* (typed answers to operational questions such as size limits
//! and permissions). For any given query exactly one answer is returned;
//! there is no chaining or accumulation. [`CasePolicy`] composes policies by
//! connection attribute with a fallback, walking its cases in order.

use crate::conn::{Connection, Event};
use crate::protocol::ErrorCode;

use std::time::Duration;

use bitmask_enum::bitmask;

/// A composite security action. An empty mask means the operation is
/// allowed. `NotAllowed` gates everything else: the report bits
/// (`RaiseWarning`/`RaiseError`; neither set means a bare `ok`) and the
/// side-effect bits (`Halt`, `Block`, `Freeze`).
#[bitmask(u8)]
pub enum Action {
    /// Deny the offending operation (send a report, do nothing else).
    NotAllowed,
    /// Reply `warn <code>` (echo-gated).
    RaiseWarning,
    /// Reply `err <code>` (echo-gated).
    RaiseError,
    /// Terminate the connection immediately.
    Halt,
    /// Signal the transport to block the remote endpoint.
    Block,
    /// Suspend command processing for the policy's freeze duration.
    Freeze,
}

impl Action {
    pub fn allowed() -> Self {
        Self::none()
    }

    pub fn warn_and_ignore() -> Self {
        Self::NotAllowed | Self::RaiseWarning
    }

    pub fn warn_and_freeze() -> Self {
        Self::NotAllowed | Self::RaiseWarning | Self::Freeze
    }

    pub fn error_and_halt() -> Self {
        Self::NotAllowed | Self::RaiseError | Self::Halt
    }

    pub fn error_and_halt_then_block() -> Self {
        Self::error_and_halt() | Self::Block
    }

    /// True if the offending operation must be skipped.
    pub fn denies(&self) -> bool {
        self.intersects(Self::NotAllowed)
    }
}

/// A protocol violation reported to the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    HeaderWrongProtocol,
    HeaderNoName,
    HeaderMalformedHeader,
    HeaderSizeLimitReached,
    MalformedCommand,
    InvalidArgument,
    MalformedRegex,
    TooFrequentTrigger,
    UnpermittedCodeExecution,
    MalformedCode,
    TriggerProhibited { evt: String },
}

/// The pluggable policy. Every method has a permissive default so an
/// implementation overrides only the queries it cares about. Durations and
/// sizes of zero mean "unlimited"/"disabled".
pub trait Policy {
    /// Decides how to react to a protocol violation.
    fn security_action(&self, _conn: &Connection, _event: &SecurityEvent) -> Action {
        Action::warn_and_ignore()
    }

    /// Maximum size of a single message during the header phase.
    fn header_message_max_size(&self, _conn: &Connection) -> usize {
        0
    }

    /// Maximum total size of the header phase in bytes.
    fn header_max_size(&self, _conn: &Connection) -> usize {
        0
    }

    /// Whether a connection that has completed its header may activate.
    fn can_activate(&self, _conn: &Connection) -> bool {
        true
    }

    /// Whether `conn` may publish an event named `evt`.
    fn can_trigger_event(&self, _conn: &Connection, _evt: &str) -> bool {
        true
    }

    /// Whether `conn` may receive `event`. Consulted after subscription
    /// matching, immediately before delivery.
    fn can_receive_event(&self, _conn: &Connection, _event: &Event) -> bool {
        true
    }

    /// Reserved alongside the unimplemented `execute*` commands.
    fn can_execute_code(&self, _conn: &Connection) -> bool {
        false
    }

    /// Minimum time between trigger commands from one connection.
    fn min_trigger_interval(&self, _conn: &Connection) -> Duration {
        Duration::ZERO
    }

    /// How long to freeze a connection when an action carries `Freeze`.
    fn freeze_duration(&self, _conn: &Connection, _ec: ErrorCode) -> Duration {
        Duration::ZERO
    }

    /// Connections idle longer than this are closed.
    fn keep_alive_period(&self, _conn: &Connection) -> Duration {
        Duration::ZERO
    }
}

/// The stock policy: config-driven limits, warnings for most violations, and
/// a hard halt when the header size limit is breached.
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    pub header_message_max_size: usize,
    pub header_max_size: usize,
    pub min_trigger_interval: Duration,
    pub freeze_duration: Duration,
    pub keep_alive_period: Duration,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        DefaultPolicy {
            header_message_max_size: 50,
            header_max_size: 200,
            min_trigger_interval: Duration::ZERO,
            freeze_duration: Duration::ZERO,
            keep_alive_period: Duration::ZERO,
        }
    }
}

impl DefaultPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the stock policy from the runtime configuration's limit and
    /// timing sections.
    pub fn from_config(config: &crate::config::RuntimeConfig) -> Self {
        DefaultPolicy {
            header_message_max_size: config.limits.header_message_max_size,
            header_max_size: config.limits.header_max_size,
            min_trigger_interval: Duration::from_millis(config.policy.min_trigger_interval_ms),
            freeze_duration: Duration::from_millis(config.policy.freeze_ms),
            keep_alive_period: Duration::from_millis(config.policy.keep_alive_ms),
        }
    }
}

impl Policy for DefaultPolicy {
    fn security_action(&self, _conn: &Connection, event: &SecurityEvent) -> Action {
        match event {
            SecurityEvent::HeaderSizeLimitReached => Action::error_and_halt(),
            _ => Action::warn_and_ignore(),
        }
    }

    fn header_message_max_size(&self, _conn: &Connection) -> usize {
        self.header_message_max_size
    }

    fn header_max_size(&self, _conn: &Connection) -> usize {
        self.header_max_size
    }

    fn min_trigger_interval(&self, _conn: &Connection) -> Duration {
        self.min_trigger_interval
    }

    fn freeze_duration(&self, _conn: &Connection, _ec: ErrorCode) -> Duration {
        self.freeze_duration
    }

    fn keep_alive_period(&self, _conn: &Connection) -> Duration {
        self.keep_alive_period
    }
}

type CasePredicate = Box<dyn Fn(&Connection) -> bool>;

/// An ordered composition of policies. Each query is answered by the first
/// case whose predicate matches the connection, or by the fallback. Typical
/// predicates select on connection attributes such as the listener that
/// produced it (`server_id`).
pub struct CasePolicy {
    cases: Vec<(CasePredicate, Box<dyn Policy>)>,
    fallback: Box<dyn Policy>,
}

impl CasePolicy {
    pub fn new(fallback: Box<dyn Policy>) -> Self {
        CasePolicy {
            cases: Vec::new(),
            fallback,
        }
    }

    pub fn case(
        mut self,
        predicate: impl Fn(&Connection) -> bool + 'static,
        policy: Box<dyn Policy>,
    ) -> Self {
        self.cases.push((Box::new(predicate), policy));
        self
    }

    fn select(&self, conn: &Connection) -> &dyn Policy {
        for (predicate, policy) in &self.cases {
            if predicate(conn) {
                return policy.as_ref();
            }
        }
        self.fallback.as_ref()
    }
}

impl Policy for CasePolicy {
    fn security_action(&self, conn: &Connection, event: &SecurityEvent) -> Action {
        self.select(conn).security_action(conn, event)
    }

    fn header_message_max_size(&self, conn: &Connection) -> usize {
        self.select(conn).header_message_max_size(conn)
    }

    fn header_max_size(&self, conn: &Connection) -> usize {
        self.select(conn).header_max_size(conn)
    }

    fn can_activate(&self, conn: &Connection) -> bool {
        self.select(conn).can_activate(conn)
    }

    fn can_trigger_event(&self, conn: &Connection, evt: &str) -> bool {
        self.select(conn).can_trigger_event(conn, evt)
    }

    fn can_receive_event(&self, conn: &Connection, event: &Event) -> bool {
        self.select(conn).can_receive_event(conn, event)
    }

    fn can_execute_code(&self, conn: &Connection) -> bool {
        self.select(conn).can_execute_code(conn)
    }

    fn min_trigger_interval(&self, conn: &Connection) -> Duration {
        self.select(conn).min_trigger_interval(conn)
    }

    fn freeze_duration(&self, conn: &Connection, ec: ErrorCode) -> Duration {
        self.select(conn).freeze_duration(conn, ec)
    }

    fn keep_alive_period(&self, conn: &Connection) -> Duration {
        self.select(conn).keep_alive_period(conn)
    }
}
