use super::Connection;
use crate::filter::Expr;

use std::rc::Weak;

use bytes::Bytes;

/// How an event was published, which decides its delivery header (`el`,
/// `eb`, `ee`) and whether a payload follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Line,
    Binary,
    Empty,
}

/// An event in flight. Events are ephemeral: one is built per trigger
/// command and dropped once the fanout pass completes. The sender is a weak
/// back-reference, upgraded at each point of use.
pub struct Event {
    pub sender: Weak<Connection>,
    pub kind: TriggerKind,
    pub evt: String,
    /// The embedded filter constraining recipients; nil matches everyone.
    pub expr: Expr,
    /// Payload bytes, shared by reference across all recipients' write
    /// queues. Includes the trailing-newline slot on byte-stream senders.
    pub data: Bytes,
}
