//! The per-connection protocol state machine and the event fanout path.
//!
//! A connection moves through three phases: `Protocol` (the handshake line),
//! `Props` (header entries until `END`), and `Active` (command processing).
//! Each connection is driven by a single task that owns the transport's read
//! half, so exactly one read is outstanding at any time; replies and event
//! deliveries go through the write serializer in [`writer`].
//!
//! Everything here assumes the single-threaded cooperative executor set up
//! by [`Runtime`](crate::runtime::Runtime): connections are `Rc`-shared,
//! state lives in cells, and no callback ever runs concurrently with
//! another.

pub mod event;
pub mod registry;
pub(crate) mod writer;

pub use event::{Event, TriggerKind};
pub use registry::Registry;

use crate::filter::{self, Expr, FilterError};
use crate::policy::{Action, Policy, SecurityEvent};
use crate::protocol::command::{self, Command, CommandError};
use crate::protocol::header;
use crate::protocol::{ErrorCode, PROTOCOL_NAME};
use crate::runtime::Broker;
use crate::transport::{MessageReader, MessageWriter, TransportError, WriteMode};
use writer::WriteHandle;

use std::cell::{Cell, Ref, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Instant;

use bytes::Bytes;

/// Protocol phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Protocol,
    Props,
    Active,
}

/// Whether the connection keeps reading after the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Subscription {
    n: usize,
    expr: Expr,
}

// Storage IDs are the smallest missing nonnegative integer, so `release`
// followed by `store` reuses the released slot.
fn lowest_unused_id(used: &BTreeMap<usize, Bytes>) -> usize {
    let mut id = 0;
    while used.contains_key(&id) {
        id += 1;
    }
    id
}

/// One client connection.
///
/// Constructed with [`Connection::spawn`], which starts the driver task (the
/// state machine) and the writer task on the current `LocalSet`. The broker's
/// policy sees `&Connection` at every interception point and may inspect the
/// public accessors.
pub struct Connection {
    weak: Weak<Connection>,
    broker: Rc<Broker>,
    server_id: usize,
    send_trailing_newline: bool,
    writer: WriteHandle,

    phase: Cell<Phase>,
    echo: Cell<bool>,
    paused: Cell<bool>,

    name: RefCell<String>,
    password: RefCell<String>,
    groups: RefCell<Vec<String>>,
    properties: RefCell<HashMap<String, Vec<String>>>,

    subscriptions: RefCell<Vec<Subscription>>,
    next_subscription: Cell<usize>,
    local_storage: RefCell<BTreeMap<usize, Bytes>>,
    expression_cache: RefCell<BTreeMap<usize, Expr>>,

    header_bytes: Cell<usize>,
    last_trigger: Cell<Option<Instant>>,
}

impl Connection {
    /// Starts a connection over a split transport. `send_trailing_newline`
    /// is true for byte streams and false for frame streams; `server_id`
    /// tags the listener that produced the connection.
    pub fn spawn(
        broker: Rc<Broker>,
        reader: Box<dyn MessageReader>,
        writer: Box<dyn MessageWriter>,
        send_trailing_newline: bool,
        server_id: usize,
    ) -> Rc<Connection> {
        let writer = writer::spawn(writer);
        let conn = Rc::new_cyclic(|weak| {
            Self::with_writer(weak.clone(), broker, writer, send_trailing_newline, server_id)
        });
        let driver = Rc::clone(&conn);
        tokio::task::spawn_local(async move {
            driver.run(reader).await;
        });
        conn
    }

    fn with_writer(
        weak: Weak<Connection>,
        broker: Rc<Broker>,
        writer: WriteHandle,
        send_trailing_newline: bool,
        server_id: usize,
    ) -> Connection {
        Connection {
            weak,
            broker,
            server_id,
            send_trailing_newline,
            writer,
            phase: Cell::new(Phase::Protocol),
            echo: Cell::new(true),
            paused: Cell::new(false),
            name: RefCell::new(String::new()),
            password: RefCell::new(String::new()),
            groups: RefCell::new(Vec::new()),
            properties: RefCell::new(HashMap::new()),
            subscriptions: RefCell::new(Vec::new()),
            next_subscription: Cell::new(1),
            local_storage: RefCell::new(BTreeMap::new()),
            expression_cache: RefCell::new(BTreeMap::new()),
            header_bytes: Cell::new(0),
            last_trigger: Cell::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(broker: Rc<Broker>, server_id: usize) -> Rc<Connection> {
        Rc::new_cyclic(|weak| {
            Self::with_writer(weak.clone(), broker, WriteHandle::detached(), true, server_id)
        })
    }

    pub fn server_id(&self) -> usize {
        self.server_id
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    /// The declared device name; empty until the connection is Active.
    pub fn name(&self) -> Ref<'_, String> {
        self.name.borrow()
    }

    pub fn groups(&self) -> Ref<'_, Vec<String>> {
        self.groups.borrow()
    }

    /// The declared password, if any; empty until the connection is Active.
    pub fn password(&self) -> Ref<'_, String> {
        self.password.borrow()
    }

    /// First value of a header property, if the client sent it.
    pub fn property_first(&self, key: &str) -> Option<String> {
        self.properties
            .borrow()
            .get(key)
            .and_then(|values| values.first().cloned())
    }

    fn policy(&self) -> &dyn Policy {
        self.broker.policy()
    }

    // ---- reply helpers ----------------------------------------------------

    // Bypasses the echo gate; used for replies the client must always see,
    // such as allocated identifiers.
    fn send_text(&self, text: impl Into<String>) {
        let mut text = text.into();
        if self.send_trailing_newline {
            text.push('\n');
        }
        self.writer.enqueue(Bytes::from(text), WriteMode::Text);
    }

    fn send_ok(&self) {
        if self.echo.get() {
            self.send_text("ok");
        }
    }

    fn send_error(&self, code: ErrorCode) {
        if self.echo.get() {
            self.send_text(format!("err {}", code));
        }
    }

    fn send_warning(&self, code: ErrorCode) {
        if self.echo.get() {
            self.send_text(format!("warn {}", code));
        }
    }

    // ---- security-action discipline ---------------------------------------

    fn report_action(&self, action: Action, code: ErrorCode) {
        if !action.denies() {
            return;
        }
        if action.contains(Action::RaiseError) {
            self.send_error(code);
        } else if action.contains(Action::RaiseWarning) {
            self.send_warning(code);
        } else {
            self.send_ok();
        }
    }

    async fn finish_action(&self, action: Action, code: ErrorCode) -> Flow {
        if action.denies() {
            if action.contains(Action::Halt) {
                return Flow::Close;
            }
            if action.contains(Action::Freeze) {
                self.freeze(code).await;
            }
            if action.contains(Action::Block) {
                self.writer.block_endpoint();
            }
        }
        Flow::Continue
    }

    async fn apply_action(&self, action: Action, code: ErrorCode) -> Flow {
        self.report_action(action, code);
        self.finish_action(action, code).await
    }

    /// Reports a protocol violation to the policy and applies the resulting
    /// action: the report reply, then halt/freeze/block as instructed.
    async fn violation(&self, event: SecurityEvent, code: ErrorCode) -> Flow {
        let action = self.policy().security_action(self, &event);
        self.apply_action(action, code).await
    }

    async fn freeze(&self, code: ErrorCode) {
        let duration = self.policy().freeze_duration(self, code);
        if !duration.is_zero() {
            log::debug!("freezing '{}' for {:?}", self.name.borrow(), duration);
            tokio::time::sleep(duration).await;
        }
    }

    // ---- the state machine ------------------------------------------------

    async fn run(self: Rc<Self>, mut reader: Box<dyn MessageReader>) {
        log::debug!("connection started (server_id {})", self.server_id);
        let limit = self.policy().header_message_max_size(&self);
        reader.set_max_message_size(limit);

        loop {
            let msg = match self.read_next(&mut *reader).await {
                Ok(msg) => msg,
                Err(TransportError::MessageTooLong) => {
                    self.send_error(ErrorCode::Protocol);
                    break;
                }
                Err(err) => {
                    log::debug!("read failed for '{}': {}", self.name.borrow(), err);
                    break;
                }
            };

            if self.phase.get() != Phase::Active
                && self.account_header_bytes(&msg).await == Flow::Close
            {
                break;
            }

            let flow = match self.phase.get() {
                Phase::Protocol => self.handle_protocol(&msg).await,
                Phase::Props => self.handle_props(&mut *reader, &msg).await,
                Phase::Active => self.handle_active(&mut *reader, &msg).await,
            };
            if flow == Flow::Close {
                break;
            }
        }

        self.writer.shutdown();
        log::debug!("connection '{}' terminated", self.name.borrow());
    }

    async fn read_next(&self, reader: &mut dyn MessageReader) -> Result<String, TransportError> {
        let period = self.policy().keep_alive_period(self);
        if period.is_zero() {
            return reader.read_message().await;
        }
        match tokio::time::timeout(period, reader.read_message()).await {
            Ok(result) => result,
            Err(_) => {
                log::info!("closing '{}': idle beyond {:?}", self.name.borrow(), period);
                Err(TransportError::Closed)
            }
        }
    }

    // Total header-byte accounting for the Protocol and Props phases, message
    // terminators included. A header landing exactly on the limit is fine;
    // the message that crosses it raises the violation (and, unless the
    // action halts, is still processed).
    async fn account_header_bytes(&self, msg: &str) -> Flow {
        let max = self.policy().header_max_size(self);
        if max == 0 {
            return Flow::Continue;
        }
        let total = self.header_bytes.get() + msg.len() + 1;
        self.header_bytes.set(total);
        if total > max {
            return self
                .violation(SecurityEvent::HeaderSizeLimitReached, ErrorCode::Protocol)
                .await;
        }
        Flow::Continue
    }

    async fn handle_protocol(&self, msg: &str) -> Flow {
        let trimmed = msg.trim();
        if trimmed == PROTOCOL_NAME {
            self.phase.set(Phase::Props);
            self.send_ok();
            return Flow::Continue;
        }
        if trimmed == format!("{}_echo_off", PROTOCOL_NAME) {
            self.echo.set(false);
            self.phase.set(Phase::Props);
            self.send_ok();
            return Flow::Continue;
        }

        let action = self
            .policy()
            .security_action(self, &SecurityEvent::HeaderWrongProtocol);
        self.report_action(action, ErrorCode::Protocol);
        // whatever the action, the client must learn the expected protocol,
        // echo suppression or not
        self.send_text(format!("info {}", PROTOCOL_NAME));
        self.finish_action(action, ErrorCode::Protocol).await
    }

    async fn handle_props(&self, reader: &mut dyn MessageReader, msg: &str) -> Flow {
        let trimmed = msg.trim();
        if trimmed == "END" {
            return self.activate(reader).await;
        }
        if trimmed.is_empty() {
            return Flow::Continue;
        }
        match header::parse(msg) {
            Ok(entry) => {
                // repeated keys replace the stored value list
                self.properties.borrow_mut().insert(entry.key, entry.values);
                Flow::Continue
            }
            Err(_) => {
                self.violation(
                    SecurityEvent::HeaderMalformedHeader,
                    ErrorCode::MalformedHeader,
                )
                .await
            }
        }
    }

    async fn activate(&self, reader: &mut dyn MessageReader) -> Flow {
        match self.property_first("name") {
            Some(name) => *self.name.borrow_mut() = name,
            None => {
                let action = self
                    .policy()
                    .security_action(self, &SecurityEvent::HeaderNoName);
                if self.apply_action(action, ErrorCode::NoName).await == Flow::Close {
                    return Flow::Close;
                }
                if action.denies() {
                    // not halted: keep reading header lines
                    return Flow::Continue;
                }
            }
        }
        *self.password.borrow_mut() = self.property_first("password").unwrap_or_default();
        *self.groups.borrow_mut() = self
            .properties
            .borrow()
            .get("groups")
            .cloned()
            .unwrap_or_default();

        if !self.policy().can_activate(self) {
            self.send_error(ErrorCode::ActivateSecurityFail);
            return Flow::Close;
        }

        self.phase.set(Phase::Active);
        self.broker.registry().insert(self.weak.clone());
        // the per-message size limit only guards the header phase
        reader.set_max_message_size(0);
        log::info!(
            "connection '{}' activated (server_id {}, {} live)",
            self.name.borrow(),
            self.server_id,
            self.broker.registry().len()
        );
        self.send_ok();
        Flow::Continue
    }

    async fn handle_active(&self, reader: &mut dyn MessageReader, msg: &str) -> Flow {
        if msg.trim().is_empty() {
            return Flow::Continue;
        }
        match command::parse(msg) {
            Ok(cmd) => self.handle_command(reader, cmd).await,
            Err(CommandError::Regex) => {
                self.violation(SecurityEvent::MalformedRegex, ErrorCode::ParserRegex)
                    .await
            }
            Err(CommandError::Malformed) => {
                self.violation(SecurityEvent::MalformedCommand, ErrorCode::Parser)
                    .await
            }
        }
    }

    async fn handle_command(&self, reader: &mut dyn MessageReader, cmd: Command) -> Flow {
        match cmd {
            Command::Subscribe { expr } => {
                let n = self.next_subscription.get();
                self.next_subscription.set(n + 1);
                self.subscriptions.borrow_mut().push(Subscription { n, expr });
                self.send_text(format!("ok {}", n));
                Flow::Continue
            }
            Command::Unsubscribe { n } => {
                let removed = {
                    let mut subs = self.subscriptions.borrow_mut();
                    match subs.iter().position(|s| s.n == n) {
                        Some(index) => {
                            subs.remove(index);
                            true
                        }
                        None => false,
                    }
                };
                if removed {
                    self.send_ok();
                    Flow::Continue
                } else {
                    self.violation(SecurityEvent::InvalidArgument, ErrorCode::CmdInvalidArg)
                        .await
                }
            }
            Command::Trigger { evt, expr } => {
                self.trigger_line(reader, evt, expr.unwrap_or_default()).await
            }
            Command::TriggerBinary { size, evt, expr } => {
                self.trigger_binary(reader, size, evt, expr.unwrap_or_default())
                    .await
            }
            Command::TriggerEmpty { evt, expr } => {
                self.trigger_empty(evt, expr.unwrap_or_default()).await
            }
            Command::TriggerCached { evt, expr_id } => match self.cached_expr(expr_id) {
                Ok(expr) => self.trigger_line(reader, evt, expr).await,
                Err(code) => self.cache_miss(code).await,
            },
            Command::TriggerCachedBinary { size, evt, expr_id } => {
                match self.cached_expr(expr_id) {
                    Ok(expr) => self.trigger_binary(reader, size, evt, expr).await,
                    Err(code) => self.cache_miss(code).await,
                }
            }
            Command::TriggerCachedEmpty { evt, expr_id } => match self.cached_expr(expr_id) {
                Ok(expr) => self.trigger_empty(evt, expr).await,
                Err(code) => self.cache_miss(code).await,
            },
            Command::TriggerCachedCachedData {
                evt,
                expr_id,
                data_id,
            } => match self.cached_expr(expr_id) {
                Ok(expr) => self.trigger_cached_data(evt, expr, data_id).await,
                Err(code) => self.cache_miss(code).await,
            },
            Command::Pause => {
                self.paused.set(true);
                self.send_ok();
                Flow::Continue
            }
            Command::Resume => {
                self.paused.set(false);
                self.send_ok();
                Flow::Continue
            }
            Command::Alive => {
                // reading the command already reset the idle clock
                self.send_ok();
                Flow::Continue
            }
            Command::KillMe => Flow::Close,
            Command::Echo { state } => {
                // applies from the next reply onward; no reply to this command
                match state {
                    Some(on) => self.echo.set(on),
                    None => self.echo.set(!self.echo.get()),
                }
                Flow::Continue
            }
            Command::Execute { .. } | Command::ExecuteScript { .. } | Command::ExecuteCached { .. } => {
                self.send_error(ErrorCode::CmdNotImpl);
                Flow::Continue
            }
            Command::Store { line } => {
                let id = {
                    let mut storage = self.local_storage.borrow_mut();
                    let id = lowest_unused_id(&storage);
                    storage.insert(id, Bytes::from(line));
                    id
                };
                self.send_text(format!("ok {}", id));
                Flow::Continue
            }
            Command::StoreBinary { size } => {
                let id = lowest_unused_id(&self.local_storage.borrow());
                self.send_text(format!("ok {}", id));
                let mut data = vec![0u8; size];
                if reader.read_binary(&mut data).await.is_err() {
                    return Flow::Close;
                }
                self.local_storage.borrow_mut().insert(id, data.into());
                Flow::Continue
            }
            Command::Release { id } => {
                let removed = self.local_storage.borrow_mut().remove(&id).is_some();
                if removed {
                    self.expression_cache.borrow_mut().remove(&id);
                    self.send_ok();
                    Flow::Continue
                } else {
                    self.violation(SecurityEvent::InvalidArgument, ErrorCode::CmdInvalidArg)
                        .await
                }
            }
        }
    }

    // ---- trigger path (sender side) ---------------------------------------

    // Rate limit, then publish permission. `Some(flow)` means the trigger
    // was refused and no payload may be consumed; a violation whose action
    // does not deny is reported but the trigger still proceeds.
    async fn trigger_gate(&self, evt: &str) -> Option<Flow> {
        let min = self.policy().min_trigger_interval(self);
        if !min.is_zero() {
            if let Some(previous) = self.last_trigger.get() {
                if previous.elapsed() < min {
                    let action = self
                        .policy()
                        .security_action(self, &SecurityEvent::TooFrequentTrigger);
                    if self.apply_action(action, ErrorCode::Security).await == Flow::Close {
                        return Some(Flow::Close);
                    }
                    if action.denies() {
                        return Some(Flow::Continue);
                    }
                }
            }
        }
        self.last_trigger.set(Some(Instant::now()));

        if !self.policy().can_trigger_event(self, evt) {
            let event = SecurityEvent::TriggerProhibited {
                evt: evt.to_string(),
            };
            let action = self.policy().security_action(self, &event);
            if self.apply_action(action, ErrorCode::TriggerProhibited).await == Flow::Close {
                return Some(Flow::Close);
            }
            if action.denies() {
                return Some(Flow::Continue);
            }
        }
        None
    }

    async fn trigger_line(
        &self,
        reader: &mut dyn MessageReader,
        evt: String,
        expr: Expr,
    ) -> Flow {
        if let Some(flow) = self.trigger_gate(&evt).await {
            return flow;
        }
        self.send_ok();
        let payload = match reader.read_message().await {
            Ok(payload) => payload,
            Err(_) => return Flow::Close,
        };
        self.send_ok();
        let mut data = payload.into_bytes();
        if self.send_trailing_newline {
            data.push(b'\n');
        }
        self.dispatch(Event {
            sender: self.weak.clone(),
            kind: TriggerKind::Line,
            evt,
            expr,
            data: data.into(),
        });
        Flow::Continue
    }

    async fn trigger_binary(
        &self,
        reader: &mut dyn MessageReader,
        size: usize,
        evt: String,
        expr: Expr,
    ) -> Flow {
        if let Some(flow) = self.trigger_gate(&evt).await {
            return flow;
        }
        self.send_ok();
        let extra = usize::from(self.send_trailing_newline);
        let mut data = vec![0u8; size + extra];
        if extra == 1 {
            data[size] = b'\n';
        }
        if reader.read_binary(&mut data[..size]).await.is_err() {
            return Flow::Close;
        }
        self.send_ok();
        self.dispatch(Event {
            sender: self.weak.clone(),
            kind: TriggerKind::Binary,
            evt,
            expr,
            data: data.into(),
        });
        Flow::Continue
    }

    async fn trigger_empty(&self, evt: String, expr: Expr) -> Flow {
        if let Some(flow) = self.trigger_gate(&evt).await {
            return flow;
        }
        self.send_ok();
        self.dispatch(Event {
            sender: self.weak.clone(),
            kind: TriggerKind::Empty,
            evt,
            expr,
            data: Bytes::new(),
        });
        Flow::Continue
    }

    async fn trigger_cached_data(&self, evt: String, expr: Expr, data_id: usize) -> Flow {
        if let Some(flow) = self.trigger_gate(&evt).await {
            return flow;
        }
        let blob = self.local_storage.borrow().get(&data_id).cloned();
        let blob = match blob {
            Some(blob) => blob,
            None => {
                return self
                    .violation(SecurityEvent::InvalidArgument, ErrorCode::CmdInvalidArg)
                    .await
            }
        };
        self.send_ok();
        let mut data = Vec::with_capacity(blob.len() + 1);
        data.extend_from_slice(&blob);
        if self.send_trailing_newline {
            data.push(b'\n');
        }
        self.dispatch(Event {
            sender: self.weak.clone(),
            kind: TriggerKind::Binary,
            evt,
            expr,
            data: data.into(),
        });
        Flow::Continue
    }

    // Resolves a cached expression: the parse cache first, then the stored
    // blob, parsed and cached on first use.
    fn cached_expr(&self, id: usize) -> Result<Expr, ErrorCode> {
        if let Some(expr) = self.expression_cache.borrow().get(&id) {
            return Ok(expr.clone());
        }
        let text = match self.local_storage.borrow().get(&id) {
            Some(blob) => String::from_utf8_lossy(blob).into_owned(),
            None => return Err(ErrorCode::CmdInvalidArg),
        };
        match filter::parse(&text) {
            Ok(expr) => {
                self.expression_cache.borrow_mut().insert(id, expr.clone());
                Ok(expr)
            }
            Err(FilterError::InvalidRegex { .. }) => Err(ErrorCode::CmdCachedParserRegex),
            Err(_) => Err(ErrorCode::CmdCachedParser),
        }
    }

    async fn cache_miss(&self, code: ErrorCode) -> Flow {
        self.violation(SecurityEvent::InvalidArgument, code).await
    }

    // ---- fanout (recipient side) ------------------------------------------

    fn dispatch(&self, event: Event) {
        let targets = self.broker.registry().snapshot();
        log::debug!(
            "dispatching '{}' from '{}' across {} connections",
            event.evt,
            self.name.borrow(),
            targets.len()
        );
        for target in targets {
            target.deliver(&event);
        }
    }

    /// The per-target trigger path: decides whether this connection receives
    /// `event` and enqueues the delivery header and payload if so.
    pub(crate) fn deliver(&self, event: &Event) {
        let sender = match event.sender.upgrade() {
            Some(sender) => sender,
            None => return,
        };
        // never back to the sender
        if std::ptr::eq(self as *const Connection, Rc::as_ptr(&sender)) {
            return;
        }
        if self.paused.get() {
            return;
        }
        if !event
            .expr
            .matches_target(&self.name.borrow(), &self.groups.borrow())
        {
            return;
        }

        let sender_name = sender.name.borrow();
        let sender_groups = sender.groups.borrow();
        let mut header = match event.kind {
            TriggerKind::Line => format!("el {} {}", event.evt, sender_name),
            TriggerKind::Binary => {
                format!("eb {} {} {}", event.data.len(), event.evt, sender_name)
            }
            TriggerKind::Empty => format!("ee {} {}", event.evt, sender_name),
        };

        let mut any_match = false;
        for subscription in self.subscriptions.borrow().iter() {
            if subscription
                .expr
                .matches(&event.evt, &sender_name, &sender_groups)
            {
                header.push(' ');
                header.push_str(&subscription.n.to_string());
                any_match = true;
            }
        }
        if !any_match {
            return;
        }

        if !self.broker.policy().can_receive_event(self, event) {
            return;
        }

        if self.send_trailing_newline {
            header.push('\n');
        }
        self.writer.enqueue(Bytes::from(header), WriteMode::Text);
        match event.kind {
            TriggerKind::Line => self.writer.enqueue(event.data.clone(), WriteMode::Text),
            TriggerKind::Binary => self.writer.enqueue(event.data.clone(), WriteMode::Binary),
            TriggerKind::Empty => {}
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.broker.registry().sweep();
    }
}
