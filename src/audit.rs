//! Fire-and-forget audit event stream.
//!
//! Commands never wait on auditing: events are pushed onto four bounded
//! in-process queues (user, transaction, quote, error) and drained by one
//! worker per queue that publishes JSON to the audit collaborator. When a
//! queue overflows, the oldest event is dropped so the newest survives.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::EngineError;
use crate::money::Cents;

pub const QUEUE_CAPACITY: usize = 1024;
const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCommand {
    pub server: String,
    pub command: String,
    pub username: String,
    pub stock_symbol: String,
    pub filename: String,
    pub funds: Cents,
    pub transaction_num: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTransaction {
    pub server: String,
    pub action: String,
    pub username: String,
    pub funds: Cents,
    pub transaction_num: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteServer {
    pub server: String,
    pub price: Cents,
    pub stock_symbol: String,
    pub username: String,
    pub quote_server_time: i64,
    pub cryptokey: String,
    pub transaction_num: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub server: String,
    pub command: String,
    pub stock_symbol: String,
    pub username: String,
    pub filename: String,
    pub funds: Cents,
    pub transaction_num: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub server: String,
    pub command: String,
    pub stock_symbol: String,
    pub filename: String,
    pub funds: Cents,
    pub username: String,
    pub error_message: String,
    pub transaction_num: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEvent {
    pub server: String,
    pub command: String,
    pub stock_symbol: String,
    pub filename: String,
    pub funds: Cents,
    pub username: String,
    pub debug_message: String,
    pub transaction_num: i64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AuditEvent {
    UserCommand(UserCommand),
    AccountTransaction(AccountTransaction),
    QuoteServer(QuoteServer),
    SystemEvent(SystemEvent),
    ErrorEvent(ErrorEvent),
    DebugEvent(DebugEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    User,
    Transaction,
    Quote,
    Error,
}

impl QueueKind {
    pub fn name(self) -> &'static str {
        match self {
            QueueKind::User => "user_queue",
            QueueKind::Transaction => "transaction_queue",
            QueueKind::Quote => "quote_queue",
            QueueKind::Error => "error_queue",
        }
    }

    const ALL: [QueueKind; 4] = [
        QueueKind::User,
        QueueKind::Transaction,
        QueueKind::Quote,
        QueueKind::Error,
    ];

    fn index(self) -> usize {
        match self {
            QueueKind::User => 0,
            QueueKind::Transaction => 1,
            QueueKind::Quote => 2,
            QueueKind::Error => 3,
        }
    }
}

impl AuditEvent {
    /// Which worker queue carries this event. There are exactly four queues;
    /// system and debug events ride with errors.
    fn queue(&self) -> QueueKind {
        match self {
            AuditEvent::UserCommand(_) => QueueKind::User,
            AuditEvent::AccountTransaction(_) => QueueKind::Transaction,
            AuditEvent::QuoteServer(_) => QueueKind::Quote,
            AuditEvent::SystemEvent(_) | AuditEvent::ErrorEvent(_) | AuditEvent::DebugEvent(_) => {
                QueueKind::Error
            }
        }
    }
}

/// Transport the queue workers publish through.
#[async_trait]
pub trait AuditTransport: Send + Sync {
    async fn publish(&self, queue: &'static str, body: Value) -> anyhow::Result<()>;
    async fn ping(&self) -> anyhow::Result<()>;
    async fn dump_log(&self, filename: &str) -> anyhow::Result<Value>;
}

/// HTTP transport to the audit collaborator.
pub struct HttpAuditTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuditTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AuditTransport for HttpAuditTransport {
    async fn publish(&self, queue: &'static str, body: Value) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/log/{}", self.base_url, queue))
            .timeout(PUBLISH_DEADLINE)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.client
            .get(format!("{}/", self.base_url))
            .timeout(PUBLISH_DEADLINE)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn dump_log(&self, filename: &str) -> anyhow::Result<Value> {
        let ack = self
            .client
            .post(format!("{}/dumplog", self.base_url))
            .timeout(PUBLISH_DEADLINE)
            .json(&serde_json::json!({ "filename": filename }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ack)
    }
}

/// Bounded queue that sheds its oldest entry when full.
struct DropOldestQueue {
    entries: Mutex<VecDeque<Value>>,
    notify: Notify,
}

impl DropOldestQueue {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, value: Value) {
        {
            let mut entries = self.entries.lock();
            if entries.len() == QUEUE_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(value);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Value {
        loop {
            if let Some(value) = self.entries.lock().pop_front() {
                return value;
            }
            self.notify.notified().await;
        }
    }
}

/// Entry point for emitting audit events.
pub struct AuditLog {
    server: String,
    queues: [Arc<DropOldestQueue>; 4],
    transport: Arc<dyn AuditTransport>,
}

impl AuditLog {
    pub fn new(server_name: &str, transport: Arc<dyn AuditTransport>) -> Self {
        Self {
            server: server_name.to_string(),
            queues: std::array::from_fn(|_| Arc::new(DropOldestQueue::new())),
            transport,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    /// Spawn the four queue workers. Call once at startup.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        QueueKind::ALL
            .iter()
            .map(|kind| {
                let queue = Arc::clone(&self.queues[kind.index()]);
                let transport = Arc::clone(&self.transport);
                let name = kind.name();
                tokio::spawn(async move {
                    loop {
                        let body = queue.pop().await;
                        if let Err(err) = transport.publish(name, body).await {
                            warn!(queue = name, error = %err, "audit publish failed; event lost");
                        }
                    }
                })
            })
            .collect()
    }

    pub fn record(&self, event: AuditEvent) {
        let kind = event.queue();
        match serde_json::to_value(&event) {
            Ok(body) => self.queues[kind.index()].push(body),
            Err(err) => warn!(error = %err, "unserializable audit event dropped"),
        }
    }

    pub fn user_command(
        &self,
        command: &str,
        username: &str,
        stock_symbol: &str,
        filename: &str,
        funds: Cents,
        transaction_num: i64,
    ) {
        self.record(AuditEvent::UserCommand(UserCommand {
            server: self.server.clone(),
            command: command.to_string(),
            username: username.to_string(),
            stock_symbol: stock_symbol.to_string(),
            filename: filename.to_string(),
            funds,
            transaction_num,
        }));
    }

    pub fn account_transaction(
        &self,
        action: &str,
        username: &str,
        funds: Cents,
        transaction_num: i64,
    ) {
        self.record(AuditEvent::AccountTransaction(AccountTransaction {
            server: self.server.clone(),
            action: action.to_string(),
            username: username.to_string(),
            funds,
            transaction_num,
        }));
    }

    pub fn quote_server(
        &self,
        price: Cents,
        stock_symbol: &str,
        username: &str,
        quote_server_time: i64,
        cryptokey: &str,
        transaction_num: i64,
    ) {
        self.record(AuditEvent::QuoteServer(QuoteServer {
            server: self.server.clone(),
            price,
            stock_symbol: stock_symbol.to_string(),
            username: username.to_string(),
            quote_server_time,
            cryptokey: cryptokey.to_string(),
            transaction_num,
        }));
    }

    pub fn system_event(
        &self,
        command: &str,
        username: &str,
        stock_symbol: &str,
        funds: Cents,
        transaction_num: i64,
    ) {
        self.record(AuditEvent::SystemEvent(SystemEvent {
            server: self.server.clone(),
            command: command.to_string(),
            stock_symbol: stock_symbol.to_string(),
            username: username.to_string(),
            filename: String::new(),
            funds,
            transaction_num,
        }));
    }

    pub fn error_event(
        &self,
        command: &str,
        username: &str,
        stock_symbol: &str,
        error_message: &str,
        transaction_num: i64,
    ) {
        self.record(AuditEvent::ErrorEvent(ErrorEvent {
            server: self.server.clone(),
            command: command.to_string(),
            stock_symbol: stock_symbol.to_string(),
            filename: String::new(),
            funds: 0,
            username: username.to_string(),
            error_message: error_message.to_string(),
            transaction_num,
        }));
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.transport.ping().await
    }

    /// Forward DUMPLOG to the audit collaborator and return its ack.
    pub async fn dump_log(&self, filename: &str) -> Result<Value, EngineError> {
        self.transport
            .dump_log(filename)
            .await
            .map_err(|err| EngineError::Unavailable(format!("audit collaborator: {err}")))
    }

    /// Drain a queue without publishing. Test hook.
    #[cfg(test)]
    pub(crate) fn drain(&self, kind: QueueKind) -> Vec<Value> {
        self.queues[kind.index()].entries.lock().drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self, kind: QueueKind) -> usize {
        self.queues[kind.index()].entries.lock().len()
    }
}

/// Transport that swallows everything. Test double.
#[cfg(test)]
pub(crate) struct NullTransport;

#[cfg(test)]
#[async_trait]
impl AuditTransport for NullTransport {
    async fn publish(&self, _queue: &'static str, _body: Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dump_log(&self, _filename: &str) -> anyhow::Result<Value> {
        Ok(serde_json::json!({ "status": "ok" }))
    }
}
