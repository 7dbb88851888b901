//! Durable retry queue for remote catalog writes.
//! Buffers failed product writes, persists them across restarts, and retries
//! them in the background with exponential backoff until success or budget.

mod models;
mod network;
mod queue;
mod remote;
mod storage;

pub use models::{DroppedWrite, PendingWrite, Product, QueueStats, WriteOperation};
pub use network::check_online_status;
pub use queue::{QueueConfig, RetryQueue};
pub use remote::{HttpRemoteStore, RemoteConfig, RemoteError, RemoteStore};
pub use storage::{KeyValueStore, SqliteStore};


/// Сводка состояния очереди для диагностики/бейджа админ-панели
#[derive(serde::Serialize)]
pub struct QueueStatusResponse {
    pub pending_count: usize,
    pub dropped_count: usize,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<i64>,
}

/// Инициализация логирования: по умолчанию info (если RUST_LOG не задан),
/// чтобы [QUEUE]/[STORE] были видны. Вызывается встраивающим приложением.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
