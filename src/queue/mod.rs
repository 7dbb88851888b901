use crate::models::{DroppedWrite, PendingWrite, Product, QueueStats, WriteOperation};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::KeyValueStore;
use crate::QueueStatusResponse;
use chrono::Utc;
use indexmap::IndexMap;
use scopeguard::guard;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Вся очередь хранится одним blob'ом под фиксированным ключом
const QUEUE_KEY: &str = "retry_queue";
/// Dead-letter: записи, исчерпавшие бюджет попыток
const DROPPED_KEY: &str = "retry_queue_dropped";
/// Unix millis последней успешно доставленной записи
const LAST_SUCCESS_KEY: &str = "retry_queue_last_success_at";

/// Конфигурация очереди. Дефолты — наблюдаемые константы:
/// backoff 10s/20s/40s/80s/160s, не более 5 попыток.
#[derive(Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_interval_ms: i64,
    pub tick_interval_secs: u64,
    /// Сколько dead-letter записей хранить; старые вытесняются
    pub dropped_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_interval_ms: 10_000,
            tick_interval_secs: 10,
            dropped_cap: 200,
        }
    }
}

/// Очередь отложенных записей в удалённое хранилище.
/// Single-flight via AtomicBool; lock held only for map/persist ops, NOT during network I/O.
/// Зависимости (storage, remote) внедряются конструктором — без module-global singleton.
#[derive(Clone)]
pub struct RetryQueue {
    pub(crate) entries: Arc<Mutex<IndexMap<String, PendingWrite>>>,
    pub(crate) dropped: Arc<Mutex<Vec<DroppedWrite>>>,
    storage: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    config: QueueConfig,
    /// Single-flight: не более одного processing pass одновременно
    is_processing: Arc<AtomicBool>,
    processor: Arc<Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>>,
}

impl RetryQueue {
    /// Создать очередь и восстановить стейт из хранилища.
    /// Нечитаемый или битый blob логируется и трактуется как пустая очередь.
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        config: QueueConfig,
    ) -> Self {
        let entries = Self::load_entries(storage.as_ref());
        let dropped = Self::load_dropped(storage.as_ref());
        if !entries.is_empty() {
            info!(
                "[QUEUE] Restored {} pending writes from storage",
                entries.len()
            );
        }
        Self {
            entries: Arc::new(Mutex::new(entries)),
            dropped: Arc::new(Mutex::new(dropped)),
            storage,
            remote,
            config,
            is_processing: Arc::new(AtomicBool::new(false)),
            processor: Arc::new(Mutex::new(None)),
        }
    }

    fn load_entries(storage: &dyn KeyValueStore) -> IndexMap<String, PendingWrite> {
        match storage.get_item(QUEUE_KEY) {
            Ok(Some(blob)) => match serde_json::from_str::<Vec<PendingWrite>>(&blob) {
                // Blob хранит массив в порядке вставки — порядок обхода восстанавливается
                Ok(writes) => writes.into_iter().map(|w| (w.id.clone(), w)).collect(),
                Err(e) => {
                    warn!(
                        "[QUEUE] Failed to parse persisted queue, starting empty: {}",
                        e
                    );
                    IndexMap::new()
                }
            },
            Ok(None) => IndexMap::new(),
            Err(e) => {
                warn!("[QUEUE] Failed to read persisted queue: {}", e);
                IndexMap::new()
            }
        }
    }

    fn load_dropped(storage: &dyn KeyValueStore) -> Vec<DroppedWrite> {
        match storage.get_item(DROPPED_KEY) {
            Ok(Some(blob)) => serde_json::from_str(&blob).unwrap_or_else(|e| {
                warn!("[QUEUE] Failed to parse dead-letter blob: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("[QUEUE] Failed to read dead-letter blob: {}", e);
                Vec::new()
            }
        }
    }

    fn lock_entries(&self) -> Option<MutexGuard<'_, IndexMap<String, PendingWrite>>> {
        match self.entries.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("[QUEUE] Entries mutex poisoned: {}", e);
                None
            }
        }
    }

    fn lock_dropped(&self) -> Option<MutexGuard<'_, Vec<DroppedWrite>>> {
        match self.dropped.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("[QUEUE] Dead-letter mutex poisoned: {}", e);
                None
            }
        }
    }

    /// Полная перезапись blob'а очереди в хранилище.
    /// Отказ хранилища логируется и не прерывает работу — in-memory стейт авторитетен.
    fn persist_entries(&self) {
        let blob = {
            let entries = match self.lock_entries() {
                Some(entries) => entries,
                None => return,
            };
            match serde_json::to_string(&entries.values().collect::<Vec<_>>()) {
                Ok(blob) => blob,
                Err(e) => {
                    error!("[QUEUE] Failed to serialize queue: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = self.storage.set_item(QUEUE_KEY, &blob) {
            warn!(
                "[QUEUE] Failed to persist queue, continuing in-memory: {}",
                e
            );
        }
    }

    fn persist_dropped(&self) {
        let blob = {
            let dropped = match self.lock_dropped() {
                Some(dropped) => dropped,
                None => return,
            };
            match serde_json::to_string(&*dropped) {
                Ok(blob) => blob,
                Err(e) => {
                    error!("[QUEUE] Failed to serialize dead-letter blob: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = self.storage.set_item(DROPPED_KEY, &blob) {
            warn!("[QUEUE] Failed to persist dead-letter blob: {}", e);
        }
    }

    /// Поставить неудавшуюся запись в очередь.
    /// Повторная постановка того же id заменяет payload/operation и
    /// инкрементит attempts — дубликат не создаётся.
    pub fn enqueue(&self, operation: WriteOperation, product: Product) {
        let now = Utc::now().timestamp_millis();
        let id = product.id.clone();
        let size = {
            let mut entries = match self.lock_entries() {
                Some(entries) => entries,
                None => return,
            };
            match entries.get_mut(&id) {
                Some(entry) => {
                    entry.operation = operation;
                    entry.payload = product;
                    entry.attempts += 1;
                    entry.last_attempt_at = now;
                }
                None => {
                    entries.insert(
                        id.clone(),
                        PendingWrite {
                            id: id.clone(),
                            operation,
                            payload: product,
                            attempts: 1,
                            last_attempt_at: now,
                            last_error: None,
                        },
                    );
                }
            }
            entries.len()
        };
        self.persist_entries();
        info!(
            "[QUEUE] Queued {} for {}, {} writes pending",
            operation.as_str(),
            id,
            size
        );
    }

    /// Отменить отложенную запись. Тихий no-op, если записи нет.
    pub fn remove(&self, id: &str) {
        let removed = {
            let mut entries = match self.lock_entries() {
                Some(entries) => entries,
                None => return,
            };
            entries.shift_remove(id).is_some()
        };
        if removed {
            self.persist_entries();
            debug!("[QUEUE] Cancelled pending write for {}", id);
        }
    }

    /// Количество отложенных записей
    pub fn pending_count(&self) -> usize {
        self.lock_entries().map(|e| e.len()).unwrap_or(0)
    }

    /// Снимок всех отложенных записей (в порядке вставки)
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.lock_entries()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Снимок dead-letter записей
    pub fn dropped_writes(&self) -> Vec<DroppedWrite> {
        self.lock_dropped().map(|d| d.clone()).unwrap_or_default()
    }

    /// Полная очистка очереди (safety valve для администратора)
    pub fn clear(&self) {
        if let Some(mut entries) = self.lock_entries() {
            entries.clear();
        }
        self.persist_entries();
        info!("[QUEUE] Queue cleared");
    }

    /// Вернуть до `limit` dead-letter записей обратно в очередь со свежим
    /// бюджетом попыток. Запись, чей id уже снова в очереди, считается
    /// вытесненной более новой и просто удаляется из dead-letter.
    pub fn retry_dropped(&self, limit: usize) -> usize {
        let now = Utc::now().timestamp_millis();
        let to_retry: Vec<DroppedWrite> = {
            let mut dropped = match self.lock_dropped() {
                Some(dropped) => dropped,
                None => return 0,
            };
            let n = limit.min(dropped.len());
            dropped.drain(..n).collect()
        };
        if to_retry.is_empty() {
            return 0;
        }
        let mut requeued = 0;
        {
            let mut entries = match self.lock_entries() {
                Some(entries) => entries,
                None => return 0,
            };
            for item in to_retry {
                let mut write = item.write;
                if entries.contains_key(&write.id) {
                    continue;
                }
                write.attempts = 1;
                write.last_attempt_at = now;
                write.last_error = None;
                entries.insert(write.id.clone(), write);
                requeued += 1;
            }
        }
        self.persist_entries();
        self.persist_dropped();
        info!("[QUEUE] Re-queued {} dropped writes", requeued);
        requeued
    }

    /// Статистика очереди по видам операций
    pub fn stats(&self) -> QueueStats {
        let mut pending_by_operation: HashMap<String, usize> = HashMap::new();
        let pending_count = match self.lock_entries() {
            Some(entries) => {
                for write in entries.values() {
                    *pending_by_operation
                        .entry(write.operation.as_str().to_string())
                        .or_insert(0) += 1;
                }
                entries.len()
            }
            None => 0,
        };
        QueueStats {
            pending_count,
            dropped_count: self.lock_dropped().map(|d| d.len()).unwrap_or(0),
            pending_by_operation,
        }
    }

    /// Сводка состояния для диагностики/бейджа админ-панели
    pub async fn status(&self) -> QueueStatusResponse {
        let last_success_at = match self.storage.get_item(LAST_SUCCESS_KEY) {
            Ok(Some(value)) => value.parse::<i64>().ok(),
            _ => None,
        };
        QueueStatusResponse {
            pending_count: self.pending_count(),
            dropped_count: self.lock_dropped().map(|d| d.len()).unwrap_or(0),
            is_online: crate::network::check_online_status().await,
            last_success_at,
        }
    }

    /// Запустить фоновый processor (идемпотентно).
    /// Требует работающего tokio runtime.
    pub fn start(&self) {
        let mut processor = match self.processor.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("[QUEUE] Processor mutex poisoned: {}", e);
                return;
            }
        };
        if let Some((handle, _)) = processor.as_ref() {
            if !handle.is_finished() {
                debug!("[QUEUE] Processor already running");
                return;
            }
        }

        let queue = self.clone();
        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();
        let tick = Duration::from_secs(self.config.tick_interval_secs);
        let handle = tokio::spawn(async move {
            // Стартовый jitter (1-3s): рестарты множества инстансов не бьют
            // по сервису данных одновременно
            let jitter_ms: u64 = rand::random::<u32>() as u64 % 2000 + 1000;
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

            info!("[QUEUE] Background processor started");
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_task.notified() => {
                        info!("[QUEUE] Background processor stopped");
                        break;
                    }
                }
                // stop() не отменяет pass, который уже начался: select ждёт
                // только между проходами
                let synced = queue.process_pending().await;
                if synced > 0 {
                    info!("[QUEUE] Background pass: {} writes landed", synced);
                }
            }
        });
        *processor = Some((handle, shutdown));
    }

    /// Остановить фоновый processor. Начатый pass доработает до конца.
    pub fn stop(&self) {
        let taken = match self.processor.lock() {
            Ok(mut guard) => guard.take(),
            Err(e) => {
                error!("[QUEUE] Processor mutex poisoned: {}", e);
                return;
            }
        };
        if let Some((_handle, shutdown)) = taken {
            shutdown.notify_one();
        }
    }

    /// Один processing pass: для каждой записи независимо — дропнуть по
    /// бюджету, пропустить по backoff, либо сделать ровно одну попытку.
    /// Возвращает число доставленных записей. Single-flight: если pass уже
    /// идёт, второй вызов ничего не делает.
    pub async fn process_pending(&self) -> usize {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[QUEUE] Another pass already in progress, skipping");
            return 0;
        }
        // Флаг сбрасывается на любом пути выхода, включая панику
        let _guard = guard((), |_| {
            self.is_processing.store(false, Ordering::Release);
        });

        let ids: Vec<String> = match self.lock_entries() {
            Some(entries) => entries.keys().cloned().collect(),
            None => return 0,
        };
        if ids.is_empty() {
            debug!("[QUEUE] No pending writes");
            return 0;
        }

        let mut synced = 0;
        for id in ids {
            // Снимок записи: она могла быть отменена после начала pass'а
            let write = {
                let entries = match self.lock_entries() {
                    Some(entries) => entries,
                    None => return synced,
                };
                match entries.get(&id) {
                    Some(write) => write.clone(),
                    None => continue,
                }
            };

            if write.attempts >= self.config.max_attempts {
                self.drop_write(&id, write);
                continue;
            }

            // Exponential backoff: 2^(attempts-1) * base
            let exp = write.attempts.saturating_sub(1).min(30);
            let delay = self.config.base_interval_ms.saturating_mul(1_i64 << exp);
            let now = Utc::now().timestamp_millis();
            if now - write.last_attempt_at < delay {
                continue;
            }

            info!(
                "[QUEUE] Attempting {} for {} (attempt {})",
                write.operation.as_str(),
                id,
                write.attempts
            );
            // Network I/O outside the lock
            let result = self.dispatch(&write).await;
            match result {
                Ok(()) => {
                    if let Some(mut entries) = self.lock_entries() {
                        entries.shift_remove(&id);
                    }
                    self.persist_entries();
                    self.record_success();
                    synced += 1;
                    info!("[QUEUE] Write for {} landed", id);
                }
                Err(e) => {
                    let error_message = e.to_string();
                    let now = Utc::now().timestamp_millis();
                    if let Some(mut entries) = self.lock_entries() {
                        if let Some(entry) = entries.get_mut(&id) {
                            entry.attempts += 1;
                            entry.last_attempt_at = now;
                            entry.last_error = Some(error_message.clone());
                        }
                    }
                    self.persist_entries();
                    warn!(
                        "[QUEUE] Write for {} failed (attempt {}): {}",
                        id, write.attempts, error_message
                    );
                }
            }
        }
        synced
    }

    async fn dispatch(&self, write: &PendingWrite) -> Result<(), RemoteError> {
        match write.operation {
            WriteOperation::Add => self.remote.insert(&write.payload).await,
            WriteOperation::Update => self.remote.update(&write.id, &write.payload).await,
            WriteOperation::Delete => self.remote.delete(&write.id).await,
        }
    }

    /// Бюджет попыток исчерпан: убрать из очереди и переложить в dead-letter
    fn drop_write(&self, id: &str, write: PendingWrite) {
        error!(
            "[QUEUE] Abandoning {} for {} after {} attempts: {}",
            write.operation.as_str(),
            id,
            write.attempts,
            write.last_error.as_deref().unwrap_or("unknown error")
        );
        if let Some(mut entries) = self.lock_entries() {
            entries.shift_remove(id);
        }
        let error_message = write
            .last_error
            .clone()
            .unwrap_or_else(|| "retry budget exhausted".to_string());
        if let Some(mut dropped) = self.lock_dropped() {
            dropped.push(DroppedWrite {
                write,
                error_message,
                dropped_at: Utc::now().timestamp_millis(),
            });
            // Cap: старые записи вытесняются
            if dropped.len() > self.config.dropped_cap {
                let excess = dropped.len() - self.config.dropped_cap;
                dropped.drain(..excess);
            }
        }
        self.persist_entries();
        self.persist_dropped();
    }

    fn record_success(&self) {
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.storage.set_item(LAST_SUCCESS_KEY, &now.to_string()) {
            warn!("[QUEUE] Failed to update last_success_at: {}", e);
        }
    }
}
