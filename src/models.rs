use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Товар каталога — полный снимок сущности на момент постановки в очередь
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Цена в центах (целое, без float-артефактов)
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub in_stock: bool,
}

/// Вид операции записи в удалённое хранилище
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Add,
    Update,
    Delete,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Add => "add",
            WriteOperation::Update => "update",
            WriteOperation::Delete => "delete",
        }
    }
}

/// Одна отложенная запись. Ключ очереди — id сущности:
/// на один id существует не более одной записи.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWrite {
    pub id: String,
    pub operation: WriteOperation,
    pub payload: Product,
    /// Количество неудачных попыток; 1 сразу после первого отказа
    pub attempts: u32,
    /// Unix millis последней попытки
    pub last_attempt_at: i64,
    /// Текст последней ошибки (для диагностики и dead-letter)
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Запись, выбывшая из очереди после исчерпания бюджета попыток
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedWrite {
    pub write: PendingWrite,
    pub error_message: String,
    /// Unix millis момента выбытия
    pub dropped_at: i64,
}

/// Статистика очереди (для админ-панели)
#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub dropped_count: usize,
    pub pending_by_operation: HashMap<String, usize>,
}
