use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::info;

use crate::models::Product;

/// Ошибки удалённого сервиса данных (для разбора и логирования)
#[derive(Debug)]
pub enum RemoteError {
    Network(String),
    Http { status: u16, message: String },
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Network(s) => write!(f, "Network: {}", s),
            RemoteError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
        }
    }
}

/// Конфигурация удалённого сервиса (api_base_url, ключ, таймауты)
#[derive(Clone)]
pub struct RemoteConfig {
    pub api_base_url: String,
    /// Сервисный ключ; уходит в apikey + Authorization заголовки
    pub api_key: String,
    pub http_timeout_secs: u64,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://data.coalitionbrand.app/rest/v1".to_string(),
            api_key: String::new(),
            http_timeout_secs: 120,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Удалённое хранилище данных: insert / update-by-id / delete-by-id.
/// Очередь работает только через этот trait — в тестах подставляется мок.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert(&self, product: &Product) -> Result<(), RemoteError>;
    async fn update(&self, id: &str, product: &Product) -> Result<(), RemoteError>;
    async fn delete(&self, id: &str) -> Result<(), RemoteError>;
}

/// Колоночное представление товара, которое ожидает сервис данных.
/// price — в центах; snake_case имена совпадают с колонками таблицы products.
#[derive(Serialize)]
pub(crate) struct ProductRecord<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    pub(crate) price: i64,
    image_url: Option<&'a str>,
    category: Option<&'a str>,
    in_stock: bool,
}

impl<'a> From<&'a Product> for ProductRecord<'a> {
    fn from(p: &'a Product) -> Self {
        Self {
            id: &p.id,
            name: &p.name,
            description: &p.description,
            price: p.price_cents,
            image_url: p.image_url.as_deref(),
            category: p.category.as_deref(),
            in_stock: p.in_stock,
        }
    }
}

/// HTTP-клиент сервиса данных
pub struct HttpRemoteStore {
    client: reqwest::Client,
    api_base_url: String,
    api_key: String,
    app_version: String,
}

impl HttpRemoteStore {
    pub fn new(config: RemoteConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_base_url: config.api_base_url,
            api_key: config.api_key,
            app_version: config.app_version,
        }
    }

    fn with_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Content-Type", "application/json")
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-App-Version", &self.app_version)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<(), RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").into()
        } else {
            body
        };
        Err(RemoteError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn insert(&self, product: &Product) -> Result<(), RemoteError> {
        let url = format!("{}/products", self.api_base_url);
        let request = self
            .with_headers(self.client.post(&url))
            .json(&ProductRecord::from(product));
        self.execute(request).await
    }

    async fn update(&self, id: &str, product: &Product) -> Result<(), RemoteError> {
        let url = format!("{}/products/{}", self.api_base_url, id);
        let request = self
            .with_headers(self.client.patch(&url))
            .json(&ProductRecord::from(product));
        self.execute(request).await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/products/{}", self.api_base_url, id);
        let request = self.with_headers(self.client.delete(&url));
        match self.execute(request).await {
            // State-already-achieved: строки уже нет, повторять нечего
            Err(RemoteError::Http { status: 404, .. }) => {
                info!(
                    "[REMOTE] Product {} already absent, delete treated as achieved",
                    id
                );
                Ok(())
            }
            other => other,
        }
    }
}
