//! 远端 REST API
//!
//! - 每个 SyncOperation 对应一次 HTTP 请求，body 为 payload
//! - `Idempotency-Key` 头在所有重试中保持不变
//! - 401 → [`FieldOpsError::AuthExpired`]，其他非 2xx → [`FieldOpsError::Remote`]

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::FieldOpsConfig;
use crate::error::{FieldOpsError, Result};
use crate::storage::queue::{HttpMethod, SyncOperation};
use crate::storage::EntityType;
use crate::version;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// 错误信息中保留的响应体长度
const MAX_ERROR_BODY: usize = 512;

#[async_trait]
pub trait RemoteApi: Debug + Send + Sync {
    /// 发送一个同步操作，返回响应体（非 JSON 或为空时为 None）
    async fn send_operation(&self, op: &SyncOperation, token: Option<&str>) -> Result<Option<Value>>;

    /// GET /api/<resource>/<id>
    async fn fetch_record(&self, entity_type: EntityType, id: &str, token: Option<&str>) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
}

impl HttpRemoteApi {
    pub fn new(config: &FieldOpsConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.sync.connect_timeout_secs))
            .timeout(Duration::from_secs(config.sync.request_timeout_secs))
            .user_agent(version::user_agent())
            .build()
            .map_err(|e| FieldOpsError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = config.api_base_url.trim_end_matches('/').to_string();
        info!("✅ HTTP 客户端已创建 (base_url: {})", base_url);
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn authorize(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 401 {
            return Err(FieldOpsError::AuthExpired);
        }
        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Err(FieldOpsError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

fn method_of(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn send_operation(&self, op: &SyncOperation, token: Option<&str>) -> Result<Option<Value>> {
        debug!(
            "📤 {} {} (op={}, attempt={})",
            op.method.as_str(),
            op.endpoint,
            op.id,
            op.attempts + 1
        );
        let builder = self
            .client
            .request(method_of(op.method), self.url(&op.endpoint))
            .header(IDEMPOTENCY_KEY_HEADER, &op.idempotency_key)
            .json(&op.payload);
        let response = Self::authorize(builder, token).send().await?;
        let response = Self::check(response).await?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&body).ok())
    }

    async fn fetch_record(&self, entity_type: EntityType, id: &str, token: Option<&str>) -> Result<Value> {
        let endpoint = format!("/api/{}/{}", entity_type.resource(), id);
        let builder = self.client.get(self.url(&endpoint));
        let response = Self::authorize(builder, token).send().await?;
        let response = Self::check(response).await?;
        let value = response.json::<Value>().await?;
        Ok(value)
    }
}
