use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tracing::debug;
use url::Url;

use super::{
    driver::{Driver, PlayerUpdate, RestRequest},
    NodeOptions,
};
use crate::{error::NodeError, sources::SearchResult};

/// Ejecuta peticiones construidas por un [`Driver`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestTransport: Send + Sync {
    /// Devuelve el cuerpo JSON de la respuesta (`Value::Null` si no hay).
    async fn execute(&self, request: RestRequest) -> Result<Value, NodeError>;
}

/// Transporte HTTP real sobre `reqwest`.
pub struct HttpTransport {
    client: Client,
    base: Url,
    password: String,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(options: &NodeOptions, user_agent: &str) -> Result<Self, NodeError> {
        let scheme = if options.secure { "https" } else { "http" };
        let base = Url::parse(&format!("{}://{}", scheme, options.url))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base,
            password: options.auth.clone(),
            user_agent: user_agent.to_string(),
        })
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn execute(&self, request: RestRequest) -> Result<Value, NodeError> {
        let url = self.base.join(&request.path)?;
        debug!("🌐 {} {}", request.method, url);

        let mut builder = self
            .client
            .request(request.method, url)
            .header(header::AUTHORIZATION, &self.password)
            .header(header::USER_AGENT, &self.user_agent)
            .query(&request.query);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body["message"]
                .as_str()
                .or_else(|| status.canonical_reason())
                .unwrap_or("unknown error")
                .to_string();
            return Err(NodeError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        if text.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_str(&text)?)
        }
    }
}

/// Cliente request/response de un nodo: driver + transporte + sesión.
pub struct Rest {
    node: String,
    driver: Arc<dyn Driver>,
    transport: Arc<dyn RestTransport>,
    session_id: RwLock<Option<String>>,
}

impl Rest {
    pub fn new(node: impl Into<String>, driver: Arc<dyn Driver>, transport: Arc<dyn RestTransport>) -> Self {
        Self {
            node: node.into(),
            driver,
            transport,
            session_id: RwLock::new(None),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub(crate) fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.write() = session_id;
    }

    fn require_session(&self) -> Result<String, NodeError> {
        self.session_id()
            .ok_or_else(|| NodeError::NoSession(self.node.clone()))
    }

    pub async fn update_player(&self, guild_id: GuildId, update: &PlayerUpdate) -> Result<Value, NodeError> {
        let session_id = self.require_session()?;
        let request = self.driver.update_player(&session_id, guild_id, update);
        self.transport.execute(request).await
    }

    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<(), NodeError> {
        let session_id = self.require_session()?;
        let request = self.driver.destroy_player(&session_id, guild_id);
        self.transport.execute(request).await.map(|_| ())
    }

    pub async fn update_session(&self, timeout: Duration) -> Result<(), NodeError> {
        let session_id = self.require_session()?;
        let request = self.driver.update_session(&session_id, timeout);
        self.transport.execute(request).await.map(|_| ())
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<SearchResult, NodeError> {
        let request = self.driver.load_tracks(identifier);
        let payload = self.transport.execute(request).await?;
        self.driver.parse_load_result(payload)
    }
}
