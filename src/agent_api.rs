//! Wire contract toward the node agent: the nested-container calls, the
//! response envelope, and the HTTP client used for pooled one-shot calls
//! and dedicated long-poll connections.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::data_model::{CommandInfo, ContainerId, ContainerInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCall {
    LaunchNestedContainer {
        container_id: ContainerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<CommandInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<ContainerInfo>,
    },
    WaitNestedContainer {
        container_id: ContainerId,
    },
    KillNestedContainer {
        container_id: ContainerId,
        signal: i32,
    },
}

/// Payload of a successful `WAIT_NESTED_CONTAINER` response. A missing
/// exit status means the agent lost track of the container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitNestedContainer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    wait_nested_container: Option<WaitNestedContainer>,
}

/// An HTTP-level response from the agent. Transport failures never reach
/// this type; they surface as [`AgentError`].
#[derive(Debug, Clone)]
pub struct AgentResponse {
    status: StatusCode,
    body: Bytes,
}

impl AgentResponse {
    pub fn new(status: StatusCode, body: Bytes) -> Self {
        Self { status, body }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.status == StatusCode::SERVICE_UNAVAILABLE
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the wait payload out of a 200 response.
    pub fn wait_nested_container(&self) -> Result<WaitNestedContainer, AgentError> {
        let envelope: ResponseEnvelope = serde_json::from_slice(&self.body)
            .map_err(|err| AgentError::Decode(err.to_string()))?;
        envelope
            .wait_nested_container
            .ok_or_else(|| AgentError::Decode("missing wait_nested_container payload".to_string()))
    }
}

/// Splits transient transport failures from protocol-level ones so callers
/// can apply the retry-versus-shutdown policy.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("unable to establish connection with the agent: {0}")]
    Connect(String),
    #[error("agent request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed agent response: {0}")]
    Decode(String),
}

/// A dedicated connection to the agent, used for long-poll waits so each
/// child container blocks on its own socket.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    async fn call(&self, call: AgentCall) -> Result<AgentResponse, AgentError>;
}

/// Agent API client. `call` uses the shared connection pool; `connect`
/// establishes a dedicated connection.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn AgentConnection>, AgentError>;
    async fn call(&self, call: AgentCall) -> Result<AgentResponse, AgentError>;
}

pub struct HttpAgentClient {
    api_url: String,
    authority: String,
    auth_header: Option<String>,
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(api_url: String, authority: String, auth_header: Option<String>) -> Self {
        Self {
            api_url,
            authority,
            auth_header,
            http: reqwest::Client::new(),
        }
    }

    async fn post(
        http: &reqwest::Client,
        api_url: &str,
        auth_header: &Option<String>,
        call: &AgentCall,
    ) -> Result<AgentResponse, AgentError> {
        let mut request = http.post(api_url).json(call);
        if let Some(header) = auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok(AgentResponse::new(status, body))
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn connect(&self) -> Result<Box<dyn AgentConnection>, AgentError> {
        // Probe the agent socket so connection failures surface here rather
        // than on the first call issued over the new connection.
        TcpStream::connect(&self.authority)
            .await
            .map_err(|err| AgentError::Connect(err.to_string()))?;
        Ok(Box::new(HttpAgentConnection {
            api_url: self.api_url.clone(),
            auth_header: self.auth_header.clone(),
            http: reqwest::Client::new(),
        }))
    }

    async fn call(&self, call: AgentCall) -> Result<AgentResponse, AgentError> {
        Self::post(&self.http, &self.api_url, &self.auth_header, &call).await
    }
}

struct HttpAgentConnection {
    api_url: String,
    auth_header: Option<String>,
    http: reqwest::Client,
}

#[async_trait]
impl AgentConnection for HttpAgentConnection {
    async fn call(&self, call: AgentCall) -> Result<AgentResponse, AgentError> {
        HttpAgentClient::post(&self.http, &self.api_url, &self.auth_header, &call).await
    }
}
