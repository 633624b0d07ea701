//! Clients for the external text-to-SQL agent and plugin selector.
//!
//! Both are separate services; this process only validates requests and
//! forwards them, returning the upstream JSON unmodified.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::CollaboratorsConfig;

#[derive(thiserror::Error, Debug)]
pub enum CollaboratorError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query2SqlRequest {
    pub query_text: String,
    pub schema: Value,
    pub current_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linking: Option<Value>,
}

/// Few-shot example configuration of the text-to-SQL agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExampleSettings {
    pub sql_examplars: Vec<Value>,
    pub example_nums: u32,
    pub is_shortcut: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSelectionRequest {
    pub query_text: String,
    pub plugin_configs: Value,
}

pub trait Text2SqlAgent: Send + Sync {
    fn query2sql(&self, request: Query2SqlRequest) -> Result<Value, CollaboratorError>;

    fn update_examples(&self, settings: ExampleSettings) -> Result<(), CollaboratorError>;
}

pub trait PluginSelector: Send + Sync {
    fn select(&self, request: PluginSelectionRequest) -> Result<Value, CollaboratorError>;
}

/// Forwards to a collaborator service over HTTP.
pub struct RemoteCollaborator {
    name: &'static str,
    remote_addr: Option<String>,
    client: reqwest::blocking::Client,
}

impl RemoteCollaborator {
    pub fn new(
        name: &'static str,
        addr: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let remote_addr = addr.map(|addr| addr.strip_suffix('/').unwrap_or(addr).to_string());
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            name,
            remote_addr,
            client,
        })
    }

    pub fn text2sql(config: &CollaboratorsConfig) -> Result<Self, CollaboratorError> {
        Self::new(
            "text2sql agent",
            config.text2sql_url.as_deref(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn plugin_selector(config: &CollaboratorsConfig) -> Result<Self, CollaboratorError> {
        Self::new(
            "plugin selector",
            config.plugin_selection_url.as_deref(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<Value, CollaboratorError> {
        let remote_addr = self
            .remote_addr
            .as_ref()
            .ok_or(CollaboratorError::NotConfigured(self.name))?;
        let url = format!("{}{}", remote_addr, url);
        log::info!("forwarding to {} at {}", self.name, url);

        let response = self.client.post(&url).json(body).send()?;
        handle_response(response)
    }
}

fn handle_response(response: reqwest::blocking::Response) -> Result<Value, CollaboratorError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        log::error!("upstream error {status}: {text}");
        return Err(CollaboratorError::Upstream {
            status: status.as_u16(),
            body: text,
        });
    }

    // upstream may answer with a bare string such as "success"
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

impl Text2SqlAgent for RemoteCollaborator {
    fn query2sql(&self, request: Query2SqlRequest) -> Result<Value, CollaboratorError> {
        self.post("/query2sql/", &request)
    }

    fn update_examples(&self, settings: ExampleSettings) -> Result<(), CollaboratorError> {
        self.post("/query2sql_setting_update/", &settings).map(|_| ())
    }
}

impl PluginSelector for RemoteCollaborator {
    fn select(&self, request: PluginSelectionRequest) -> Result<Value, CollaboratorError> {
        self.post("/plugin_selection/", &request)
    }
}
