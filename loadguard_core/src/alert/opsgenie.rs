//! Default alert sink: the Opsgenie REST API.
//!
//! Opens create alerts keyed by the incident alias; resets close the
//! open alert by that alias so the incident view stays tidy. All
//! credentials and the environment tag are injected — the library
//! never reads the process environment on its own, but
//! [`OpsgenieConfig::from_env`] is provided for hosts that keep the
//! conventional variable names.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tokio::time::timeout;
use tracing::debug;

use super::retry::Backoff;
use super::{fields, AlertFields, AlertSink, Priority};
use crate::error::AlertError;

pub const ENV_API_KEY: &str = "OPSGENIE_API_KEY";
pub const ENV_REGION: &str = "OPSGENIE_REGION";
pub const ENV_API_URL: &str = "OPSGENIE_API_URL";
pub const ENV_ENVIRONMENT: &str = "Environment";

const US_API_URL: &str = "https://api.opsgenie.com";
const EU_API_URL: &str = "https://api.eu.opsgenie.com";

/// Per-attempt HTTP timeout; the overall delivery deadline below caps
/// the retried total.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const DELIVERY_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpsgenieRegion {
  #[default]
  Us,
  Eu,
}

impl OpsgenieRegion {
  fn base_url(&self) -> &'static str {
    match self {
      Self::Us => US_API_URL,
      Self::Eu => EU_API_URL,
    }
  }
}

#[derive(Debug, Clone)]
pub struct OpsgenieConfig {
  pub api_key: String,
  pub region: OpsgenieRegion,
  /// Overrides the region URL when set; useful for proxies and tests.
  pub api_url: Option<String>,
  /// Tag stamped on every alert, e.g. `production`.
  pub environment: String,
}

impl OpsgenieConfig {
  /// Read the conventional environment variables. `None` when no API
  /// key is configured.
  pub fn from_env() -> Option<Self> {
    let api_key = env::var(ENV_API_KEY).ok().filter(|k| !k.is_empty())?;
    let region = match env::var(ENV_REGION).ok().as_deref() {
      Some("eu") | Some("EU") => OpsgenieRegion::Eu,
      _ => OpsgenieRegion::Us,
    };
    Some(Self {
      api_key,
      region,
      api_url: env::var(ENV_API_URL).ok().filter(|u| !u.is_empty()),
      environment: env::var(ENV_ENVIRONMENT).unwrap_or_else(|_| "production".to_string()),
    })
  }
}

pub struct OpsgenieSink {
  config: OpsgenieConfig,
  client: reqwest::Client,
  backoff: Backoff,
}

impl OpsgenieSink {
  pub fn new(config: OpsgenieConfig) -> Result<Self, AlertError> {
    if config.api_key.trim().is_empty() {
      return Err(AlertError::Configuration(
        "opsgenie api key is empty".to_string(),
      ));
    }
    let client = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| AlertError::Configuration(e.to_string()))?;
    Ok(Self {
      config,
      client,
      backoff: Backoff::default(),
    })
  }

  fn base_url(&self) -> &str {
    self
      .config
      .api_url
      .as_deref()
      .unwrap_or_else(|| self.config.region.base_url())
  }

  fn message_for(&self, verb: &str, alert_fields: &AlertFields) -> String {
    let breaker = alert_fields
      .get(fields::BREAKER)
      .map(String::as_str)
      .unwrap_or("breaker");
    format!("[{}] {} circuit breaker {}", self.config.environment, breaker, verb)
  }

  async fn create_alert(
    &self,
    verb: &str,
    priority: Priority,
    alert_fields: AlertFields,
  ) -> Result<(), AlertError> {
    let url = format!("{}/v2/alerts", self.base_url());
    let payload = json!({
      "message": self.message_for(verb, &alert_fields),
      "alias": alert_fields.get(fields::ALIAS).cloned().unwrap_or_default(),
      "priority": priority.as_str(),
      "tags": [self.config.environment.clone()],
      "details": alert_fields,
    });
    self
      .deliver(move || {
        self
          .client
          .post(&url)
          .header("Authorization", format!("GenieKey {}", self.config.api_key))
          .json(&payload)
          .send()
      })
      .await
  }

  async fn close_alert(&self, alias: &str, alert_fields: AlertFields) -> Result<(), AlertError> {
    let url = format!(
      "{}/v2/alerts/{}/close?identifierType=alias",
      self.base_url(),
      alias
    );
    let note = alert_fields
      .get(fields::RESOLUTION)
      .map(|r| format!("breaker closed ({r})"))
      .unwrap_or_else(|| "breaker closed".to_string());
    let payload = json!({ "note": note });
    self
      .deliver(move || {
        self
          .client
          .post(&url)
          .header("Authorization", format!("GenieKey {}", self.config.api_key))
          .json(&payload)
          .send()
      })
      .await
  }

  async fn deliver<F, Fut>(&self, request: F) -> Result<(), AlertError>
  where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>> + Send,
  {
    let attempt = || async {
      let response = request().await.map_err(classify_transport)?;
      let status = response.status();
      if status.is_success() {
        debug!(status = %status, "opsgenie delivery accepted");
        Ok(())
      } else {
        Err(classify_status(status))
      }
    };

    timeout(DELIVERY_DEADLINE, self.backoff.run(attempt))
      .await
      .map_err(|_| AlertError::Timeout(format!("delivery exceeded {DELIVERY_DEADLINE:?}")))?
  }
}

fn classify_transport(error: reqwest::Error) -> AlertError {
  if error.is_timeout() {
    AlertError::Timeout(error.to_string())
  } else {
    AlertError::Network(error.to_string())
  }
}

fn classify_status(status: StatusCode) -> AlertError {
  if status == StatusCode::TOO_MANY_REQUESTS {
    AlertError::RateLimit(status.to_string())
  } else if status.is_server_error() {
    AlertError::Network(format!("server error: {status}"))
  } else {
    AlertError::Rejected(status.to_string())
  }
}

#[async_trait]
impl AlertSink for OpsgenieSink {
  async fn open_alert(&self, priority: Priority, alert_fields: AlertFields) -> Result<(), AlertError> {
    self.create_alert("opened", priority, alert_fields).await
  }

  async fn reset_alert(&self, priority: Priority, alert_fields: AlertFields) -> Result<(), AlertError> {
    match alert_fields.get(fields::ALIAS).cloned() {
      Some(alias) if !alias.is_empty() => self.close_alert(&alias, alert_fields).await,
      // Nothing to close; surface the recovery as its own notification.
      _ => self.create_alert("reset", priority, alert_fields).await,
    }
  }

  async fn memory_alert(&self, priority: Priority, alert_fields: AlertFields) -> Result<(), AlertError> {
    self
      .create_alert("memory pressure", priority, alert_fields)
      .await
  }

  async fn latency_alert(&self, priority: Priority, alert_fields: AlertFields) -> Result<(), AlertError> {
    self
      .create_alert("latency degradation", priority, alert_fields)
      .await
  }
}
