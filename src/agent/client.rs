use std::time::Duration;

use async_trait::async_trait;

use super::protocol::{AgentDirective, AgentReport};
use crate::error::{PlaneError, Result};
use crate::plane::Plane;

pub const REPORT_PATH: &str = "/api/v1/agents/report";

/// The controller as seen from an agent.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn report(&self, report: AgentReport) -> Result<AgentDirective>;
}

/// Reports to a remote controller over HTTP.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    url: String,
}

impl HttpControlPlane {
    pub fn new(controller_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PlaneError::Infrastructure(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}{}", controller_url.trim_end_matches('/'), REPORT_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn report(&self, report: AgentReport) -> Result<AgentDirective> {
        let response = self
            .client
            .post(&self.url)
            .json(&report)
            .send()
            .await
            .map_err(|e| PlaneError::Infrastructure(format!("report to {} failed: {}", self.url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlaneError::Infrastructure(format!(
                "controller answered {}: {}",
                status, body
            )));
        }
        response
            .json::<AgentDirective>()
            .await
            .map_err(|e| PlaneError::Infrastructure(format!("unreadable directive: {}", e)))
    }
}

/// In-process controller, for agents colocated with the plane.
#[async_trait]
impl ControlPlane for Plane {
    async fn report(&self, report: AgentReport) -> Result<AgentDirective> {
        self.handle_agent_report(report).await
    }
}
