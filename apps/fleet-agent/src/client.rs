use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_protocol::{
    InstanceHealthCheck, InstanceLogsPush, InstanceStatusUpdate, ManagedInstanceList,
    ProblemDetails, RefreshConnectivityRequest, RegisterRemoteRequest, RemoteRegistrationView,
};
use fleet_runtime::CurrentStatus;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

/// Agent side of the `/remotes` surface.
pub struct PlatformClient {
    http: Client,
    base: String,
    token: Option<String>,
}

impl PlatformClient {
    pub fn new(base: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleet-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/remotes{}", self.base, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header(ACCEPT, "application/json");
        match self.token.as_deref() {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        }
    }

    pub async fn register(&self, req: &RegisterRemoteRequest) -> Result<RemoteRegistrationView> {
        let resp = self
            .authed(self.http.post(self.url("/register")).json(req))
            .send()
            .await
            .context("register with platform")?;
        decode(resp, "register").await
    }

    pub async fn refresh_connectivity(
        &self,
        remote_id: &str,
        version: Option<String>,
    ) -> Result<RemoteRegistrationView> {
        let body = RefreshConnectivityRequest { version };
        let resp = self
            .authed(
                self.http
                    .put(self.url(&format!("/{remote_id}/refresh-connectivity")))
                    .json(&body),
            )
            .send()
            .await
            .context("refresh connectivity")?;
        decode(resp, "refresh connectivity").await
    }

    pub async fn managed_instances(&self, remote_id: &str) -> Result<ManagedInstanceList> {
        let resp = self
            .authed(
                self.http
                    .get(self.url(&format!("/{remote_id}/connector-instances"))),
            )
            .send()
            .await
            .context("list managed instances")?;
        decode(resp, "list managed instances").await
    }

    pub async fn update_status(
        &self,
        remote_id: &str,
        instance_id: &str,
        status: CurrentStatus,
    ) -> Result<()> {
        let body = InstanceStatusUpdate {
            current_status: status,
        };
        let resp = self
            .authed(
                self.http
                    .put(self.url(&format!(
                        "/{remote_id}/connector-instances/{instance_id}/status"
                    )))
                    .json(&body),
            )
            .send()
            .await
            .context("update instance status")?;
        ensure_success(resp, "update instance status").await
    }

    pub async fn push_health(
        &self,
        remote_id: &str,
        instance_id: &str,
        health: &InstanceHealthCheck,
    ) -> Result<()> {
        let resp = self
            .authed(
                self.http
                    .put(self.url(&format!(
                        "/{remote_id}/connector-instances/{instance_id}/health-check"
                    )))
                    .json(health),
            )
            .send()
            .await
            .context("push health check")?;
        ensure_success(resp, "push health check").await
    }

    pub async fn push_logs(
        &self,
        remote_id: &str,
        instance_id: &str,
        logs: Vec<String>,
    ) -> Result<()> {
        let body = InstanceLogsPush { logs };
        let resp = self
            .authed(
                self.http
                    .post(self.url(&format!(
                        "/{remote_id}/connector-instances/{instance_id}/logs"
                    )))
                    .json(&body),
            )
            .send()
            .await
            .context("push logs")?;
        ensure_success(resp, "push logs").await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
    let resp = check(resp, what).await?;
    resp.json()
        .await
        .with_context(|| format!("decode {what} response"))
}

async fn ensure_success(resp: Response, what: &str) -> Result<()> {
    check(resp, what).await.map(|_| ())
}

async fn check(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = match resp.json::<ProblemDetails>().await {
        Ok(problem) => problem.detail.unwrap_or(problem.title),
        Err(_) => status.canonical_reason().unwrap_or("error").to_string(),
    };
    bail!("{what} failed: {status}: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_rooted_under_remotes() {
        let client = PlatformClient::new("http://127.0.0.1:8092/", None, Duration::from_secs(1))
            .expect("client");
        assert_eq!(client.url("/register"), "http://127.0.0.1:8092/remotes/register");
        assert_eq!(
            client.url("/a1/connector-instances"),
            "http://127.0.0.1:8092/remotes/a1/connector-instances"
        );
    }

    #[test]
    fn blank_token_is_dropped() {
        let client = PlatformClient::new("http://x", Some("  ".into()), Duration::from_secs(1))
            .expect("client");
        assert!(client.token.is_none());
    }
}
