//! Client for the external reverse-proxy admin API (Traefik-compatible
//! dynamic config API, or any proxy exposing the same small surface: add
//! upstream, remove upstream, set weight, drain, health). Unlike a
//! static file-provider label config, azud's proxy is a long-lived shared
//! process the engine must mutate at runtime, so this goes over HTTP.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProxyConfig;

pub struct ProxyClient {
    http: Client,
    admin_base: String,
}

#[derive(Debug, Serialize)]
struct RegisterServiceBody<'a> {
    service: &'a str,
    host: &'a str,
    alternate_hosts: &'a [String],
    ssl: bool,
}

#[derive(Debug, Serialize)]
struct UpstreamBody<'a> {
    service: &'a str,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamHealth {
    pub target: String,
    pub healthy: bool,
    #[serde(default)]
    pub weight: Option<u8>,
}

impl ProxyClient {
    /// `admin_base` is the proxy's admin API root, e.g.
    /// `http://proxy-host:8081`. It is distinct from `proxy.host`, which is
    /// the public hostname routed to the service.
    pub fn new(admin_base: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build proxy admin HTTP client")?;
        Ok(Self {
            http,
            admin_base: admin_base.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.admin_base.trim_end_matches('/'), path)
    }

    /// Idempotent: a service that is already registered is treated as
    /// success rather than an error, since every deploy re-asserts routing.
    pub async fn register_service(&self, service: &str, proxy: &ProxyConfig) -> Result<()> {
        let body = RegisterServiceBody {
            service,
            host: &proxy.host,
            alternate_hosts: &proxy.alternate_hosts,
            ssl: proxy.ssl,
        };
        let resp = self
            .http
            .put(self.url(&format!("/services/{}", service)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to register service {}", service))?;
        self.accept_idempotent(resp, "register_service").await
    }

    pub async fn add_upstream(&self, service: &str, target: &str) -> Result<()> {
        self.add_weighted_upstream(service, target, None).await
    }

    pub async fn add_weighted_upstream(
        &self,
        service: &str,
        target: &str,
        weight: Option<u8>,
    ) -> Result<()> {
        let body = UpstreamBody {
            service,
            target,
            weight,
        };
        let resp = self
            .http
            .post(self.url(&format!("/services/{}/upstreams", service)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to add upstream {} to {}", target, service))?;
        self.accept_idempotent(resp, "add_upstream").await
    }

    pub async fn set_upstream_weight(&self, service: &str, target: &str, weight: u8) -> Result<()> {
        if weight > 100 {
            bail!("weight {} out of range 0..=100", weight);
        }
        let resp = self
            .http
            .patch(self.url(&format!(
                "/services/{}/upstreams/{}/weight",
                service, target
            )))
            .json(&serde_json::json!({ "weight": weight }))
            .send()
            .await
            .with_context(|| format!("failed to set weight for {} on {}", target, service))?;
        self.accept_idempotent(resp, "set_upstream_weight").await
    }

    /// Remove an upstream entirely. This removes it from the routing table
    /// (distinct from weight 0, which keeps it registered with no traffic
    /// — see SPEC_FULL.md's zero-weight-semantics decision).
    pub async fn remove_upstream(&self, service: &str, target: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/services/{}/upstreams/{}", service, target)))
            .send()
            .await
            .with_context(|| format!("failed to remove upstream {} from {}", target, service))?;
        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => bail!("remove_upstream {} on {} failed: {}", target, service, status),
        }
    }

    /// Drain `target` (ask the proxy to stop routing new connections while
    /// letting in-flight ones finish), waiting up to `timeout` for the
    /// proxy to report zero active connections before giving up.
    pub async fn drain_upstream(&self, service: &str, target: &str, timeout: Duration) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/services/{}/upstreams/{}/drain", service, target)))
            .send()
            .await
            .with_context(|| format!("failed to start drain for {} on {}", target, service))?;
        self.accept_idempotent(resp, "drain_upstream").await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let health = self.upstream_health(service).await?;
            let active = health.iter().find(|h| h.target == target);
            match active {
                Some(h) if !h.healthy => return Ok(()),
                None => return Ok(()),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("drain of {} on {} timed out, proceeding anyway", target, service);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub async fn upstream_health(&self, service: &str) -> Result<Vec<UpstreamHealth>> {
        let resp = self
            .http
            .get(self.url(&format!("/services/{}/upstreams", service)))
            .send()
            .await
            .with_context(|| format!("failed to fetch upstream health for {}", service))?;
        if !resp.status().is_success() {
            bail!("upstream_health for {} failed: {}", service, resp.status());
        }
        resp.json()
            .await
            .context("failed to parse upstream health response")
    }

    async fn accept_idempotent(&self, resp: reqwest::Response, op: &str) -> Result<()> {
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status if status.is_client_error() => {
                // A 4xx here is treated as "already in the desired state" —
                // every engine step re-asserts routing idempotently rather
                // than branching on first-time-vs-repeat.
                debug!("{} returned {} (treated as already satisfied)", op, status);
                Ok(())
            }
            status => bail!("{} failed: {}", op, status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_service_body_serializes_all_fields() {
        let body = RegisterServiceBody {
            service: "api",
            host: "api.example.com",
            alternate_hosts: &["api-alt.example.com".to_string()],
            ssl: true,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["service"], "api");
        assert_eq!(value["host"], "api.example.com");
        assert_eq!(value["alternate_hosts"][0], "api-alt.example.com");
        assert_eq!(value["ssl"], true);
    }

    #[test]
    fn unweighted_upstream_body_omits_weight_field() {
        let body = UpstreamBody {
            service: "api",
            target: "api",
            weight: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("weight").is_none());
    }

    #[test]
    fn weighted_upstream_body_includes_weight_field() {
        let body = UpstreamBody {
            service: "api",
            target: "api-canary-42",
            weight: Some(10),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["weight"], 10);
    }
}
