//! Public HTTP API client
//!
//! Fetches `GET {http|https}://{public addr}/public/{round}` from a node.
//! With TLS, the node's certificate is written to a temporary file and
//! trusted as the only root for that node.

use beacon_demo_core::node::{async_trait, NodeAgent, PublicApi};
use beacon_demo_core::{Error, NodeIndex, Result};
use dashmap::DashMap;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

/// Header sent with every request
const CONTENT_HEADER: (&str, &str) = ("Context-type", "application/json");

/// Public API client for real nodes
pub struct HttpPublicApi {
    tls: bool,
    timeout: Duration,
    clients: DashMap<NodeIndex, Client>,
}

impl HttpPublicApi {
    /// Create a client; `tls` switches to HTTPS
    pub fn new(tls: bool) -> Self {
        Self {
            tls,
            timeout: Duration::from_secs(10),
            clients: DashMap::new(),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// URL of a round on a node's public API
    pub fn round_url(&self, public_addr: &str, round: u64) -> String {
        format!("{}://{}/public/{}", self.scheme(), public_addr, round)
    }

    async fn client_for(&self, node: &dyn NodeAgent) -> Result<Client> {
        if let Some(client) = self.clients.get(&node.index()) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().timeout(self.timeout);
        if self.tls {
            let cert_file = tempfile::NamedTempFile::new()?;
            node.write_certificate(cert_file.path()).await?;
            let pem = std::fs::read(cert_file.path())?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Http(format!("invalid certificate of node {}: {e}", node.index())))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        self.clients.insert(node.index(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl PublicApi for HttpPublicApi {
    fn describe(&self, node: &dyn NodeAgent, round: u64) -> String {
        let trust = if self.tls { "--cacert <node certificate> " } else { "" };
        format!(
            "curl -s {trust}-H '{}: {}' {}",
            CONTENT_HEADER.0,
            CONTENT_HEADER.1,
            self.round_url(node.public_addr(), round)
        )
    }

    #[instrument(skip(self, node), fields(index = node.index()))]
    async fn fetch_round(&self, node: &dyn NodeAgent, round: u64) -> Result<Vec<u8>> {
        let client = self.client_for(node).await?;
        let url = self.round_url(node.public_addr(), round);

        let response = client
            .get(&url)
            .header(CONTENT_HEADER.0, CONTENT_HEADER.1)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "GET {url} failed with status: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        debug!(round, bytes = body.len(), "Fetched public beacon");
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path as RoutePath;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use beacon_demo_core::node::{DkgParams, ReshareParams, Role, StartOptions};
    use beacon_demo_core::{BeaconValue, Group, NodeIdentity};
    use std::path::Path;

    /// Agent exposing only a public address
    struct PublicOnly {
        identity: NodeIdentity,
    }

    #[async_trait]
    impl NodeAgent for PublicOnly {
        fn identity(&self) -> &NodeIdentity {
            &self.identity
        }
        async fn write_certificate(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        async fn write_public(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        async fn start(&self, _: &StartOptions) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn ping(&self) -> bool {
            true
        }
        async fn run_dkg(&self, _: &DkgParams, _: &Role) -> Result<()> {
            Ok(())
        }
        async fn run_reshare(&self, _: &ReshareParams, _: &Role) -> Result<Group> {
            Err(Error::Node("unsupported".into()))
        }
        async fn chain_info(&self) -> bool {
            false
        }
        async fn get_group(&self) -> Result<Group> {
            Err(Error::Node("unsupported".into()))
        }
        async fn get_beacon(&self, _: &Path, round: u64) -> Result<(BeaconValue, String)> {
            Err(Error::BeaconNotReady(round))
        }
        async fn log_output(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    async fn public_round(
        RoutePath(round): RoutePath<u64>,
        headers: HeaderMap,
    ) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
        if headers.get("context-type").is_none() {
            return Err(StatusCode::BAD_REQUEST);
        }
        if round > 10 {
            return Err(StatusCode::NOT_FOUND);
        }
        Ok(Json(serde_json::json!({
            "round": round,
            "signature": hex::encode([round as u8; 4]),
            "previous_signature": "00",
        })))
    }

    async fn serve() -> PublicOnly {
        let app = Router::new().route("/public/:round", get(public_round));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        PublicOnly {
            identity: NodeIdentity::new(1, "127.0.0.1:1", &addr.to_string(), "3"),
        }
    }

    #[tokio::test]
    async fn test_fetch_round() {
        let node = serve().await;
        let api = HttpPublicApi::new(false);

        let body = api.fetch_round(&node, 4).await.unwrap();
        let value: BeaconValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(value.round, 4);
        assert_eq!(value.signature, vec![4; 4]);

        // the client is reused for the same node
        api.fetch_round(&node, 5).await.unwrap();
        assert_eq!(api.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let node = serve().await;
        let api = HttpPublicApi::new(false);

        let err = api.fetch_round(&node, 11).await.unwrap_err();
        assert!(matches!(err, Error::Http(ref msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let node = PublicOnly {
            identity: NodeIdentity::new(1, "127.0.0.1:1", "127.0.0.1:1", "3"),
        };
        let api = HttpPublicApi::new(false).with_timeout(Duration::from_secs(2));
        assert!(matches!(api.fetch_round(&node, 1).await, Err(Error::Http(_))));
    }

    #[test]
    fn test_describe() {
        let node = PublicOnly {
            identity: NodeIdentity::new(1, "a:1", "b:2", "3"),
        };
        assert_eq!(
            HttpPublicApi::new(false).describe(&node, 7),
            "curl -s -H 'Context-type: application/json' http://b:2/public/7"
        );
        assert!(HttpPublicApi::new(true)
            .describe(&node, 7)
            .contains("--cacert <node certificate> -H"));
        assert_eq!(HttpPublicApi::new(true).round_url("b:2", 7), "https://b:2/public/7");
    }
}
