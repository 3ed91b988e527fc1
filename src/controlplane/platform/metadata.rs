//! Instance Metadata
//!
//! Resolves the region, availability zone and instance id of the local
//! instance from the instance-metadata service, once, at startup.

use crate::domain::ports::InstanceContext;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

const DEFAULT_ENDPOINT: &str = "http://169.254.169.254";
const TOKEN_PATH: &str = "/latest/api/token";
const IDENTITY_PATH: &str = "/latest/dynamic/instance-identity/document";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECS: u32 = 21600;

// =============================================================================
// Identity Document
// =============================================================================

/// The parts of the instance identity document we use
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    region: String,
    availability_zone: String,
    instance_id: String,
}

impl IdentityDocument {
    fn into_context(self) -> Result<InstanceContext> {
        if self.region.is_empty() || self.availability_zone.is_empty() || self.instance_id.is_empty()
        {
            return Err(Error::InstanceMetadata(
                "identity document has empty fields".into(),
            ));
        }
        Ok(InstanceContext {
            region: self.region,
            availability_zone: self.availability_zone,
            instance_id: self.instance_id,
        })
    }
}

// =============================================================================
// Metadata Client
// =============================================================================

/// Client for the instance-metadata service
#[derive(Debug, Clone)]
pub struct MetadataClient {
    endpoint: String,
    http: reqwest::Client,
}

impl MetadataClient {
    /// Create a client for the link-local metadata endpoint
    pub fn new() -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Create a client for a custom endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Fetch a session token; `None` when only tokenless access works
    async fn session_token(&self) -> Option<String> {
        let response = self
            .http
            .put(format!("{}{}", self.endpoint, TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS.to_string())
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => r.text().await.ok(),
            Ok(r) => {
                warn!("Metadata token request returned {}, using tokenless access", r.status());
                None
            }
            Err(e) => {
                warn!("Metadata token request failed: {}, using tokenless access", e);
                None
            }
        }
    }

    /// Resolve the local instance's identity
    pub async fn instance_context(&self) -> Result<InstanceContext> {
        let token = self.session_token().await;

        let mut request = self.http.get(format!("{}{}", self.endpoint, IDENTITY_PATH));
        if let Some(token) = &token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::InstanceMetadata(format!(
                "identity document request returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        debug!("Instance identity document: {}", body);
        let context = parse_identity(&body)?;

        info!("Setting region: {}", context.region);
        info!("Setting availability zone: {}", context.availability_zone);
        info!("Setting instance id: {}", context.instance_id);

        Ok(context)
    }
}

fn parse_identity(body: &str) -> Result<InstanceContext> {
    let document: IdentityDocument = serde_json::from_str(body)?;
    document.into_context()
}
