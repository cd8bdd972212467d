//! Host identity discovered once at startup from the EC2 metadata service.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_TTL_SECONDS: &str = "21600";
const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
const ZONE_PATH: &str = "/latest/meta-data/placement/availability-zone";
const REGION_PATH: &str = "/latest/meta-data/placement/region";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Errors raised while discovering the instance identity.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IdentityError {
    /// Raised when the metadata service cannot be reached.
    #[error("instance metadata unavailable at {endpoint} (not running on EC2?): {message}")]
    Unavailable {
        /// Metadata endpoint that was queried.
        endpoint: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when a metadata path answers with an error or empty body.
    #[error("instance metadata {path} returned {status}")]
    Missing {
        /// Metadata path that was requested.
        path: String,
        /// HTTP status or a note about the body.
        status: String,
    },
}

/// Immutable identity of the host this daemon manages volumes for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceIdentity {
    /// Provider instance identifier.
    pub instance_id: String,
    /// Region hosting the instance.
    pub region: String,
    /// Availability zone hosting the instance.
    pub availability_zone: String,
}

impl InstanceIdentity {
    /// Builds an identity from known values, trimming whitespace.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        region: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into().trim().to_owned(),
            region: region.into().trim().to_owned(),
            availability_zone: availability_zone.into().trim().to_owned(),
        }
    }

    /// Queries the metadata service rooted at `endpoint`.
    ///
    /// An IMDSv2 session token is requested first; when the token endpoint
    /// answers with a non-success status the lookups proceed without one.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Unavailable`] when the service cannot be
    /// reached and [`IdentityError::Missing`] when a required value is absent.
    pub async fn discover(endpoint: &str) -> Result<Self, IdentityError> {
        let client = MetadataClient::connect(endpoint).await?;
        let instance_id = client.require(INSTANCE_ID_PATH).await?;
        let availability_zone = client.require(ZONE_PATH).await?;
        let region = match client.get(REGION_PATH).await? {
            Some(region) => region,
            None => region_from_zone(&availability_zone),
        };

        let identity = Self::new(instance_id, region, availability_zone);
        info!(
            instance_id = %identity.instance_id,
            region = %identity.region,
            availability_zone = %identity.availability_zone,
            "auto-detected EC2 identity"
        );
        Ok(identity)
    }
}

struct MetadataClient {
    endpoint: String,
    token: Option<String>,
}

impl MetadataClient {
    async fn connect(endpoint: &str) -> Result<Self, IdentityError> {
        let root = endpoint.trim_end_matches('/').to_owned();
        let response = HTTP_CLIENT
            .put(format!("{root}{TOKEN_PATH}"))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .send()
            .await
            .map_err(|err| IdentityError::Unavailable {
                endpoint: root.clone(),
                message: err.to_string(),
            })?;

        let token = if response.status().is_success() {
            response.text().await.ok().map(|body| body.trim().to_owned())
        } else {
            debug!(status = %response.status(), "metadata token refused, using IMDSv1");
            None
        };
        Ok(Self {
            endpoint: root,
            token,
        })
    }

    async fn get(&self, path: &str) -> Result<Option<String>, IdentityError> {
        let mut request = HTTP_CLIENT.get(format!("{}{path}", self.endpoint));
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| IdentityError::Unavailable {
                endpoint: self.endpoint.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(IdentityError::Missing {
                path: path.to_owned(),
                status: status.to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| IdentityError::Unavailable {
                endpoint: self.endpoint.clone(),
                message: err.to_string(),
            })?;
        let value = body.trim();
        Ok((!value.is_empty()).then(|| value.to_owned()))
    }

    async fn require(&self, path: &str) -> Result<String, IdentityError> {
        self.get(path).await?.ok_or_else(|| IdentityError::Missing {
            path: path.to_owned(),
            status: String::from("no value"),
        })
    }
}

/// Derives a region from an availability zone (`us-east-1a` → `us-east-1`).
#[must_use]
pub fn region_from_zone(zone: &str) -> String {
    zone.trim_end_matches(|ch: char| ch.is_ascii_alphabetic())
        .to_owned()
}
