//! License authority HTTP client (§6: "External Interfaces").
//!
//! The authority is a remote collaborator, not something this crate
//! implements — [`LicenseAuthorityClient`] is the narrow capability set
//! [`crate::sync`] and [`crate::validation`] need from it, matching the
//! design notes' guidance against duck-typed provider objects.
//! [`HttpLicenseAuthorityClient`] is the one production implementation,
//! built on `reqwest` for outbound HTTP, same as the rest of this
//! workspace's gateway clients.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LicenseError, Result};

/// 15s validation timeout (§5).
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(15);
/// 30s sync timeout (§5).
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// A module a license enables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleGrant {
    /// Module identifier.
    pub module_id: String,
}

/// Seat/resource limits attached to a license.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseLimits {
    /// Maximum user seats.
    pub max_users: u32,
}

/// The authority's view of one company's license, as returned by
/// `GET /licenses/company/<tenantId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityLicense {
    /// Authority-assigned unique id.
    pub license_id: String,
    /// Human-facing license number.
    pub license_number: String,
    /// Tenant/company id this license belongs to.
    pub company_id: String,
    /// Tier name, matching [`crate::record::LicenseType`]'s serialization.
    pub license_type: String,
    /// Status name, matching [`crate::record::LicenseStatus`]'s serialization.
    pub status: String,
    /// Expiry timestamp.
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Seat limits.
    pub limits: LicenseLimits,
    /// Enabled modules.
    pub modules: Vec<ModuleGrant>,
    /// Passphrase-derivable key material for the encrypted payload; the
    /// authority is the source of truth for this, not a local secret.
    pub encryption_key: String,
}

/// Envelope returned by `GET /licenses/company/<tenantId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyLicenseResponse {
    /// The license itself.
    pub license: AuthorityLicense,
}

/// Body of `POST /licenses/<licenseId>/validate`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    /// License id being validated.
    pub license_id: String,
    /// Client-observed timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Optional usage snapshot, reported opportunistically.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
}

/// Response from `POST /licenses/<licenseId>/validate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    /// Whether the authority considers the license usable.
    pub valid: bool,
    /// Machine-readable reason when `valid` is false, e.g.
    /// `"LICENSE_EXPIRED"` or `"LICENSE_REVOKED"`.
    #[serde(default)]
    pub error: Option<String>,
    /// Feature flags the authority wants to surface, if any.
    #[serde(default)]
    pub features: Option<Vec<String>>,
    /// Authority's current view of the expiry date, if it differs.
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Body of `PUT /licenses/<licenseId>/usage`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    /// License id the usage applies to.
    pub license_id: String,
    /// Opaque usage payload.
    pub usage: serde_json::Value,
    /// Client-observed timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Response from `PUT /licenses/<licenseId>/usage`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    /// Whether the authority accepted the report.
    pub success: bool,
    /// Authority-defined result payload.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// Capability set the license sync and validation passes need from the
/// remote authority. Implemented once over HTTP; swappable in tests for a
/// mock that never performs real network I/O.
#[async_trait]
pub trait LicenseAuthorityClient: Send + Sync {
    /// `GET /licenses/company/<tenantId>`.
    async fn fetch_company_license(&self, tenant_id: &str) -> Result<CompanyLicenseResponse>;

    /// `POST /licenses/<licenseId>/validate`.
    async fn validate(&self, request: ValidateRequest) -> Result<ValidateResponse>;

    /// `PUT /licenses/<licenseId>/usage`.
    async fn report_usage(&self, report: UsageReport) -> Result<UsageResponse>;

    /// `GET /health`.
    async fn health(&self) -> bool;
}

/// Production [`LicenseAuthorityClient`] backed by `reqwest`.
pub struct HttpLicenseAuthorityClient {
    base_url: String,
    api_key: String,
    sync_client: reqwest::Client,
    validation_client: reqwest::Client,
}

impl HttpLicenseAuthorityClient {
    /// Construct a client against `base_url`, authenticating with
    /// `api_key` as a bearer credential.
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let sync_client = reqwest::Client::builder()
            .timeout(SYNC_TIMEOUT)
            .build()
            .map_err(|e| LicenseError::Config(format!("failed to build HTTP client: {e}")))?;
        let validation_client = reqwest::Client::builder()
            .timeout(VALIDATION_TIMEOUT)
            .build()
            .map_err(|e| LicenseError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            api_key,
            sync_client,
            validation_client,
        })
    }
}

#[async_trait]
impl LicenseAuthorityClient for HttpLicenseAuthorityClient {
    async fn fetch_company_license(&self, tenant_id: &str) -> Result<CompanyLicenseResponse> {
        let url = format!("{}/licenses/company/{}", self.base_url, tenant_id);
        let response = self
            .sync_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LicenseError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LicenseError::Remote(format!(
                "authority returned {} for {}",
                response.status(),
                url
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LicenseError::Remote(format!("malformed authority response: {e}")))
    }

    async fn validate(&self, request: ValidateRequest) -> Result<ValidateResponse> {
        let url = format!("{}/licenses/{}/validate", self.base_url, request.license_id);
        let response = self
            .validation_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LicenseError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LicenseError::Remote(format!(
                "authority returned {} for {}",
                response.status(),
                url
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LicenseError::Remote(format!("malformed authority response: {e}")))
    }

    async fn report_usage(&self, report: UsageReport) -> Result<UsageResponse> {
        let url = format!("{}/licenses/{}/usage", self.base_url, report.license_id);
        let response = self
            .sync_client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(&report)
            .send()
            .await
            .map_err(|e| LicenseError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LicenseError::Remote(format!(
                "authority returned {} for {}",
                response.status(),
                url
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LicenseError::Remote(format!("malformed authority response: {e}")))
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(
            self.validation_client.get(&url).send().await,
            Ok(response) if response.status().is_success()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn company_license_round_trips_through_json() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/licenses/company/tenant-a"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(
                serde_json::json!({
                    "license": {
                        "licenseId": "lic-1",
                        "licenseNumber": "LN-1",
                        "companyId": "tenant-a",
                        "licenseType": "enterprise",
                        "status": "active",
                        "expiresAt": chrono::Utc::now().to_rfc3339(),
                        "limits": {"maxUsers": 100},
                        "modules": [{"moduleId": "reporting"}],
                        "encryptionKey": "hunter2",
                    }
                }),
            ))
            .mount(&server)
            .await;

        let client = HttpLicenseAuthorityClient::new(server.uri(), "token".to_string()).unwrap();
        let response = client.fetch_company_license("tenant-a").await.unwrap();
        assert_eq!(response.license.license_id, "lic-1");
    }

    #[tokio::test]
    async fn non_2xx_response_is_a_remote_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/licenses/company/tenant-a"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpLicenseAuthorityClient::new(server.uri(), "token".to_string()).unwrap();
        let result = client.fetch_company_license("tenant-a").await;
        assert!(matches!(result, Err(LicenseError::Remote(_))));
    }

    #[tokio::test]
    async fn validate_revoked_license_surfaces_error_reason() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/licenses/lic-1/validate"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "valid": false,
                "error": "LICENSE_REVOKED",
            })))
            .mount(&server)
            .await;

        let client = HttpLicenseAuthorityClient::new(server.uri(), "token".to_string()).unwrap();
        let response = client
            .validate(ValidateRequest {
                license_id: "lic-1".to_string(),
                timestamp: chrono::Utc::now(),
                usage: None,
            })
            .await
            .unwrap();
        assert!(!response.valid);
        assert_eq!(response.error.as_deref(), Some("LICENSE_REVOKED"));
    }

    #[tokio::test]
    async fn health_reflects_endpoint_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/health"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpLicenseAuthorityClient::new(server.uri(), "token".to_string()).unwrap();
        assert!(client.health().await);
    }
}
