//! Remote terminology authorities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use url::Url;

use crate::config::TerminologySettings;
use crate::error::{TerminologyError, TerminologyResult};
use crate::types::{ValidateCodeRequest, ValidationResult};

/// An external authority that answers `$validate-code` itself.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Base url, for logs and errors.
    fn base_url(&self) -> &str;

    async fn validate_code(&self, request: &ValidateCodeRequest) -> TerminologyResult<ValidationResult>;
}

/// [`RemoteAuthority`] speaking the FHIR REST API over HTTP.
pub struct HttpTerminologyClient {
    client: Client,
    base_url: String,
}

impl HttpTerminologyClient {
    pub fn new(base_url: &str, timeout: Duration) -> TerminologyResult<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| TerminologyError::Config(format!("invalid url {base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TerminologyError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, request: &ValidateCodeRequest) -> (String, Vec<(&'static str, String)>) {
        let mut query = Vec::new();
        let resource = match request {
            ValidateCodeRequest::CodeSystem {
                system,
                code,
                display,
            } => {
                query.push(("url", system.clone()));
                query.push(("code", code.clone()));
                if let Some(display) = display {
                    query.push(("display", display.clone()));
                }
                "CodeSystem"
            }
            ValidateCodeRequest::ValueSet {
                url,
                code,
                system,
                display,
            } => {
                query.push(("url", url.clone()));
                query.push(("code", code.clone()));
                if let Some(system) = system {
                    query.push(("system", system.clone()));
                }
                if let Some(display) = display {
                    query.push(("display", display.clone()));
                }
                "ValueSet"
            }
        };
        (format!("{}/{resource}/$validate-code", self.base_url), query)
    }

    fn unavailable(&self, message: impl Into<String>) -> TerminologyError {
        TerminologyError::UpstreamUnavailable {
            url: self.base_url.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl RemoteAuthority for HttpTerminologyClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn validate_code(&self, request: &ValidateCodeRequest) -> TerminologyResult<ValidationResult> {
        let (endpoint, query) = self.endpoint(request);

        tracing::debug!(endpoint = %endpoint, code = %request.code(), "Delegating $validate-code");

        let response = self
            .client
            .get(&endpoint)
            .query(&query)
            .header(header::ACCEPT, "application/fhir+json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(endpoint = %endpoint, error = %e, "Remote terminology request failed");
                self.unavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(self.unavailable(format!("HTTP {}", status.as_u16())));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(match request {
                ValidateCodeRequest::CodeSystem { system, .. } => {
                    TerminologyError::code_system_not_found(system)
                }
                ValidateCodeRequest::ValueSet { url, .. } => TerminologyError::value_set_not_found(url),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TerminologyError::Remote {
                url: self.base_url.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await.map_err(|e| {
            // A cut-off body is an outage, not an answer.
            if e.is_timeout() {
                self.unavailable(e.to_string())
            } else {
                TerminologyError::Remote {
                    url: self.base_url.clone(),
                    status: status.as_u16(),
                    message: format!("unparseable response: {e}"),
                }
            }
        })?;

        ValidationResult::from_parameters(&body).ok_or_else(|| TerminologyError::Remote {
            url: self.base_url.clone(),
            status: status.as_u16(),
            message: "response has no boolean result parameter".to_string(),
        })
    }
}

/// Routing table from CodeSystem and ValueSet urls to remote authorities.
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    by_system: HashMap<String, Arc<dyn RemoteAuthority>>,
    by_value_set: HashMap<String, Arc<dyn RemoteAuthority>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One HTTP client per configured remote service.
    pub fn from_settings(settings: &TerminologySettings) -> TerminologyResult<Self> {
        let mut registry = Self::new();
        for (name, service) in &settings.remote_services {
            let client: Arc<dyn RemoteAuthority> =
                Arc::new(HttpTerminologyClient::new(&service.url, settings.timeout())?);
            registry = registry.register(
                service.system.as_deref(),
                service.value_set.as_deref(),
                client,
            );
            tracing::info!(
                name = %name,
                system = service.system.as_deref().unwrap_or("-"),
                value_set = service.value_set.as_deref().unwrap_or("-"),
                url = %service.url,
                "Registered remote terminology service"
            );
        }
        Ok(registry)
    }

    pub fn register(
        mut self,
        system: Option<&str>,
        value_set: Option<&str>,
        authority: Arc<dyn RemoteAuthority>,
    ) -> Self {
        if let Some(system) = system {
            self.by_system
                .insert(canonical_url(system).to_string(), authority.clone());
        }
        if let Some(value_set) = value_set {
            self.by_value_set
                .insert(canonical_url(value_set).to_string(), authority);
        }
        self
    }

    pub fn for_system(&self, system: &str) -> Option<&Arc<dyn RemoteAuthority>> {
        self.by_system.get(canonical_url(system))
    }

    pub fn for_value_set(&self, url: &str) -> Option<&Arc<dyn RemoteAuthority>> {
        self.by_value_set.get(canonical_url(url))
    }

    pub fn is_empty(&self) -> bool {
        self.by_system.is_empty() && self.by_value_set.is_empty()
    }
}

impl std::fmt::Debug for RemoteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRegistry")
            .field("systems", &self.by_system.keys().collect::<Vec<_>>())
            .field("value_sets", &self.by_value_set.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Strip a `|version` suffix from a canonical reference.
pub fn canonical_url(reference: &str) -> &str {
    reference.split('|').next().unwrap_or(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_drops_version() {
        assert_eq!(canonical_url("http://foo/cs|1.0.0"), "http://foo/cs");
        assert_eq!(canonical_url("http://foo/cs"), "http://foo/cs");
    }

    #[test]
    fn endpoint_for_each_shape() {
        let client =
            HttpTerminologyClient::new("https://tx.example.org/r5/", Duration::from_secs(1)).unwrap();

        let (url, query) = client.endpoint(
            &ValidateCodeRequest::code_system("http://snomed.info/sct", "22298006")
                .with_display("Myocardial infarction"),
        );
        assert_eq!(url, "https://tx.example.org/r5/CodeSystem/$validate-code");
        assert_eq!(
            query,
            vec![
                ("url", "http://snomed.info/sct".to_string()),
                ("code", "22298006".to_string()),
                ("display", "Myocardial infarction".to_string()),
            ]
        );

        let (url, query) = client.endpoint(&ValidateCodeRequest::value_set(
            "http://foo/vs",
            "yes",
            Some("http://foo/cs".into()),
        ));
        assert_eq!(url, "https://tx.example.org/r5/ValueSet/$validate-code");
        assert_eq!(query.len(), 3);
    }

    #[test]
    fn registry_routes_by_canonical() {
        let client: Arc<dyn RemoteAuthority> =
            Arc::new(HttpTerminologyClient::new("https://tx.example.org", Duration::from_secs(1)).unwrap());
        let registry = RemoteRegistry::new().register(Some("http://snomed.info/sct"), None, client);

        assert!(registry.for_system("http://snomed.info/sct|2024").is_some());
        assert!(registry.for_system("http://loinc.org").is_none());
        assert!(registry.for_value_set("http://snomed.info/sct").is_none());
    }
}
