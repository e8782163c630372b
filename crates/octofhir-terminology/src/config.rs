//! `[terminology]` settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TerminologySettings {
    /// Per-request timeout for remote authorities.
    pub timeout_ms: u64,
    /// Remote authorities keyed by a free-form name, e.g. `snomed`.
    pub remote_services: BTreeMap<String, RemoteServiceSettings>,
}

impl Default for TerminologySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            remote_services: BTreeMap::new(),
        }
    }
}

/// One remote terminology service.
///
/// Requests for `system` (CodeSystem shape) or `value_set` (ValueSet shape)
/// are sent to `url`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteServiceSettings {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub value_set: Option<String>,
    pub url: String,
}

impl TerminologySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("terminology.timeout_ms must be greater than 0".to_string());
        }

        for (name, service) in &self.remote_services {
            if service.system.is_none() && service.value_set.is_none() {
                return Err(format!(
                    "terminology.remote_services.{name}: one of system or value_set is required"
                ));
            }
            let url = Url::parse(&service.url).map_err(|e| {
                format!("terminology.remote_services.{name}.url is invalid: {e}")
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(format!(
                    "terminology.remote_services.{name}.url must be http or https"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(system: Option<&str>, url: &str) -> RemoteServiceSettings {
        RemoteServiceSettings {
            system: system.map(String::from),
            value_set: None,
            url: url.to_string(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(TerminologySettings::default().validate().is_ok());
    }

    #[test]
    fn remote_service_needs_a_target() {
        let mut settings = TerminologySettings::default();
        settings
            .remote_services
            .insert("snomed".into(), service(None, "https://tx.example.org/r5"));
        assert!(settings.validate().unwrap_err().contains("snomed"));
    }

    #[test]
    fn remote_service_url_must_be_http() {
        let mut settings = TerminologySettings::default();
        settings.remote_services.insert(
            "snomed".into(),
            service(Some("http://snomed.info/sct"), "ftp://tx.example.org"),
        );
        assert!(settings.validate().is_err());

        settings.remote_services.insert(
            "snomed".into(),
            service(Some("http://snomed.info/sct"), "https://tx.example.org/r5"),
        );
        assert!(settings.validate().is_ok());
    }
}
