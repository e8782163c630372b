//! `$validate-code` request and result types.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::error::{TerminologyError, TerminologyResult};

/// A `$validate-code` question in one of its two shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateCodeRequest {
    /// Is `code` defined by the CodeSystem `system`?
    CodeSystem {
        system: String,
        code: String,
        display: Option<String>,
    },
    /// Is `code` (optionally from `system`) a member of the ValueSet `url`?
    ValueSet {
        url: String,
        code: String,
        system: Option<String>,
        display: Option<String>,
    },
}

impl ValidateCodeRequest {
    pub fn code_system(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self::CodeSystem {
            system: system.into(),
            code: code.into(),
            display: None,
        }
    }

    pub fn value_set(
        url: impl Into<String>,
        code: impl Into<String>,
        system: Option<String>,
    ) -> Self {
        Self::ValueSet {
            url: url.into(),
            code: code.into(),
            system,
            display: None,
        }
    }

    /// Attach a display hint to compare against the known display.
    pub fn with_display(mut self, hint: impl Into<String>) -> Self {
        match &mut self {
            Self::CodeSystem { display, .. } | Self::ValueSet { display, .. } => {
                *display = Some(hint.into());
            }
        }
        self
    }

    pub fn code(&self) -> &str {
        match self {
            Self::CodeSystem { code, .. } | Self::ValueSet { code, .. } => code,
        }
    }

    pub fn display(&self) -> Option<&str> {
        match self {
            Self::CodeSystem { display, .. } | Self::ValueSet { display, .. } => display.as_deref(),
        }
    }

    /// Reject empty identifiers.
    pub fn validate(&self) -> TerminologyResult<()> {
        if self.code().trim().is_empty() {
            return Err(TerminologyError::invalid_request("code must not be empty"));
        }
        match self {
            Self::CodeSystem { system, .. } if system.trim().is_empty() => Err(
                TerminologyError::invalid_request("system must not be empty"),
            ),
            Self::ValueSet { url, .. } if url.trim().is_empty() => {
                Err(TerminologyError::invalid_request("url must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Which resource type the operation was invoked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationTarget {
    CodeSystem,
    ValueSet,
}

/// Raw `$validate-code` parameters before shape resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateCodeParams {
    pub url: Option<String>,
    pub value_set: Option<String>,
    pub code: Option<String>,
    pub system: Option<String>,
    pub display: Option<String>,
}

impl ValidateCodeParams {
    /// Read a FHIR `Parameters` body.
    ///
    /// Primitive parameters are accepted in any `value[x]` form, so `code`
    /// may arrive as `valueCode` or `valueString`. A `coding` parameter
    /// supplies `system`, `code` and `display` where they are not given
    /// directly.
    pub fn from_parameters(body: &Value) -> TerminologyResult<Self> {
        if body.get("resourceType").and_then(Value::as_str) != Some("Parameters") {
            return Err(TerminologyError::invalid_request(
                "request body must be a Parameters resource",
            ));
        }

        let mut params = Self::default();
        let mut coding = None;

        for param in body
            .get("parameter")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let name = param.get("name").and_then(Value::as_str).unwrap_or("");
            match name {
                "url" => params.url = primitive(param),
                "valueSet" => params.value_set = primitive(param),
                "code" => params.code = primitive(param),
                "system" => params.system = primitive(param),
                "display" => params.display = primitive(param),
                "coding" => coding = param.get("valueCoding").cloned(),
                _ => {}
            }
        }

        if let Some(coding) = coding {
            params.merge_coding(&coding);
        }
        Ok(params)
    }

    /// Read query-string parameters.
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let get = |key: &str| query.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            url: get("url"),
            value_set: get("valueSet"),
            code: get("code"),
            system: get("system"),
            display: get("display"),
        }
    }

    fn merge_coding(&mut self, coding: &Value) {
        let field = |key: &str| coding.get(key).and_then(Value::as_str).map(String::from);
        if self.code.is_none() {
            self.code = field("code");
        }
        if self.system.is_none() {
            self.system = field("system");
        }
        if self.display.is_none() {
            self.display = field("display");
        }
    }

    /// Resolve the request shape for the resource type the operation was
    /// invoked on.
    ///
    /// On `CodeSystem`, `url` names the code system and `system` is an alias
    /// for it. On `ValueSet`, `url` (or `valueSet`, which must agree with it)
    /// names the value set; with neither but a `system`, the request degrades
    /// to the CodeSystem shape.
    pub fn into_request(self, target: OperationTarget) -> TerminologyResult<ValidateCodeRequest> {
        let Some(code) = self.code else {
            return Err(TerminologyError::invalid_request("missing code"));
        };

        let request = match target {
            OperationTarget::CodeSystem => {
                if self.value_set.is_some() {
                    return Err(TerminologyError::invalid_request(
                        "CodeSystem/$validate-code does not take a valueSet",
                    ));
                }
                let system = match (self.url, self.system) {
                    (Some(url), Some(system)) if url != system => {
                        return Err(TerminologyError::invalid_request(format!(
                            "url {url} and system {system} disagree"
                        )));
                    }
                    (Some(url), _) => url,
                    (None, Some(system)) => system,
                    (None, None) => {
                        return Err(TerminologyError::invalid_request(
                            "missing url or system",
                        ));
                    }
                };
                ValidateCodeRequest::CodeSystem {
                    system,
                    code,
                    display: self.display,
                }
            }
            OperationTarget::ValueSet => {
                let url = match (self.url, self.value_set) {
                    (Some(url), Some(value_set)) if url != value_set => {
                        return Err(TerminologyError::invalid_request(format!(
                            "url {url} and valueSet {value_set} disagree"
                        )));
                    }
                    (url, value_set) => url.or(value_set),
                };
                match (url, self.system) {
                    (Some(url), system) => ValidateCodeRequest::ValueSet {
                        url,
                        code,
                        system,
                        display: self.display,
                    },
                    (None, Some(system)) => ValidateCodeRequest::CodeSystem {
                        system,
                        code,
                        display: self.display,
                    },
                    (None, None) => {
                        return Err(TerminologyError::invalid_request(
                            "missing url or system",
                        ));
                    }
                }
            }
        };

        request.validate()?;
        Ok(request)
    }
}

fn primitive(param: &Value) -> Option<String> {
    const KEYS: [&str; 6] = [
        "valueUri",
        "valueUrl",
        "valueCanonical",
        "valueCode",
        "valueString",
        "valueId",
    ];
    KEYS.iter()
        .find_map(|k| param.get(*k).and_then(Value::as_str))
        .map(String::from)
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Remote,
    Local,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// Normalised `$validate-code` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub display: Option<String>,
    pub message: Option<String>,
    pub source: ResolutionSource,
}

impl ValidationResult {
    pub fn valid(display: Option<String>, source: ResolutionSource) -> Self {
        Self {
            valid: true,
            display,
            message: None,
            source,
        }
    }

    pub fn invalid(message: impl Into<String>, source: ResolutionSource) -> Self {
        Self {
            valid: false,
            display: None,
            message: Some(message.into()),
            source,
        }
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    /// Render as a FHIR `Parameters` resource.
    pub fn to_parameters(&self) -> Value {
        let mut parameter = vec![json!({"name": "result", "valueBoolean": self.valid})];
        if let Some(display) = &self.display {
            parameter.push(json!({"name": "display", "valueString": display}));
        }
        if let Some(message) = &self.message {
            parameter.push(json!({"name": "message", "valueString": message}));
        }
        json!({
            "resourceType": "Parameters",
            "parameter": parameter
        })
    }

    /// Parse a `Parameters` answer from a remote authority.
    pub(crate) fn from_parameters(body: &Value) -> Option<Self> {
        let params = body.get("parameter")?.as_array()?;
        let find = |name: &str| {
            params
                .iter()
                .find(|p| p.get("name").and_then(Value::as_str) == Some(name))
        };

        let valid = find("result")?.get("valueBoolean")?.as_bool()?;
        let text = |name: &str| find(name).and_then(primitive);

        Some(Self {
            valid,
            display: text("display"),
            message: text("message"),
            source: ResolutionSource::Remote,
        })
    }
}
