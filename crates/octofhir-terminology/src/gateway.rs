//! Terminology Validation Gateway.
//!
//! Routes each `$validate-code` request either to a remote authority
//! registered for the referenced CodeSystem/ValueSet url, or to the
//! definitions held in local storage. Remote answers are passed through
//! unchanged; local answers are built from the definitions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use octofhir_storage::DynStorage;
use serde_json::Value;

use crate::config::TerminologySettings;
use crate::error::{TerminologyError, TerminologyResult};
use crate::local::{
    LocalResolver, display_mismatch, lookup_code, lookup_concept_list, lookup_expansion,
};
use crate::remote::{RemoteAuthority, RemoteRegistry, canonical_url};
use crate::types::{ResolutionSource, ValidateCodeRequest, ValidationResult};

/// Bound on `include.valueSet` indirection.
const MAX_VALUE_SET_DEPTH: usize = 8;

/// A code found to be in a value set.
struct Member {
    display: Option<String>,
    source: ResolutionSource,
}

type MemberFuture<'a> = Pin<Box<dyn Future<Output = TerminologyResult<Option<Member>>> + Send + 'a>>;

pub struct TerminologyGateway {
    local: LocalResolver,
    remotes: RemoteRegistry,
}

impl TerminologyGateway {
    pub fn new(storage: DynStorage, remotes: RemoteRegistry) -> Self {
        Self {
            local: LocalResolver::new(storage),
            remotes,
        }
    }

    pub fn from_settings(storage: DynStorage, settings: &TerminologySettings) -> TerminologyResult<Self> {
        Ok(Self::new(storage, RemoteRegistry::from_settings(settings)?))
    }

    pub fn remotes(&self) -> &RemoteRegistry {
        &self.remotes
    }

    /// Answer a `$validate-code` request.
    ///
    /// `valid = false` means the code is not in the referenced definition.
    /// Errors mean no answer could be given: the definition is unknown
    /// (`NotFound`) or its remote authority is down (`UpstreamUnavailable`).
    pub async fn validate_code(&self, request: &ValidateCodeRequest) -> TerminologyResult<ValidationResult> {
        request.validate()?;

        match request {
            ValidateCodeRequest::CodeSystem {
                system,
                code,
                display,
            } => {
                if let Some(remote) = self.remotes.for_system(system) {
                    return self.delegate(remote, request).await;
                }
                self.validate_in_code_system(system, code, display.as_deref())
                    .await
            }
            ValidateCodeRequest::ValueSet {
                url,
                code,
                system,
                display,
            } => {
                if let Some(remote) = self.remotes.for_value_set(url) {
                    return self.delegate(remote, request).await;
                }
                self.validate_in_value_set(url, code, system.as_deref(), display.as_deref())
                    .await
            }
        }
    }

    async fn delegate(
        &self,
        remote: &Arc<dyn RemoteAuthority>,
        request: &ValidateCodeRequest,
    ) -> TerminologyResult<ValidationResult> {
        let result = remote.validate_code(request).await?;
        tracing::debug!(
            authority = %remote.base_url(),
            code = %request.code(),
            valid = result.valid,
            "Remote $validate-code answered"
        );
        Ok(result)
    }

    async fn validate_in_code_system(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
    ) -> TerminologyResult<ValidationResult> {
        let code_system = self
            .local
            .code_system(system)
            .await?
            .ok_or_else(|| TerminologyError::code_system_not_found(system))?;

        Ok(match lookup_code(&code_system, code) {
            Some(concept) => {
                let message = display_mismatch(display, concept.display.as_deref(), code);
                ValidationResult::valid(concept.display, ResolutionSource::Local).with_message(message)
            }
            None => ValidationResult::invalid(
                format!("Unknown code '{code}' in CodeSystem {}", canonical_url(system)),
                ResolutionSource::Local,
            ),
        })
    }

    async fn validate_in_value_set(
        &self,
        url: &str,
        code: &str,
        system: Option<&str>,
        display: Option<&str>,
    ) -> TerminologyResult<ValidationResult> {
        let value_set = self
            .local
            .value_set(url)
            .await?
            .ok_or_else(|| TerminologyError::value_set_not_found(url))?;

        Ok(match self.membership(&value_set, code, system, 0).await? {
            Some(member) => {
                let message = display_mismatch(display, member.display.as_deref(), code);
                ValidationResult::valid(member.display, member.source).with_message(message)
            }
            None => ValidationResult::invalid(
                format!("Code '{code}' is not in ValueSet {}", canonical_url(url)),
                ResolutionSource::Local,
            ),
        })
    }

    /// Expansion first; otherwise excludes, then includes.
    fn membership<'a>(
        &'a self,
        value_set: &'a Value,
        code: &'a str,
        system: Option<&'a str>,
        depth: usize,
    ) -> MemberFuture<'a> {
        Box::pin(async move {
            if depth > MAX_VALUE_SET_DEPTH {
                tracing::warn!(code, depth, "ValueSet nesting too deep, treating code as absent");
                return Ok(None);
            }

            if let Some(expansion) = value_set.get("expansion") {
                return Ok(lookup_expansion(expansion, code, system).map(|c| Member {
                    display: c.display,
                    source: ResolutionSource::Local,
                }));
            }

            let Some(compose) = value_set.get("compose") else {
                return Ok(None);
            };

            for exclude in sets(compose, "exclude") {
                if self.set_contains(exclude, code, system, depth).await?.is_some() {
                    return Ok(None);
                }
            }
            for include in sets(compose, "include") {
                if let Some(member) = self.set_contains(include, code, system, depth).await? {
                    return Ok(Some(member));
                }
            }
            Ok(None)
        })
    }

    /// Test one `include`/`exclude` entry. Its `system`/`concept` rule and
    /// every referenced `valueSet` must all contain the code.
    async fn set_contains(
        &self,
        set: &Value,
        code: &str,
        system: Option<&str>,
        depth: usize,
    ) -> TerminologyResult<Option<Member>> {
        let set_system = set.get("system").and_then(Value::as_str);
        if let (Some(wanted), Some(declared)) = (system, set_system)
            && canonical_url(wanted) != canonical_url(declared)
        {
            return Ok(None);
        }

        let mut member = match set_system {
            Some(_) if set.get("concept").is_some() => match lookup_concept_list(set, code) {
                Some(concept) => Some(Member {
                    display: concept.display,
                    source: ResolutionSource::Local,
                }),
                None => return Ok(None),
            },
            Some(declared) => match self.system_contains(declared, code).await? {
                Some(found) => Some(found),
                None => return Ok(None),
            },
            None => None,
        };

        let references: Vec<&str> = set
            .get("valueSet")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect();

        if set_system.is_none() && references.is_empty() {
            return Ok(None);
        }

        for reference in references {
            let found = if let Some(remote) = self.remotes.for_value_set(reference) {
                let mut request = ValidateCodeRequest::value_set(reference, code, system.map(String::from));
                if let Some(display) = member.as_ref().and_then(|m| m.display.clone()) {
                    request = request.with_display(display);
                }
                let answer = remote.validate_code(&request).await?;
                answer.valid.then_some(Member {
                    display: answer.display,
                    source: ResolutionSource::Remote,
                })
            } else {
                let nested = self
                    .local
                    .value_set(reference)
                    .await?
                    .ok_or_else(|| TerminologyError::value_set_not_found(reference))?;
                self.membership(&nested, code, system, depth + 1).await?
            };

            match found {
                Some(found) => {
                    member.get_or_insert(found);
                }
                None => return Ok(None),
            }
        }

        Ok(member)
    }

    /// Whole-system include: ask the remote authority for that system if one
    /// is registered, else the local CodeSystem.
    async fn system_contains(&self, system: &str, code: &str) -> TerminologyResult<Option<Member>> {
        if let Some(remote) = self.remotes.for_system(system) {
            let answer = remote
                .validate_code(&ValidateCodeRequest::code_system(system, code))
                .await?;
            return Ok(answer.valid.then_some(Member {
                display: answer.display,
                source: ResolutionSource::Remote,
            }));
        }

        match self.local.code_system(system).await? {
            Some(code_system) => Ok(lookup_code(&code_system, code).map(|c| Member {
                display: c.display,
                source: ResolutionSource::Local,
            })),
            None => {
                tracing::warn!(system, "CodeSystem included by a ValueSet is not stored locally");
                Ok(None)
            }
        }
    }
}

fn sets<'a>(compose: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    compose.get(key).and_then(Value::as_array).into_iter().flatten()
}
