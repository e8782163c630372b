//! Resolution against CodeSystem and ValueSet resources held in storage.

use octofhir_storage::{DynStorage, SearchParams};
use serde_json::Value;

use crate::error::TerminologyResult;
use crate::remote::canonical_url;

/// Bound on `concept` nesting walked by [`find_concept`].
const MAX_CONCEPT_DEPTH: usize = 100;

/// A concept found in a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptMatch {
    pub code: String,
    pub display: Option<String>,
}

pub struct LocalResolver {
    storage: DynStorage,
}

impl LocalResolver {
    pub fn new(storage: DynStorage) -> Self {
        Self { storage }
    }

    pub async fn code_system(&self, reference: &str) -> TerminologyResult<Option<Value>> {
        self.by_url("CodeSystem", reference).await
    }

    pub async fn value_set(&self, reference: &str) -> TerminologyResult<Option<Value>> {
        self.by_url("ValueSet", reference).await
    }

    async fn by_url(&self, resource_type: &str, reference: &str) -> TerminologyResult<Option<Value>> {
        let url = canonical_url(reference);
        let params = SearchParams::new().with_param("url", url);
        let result = self.storage.search(resource_type, &params).await?;

        if result.entries.len() > 1 {
            tracing::warn!(
                resource_type,
                url,
                count = result.entries.len(),
                "Several definitions share a canonical url, using the first"
            );
        }
        Ok(result.entries.into_iter().next().map(|stored| stored.resource))
    }
}

/// Look `code` up in a CodeSystem, walking nested concepts.
pub fn lookup_code(code_system: &Value, code: &str) -> Option<ConceptMatch> {
    let concepts = code_system.get("concept")?.as_array()?;
    find_concept(concepts, code, 0).map(concept_match)
}

/// Depth-first search through a `concept` hierarchy.
pub fn find_concept<'a>(concepts: &'a [Value], code: &str, depth: usize) -> Option<&'a Value> {
    if depth > MAX_CONCEPT_DEPTH {
        return None;
    }
    for concept in concepts {
        if concept.get("code").and_then(Value::as_str) == Some(code) {
            return Some(concept);
        }
        if let Some(children) = concept.get("concept").and_then(Value::as_array)
            && let Some(found) = find_concept(children, code, depth + 1)
        {
            return Some(found);
        }
    }
    None
}

/// Search a ValueSet expansion. `system`, when given, must match too.
pub fn lookup_expansion(expansion: &Value, code: &str, system: Option<&str>) -> Option<ConceptMatch> {
    let contains = expansion.get("contains")?.as_array()?;
    find_in_contains(contains, code, system, 0)
}

fn find_in_contains(
    contains: &[Value],
    code: &str,
    system: Option<&str>,
    depth: usize,
) -> Option<ConceptMatch> {
    if depth > MAX_CONCEPT_DEPTH {
        return None;
    }
    for entry in contains {
        let entry_system = entry.get("system").and_then(Value::as_str);
        if entry.get("code").and_then(Value::as_str) == Some(code)
            && system.is_none_or(|s| entry_system == Some(canonical_url(s)))
        {
            return Some(concept_match(entry));
        }
        if let Some(nested) = entry.get("contains").and_then(Value::as_array)
            && let Some(found) = find_in_contains(nested, code, system, depth + 1)
        {
            return Some(found);
        }
    }
    None
}

/// Look `code` up in an explicit `include.concept` / `exclude.concept` list.
pub fn lookup_concept_list(set: &Value, code: &str) -> Option<ConceptMatch> {
    set.get("concept")?
        .as_array()?
        .iter()
        .find(|c| c.get("code").and_then(Value::as_str) == Some(code))
        .map(concept_match)
}

fn concept_match(concept: &Value) -> ConceptMatch {
    ConceptMatch {
        code: concept
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        display: concept
            .get("display")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

/// Message for a display hint that differs from the known display.
pub fn display_mismatch(hint: Option<&str>, known: Option<&str>, code: &str) -> Option<String> {
    match (hint, known) {
        (Some(hint), Some(known)) if hint != known => Some(format!(
            "Display \"{hint}\" does not match \"{known}\" for code {code}"
        )),
        _ => None,
    }
}
