//! Schema inference from observed traffic.
//!
//! The analyst groups fresh observations by endpoint pattern, folds their
//! bodies through the schema merger, and turns each group into an
//! endpoint-schema hypothesis. The language model only enriches wording and
//! field semantics; everything structural is computed deterministically.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::UrlClusterer;
use crate::error::Result;
use crate::hypothesis::{
    CompetingExplanation, EvidenceRef, EvidenceStrength, Hypothesis, HypothesisKind,
    HypothesisStore, NewHypothesis,
};
use crate::interceptor::Observation;
use crate::llm::{ChatMessage, LlmClient};
use crate::schema::SchemaMerger;

const SCHEMA_ENRICHMENT_PROMPT: &str = "You are an API schema analyst. Given an endpoint pattern, \
an inferred JSON schema, and sample responses, describe the endpoint's purpose and the meaning \
of each field. Be specific and technical. If uncertain, say so.";

/// Evidence references recorded per hypothesis, at most.
const MAX_EVIDENCE_REFS: usize = 10;

/// Sample bodies handed to the language model for enrichment.
const MAX_ENRICHMENT_SAMPLES: usize = 3;

/// Byte-bounded clip that never splits a UTF-8 character.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn enrichment_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "description": {"type": "string"},
            "field_semantics": {"type": "object"},
            "competing_explanations": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["description"]
    })
}

#[derive(Debug, Clone, Default)]
struct Enrichment {
    description: Option<String>,
    field_semantics: HashMap<String, String>,
    competing_explanations: Vec<String>,
}

/// Turns clustered observations into endpoint-schema hypotheses.
pub struct Analyst {
    clusterer: UrlClusterer,
    merger: SchemaMerger,
    store: Arc<HypothesisStore>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Analyst {
    pub fn new(store: Arc<HypothesisStore>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            clusterer: UrlClusterer::new(),
            merger: SchemaMerger::new(),
            store,
            llm,
        }
    }

    /// Process fresh observations into hypotheses. Returns the hypotheses
    /// touched this phase (created or merged into), for the critique queue.
    pub async fn infer(&mut self, observations: &[Observation]) -> Result<Vec<Hypothesis>> {
        if observations.is_empty() {
            debug!("no observations to analyze");
            return Ok(Vec::new());
        }

        let groups = self.group_by_pattern(observations);
        info!(
            observations = observations.len(),
            groups = groups.len(),
            "analyzing observation groups"
        );

        let mut pending = Vec::new();
        for (key, group) in groups {
            match self.hypothesis_for_group(&key, &group).await {
                Ok(Some(hypothesis)) => pending.push(hypothesis),
                Ok(None) => {}
                Err(error) => warn!(%error, pattern = %key, "failed to build hypothesis"),
            }
        }

        Ok(pending)
    }

    fn group_by_pattern<'a>(
        &mut self,
        observations: &'a [Observation],
    ) -> Vec<(String, Vec<&'a Observation>)> {
        let mut groups: HashMap<String, Vec<&Observation>> = HashMap::new();
        for obs in observations {
            let key = self.clusterer.pattern_key(&obs.method, &obs.url);
            groups.entry(key).or_default().push(obs);
        }

        let mut ordered: Vec<(String, Vec<&Observation>)> = groups.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        ordered
    }

    async fn hypothesis_for_group(
        &mut self,
        key: &str,
        group: &[&Observation],
    ) -> Result<Option<Hypothesis>> {
        if group.is_empty() {
            return Ok(None);
        }

        let (method, pattern) = key
            .split_once(' ')
            .map(|(m, p)| (m.to_string(), p.to_string()))
            .unwrap_or_else(|| ("GET".to_string(), key.to_string()));

        // Fold bodies through the union merger
        let mut response_schema = None;
        let mut request_schema = None;
        for obs in group {
            if let Some(body) = &obs.response_body {
                if let Some(merged) = self.merger.merge_body(key, body) {
                    response_schema = Some(merged);
                }
            }
            if let Some(body) = &obs.request_body {
                let request_key = format!("{} (request)", key);
                if let Some(merged) = self.merger.merge_body(&request_key, body) {
                    request_schema = Some(merged);
                }
            }
        }

        let evidence: Vec<EvidenceRef> = group
            .iter()
            .take(MAX_EVIDENCE_REFS)
            .map(|obs| {
                EvidenceRef::new(
                    obs.id.to_string(),
                    format!("{} {} -> {}", obs.method, obs.url, obs.status),
                    if obs.is_success() {
                        EvidenceStrength::Strong
                    } else {
                        EvidenceStrength::Moderate
                    },
                )
            })
            .collect();

        // Dedup on (pattern, method): merge into the existing hypothesis
        if let Some(existing) = self.store.find_endpoint(&pattern, &method)? {
            let merged = self.store.merge_endpoint(
                &existing.id,
                evidence,
                request_schema,
                response_schema,
                "analyst",
            )?;
            debug!(pattern = %key, "merged observations into existing hypothesis");
            return Ok(Some(merged));
        }

        let enrichment = self
            .enrich(&pattern, response_schema.as_ref(), group)
            .await;

        let description = enrichment
            .description
            .unwrap_or_else(|| format!("API endpoint: {} {}", method, pattern));

        let hypothesis = self.store.create(
            NewHypothesis::new(HypothesisKind::EndpointSchema, description, "analyst")
                .with_endpoint(&pattern, &method)
                .with_schemas(request_schema, response_schema)
                .with_field_semantics(enrichment.field_semantics)
                .with_evidence(evidence)
                .with_competing_explanations(
                    enrichment
                        .competing_explanations
                        .into_iter()
                        .map(CompetingExplanation::new)
                        .collect(),
                ),
        )?;

        Ok(Some(hypothesis))
    }

    async fn enrich(
        &self,
        pattern: &str,
        schema: Option<&Value>,
        group: &[&Observation],
    ) -> Enrichment {
        let Some(llm) = &self.llm else {
            return Enrichment::default();
        };

        let samples: Vec<&str> = group
            .iter()
            .filter_map(|obs| obs.response_body.as_deref())
            .map(|body| clip(body, 500))
            .take(MAX_ENRICHMENT_SAMPLES)
            .collect();

        let schema_text = schema
            .map(|s| serde_json::to_string_pretty(s).unwrap_or_default())
            .unwrap_or_else(|| "(no schema)".to_string());

        let prompt = format!(
            "Analyze this API endpoint.\n\nENDPOINT: {}\n\nINFERRED SCHEMA:\n{}\n\nSAMPLE RESPONSES:\n{}",
            pattern,
            clip(&schema_text, 2000),
            samples.join("\n"),
        );

        match llm
            .invoke_structured(
                vec![ChatMessage::user(prompt)],
                &enrichment_schema(),
                Some(SCHEMA_ENRICHMENT_PROMPT),
                0.5,
            )
            .await
        {
            Ok(parsed) => Enrichment {
                description: parsed
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
                field_semantics: parsed
                    .get("field_semantics")
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                competing_explanations: parsed
                    .get("competing_explanations")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            Err(error) => {
                warn!(%error, "schema enrichment failed, using defaults");
                Enrichment::default()
            }
        }
    }
}
