//! OpenAPI 3.0 export.
//!
//! Builds a specification document from exportable endpoint-schema
//! hypotheses. Only hypotheses at or above the export confidence threshold
//! and not falsified make it into the document; permission-gate hypotheses
//! for the same endpoints contribute security requirements.

use serde_json::{json, Map, Value};

use crate::cluster::UrlClusterer;
use crate::hypothesis::{Hypothesis, HypothesisKind};

/// Builder for an OpenAPI 3.0 document.
#[derive(Debug)]
pub struct OpenApiBuilder {
    title: String,
    version: String,
    description: String,
    servers: Vec<Value>,
    paths: Map<String, Value>,
    security_schemes: Map<String, Value>,
}

impl OpenApiBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            version: "1.0.0".to_string(),
            description: "Reconstructed from observed traffic".to_string(),
            servers: Vec::new(),
            paths: Map::new(),
            security_schemes: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a server entry.
    pub fn add_server(&mut self, url: &str, description: &str) {
        self.servers.push(json!({
            "url": url,
            "description": description,
        }));
    }

    /// Add one operation derived from an endpoint-schema hypothesis.
    pub fn add_endpoint(&mut self, hypothesis: &Hypothesis, requires_auth: bool) {
        let Some(pattern) = hypothesis.endpoint_pattern.as_deref() else {
            return;
        };
        let method = hypothesis
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_lowercase();

        let mut operation = Map::new();
        operation.insert(
            "summary".to_string(),
            json!(summary_of(&hypothesis.description)),
        );
        operation.insert(
            "description".to_string(),
            json!(operation_description(hypothesis)),
        );
        operation.insert("tags".to_string(), json!([tag_of(pattern)]));

        let parameters = path_parameters(pattern);
        if !parameters.is_empty() {
            operation.insert("parameters".to_string(), Value::Array(parameters));
        }

        if matches!(method.as_str(), "post" | "put" | "patch") {
            if let Some(request_schema) = &hypothesis.request_schema {
                operation.insert(
                    "requestBody".to_string(),
                    json!({
                        "required": true,
                        "content": {
                            "application/json": {"schema": request_schema}
                        }
                    }),
                );
            }
        }

        let response_content = hypothesis
            .response_schema
            .as_ref()
            .map(|schema| {
                json!({
                    "application/json": {"schema": schema}
                })
            })
            .unwrap_or_else(|| json!({}));
        let mut responses = json!({
            "200": {
                "description": "Observed success response",
                "content": response_content,
            }
        });
        if requires_auth {
            responses["401"] = json!({"description": "Authentication required"});
            operation.insert("security".to_string(), json!([{"bearerAuth": []}]));
            self.ensure_bearer_scheme();
        }
        operation.insert("responses".to_string(), responses);

        let path_item = self
            .paths
            .entry(pattern.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(item) = path_item.as_object_mut() {
            item.insert(method, Value::Object(operation));
        }
    }

    fn ensure_bearer_scheme(&mut self) {
        self.security_schemes.entry("bearerAuth").or_insert(json!({
            "type": "http",
            "scheme": "bearer",
        }));
    }

    /// Assemble the document.
    pub fn build(&self) -> Value {
        let mut document = json!({
            "openapi": "3.0.3",
            "info": {
                "title": self.title,
                "version": self.version,
                "description": self.description,
            },
            "paths": self.paths,
        });

        if !self.servers.is_empty() {
            document["servers"] = Value::Array(self.servers.clone());
        }
        if !self.security_schemes.is_empty() {
            document["components"] = json!({
                "securitySchemes": self.security_schemes,
            });
        }

        document
    }

    /// Serialize the document as pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.build()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Build an OpenAPI document from a hypothesis set.
pub fn from_hypotheses(
    hypotheses: &[Hypothesis],
    min_confidence: f64,
    target_url: Option<&str>,
) -> Value {
    let mut builder = OpenApiBuilder::new("Reconstructed API");
    if let Some(url) = target_url {
        if let Some(origin) = crate::supervisor::origin_of(url) {
            builder.add_server(&origin, "Observed origin");
        }
    }

    // Endpoints guarded by a permission-gate hypothesis get a security entry
    let gated: Vec<(String, String)> = hypotheses
        .iter()
        .filter(|h| h.kind == HypothesisKind::PermissionGate)
        .filter_map(|h| h.endpoint_key())
        .collect();

    let mut exportable: Vec<&Hypothesis> = hypotheses
        .iter()
        .filter(|h| h.kind == HypothesisKind::EndpointSchema)
        .filter(|h| h.is_exportable(min_confidence))
        .collect();
    exportable.sort_by(|a, b| a.endpoint_pattern.cmp(&b.endpoint_pattern));

    for hypothesis in exportable {
        let requires_auth = hypothesis
            .endpoint_key()
            .map(|key| gated.contains(&key))
            .unwrap_or(false);
        builder.add_endpoint(hypothesis, requires_auth);
    }

    builder.build()
}

fn summary_of(description: &str) -> String {
    description.lines().next().unwrap_or(description).to_string()
}

fn operation_description(hypothesis: &Hypothesis) -> String {
    format!(
        "{}\n\nConfidence: {:.2} ({} supporting observations, status: {})",
        hypothesis.description,
        hypothesis.confidence,
        hypothesis.supporting_evidence.len(),
        hypothesis.status,
    )
}

fn tag_of(pattern: &str) -> String {
    pattern
        .split('/')
        .find(|segment| !segment.is_empty() && !segment.starts_with('{') && *segment != "api")
        .unwrap_or("general")
        .to_string()
}

fn path_parameters(pattern: &str) -> Vec<Value> {
    UrlClusterer::extract_path_params(pattern)
        .into_iter()
        .map(|param| {
            json!({
                "name": param.name,
                "in": "path",
                "required": true,
                "schema": {"type": "string"},
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypothesis::{HypothesisStore, NewHypothesis, RuleKind};
    use crate::schema::infer_schema;

    fn exportable_hypothesis(store: &HypothesisStore, pattern: &str, method: &str) -> Hypothesis {
        store
            .create(
                NewHypothesis::new(
                    HypothesisKind::EndpointSchema,
                    format!("{} {}", method, pattern),
                    "analyst",
                )
                .with_endpoint(pattern, method)
                .with_schemas(
                    None,
                    Some(infer_schema(&serde_json::json!({"id": 1, "name": "A"}))),
                )
                .with_confidence(0.8),
            )
            .unwrap()
    }

    #[test]
    fn test_export_includes_confident_endpoints() {
        let store = HypothesisStore::new();
        let confident = exportable_hypothesis(&store, "/api/users/{id}", "GET");
        let weak = store
            .create(
                NewHypothesis::new(HypothesisKind::EndpointSchema, "weak", "analyst")
                    .with_endpoint("/api/drafts", "GET")
                    .with_confidence(0.3),
            )
            .unwrap();

        let document = from_hypotheses(&[confident, weak], 0.7, Some("https://h.example/app"));
        let paths = document["paths"].as_object().unwrap();
        assert!(paths.contains_key("/api/users/{id}"));
        assert!(!paths.contains_key("/api/drafts"));
        assert_eq!(document["servers"][0]["url"], "https://h.example");
    }

    #[test]
    fn test_falsified_excluded_even_when_confident() {
        let store = HypothesisStore::new();
        let mut hypothesis = exportable_hypothesis(&store, "/api/ghost", "GET");
        hypothesis.status = crate::hypothesis::HypothesisStatus::Falsified;

        let document = from_hypotheses(&[hypothesis], 0.7, None);
        assert!(document["paths"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_path_parameters_emitted() {
        let store = HypothesisStore::new();
        let hypothesis = exportable_hypothesis(&store, "/api/users/{id}", "GET");

        let document = from_hypotheses(&[hypothesis], 0.7, None);
        let params = &document["paths"]["/api/users/{id}"]["get"]["parameters"];
        assert_eq!(params[0]["name"], "id");
        assert_eq!(params[0]["in"], "path");
        assert_eq!(params[0]["required"], true);
    }

    #[test]
    fn test_request_body_for_write_methods() {
        let store = HypothesisStore::new();
        let mut hypothesis = exportable_hypothesis(&store, "/api/orders", "POST");
        hypothesis.request_schema =
            Some(infer_schema(&serde_json::json!({"item": "x", "qty": 2})));

        let document = from_hypotheses(&[hypothesis], 0.7, None);
        let operation = &document["paths"]["/api/orders"]["post"];
        assert!(operation["requestBody"]["content"]["application/json"]["schema"].is_object());
    }

    #[test]
    fn test_permission_gate_adds_security() {
        let store = HypothesisStore::new();
        let endpoint = exportable_hypothesis(&store, "/api/orders", "POST");
        let gate = store
            .create(
                NewHypothesis::new(HypothesisKind::PermissionGate, "auth required", "business_logic")
                    .with_endpoint("/api/orders", "POST")
                    .with_rule(
                        RuleKind::PermissionGate,
                        serde_json::json!({"requirement": "authentication"}),
                    )
                    .with_confidence(0.7),
            )
            .unwrap();

        let document = from_hypotheses(&[endpoint, gate], 0.7, None);
        let operation = &document["paths"]["/api/orders"]["post"];
        assert_eq!(operation["security"][0]["bearerAuth"], serde_json::json!([]));
        assert_eq!(
            document["components"]["securitySchemes"]["bearerAuth"]["scheme"],
            "bearer"
        );
    }

    #[test]
    fn test_tags_from_first_path_segment() {
        assert_eq!(tag_of("/api/users/{id}"), "users");
        assert_eq!(tag_of("/v1/orders"), "v1");
        assert_eq!(tag_of("/{id}"), "general");
    }
}
