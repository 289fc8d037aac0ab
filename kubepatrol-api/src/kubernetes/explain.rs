//! Field documentation from the OpenAPI v3 endpoint

use crate::kubernetes::client::K8sClient;
use crate::registry::{K8sError, K8sResult, ResourceQuery};
use serde_json::Value;

async fn get_json(client: &K8sClient, uri: &str) -> K8sResult<Value> {
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .body(vec![])
        .map_err(|e| K8sError::Internal(e.to_string()))?;

    let response: Value = client.inner().request(request).await?;
    Ok(response)
}

/// Group-version path as listed under `/openapi/v3`
fn group_version_path(query: &ResourceQuery) -> String {
    if query.group.is_empty() {
        format!("api/{}", query.version)
    } else {
        format!("apis/{}/{}", query.group, query.version)
    }
}

/// Describe `field` (dotted path) of the queried kind
pub async fn explain(client: &K8sClient, query: &ResourceQuery, field: &str) -> K8sResult<String> {
    let index = get_json(client, "/openapi/v3").await?;
    let path = group_version_path(query);
    let url = index["paths"][&path]["serverRelativeURL"]
        .as_str()
        .ok_or_else(|| K8sError::ResourceNotFound {
            kind: "OpenAPI schema".to_string(),
            name: path.clone(),
            namespace: String::new(),
        })?;

    let document = get_json(client, url).await?;
    find_field_doc(&document, query, field).ok_or_else(|| K8sError::ResourceNotFound {
        kind: format!("{} field", query.kind),
        name: field.to_string(),
        namespace: String::new(),
    })
}

fn schemas(document: &Value) -> Option<&serde_json::Map<String, Value>> {
    document["components"]["schemas"].as_object()
}

/// Follow `$ref` (directly or through a single-entry `allOf`)
fn resolve<'a>(document: &'a Value, schema: &'a Value) -> &'a Value {
    let reference = schema["$ref"]
        .as_str()
        .or_else(|| schema["allOf"][0]["$ref"].as_str());
    reference
        .and_then(|r| r.strip_prefix("#/components/schemas/"))
        .and_then(|name| schemas(document).and_then(|s| s.get(name)))
        .unwrap_or(schema)
}

fn matches_kind(schema: &Value, query: &ResourceQuery) -> bool {
    schema["x-kubernetes-group-version-kind"]
        .as_array()
        .map(|gvks| {
            gvks.iter().any(|gvk| {
                gvk["group"].as_str().unwrap_or("") == query.group
                    && gvk["version"] == query.version.as_str()
                    && gvk["kind"] == query.kind.as_str()
            })
        })
        .unwrap_or(false)
}

fn type_name(schema: &Value) -> &str {
    schema["type"].as_str().unwrap_or("object")
}

/// Locate the kind's schema and walk `field` through it. An empty field
/// describes the kind itself.
pub fn find_field_doc(document: &Value, query: &ResourceQuery, field: &str) -> Option<String> {
    let root = schemas(document)?.values().find(|s| matches_kind(s, query))?;

    let mut current = root;
    let mut described = root;
    for segment in field.split('.').filter(|s| !s.is_empty()) {
        let mut schema = resolve(document, current);
        if type_name(schema) == "array" {
            schema = resolve(document, &schema["items"]);
        }
        described = schema["properties"].get(segment)?;
        current = described;
    }

    let resolved = resolve(document, current);
    let description = described["description"]
        .as_str()
        .or_else(|| resolved["description"].as_str())
        .unwrap_or("");
    let label = if field.is_empty() { query.kind.as_str() } else { field };

    Some(format!("{} <{}>\n{}", label, type_name(resolved), description))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "components": {"schemas": {
                "io.k8s.api.apps.v1.Deployment": {
                    "description": "Deployment enables declarative updates",
                    "x-kubernetes-group-version-kind": [{"group": "apps", "version": "v1", "kind": "Deployment"}],
                    "properties": {
                        "spec": {
                            "description": "Specification of the desired behavior",
                            "allOf": [{"$ref": "#/components/schemas/io.k8s.api.apps.v1.DeploymentSpec"}]
                        }
                    }
                },
                "io.k8s.api.apps.v1.DeploymentSpec": {
                    "type": "object",
                    "properties": {
                        "replicas": {"type": "integer", "description": "Number of desired pods"},
                        "template": {"$ref": "#/components/schemas/io.k8s.api.core.v1.PodTemplateSpec"}
                    }
                },
                "io.k8s.api.core.v1.PodTemplateSpec": {
                    "type": "object",
                    "properties": {
                        "containers": {
                            "type": "array",
                            "items": {"$ref": "#/components/schemas/io.k8s.api.core.v1.Container"}
                        }
                    }
                },
                "io.k8s.api.core.v1.Container": {
                    "type": "object",
                    "properties": {"image": {"type": "string", "description": "Container image name"}}
                }
            }}
        })
    }

    #[test]
    fn test_field_doc_follows_refs() {
        let query = ResourceQuery::new("apps", "v1", "Deployment");
        let doc = document();

        assert_eq!(
            find_field_doc(&doc, &query, "spec.replicas").unwrap(),
            "spec.replicas <integer>\nNumber of desired pods"
        );
        assert!(find_field_doc(&doc, &query, "spec")
            .unwrap()
            .contains("Specification of the desired behavior"));
        assert!(find_field_doc(&doc, &query, "spec.template.containers.image")
            .unwrap()
            .ends_with("Container image name"));
        assert!(find_field_doc(&doc, &query, "").unwrap().starts_with("Deployment <object>"));
    }

    #[test]
    fn test_unknown_field_or_kind() {
        let doc = document();
        assert!(find_field_doc(&doc, &ResourceQuery::new("apps", "v1", "Deployment"), "spec.nope").is_none());
        assert!(find_field_doc(&doc, &ResourceQuery::new("", "v1", "Pod"), "spec").is_none());
    }
}
