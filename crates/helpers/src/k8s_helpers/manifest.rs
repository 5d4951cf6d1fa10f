use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Decodes every document of a (possibly multi-document) YAML manifest.
/// Empty documents, e.g. a trailing `---`, are skipped.
pub fn decode_manifests(data: &[u8]) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for (idx, document) in serde_yaml::Deserializer::from_slice(data).enumerate() {
        let yaml = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("invalid YAML in document {}", idx))?;
        if yaml.is_null() {
            continue;
        }
        let doc: Value = serde_json::to_value(&yaml)
            .with_context(|| format!("document {} is not representable as JSON", idx))?;
        docs.push(doc);
    }
    Ok(docs)
}

/// Encodes documents back into a multi-document YAML manifest.
pub fn encode_manifests(docs: &[Value]) -> Result<Vec<u8>> {
    let mut out = String::new();
    for doc in docs {
        // serde_yaml 0.8 already starts every document with `---`
        out.push_str(&serde_yaml::to_string(doc).context("cannot encode manifest document")?);
        out.push('\n');
    }
    Ok(out.into_bytes())
}

pub fn kind(doc: &Value) -> Option<&str> {
    doc.get("kind").and_then(Value::as_str)
}

pub fn api_version(doc: &Value) -> Option<&str> {
    doc.get("apiVersion").and_then(Value::as_str)
}

pub fn name(doc: &Value) -> Option<&str> {
    doc.pointer("/metadata/name").and_then(Value::as_str)
}

pub fn namespace(doc: &Value) -> Option<&str> {
    doc.pointer("/metadata/namespace").and_then(Value::as_str)
}

/// Splits `apiVersion` into (group, version); the core group is "".
pub fn group_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// True if the document is of `kind` in API `group` (any version).
pub fn is_kind(doc: &Value, group: &str, wanted: &str) -> bool {
    let group_matches = api_version(doc)
        .map(|av| group_version(av).0 == group)
        .unwrap_or(false);
    group_matches && kind(doc) == Some(wanted)
}

/// Kinds that are never namespaced and must not carry `metadata.namespace`.
pub fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "CustomResourceDefinition"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "APIService"
            | "PriorityClass"
            | "StorageClass"
            | "MutatingWebhookConfiguration"
            | "ValidatingWebhookConfiguration"
    )
}
