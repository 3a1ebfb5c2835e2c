//! Reference name extraction.
//!
//! Reference kinds are declared with a field path into the primary object,
//! e.g. `.spec.secretName` or `.spec.backends[*].serviceName`. The path is
//! applied to the object's JSON tree and every reachable printable value
//! becomes a resource name to look up. Missing keys are not an error; they
//! simply produce no names.

use std::collections::BTreeSet;

use kube::api::DynamicObject;
use serde_json::Value;

use crate::{Error, Result};

enum Index {
    None,
    Wildcard,
    Nth(usize),
}

fn parse_segment(segment: &str) -> Result<(&str, Index)> {
    match segment.split_once('[') {
        None => Ok((segment, Index::None)),
        Some((field, rest)) => {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| Error::config(format!("invalid field path segment {segment:?}")))?;
            if inner == "*" {
                Ok((field, Index::Wildcard))
            } else {
                let n = inner.parse::<usize>().map_err(|_| {
                    Error::config(format!("invalid field path segment {segment:?}"))
                })?;
                Ok((field, Index::Nth(n)))
            }
        }
    }
}

fn push_printable(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            names.insert(s.clone());
        }
        Value::Number(n) => {
            names.insert(n.to_string());
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => {
                        names.insert(s.clone());
                    }
                    Value::Number(n) => {
                        names.insert(n.to_string());
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Apply a field path to an object and return the set of names it yields,
/// deduplicated and in no particular order.
pub fn extract_names(path: &str, obj: &DynamicObject) -> Result<Vec<String>> {
    let trimmed = path
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim_start_matches('.');

    let root = serde_json::to_value(obj)?;
    let mut current: Vec<&Value> = vec![&root];

    for segment in trimmed.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (field, index) = parse_segment(segment)?;

        let mut next = Vec::new();
        for value in current {
            let Some(child) = value.get(field) else {
                continue;
            };
            match index {
                Index::None => next.push(child),
                Index::Wildcard => {
                    if let Some(items) = child.as_array() {
                        next.extend(items.iter());
                    }
                }
                Index::Nth(n) => {
                    if let Some(item) = child.as_array().and_then(|items| items.get(n)) {
                        next.push(item);
                    }
                }
            }
        }
        current = next;
    }

    let mut names = BTreeSet::new();
    for value in current {
        push_printable(value, &mut names);
    }

    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_with_spec(spec: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.com/v1alpha1",
            "kind": "Hello",
            "metadata": {"namespace": "default", "name": "h1"},
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn simple_path_yields_one_name() {
        let obj = object_with_spec(json!({"secretName": "credentials"}));
        assert_eq!(
            extract_names(".spec.secretName", &obj).unwrap(),
            vec!["credentials"]
        );
    }

    #[test]
    fn wildcard_collects_across_array_items() {
        let obj = object_with_spec(json!({
            "backends": [
                {"serviceName": "api"},
                {"serviceName": "worker"},
                {"serviceName": "api"},
            ]
        }));
        let names = extract_names(".spec.backends[*].serviceName", &obj).unwrap();
        assert_eq!(names, vec!["api", "worker"]);
    }

    #[test]
    fn terminal_string_array_is_flattened() {
        let obj = object_with_spec(json!({"secrets": ["a", "b"]}));
        let names = extract_names(".spec.secrets", &obj).unwrap();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn numeric_index_selects_one_item() {
        let obj = object_with_spec(json!({"backends": [{"name": "first"}, {"name": "second"}]}));
        assert_eq!(
            extract_names(".spec.backends[1].name", &obj).unwrap(),
            vec!["second"]
        );
    }

    #[test]
    fn missing_path_yields_nothing() {
        let obj = object_with_spec(json!({"other": true}));
        assert!(extract_names(".spec.secretName", &obj).unwrap().is_empty());
        assert!(extract_names(".spec.list[*].name", &obj).unwrap().is_empty());
    }

    #[test]
    fn braces_are_tolerated() {
        let obj = object_with_spec(json!({"secretName": "credentials"}));
        assert_eq!(
            extract_names("{.spec.secretName}", &obj).unwrap(),
            vec!["credentials"]
        );
    }

    #[test]
    fn malformed_index_is_an_error() {
        let obj = object_with_spec(json!({}));
        assert!(extract_names(".spec.items[x].name", &obj).is_err());
        assert!(extract_names(".spec.items[*", &obj).is_err());
    }
}
