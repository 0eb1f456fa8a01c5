//! CP-003: Expression parsing and input resolution.
//!
//! Input trees may carry `${instance.path.to.output}` expressions in any
//! string leaf. The first segment names an instance local to the current
//! scope, the rest is a path into that instance's outputs. `${env.NAME}`
//! reads the run context's environment map instead.
//!
//! A leaf that is exactly one expression is replaced by the referenced value,
//! keeping its type. Expressions embedded in longer text are interpolated and
//! must point at scalars.

use super::error::{EngineError, Result};
use super::types::{lookup_path, value_to_text, ENV_NAMESPACE};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]+)*)\s*\}")
        .expect("expression pattern is valid")
});

/// A parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The expression as written, e.g. `${api.url}`
    pub expression: String,
    /// Referenced instance (local name) or the `env` namespace
    pub instance: String,
    /// Output path below the instance
    pub path: Vec<String>,
}

impl Reference {
    fn from_match(expression: &str, body: &str) -> Self {
        let mut segments = body.split('.').map(str::to_string);
        let instance = segments.next().unwrap_or_default();
        Self {
            expression: expression.to_string(),
            instance,
            path: segments.collect(),
        }
    }

    /// True for `${env.NAME}` lookups, which never create dependency edges.
    pub fn is_env(&self) -> bool {
        self.instance == ENV_NAMESPACE
    }
}

/// Extract every reference from a single string.
pub fn find_references(text: &str) -> Vec<Reference> {
    EXPRESSION
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let body = cap.get(1)?;
            Some(Reference::from_match(whole.as_str(), body.as_str()))
        })
        .collect()
}

/// Collect every reference found in the string leaves of a tree.
pub fn collect_references(tree: &Value) -> Vec<Reference> {
    let mut refs = Vec::new();
    walk_strings(tree, &mut |s| refs.extend(find_references(s)));
    refs
}

fn walk_strings(tree: &Value, visit: &mut dyn FnMut(&str)) {
    match tree {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|v| walk_strings(v, visit)),
        Value::Object(map) => map.values().for_each(|v| walk_strings(v, visit)),
        _ => {}
    }
}

/// Outputs of the instances that already settled in a scope, keyed by local name.
#[derive(Debug, Clone, Default)]
pub struct OutputPool {
    outputs: HashMap<String, Value>,
}

impl OutputPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instance's outputs. Outputs are write-once: returns false and
    /// keeps the original if the instance was already recorded.
    pub fn insert(&mut self, instance: &str, outputs: Value) -> bool {
        if self.outputs.contains_key(instance) {
            return false;
        }
        self.outputs.insert(instance.to_string(), outputs);
        true
    }

    pub fn get(&self, instance: &str) -> Option<&Value> {
        self.outputs.get(instance)
    }

    pub fn contains(&self, instance: &str) -> bool {
        self.outputs.contains_key(instance)
    }
}

/// Resolution environment: settled outputs plus the run's env map.
pub struct Resolver<'a> {
    pool: &'a OutputPool,
    env: &'a BTreeMap<String, String>,
}

impl<'a> Resolver<'a> {
    pub fn new(pool: &'a OutputPool, env: &'a BTreeMap<String, String>) -> Self {
        Self { pool, env }
    }

    /// Produce a fully substituted copy of `inputs` for `instance`.
    pub fn resolve_inputs(&self, instance: &str, inputs: &Value) -> Result<Value> {
        match inputs {
            Value::String(s) => self.resolve_string(instance, s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_inputs(instance, v))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::new();
                for (key, v) in map {
                    resolved.insert(key.clone(), self.resolve_inputs(instance, v)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, instance: &str, text: &str) -> Result<Value> {
        let Some(first) = EXPRESSION.find(text) else {
            return Ok(Value::String(text.to_string()));
        };

        // Whole-leaf expression keeps the referenced value's type.
        if first.start() == 0 && first.end() == text.len() {
            if let Some(reference) = find_references(text).first() {
                return self.lookup(instance, reference);
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for cap in EXPRESSION.captures_iter(text) {
            let (Some(whole), Some(body)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            let reference = Reference::from_match(whole.as_str(), body.as_str());
            let value = self.lookup(instance, &reference)?;
            let rendered = value_to_text(&value).ok_or_else(|| EngineError::UnresolvedReference {
                instance: instance.to_string(),
                expression: reference.expression.clone(),
            })?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(&rendered);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }

    fn lookup(&self, instance: &str, reference: &Reference) -> Result<Value> {
        let unresolved = || EngineError::UnresolvedReference {
            instance: instance.to_string(),
            expression: reference.expression.clone(),
        };

        if reference.is_env() {
            return match reference.path.as_slice() {
                [name] => self
                    .env
                    .get(name)
                    .map(|v| Value::String(v.clone()))
                    .ok_or_else(unresolved),
                _ => Err(unresolved()),
            };
        }

        let outputs =
            self.pool
                .get(&reference.instance)
                .ok_or_else(|| EngineError::DependencyNotReady {
                    instance: instance.to_string(),
                    dependency: reference.instance.clone(),
                })?;
        lookup_path(outputs, &reference.path)
            .cloned()
            .ok_or_else(unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool_with(entries: &[(&str, Value)]) -> OutputPool {
        let mut pool = OutputPool::new();
        for (id, out) in entries {
            pool.insert(id, out.clone());
        }
        pool
    }

    #[test]
    fn test_cp003_find_references() {
        let refs = find_references("${api.websockets.url}/path?key=${env.KEY}");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].instance, "api");
        assert_eq!(refs[0].path, vec!["websockets", "url"]);
        assert_eq!(refs[0].expression, "${api.websockets.url}");
        assert!(refs[1].is_env());
    }

    #[test]
    fn test_cp003_not_an_expression() {
        assert!(find_references("plain text").is_empty());
        assert!(find_references("${not valid!}").is_empty());
        assert!(find_references("$api.url").is_empty());
    }

    #[test]
    fn test_cp003_collect_references_nested() {
        let tree = json!({
            "env": {"api_url": "${api.url}"},
            "routes": ["${router.routes.0}", "static"],
            "memory": 512
        });
        let refs = collect_references(&tree);
        let names: Vec<_> = refs.iter().map(|r| r.instance.as_str()).collect();
        assert_eq!(refs.len(), 2);
        assert!(names.contains(&"api"));
        assert!(names.contains(&"router"));
    }

    #[test]
    fn test_cp003_resolve_scenario_site_reads_api_url() {
        let pool = pool_with(&[("api", json!({"url": "wss://x"}))]);
        let env = BTreeMap::new();
        let resolver = Resolver::new(&pool, &env);
        let resolved = resolver
            .resolve_inputs("site", &json!({"apiUrl": "${api.url}"}))
            .unwrap();
        assert_eq!(resolved["apiUrl"], json!("wss://x"));
    }

    #[test]
    fn test_cp003_whole_leaf_keeps_type() {
        let pool = pool_with(&[("db", json!({"port": 5432, "hosts": ["a", "b"]}))]);
        let env = BTreeMap::new();
        let resolver = Resolver::new(&pool, &env);
        let resolved = resolver
            .resolve_inputs("app", &json!({"port": "${db.port}", "hosts": "${db.hosts}"}))
            .unwrap();
        assert_eq!(resolved["port"], json!(5432));
        assert_eq!(resolved["hosts"], json!(["a", "b"]));
    }

    #[test]
    fn test_cp003_interpolation() {
        let pool = pool_with(&[("db", json!({"host": "db.local", "port": 5432}))]);
        let env = BTreeMap::new();
        let resolver = Resolver::new(&pool, &env);
        let resolved = resolver
            .resolve_inputs("app", &json!("postgres://${db.host}:${db.port}/app"))
            .unwrap();
        assert_eq!(resolved, json!("postgres://db.local:5432/app"));
    }

    #[test]
    fn test_cp003_interpolating_a_tree_fails() {
        let pool = pool_with(&[("db", json!({"hosts": ["a"]}))]);
        let env = BTreeMap::new();
        let resolver = Resolver::new(&pool, &env);
        let err = resolver
            .resolve_inputs("app", &json!("hosts=${db.hosts}"))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_cp003_nested_sequences_and_passthrough() {
        let pool = pool_with(&[("a", json!({"v": 1}))]);
        let env = BTreeMap::new();
        let resolver = Resolver::new(&pool, &env);
        let input = json!({"list": [{"x": "${a.v}"}, 2, null, true], "name": "n"});
        let resolved = resolver.resolve_inputs("b", &input).unwrap();
        assert_eq!(resolved, json!({"list": [{"x": 1}, 2, null, true], "name": "n"}));
    }

    #[test]
    fn test_cp003_dependency_not_ready() {
        let pool = OutputPool::new();
        let env = BTreeMap::new();
        let resolver = Resolver::new(&pool, &env);
        let err = resolver
            .resolve_inputs("site", &json!({"u": "${api.url}"}))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::DependencyNotReady {
                instance: "site".to_string(),
                dependency: "api".to_string(),
            }
        );
    }

    #[test]
    fn test_cp003_unresolved_reference_carries_expression() {
        let pool = pool_with(&[("api", json!({"url": "wss://x"}))]);
        let env = BTreeMap::new();
        let resolver = Resolver::new(&pool, &env);
        let err = resolver
            .resolve_inputs("site", &json!({"u": "${api.missing.field}"}))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::UnresolvedReference {
                instance: "site".to_string(),
                expression: "${api.missing.field}".to_string(),
            }
        );
    }

    #[test]
    fn test_cp003_env_namespace() {
        let pool = OutputPool::new();
        let env = BTreeMap::from([("REGION".to_string(), "us-east-1".to_string())]);
        let resolver = Resolver::new(&pool, &env);
        let resolved = resolver
            .resolve_inputs("api", &json!({"region": "${env.REGION}", "arn": "arn:${env.REGION}"}))
            .unwrap();
        assert_eq!(resolved["region"], json!("us-east-1"));
        assert_eq!(resolved["arn"], json!("arn:us-east-1"));

        let err = resolver
            .resolve_inputs("api", &json!("${env.MISSING}"))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_cp003_output_pool_write_once() {
        let mut pool = OutputPool::new();
        assert!(pool.insert("api", json!({"url": "a"})));
        assert!(!pool.insert("api", json!({"url": "b"})));
        assert_eq!(pool.get("api"), Some(&json!({"url": "a"})));
        assert!(pool.contains("api"));
    }
}
