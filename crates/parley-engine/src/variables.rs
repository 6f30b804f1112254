use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};
use tracing::warn;

use parley_core::flow::Promote;

/// Read access to variables by dot path.
pub trait Lookup {
    fn lookup(&self, path: &str) -> Option<&Value>;
}

impl Lookup for Map<String, Value> {
    fn lookup(&self, path: &str) -> Option<&Value> {
        walk(self, path)
    }
}

/// Walk a dot path through nested objects. Numeric segments index arrays.
pub fn walk<'v>(root: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// A temporary overlay on top of another lookup. Overlay keys shadow the base.
pub struct Scope<'a> {
    overlay: &'a Map<String, Value>,
    base: &'a dyn Lookup,
}

impl<'a> Scope<'a> {
    pub fn new(overlay: &'a Map<String, Value>, base: &'a dyn Lookup) -> Self {
        Self { overlay, base }
    }
}

impl Lookup for Scope<'_> {
    fn lookup(&self, path: &str) -> Option<&Value> {
        walk(self.overlay, path).or_else(|| self.base.lookup(path))
    }
}

/// Per-conversation variable store.
///
/// Node outputs always live under `<nodeId>.*`. Promotion copies allowed
/// outputs to the root namespace so later nodes can write `{{titulo}}`
/// instead of `{{extract.titulo}}`.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    values: Map<String, Value>,
    promoted_by: BTreeMap<String, String>,
    /// Root keys that are node namespaces and may not be promoted over.
    reserved: HashSet<String>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(values: Map<String, Value>, promoted_by: BTreeMap<String, String>) -> Self {
        Self {
            values,
            promoted_by,
            reserved: HashSet::new(),
        }
    }

    pub fn into_parts(self) -> (Map<String, Value>, BTreeMap<String, String>) {
        (self.values, self.promoted_by)
    }

    /// Protect node namespaces from being overwritten by promotion.
    pub fn with_reserved<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved.extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        walk(&self.values, path)
    }

    /// Write a value at a dot path, creating intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.trim().split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        if last.is_empty() {
            return;
        }
        let mut current = &mut self.values;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
        current.insert(last.to_string(), value);
    }

    /// Store a node's outputs under its namespace and promote the allowed
    /// keys to the root.
    pub fn merge(&mut self, node_id: &str, outputs: &Map<String, Value>, promote: &Promote) {
        self.values
            .insert(node_id.to_string(), Value::Object(outputs.clone()));

        for (key, value) in outputs {
            if !promote.allows(key) {
                continue;
            }
            if self.reserved.contains(key) {
                warn!(node_id, key = %key, "Output shadows a node namespace, not promoted");
                continue;
            }
            if let Some(previous) = self.promoted_by.get(key) {
                if previous != node_id {
                    warn!(
                        node_id,
                        key = %key,
                        previous = %previous,
                        "Promoted variable overwritten by a different node"
                    );
                }
            }
            self.values.insert(key.clone(), value.clone());
            self.promoted_by.insert(key.clone(), node_id.to_string());
        }
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

impl Lookup for VariableStore {
    fn lookup(&self, path: &str) -> Option<&Value> {
        self.get(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_walk_nested_and_indexed() {
        let vars = outputs(json!({
            "search": {"items": [{"name": "Harry Potter"}, {"name": "Hobbit"}]}
        }));
        assert_eq!(walk(&vars, "search.items.1.name"), Some(&json!("Hobbit")));
        assert_eq!(walk(&vars, "search.items.9.name"), None);
        assert_eq!(walk(&vars, "search.items.x"), None);
        assert_eq!(walk(&vars, ""), None);
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut store = VariableStore::new();
        store.set("a.b.c", json!(1));
        assert_eq!(store.get("a.b.c"), Some(&json!(1)));

        store.set("a", json!("flat"));
        store.set("a.x", json!(2));
        assert_eq!(store.get("a.x"), Some(&json!(2)));
    }

    #[test]
    fn test_merge_namespaces_and_promotes() {
        let mut store = VariableStore::new();
        store.merge(
            "extract",
            &outputs(json!({"titulo": "harry potter", "complete": true})),
            &Promote::All,
        );
        assert_eq!(store.get("extract.titulo"), Some(&json!("harry potter")));
        assert_eq!(store.get("titulo"), Some(&json!("harry potter")));
    }

    #[test]
    fn test_merge_respects_allow_list() {
        let mut store = VariableStore::new();
        store.merge(
            "search",
            &outputs(json!({"items": [1], "body": {"x": 1}})),
            &Promote::Only(vec!["items".into()]),
        );
        assert!(store.get("items").is_some());
        assert!(store.get("body").is_none());
        assert!(store.get("search.body.x").is_some());

        store.merge("quiet", &outputs(json!({"z": 1})), &Promote::Only(vec![]));
        assert!(store.get("z").is_none());
    }

    #[test]
    fn test_promotion_never_clobbers_namespace() {
        let mut store = VariableStore::new().with_reserved(["search"]);
        store.merge("search", &outputs(json!({"ok": true})), &Promote::All);
        store.merge("other", &outputs(json!({"search": "x"})), &Promote::All);
        assert_eq!(store.get("search.ok"), Some(&json!(true)));
        assert_eq!(store.get("other.search"), Some(&json!("x")));
    }

    #[test]
    fn test_collision_last_writer_wins() {
        let mut store = VariableStore::new();
        store.merge("a", &outputs(json!({"reply": "one"})), &Promote::All);
        store.merge("b", &outputs(json!({"reply": "two"})), &Promote::All);
        assert_eq!(store.get("reply"), Some(&json!("two")));
        let (_, promoted_by) = store.into_parts();
        assert_eq!(promoted_by["reply"], "b");
    }

    #[test]
    fn test_scope_shadows_base() {
        let base = outputs(json!({"name": "base", "shop": "Libros"}));
        let overlay = outputs(json!({"name": "item"}));
        let scope = Scope::new(&overlay, &base);
        assert_eq!(scope.lookup("name"), Some(&json!("item")));
        assert_eq!(scope.lookup("shop"), Some(&json!("Libros")));
    }
}
