//! Tool aggregation
//!
//! Builds the external tool catalog from the pool's raw tool lists. Name
//! conflicts are resolved globally: when two servers publish the same tool
//! name, every member of the conflict group is renamed
//! `"<server>.<original>"`; unique names are left alone. Downstream JSON
//! Schemas are reduced to a small, flat subset so clients with strict
//! validators never choke on exotic schema features.
//!
//! The catalog is memoized with a TTL and tied to the pool's generation
//! counter, so any pool mutation invalidates the snapshot immediately.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::mcp::manager::{ClientManager, ManagerError};
use crate::mcp::types::{RawTool, Tool};

/// How long a catalog snapshot stays valid without a pool mutation.
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("No tool named '{0}'")]
    ToolNotFound(String),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

struct CachedCatalog {
    tools: Arc<Vec<Tool>>,
    cached_at: Instant,
    generation: u64,
}

/// Produces and caches the external tool catalog, and routes calls by
/// exposed name.
pub struct ToolAggregator {
    manager: Arc<ClientManager>,
    cache: Mutex<Option<CachedCatalog>>,
}

impl ToolAggregator {
    pub fn new(manager: Arc<ClientManager>) -> Self {
        Self {
            manager,
            cache: Mutex::new(None),
        }
    }

    /// Return the current catalog snapshot, rebuilding it only when the TTL
    /// has lapsed or the pool changed underneath it.
    pub async fn aggregate(&self) -> Arc<Vec<Tool>> {
        let generation = self.manager.generation();

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.generation == generation && cached.cached_at.elapsed() < CACHE_TTL {
                    return cached.tools.clone();
                }
            }
        }

        let raw = self.manager.list_all_tools().await;
        let mut keyed: HashMap<String, (BTreeSet<String>, Vec<RawTool>)> = HashMap::new();
        for (server, tools) in raw {
            let tags = self
                .manager
                .server_tags(&server)
                .cloned()
                .unwrap_or_default();
            keyed.insert(server, (tags, tools));
        }

        let tools = Arc::new(build_catalog(keyed));

        let mut cache = self.cache.lock().await;
        *cache = Some(CachedCatalog {
            tools: tools.clone(),
            cached_at: Instant::now(),
            generation,
        });
        tools
    }

    /// Tags of the server owning the tool with this exposed name.
    pub async fn get_tool_server_tags(&self, exposed_name: &str) -> Option<BTreeSet<String>> {
        let catalog = self.aggregate().await;
        catalog
            .iter()
            .find(|t| t.exposed_name == exposed_name)
            .map(|t| t.server_tags.clone())
    }

    /// Route a call by exposed name to the owning downstream, using the
    /// original tool name on the wire.
    pub async fn call_tool(
        &self,
        exposed_name: &str,
        arguments: Value,
    ) -> Result<Value, AggregatorError> {
        let catalog = self.aggregate().await;
        let tool = catalog
            .iter()
            .find(|t| t.exposed_name == exposed_name)
            .ok_or_else(|| AggregatorError::ToolNotFound(exposed_name.to_string()))?;

        Ok(self
            .manager
            .call_tool(&tool.server_name, &tool.original_name, arguments)
            .await?)
    }

    #[cfg(test)]
    pub(crate) async fn seed_cache_for_test(&self, tools: Vec<Tool>) {
        let mut cache = self.cache.lock().await;
        *cache = Some(CachedCatalog {
            tools: Arc::new(tools),
            cached_at: Instant::now(),
            generation: self.manager.generation(),
        });
    }
}

/// Assemble the catalog from per-server raw tool lists and resolve name
/// conflicts globally.
pub(crate) fn build_catalog(
    raw: HashMap<String, (BTreeSet<String>, Vec<RawTool>)>,
) -> Vec<Tool> {
    let mut flat: Vec<Tool> = Vec::new();
    for (server, (tags, tools)) in raw {
        for raw_tool in tools {
            flat.push(Tool {
                exposed_name: raw_tool.name.clone(),
                original_name: raw_tool.name,
                description: raw_tool.description,
                input_schema: simplify_schema(&raw_tool.input_schema),
                server_name: server.clone(),
                server_tags: tags.clone(),
            });
        }
    }

    // Exact duplicates within one server collapse to a single entry.
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    flat.retain(|tool| {
        let key = (tool.server_name.clone(), tool.original_name.clone());
        if seen.contains(&key) {
            tracing::warn!(
                server = %tool.server_name,
                tool = %tool.original_name,
                "server listed the same tool twice, keeping one entry"
            );
            return false;
        }
        seen.insert(key);
        true
    });

    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for tool in &flat {
        *name_counts.entry(tool.exposed_name.as_str()).or_default() += 1;
    }
    let conflicted: BTreeSet<String> = name_counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name.to_string())
        .collect();

    for tool in &mut flat {
        if conflicted.contains(&tool.exposed_name) {
            tool.exposed_name = format!("{}.{}", tool.server_name, tool.original_name);
        }
    }

    flat.sort_by(|a, b| a.exposed_name.cmp(&b.exposed_name));
    flat
}

/// Reduce a downstream JSON Schema to the flat subset the broker exposes.
///
/// The reduction is lossy on purpose: arrays, nested objects, and enums all
/// collapse to simple typed properties, with `string` as the fallback. A
/// fallthrough is logged so schema drift stays observable.
pub(crate) fn simplify_schema(schema: &Value) -> Value {
    let top_type = schema
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("object");

    let mut properties = Map::new();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop) in props {
            properties.insert(key.clone(), simplify_property(key, prop));
        }
    }

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    serde_json::json!({
        "type": top_type,
        "properties": properties,
        "required": required,
    })
}

fn simplify_property(name: &str, prop: &Value) -> Value {
    let description = prop.get("description").and_then(Value::as_str);

    let simple_type = match prop.get("type").and_then(Value::as_str) {
        Some(t) => Some(t.to_string()),
        None => prop
            .get("anyOf")
            .and_then(Value::as_array)
            .and_then(|branches| single_non_null_branch(branches))
            .and_then(|branch| branch.get("type").and_then(Value::as_str))
            .map(str::to_string),
    };

    let resolved = match simple_type {
        Some(t) => t,
        None => {
            tracing::debug!(property = %name, "schema property fell through to string");
            "string".to_string()
        }
    };

    let mut out = Map::new();
    out.insert("type".to_string(), Value::String(resolved));
    if let Some(desc) = description {
        out.insert("description".to_string(), Value::String(desc.to_string()));
    }
    Value::Object(out)
}

/// An `anyOf` collapses only when exactly one branch is non-null.
fn single_non_null_branch(branches: &[Value]) -> Option<&Value> {
    let non_null: Vec<&Value> = branches
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) != Some("null"))
        .collect();
    if non_null.len() == 1 {
        Some(non_null[0])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::manager::SupervisorSettings;

    fn raw_tool(name: &str) -> RawTool {
        RawTool {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn pool(entries: Vec<(&str, &[&str], Vec<RawTool>)>) -> HashMap<String, (BTreeSet<String>, Vec<RawTool>)> {
        entries
            .into_iter()
            .map(|(server, server_tags, tools)| {
                (server.to_string(), (tags(server_tags), tools))
            })
            .collect()
    }

    #[test]
    fn test_conflicting_names_are_prefixed() {
        let catalog = build_catalog(pool(vec![
            ("web", &[], vec![raw_tool("search")]),
            ("wiki", &[], vec![raw_tool("search")]),
            ("auth", &[], vec![raw_tool("login")]),
        ]));

        let names: Vec<&str> = catalog.iter().map(|t| t.exposed_name.as_str()).collect();
        assert!(names.contains(&"web.search"));
        assert!(names.contains(&"wiki.search"));
        assert!(names.contains(&"login"));
        assert!(!names.contains(&"search"));
    }

    #[test]
    fn test_prefixed_tools_keep_original_name() {
        let catalog = build_catalog(pool(vec![
            ("a", &[], vec![raw_tool("search")]),
            ("b", &[], vec![raw_tool("search")]),
        ]));

        for tool in &catalog {
            assert_eq!(tool.original_name, "search");
            assert_eq!(
                tool.exposed_name,
                format!("{}.{}", tool.server_name, tool.original_name)
            );
        }
    }

    #[test]
    fn test_exposed_names_uniquely_identify_tools() {
        let catalog = build_catalog(pool(vec![
            ("a", &[], vec![raw_tool("x"), raw_tool("y")]),
            ("b", &[], vec![raw_tool("x"), raw_tool("z")]),
        ]));

        for t1 in &catalog {
            for t2 in &catalog {
                if t1.exposed_name == t2.exposed_name {
                    assert_eq!(t1.server_name, t2.server_name);
                    assert_eq!(t1.original_name, t2.original_name);
                }
            }
        }
    }

    #[test]
    fn test_duplicate_tool_within_one_server_collapses() {
        let catalog = build_catalog(pool(vec![(
            "a",
            &[],
            vec![raw_tool("dup"), raw_tool("dup")],
        )]));
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].exposed_name, "dup");
    }

    #[test]
    fn test_server_tags_copied_onto_tools() {
        let catalog = build_catalog(pool(vec![(
            "cal",
            &["private", "calendars"],
            vec![raw_tool("list_events")],
        )]));
        assert!(catalog[0].server_tags.contains("private"));
        assert!(catalog[0].server_tags.contains("calendars"));
    }

    #[test]
    fn test_simplify_schema_basic_shape() {
        let simplified = simplify_schema(&serde_json::json!({
            "type": "object",
            "properties": {
                "q": {"type": "string", "description": "query"},
                "limit": {"type": "integer"},
            },
            "required": ["q"],
        }));

        assert_eq!(simplified["type"], "object");
        assert_eq!(simplified["properties"]["q"]["type"], "string");
        assert_eq!(simplified["properties"]["q"]["description"], "query");
        assert_eq!(simplified["properties"]["limit"]["type"], "integer");
        assert_eq!(simplified["required"], serde_json::json!(["q"]));
    }

    #[test]
    fn test_simplify_schema_defaults() {
        let simplified = simplify_schema(&serde_json::json!({}));
        assert_eq!(simplified["type"], "object");
        assert_eq!(simplified["properties"], serde_json::json!({}));
        assert_eq!(simplified["required"], serde_json::json!([]));
    }

    #[test]
    fn test_simplify_schema_collapses_single_non_null_any_of() {
        let simplified = simplify_schema(&serde_json::json!({
            "type": "object",
            "properties": {
                "maybe": {"anyOf": [{"type": "null"}, {"type": "number"}]},
            },
        }));
        assert_eq!(simplified["properties"]["maybe"]["type"], "number");
    }

    #[test]
    fn test_simplify_schema_falls_back_to_string() {
        let simplified = simplify_schema(&serde_json::json!({
            "type": "object",
            "properties": {
                "multi": {"anyOf": [{"type": "number"}, {"type": "string"}]},
                "odd": {"enum": ["a", "b"]},
            },
        }));
        assert_eq!(simplified["properties"]["multi"]["type"], "string");
        assert_eq!(simplified["properties"]["odd"]["type"], "string");
    }

    #[test]
    fn test_simplify_schema_is_idempotent() {
        let inputs = [
            serde_json::json!({}),
            serde_json::json!({"type": "object", "properties": {"a": {"type": "boolean"}}}),
            serde_json::json!({
                "type": "object",
                "properties": {
                    "x": {"anyOf": [{"type": "null"}, {"type": "integer"}]},
                    "y": {"weird": true},
                },
                "required": ["x"],
            }),
        ];

        for input in inputs {
            let once = simplify_schema(&input);
            let twice = simplify_schema(&once);
            assert_eq!(once, twice);
        }
    }

    #[tokio::test]
    async fn test_cache_returns_same_snapshot_within_ttl() {
        let manager = ClientManager::new(Vec::new(), SupervisorSettings::default());
        let aggregator = ToolAggregator::new(manager);

        let first = aggregator.aggregate().await;
        let second = aggregator.aggregate().await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_pool_mutation_invalidates_cache() {
        let manager = ClientManager::new(Vec::new(), SupervisorSettings::default());
        let aggregator = ToolAggregator::new(manager.clone());

        let first = aggregator.aggregate().await;
        manager.bump_generation_for_test();
        let second = aggregator.aggregate().await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_call_tool_unknown_name() {
        let manager = ClientManager::new(Vec::new(), SupervisorSettings::default());
        let aggregator = ToolAggregator::new(manager);

        let err = aggregator
            .call_tool("ghost", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::ToolNotFound(_)));
    }
}
