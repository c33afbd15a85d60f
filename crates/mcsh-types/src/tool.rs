//! Descriptors for remote tools discovered through the session pool.

use serde::{Deserialize, Serialize};

/// A remote tool as advertised by its MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Human-readable description (may be empty).
    #[serde(default)]
    pub description: String,
    /// Declared input schema (JSON Schema object).
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ToolDescriptor {
    /// Whether the declared input schema has a property with the given name.
    ///
    /// Used by the engine to decide whether upstream data may be bound into
    /// the tool's arguments.
    pub fn has_property(&self, name: &str) -> bool {
        self.input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .is_some_and(|props| props.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn has_property_checks_schema_properties() {
        let desc = ToolDescriptor {
            name: "fetch".into(),
            description: String::new(),
            input_schema: json!({
                "type": "object",
                "properties": { "url": {"type": "string"}, "input": {"type": "string"} }
            }),
        };
        assert!(desc.has_property("input"));
        assert!(desc.has_property("url"));
        assert!(!desc.has_property("body"));
    }

    #[test]
    fn schemaless_tool_has_no_properties() {
        let desc: ToolDescriptor =
            serde_json::from_str(r#"{"name":"ping"}"#).unwrap();
        assert!(!desc.has_property("input"));
    }
}
