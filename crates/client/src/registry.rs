//! In-process tool registry.
//!
//! Built before `start` and immutable afterwards. Registration validates
//! the schema dialect; names are unique per client.

use std::collections::HashMap;
use std::sync::Arc;

use mill_domain::schema::check_schema;
use mill_domain::tool::{ToolHandler, ToolSpec};
use mill_domain::{Error, Result};

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Fails on duplicate names and schema violations.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<()> {
        let spec = handler.spec();
        check_schema(&spec.input_schema)?;
        if self.tools.contains_key(&spec.name) {
            return Err(Error::Conflict(format!(
                "tool {:?} already registered",
                spec.name
            )));
        }
        self.tools.insert(spec.name.clone(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_domain::tool::{ToolContext, ToolError};

    struct Dummy(&'static str);

    #[async_trait::async_trait]
    impl ToolHandler for Dummy {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.0.into(),
                description: "dummy".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn invoke(
            &self,
            _ctx: ToolContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, ToolError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn register_and_resolve() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy("calc"))).unwrap();
        assert!(reg.get("calc").is_some());
        assert!(reg.get("other").is_none());
        assert_eq!(reg.specs().len(), 1);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy("calc"))).unwrap();
        let err = reg.register(Arc::new(Dummy("calc"))).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    struct BadSchema;

    #[async_trait::async_trait]
    impl ToolHandler for BadSchema {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "bad".into(),
                description: String::new(),
                input_schema: serde_json::json!({"type": "string"}),
            }
        }

        async fn invoke(
            &self,
            _ctx: ToolContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, ToolError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn invalid_schema_rejected() {
        let mut reg = ToolRegistry::new();
        assert!(reg.register(Arc::new(BadSchema)).is_err());
    }
}
