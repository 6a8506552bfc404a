//! Schema metadata injected at startup.
//!
//! The engine does not discover schema; it consumes what the external schema
//! compiler supplies: per table, the intrinsic content fields, the parent
//! reference fields, and the inverse dependency tables.

use crate::engine::types::FastMap;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    /// Fields hashed into the intrinsic hash.
    #[serde(default)]
    pub intrinsic_fields: Vec<SmolStr>,
    /// Fields whose value is the record id of an owning record. Excluded
    /// from composition so that the owner edge never cycles back.
    #[serde(default)]
    pub parent_refs: Vec<SmolStr>,
    /// Tables whose records depend on records of this table (the inverse of
    /// their parent_refs).
    #[serde(default)]
    pub dependencies: Vec<SmolStr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSet {
    tables: FastMap<SmolStr, TableSchema>,
}

impl SchemaSet {
    /// Validate and seal the injected metadata. Fatal at init: unknown
    /// dependency tables and cycles in the dependency graph are rejected.
    pub fn new(tables: FastMap<SmolStr, TableSchema>) -> Result<Self> {
        for (name, schema) in &tables {
            for dep in &schema.dependencies {
                if !tables.contains_key(dep) {
                    return Err(EngineError::schema(format!(
                        "table '{}' declares unknown dependency table '{}'",
                        name, dep
                    )));
                }
            }
        }

        let set = SchemaSet { tables };
        set.check_acyclic()?;
        Ok(set)
    }

    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let tables: FastMap<SmolStr, TableSchema> = serde_json::from_value(json)
            .map_err(|e| EngineError::schema(format!("invalid schema metadata: {}", e)))?;
        SchemaSet::new(tables)
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn intrinsic_fields(&self, table: &str) -> &[SmolStr] {
        self.table(table)
            .map(|t| t.intrinsic_fields.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent_ref_fields(&self, table: &str) -> &[SmolStr] {
        self.table(table)
            .map(|t| t.parent_refs.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependency_tables(&self, table: &str) -> &[SmolStr] {
        self.table(table)
            .map(|t| t.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Depth-first cycle check over the table-level dependency edges. The
    /// @parent exclusion means these edges must form a DAG; a cycle here
    /// would make the hash cascade diverge.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: FastMap<SmolStr, Mark> = FastMap::default();

        fn visit(
            set: &SchemaSet,
            table: &SmolStr,
            marks: &mut FastMap<SmolStr, Mark>,
            trail: &mut Vec<SmolStr>,
        ) -> Result<()> {
            match marks.get(table) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    trail.push(table.clone());
                    return Err(EngineError::schema(format!(
                        "cyclic dependency chain: {}",
                        trail
                            .iter()
                            .map(|t| t.as_str())
                            .collect::<Vec<_>>()
                            .join(" -> ")
                    )));
                }
                None => {}
            }

            marks.insert(table.clone(), Mark::Visiting);
            trail.push(table.clone());
            for dep in set.dependency_tables(table.as_str()) {
                visit(set, dep, marks, trail)?;
            }
            trail.pop();
            marks.insert(table.clone(), Mark::Done);
            Ok(())
        }

        for table in self.tables.keys() {
            let mut trail = Vec::new();
            visit(self, table, &mut marks, &mut trail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn forum_schema_json() -> serde_json::Value {
        json!({
            "thread": {
                "intrinsic_fields": ["title", "content"],
                "parent_refs": ["author"],
                "dependencies": ["comment"]
            },
            "comment": {
                "intrinsic_fields": ["content"],
                "parent_refs": ["thread", "author"],
                "dependencies": []
            },
            "author": {
                "intrinsic_fields": ["name"],
                "parent_refs": [],
                "dependencies": ["thread", "comment"]
            }
        })
    }

    #[test]
    fn test_valid_schema_loads() {
        let schema = SchemaSet::from_json(forum_schema_json()).unwrap();
        assert_eq!(schema.intrinsic_fields("thread"), &["title", "content"]);
        assert_eq!(schema.parent_ref_fields("comment").len(), 2);
        assert_eq!(schema.dependency_tables("author").len(), 2);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = SchemaSet::from_json(json!({
            "thread": { "dependencies": ["ghost"] }
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_cycle_rejected() {
        let err = SchemaSet::from_json(json!({
            "a": { "dependencies": ["b"] },
            "b": { "dependencies": ["a"] }
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_self_cycle_rejected() {
        let err = SchemaSet::from_json(json!({
            "a": { "dependencies": ["a"] }
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "schema");
    }
}
