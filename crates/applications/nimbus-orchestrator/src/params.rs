//! Parameter tables and placeholder substitution

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::descriptor::{DescriptorValue, InputDecl, WorkloadDescriptor};
use crate::error::{OrchestratorError, Result};

/// Input name → value, supplied by the caller per compile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTable {
    values: BTreeMap<String, Value>,
}

impl ParameterTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML (or JSON) mapping
    pub fn from_yaml(text: &str) -> Result<Self> {
        let parsed: Value = serde_yaml::from_str(text)
            .map_err(|e| OrchestratorError::MalformedParameterInput(e.to_string()))?;
        match parsed {
            Value::Object(map) => Ok(Self {
                values: map.into_iter().collect(),
            }),
            other => Err(OrchestratorError::MalformedParameterInput(format!(
                "expected a mapping of input names to values, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Set one value (builder style)
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, Value)> for ParameterTable {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "nothing",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Resolves placeholders of one descriptor against one parameter table
///
/// Lookup order is the parameter table first, then the declared input default.
pub struct Substitution<'a> {
    params: Option<&'a ParameterTable>,
    inputs: &'a BTreeMap<String, InputDecl>,
}

impl<'a> Substitution<'a> {
    /// Check every placeholder of `descriptor` up front
    ///
    /// Fails with `MissingParameter` when the descriptor has placeholders but no
    /// table was supplied, and with `UnresolvedInputReference` for the first
    /// placeholder that has neither a table entry nor a default.
    pub fn prepare(descriptor: &'a WorkloadDescriptor, params: Option<&'a ParameterTable>) -> Result<Self> {
        let subst = Self {
            params,
            inputs: &descriptor.inputs,
        };

        let referenced = descriptor.referenced_inputs();
        if params.is_none() {
            if let Some(first) = referenced.iter().next() {
                return Err(OrchestratorError::MissingParameter(first.clone()));
            }
        }
        for name in &referenced {
            subst.lookup(name)?;
        }
        debug!(inputs = referenced.len(), "All descriptor inputs resolvable");
        Ok(subst)
    }

    fn lookup(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.params.and_then(|p| p.get(name)) {
            return Ok(value.clone());
        }
        self.inputs
            .get(name)
            .and_then(|decl| decl.default.clone())
            .ok_or_else(|| OrchestratorError::UnresolvedInputReference {
                name: name.to_string(),
            })
    }

    /// Resolve a descriptor value into a plain value
    pub fn resolve(&self, value: &DescriptorValue) -> Result<Value> {
        Ok(match value {
            DescriptorValue::Null => Value::Null,
            DescriptorValue::Bool(b) => Value::Bool(*b),
            DescriptorValue::Int(i) => Value::from(*i),
            DescriptorValue::Float(f) => Value::from(*f),
            DescriptorValue::String(s) => Value::String(s.clone()),
            DescriptorValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve(v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            DescriptorValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                    .collect::<Result<serde_json::Map<_, _>>>()?,
            ),
            DescriptorValue::Input(name) => self.lookup(name)?,
        })
    }

    /// Resolve an optional value
    pub fn resolve_opt(&self, value: Option<&DescriptorValue>) -> Result<Option<Value>> {
        value.map(|v| self.resolve(v)).transpose()
    }

    /// Resolve every entry of a map
    pub fn resolve_map(&self, map: &BTreeMap<String, DescriptorValue>) -> Result<BTreeMap<String, Value>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Component, ComputeNode};
    use serde_json::json;

    fn descriptor_with_image_input(default: Option<Value>) -> WorkloadDescriptor {
        let compute = ComputeNode {
            image: Some(DescriptorValue::input("image")),
            ..Default::default()
        };
        WorkloadDescriptor::new("w")
            .with_input("image", default)
            .with_component("VDU1", Component::Compute(compute))
    }

    #[test]
    fn test_from_yaml_mapping() {
        let table = ParameterTable::from_yaml("image: cirros\nflavor: m1.tiny\n").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("image"), Some(&json!("cirros")));
    }

    #[test]
    fn test_from_yaml_rejects_non_mapping() {
        let err = ParameterTable::from_yaml("- a\n- b\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedParameterInput(_)));

        let err = ParameterTable::from_yaml("just a string").unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedParameterInput(_)));

        let err = ParameterTable::from_yaml("key: [unclosed").unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedParameterInput(_)));
    }

    #[test]
    fn test_missing_table_with_placeholders() {
        let descriptor = descriptor_with_image_input(None);
        let err = Substitution::prepare(&descriptor, None).err().unwrap();
        assert!(matches!(err, OrchestratorError::MissingParameter(ref n) if n == "image"));
    }

    #[test]
    fn test_missing_table_without_placeholders_is_fine() {
        let descriptor = WorkloadDescriptor::new("w");
        assert!(Substitution::prepare(&descriptor, None).is_ok());
    }

    #[test]
    fn test_unresolved_reference() {
        let descriptor = descriptor_with_image_input(None);
        let table = ParameterTable::new().with("flavor", "m1.tiny");
        let err = Substitution::prepare(&descriptor, Some(&table)).err().unwrap();
        assert!(matches!(
            err,
            OrchestratorError::UnresolvedInputReference { ref name } if name == "image"
        ));
    }

    #[test]
    fn test_table_wins_over_default() {
        let descriptor = descriptor_with_image_input(Some(json!("fedora")));
        let table = ParameterTable::new().with("image", "cirros");
        let subst = Substitution::prepare(&descriptor, Some(&table)).unwrap();
        let resolved = subst.resolve(&DescriptorValue::input("image")).unwrap();
        assert_eq!(resolved, json!("cirros"));
    }

    #[test]
    fn test_default_used_when_table_lacks_entry() {
        let descriptor = descriptor_with_image_input(Some(json!("fedora")));
        let table = ParameterTable::new();
        let subst = Substitution::prepare(&descriptor, Some(&table)).unwrap();
        let nested = DescriptorValue::List(vec![
            DescriptorValue::input("image"),
            DescriptorValue::from("literal"),
        ]);
        assert_eq!(subst.resolve(&nested).unwrap(), json!(["fedora", "literal"]));
    }
}
