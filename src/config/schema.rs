//! Per-section validation schemas.
//!
//! A [`SectionSchema`] lists field rules checked on every `set` and on
//! `import_json`. Violations are collected into a [`ValidationReport`]
//! rather than failing fast, so a rejected mutation names *everything*
//! wrong with it.

use serde_json::Value;

/// Expected JSON shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Str,
    Object,
    Array,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Bool => value.is_boolean(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Str => value.is_string(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// One rule: a dotted path inside the section, its type, whether it must
/// be present, and an optional numeric range.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub path: String,
    pub field_type: FieldType,
    pub required: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl FieldRule {
    pub fn new(path: &str, field_type: FieldType) -> Self {
        Self {
            path: path.to_string(),
            field_type,
            required: false,
            min: None,
            max: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

/// Validation rules for one configuration section.
#[derive(Debug, Clone, Default)]
pub struct SectionSchema {
    pub fields: Vec<FieldRule>,
}

impl SectionSchema {
    pub fn new(fields: Vec<FieldRule>) -> Self {
        Self { fields }
    }

    /// Check `doc` (the section root) against every rule.
    pub fn validate(&self, doc: &Value) -> ValidationReport {
        let mut errors = Vec::new();
        for rule in &self.fields {
            match lookup(doc, &rule.path) {
                None => {
                    if rule.required {
                        errors.push(format!("missing required field '{}'", rule.path));
                    }
                }
                Some(value) => {
                    if !rule.field_type.accepts(value) {
                        errors.push(format!(
                            "field '{}' has wrong type (expected {:?})",
                            rule.path, rule.field_type
                        ));
                        continue;
                    }
                    if let Some(n) = value.as_f64() {
                        if let Some(min) = rule.min {
                            if n < min {
                                errors.push(format!("field '{}' below minimum {min}", rule.path));
                            }
                        }
                        if let Some(max) = rule.max {
                            if n > max {
                                errors.push(format!("field '{}' above maximum {max}", rule.path));
                            }
                        }
                    }
                }
            }
        }
        ValidationReport { errors }
    }
}

/// Resolve a dotted path inside a JSON tree.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Outcome of a schema check. Empty `errors` means the mutation passes.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Single-line summary for error messages.
    pub fn summary(&self) -> String {
        self.errors.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn climate_schema() -> SectionSchema {
        SectionSchema::new(vec![
            FieldRule::new("setpoint", FieldType::Float)
                .required()
                .range(-40.0, 60.0),
            FieldRule::new("hysteresis", FieldType::Float).range(0.1, 10.0),
            FieldRule::new("mode", FieldType::Str),
        ])
    }

    #[test]
    fn valid_document_passes() {
        let report = climate_schema().validate(&json!({
            "setpoint": -18.5,
            "hysteresis": 0.5,
            "mode": "freeze",
        }));
        assert!(report.is_ok());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let report = climate_schema().validate(&json!({ "hysteresis": 0.5 }));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("setpoint"));
    }

    #[test]
    fn range_and_type_violations_accumulate() {
        let report = climate_schema().validate(&json!({
            "setpoint": -80.0,
            "hysteresis": "wide",
        }));
        assert_eq!(report.errors.len(), 2);
        assert!(!report.is_ok());
    }

    #[test]
    fn nested_paths_resolve() {
        let schema = SectionSchema::new(vec![
            FieldRule::new("defrost.period_min", FieldType::Int)
                .required()
                .range(30.0, 1440.0),
        ]);
        assert!(
            schema
                .validate(&json!({ "defrost": { "period_min": 360 } }))
                .is_ok()
        );
        assert!(!schema.validate(&json!({ "defrost": {} })).is_ok());
    }
}
