//! Catalog data model — tools, capabilities, patterns, parameter specs.
//!
//! These types are both the on-disk definition format (YAML) and the rows the
//! registry serves. Regexes are compiled once by `Tool::compile` at load time.

use crate::types::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::time::Duration;

// =============================================================================
// Parameter types
// =============================================================================

/// Parameter type for pattern inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    StringList,
    Enum(Vec<String>),
    Object,
}

impl ParamType {
    /// Validate a JSON value against this parameter type.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        match self {
            ParamType::String => expect(value.is_string(), "string", value),
            ParamType::Integer => expect(value.is_i64() || value.is_u64(), "integer", value),
            ParamType::Number => expect(value.is_number(), "number", value),
            ParamType::Boolean => expect(value.is_boolean(), "boolean", value),
            ParamType::Object => expect(value.is_object(), "object", value),
            ParamType::StringList => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| format!("expected array, got {}", value_type_name(value)))?;
                for (i, item) in arr.iter().enumerate() {
                    if !item.is_string() {
                        return Err(format!(
                            "expected string at index {}, got {}",
                            i,
                            value_type_name(item)
                        ));
                    }
                }
                Ok(())
            }
            ParamType::Enum(variants) => match value.as_str() {
                Some(s) if variants.iter().any(|v| v == s) => Ok(()),
                Some(s) => Err(format!(
                    "invalid enum value '{}', expected one of: {}",
                    s,
                    variants.join(", ")
                )),
                None => Err(format!(
                    "expected string for enum, got {}",
                    value_type_name(value)
                )),
            },
        }
    }

    /// Human-readable type name for prompt generation.
    pub fn display_name(&self) -> String {
        match self {
            ParamType::String => "string".to_string(),
            ParamType::Integer => "integer".to_string(),
            ParamType::Number => "number".to_string(),
            ParamType::Boolean => "boolean".to_string(),
            ParamType::StringList => "string[]".to_string(),
            ParamType::Enum(variants) => format!("enum({})", variants.join("|")),
            ParamType::Object => "object".to_string(),
        }
    }
}

fn expect(ok: bool, wanted: &str, value: &Value) -> std::result::Result<(), String> {
    if ok {
        Ok(())
    } else {
        Err(format!("expected {}, got {}", wanted, value_type_name(value)))
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Parameter spec
// =============================================================================

/// A single input accepted by a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    /// Regex applied to string values (whole value must match).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType, required: bool) -> Self {
        Self {
            name: name.into(),
            param_type,
            required,
            validation: None,
            description: String::new(),
            default: None,
            compiled: None,
        }
    }

    pub fn with_validation(mut self, pattern: impl Into<String>) -> Self {
        self.validation = Some(pattern.into());
        self
    }

    fn compile(&mut self) -> std::result::Result<(), String> {
        if let Some(raw) = &self.validation {
            let anchored = format!("^(?:{})$", raw);
            self.compiled = Some(Regex::new(&anchored).map_err(|e| e.to_string())?);
        }
        Ok(())
    }

    /// Check one value: type first, then the validation regex for strings.
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        self.param_type.validate(value)?;
        if let (Some(re), Some(s)) = (&self.compiled, value.as_str()) {
            if !re.is_match(s) {
                return Err(format!(
                    "value '{}' does not match {}",
                    s,
                    self.validation.as_deref().unwrap_or_default()
                ));
            }
        }
        Ok(())
    }
}

/// Validate params against a set of specs. Returns every violation found.
pub fn validate_params(
    specs: &[ParamSpec],
    params: &Map<String, Value>,
    allow_extra: bool,
) -> Vec<String> {
    let mut errors = Vec::new();

    for spec in specs {
        match params.get(&spec.name) {
            None | Some(Value::Null) if spec.required && spec.default.is_none() => {
                errors.push(format!("Missing required parameter: {}", spec.name));
            }
            None | Some(Value::Null) => {}
            Some(value) => {
                if let Err(e) = spec.check(value) {
                    errors.push(format!("Parameter '{}': {}", spec.name, e));
                }
            }
        }
    }

    if !allow_extra {
        for key in params.keys() {
            if !specs.iter().any(|s| &s.name == key) {
                errors.push(format!("Unknown parameter: {}", key));
            }
        }
    }

    errors
}

/// Fill in default values for missing parameters.
pub fn fill_defaults(specs: &[ParamSpec], params: &mut Map<String, Value>) {
    for spec in specs {
        if !params.contains_key(&spec.name) {
            if let Some(default) = &spec.default {
                params.insert(spec.name.clone(), default.clone());
            }
        }
    }
}

// =============================================================================
// Pattern
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_output_type")]
    pub output_type: String,
    #[serde(default)]
    pub description: String,
}

fn default_output_type() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternExample {
    pub query: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
}

/// Cost/time/complexity estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Estimates {
    pub cost: f64,
    pub time_ms: u64,
    pub complexity: f64,
}

impl Default for Estimates {
    fn default() -> Self {
        Self {
            cost: 1.0,
            time_ms: 1000,
            complexity: 0.5,
        }
    }
}

/// Execution policy attached to a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternPolicy {
    pub max_cost: Option<f64>,
    pub production_safe: bool,
    pub requires_approval: bool,
    #[serde(with = "humantime_serde")]
    pub max_execution_time: Option<Duration>,
}

impl Default for PatternPolicy {
    fn default() -> Self {
        Self {
            max_cost: None,
            production_safe: true,
            requires_approval: false,
            max_execution_time: None,
        }
    }
}

/// Preference profile in `[0, 1]` per axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub cost: f64,
    pub speed: f64,
    pub accuracy: f64,
    pub complexity: f64,
    pub completeness: f64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            cost: 0.5,
            speed: 0.5,
            accuracy: 0.5,
            complexity: 0.5,
            completeness: 0.5,
        }
    }
}

impl Preferences {
    fn axes(&self) -> [(&'static str, f64); 5] {
        [
            ("cost", self.cost),
            ("speed", self.speed),
            ("accuracy", self.accuracy),
            ("complexity", self.complexity),
            ("completeness", self.completeness),
        ]
    }
}

/// A documented usage mode of a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub typical_use_cases: Vec<String>,
    #[serde(default)]
    pub required_inputs: Vec<ParamSpec>,
    #[serde(default)]
    pub expected_outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub examples: Vec<PatternExample>,
    #[serde(default)]
    pub estimates: Estimates,
    #[serde(default)]
    pub policy: PatternPolicy,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub allow_extra_inputs: bool,
}

impl Pattern {
    /// Text that gets embedded for this pattern.
    pub fn embedding_text(&self, tool: &str, capability: &str) -> String {
        let mut text = format!("{} {}: {}", tool, capability, self.description);
        for use_case in &self.typical_use_cases {
            text.push('\n');
            text.push_str(use_case);
        }
        for example in &self.examples {
            text.push('\n');
            text.push_str(&example.query);
        }
        text
    }
}

/// Capability exposed by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

// =============================================================================
// Tool
// =============================================================================

/// How a tool is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMethod {
    /// In-process handler.
    Builtin,
    /// Local process.
    Command,
    /// Long-running job handed to the external scheduler.
    Job,
}

impl ExecutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMethod::Builtin => "builtin",
            ExecutionMethod::Command => "command",
            ExecutionMethod::Job => "job",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolMetadata {
    pub tags: Vec<String>,
    pub requires_admin: bool,
    pub idempotent: bool,
    /// Needs credentials for the target host.
    pub requires_auth: bool,
    /// Credential purpose to request (`ssh`, `winrm`, ...). Falls back to the
    /// asset's connection protocol.
    pub credential_purpose: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_platform() -> String {
    "any".to_string()
}

/// A named, versioned, executable capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub version: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub execution_method: ExecutionMethod,
    /// Builtin handler name, program path, or job type.
    pub entrypoint: String,
    /// Argument templates for command tools; `{param}` is substituted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub metadata: ToolMetadata,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Assigned by the store, never read from definitions.
    #[serde(default, skip_deserializing)]
    pub is_latest: bool,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl Tool {
    /// Validate the definition and compile regexes. Errors name the field.
    pub fn compile(&mut self, origin: &str) -> Result<()> {
        let bad = |field: String, msg: String| Error::definition(origin, field, msg);

        if self.name.trim().is_empty() {
            return Err(bad("name".into(), "cannot be empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(bad("name".into(), format!("invalid characters in '{}'", self.name)));
        }
        if self.version.trim().is_empty() {
            return Err(bad("version".into(), "cannot be empty".into()));
        }
        if self.category.trim().is_empty() {
            return Err(bad("category".into(), "cannot be empty".into()));
        }
        if self.entrypoint.trim().is_empty() {
            return Err(bad("entrypoint".into(), "cannot be empty".into()));
        }
        if self.capabilities.is_empty() {
            return Err(bad("capabilities".into(), "at least one capability required".into()));
        }

        for (ci, cap) in self.capabilities.iter_mut().enumerate() {
            if cap.name.trim().is_empty() {
                return Err(bad(format!("capabilities[{}].name", ci), "cannot be empty".into()));
            }
            if cap.patterns.is_empty() {
                return Err(bad(
                    format!("capabilities[{}].patterns", ci),
                    "at least one pattern required".into(),
                ));
            }
            for (pi, pattern) in cap.patterns.iter_mut().enumerate() {
                let at = format!("capabilities[{}].patterns[{}]", ci, pi);
                if pattern.name.trim().is_empty() {
                    return Err(bad(format!("{}.name", at), "cannot be empty".into()));
                }
                if pattern.description.trim().is_empty() {
                    return Err(bad(format!("{}.description", at), "cannot be empty".into()));
                }
                for (name, weight) in pattern.preferences.axes() {
                    if !(0.0..=1.0).contains(&weight) {
                        return Err(bad(
                            format!("{}.preferences.{}", at, name),
                            format!("{} outside [0, 1]", weight),
                        ));
                    }
                }
                for (ii, input) in pattern.required_inputs.iter_mut().enumerate() {
                    let field = format!("{}.required_inputs[{}]", at, ii);
                    if input.name.trim().is_empty() {
                        return Err(bad(format!("{}.name", field), "cannot be empty".into()));
                    }
                    input
                        .compile()
                        .map_err(|e| bad(format!("{}.validation", field), e))?;
                    if let Some(default) = &input.default {
                        input
                            .param_type
                            .validate(default)
                            .map_err(|e| bad(format!("{}.default", field), e))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Find a pattern by name, or the first pattern when `name` is None.
    pub fn pattern(&self, name: Option<&str>) -> Option<(&Capability, &Pattern)> {
        self.capabilities.iter().find_map(|cap| {
            cap.patterns
                .iter()
                .find(|p| name.map_or(true, |n| p.name == n))
                .map(|p| (cap, p))
        })
    }

    /// Fingerprint of everything a definition controls (used for diffing).
    pub fn fingerprint(&self) -> String {
        let mut copy = self.clone();
        copy.is_latest = false;
        let encoded = serde_json::to_vec(&copy).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Render as a prompt line: `- name(param: type, opt?: type): description`.
    pub fn to_prompt_line(&self) -> String {
        let params: Vec<String> = self
            .pattern(None)
            .map(|(_, p)| {
                p.required_inputs
                    .iter()
                    .map(|spec| {
                        let optional = if spec.required { "" } else { "?" };
                        format!("{}{}: {}", spec.name, optional, spec.param_type.display_name())
                    })
                    .collect()
            })
            .unwrap_or_default();

        format!("- {}({}): {}", self.name, params.join(", "), self.description)
    }
}

// =============================================================================
// Embedding
// =============================================================================

/// Vector for a pattern's text. `content_hash` is the hash of the text it
/// was computed from; a mismatch with the pattern's current hash means stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub pattern_key: String,
    pub model: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub indexed_at: DateTime<Utc>,
}

/// Embeddable text of one pattern, as the indexer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternText {
    pub pattern_key: String,
    pub text: String,
    pub content_hash: String,
}

/// Stable key for a pattern: `tool/capability/pattern`.
pub fn pattern_key(tool: &str, capability: &str, pattern: &str) -> String {
    format!("{}/{}/{}", tool, capability, pattern)
}

/// SHA-256 hex of the embeddable text.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Compare dotted versions numerically per segment, lexically as fallback.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.trim_start_matches('v')
            .split(|c| c == '.' || c == '-')
            .map(str::to_string)
            .collect()
    };
    let (left, right) = (split(a), split(b));
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).map(String::as_str).unwrap_or("0");
        let r = right.get(i).map(String::as_str).unwrap_or("0");
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
