use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("failed to parse '{key}' option: {message}")]
    ParseError { key: String, message: String },
}

impl OptionError {
    fn parse(key: &str, message: impl Into<String>) -> Self {
        OptionError::ParseError {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// A parsed, validated option value. Kept as plain data (not closures) so
/// recorded mutator sequences are serializable and inspectable.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    StringSet(BTreeSet<String>),
    /// Recognized pass-through options the core does not interpret.
    Opaque(Value),
}

/// Installs one parsed option into a [`StreamOptions`] bag. The sequence of
/// mutators applied to a bag is recorded so it can be replayed onto a fresh
/// bag when a sink stream is recreated.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutator {
    SetScalar {
        key: &'static str,
        value: OptionValue,
    },
    /// Set-union semantics; an empty `values` list is a no-op.
    AddToSet {
        key: &'static str,
        values: Vec<String>,
    },
}

impl Mutator {
    pub fn key(&self) -> &'static str {
        match self {
            Mutator::SetScalar { key, .. } => key,
            Mutator::AddToSet { key, .. } => key,
        }
    }

    fn apply(&self, values: &mut HashMap<&'static str, OptionValue>) {
        match self {
            Mutator::SetScalar { key, value } => {
                values.insert(key, value.clone());
            }
            Mutator::AddToSet { key, values: add } => {
                if add.is_empty() {
                    return;
                }
                let entry = values
                    .entry(key)
                    .or_insert_with(|| OptionValue::StringSet(BTreeSet::new()));
                if let OptionValue::StringSet(set) = entry {
                    set.extend(add.iter().cloned());
                } else {
                    *entry = OptionValue::StringSet(add.iter().cloned().collect());
                }
            }
        }
    }
}

/// Parsed destination options. Values are written only through mutators;
/// reads go through the typed option handles below.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    values: HashMap<&'static str, OptionValue>,
    mutators: Vec<Mutator>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mutator: Mutator) {
        mutator.apply(&mut self.values);
        self.mutators.push(mutator);
    }

    /// The recorded mutator sequence, in application order.
    pub fn mutators(&self) -> &[Mutator] {
        &self.mutators
    }

    /// Builds a fresh bag by replaying a recorded mutator sequence.
    pub fn replay(mutators: &[Mutator]) -> Self {
        let mut options = Self::new();
        for mutator in mutators {
            options.add(mutator.clone());
        }
        options
    }

    fn value(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }
}

/// Consumer class selected by the `mode` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    Stream,
    Batch,
    Unknown,
}

impl BulkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkMode::Stream => "stream",
            BulkMode::Batch => "batch",
            BulkMode::Unknown => "unknown",
        }
    }

    fn from_tag(tag: &str) -> Self {
        match tag {
            "stream" => BulkMode::Stream,
            "batch" => BulkMode::Batch,
            _ => BulkMode::Unknown,
        }
    }
}

pub struct IntOption {
    pub key: &'static str,
    pub default: i64,
}

impl IntOption {
    pub fn get(&self, options: &StreamOptions) -> i64 {
        match options.value(self.key) {
            Some(OptionValue::Int(v)) => *v,
            _ => self.default,
        }
    }
}

pub struct FloatOption {
    pub key: &'static str,
    pub default: f64,
}

impl FloatOption {
    pub fn get(&self, options: &StreamOptions) -> f64 {
        match options.value(self.key) {
            Some(OptionValue::Float(v)) => *v,
            Some(OptionValue::Int(v)) => *v as f64,
            _ => self.default,
        }
    }
}

pub struct BoolOption {
    pub key: &'static str,
    pub default: bool,
}

impl BoolOption {
    pub fn get(&self, options: &StreamOptions) -> bool {
        match options.value(self.key) {
            Some(OptionValue::Bool(v)) => *v,
            _ => self.default,
        }
    }
}

pub struct StringOption {
    pub key: &'static str,
}

impl StringOption {
    pub fn get(&self, options: &StreamOptions) -> String {
        match options.value(self.key) {
            Some(OptionValue::String(v)) => v.clone(),
            _ => String::new(),
        }
    }
}

pub struct SetOption {
    pub key: &'static str,
}

impl SetOption {
    pub fn get(&self, options: &StreamOptions) -> BTreeSet<String> {
        match options.value(self.key) {
            Some(OptionValue::StringSet(v)) => v.clone(),
            _ => BTreeSet::new(),
        }
    }
}

pub struct ModeOption {
    pub key: &'static str,
}

impl ModeOption {
    pub fn get(&self, options: &StreamOptions) -> BulkMode {
        match options.value(self.key) {
            Some(OptionValue::String(v)) => BulkMode::from_tag(v),
            _ => BulkMode::Unknown,
        }
    }
}

pub const MODE_OPTION: ModeOption = ModeOption { key: "mode" };
pub const BATCH_SIZE_OPTION: IntOption = IntOption {
    key: "batchSize",
    default: 0,
};
/// Batch cadence in minutes.
pub const BATCH_FREQUENCY_OPTION: FloatOption = FloatOption {
    key: "frequency",
    default: 0.0,
};
pub const RETRY_BATCH_SIZE_OPTION: IntOption = IntOption {
    key: "retryBatchSize",
    default: 0,
};
/// Retry consumer cadence in minutes.
pub const RETRY_FREQUENCY_OPTION: FloatOption = FloatOption {
    key: "retryFrequency",
    default: 0.0,
};
pub const PRIMARY_KEY_OPTION: SetOption = SetOption { key: "primaryKey" };
pub const DEDUPLICATE_OPTION: BoolOption = BoolOption {
    key: "deduplicate",
    default: false,
};
pub const PARTITION_ID_OPTION: StringOption = StringOption { key: "partitionId" };
/// Field carrying the event timestamp, used by sinks for sorting keys or
/// table partitioning.
pub const TIMESTAMP_COLUMN_OPTION: StringOption = StringOption {
    key: "timestampColumn",
};

type SimpleParse = fn(&'static str, &Value) -> Result<OptionValue, OptionError>;
type AdvancedParse = fn(&'static str, &Value) -> Result<Mutator, OptionError>;

enum Parser {
    Simple(SimpleParse),
    /// For options whose parse result depends on the current bag state,
    /// e.g. set-union accumulation.
    Advanced(AdvancedParse),
}

/// Immutable option registry. Built once at startup; parsing an unregistered
/// key is an error.
pub struct Registry {
    parsers: HashMap<&'static str, Parser>,
}

pub struct RegistryBuilder {
    parsers: HashMap<&'static str, Parser>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Last registration for a key wins; bootstrap-only usage.
    pub fn register(mut self, key: &'static str, parse: SimpleParse) -> Self {
        self.parsers.insert(key, Parser::Simple(parse));
        self
    }

    pub fn register_advanced(mut self, key: &'static str, parse: AdvancedParse) -> Self {
        self.parsers.insert(key, Parser::Advanced(parse));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            parsers: self.parsers,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The process-wide registry holding every known option.
    pub fn global() -> &'static Registry {
        GLOBAL_REGISTRY.get_or_init(default_registry)
    }

    pub fn parse(&self, name: &str, raw: &Value) -> Result<Mutator, OptionError> {
        let (key, parser) = self
            .parsers
            .get_key_value(name)
            .ok_or_else(|| OptionError::UnknownOption(name.to_string()))?;
        let key = *key;
        match parser {
            Parser::Simple(parse) => Ok(Mutator::SetScalar {
                key,
                value: parse(key, raw)?,
            }),
            Parser::Advanced(parse) => parse(key, raw),
        }
    }
}

fn default_registry() -> Registry {
    RegistryBuilder::new()
        .register("mode", parse_mode)
        .register("batchSize", parse_int)
        .register("frequency", parse_float)
        .register("retryBatchSize", parse_int)
        .register("retryFrequency", parse_float)
        .register_advanced("primaryKey", parse_primary_key)
        .register("deduplicate", parse_bool)
        .register("partitionId", parse_string)
        .register("timestampColumn", parse_string)
        // Recognized but opaque to the consumer runtime.
        .register("functions", parse_opaque)
        .register("streams", parse_opaque)
        .register("dataLayout", parse_string)
        .register("events", parse_string)
        .register("hosts", parse_string)
        .build()
}

fn parse_int(key: &'static str, raw: &Value) -> Result<OptionValue, OptionError> {
    match raw {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(OptionValue::Int(v))
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    Ok(OptionValue::Int(f as i64))
                } else {
                    Err(OptionError::parse(key, format!("{f} is not an integer")))
                }
            } else {
                Err(OptionError::parse(key, format!("{n} is out of range")))
            }
        }
        Value::String(s) => s
            .parse::<i64>()
            .map(OptionValue::Int)
            .map_err(|e| OptionError::parse(key, e.to_string())),
        other => Err(OptionError::parse(
            key,
            format!("expected integer, got {other}"),
        )),
    }
}

fn parse_float(key: &'static str, raw: &Value) -> Result<OptionValue, OptionError> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .map(OptionValue::Float)
            .ok_or_else(|| OptionError::parse(key, format!("{n} is out of range"))),
        Value::String(s) => s
            .parse::<f64>()
            .map(OptionValue::Float)
            .map_err(|e| OptionError::parse(key, e.to_string())),
        other => Err(OptionError::parse(
            key,
            format!("expected number, got {other}"),
        )),
    }
}

fn parse_bool(key: &'static str, raw: &Value) -> Result<OptionValue, OptionError> {
    match raw {
        Value::Bool(b) => Ok(OptionValue::Bool(*b)),
        Value::String(s) => s
            .parse::<bool>()
            .map(OptionValue::Bool)
            .map_err(|e| OptionError::parse(key, e.to_string())),
        other => Err(OptionError::parse(
            key,
            format!("expected boolean, got {other}"),
        )),
    }
}

fn parse_string(key: &'static str, raw: &Value) -> Result<OptionValue, OptionError> {
    match raw {
        Value::String(s) => Ok(OptionValue::String(s.clone())),
        other => Err(OptionError::parse(
            key,
            format!("expected string, got {other}"),
        )),
    }
}

fn parse_opaque(_key: &'static str, raw: &Value) -> Result<OptionValue, OptionError> {
    Ok(OptionValue::Opaque(raw.clone()))
}

fn parse_mode(key: &'static str, raw: &Value) -> Result<OptionValue, OptionError> {
    match raw {
        Value::String(s) => Ok(OptionValue::String(
            BulkMode::from_tag(s).as_str().to_string(),
        )),
        other => Err(OptionError::parse(
            key,
            format!("invalid value type of mode option: {other}"),
        )),
    }
}

fn parse_primary_key(key: &'static str, raw: &Value) -> Result<Mutator, OptionError> {
    match raw {
        Value::String(s) if s.is_empty() => Ok(Mutator::AddToSet {
            key,
            values: Vec::new(),
        }),
        Value::String(s) => Ok(Mutator::AddToSet {
            key,
            values: vec![s.clone()],
        }),
        Value::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => values.push(s.clone()),
                    other => {
                        return Err(OptionError::parse(
                            key,
                            format!("expected string or string array, got element {other}"),
                        ))
                    }
                }
            }
            Ok(Mutator::AddToSet { key, values })
        }
        other => Err(OptionError::parse(
            key,
            format!("expected string or string array, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(name: &str, raw: Value) -> Mutator {
        Registry::global().parse(name, &raw).unwrap()
    }

    #[test]
    fn scalar_options_roundtrip() {
        let mut options = StreamOptions::new();
        options.add(parse("batchSize", json!(500)));
        options.add(parse("frequency", json!(2.5)));
        options.add(parse("deduplicate", json!(true)));
        options.add(parse("partitionId", json!("p-2024-01")));
        options.add(parse("timestampColumn", json!("_timestamp")));

        assert_eq!(BATCH_SIZE_OPTION.get(&options), 500);
        assert_eq!(BATCH_FREQUENCY_OPTION.get(&options), 2.5);
        assert!(DEDUPLICATE_OPTION.get(&options));
        assert_eq!(PARTITION_ID_OPTION.get(&options), "p-2024-01");
        assert_eq!(TIMESTAMP_COLUMN_OPTION.get(&options), "_timestamp");
    }

    #[test]
    fn unset_options_return_defaults() {
        let options = StreamOptions::new();
        assert_eq!(BATCH_SIZE_OPTION.get(&options), 0);
        assert_eq!(RETRY_FREQUENCY_OPTION.get(&options), 0.0);
        assert!(!DEDUPLICATE_OPTION.get(&options));
        assert!(PRIMARY_KEY_OPTION.get(&options).is_empty());
        assert_eq!(MODE_OPTION.get(&options), BulkMode::Unknown);
    }

    #[test]
    fn numeric_options_accept_strings() {
        let mut options = StreamOptions::new();
        options.add(parse("batchSize", json!("10000")));
        options.add(parse("retryFrequency", json!("15")));
        assert_eq!(BATCH_SIZE_OPTION.get(&options), 10000);
        assert_eq!(RETRY_FREQUENCY_OPTION.get(&options), 15.0);
    }

    #[test]
    fn mode_parses_known_and_unknown_tags() {
        let mut options = StreamOptions::new();
        options.add(parse("mode", json!("stream")));
        assert_eq!(MODE_OPTION.get(&options), BulkMode::Stream);

        options.add(parse("mode", json!("batch")));
        assert_eq!(MODE_OPTION.get(&options), BulkMode::Batch);

        options.add(parse("mode", json!("firehose")));
        assert_eq!(MODE_OPTION.get(&options), BulkMode::Unknown);

        let err = Registry::global().parse("mode", &json!(42)).unwrap_err();
        assert!(matches!(err, OptionError::ParseError { .. }));
    }

    #[test]
    fn primary_key_accumulates_as_set() {
        let mut options = StreamOptions::new();
        options.add(parse("primaryKey", json!(["a", "b"])));
        options.add(parse("primaryKey", json!("c")));
        options.add(parse("primaryKey", json!("b")));

        let set = PRIMARY_KEY_OPTION.get(&options);
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn empty_primary_key_is_a_noop() {
        let mutator = parse("primaryKey", json!(""));
        assert_eq!(
            mutator,
            Mutator::AddToSet {
                key: "primaryKey",
                values: vec![]
            }
        );
        let mut options = StreamOptions::new();
        options.add(mutator);
        assert!(PRIMARY_KEY_OPTION.get(&options).is_empty());
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = Registry::global()
            .parse("compression", &json!("zstd"))
            .unwrap_err();
        assert!(matches!(err, OptionError::UnknownOption(name) if name == "compression"));
    }

    #[test]
    fn pass_through_options_are_recognized() {
        let mut options = StreamOptions::new();
        options.add(parse("functions", json!([{"name": "enrich"}])));
        options.add(parse("streams", json!(["site"])));
        options.add(parse("dataLayout", json!("segment-single-table")));
        options.add(parse("events", json!("page,track")));
        options.add(parse("hosts", json!("*")));
        assert_eq!(options.mutators().len(), 5);
    }

    #[test]
    fn replay_reproduces_the_value_map() {
        let mut options = StreamOptions::new();
        options.add(parse("mode", json!("batch")));
        options.add(parse("batchSize", json!(1000)));
        options.add(parse("primaryKey", json!(["id"])));
        options.add(parse("primaryKey", json!("email")));

        let replayed = StreamOptions::replay(options.mutators());
        assert_eq!(MODE_OPTION.get(&replayed), BulkMode::Batch);
        assert_eq!(BATCH_SIZE_OPTION.get(&replayed), 1000);
        assert_eq!(
            PRIMARY_KEY_OPTION.get(&replayed),
            PRIMARY_KEY_OPTION.get(&options)
        );
        assert_eq!(replayed.mutators(), options.mutators());
    }
}
