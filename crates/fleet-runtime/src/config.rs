use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),
    #[error("missing required configuration key `{0}`")]
    MissingRequired(String),
    #[error("configuration key `{key}` expects {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("configuration key `{key}` must be one of {allowed:?}")]
    NotInEnum { key: String, allowed: Vec<String> },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigValueType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
}

impl ConfigValueType {
    fn label(&self) -> &'static str {
        match self {
            ConfigValueType::String => "a string",
            ConfigValueType::Integer => "an integer",
            ConfigValueType::Number => "a number",
            ConfigValueType::Boolean => "a boolean",
            ConfigValueType::Array => "an array",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ConfigValueType::String => value.is_string(),
            ConfigValueType::Integer => value.is_i64() || value.is_u64(),
            ConfigValueType::Number => value.is_number(),
            ConfigValueType::Boolean => value.is_boolean(),
            ConfigValueType::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigFormat {
    #[default]
    Default,
    Password,
}

/// One declared configuration key of a catalog entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigKeySchema {
    pub key: String,
    pub value_type: ConfigValueType,
    #[serde(default)]
    pub format: ConfigFormat,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ConfigKeySchema {
    pub fn new(key: impl Into<String>, value_type: ConfigValueType) -> Self {
        Self {
            key: key.into(),
            value_type,
            format: ConfigFormat::Default,
            required: false,
            default_value: None,
            enum_values: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn password(mut self) -> Self {
        self.format = ConfigFormat::Password;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_secret(&self) -> bool {
        self.format == ConfigFormat::Password
    }

    pub fn validate(&self, value: &Value) -> Result<(), ConfigError> {
        if !self.value_type.accepts(value) {
            return Err(ConfigError::TypeMismatch {
                key: self.key.clone(),
                expected: self.value_type.label(),
            });
        }
        if let (Some(allowed), Some(candidate)) = (&self.enum_values, value.as_str()) {
            if !allowed.iter().any(|entry| entry == candidate) {
                return Err(ConfigError::NotInEnum {
                    key: self.key.clone(),
                    allowed: allowed.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_keys_reject_floats_and_strings() {
        let schema = ConfigKeySchema::new("PERIOD", ConfigValueType::Integer);
        assert!(schema.validate(&json!(15)).is_ok());
        assert_eq!(
            schema.validate(&json!(1.5)),
            Err(ConfigError::TypeMismatch {
                key: "PERIOD".into(),
                expected: "an integer"
            })
        );
        assert!(schema.validate(&json!("15")).is_err());
    }

    #[test]
    fn schema_deserializes_with_defaults() {
        let schema: ConfigKeySchema =
            serde_json::from_value(json!({"key": "TOKEN", "value_type": "STRING", "format": "PASSWORD"}))
                .expect("schema");
        assert!(schema.is_secret());
        assert!(!schema.required);
        assert!(schema.enum_values.is_none());
    }
}
