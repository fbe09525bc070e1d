//! Data model shared between the configuration, the policy engine and the
//! HTTP API.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

/// Free-form JSON object used for claims and params.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Scope granted to a variable by the allow query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Internal,
}

/// Per-request mapping from variable name to granted scope.
pub type AllowMap = HashMap<String, Scope>;

/// A variable, either as declared in the configuration (provider + id) or as
/// resolved for a response (string value).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub value: VariableValue,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub export: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redact: Option<bool>,
}

impl Variable {
    /// The variable with its value materialized and the backend reference
    /// cleared.
    pub fn resolve(mut self, value: String) -> Variable {
        self.value = VariableValue {
            string: value,
            provider: String::new(),
            id: String::new(),
        };
        self
    }
}

/// Either a reference to a provider-backed value (`provider` + `id`) or a
/// resolved string. Only the resolved form crosses the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariableValue {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub string: String,
    #[serde(skip)]
    pub provider: String,
    #[serde(skip)]
    pub id: String,
}

impl VariableValue {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        VariableValue {
            string: String::new(),
            provider: provider.into(),
            id: id.into(),
        }
    }
}

impl<'de> Deserialize<'de> for VariableValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = VariableValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar or a single-entry provider mapping")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(VariableValue::new("string", v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(VariableValue::new("string", v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(VariableValue::new("string", v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(VariableValue::new("string", v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(VariableValue::new("string", v.to_string()))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut value = VariableValue::default();
                let mut entries = 0;
                while let Some((provider, id)) = map.next_entry::<String, ScalarString>()? {
                    entries += 1;
                    if entries > 1 {
                        return Err(de::Error::custom(
                            "only one variable provider can be specified",
                        ));
                    }
                    if provider == "string" {
                        // Doubles as the resolved form used on the policy
                        // engine boundary.
                        value = VariableValue {
                            string: id.0.clone(),
                            provider,
                            id: id.0,
                        };
                    } else {
                        value = VariableValue::new(provider, id.0);
                    }
                }
                Ok(value)
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// A YAML scalar coerced to its string rendering.
struct ScalarString(String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ScalarVisitor;

        impl Visitor<'_> for ScalarVisitor {
            type Value = ScalarString;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(ScalarString(String::new()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// Declared variables in configuration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables(pub Vec<Variable>);

impl Variables {
    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.0.iter()
    }
}

/// Full entry form accepted under `variables:`. A bare scalar is shorthand
/// for `{value: {string: <scalar>}}`.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VariableBody {
    #[serde(default)]
    value: VariableValue,
    #[serde(default)]
    export: String,
    #[serde(default)]
    redact: Option<bool>,
}

impl<'de> Deserialize<'de> for Variables {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VariablesVisitor;

        impl<'de> Visitor<'de> for VariablesVisitor {
            type Value = Variables;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of variable names to definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut variables = Vec::new();
                while let Some((name, entry)) = map.next_entry::<String, serde_yaml::Value>()? {
                    let variable = match entry {
                        serde_yaml::Value::Mapping(_) => {
                            let body: VariableBody =
                                serde_yaml::from_value(entry).map_err(de::Error::custom)?;
                            Variable {
                                name,
                                value: body.value,
                                export: body.export,
                                redact: body.redact,
                            }
                        }
                        scalar => {
                            let scalar: ScalarString =
                                serde_yaml::from_value(scalar).map_err(de::Error::custom)?;
                            Variable {
                                name,
                                value: VariableValue::new("string", scalar.0),
                                export: String::new(),
                                redact: None,
                            }
                        }
                    };
                    variables.push(variable);
                }
                Ok(Variables(variables))
            }
        }

        deserializer.deserialize_map(VariablesVisitor)
    }
}

/// One audience or a list of audiences.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StringList(pub Vec<String>);

impl<'de> Deserialize<'de> for StringList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(value) => StringList(vec![value]),
            OneOrMany::Many(values) => StringList(values),
        })
    }
}

/// Body of the unauthenticated metadata route.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub ezoidc: bool,
    pub api_version: String,
}

/// Body of `POST /ezoidc/1.0/variables`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VariablesRequest {
    #[serde(default)]
    pub params: Option<JsonMap>,
}

/// Successful response of the variables route.
#[derive(Debug, Serialize, Deserialize)]
pub struct VariablesResponse {
    pub variables: Vec<Variable>,
}

/// Error envelope returned on any failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
