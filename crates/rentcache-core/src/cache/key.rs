//! Query identity: topic, scope and the key combining them.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named entity category. Scopes both cache keys and push subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(Cow<'static, str>);

impl Topic {
    pub const TENANTS: Topic = Topic(Cow::Borrowed("tenants"));
    pub const COLLECTIONS: Topic = Topic(Cow::Borrowed("collections"));
    pub const PROFILES: Topic = Topic(Cow::Borrowed("profiles"));

    pub fn new(name: impl Into<String>) -> Self {
        Topic(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::new(name)
    }
}

/// Optional narrowing of a topic, e.g. "only rows where agent_id = X".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Scope {
    #[default]
    All,
    Eq { column: String, value: String },
}

impl Scope {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Scope::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a changed `record` belongs to the rows this scope selects.
    ///
    /// A record that does not carry the scoped column matches, since the
    /// change cannot be ruled out.
    pub fn matches_record(&self, record: &Value) -> bool {
        match self {
            Scope::All => true,
            Scope::Eq { column, value } => match record.get(column) {
                Some(field) => field_as_string(field) == *value,
                None => true,
            },
        }
    }

    /// Whether a change delivered on a subscription with scope `source` may
    /// affect entries cached under `self`.
    pub fn affected_by(&self, source: &Scope, record: Option<&Value>) -> bool {
        if let Some(record) = record {
            if !self.matches_record(record) {
                return false;
            }
        }
        match (self, source) {
            (Scope::All, _) | (_, Scope::All) => true,
            (
                Scope::Eq { column, value },
                Scope::Eq {
                    column: source_column,
                    value: source_value,
                },
            ) => column != source_column || value == source_value,
        }
    }

    /// PostgREST-style filter fragment, `None` for `All`.
    pub fn to_query_param(&self) -> Option<(String, String)> {
        match self {
            Scope::All => None,
            Scope::Eq { column, value } => Some((column.clone(), format!("eq.{}", value))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("*"),
            Scope::Eq { column, value } => write!(f, "{}={}", column, value),
        }
    }
}

pub(crate) fn field_as_string(field: &Value) -> String {
    match field {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Identity of one cached query: a topic plus its scoping parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub topic: Topic,
    pub scope: Scope,
}

impl QueryKey {
    pub fn new(topic: Topic, scope: Scope) -> Self {
        Self { topic, scope }
    }

    pub fn all(topic: Topic) -> Self {
        Self::new(topic, Scope::All)
    }

    pub fn scoped(topic: Topic, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(topic, Scope::eq(column, value))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::All => write!(f, "{}", self.topic),
            ref scope => write!(f, "{}[{}]", self.topic, scope),
        }
    }
}
