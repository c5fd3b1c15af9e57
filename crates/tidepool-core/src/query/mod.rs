// ── Query descriptors ──
//
// A query is an ordered list of method calls sent to the server as-is.
// Two descriptors are the same query exactly when their canonical JSON
// strings are equal; that string is also the dedup key for live queries.

mod methods;

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use methods::QueryMethod;

/// Errors raised while building or validating a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unknown query method '{0}'")]
    UnknownMethod(String),

    #[error("{method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("count and sort must not be used in the same live query")]
    CountWithSort,
}

/// One call in a query chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Result shape a query produces, chosen from its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum QueryShape {
    List,
    FindOne,
    Count,
    Distinct,
}

/// Method name → recorded argument (or `true`) for every call in a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MethodClassification(BTreeMap<String, Value>);

impl MethodClassification {
    fn record(&mut self, method: QueryMethod, args: &[Value]) {
        let value = if method.records_argument() {
            args.first().cloned().unwrap_or(Value::Bool(true))
        } else {
            Value::Bool(true)
        };
        self.0.insert(method.to_string(), value);
    }

    pub fn has(&self, method: QueryMethod) -> bool {
        self.0.contains_key(method.as_ref())
    }

    pub fn get(&self, method: QueryMethod) -> Option<&Value> {
        self.0.get(method.as_ref())
    }

    /// Result shape. `count` wins over `distinct`, which wins over `findOne`.
    pub fn shape(&self) -> QueryShape {
        if self.has(QueryMethod::Count) {
            QueryShape::Count
        } else if self.has(QueryMethod::Distinct) {
            QueryShape::Distinct
        } else if self.has(QueryMethod::FindOne) {
            QueryShape::FindOne
        } else {
            QueryShape::List
        }
    }

    /// Window size declared with `limit`, if any.
    pub fn limit(&self) -> Option<usize> {
        self.get(QueryMethod::Limit)
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
    }

    /// Rules that only apply to queries executed live.
    pub fn check_live(&self) -> Result<(), QueryError> {
        if self.has(QueryMethod::Count) && self.has(QueryMethod::Sort) {
            return Err(QueryError::CountWithSort);
        }
        Ok(())
    }
}

/// A validated query: ordered calls plus their classification.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryDescriptor {
    calls: Vec<QueryCall>,
    classification: MethodClassification,
}

impl QueryDescriptor {
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    /// Build from raw calls, validating each one in order.
    pub fn from_calls(calls: Vec<QueryCall>) -> Result<Self, QueryError> {
        let mut descriptor = Self::default();
        for call in calls {
            descriptor.push(call)?;
        }
        Ok(descriptor)
    }

    /// Parse the JSON wire form: an array of `{"method", "args"}` objects.
    pub fn from_json(value: Value) -> Result<Self, QueryError> {
        let calls: Vec<QueryCall> =
            serde_json::from_value(value).map_err(|e| QueryError::InvalidArguments {
                method: "query".into(),
                reason: e.to_string(),
            })?;
        Self::from_calls(calls)
    }

    fn push(&mut self, call: QueryCall) -> Result<(), QueryError> {
        let method = QueryMethod::from_str(&call.method)
            .map_err(|_| QueryError::UnknownMethod(call.method.clone()))?;
        method.validate(&call.args)?;
        self.classification.record(method, &call.args);
        self.calls.push(call);
        Ok(())
    }

    pub fn calls(&self) -> &[QueryCall] {
        &self.calls
    }

    pub fn classification(&self) -> &MethodClassification {
        &self.classification
    }

    pub fn shape(&self) -> QueryShape {
        self.classification.shape()
    }

    /// The value sent as the descriptor argument of remote calls.
    pub fn to_wire(&self) -> Value {
        Value::Array(
            self.calls
                .iter()
                .map(|call| {
                    serde_json::json!({ "method": call.method, "args": call.args })
                })
                .collect(),
        )
    }

    /// Stable serialization used as the dedup key.
    pub fn canonical(&self) -> String {
        self.to_wire().to_string()
    }
}

/// Chainable builder. The first invalid call is kept and reported by
/// [`build`](Self::build); later calls are ignored.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    descriptor: QueryDescriptor,
    error: Option<QueryError>,
}

impl QueryBuilder {
    /// Append an arbitrary call.
    #[must_use]
    pub fn call(mut self, method: QueryMethod, args: Vec<Value>) -> Self {
        if self.error.is_none() {
            let call = QueryCall {
                method: method.to_string(),
                args,
            };
            if let Err(e) = self.descriptor.push(call) {
                self.error = Some(e);
            }
        }
        self
    }

    #[must_use]
    pub fn find(self, conditions: Value) -> Self {
        self.call(QueryMethod::Find, vec![conditions])
    }

    #[must_use]
    pub fn find_one(self, conditions: Value) -> Self {
        self.call(QueryMethod::FindOne, vec![conditions])
    }

    /// `where(path)` or `where(path, value)`.
    #[must_use]
    pub fn where_(self, path: impl Into<String>, value: Option<Value>) -> Self {
        let mut args = vec![Value::String(path.into())];
        args.extend(value);
        self.call(QueryMethod::Where, args)
    }

    #[must_use]
    pub fn sort(self, spec: impl Into<String>) -> Self {
        self.call(QueryMethod::Sort, vec![Value::String(spec.into())])
    }

    #[must_use]
    pub fn limit(self, n: u64) -> Self {
        self.call(QueryMethod::Limit, vec![Value::from(n)])
    }

    #[must_use]
    pub fn skip(self, n: u64) -> Self {
        self.call(QueryMethod::Skip, vec![Value::from(n)])
    }

    #[must_use]
    pub fn count(self) -> Self {
        self.call(QueryMethod::Count, Vec::new())
    }

    #[must_use]
    pub fn distinct(self, field: impl Into<String>) -> Self {
        self.call(QueryMethod::Distinct, vec![Value::String(field.into())])
    }

    #[must_use]
    pub fn select(self, fields: impl Into<String>) -> Self {
        self.call(QueryMethod::Select, vec![Value::String(fields.into())])
    }

    #[must_use]
    pub fn populate(self, path: impl Into<String>) -> Self {
        self.call(QueryMethod::Populate, vec![Value::String(path.into())])
    }

    pub fn build(self) -> Result<QueryDescriptor, QueryError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.descriptor),
        }
    }
}
