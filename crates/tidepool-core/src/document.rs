use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Field carrying a document's identity.
pub const ID_FIELD: &str = "_id";

/// A schemaless document as delivered by the server.
///
/// Identity is the JSON value of `_id`, compared structurally.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn id(&self) -> Option<&Value> {
        self.0.get(ID_FIELD)
    }

    pub fn has_id(&self, id: &Value) -> bool {
        self.id() == Some(id)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Shallow merge: every top-level field of `patch` overwrites ours.
    pub fn merge(&mut self, patch: Document) {
        self.0.extend(patch.0);
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Document {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(CoreError::MalformedEvent {
                event: "document".into(),
                reason: format!("expected an object, got {other}"),
            }),
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}
