// ── Materialized live-query result ──
//
// The four result shapes and the fold that applies one server mutation
// to them. Shape is chosen once from the query classification; every
// mutation dispatches on it.

use serde::Serialize;
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::debug;

use crate::document::Document;
use crate::error::CoreError;
use crate::query::QueryShape;

/// Server-pushed mutation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum MutationKind {
    Add,
    Update,
    Remove,
    DistinctSync,
}

/// One mutation addressed to a live query, as received.
///
/// `payload` is the document (`add`/`update`), the identifier (`remove`)
/// or the `{add, remove}` object (`distinctSync`). `hint` is the
/// positional argument, `Null` when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub payload: Value,
    pub hint: Value,
}

impl Mutation {
    pub fn add(doc: Value, index: impl Into<Value>) -> Self {
        Self {
            kind: MutationKind::Add,
            payload: doc,
            hint: index.into(),
        }
    }

    pub fn update(doc: Value, hint: impl Into<Value>) -> Self {
        Self {
            kind: MutationKind::Update,
            payload: doc,
            hint: hint.into(),
        }
    }

    pub fn remove(id: Value) -> Self {
        Self {
            kind: MutationKind::Remove,
            payload: id,
            hint: Value::Null,
        }
    }

    pub fn distinct_sync(add: Vec<Value>, remove: Vec<Value>) -> Self {
        Self {
            kind: MutationKind::DistinctSync,
            payload: serde_json::json!({ "add": add, "remove": remove }),
            hint: Value::Null,
        }
    }
}

/// Where an updated document sits in the server's new result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Index in the new result.
    At(usize),
    /// `false`: no longer matches the query.
    Excluded,
    /// `-1`: matches but falls outside the visible window.
    Outside,
}

impl Placement {
    fn parse(hint: &Value) -> Option<Self> {
        match hint {
            Value::Bool(false) => Some(Self::Excluded),
            Value::Number(n) => match n.as_u64() {
                Some(i) => usize::try_from(i).ok().map(Self::At),
                None if n.as_i64() == Some(-1) => Some(Self::Outside),
                None => None,
            },
            _ => None,
        }
    }
}

/// Current materialized result of a live query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LiveResult {
    List(Vec<Document>),
    One(Option<Document>),
    Count(i64),
    Distinct(Vec<Value>),
}

impl LiveResult {
    pub fn empty(shape: QueryShape) -> Self {
        match shape {
            QueryShape::List => Self::List(Vec::new()),
            QueryShape::FindOne => Self::One(None),
            QueryShape::Count => Self::Count(0),
            QueryShape::Distinct => Self::Distinct(Vec::new()),
        }
    }

    pub fn shape(&self) -> QueryShape {
        match self {
            Self::List(_) => QueryShape::List,
            Self::One(_) => QueryShape::FindOne,
            Self::Count(_) => QueryShape::Count,
            Self::Distinct(_) => QueryShape::Distinct,
        }
    }

    /// Build a result from the initial-fetch response.
    ///
    /// Count responses carry `count`, distinct responses `values`, and
    /// list/findOne responses `docs`.
    pub fn from_snapshot(shape: QueryShape, response: &Value) -> Result<Self, CoreError> {
        let missing = |field: &str| CoreError::MalformedSnapshot {
            reason: format!("{shape} response has no '{field}' field"),
        };

        match shape {
            QueryShape::Count => response
                .get("count")
                .and_then(Value::as_i64)
                .map(Self::Count)
                .ok_or_else(|| missing("count")),
            QueryShape::Distinct => {
                let values = response
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| missing("values"))?;
                let mut set = Vec::with_capacity(values.len());
                union_into(&mut set, values);
                Ok(Self::Distinct(set))
            }
            QueryShape::List | QueryShape::FindOne => {
                let docs = response
                    .get("docs")
                    .and_then(Value::as_array)
                    .ok_or_else(|| missing("docs"))?
                    .iter()
                    .cloned()
                    .map(Document::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| CoreError::MalformedSnapshot {
                        reason: e.to_string(),
                    })?;
                if shape == QueryShape::FindOne {
                    Ok(Self::One(docs.into_iter().next()))
                } else {
                    Ok(Self::List(docs))
                }
            }
        }
    }

    /// Fold one mutation into the result.
    ///
    /// Returns `Ok(false)` for benign misses (removing or updating a
    /// document that is not present). Mutations that make no sense for the
    /// result shape, or carry an unusable payload, are errors.
    pub fn apply(&mut self, mutation: &Mutation, limit: Option<usize>) -> Result<bool, CoreError> {
        match self {
            Self::Count(count) => apply_count(count, mutation),
            Self::Distinct(values) => apply_distinct(values, mutation),
            Self::One(slot) => apply_one(slot, mutation),
            Self::List(docs) => apply_list(docs, mutation, limit),
        }
    }

    /// Most-recent-first scan for a document by identifier.
    pub fn get_doc_by_id(&self, id: &Value) -> Option<&Document> {
        match self {
            Self::List(docs) => docs.iter().rev().find(|d| d.has_id(id)),
            Self::One(slot) => slot.as_ref().filter(|d| d.has_id(id)),
            Self::Count(_) | Self::Distinct(_) => None,
        }
    }

    /// Documents of a list or findOne result; empty for other shapes.
    pub fn docs(&self) -> &[Document] {
        match self {
            Self::List(docs) => docs,
            Self::One(Some(doc)) => std::slice::from_ref(doc),
            _ => &[],
        }
    }

    pub fn doc(&self) -> Option<&Document> {
        match self {
            Self::One(slot) => slot.as_ref(),
            Self::List(docs) => docs.first(),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<i64> {
        match self {
            Self::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn values(&self) -> Option<&[Value]> {
        match self {
            Self::Distinct(values) => Some(values),
            _ => None,
        }
    }
}

fn not_applicable(mutation: &Mutation, shape: &str) -> CoreError {
    CoreError::malformed(
        mutation.kind.as_ref(),
        format!("not applicable to a {shape} query"),
    )
}

fn document(mutation: &Mutation) -> Result<Document, CoreError> {
    Document::try_from(mutation.payload.clone())
        .map_err(|e| CoreError::malformed(mutation.kind.as_ref(), e.to_string()))
}

fn document_with_id(mutation: &Mutation) -> Result<(Document, Value), CoreError> {
    let doc = document(mutation)?;
    let id = doc
        .id()
        .cloned()
        .ok_or_else(|| CoreError::malformed(mutation.kind.as_ref(), "document has no _id"))?;
    Ok((doc, id))
}

fn placement(mutation: &Mutation) -> Result<Placement, CoreError> {
    Placement::parse(&mutation.hint).ok_or_else(|| {
        CoreError::malformed(
            mutation.kind.as_ref(),
            format!("unusable position hint {}", mutation.hint),
        )
    })
}

// ── Count ────────────────────────────────────────────────────────────

fn apply_count(count: &mut i64, mutation: &Mutation) -> Result<bool, CoreError> {
    match mutation.kind {
        MutationKind::Add => *count += 1,
        MutationKind::Remove => *count -= 1,
        MutationKind::Update => {
            if Placement::parse(&mutation.hint) == Some(Placement::Outside) {
                *count -= 1;
            } else {
                *count += 1;
            }
        }
        MutationKind::DistinctSync => return Err(not_applicable(mutation, "count")),
    }
    Ok(true)
}

// ── Distinct ─────────────────────────────────────────────────────────

fn union_into(set: &mut Vec<Value>, values: &[Value]) {
    for value in values {
        if !set.contains(value) {
            set.push(value.clone());
        }
    }
}

fn sync_list<'a>(payload: &'a Value, field: &str) -> Result<&'a [Value], CoreError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(CoreError::malformed(
            "distinctSync",
            format!("'{field}' must be an array, got {other}"),
        )),
    }
}

fn apply_distinct(values: &mut Vec<Value>, mutation: &Mutation) -> Result<bool, CoreError> {
    if mutation.kind != MutationKind::DistinctSync {
        return Err(not_applicable(mutation, "distinct"));
    }
    let added = sync_list(&mutation.payload, "add")?;
    let removed = sync_list(&mutation.payload, "remove")?;

    union_into(values, added);
    values.retain(|v| !removed.contains(v));
    debug!(values = values.len(), "distinct sync applied");
    Ok(true)
}

// ── Single document ──────────────────────────────────────────────────

fn apply_one(slot: &mut Option<Document>, mutation: &Mutation) -> Result<bool, CoreError> {
    match mutation.kind {
        MutationKind::Add => {
            *slot = Some(document(mutation)?);
            Ok(true)
        }
        MutationKind::Update => {
            let (doc, id) = document_with_id(mutation)?;
            let placement = placement(mutation)?;
            let present = slot.as_ref().is_some_and(|d| d.has_id(&id));
            match (present, placement) {
                (true, Placement::Excluded | Placement::Outside) => {
                    *slot = None;
                    Ok(true)
                }
                (true, Placement::At(_)) => {
                    if let Some(existing) = slot.as_mut() {
                        existing.merge(doc);
                    }
                    Ok(true)
                }
                (false, Placement::At(_)) => {
                    *slot = Some(doc);
                    Ok(true)
                }
                (false, _) => {
                    debug!(%id, "updated document is not the current findOne result");
                    Ok(false)
                }
            }
        }
        MutationKind::Remove => {
            if slot.as_ref().is_some_and(|d| d.has_id(&mutation.payload)) {
                *slot = None;
                Ok(true)
            } else {
                debug!(id = %mutation.payload, "failed to find removed document");
                Ok(false)
            }
        }
        MutationKind::DistinctSync => Err(not_applicable(mutation, "findOne")),
    }
}

// ── Document list ────────────────────────────────────────────────────

fn position_of(docs: &[Document], id: &Value) -> Option<usize> {
    docs.iter().rposition(|d| d.has_id(id))
}

/// Insert before an occupied `index`, otherwise append; then trim to
/// `limit`.
fn list_insert(docs: &mut Vec<Document>, doc: Document, index: Option<usize>, limit: Option<usize>) {
    match index {
        Some(i) if i < docs.len() => docs.insert(i, doc),
        _ => docs.push(doc),
    }
    if let Some(limit) = limit {
        docs.truncate(limit);
    }
}

fn apply_list(
    docs: &mut Vec<Document>,
    mutation: &Mutation,
    limit: Option<usize>,
) -> Result<bool, CoreError> {
    match mutation.kind {
        MutationKind::Add => {
            let doc = document(mutation)?;
            let index = mutation.hint.as_u64().and_then(|i| usize::try_from(i).ok());
            list_insert(docs, doc, index, limit);
            Ok(true)
        }
        MutationKind::Update => {
            let (doc, id) = document_with_id(mutation)?;
            let placement = placement(mutation)?;
            match (position_of(docs, &id), placement) {
                (Some(i), Placement::Excluded | Placement::Outside) => {
                    docs.remove(i);
                    Ok(true)
                }
                (Some(i), Placement::At(target)) if target == i => {
                    docs[i].merge(doc);
                    Ok(true)
                }
                (Some(i), Placement::At(target)) => {
                    // `target` is the final index; after taking the entry
                    // out, inserting there lands it exactly at `target`.
                    docs.remove(i);
                    let target = target.min(docs.len());
                    docs.insert(target, doc);
                    Ok(true)
                }
                (None, Placement::At(target)) => {
                    list_insert(docs, doc, Some(target), limit);
                    Ok(true)
                }
                (None, Placement::Outside | Placement::Excluded) => {
                    debug!(%id, "failed to find updated document");
                    Ok(false)
                }
            }
        }
        MutationKind::Remove => match position_of(docs, &mutation.payload) {
            Some(i) => {
                docs.remove(i);
                Ok(true)
            }
            None => {
                debug!(id = %mutation.payload, "failed to find removed document");
                Ok(false)
            }
        },
        MutationKind::DistinctSync => Err(not_applicable(mutation, "list")),
    }
}
