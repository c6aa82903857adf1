//! Logical operations and their per-item outcomes.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::line::{self, Doc};
use crate::store::DocFilter;

/// The requested change kind. `CreateOrUpdate` is the default for bulk
/// ingestion and the only action executed as a hash-gated upsert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Patch,
    Delete,
    CreateOrUpdate,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Create,
        Action::Update,
        Action::Patch,
        Action::Delete,
        Action::CreateOrUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Patch => "patch",
            Action::Delete => "delete",
            Action::CreateOrUpdate => "createOrUpdate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "patch" => Ok(Action::Patch),
            "delete" => Ok(Action::Delete),
            "createOrUpdate" => Ok(Action::CreateOrUpdate),
            _ => Err(()),
        }
    }
}

/// One resolved operation, alive for the duration of a single engine
/// invocation. `body` is the logical content (what gets hashed), `full_body`
/// adds the internal markers and is what gets written.
#[derive(Clone, Debug)]
pub struct Operation {
    pub id: String,
    pub action: Action,
    pub body: Doc,
    pub full_body: Doc,
    pub filter: DocFilter,

    /// HTTP-style outcome code; `None` until a stage decides, and `None`
    /// still means success after execution (mapped to 200 by callers).
    pub status: Option<u16>,
    pub error: Option<String>,
    pub warning: Option<String>,
}

impl Operation {
    pub(crate) fn new(id: String, action: Action, body: Doc, filter: DocFilter) -> Self {
        let full_body = body.clone();
        Self {
            id,
            action,
            body,
            full_body,
            filter,
            status: None,
            error: None,
            warning: None,
        }
    }

    /// Whether a stage already ruled this operation out of the bulk write
    /// (not-modified included).
    pub fn skipped(&self) -> bool {
        self.status.map_or(false, |s| s >= 300)
    }

    /// Whether the operation ended in error (4xx/5xx).
    pub fn failed(&self) -> bool {
        self.status.map_or(false, |s| s >= 400)
    }

    pub(crate) fn fail(&mut self, status: u16, message: impl Into<String>) {
        self.status = Some(status);
        self.error = Some(message.into());
    }

    /// The written hash, if one was computed.
    pub fn hash(&self) -> Option<&str> {
        line::doc_hash(&self.full_body)
    }

    /// The line as returned to API callers (internal markers stripped).
    pub fn into_line(self) -> Doc {
        let mut doc = line::clean_line(self.full_body);
        doc.insert(line::ID.to_string(), Value::String(self.id));
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip() {
        for action in Action::ALL {
            assert_eq!(Action::from_str(action.as_str()), Ok(action));
        }
        assert!(Action::from_str("upsert").is_err());
    }

    #[test]
    fn test_skipped_and_failed() {
        let mut op = Operation::new(
            "a".to_string(),
            Action::Create,
            Doc::new(),
            DocFilter::by_id("a"),
        );
        assert!(!op.skipped());
        op.status = Some(304);
        assert!(op.skipped());
        assert!(!op.failed());
        op.fail(409, "line id already in use");
        assert!(op.failed());
    }
}
