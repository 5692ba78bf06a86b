use serde::Serialize;
use tracing::{debug, error, warn};

use crate::storage::error::StoreError;
use crate::storage::types::{EntityKind, Record};

/// Outcome category of a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    Accepted,
    NotFound,
    HierarchyError,
    ValidationError,
    StoreError,
}

/// Error payload carried in place of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<EntityKind>,
    pub retryable: bool,
    /// Set when the store knows the requested write did not happen.
    pub write_not_applied: bool,
    #[serde(skip)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    Record(Record),
    Records(Vec<Record>),
    MetadataCreated { metadata_created: usize },
    Diagnostic(Diagnostic),
}

/// Uniform `(outcome, body)` pair returned by every table operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub outcome: Outcome,
    pub body: Body,
}

impl Envelope {
    pub fn found(record: impl Into<Record>) -> Self {
        Self {
            outcome: Outcome::Success,
            body: Body::Record(record.into()),
        }
    }

    pub fn listed<R: Into<Record>>(records: Vec<R>) -> Self {
        Self {
            outcome: Outcome::Success,
            body: Body::Records(records.into_iter().map(Into::into).collect()),
        }
    }

    pub fn metadata_created(count: usize) -> Self {
        Self {
            outcome: Outcome::Accepted,
            body: Body::MetadataCreated {
                metadata_created: count,
            },
        }
    }

    pub fn not_found(kind: EntityKind, key: impl std::fmt::Display) -> Self {
        debug!(kind = %kind, key = %key, "Record not found");
        Self {
            outcome: Outcome::NotFound,
            body: Body::Diagnostic(Diagnostic {
                error: format!("{} '{}' not found", kind, key),
                field: None,
                missing: None,
                retryable: false,
                write_not_applied: false,
                unavailable: false,
            }),
        }
    }

    /// Convert a store failure, logging it at the severity its category warrants.
    pub fn from_error(err: StoreError) -> Self {
        let retryable = err.is_retryable();
        let write_not_applied = err.write_not_applied();
        let (outcome, field, missing, unavailable) = match &err {
            StoreError::Validation { field, .. } => {
                debug!(field = %field, error = %err, "Validation error");
                (Outcome::ValidationError, Some(field.clone()), None, false)
            }
            StoreError::MissingParent { level, .. } => {
                warn!(level = %level, error = %err, "Missing ancestor");
                (Outcome::HierarchyError, None, Some(*level), false)
            }
            StoreError::Unavailable(_) | StoreError::NotInitialized => {
                error!(error = %err, "Store unavailable");
                (Outcome::StoreError, None, None, true)
            }
            StoreError::Corrupt { .. } | StoreError::Database(_) => {
                error!(error = %err, "Store error");
                (Outcome::StoreError, None, None, false)
            }
        };

        Self {
            outcome,
            body: Body::Diagnostic(Diagnostic {
                error: err.to_string(),
                field,
                missing,
                retryable,
                write_not_applied,
                unavailable,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success | Outcome::Accepted)
    }

    /// Protocol status code for this outcome.
    pub fn http_status(&self) -> u16 {
        match self.outcome {
            Outcome::Success => 200,
            Outcome::Accepted => 202,
            Outcome::NotFound | Outcome::HierarchyError => 404,
            Outcome::ValidationError => 400,
            Outcome::StoreError => match &self.body {
                Body::Diagnostic(d) if d.unavailable => 503,
                _ => 500,
            },
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match &self.body {
            Body::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self.body {
            Body::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn records(&self) -> Option<&[Record]> {
        match &self.body {
            Body::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match &self.body {
            Body::Diagnostic(d) => Some(d),
            _ => None,
        }
    }
}

impl From<StoreError> for Envelope {
    fn from(err: StoreError) -> Self {
        Envelope::from_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_parent_maps_to_hierarchy_error() {
        let env = Envelope::from(StoreError::missing(EntityKind::Step, "demo/1/start"));
        assert_eq!(env.outcome, Outcome::HierarchyError);
        assert_eq!(env.http_status(), 404);
        assert_eq!(env.diagnostic().unwrap().missing, Some(EntityKind::Step));
    }

    #[test]
    fn unavailable_maps_to_503() {
        let env = Envelope::from(StoreError::Unavailable("pool is closed".into()));
        assert_eq!(env.outcome, Outcome::StoreError);
        assert_eq!(env.http_status(), 503);
    }

    #[test]
    fn validation_names_the_field() {
        let env = Envelope::from(StoreError::validation("field_name", "must not be empty"));
        assert_eq!(env.http_status(), 400);
        assert_eq!(env.diagnostic().unwrap().field.as_deref(), Some("field_name"));
    }

    #[test]
    fn metadata_count_serializes_flat() {
        let env = Envelope::metadata_created(3);
        assert_eq!(env.http_status(), 202);
        assert_eq!(
            serde_json::to_value(&env.body).unwrap(),
            serde_json::json!({ "metadata_created": 3 })
        );
    }
}
