use attrdb_types::{DataError, Id};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(Id),

    #[error("schema not found for attribute {0}")]
    SchemaNotFound(Id),

    #[error("entity already exists: {0}")]
    AlreadyExists(Id),

    #[error("conflict on {id}: {reason}")]
    Conflict { id: Id, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("corrupt record at {key}: {source}")]
    Corruption { key: String, source: DataError },

    #[error("operation cancelled")]
    Cancelled,

    #[error("kv transport: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn conflict(id: &Id, reason: impl Into<String>) -> Self {
        StoreError::Conflict {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::SchemaNotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A single validation failure, naming the offending attribute and reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("attribute {id}: expected {expected}, got {got}")]
    WrongType {
        id: Id,
        expected: String,
        got: String,
    },

    #[error("attribute {id}: value {value} not in enum set")]
    NotInEnum { id: Id, value: String },

    #[error("attribute {id}: more than one value for cardinality-one attribute")]
    Cardinality { id: Id },

    #[error("attribute {id}: predicate rejected value")]
    Predicate { id: Id },

    #[error("attribute {id}: referenced entity {target} does not exist")]
    DanglingRef { id: Id, target: Id },

    #[error("attribute {id}: no schema registered")]
    UnknownAttribute { id: Id },

    #[error("required attribute {id} is missing")]
    MissingRequired { id: Id },

    #[error("attribute {id}: {reason}")]
    Invalid { id: Id, reason: String },
}

/// Accumulates every validation failure of a write so a single call reports
/// them all at once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ValidationError) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Ok when empty, otherwise the aggregated failure.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed ({} errors): ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationError> for ValidationErrors {
    fn from(err: ValidationError) -> Self {
        ValidationErrors { errors: vec![err] }
    }
}
