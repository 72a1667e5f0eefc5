use std::fmt;
use thiserror::Error;

/// A single malformed prediction. Never fatal: the extractor skips that
/// prediction and keeps going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("prediction has no {0}")]
    MissingField(&'static str),
    #[error("prediction field {field} is not an integer: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementGroup {
    Select,
    Update,
    Delete,
    Insert,
}

impl fmt::Display for StatementGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementGroup::Select => "SELECT",
            StatementGroup::Update => "UPDATE",
            StatementGroup::Delete => "DELETE",
            StatementGroup::Insert => "INSERT",
        };
        f.write_str(name)
    }
}

/// Partition-level failures. Every variant leaves the partition's ledger
/// entries unmarked except `Ledger`, which happens after the merge committed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot coerce {column} value {value:?}")]
    TypeCoercion { column: &'static str, value: String },
    #[error("failed to load batch: {0:#}")]
    Load(anyhow::Error),
    #[error("{group} statement group failed: {cause:#}")]
    Merge {
        group: StatementGroup,
        cause: anyhow::Error,
    },
    #[error("ledger update failed: {0:#}")]
    Ledger(anyhow::Error),
}

impl PipelineError {
    pub fn merge(group: StatementGroup, cause: anyhow::Error) -> Self {
        Self::Merge { group, cause }
    }

    /// Short machine-friendly tag for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TypeCoercion { .. } => "type_coercion",
            PipelineError::Load(_) => "load",
            PipelineError::Merge { .. } => "merge",
            PipelineError::Ledger(_) => "ledger",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn merge_error_names_the_failed_group() {
        let err = PipelineError::merge(StatementGroup::Delete, anyhow!("connection reset"));
        assert_eq!(err.kind(), "merge");
        assert_eq!(
            err.to_string(),
            "DELETE statement group failed: connection reset"
        );
    }

    #[test]
    fn coercion_error_quotes_the_bad_value() {
        let err = PipelineError::TypeCoercion {
            column: "start_time",
            value: "7:xx:00".to_string(),
        };
        assert_eq!(err.to_string(), "cannot coerce start_time value \"7:xx:00\"");
    }
}
