use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// Position of a statement or expression in a pipeline file.
///
/// Lines and columns are 1-based. Carried by every diagnostic that can be
/// traced back to pipeline text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Classification of a connector failure, used by the resilience wrapper to
/// decide between retry, fail-fast, credential refresh and backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorErrorKind {
    /// Worth retrying: timeouts, dropped connections, 5xx responses.
    Transient,
    /// Surfaced immediately: bad request, not found, syntax errors.
    Permanent,
    /// Triggers one credential refresh, then one more attempt.
    Auth,
    /// The remote asked us to slow down.
    RateLimited,
}

impl std::fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Auth => "auth",
            Self::RateLimited => "rate-limited",
        };
        f.write_str(s)
    }
}

/// Main error type for sqlflow operations
#[derive(Error, Debug)]
pub enum SqlFlowError {
    // ---- validation & parsing ----
    #[error("Parse error at {span}: {message}")]
    Parse { message: String, span: Span },

    #[error("Unknown source '{name}' at {span}")]
    UnknownSource { name: String, span: Span },

    #[error("Unknown connector type '{type_name}' at {span}")]
    UnknownConnector { type_name: String, span: Span },

    #[error("Unknown table '{name}' referenced at {span}")]
    UnknownTable { name: String, span: Span },

    #[error("Table '{name}' is produced twice without REPLACE at {span}")]
    DuplicateTable { name: String, span: Span },

    #[error("MODE {mode} on '{table}' requires KEY (...) at {span}")]
    MergeWithoutKeys {
        table: String,
        mode: String,
        span: Span,
    },

    #[error("MODE INCREMENTAL on '{table}' requires BY <column> at {span}")]
    MissingCursorField { table: String, span: Span },

    // ---- planning ----
    #[error("Cyclic dependency between operations: {}", nodes.join(", "))]
    CyclicDependency { nodes: Vec<String> },

    #[error("Include cycle detected: '{path}' at {span}")]
    IncludeCycle { path: String, span: Span },

    #[error("Condition error at {span}: {message}")]
    Condition { message: String, span: Span },

    // ---- substitution ----
    #[error("Substitution error at {span}: {message}")]
    Substitution { message: String, span: Span },

    // ---- schema evolution ----
    #[error("Schema evolution rejected for '{table}': {message}")]
    SchemaEvolution { table: String, message: String },

    // ---- connectors ----
    #[error("Connector '{connector}' {kind} error: {message}")]
    Connector {
        connector: String,
        kind: ConnectorErrorKind,
        message: String,
    },

    // ---- execution ----
    #[error("Swap failed for '{target}': {message}")]
    SwapFailed { target: String, message: String },

    #[error("Watermark store error: {0}")]
    Watermark(String),

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    #[error("Operation '{operation}' exceeded its {budget_ms}ms budget")]
    Timeout { operation: String, budget_ms: u64 },

    #[error("Circuit breaker open for '{key}'")]
    CircuitOpen { key: String },

    #[error("Rate limit queue full for '{key}'")]
    RateLimitQueueFull { key: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Bulk container: validation and planning collect every diagnostic in
    /// one pass before failing.
    #[error("{} error(s):\n{}", errors.len(), errors.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Multiple { errors: Vec<SqlFlowError> },

    // ---- forwarded library errors ----
    #[error("DataFusion error: {0}")]
    Datafusion(#[from] datafusion::error::DataFusionError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] datafusion::arrow::error::ArrowError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("Serde Arrow error: {0}")]
    SerdeArrow(#[from] serde_arrow::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Tracing From Env Error: {0}")]
    FromEnvError(#[from] FromEnvError),
}

impl SqlFlowError {
    /// Stable, user-facing error code. Codes are grouped by category and
    /// never reused for a different meaning.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "SF0101",
            Self::UnknownSource { .. } => "SF0102",
            Self::UnknownConnector { .. } => "SF0103",
            Self::MergeWithoutKeys { .. } => "SF0104",
            Self::MissingCursorField { .. } => "SF0105",
            Self::UnknownTable { .. } => "SF0201",
            Self::DuplicateTable { .. } => "SF0202",
            Self::CyclicDependency { .. } => "SF0203",
            Self::IncludeCycle { .. } => "SF0204",
            Self::Condition { .. } => "SF0205",
            Self::Substitution { .. } => "SF0301",
            Self::SchemaEvolution { .. } => "SF0401",
            Self::Connector { .. } => "SF0501",
            Self::CircuitOpen { .. } => "SF0502",
            Self::RateLimitQueueFull { .. } => "SF0503",
            Self::SwapFailed { .. } => "SF0601",
            Self::Watermark(_) => "SF0602",
            Self::Cancelled { .. } => "SF0701",
            Self::Timeout { .. } => "SF0702",
            Self::Config(_) => "SF0801",
            Self::Multiple { .. } => "SF0001",
            _ => "SF0900",
        }
    }

    /// One actionable hint for the user, when we have one.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::UnknownSource { .. } => {
                Some("declare the source with SOURCE <name> TYPE ... before the LOAD that uses it")
            }
            Self::UnknownTable { .. } => {
                Some("create the table in an earlier step or load it before referencing it")
            }
            Self::DuplicateTable { .. } => {
                Some("add OR REPLACE / MODE REPLACE to redefine an existing table")
            }
            Self::MergeWithoutKeys { .. } => Some("add KEY (col, ...) to the MODE clause"),
            Self::MissingCursorField { .. } => {
                Some("add BY <column> naming a monotonic cursor column")
            }
            Self::CyclicDependency { .. } => {
                Some("break the cycle by materializing one side under a different table name")
            }
            Self::IncludeCycle { .. } => {
                Some("remove the INCLUDE that re-enters an already included file")
            }
            Self::SchemaEvolution { .. } => {
                Some("align the query's column types with the target table, or use MODE REPLACE")
            }
            Self::CircuitOpen { .. } => Some(
                "the upstream has been failing repeatedly; wait for the recovery window or raise the breaker threshold",
            ),
            _ => None,
        }
    }

    /// Process exit code for the CLI adapter: 0 success, 1 pipeline
    /// failure, 2 validation failure, 3 configuration failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse { .. }
            | Self::UnknownSource { .. }
            | Self::UnknownConnector { .. }
            | Self::UnknownTable { .. }
            | Self::DuplicateTable { .. }
            | Self::MergeWithoutKeys { .. }
            | Self::MissingCursorField { .. }
            | Self::CyclicDependency { .. }
            | Self::IncludeCycle { .. }
            | Self::Condition { .. }
            | Self::Substitution { .. } => 2,
            Self::Config(_) | Self::SerdeYaml(_) => 3,
            Self::Multiple { errors } => errors.first().map(|e| e.exit_code()).unwrap_or(1),
            _ => 1,
        }
    }

    /// Span of the offending pipeline text, when the error has one.
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Parse { span, .. }
            | Self::UnknownSource { span, .. }
            | Self::UnknownConnector { span, .. }
            | Self::UnknownTable { span, .. }
            | Self::DuplicateTable { span, .. }
            | Self::MergeWithoutKeys { span, .. }
            | Self::MissingCursorField { span, .. }
            | Self::IncludeCycle { span, .. }
            | Self::Condition { span, .. }
            | Self::Substitution { span, .. } => Some(*span),
            _ => None,
        }
    }

    /// Collapse a batch of collected diagnostics into a single error.
    /// Empty input is a caller bug and maps to a generic pipeline error.
    pub fn from_batch(mut errors: Vec<SqlFlowError>) -> SqlFlowError {
        match errors.len() {
            0 => SqlFlowError::Pipeline("error batch was empty".into()),
            1 => errors.remove(0),
            _ => SqlFlowError::Multiple { errors },
        }
    }
}

/// Convenience Result type that uses SqlFlowError
pub type Result<T> = std::result::Result<T, SqlFlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SqlFlowError::Config("missing profile".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing profile");
    }

    #[test]
    fn test_span_in_message() {
        let err = SqlFlowError::UnknownSource {
            name: "api".into(),
            span: Span::new(4, 12),
        };
        assert!(err.to_string().contains("line 4, column 12"));
        assert_eq!(err.code(), "SF0102");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_batch_collapse() {
        let single = SqlFlowError::from_batch(vec![SqlFlowError::Pipeline("x".into())]);
        assert!(matches!(single, SqlFlowError::Pipeline(_)));

        let multi = SqlFlowError::from_batch(vec![
            SqlFlowError::Pipeline("x".into()),
            SqlFlowError::Config("y".into()),
        ]);
        assert!(matches!(multi, SqlFlowError::Multiple { .. }));
        assert!(multi.to_string().contains("2 error(s)"));
    }
}
