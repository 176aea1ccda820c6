//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Usage dimension a budget limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMetric {
    /// Cumulative cost in US dollars.
    CostUsd,
    /// Number of completed agent turns.
    Turns,
}

impl Display for BudgetMetric {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CostUsd => f.write_str("cost_usd"),
            Self::Turns => f.write_str("turns"),
        }
    }
}

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// IPC communication failure.
    Ipc(String),
    /// HTTP transport failure.
    Http(String),
    /// Caller supplied input that cannot be applied as-is.
    Validation(String),
    /// A dependency edge would close a cycle; `cycle` starts and ends on the same id.
    CircularDependency {
        /// Ordered spec ids along the cycle, following `depends_on` edges.
        cycle: Vec<String>,
    },
    /// Session group does not exist.
    GroupNotFound(String),
    /// Command queue does not exist.
    QueueNotFound(String),
    /// Any other requested entity does not exist.
    NotFound(String),
    /// Requested action is illegal in the entity's current state.
    InvalidTransition {
        /// Entity kind and id, e.g. `queue q-1`.
        entity: String,
        /// Current state name.
        from: String,
        /// Rejected action.
        action: String,
    },
    /// Session usage crossed its configured ceiling.
    BudgetExceeded {
        /// Session that was terminated.
        session_id: String,
        /// Which ceiling was crossed.
        metric: BudgetMetric,
        /// Observed cumulative usage.
        usage: f64,
        /// Configured ceiling.
        limit: f64,
    },
    /// External session process failed.
    Process {
        /// Session the process belonged to, when one was assigned.
        session_id: Option<String>,
        /// Process exit code; `None` when killed by a signal or never started.
        exit_code: Option<i32>,
        /// Captured stderr tail or failure description.
        stderr: String,
    },
    /// A transcript unit could not be parsed.
    Parse(String),
}

impl AppError {
    /// Whether the caller (or the component raising it) may reasonably retry.
    ///
    /// Validation and parse failures are recoverable; everything that
    /// terminates a session or reports a missing entity is not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InvalidTransition { .. } | Self::Parse(_)
        )
    }

    /// Build an [`AppError::InvalidTransition`].
    #[must_use]
    pub fn invalid_transition(
        entity: impl Into<String>,
        from: impl Display,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.into(),
            from: from.to_string(),
            action: action.into(),
        }
    }

    /// Stable snake-case tag for transports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Db(_) => "db",
            Self::Io(_) => "io",
            Self::Ipc(_) => "ipc",
            Self::Http(_) => "http",
            Self::Validation(_) => "validation",
            Self::CircularDependency { .. } => "circular_dependency",
            Self::GroupNotFound(_) => "group_not_found",
            Self::QueueNotFound(_) => "queue_not_found",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Process { .. } => "process",
            Self::Parse(_) => "parse",
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::CircularDependency { cycle } => {
                write!(f, "circular dependency: {}", cycle.join(" -> "))
            }
            Self::GroupNotFound(id) => write!(f, "group not found: {id}"),
            Self::QueueNotFound(id) => write!(f, "queue not found: {id}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidTransition {
                entity,
                from,
                action,
            } => write!(f, "invalid transition: cannot {action} {entity} while {from}"),
            Self::BudgetExceeded {
                session_id,
                metric,
                usage,
                limit,
            } => write!(
                f,
                "budget exceeded: session {session_id} {metric} {usage} > {limit}"
            ),
            Self::Process {
                session_id,
                exit_code,
                stderr,
            } => {
                let session = session_id.as_deref().unwrap_or("<unstarted>");
                match exit_code {
                    Some(code) => write!(f, "process: session {session} exited with code {code}: {stderr}"),
                    None => write!(f, "process: session {session}: {stderr}"),
                }
            }
            Self::Parse(msg) => write!(f, "parse: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
