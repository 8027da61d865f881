//! Connection configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::protocol::OpenParams;
use crate::error::DbError;
use crate::process::LaunchStrategy;
use crate::queue::Origin;
use crate::worker::{ArgBuilders, Connector, WorkerConfig};

/// Failure report handed to the error hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub error: DbError,
    /// Call site of the request that failed, or where the connection was
    /// created for failures not tied to a request.
    pub origin: Origin,
    /// The connection is gone after a fatal error.
    pub fatal: bool,
}

impl ErrorEvent {
    pub fn file(&self) -> &'static str {
        self.origin.file()
    }

    pub fn line(&self) -> u32 {
        self.origin.line()
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}, line {}", self.error, self.file(), self.line())
    }
}

pub type ErrorHook = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;
pub type ConnectHook = Arc<dyn Fn(bool) + Send + Sync>;

/// Everything needed to start a [`Connection`](crate::Connection).
#[derive(Clone)]
pub struct ConnectConfig {
    pub open: OpenParams,
    pub launch: LaunchStrategy,
    /// Inactivity period after which outstanding work is abandoned.
    pub timeout: Option<Duration>,
    pub on_error: Option<ErrorHook>,
    pub on_connect: Option<ConnectHook>,
    pub worker: WorkerConfig,
}

impl ConnectConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            open: OpenParams {
                dsn: dsn.into(),
                ..Default::default()
            },
            launch: LaunchStrategy::default(),
            timeout: None,
            on_error: None,
            on_connect: None,
            worker: WorkerConfig::new(default_connector()),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.open.user = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.open.password = Some(password.into());
        self
    }

    /// Driver attribute applied when the worker opens the database.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.open.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Timeout in fractional seconds. Zero, negative or non-finite values
    /// disable it.
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn with_launch(mut self, launch: LaunchStrategy) -> Self {
        self.launch = launch;
        self
    }

    /// Called for every failed request. Without it, a fatal error aborts the process.
    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Called once with the outcome of the initial open.
    ///
    /// When present, an open failure is reported here instead of escalating
    /// to the error hook.
    pub fn with_on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Backend used by forked workers.
    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.worker.connector = Arc::new(connector);
        self
    }

    pub fn with_arg_builders(mut self, builders: ArgBuilders) -> Self {
        self.worker = self.worker.with_arg_builders(builders);
        self
    }
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("dsn", &self.open.dsn)
            .field("user", &self.open.user)
            .field("launch", &self.launch)
            .field("timeout", &self.timeout)
            .field("on_error", &self.on_error.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "sqlite")]
fn default_connector() -> Arc<dyn Connector> {
    Arc::new(crate::sqlite::SqliteConnector)
}

#[cfg(not(feature = "sqlite"))]
fn default_connector() -> Arc<dyn Connector> {
    use crate::error::BackendError;
    use crate::worker::Backend;

    Arc::new(|_: &OpenParams| -> Result<Box<dyn Backend>, BackendError> {
        Err(BackendError::new("no database backend configured"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::panic::Location;

    #[test]
    fn builder_collects_open_params() {
        let config = ConnectConfig::new("sqlite:app.db")
            .with_user("app")
            .with_password("secret")
            .with_attr("busy_timeout", 250)
            .with_timeout(Duration::from_millis(500))
            .with_launch(LaunchStrategy::exec());

        assert_eq!(config.open.dsn, "sqlite:app.db");
        assert_eq!(config.open.user.as_deref(), Some("app"));
        assert_eq!(config.open.password.as_deref(), Some("secret"));
        assert_eq!(config.open.attrs.get("busy_timeout"), Some(&json!(250)));
        assert_eq!(config.timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.launch, LaunchStrategy::exec());
    }

    #[test]
    fn fractional_timeouts() {
        let config = ConnectConfig::new(":memory:").with_timeout_secs(0.25);
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));

        for disabled in [0.0, -1.0, f64::NAN] {
            let config = ConnectConfig::new(":memory:")
                .with_timeout(Duration::from_secs(1))
                .with_timeout_secs(disabled);
            assert_eq!(config.timeout, None, "{disabled}");
        }
    }

    #[test]
    fn debug_hides_password() {
        let config = ConnectConfig::new(":memory:").with_password("secret");
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn error_event_names_its_origin() {
        let origin = Location::caller();
        let event = ErrorEvent {
            error: DbError::Timeout,
            origin,
            fatal: true,
        };
        assert_eq!(event.file(), origin.file());
        assert_eq!(
            event.to_string(),
            format!("timeout at {}, line {}", origin.file(), origin.line())
        );
    }
}
