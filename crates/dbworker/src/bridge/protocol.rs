//! Wire protocol types for parent-worker communication.
//!
//! Every frame carries an ordered value list. Requests are
//! `[tag, args...]`; responses are `[true, results...]` on success or
//! `[null, "error text"]` on failure. Responses carry no request id: the
//! worker answers strictly in arrival order, exactly once per request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProtocolError(String);

impl ProtocolError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Parameters of the implicit open request sent when a connection is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenParams {
    pub dsn: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Forwarded verbatim to the backend's connect operation.
    pub attrs: Map<String, Value>,
}

/// How the worker builds the argument list of a driver-private function.
///
/// Closures cannot cross the process boundary, so the parent sends a
/// description and the worker materializes the list locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSpec {
    /// Use these values as-is.
    Values(Vec<Value>),
    /// Run the builder registered under `name` in the worker on `input`.
    Builder { name: String, input: Value },
}

impl ArgSpec {
    pub fn values(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Values(values.into_iter().collect())
    }

    pub fn builder(name: impl Into<String>, input: Value) -> Self {
        Self::Builder {
            name: name.into(),
            input,
        }
    }
}

/// Requests from parent to worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Open(OpenParams),
    Exec { sql: String, args: Vec<Value> },
    Attr { name: String },
    SetAttr { name: String, value: Value },
    Begin,
    Commit,
    Rollback,
    Func { args: ArgSpec, name: String },
}

impl Request {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Exec { .. } => "exec",
            Self::Attr { .. } => "attr",
            Self::SetAttr { .. } => "set_attr",
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Func { .. } => "func",
        }
    }

    /// Whether a failure of this operation ends the connection.
    ///
    /// Fatality belongs to the operation kind, not the call site: only the
    /// initial open is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn into_payload(self) -> Result<Vec<Value>, ProtocolError> {
        let tag = Value::from(self.tag());
        let payload = match self {
            Self::Open(params) => vec![
                tag,
                Value::String(params.dsn),
                params.user.map_or(Value::Null, Value::String),
                params.password.map_or(Value::Null, Value::String),
                Value::Object(params.attrs),
            ],
            Self::Exec { sql, args } => {
                let mut payload = Vec::with_capacity(args.len() + 2);
                payload.push(tag);
                payload.push(Value::String(sql));
                payload.extend(args);
                payload
            }
            Self::Attr { name } => vec![tag, Value::String(name)],
            Self::SetAttr { name, value } => vec![tag, Value::String(name), value],
            Self::Begin | Self::Commit | Self::Rollback => vec![tag],
            Self::Func { args, name } => {
                let spec = serde_json::to_value(&args)
                    .map_err(|e| ProtocolError::new(format!("bad argument spec: {e}")))?;
                vec![tag, spec, Value::String(name)]
            }
        };
        Ok(payload)
    }

    pub fn from_payload(payload: Vec<Value>) -> Result<Self, ProtocolError> {
        let mut items = payload.into_iter();
        let tag = match items.next() {
            Some(Value::String(tag)) => tag,
            Some(other) => return Err(ProtocolError::new(format!("bad request tag: {other}"))),
            None => return Err(ProtocolError::new("empty request")),
        };

        let request = match tag.as_str() {
            "open" => {
                let dsn = string_arg(&mut items, "dsn")?;
                let user = optional_string_arg(&mut items, "user")?;
                let password = optional_string_arg(&mut items, "password")?;
                let attrs = match items.next() {
                    Some(Value::Object(attrs)) => attrs,
                    None | Some(Value::Null) => Map::new(),
                    Some(other) => {
                        return Err(ProtocolError::new(format!("bad open attributes: {other}")));
                    }
                };
                Self::Open(OpenParams {
                    dsn,
                    user,
                    password,
                    attrs,
                })
            }
            "exec" => {
                let sql = string_arg(&mut items, "sql")?;
                Self::Exec {
                    sql,
                    args: items.by_ref().collect(),
                }
            }
            "attr" => Self::Attr {
                name: string_arg(&mut items, "attribute name")?,
            },
            "set_attr" => Self::SetAttr {
                name: string_arg(&mut items, "attribute name")?,
                value: items.next().unwrap_or(Value::Null),
            },
            "begin" => Self::Begin,
            "commit" => Self::Commit,
            "rollback" => Self::Rollback,
            "func" => {
                let spec = items
                    .next()
                    .ok_or_else(|| ProtocolError::new("missing argument spec"))?;
                let args = serde_json::from_value(spec)
                    .map_err(|e| ProtocolError::new(format!("bad argument spec: {e}")))?;
                Self::Func {
                    args,
                    name: string_arg(&mut items, "function name")?,
                }
            }
            other => return Err(ProtocolError::new(format!("unknown request: {other}"))),
        };

        if items.next().is_some() {
            return Err(ProtocolError::new(format!(
                "trailing arguments in {} request",
                request.tag()
            )));
        }
        Ok(request)
    }
}

fn string_arg(
    items: &mut impl Iterator<Item = Value>,
    what: &str,
) -> Result<String, ProtocolError> {
    match items.next() {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ProtocolError::new(format!("{what} must be a string, got {other}"))),
        None => Err(ProtocolError::new(format!("missing {what}"))),
    }
}

fn optional_string_arg(
    items: &mut impl Iterator<Item = Value>,
    what: &str,
) -> Result<Option<String>, ProtocolError> {
    match items.next() {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ProtocolError::new(format!("{what} must be a string, got {other}"))),
    }
}

/// Responses from worker to parent.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(Vec<Value>),
    Err(String),
}

impl Response {
    pub fn into_payload(self) -> Vec<Value> {
        match self {
            Self::Ok(results) => {
                let mut payload = Vec::with_capacity(results.len() + 1);
                payload.push(Value::Bool(true));
                payload.extend(results);
                payload
            }
            Self::Err(message) => vec![Value::Null, Value::String(message)],
        }
    }

    /// Any first element other than absent, `null` or `false` marks success.
    pub fn from_payload(payload: Vec<Value>) -> Self {
        let mut items = payload.into_iter();
        match items.next() {
            Some(Value::Null) | Some(Value::Bool(false)) | None => {
                let message = match items.next() {
                    Some(Value::String(message)) => message,
                    Some(other) => other.to_string(),
                    None => "unknown error".to_string(),
                };
                Self::Err(message)
            }
            Some(_) => Self::Ok(items.collect()),
        }
    }
}

/// Result of an `exec` request: column names, all rows, and the driver's
/// status value (rows affected, or -1 for statements that return rows).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub status: i64,
}

impl ExecResult {
    pub fn into_values(self) -> Vec<Value> {
        vec![
            Value::from(self.columns),
            Value::Array(self.rows.into_iter().map(Value::Array).collect()),
            Value::from(self.status),
        ]
    }

    pub fn from_values(values: Vec<Value>) -> Result<Self, ProtocolError> {
        let (columns, rows, status) = serde_json::from_value(Value::Array(values))
            .map_err(|e| ProtocolError::new(format!("bad exec result: {e}")))?;
        Ok(Self {
            columns,
            rows,
            status,
        })
    }
}
