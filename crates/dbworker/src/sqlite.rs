//! SQLite backend, run inside the worker process.
//!
//! DSN forms: `:memory:`, `sqlite::memory:`, `sqlite:PATH`, `sqlite://PATH`,
//! or a bare path.
//!
//! Open attributes:
//! - `read_only` (bool): open without write access
//! - `create` (bool, default true): create the file if missing
//! - `busy_timeout` (milliseconds): wait on locked databases
//! - `AutoCommit` (bool): `false` starts a transaction right after opening
//! - `RaiseError`, `PrintError`: accepted and ignored; failures are always
//!   returned to the caller
//!
//! Blobs are returned base64-encoded; arrays and objects are rejected as
//! statement arguments.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{OpenFlags, params_from_iter};
use serde_json::{Map, Value};

use crate::bridge::protocol::{ExecResult, OpenParams};
use crate::error::BackendError;
use crate::worker::{Backend, Connector};

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        BackendError::new(e.to_string())
    }
}

/// Opens SQLite databases for [`Connection`](crate::Connection)s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    fn connect(&self, params: &OpenParams) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(SqliteBackend::open(params)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Memory,
    File(PathBuf),
}

fn parse_dsn(dsn: &str) -> Result<Target, BackendError> {
    let rest = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .unwrap_or(dsn);
    match rest {
        "" => Err(BackendError::new(format!("invalid sqlite dsn: {dsn:?}"))),
        ":memory:" => Ok(Target::Memory),
        path => Ok(Target::File(PathBuf::from(path))),
    }
}

#[derive(Debug, Default)]
struct OpenOptions {
    read_only: bool,
    create: bool,
    busy_timeout: Option<Duration>,
    autocommit: bool,
}

impl OpenOptions {
    fn from_attrs(attrs: &Map<String, Value>) -> Result<Self, BackendError> {
        let mut options = Self {
            create: true,
            autocommit: true,
            ..Default::default()
        };
        for (name, value) in attrs {
            match name.as_str() {
                "read_only" => options.read_only = flag(name, value)?,
                "create" => options.create = flag(name, value)?,
                "AutoCommit" => options.autocommit = flag(name, value)?,
                "busy_timeout" => options.busy_timeout = Some(millis(name, value)?),
                "RaiseError" | "PrintError" => {}
                other => {
                    return Err(BackendError::new(format!("unknown open attribute: {other}")));
                }
            }
        }
        Ok(options)
    }

    fn flags(&self) -> OpenFlags {
        let access = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else if self.create {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        access | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX
    }
}

fn flag(name: &str, value: &Value) -> Result<bool, BackendError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_i64() != Some(0)),
        _ => Err(BackendError::new(format!("{name} must be a boolean"))),
    }
}

fn millis(name: &str, value: &Value) -> Result<Duration, BackendError> {
    value
        .as_u64()
        .map(Duration::from_millis)
        .ok_or_else(|| BackendError::new(format!("{name} must be a non-negative integer")))
}

pub struct SqliteBackend {
    conn: rusqlite::Connection,
    name: String,
}

impl SqliteBackend {
    pub fn open(params: &OpenParams) -> Result<Self, BackendError> {
        let target = parse_dsn(&params.dsn)?;
        let options = OpenOptions::from_attrs(&params.attrs)?;

        let conn = match &target {
            Target::Memory => rusqlite::Connection::open_in_memory_with_flags(options.flags())?,
            Target::File(path) => rusqlite::Connection::open_with_flags(path, options.flags())?,
        };
        if let Some(timeout) = options.busy_timeout {
            conn.busy_timeout(timeout)?;
        }
        if !options.autocommit {
            conn.execute_batch("BEGIN")?;
        }
        tracing::debug!(dsn = %params.dsn, ?target, read_only = options.read_only, "Opened sqlite database");

        Ok(Self {
            conn,
            name: params.dsn.clone(),
        })
    }

    fn busy_timeout_ms(&self) -> Result<i64, BackendError> {
        Ok(self
            .conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))?)
    }
}

impl Backend for SqliteBackend {
    fn execute(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult, BackendError> {
        let params = args.iter().map(to_sql).collect::<Result<Vec<_>, _>>()?;
        let mut stmt = self.conn.prepare(sql)?;

        let width = stmt.column_count();
        if width == 0 {
            let changed = stmt.execute(params_from_iter(params))?;
            return Ok(ExecResult {
                columns: Vec::new(),
                rows: Vec::new(),
                status: changed as i64,
            });
        }

        let columns = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i)?));
            }
            collected.push(values);
        }
        Ok(ExecResult {
            columns,
            rows: collected,
            status: -1,
        })
    }

    fn attr(&mut self, name: &str) -> Result<Value, BackendError> {
        match name {
            "AutoCommit" => Ok(Value::Bool(self.conn.is_autocommit())),
            "busy_timeout" => Ok(Value::from(self.busy_timeout_ms()?)),
            "sqlite_version" => Ok(Value::from(rusqlite::version())),
            "Name" => Ok(Value::from(self.name.as_str())),
            _ => Err(BackendError::new(format!("unknown attribute: {name}"))),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), BackendError> {
        match name {
            "AutoCommit" => {
                let on = flag(name, &value)?;
                match (on, self.conn.is_autocommit()) {
                    (false, true) => self.conn.execute_batch("BEGIN")?,
                    (true, false) => self.conn.execute_batch("COMMIT")?,
                    _ => {}
                }
                Ok(())
            }
            "busy_timeout" => Ok(self.conn.busy_timeout(millis(name, &value)?)?),
            "sqlite_version" | "Name" => {
                Err(BackendError::new(format!("read-only attribute: {name}")))
            }
            _ => Err(BackendError::new(format!("unknown attribute: {name}"))),
        }
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        if !self.conn.is_autocommit() {
            return Err(BackendError::new("already in a transaction"));
        }
        Ok(self.conn.execute_batch("BEGIN")?)
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        Ok(self.conn.execute_batch("COMMIT")?)
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        Ok(self.conn.execute_batch("ROLLBACK")?)
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, BackendError> {
        match name {
            "last_insert_rowid" => Ok(Value::from(self.conn.last_insert_rowid())),
            "changes" => Ok(Value::from(self.conn.changes())),
            "is_autocommit" => Ok(Value::Bool(self.conn.is_autocommit())),
            "busy_timeout" => {
                let Some(ms) = args.first() else {
                    return Ok(Value::from(self.busy_timeout_ms()?));
                };
                self.conn.busy_timeout(millis(name, ms)?)?;
                Ok(Value::Bool(true))
            }
            _ => Err(BackendError::new(format!("unknown driver function: {name}"))),
        }
    }
}

fn to_sql(value: &Value) -> Result<SqlValue, BackendError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) => return Err(BackendError::new("unsupported argument type: array")),
        Value::Object(_) => return Err(BackendError::new("unsupported argument type: object")),
    })
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}
