/// Connection leases and session hooks
///
/// Auto-commit operations lease a fresh connection and close it when done.
/// Operations inside an explicit transaction lease the transaction's bound
/// connection, which outlives them.

use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};
use crate::backend::{Connection, ConnectionProvider};
use crate::core::StoreError;
use crate::transaction::{SharedConnection, Transaction};

/// SQL run right after a connection is borrowed and right before it is
/// returned. Both support `${name}` and `${name,default}` substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHooks {
    pub startup: Option<String>,
    pub close: Option<String>,
}

impl SessionHooks {
    pub const fn new(startup: Option<String>, close: Option<String>) -> Self {
        Self { startup, close }
    }

    pub fn startup_sql(&self) -> Result<Option<String>, StoreError> {
        self.startup.as_deref().map(expand_env).transpose()
    }

    pub fn close_sql(&self) -> Result<Option<String>, StoreError> {
        self.close.as_deref().map(expand_env).transpose()
    }
}

/// Expands `${name}` / `${name,default}` from the process environment
pub fn expand_env(text: &str) -> Result<String, StoreError> {
    expand_with(text, &|name| std::env::var(name).ok())
}

/// Expands `${name}` / `${name,default}` using `lookup`. A backslash makes
/// the next `$`, `\` or `}` literal. An unset variable without default is an
/// error.
pub fn expand_with(text: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String, StoreError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some('$' | '\\' | '}') => out.extend(chars.next()),
                _ => out.push('\\'),
            },
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.peek() {
                            Some('$' | '\\' | '}') => body.extend(chars.next()),
                            _ => body.push('\\'),
                        },
                        '}' => {
                            closed = true;
                            break;
                        }
                        other => body.push(other),
                    }
                }
                if !closed {
                    return Err(StoreError::Config(format!("unterminated variable reference in '{text}'")));
                }
                let (name, default) = match body.split_once(',') {
                    Some((name, default)) => (name.trim(), Some(default)),
                    None => (body.trim(), None),
                };
                match lookup(name).or_else(|| default.map(str::to_string)) {
                    Some(value) => out.push_str(&value),
                    None => {
                        return Err(StoreError::Config(format!("variable '{name}' is not set and has no default")));
                    }
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Opens connections and runs the session hooks around them
pub struct Connector {
    provider: Arc<dyn ConnectionProvider>,
    hooks: SessionHooks,
}

impl Connector {
    pub fn new(provider: Arc<dyn ConnectionProvider>, hooks: SessionHooks) -> Self {
        Self { provider, hooks }
    }

    /// Connection for one operation under `tx`
    pub fn acquire(&self, tx: &Transaction) -> Result<Lease, StoreError> {
        if tx.is_auto_commit() {
            let connection = self.open()?;
            return Ok(Lease {
                kind: LeaseKind::Fresh(connection),
                close_sql: self.hooks.close_sql()?,
            });
        }
        let shared = tx.bind_with(|| self.open(), self.hooks.close_sql()?)?;
        Ok(Lease {
            kind: LeaseKind::Bound(shared),
            close_sql: None,
        })
    }

    fn open(&self) -> Result<Box<dyn Connection>, StoreError> {
        let mut conn = self.provider.connect()?;
        if let Some(sql) = self.hooks.startup_sql()? {
            if let Err(e) = run_hook(conn.as_mut(), &sql) {
                if let Err(close) = conn.close() {
                    warn!(error = %close, "failed to close connection");
                }
                return Err(e);
            }
            debug!(sql = %sql, "ran session startup hook");
        }
        Ok(conn)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").field("hooks", &self.hooks).finish_non_exhaustive()
    }
}

fn run_hook(conn: &mut dyn Connection, sql: &str) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let result = stmt.execute(&[]);
    if let Err(e) = stmt.close() {
        warn!(error = %e, "failed to close statement");
    }
    result?;
    Ok(())
}

enum LeaseKind {
    /// Owned by the operation; closed on release
    Fresh(Box<dyn Connection>),
    /// Owned by the transaction; release leaves it open
    Bound(SharedConnection),
}

/// A connection held for the duration of one operation
pub struct Lease {
    kind: LeaseKind,
    close_sql: Option<String>,
}

impl Lease {
    /// Runs `f` against the connection
    pub fn with<R>(&mut self, f: impl FnOnce(&mut dyn Connection) -> R) -> R {
        match &mut self.kind {
            LeaseKind::Fresh(conn) => f(conn.as_mut()),
            LeaseKind::Bound(shared) => {
                let mut conn = shared.lock().unwrap_or_else(PoisonError::into_inner);
                f(conn.as_mut())
            }
        }
    }

    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self.kind, LeaseKind::Fresh(_))
    }

    /// Returns the connection. A fresh one runs the close hook and is closed;
    /// failures are logged.
    pub fn release(self) {
        if let LeaseKind::Fresh(mut conn) = self.kind {
            if let Some(sql) = &self.close_sql {
                if let Err(e) = run_hook(conn.as_mut(), sql) {
                    warn!(error = %e, "session close hook failed");
                }
            }
            if let Err(e) = conn.close() {
                warn!(error = %e, "failed to close connection");
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("fresh", &self.is_fresh()).finish()
    }
}
