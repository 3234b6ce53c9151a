//! In-process wire session used by the test suite.
//!
//! `MockSession` implements the [`Session`] seam over a toy evaluator:
//! `select` lists echo their parameters and literals back, a single
//! per-session table gives `insert`/`update`/`delete` realistic command
//! tags, and `begin`/`commit`/`rollback` drive the same I/T/E status
//! machine a real backend reports. That is enough surface to exercise the
//! whole client layer without a server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::types::TEXT_FORMAT;
use crate::wire::{
    CommandTag, Connect, Session, WireConfig, WireError, TX_FAILED, TX_IDLE, TX_IN_BLOCK,
};

pub(crate) struct MockSession {
    /// Toy storage: `None` means the table does not exist, `Some(n)` holds
    /// its row count.
    table: Option<i64>,
    tx_backup: Option<Option<i64>>,
    tx_status: u8,
    pending: Option<Pending>,
    current_row: Vec<Option<Bytes>>,
    closed: bool,
}

struct Pending {
    rows: VecDeque<Vec<Option<Bytes>>>,
    tag: CommandTag,
}

impl MockSession {
    pub(crate) fn new() -> Self {
        Self {
            table: None,
            tx_backup: None,
            tx_status: TX_IDLE,
            pending: None,
            current_row: Vec::new(),
            closed: false,
        }
    }

    fn run(
        &mut self,
        sql: &str,
        params: &[Option<Bytes>],
        result_formats: &[i16],
    ) -> Result<Pending, WireError> {
        let sql = sql.trim().to_ascii_lowercase();

        if self.tx_status == TX_FAILED {
            return Err(server_error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        if let Some(rest) = sql.strip_prefix("select") {
            return self.run_select(rest.trim(), params, result_formats);
        }
        if sql.starts_with("create") {
            self.table = Some(0);
            return Ok(Pending::tag_only("CREATE TABLE"));
        }
        if sql.starts_with("drop") {
            self.require_table()?;
            self.table = None;
            return Ok(Pending::tag_only("DROP TABLE"));
        }
        if sql.starts_with("insert") {
            let rows = self.require_table()?;
            let values = sql.split_once("values").map(|(_, v)| v).unwrap_or("");
            let added = values.matches('(').count().max(1) as i64;
            self.table = Some(rows + added);
            return Ok(Pending::tag_only(format!("INSERT 0 {}", added)));
        }
        if sql.starts_with("update") {
            let rows = self.require_table()?;
            return Ok(Pending::tag_only(format!("UPDATE {}", rows)));
        }
        if sql.starts_with("delete") {
            let rows = self.require_table()?;
            self.table = Some(0);
            return Ok(Pending::tag_only(format!("DELETE {}", rows)));
        }

        Err(server_error(
            "42601",
            &format!("mock session cannot run: {}", sql),
        ))
    }

    fn run_select(
        &mut self,
        rest: &str,
        params: &[Option<Bytes>],
        result_formats: &[i16],
    ) -> Result<Pending, WireError> {
        if let Some(series) = rest.split_once("generate_series(").map(|(_, s)| s) {
            let args = series
                .split_once(')')
                .map(|(a, _)| a)
                .unwrap_or_default();
            let (from, to) = args
                .split_once(',')
                .ok_or_else(|| server_error("42601", "malformed generate_series"))?;
            let from: i64 = from.trim().parse().unwrap_or(0);
            let to: i64 = to.trim().parse().unwrap_or(0);

            let rows: VecDeque<Vec<Option<Bytes>>> = (from..=to)
                .map(|v| vec![Some(encode_int(v, format_at(result_formats, 0)))])
                .collect();
            let tag = format!("SELECT {}", rows.len());
            return Ok(Pending {
                rows,
                tag: CommandTag::new(tag),
            });
        }

        if let Some(_table) = rest.strip_prefix("* from") {
            let rows = self.require_table()?;
            let data: VecDeque<Vec<Option<Bytes>>> = (0..rows)
                .map(|_| vec![Some(Bytes::from_static(b"x"))])
                .collect();
            return Ok(Pending {
                rows: data,
                tag: CommandTag::new(format!("SELECT {}", rows)),
            });
        }

        let mut row = Vec::new();
        for (i, expr) in rest.split(',').enumerate() {
            row.push(eval_expr(
                expr.trim(),
                params,
                format_at(result_formats, i),
            )?);
        }
        Ok(Pending {
            rows: VecDeque::from([row]),
            tag: CommandTag::new("SELECT 1"),
        })
    }

    fn require_table(&self) -> Result<i64, WireError> {
        self.table
            .ok_or_else(|| server_error("42P01", "relation does not exist"))
    }
}

fn server_error(code: &str, message: &str) -> WireError {
    WireError::Server {
        severity: "ERROR".to_string(),
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn format_at(result_formats: &[i16], index: usize) -> i16 {
    result_formats.get(index).copied().unwrap_or(TEXT_FORMAT)
}

fn encode_int(value: i64, format: i16) -> Bytes {
    if format == TEXT_FORMAT {
        Bytes::from(value.to_string().into_bytes())
    } else {
        Bytes::copy_from_slice(&(value as i32).to_be_bytes())
    }
}

fn eval_expr(
    expr: &str,
    params: &[Option<Bytes>],
    format: i16,
) -> Result<Option<Bytes>, WireError> {
    if let Some((lhs, rhs)) = expr.split_once(" = ") {
        let lhs = eval_expr(lhs.trim(), params, format)?;
        let rhs = eval_expr(rhs.trim(), params, format)?;
        return Ok(Some(Bytes::copy_from_slice(&[(lhs == rhs) as u8])));
    }

    if let Some((lhs, rhs)) = expr.split_once(" / ") {
        let lhs: i64 = lhs
            .trim()
            .parse()
            .map_err(|_| server_error("42601", "bad operand"))?;
        let rhs: i64 = rhs
            .trim()
            .parse()
            .map_err(|_| server_error("42601", "bad operand"))?;
        if rhs == 0 {
            return Err(server_error("22012", "division by zero"));
        }
        return Ok(Some(encode_int(lhs / rhs, format)));
    }

    if let Some(index) = expr.strip_prefix('$') {
        let index: usize = index
            .parse()
            .map_err(|_| server_error("42601", "bad placeholder"))?;
        return params
            .get(index - 1)
            .cloned()
            .ok_or_else(|| server_error("08P01", "placeholder out of range"));
    }

    if expr == "null" {
        return Ok(None);
    }
    if expr == "'infinity'::date" {
        return Ok(Some(Bytes::copy_from_slice(&i32::MAX.to_be_bytes())));
    }
    if expr == "'-infinity'::date" {
        return Ok(Some(Bytes::copy_from_slice(&i32::MIN.to_be_bytes())));
    }
    if let Ok(value) = expr.parse::<i64>() {
        return Ok(Some(encode_int(value, format)));
    }

    Err(server_error(
        "42601",
        &format!("mock session cannot evaluate: {}", expr),
    ))
}

#[async_trait]
impl Session for MockSession {
    async fn exec_params(
        &mut self,
        _ctx: &CancellationToken,
        sql: &str,
        param_values: &[Option<&[u8]>],
        _param_oids: &[u32],
        _param_formats: &[i16],
        result_formats: &[i16],
    ) -> Result<(), WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }
        if self.pending.is_some() {
            return Err(WireError::Protocol("session is busy".to_string()));
        }

        let params: Vec<Option<Bytes>> = param_values
            .iter()
            .map(|v| v.map(Bytes::copy_from_slice))
            .collect();

        match self.run(sql, &params, result_formats) {
            Ok(pending) => {
                self.pending = Some(pending);
                Ok(())
            }
            Err(e) => {
                // A failed statement poisons an open transaction.
                if self.tx_status == TX_IN_BLOCK {
                    self.tx_status = TX_FAILED;
                }
                Err(e)
            }
        }
    }

    async fn next_row(&mut self) -> Result<bool, WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }
        match self.pending.as_mut().and_then(|p| p.rows.pop_front()) {
            Some(row) => {
                self.current_row = row;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn row_values(&self) -> &[Option<Bytes>] {
        &self.current_row
    }

    async fn finish(&mut self) -> Result<CommandTag, WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }
        self.current_row.clear();
        match self.pending.take() {
            Some(pending) => Ok(pending.tag),
            None => Ok(CommandTag::new("")),
        }
    }

    async fn exec(&mut self, _ctx: &CancellationToken, sql: &str) -> Result<CommandTag, WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }
        match sql.trim().to_ascii_lowercase().as_str() {
            "begin" => {
                if self.tx_status == TX_IDLE {
                    self.tx_backup = Some(self.table);
                    self.tx_status = TX_IN_BLOCK;
                }
                Ok(CommandTag::new("BEGIN"))
            }
            "commit" => {
                if self.tx_status == TX_FAILED {
                    // A failed transaction cannot commit; the server rolls
                    // it back instead.
                    if let Some(backup) = self.tx_backup.take() {
                        self.table = backup;
                    }
                } else {
                    self.tx_backup = None;
                }
                self.tx_status = TX_IDLE;
                Ok(CommandTag::new("COMMIT"))
            }
            "rollback" => {
                if let Some(backup) = self.tx_backup.take() {
                    self.table = backup;
                }
                self.tx_status = TX_IDLE;
                Ok(CommandTag::new("ROLLBACK"))
            }
            other => Err(server_error(
                "42601",
                &format!("mock simple protocol cannot run: {}", other),
            )),
        }
    }

    fn tx_status(&self) -> u8 {
        self.tx_status
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

impl Pending {
    fn tag_only(tag: impl Into<String>) -> Self {
        Pending {
            rows: VecDeque::new(),
            tag: CommandTag::new(tag),
        }
    }
}

/// Opens [`MockSession`]s and counts how many it has opened.
pub(crate) struct MockConnect {
    pub(crate) opened: Arc<AtomicUsize>,
}

impl MockConnect {
    pub(crate) fn new() -> Self {
        Self {
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Connect for MockConnect {
    type Session = MockSession;

    async fn connect(
        &self,
        _ctx: &CancellationToken,
        _config: &WireConfig,
    ) -> Result<MockSession, WireError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession::new())
    }
}
