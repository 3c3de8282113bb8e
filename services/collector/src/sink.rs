//! Row sink: where normalized records go
//!
//! The pipeline writes through the [`RowSink`] trait so connectors and the
//! book engine never know which database sits behind them. The production
//! implementation is [`QuestDbSink`]:
//!
//! - rows travel as InfluxDB line protocol text over a plain TCP socket,
//! - DDL travels over the Postgres wire via an `sqlx` pool.
//!
//! [`RecordingSink`] captures every operation in memory for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::SinkConfig;
use crate::schema::{NormalizedRecord, TableSchema, Value};

/// Errors raised while writing to the sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ddl execution failed: {0}")]
    Ddl(#[from] sqlx::Error),

    #[error("record for {table} is missing its time column {column}")]
    MissingTimeColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// Destination for normalized rows.
///
/// Symbol columns and the designated timestamp column come from the
/// [`TableSchema`] passed with every call.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Execute idempotent DDL for one table.
    async fn create_table(&self, ddl: &str) -> Result<(), SinkError>;

    /// Write a batch of rows for one table.
    async fn ingest_batch(
        &self,
        schema: &TableSchema,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError>;

    /// Write a single row.
    async fn insert_row(
        &self,
        schema: &TableSchema,
        record: &NormalizedRecord,
    ) -> Result<(), SinkError>;

    /// Push any buffered writes to the server.
    async fn flush(&self) -> Result<(), SinkError>;
}

/// QuestDB-backed sink: ILP for rows, Postgres wire for DDL.
pub struct QuestDbSink {
    ilp: Mutex<TcpStream>,
    pool: PgPool,
}

impl QuestDbSink {
    /// Open the ILP socket and the DDL pool described by `config`.
    pub async fn connect(config: &SinkConfig) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .connect(&config.pg_dsn())
            .await?;
        let stream = TcpStream::connect((config.host.as_str(), config.ilp_port)).await?;
        debug!(
            host = %config.host,
            ilp_port = config.ilp_port,
            pg_port = config.pg_port,
            "sink connected"
        );
        Ok(Self {
            ilp: Mutex::new(stream),
            pool,
        })
    }

    async fn write_lines(&self, payload: &[u8]) -> Result<(), SinkError> {
        let mut stream = self.ilp.lock().await;
        stream.write_all(payload).await?;
        Ok(())
    }
}

#[async_trait]
impl RowSink for QuestDbSink {
    async fn create_table(&self, ddl: &str) -> Result<(), SinkError> {
        sqlx::query(ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn ingest_batch(
        &self,
        schema: &TableSchema,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut payload = String::new();
        for record in records {
            payload.push_str(&ilp_line(schema, record)?);
        }
        self.write_lines(payload.as_bytes()).await
    }

    async fn insert_row(
        &self,
        schema: &TableSchema,
        record: &NormalizedRecord,
    ) -> Result<(), SinkError> {
        let line = ilp_line(schema, record)?;
        self.write_lines(line.as_bytes()).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut stream = self.ilp.lock().await;
        stream.flush().await?;
        Ok(())
    }
}

/// Render one record as an ILP line.
///
/// Symbols ride in the tag set, the designated timestamp closes the line as
/// raw nanoseconds, and other timestamp columns become `<micros>t` fields.
fn ilp_line(schema: &TableSchema, record: &NormalizedRecord) -> Result<String, SinkError> {
    let mut line = String::with_capacity(128);
    line.push_str(schema.table);

    for symbol in schema.symbol_columns() {
        if let Some(Value::Str(value)) = record.get(symbol) {
            line.push(',');
            line.push_str(symbol);
            line.push('=');
            escape_symbol_into(&mut line, value);
        }
    }

    let mut first_field = true;
    for (column, value) in record.columns() {
        if column == schema.time_column() || schema.symbol_columns().contains(&column) {
            continue;
        }
        line.push(if first_field { ' ' } else { ',' });
        first_field = false;
        line.push_str(column);
        line.push('=');
        match value {
            Value::Double(v) => line.push_str(&format!("{v}")),
            Value::Long(v) => line.push_str(&format!("{v}i")),
            Value::Str(v) => {
                line.push('"');
                escape_string_into(&mut line, v);
                line.push('"');
            }
            Value::Timestamp(nanos) => line.push_str(&format!("{}t", nanos / 1_000)),
            Value::DoubleMatrix(rows) => push_matrix(&mut line, rows),
        }
    }

    let at = record
        .get(schema.time_column())
        .and_then(Value::as_timestamp)
        .ok_or(SinkError::MissingTimeColumn {
            table: schema.table,
            column: schema.time_column(),
        })?;
    line.push(' ');
    line.push_str(&at.to_string());
    line.push('\n');
    Ok(line)
}

/// `[[price,qty],...]` with no spaces, so the field survives ILP splitting.
fn push_matrix(line: &mut String, rows: &[[f64; 2]]) {
    line.push('[');
    for (i, [price, quantity]) in rows.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&format!("[{price:?},{quantity:?}]"));
    }
    line.push(']');
}

fn escape_symbol_into(line: &mut String, value: &str) {
    for ch in value.chars() {
        if matches!(ch, ',' | '=' | ' ' | '\\') {
            line.push('\\');
        }
        line.push(ch);
    }
}

fn escape_string_into(line: &mut String, value: &str) {
    for ch in value.chars() {
        if matches!(ch, '"' | '\\') {
            line.push('\\');
        }
        line.push(ch);
    }
}

/// In-memory sink that records every operation.
#[derive(Debug, Default)]
pub struct RecordingSink {
    ddl: StdMutex<Vec<String>>,
    rows: StdMutex<Vec<(String, NormalizedRecord)>>,
    flushes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent row writes fail, for containment tests.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn ddl_statements(&self) -> Vec<String> {
        self.ddl.lock().unwrap().clone()
    }

    /// Records written to `table`, in arrival order.
    pub fn rows_for(&self, table: &str) -> Vec<NormalizedRecord> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), SinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SinkError::Io(std::io::Error::other("injected write failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl RowSink for RecordingSink {
    async fn create_table(&self, ddl: &str) -> Result<(), SinkError> {
        self.ddl.lock().unwrap().push(ddl.to_string());
        Ok(())
    }

    async fn ingest_batch(
        &self,
        schema: &TableSchema,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError> {
        self.check_write()?;
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            rows.push((schema.table.to_string(), record.clone()));
        }
        Ok(())
    }

    async fn insert_row(
        &self,
        schema: &TableSchema,
        record: &NormalizedRecord,
    ) -> Result<(), SinkError> {
        self.check_write()?;
        self.rows
            .lock()
            .unwrap()
            .push((schema.table.to_string(), record.clone()));
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
