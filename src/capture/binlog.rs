// ABOUTME: mysql_async binlog adapter - turns replication stream events into capture events
// ABOUTME: Normalises binlog column values to JSON

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::binlog::jsonb;
use mysql_async::binlog::jsondiff::JsonDiff;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts};
use serde_json::{json, Number, Value as JsonValue};

use super::{BinlogConnector, BinlogEvent, BinlogSource, RawRow, RowsEvent, SchemaFilter};
use crate::config::sanitize_url;
use crate::model::{Action, Checkpoint};

/// Missed heartbeats tolerated before a silent stream is declared dead.
const MISSED_HEARTBEATS: u32 = 3;

/// Opens binlog streams against the source server.
pub struct MySqlBinlogConnector {
    opts: Opts,
    display_url: String,
    heartbeat: Duration,
    schemas: SchemaFilter,
}

impl MySqlBinlogConnector {
    pub fn new(url: &str, heartbeat: Duration, schemas: SchemaFilter) -> Result<Self> {
        let opts = Opts::from_url(url)
            .with_context(|| format!("Invalid source url {}", sanitize_url(url)))?;
        Ok(Self {
            opts,
            display_url: sanitize_url(url),
            heartbeat,
            schemas,
        })
    }
}

/// Session statement asking the source to send heartbeat events while the
/// binlog is idle. Both variable spellings are set; servers read whichever
/// their version knows.
fn heartbeat_sql(period: Duration) -> String {
    let nanos = period.as_nanos();
    format!("SET @master_heartbeat_period = {nanos}, @source_heartbeat_period = {nanos}")
}

/// How long a read may wait before the connection is treated as lost.
fn read_timeout(heartbeat: Duration) -> Duration {
    heartbeat * MISSED_HEARTBEATS
}

/// Next stream item, or an error when nothing arrives within `timeout`.
async fn next_within<S>(stream: &mut S, timeout: Duration) -> Result<Option<S::Item>>
where
    S: Stream + Unpin,
{
    tokio::time::timeout(timeout, stream.next())
        .await
        .map_err(|_| anyhow!("No binlog data or heartbeat received for {:?}", timeout))
}

#[async_trait]
impl BinlogConnector for MySqlBinlogConnector {
    async fn connect(
        &self,
        server_id: u32,
        resume: Option<&Checkpoint>,
    ) -> Result<Box<dyn BinlogSource>> {
        let mut conn = Conn::new(self.opts.clone())
            .await
            .with_context(|| format!("Failed to connect to source {}", self.display_url))?;
        conn.query_drop(heartbeat_sql(self.heartbeat))
            .await
            .context("Failed to set binlog heartbeat period")?;

        let mut request = BinlogStreamRequest::new(server_id);
        if let Some(checkpoint) = resume {
            request = request
                .with_filename(checkpoint.file.as_bytes())
                .with_pos(checkpoint.offset);
        }
        let stream = conn
            .get_binlog_stream(request)
            .await
            .context("Source refused binlog stream request")?;

        tracing::info!(
            source = %self.display_url,
            server_id,
            resume = ?resume.map(ToString::to_string),
            heartbeat = ?self.heartbeat,
            "binlog stream opened"
        );
        Ok(Box::new(MySqlBinlogSource {
            stream,
            schemas: self.schemas.clone(),
            read_timeout: read_timeout(self.heartbeat),
        }))
    }
}

pub struct MySqlBinlogSource {
    stream: BinlogStream,
    schemas: SchemaFilter,
    read_timeout: Duration,
}

impl MySqlBinlogSource {
    fn decode_rows(
        &self,
        data: &RowsEventData<'_>,
        log_pos: u64,
        timestamp: u32,
    ) -> Result<Option<RowsEvent>> {
        let action = match data {
            RowsEventData::WriteRowsEventV1(_) | RowsEventData::WriteRowsEvent(_) => Action::Insert,
            RowsEventData::UpdateRowsEventV1(_)
            | RowsEventData::UpdateRowsEvent(_)
            | RowsEventData::PartialUpdateRowsEvent(_) => Action::Update,
            RowsEventData::DeleteRowsEventV1(_) | RowsEventData::DeleteRowsEvent(_) => {
                Action::Delete
            }
            #[allow(unreachable_patterns)]
            _ => return Ok(None),
        };

        let Some(tme) = self.stream.get_tme(data.table_id()) else {
            tracing::warn!(
                table_id = data.table_id(),
                log_pos,
                "rows event without table map, skipped"
            );
            return Ok(None);
        };
        if !self.schemas.contains(&tme.database_name()) {
            return Ok(None);
        }

        let mut rows = Vec::new();
        for row in data.rows(tme) {
            let (before, after) = row.context("Failed to decode binlog row")?;
            let raw = match (before, after) {
                (Some(before), Some(after)) => RawRow::Change {
                    before: row_values(before)?,
                    after: row_values(after)?,
                },
                (Some(image), None) | (None, Some(image)) => RawRow::Image(row_values(image)?),
                (None, None) => continue,
            };
            rows.push(raw);
        }

        Ok(Some(RowsEvent {
            schema: tme.database_name().into_owned(),
            table: tme.table_name().into_owned(),
            log_pos,
            timestamp,
            action,
            rows,
        }))
    }
}

#[async_trait]
impl BinlogSource for MySqlBinlogSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        while let Some(event) = next_within(&mut self.stream, self.read_timeout).await? {
            let event = event.context("Binlog stream error")?;
            let log_pos = u64::from(event.header().log_pos());
            let timestamp = event.header().timestamp();
            match event.read_data().context("Failed to decode binlog event")? {
                Some(EventData::RotateEvent(rotate)) => {
                    return Ok(Some(BinlogEvent::Rotate {
                        next_file: String::from_utf8_lossy(rotate.name_raw()).into_owned(),
                        position: rotate.position(),
                    }));
                }
                Some(EventData::RowsEvent(data)) => {
                    if let Some(rows) = self.decode_rows(&data, log_pos, timestamp)? {
                        return Ok(Some(BinlogEvent::Rows(rows)));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

fn row_values(row: BinlogRow) -> Result<Vec<JsonValue>> {
    row.unwrap().into_iter().map(binlog_value_to_json).collect()
}

fn binlog_value_to_json(value: BinlogValue<'_>) -> Result<JsonValue> {
    match value {
        BinlogValue::Value(value) => Ok(mysql_value_to_json(value)),
        BinlogValue::Jsonb(doc) => jsonb_to_json(doc),
        BinlogValue::JsonDiff(diffs) => diffs.iter().map(json_diff_to_json).collect(),
    }
}

fn jsonb_to_json(doc: jsonb::Value<'_>) -> Result<JsonValue> {
    let dom = doc.parse().context("Failed to parse binary JSON column")?;
    Ok(JsonValue::from(dom))
}

/// One partial-update operation as `{"path", "operation", "value"}`. The
/// value is absent for removals.
fn json_diff_to_json(diff: &JsonDiff<'_>) -> Result<JsonValue> {
    let value = match diff.value() {
        Some(doc) => jsonb_to_json(doc.clone())?,
        None => JsonValue::Null,
    };
    Ok(json!({
        "path": diff.path_str(),
        "operation": format!("{:?}", diff.operation()).to_lowercase(),
        "value": value,
    }))
}

/// Normalise one column value.
///
/// Datetimes render as `YYYY-MM-DD HH:MM:SS.mmm`, dates (midnight with no
/// fraction) as `YYYY-MM-DD`, times as `[-]HH:MM:SS`. Bytes are decoded as
/// lossy UTF-8.
pub fn mysql_value_to_json(value: mysql_async::Value) -> JsonValue {
    use mysql_async::Value;
    match value {
        Value::NULL => JsonValue::Null,
        Value::Bytes(bytes) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(i) => JsonValue::from(i),
        Value::UInt(u) => JsonValue::from(u),
        Value::Float(f) => float_to_json(f64::from(f)),
        Value::Double(d) => float_to_json(d),
        Value::Date(year, month, day, 0, 0, 0, 0) => {
            JsonValue::String(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        Value::Date(year, month, day, hour, minute, second, micros) => JsonValue::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros / 1000
        )),
        Value::Time(negative, days, hours, minutes, seconds, _micros) => {
            let total_hours = u64::from(days) * 24 + u64::from(hours);
            JsonValue::String(format!(
                "{}{:02}:{:02}:{:02}",
                if negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds
            ))
        }
    }
}

fn float_to_json(value: f64) -> JsonValue {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
