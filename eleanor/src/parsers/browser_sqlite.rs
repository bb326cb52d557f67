//! Browser history parser for Chrome/Chromium's `History` SQLite database
//! (WebKit-epoch `visits.visit_time`, joined against `urls`).

use async_stream::try_stream;
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;

use crate::core::time::webkit_timestamp_to_utc;
use crate::core::{NormalizedEvent, RawEvent};
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

#[derive(Default)]
pub struct BrowserHistoryParser;

struct VisitRow {
    url: String,
    title: Option<String>,
    visit_time: i64,
    visit_count: i64,
}

fn query_visits(path: &str) -> crate::err::Result<Vec<VisitRow>> {
    let conn = Connection::open(path)?;
    let mut stmt = conn.prepare(
        "SELECT urls.url, urls.title, visits.visit_time, urls.visit_count \
         FROM visits JOIN urls ON visits.url = urls.id \
         ORDER BY visits.visit_time ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(VisitRow {
                url: row.get(0)?,
                title: row.get(1).ok(),
                visit_time: row.get(2)?,
                visit_count: row.get(3).unwrap_or(0),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

fn build_event(row: &VisitRow) -> NormalizedEvent {
    let timestamp = webkit_timestamp_to_utc(row.visit_time);
    let mut event = NormalizedEvent::new("browser_history", timestamp, json!({"url": row.url, "title": row.title}));
    event.category = "web".to_string();
    event.request = Some(row.url.clone());
    event.message = row.title.clone();
    event.set_label("visit_count", row.visit_count.to_string());
    event
}

#[async_trait]
impl Parser for BrowserHistoryParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::BrowserHistory
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        sample.starts_with(b"SQLite format 3\x00")
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["db", "sqlite"]
    }

    /// `raw.body` holds the filesystem path to the sqlite database, not
    /// the database bytes themselves — sqlite requires file-level access,
    /// not a byte stream, so the connector passes the path through.
    fn parse(&self, raw: RawEvent) -> EventStream {
        Box::pin(try_stream! {
            let path = raw.as_str().map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?.trim().to_string();
            let rows = query_visits(&path).map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?;
            for row in rows {
                let mut event = build_event(&row);
                event.data_source = raw.data_source.clone();
                yield event;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_event_from_visit_row() {
        let row = VisitRow {
            url: "https://example.com".to_string(),
            title: Some("Example".to_string()),
            visit_time: 11_644_473_600_000_000,
            visit_count: 3,
        };
        let event = build_event(&row);
        assert_eq!(event.request.as_deref(), Some("https://example.com"));
        assert_eq!(event.timestamp.timestamp(), 0);
    }
}
