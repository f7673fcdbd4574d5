//! JSON-lines event replay.
//!
//! One [`SinkEvent`] per line, tagged by `type`:
//! ```json
//! {"type":"data","clock":{"number":1,"id":"0x01"},"finalBlockHeight":0,"cursor":"c1","output":{"name":"db_out","mapOutput":{"typeUrl":"...","value":"7b..."}}}
//! {"type":"undo","lastValidBlock":{"number":1,"id":"0x01"},"lastValidCursor":"c1"}
//! ```
//! Blank lines and lines starting with `#` are skipped.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use tracing::debug;

use chainsink_core::error::{Result, SinkError};
use chainsink_core::stream::{resume_after, BlockSource};
use chainsink_core::{Cursor, SinkEvent};

/// Replays events recorded in a JSON-lines file, resuming after the cursor
/// the sink was prepared with.
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Parse every event of a JSON-lines document.
pub fn parse_events(content: &str) -> Result<Vec<SinkEvent>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| SinkError::Decode(format!("line {}: {e}", i + 1)))
        })
        .collect()
}

#[async_trait]
impl BlockSource for JsonLinesSource {
    async fn open(&self, from: &Cursor) -> Result<BoxStream<'static, Result<SinkEvent>>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SinkError::Decode(format!("read {}: {e}", self.path.display())))?;

        let events = parse_events(&content)?;
        let total = events.len();
        let events = resume_after(events, from);
        debug!(
            path = %self.path.display(),
            total,
            replayed = events.len(),
            "events loaded"
        );
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsink_core::BlockRef;

    const EVENTS: &str = r#"
# two blocks and an undo
{"type":"data","clock":{"number":1,"id":"0x01"},"cursor":"c1","output":{"name":"db_out"}}
{"type":"data","clock":{"number":2,"id":"0x02"},"cursor":"c2","output":{"name":"db_out"}}

{"type":"undo","lastValidBlock":{"number":1,"id":"0x01"},"lastValidCursor":"c1"}
"#;

    #[test]
    fn parses_tagged_events() {
        let events = parse_events(EVENTS).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SinkEvent::Data(d) if d.clock.number == 1));
        assert!(matches!(&events[2], SinkEvent::Undo(u) if u.last_valid_block.number == 1));
    }

    #[test]
    fn demo_file_decodes() {
        let events = parse_events(include_str!("../../demos/transfers.jsonl")).unwrap();
        assert_eq!(events.len(), 6);
        for event in &events {
            if let SinkEvent::Data(data) = event {
                let changes = data.output.database_changes().unwrap().unwrap();
                assert!(!changes.table_changes.is_empty());
            }
        }
    }

    #[test]
    fn reports_bad_line_number() {
        let err = parse_events("\n{\"type\":\"nope\"}").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn resumes_after_cursor() {
        let path = std::env::temp_dir().join(format!("chainsink-source-{}.jsonl", std::process::id()));
        tokio::fs::write(&path, EVENTS).await.unwrap();

        let source = JsonLinesSource::new(&path);
        let by_token: Vec<_> = source
            .open(&Cursor::new("c2", BlockRef::new(2, "0x02")))
            .await
            .unwrap()
            .collect()
            .await;
        let by_number: Vec<_> = source
            .open(&Cursor::new("unknown", BlockRef::new(1, "0x01")))
            .await
            .unwrap()
            .collect()
            .await;
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(by_token.len(), 1);
        assert!(matches!(&by_token[0], Ok(SinkEvent::Undo(_))));
        assert_eq!(by_number.len(), 2);
        assert!(matches!(&by_number[0], Ok(SinkEvent::Data(d)) if d.cursor == "c2"));
    }
}
