//! Block sources — where the sinker pulls its events from.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};

use crate::cursor::Cursor;
use crate::error::Result;
use crate::types::SinkEvent;

/// An upstream producer of [`SinkEvent`]s.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Open the stream right after `from`. A blank cursor starts from the
    /// beginning.
    async fn open(&self, from: &Cursor) -> Result<BoxStream<'static, Result<SinkEvent>>>;
}

/// Drop the events a consumer resuming at `from` has already seen.
///
/// Everything up to and including the last event whose cursor token matches
/// `from` is skipped. When no token matches, data events are skipped by block
/// number instead, along with undo signals preceding the first kept block.
pub fn resume_after(events: Vec<SinkEvent>, from: &Cursor) -> Vec<SinkEvent> {
    if from.is_blank() {
        return events;
    }

    let by_token = events.iter().rposition(|e| match e {
        SinkEvent::Data(d) => d.cursor == from.token,
        SinkEvent::Undo(u) => u.last_valid_cursor == from.token,
    });
    if let Some(idx) = by_token {
        return events.into_iter().skip(idx + 1).collect();
    }

    let first = events.iter().position(|e| match e {
        SinkEvent::Data(d) => d.clock.number > from.block_number(),
        SinkEvent::Undo(_) => false,
    });
    match first {
        Some(idx) => events.into_iter().skip(idx).collect(),
        None => Vec::new(),
    }
}

/// A fixed list of events, replayed on every `open`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    events: Vec<SinkEvent>,
}

impl MemorySource {
    pub fn new(events: Vec<SinkEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl BlockSource for MemorySource {
    async fn open(&self, from: &Cursor) -> Result<BoxStream<'static, Result<SinkEvent>>> {
        let events = resume_after(self.events.clone(), from);
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockRef, BlockScopedData, BlockUndoSignal, Clock};
    use futures::StreamExt;

    fn data(n: u64) -> SinkEvent {
        SinkEvent::Data(BlockScopedData {
            clock: Clock {
                number: n,
                id: format!("0x{n:02x}"),
                timestamp: None,
            },
            cursor: format!("c{n}"),
            ..Default::default()
        })
    }

    fn numbers(events: &[SinkEvent]) -> Vec<u64> {
        events
            .iter()
            .map(|e| match e {
                SinkEvent::Data(d) => d.clock.number,
                SinkEvent::Undo(u) => u.last_valid_block.number,
            })
            .collect()
    }

    #[test]
    fn resume_by_token() {
        let events = vec![
            data(1),
            data(2),
            data(3),
            SinkEvent::Undo(BlockUndoSignal {
                last_valid_block: BlockRef::new(2, "0x02"),
                last_valid_cursor: "c2".into(),
            }),
            data(3),
        ];
        let from = Cursor::new("c2", BlockRef::new(2, "0x02"));
        assert_eq!(numbers(&resume_after(events, &from)), vec![3]);
    }

    #[test]
    fn resume_by_block_number() {
        let events = vec![data(1), data(2), data(3)];
        let from = Cursor::new("unknown", BlockRef::new(1, ""));
        assert_eq!(numbers(&resume_after(events, &from)), vec![2, 3]);
    }

    #[tokio::test]
    async fn memory_source_replays() {
        let source = MemorySource::new(vec![data(1), data(2)]);
        let all: Vec<_> = source.open(&Cursor::blank()).await.unwrap().collect().await;
        assert_eq!(all.len(), 2);
    }
}
