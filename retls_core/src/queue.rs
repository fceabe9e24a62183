//! The consuming view of a [`crate::RecordLog`] used during replay.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::{payload, Error, Record, Timestamp, TIME};

/// Replay state: the records not yet consumed plus the session time.
///
/// Records of different tags are served independently; within one tag they are served in
/// log order. Session time only moves when a `time` record is consumed.
#[derive(Debug, Default)]
pub struct ReplayQueue {
    records: VecDeque<Record>,
    now: Timestamp,
}

impl ReplayQueue {
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: records.into_iter().collect(),
            now: Timestamp::default(),
        }
    }

    /// Take the next record with `tag`, returning its payload.
    ///
    /// Records at the head of the queue are handled first: a `time` record is consumed and
    /// advances the session time (a request for `time` is then answered with an empty
    /// payload), and a key-log record is discarded. Otherwise the first record with exactly
    /// `tag` is removed and returned, leaving every other record where it was.
    pub fn fetch(&mut self, tag: &str) -> Result<Bytes, Error> {
        while let Some(head) = self.records.front().filter(|r| r.is_side_channel()) {
            if head.tag == TIME {
                self.now = payload::decode_time(&head.payload)?;
                self.records.pop_front();
                if tag == TIME {
                    tracing::trace!(now = %self.now, "fetch time");
                    return Ok(Bytes::new());
                }
            } else {
                self.records.pop_front();
            }
        }

        let Some(index) = self.records.iter().position(|r| r.tag == tag) else {
            tracing::debug!(tag, remaining = self.records.len(), "data exhausted");
            return Err(Error::DataExhausted {
                tag: tag.to_owned(),
            });
        };
        let record = self
            .records
            .remove(index)
            .ok_or_else(|| Error::DataExhausted {
                tag: tag.to_owned(),
            })?;
        if record.tag == TIME {
            self.now = payload::decode_time(&record.payload)?;
        }
        tracing::trace!(tag, index, len = record.payload.len(), "fetch");
        Ok(record.payload)
    }

    /// Returns `true` if a record tagged `blocker` is still queued ahead of the next record
    /// tagged `tag`.
    ///
    /// Always `false` when no record tagged `tag` remains, so that lookup fails instead of
    /// waiting.
    pub fn is_behind(&self, tag: &str, blocker: &str) -> bool {
        let Some(index) = self.records.iter().position(|r| r.tag == tag) else {
            return false;
        };
        self.records.iter().take(index).any(|r| r.tag == blocker)
    }

    /// The time carried by the most recently consumed `time` record.
    pub fn session_time(&self) -> Timestamp {
        self.now
    }

    /// Number of records not yet consumed.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The unconsumed records in log order.
    pub fn remaining(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }
}

impl From<crate::RecordLog> for ReplayQueue {
    fn from(log: crate::RecordLog) -> Self {
        log.into_queue()
    }
}
