use crate::cache::PendingOutbound;
use crate::error::SyncResult;
use crate::worker::CacheWriter;
use parley_proto::{now_millis, Envelope};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
    pub remaining: usize,
}

/// Durable queue of live-channel envelopes that could not be delivered yet
/// or have not been acknowledged.
///
/// Every transmission counts against the record's retry budget; a record
/// stays until the server acks its correlation id or the budget runs out.
#[derive(Clone)]
pub struct OutboundTracker {
    writer: CacheWriter,
    max_retries: u32,
}

impl OutboundTracker {
    pub fn new(writer: CacheWriter, max_retries: u32) -> Self {
        Self {
            writer,
            max_retries,
        }
    }

    pub async fn enqueue(&self, thread_id: Option<i64>, envelope: &Envelope) -> SyncResult<u64> {
        let payload = envelope.to_text()?;
        let kind = envelope.kind.clone();
        let correlation = envelope.message_id.clone().unwrap_or_default();
        let id = self
            .writer
            .write(move |cache| {
                Ok(cache.enqueue_outbound(thread_id, &kind, payload, correlation, now_millis())?)
            })
            .await?;
        metrics::gauge!("parley_outbox_depth", self.pending().len() as f64);
        debug!(target = "parley::outbox", id, "queued envelope for later delivery");
        Ok(id)
    }

    /// Replays queued envelopes through `send`. Stops at the first envelope
    /// `send` refuses, which means the channel went away mid-flush.
    pub async fn flush<F>(&self, mut send: F) -> SyncResult<FlushReport>
    where
        F: FnMut(&str) -> bool,
    {
        let records = self.pending();
        let mut report = FlushReport::default();
        let mut stopped = false;
        for record in records {
            if stopped {
                report.remaining += 1;
                continue;
            }
            if record.retry_count >= self.max_retries {
                warn!(
                    target = "parley::outbox",
                    correlation_id = %record.correlation_id,
                    retries = record.retry_count,
                    "dropping envelope that exceeded its retry budget"
                );
                let id = record.id;
                self.writer
                    .write(move |cache| Ok(cache.delete_outbound(id)?))
                    .await?;
                report.dropped += 1;
                metrics::counter!("parley_outbox_dropped_total", 1);
                continue;
            }
            if !send(&record.payload) {
                warn!(target = "parley::outbox", "channel closed during flush");
                stopped = true;
                report.remaining += 1;
                continue;
            }
            let id = record.id;
            self.writer
                .write(move |cache| Ok(cache.bump_outbound_retry(id)?))
                .await?;
            report.sent += 1;
            report.remaining += 1;
        }
        if report.sent > 0 || report.dropped > 0 {
            info!(
                target = "parley::outbox",
                sent = report.sent,
                dropped = report.dropped,
                "flushed outbox"
            );
        }
        metrics::gauge!("parley_outbox_depth", report.remaining as f64);
        Ok(report)
    }

    /// Removes the record matching an `ack`. Unknown ids are ignored.
    pub async fn acknowledge(&self, correlation_id: &str) -> SyncResult<bool> {
        let correlation = correlation_id.to_string();
        let removed = self
            .writer
            .write(move |cache| Ok(cache.delete_outbound_by_correlation(&correlation)?))
            .await?;
        if removed {
            debug!(target = "parley::outbox", correlation_id, "envelope acknowledged");
        }
        Ok(removed)
    }

    pub fn pending(&self) -> Vec<PendingOutbound> {
        self.writer.cache().outbound()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use parley_proto::OutboundKind;
    use serde_json::json;

    fn tracker() -> OutboundTracker {
        OutboundTracker::new(CacheWriter::spawn(MemoryCache::new()), 3)
    }

    #[tokio::test]
    async fn flush_sends_and_keeps_until_ack() {
        let tracker = tracker();
        let envelope = Envelope::outbound(OutboundKind::Chat, Some(json!({"content": "hi"})));
        tracker.enqueue(Some(1), &envelope).await.unwrap();

        let mut sent = Vec::new();
        let report = tracker
            .flush(|payload| {
                sent.push(payload.to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(sent.len(), 1);
        assert_eq!(Envelope::from_text(&sent[0]).unwrap(), envelope);
        assert_eq!(tracker.pending()[0].retry_count, 1);

        let correlation = envelope.message_id.clone().unwrap();
        assert!(tracker.acknowledge(&correlation).await.unwrap());
        assert!(tracker.pending().is_empty());
    }

    #[tokio::test]
    async fn records_over_budget_are_dropped() {
        let tracker = tracker();
        let envelope = Envelope::outbound(OutboundKind::Chat, None);
        tracker.enqueue(None, &envelope).await.unwrap();
        for _ in 0..3 {
            tracker.flush(|_| true).await.unwrap();
        }
        let report = tracker.flush(|_| true).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.sent, 0);
        assert!(tracker.pending().is_empty());
    }

    #[tokio::test]
    async fn refused_send_stops_flush_without_spending_budget() {
        let tracker = tracker();
        tracker
            .enqueue(None, &Envelope::outbound(OutboundKind::Chat, None))
            .await
            .unwrap();
        tracker
            .enqueue(None, &Envelope::outbound(OutboundKind::Chat, None))
            .await
            .unwrap();
        let report = tracker.flush(|_| false).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.remaining, 2);
        assert!(tracker.pending().iter().all(|r| r.retry_count == 0));
    }
}
