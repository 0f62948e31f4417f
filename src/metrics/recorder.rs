use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::RequestEvent;

/// Entry point for the proxy core: one `record()` per completed request.
///
/// Each destination gets its own bounded queue. A full or closed queue drops
/// the event for that destination only; the caller never waits and never
/// sees an error.
pub struct EventRecorder {
    aggregate_tx: mpsc::Sender<RequestEvent>,
    persist_tx: Option<mpsc::Sender<RequestEvent>>,
    dropped_aggregate: AtomicU64,
    dropped_persist: AtomicU64,
}

/// Receiving halves handed to the background workers.
pub struct RecorderQueues {
    pub aggregate_rx: mpsc::Receiver<RequestEvent>,
    /// `None` when persistence is off; nothing is queued for disk then.
    pub persist_rx: Option<mpsc::Receiver<RequestEvent>>,
}

/// Events discarded because a destination queue was full or closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub aggregate: u64,
    pub persist: u64,
}

impl EventRecorder {
    pub fn new(capacity: usize, persist: bool) -> (Self, RecorderQueues) {
        let (aggregate_tx, aggregate_rx) = mpsc::channel(capacity.max(1));
        let (persist_tx, persist_rx) = if persist {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        (
            Self {
                aggregate_tx,
                persist_tx,
                dropped_aggregate: AtomicU64::new(0),
                dropped_persist: AtomicU64::new(0),
            },
            RecorderQueues {
                aggregate_rx,
                persist_rx,
            },
        )
    }

    /// Hand an event to the aggregator and, when enabled, the log writer.
    pub fn record(&self, event: RequestEvent) {
        match &self.persist_tx {
            Some(persist_tx) => {
                Self::offer(&self.aggregate_tx, event.clone(), &self.dropped_aggregate);
                Self::offer(persist_tx, event, &self.dropped_persist);
            }
            None => Self::offer(&self.aggregate_tx, event, &self.dropped_aggregate),
        }
    }

    fn offer(tx: &mpsc::Sender<RequestEvent>, event: RequestEvent, dropped: &AtomicU64) {
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // one line per 1024 drops keeps a saturated queue from flooding the log
                if n % 1024 == 1 {
                    tracing::warn!(dropped_total = n, "metrics queue unavailable, dropping event");
                }
            }
        }
    }

    pub fn dropped(&self) -> DropCounts {
        DropCounts {
            aggregate: self.dropped_aggregate.load(Ordering::Relaxed),
            persist: self.dropped_persist.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{AggregatorSettings, Granularity, WindowAggregator};
    use std::sync::Arc;

    fn event(ts: i64, status: u16) -> RequestEvent {
        RequestEvent {
            timestamp: ts,
            listen_addr: "L".into(),
            client_ip: "192.0.2.1".into(),
            method: "GET".into(),
            request_url: "/".into(),
            request_path: "/".into(),
            request_host: "h".into(),
            status_code: status,
            upstream: "u".into(),
            route_key: "r".into(),
            latency_ms: 1.0,
            user_agent: String::new(),
            referer: String::new(),
        }
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (recorder, mut queues) = EventRecorder::new(2, true);
        for _ in 0..5 {
            recorder.record(event(0, 200));
        }
        assert_eq!(recorder.dropped(), DropCounts { aggregate: 3, persist: 3 });

        let mut received = 0;
        while queues.aggregate_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[test]
    fn closed_destination_only_affects_itself() {
        let (recorder, queues) = EventRecorder::new(8, true);
        drop(queues.persist_rx);
        recorder.record(event(0, 200));
        assert_eq!(recorder.dropped(), DropCounts { aggregate: 0, persist: 1 });
    }

    #[test]
    fn disabled_persistence_queues_nothing_for_disk() {
        let (recorder, queues) = EventRecorder::new(8, false);
        assert!(queues.persist_rx.is_none());
        recorder.record(event(0, 200));
        assert_eq!(recorder.dropped(), DropCounts::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fifty_producers_ten_thousand_events() {
        let (recorder, mut queues) = EventRecorder::new(16_384, false);
        let recorder = Arc::new(recorder);
        let agg = Arc::new(WindowAggregator::new(AggregatorSettings::default()));

        let consumer = {
            let agg = agg.clone();
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(256);
                let mut seen = 0usize;
                while seen < 10_000 {
                    let n = queues.aggregate_rx.recv_many(&mut buf, 256).await;
                    if n == 0 {
                        break;
                    }
                    agg.record_batch(&buf);
                    seen += n;
                    buf.clear();
                }
            })
        };

        let producers: Vec<_> = (0..50)
            .map(|p| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    for i in 0..200u16 {
                        let status = if (p + i) % 4 == 0 { 503 } else { 200 };
                        recorder.record(event(5_000, status));
                    }
                })
            })
            .collect();
        for p in producers {
            p.await.unwrap();
        }
        consumer.await.unwrap();

        assert_eq!(recorder.dropped().aggregate, 0);
        let rows = agg.rows_in_range("L", Granularity::Second, 5_000, 5_000);
        let row = &rows[&5_000];
        assert_eq!(row.count, 10_000);
        assert_eq!(row.count, row.s2xx + row.s3xx + row.s4xx + row.s5xx + row.s0);
        assert_eq!(row.s5xx, 2_500);
    }
}
