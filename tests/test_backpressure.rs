//! Backpressure between the feed reader and the publisher
//!
//! - A burst no larger than the queue capacity is never dropped
//! - A broker outage spools, throttles the reader above high-water and
//!   releases it below low-water

#[cfg(test)]
mod backpressure_tests {
    use pitwall::feed_core::{FeedConfig, FeedReader, ReplayTransport};
    use pitwall::pipeline::types::utc_from_millis;
    use pitwall::pipeline::TelemetryEvent;
    use pitwall::publisher::{
        partition_for, EventPublisher, FlowControl, MemoryEventLog, PublisherConfig,
    };
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, watch};
    use tokio::time::Duration;

    fn config(dir: &TempDir, channel_buffer: usize) -> PublisherConfig {
        PublisherConfig {
            channel_buffer,
            publish_batch: 4,
            linger_ms: 5,
            retries: 2,
            backoff_initial_ms: 1,
            backoff_max_ms: 2,
            spool_path: dir.path().join("spool/events.jsonl").to_string_lossy().into_owned(),
            spool_high_water: 5,
            spool_low_water: 2,
        }
    }

    fn event(car: &str, ts: u64) -> TelemetryEvent {
        TelemetryEvent::new("s1", car, "rpm", "11000", ts, utc_from_millis(ts as i64))
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_burst_within_capacity_is_not_dropped() {
        let dir = TempDir::new().unwrap();
        let capacity = 500;
        let log = Arc::new(MemoryEventLog::new("t", 4));
        let publisher = EventPublisher::new(
            log.clone(),
            config(&dir, capacity),
            Arc::new(FlowControl::new(5, 2)),
        )
        .unwrap();

        // The whole burst fits in the queue before the publisher runs
        let (tx, rx) = mpsc::channel(capacity);
        let cars = ["1", "11", "16", "44", "55"];
        for ts in 0..(capacity / cars.len()) as u64 {
            for car in cars {
                tx.try_send(event(car, ts)).unwrap();
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(publisher.run(rx, shutdown_rx));
        wait_for("burst published", || log.total_events() == capacity).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(log.total_events(), capacity);
        for car in cars {
            let stamps: Vec<u64> = log
                .events(partition_for(car, 4))
                .iter()
                .filter(|e| e.car_number == car)
                .map(|e| e.timestamp_monotonic)
                .collect();
            assert_eq!(stamps, (0..100).collect::<Vec<u64>>());
        }
    }

    #[tokio::test]
    async fn test_outage_throttles_reader_until_spool_drains() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(MemoryEventLog::new("t", 2));
        log.set_available(false);

        let flow = Arc::new(FlowControl::new(5, 2));
        let publisher = EventPublisher::new(log.clone(), config(&dir, 8), flow.clone()).unwrap();
        let publisher_stats = publisher.stats();

        let frames: Vec<String> = (1..=40u64)
            .map(|ts| serde_json::to_string(&event(if ts % 2 == 0 { "44" } else { "16" }, ts)).unwrap())
            .collect();
        let feed_config = FeedConfig::from_lookup(&HashMap::<&str, &str>::new()).unwrap();
        let reader = FeedReader::new(
            ReplayTransport::new(frames).with_pace(Duration::from_millis(2)),
            &feed_config,
            flow.clone(),
        );
        let feed_stats = reader.stats();

        let (event_tx, event_rx) = mpsc::channel(8);
        let (signal_tx, _signal_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let publishing = tokio::spawn(publisher.run(event_rx, shutdown_rx.clone()));
        let reading = tokio::spawn(reader.run(event_tx, signal_tx, shutdown_rx));

        wait_for("throttle engaged", || flow.is_throttled()).await;
        wait_for("reader held back", || feed_stats.snapshot().throttle_waits >= 1).await;
        assert!(feed_stats.snapshot().events_forwarded < 40);
        assert_eq!(log.total_events(), 0);

        log.set_available(true);
        wait_for("throttle released", || !flow.is_throttled()).await;
        wait_for("all events published", || log.total_events() == 40).await;

        shutdown_tx.send(true).unwrap();
        reading.await.unwrap();
        publishing.await.unwrap().unwrap();

        let stats = publisher_stats.snapshot();
        assert!(stats.events_spooled > 0);
        assert_eq!(stats.events_unspooled, stats.events_spooled);
        assert_eq!(stats.spool_depth, 0);
        assert!(flow.activations() >= 1);

        // Per-car order survives the spool round trip
        for car in ["16", "44"] {
            let stamps: Vec<u64> = log
                .events(partition_for(car, 2))
                .iter()
                .filter(|e| e.car_number == car)
                .map(|e| e.timestamp_monotonic)
                .collect();
            let mut sorted = stamps.clone();
            sorted.sort_unstable();
            assert_eq!(stamps, sorted);
            assert_eq!(stamps.len(), 20);
        }
    }
}
