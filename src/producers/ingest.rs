//! Newline-framed text ingest
//!
//! Reads lines from a serial port, stdin or any other buffered reader and
//! publishes each non-empty line on the generic-payload channel. Lines longer
//! than the payload capacity are cut to fit.

use crate::bus::Bus;
use crate::observability::metrics;
use crate::protocol::{GenericPayload, GENERIC_PAYLOAD_CAPACITY};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Publishes text lines as generic payloads
pub struct LineIngest<R> {
    bus: Arc<Bus>,
    reader: R,
    publish_timeout: Duration,
}

impl<R: AsyncBufRead + Unpin + Send> LineIngest<R> {
    pub fn new(bus: Arc<Bus>, reader: R, publish_timeout: Duration) -> Self {
        Self {
            bus,
            reader,
            publish_timeout,
        }
    }

    /// Read until end of input or shutdown; returns the number of lines published
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<usize> {
        let mut published = 0;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                read = self.reader.read_until(b'\n', &mut buf) => read?,
                _ = shutdown.changed() => break,
            };
            if read == 0 {
                debug!(published, "Ingest reached end of input");
                break;
            }

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }

            if line.len() > GENERIC_PAYLOAD_CAPACITY {
                warn!(
                    len = line.len(),
                    capacity = GENERIC_PAYLOAD_CAPACITY,
                    "Line too long, truncating"
                );
            }
            let payload = GenericPayload::truncated(line);

            match self
                .bus
                .generic_payload
                .publish(payload, self.publish_timeout)
                .await
            {
                Ok(()) => published += 1,
                Err(e) => {
                    metrics().bus_publish_timeout();
                    warn!(error = %e, "Dropping ingested line");
                }
            }
        }

        info!(published, "Line ingest stopped");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelId, Observer};

    const T: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_lines_are_published_and_blank_lines_skipped() {
        let bus = Arc::new(Bus::standard().unwrap());
        let mut transport = bus.subscribe(Observer::Transport).unwrap();
        let (_tx, rx) = watch::channel(false);

        let input: &[u8] = b"hello\r\n\n  \nworld";
        let ingest = LineIngest::new(Arc::clone(&bus), input, T);
        let published = ingest.run(rx).await.unwrap();
        assert_eq!(published, 3);

        for _ in 0..3 {
            assert_eq!(transport.wait(Some(T)).await, Ok(ChannelId::GenericPayload));
        }
        let latest = transport.read(&bus.generic_payload, T).await.unwrap();
        assert_eq!(latest.as_str(), "world");
    }

    #[tokio::test]
    async fn test_long_line_is_truncated() {
        let bus = Arc::new(Bus::standard().unwrap());
        let transport = bus.subscribe(Observer::Transport).unwrap();
        let (_tx, rx) = watch::channel(false);

        let line = "x".repeat(GENERIC_PAYLOAD_CAPACITY + 50);
        let input = format!("{line}\n").into_bytes();
        LineIngest::new(Arc::clone(&bus), input.as_slice(), T)
            .run(rx)
            .await
            .unwrap();

        let payload = transport.read(&bus.generic_payload, T).await.unwrap();
        assert_eq!(payload.len(), GENERIC_PAYLOAD_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_drops_line_and_continues() {
        let bus = Arc::new(Bus::new(crate::bus::Topology::standard(), 1).unwrap());
        let _transport = bus.subscribe(Observer::Transport).unwrap();
        let (_tx, rx) = watch::channel(false);

        let input: &[u8] = b"one\ntwo\nthree\n";
        let published = LineIngest::new(Arc::clone(&bus), input, Duration::from_secs(1))
            .run(rx)
            .await
            .unwrap();
        assert_eq!(published, 1);
    }
}
