//! Outbound transfer: `Metadata`, then every chunk in ascending index order,
//! then `Complete`.
//!
//! Each chunk is a suspend point. Before a chunk is handed to the channel
//! the sender waits for the channel's send buffer to drain below the high
//! water mark, and an optional fixed pacing delay may follow it.

use crate::core::config::TransferConfig;
use crate::core::connection::PeerChannel;
use crate::core::error::SessionError;
use crate::core::protocol::{FileSource, TransferMessage, WireFrame};
use crate::core::stats::{Direction, StatsTracker, TransferStats};
use crate::utils::sos::SignalOfStop;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of chunks needed for `file_size` bytes, or `None` when the count
/// does not fit the `u32` chunk index.
pub fn total_chunks(file_size: u64, chunk_size: usize) -> Option<u32> {
    u32::try_from(file_size.div_ceil(chunk_size.max(1) as u64)).ok()
}

/// Stream `source` over `channel`. `on_progress` sees one snapshot per chunk
/// plus a final inactive one.
pub(crate) async fn send_file(
    channel: &dyn PeerChannel,
    source: &dyn FileSource,
    config: &TransferConfig,
    stop: &SignalOfStop,
    mut on_progress: impl FnMut(TransferStats),
) -> Result<TransferStats, SessionError> {
    let chunk_size = config.chunk_size.max(1);
    let file_size = source.size();
    let total = total_chunks(file_size, chunk_size).ok_or_else(|| SessionError::TooManyChunks {
        file_name: source.name().to_string(),
        file_size,
        chunk_size,
    })?;
    let mut stats = StatsTracker::new(Direction::Sending, file_size);

    info!(
        event = "send_started",
        file = %source.name(),
        size = file_size,
        chunks = total,
        chunk_size,
        "Sending file"
    );

    let metadata = TransferMessage::Metadata {
        file_name: source.name().to_string(),
        file_size,
        total_chunks: total,
    };
    send_message(channel, &metadata, config, stop).await?;
    on_progress(stats.snapshot());

    for index in 0..total {
        if stop.cancelled() {
            return Err(SessionError::TransferCancelled);
        }

        let start = index as u64 * chunk_size as u64;
        let end = (start + chunk_size as u64).min(file_size);
        let data = stop
            .race(source.read_range(start, end))
            .await
            .ok_or(SessionError::TransferCancelled)?
            .map_err(|e| SessionError::SourceRead(format!("{e:#}")))?;
        let len = data.len() as u64;

        send_message(channel, &TransferMessage::Chunk { index, data }, config, stop).await?;
        on_progress(stats.advance(len));

        match config.chunk_pacing() {
            Some(delay) => {
                stop.race(tokio::time::sleep(delay))
                    .await
                    .ok_or(SessionError::TransferCancelled)?;
            }
            None => tokio::task::yield_now().await,
        }
    }

    send_message(channel, &TransferMessage::Complete, config, stop).await?;
    let done = stats.finish();
    on_progress(done.clone());

    info!(
        event = "send_complete",
        file = %source.name(),
        bytes = done.bytes_transferred,
        speed = done.speed,
        "File sent"
    );
    Ok(done)
}

async fn send_message(
    channel: &dyn PeerChannel,
    msg: &TransferMessage,
    config: &TransferConfig,
    stop: &SignalOfStop,
) -> Result<(), SessionError> {
    let frame = msg.encode(config.wire_format)?;
    wait_for_buffer_space(channel, frame.len(), config, stop).await?;

    match stop.race(channel.send(frame)).await {
        None => Err(SessionError::TransferCancelled),
        Some(Ok(())) => Ok(()),
        Some(Err(e)) if stop.cancelled() => {
            debug!(event = "send_after_cancel", error = %e, "Send failed after cancellation");
            Err(SessionError::TransferCancelled)
        }
        Some(Err(e)) => Err(SessionError::PeerError(format!("{e:#}"))),
    }
}

/// Wait until `buffered_amount + next_len` fits under the high water mark.
///
/// Gives up waiting after `backpressure_max_wait` and proceeds anyway.
async fn wait_for_buffer_space(
    channel: &dyn PeerChannel,
    next_len: usize,
    config: &TransferConfig,
    stop: &SignalOfStop,
) -> Result<(), SessionError> {
    let high = config.buffered_amount_high;
    if channel.buffered_amount().await + next_len <= high {
        return Ok(());
    }

    let buffered = channel.buffered_amount().await;
    debug!(
        event = "backpressure",
        buffered,
        next_msg = next_len,
        high_watermark = high,
        "Applying backpressure - waiting for buffer to drain"
    );

    let deadline = Instant::now() + config.backpressure_max_wait();
    loop {
        if stop.cancelled() {
            return Err(SessionError::TransferCancelled);
        }
        if channel.buffered_amount().await + next_len <= high {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        stop.race(tokio::time::sleep(config.backpressure_poll()))
            .await
            .ok_or(SessionError::TransferCancelled)?;
    }

    let buffered = channel.buffered_amount().await;
    warn!(
        event = "backpressure_timeout",
        buffered,
        "Buffer drain timeout - proceeding anyway"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WireFormat;
    use crate::core::connection::SignalPayload;
    use crate::core::protocol::MemoryFile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every frame. The reported buffered amount halves on every poll.
    #[derive(Default)]
    struct RecordingChannel {
        frames: Mutex<Vec<WireFrame>>,
        buffered: AtomicUsize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl PeerChannel for RecordingChannel {
        async fn accept_signal(&self, _signal: SignalPayload) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, frame: WireFrame) -> anyhow::Result<()> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|n| frames.len() >= n) {
                anyhow::bail!("channel closed");
            }
            frames.push(frame);
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            let b = self.buffered.load(Ordering::SeqCst);
            self.buffered.store(b / 2, Ordering::SeqCst);
            b
        }

        async fn close(&self) {}
    }

    impl RecordingChannel {
        fn decoded(&self) -> Vec<TransferMessage> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| match f {
                    WireFrame::Text(s) => serde_json::from_str(s).unwrap(),
                    WireFrame::Binary(b) => TransferMessage::decode(b).unwrap(),
                })
                .collect()
        }
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0, 16384), Some(0));
        assert_eq!(total_chunks(1, 16384), Some(1));
        assert_eq!(total_chunks(16384, 16384), Some(1));
        assert_eq!(total_chunks(40 * 1024, 16 * 1024), Some(3));
        assert_eq!(total_chunks(u32::MAX as u64, 1), Some(u32::MAX));
        assert_eq!(total_chunks(u32::MAX as u64 + 1, 1), None);
    }

    /// Reports a size far beyond what it can actually serve.
    struct HugeFile;

    #[async_trait]
    impl FileSource for HugeFile {
        fn name(&self) -> &str {
            "huge.iso"
        }

        fn size(&self) -> u64 {
            5 << 30
        }

        async fn read_range(&self, _start: u64, _end: u64) -> anyhow::Result<bytes::Bytes> {
            anyhow::bail!("not readable")
        }
    }

    #[tokio::test]
    async fn test_chunk_count_overflow_is_rejected_before_sending() {
        let channel = RecordingChannel::default();
        let config = TransferConfig {
            chunk_size: 1,
            ..TransferConfig::default()
        };

        let err = send_file(&channel, &HugeFile, &config, &SignalOfStop::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::TooManyChunks {
                file_name: "huge.iso".into(),
                file_size: 5 << 30,
                chunk_size: 1,
            }
        );
        assert!(channel.decoded().is_empty());
    }

    #[tokio::test]
    async fn test_sends_chunks_in_order() {
        let channel = RecordingChannel::default();
        let data: Vec<u8> = (0..40 * 1024).map(|i| (i % 7) as u8).collect();
        let file = MemoryFile::new("abc.bin", data.clone());
        let mut seen = Vec::new();

        let done = send_file(
            &channel,
            &file,
            &TransferConfig::default(),
            &SignalOfStop::new(),
            |s| seen.push(s),
        )
        .await
        .unwrap();

        let msgs = channel.decoded();
        assert_eq!(msgs.len(), 5);
        assert_eq!(
            msgs[0],
            TransferMessage::Metadata {
                file_name: "abc.bin".into(),
                file_size: 40960,
                total_chunks: 3
            }
        );
        let sizes: Vec<(u32, usize)> = msgs[1..4]
            .iter()
            .map(|m| match m {
                TransferMessage::Chunk { index, data } => (*index, data.len()),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![(0, 16384), (1, 16384), (2, 8192)]);
        assert_eq!(msgs[4], TransferMessage::Complete);

        let bytes: Vec<u64> = seen.iter().map(|s| s.bytes_transferred).collect();
        assert_eq!(bytes, vec![0, 16384, 32768, 40960, 40960]);
        assert!(seen.iter().all(|s| s.direction == Direction::Sending));
        assert!(!done.is_active);
        assert_eq!(done.progress, 100.0);
    }

    #[tokio::test]
    async fn test_binary_wire_format() {
        let channel = RecordingChannel::default();
        let file = MemoryFile::new("b.bin", vec![9u8; 10]);
        let config = TransferConfig {
            wire_format: WireFormat::Binary,
            chunk_size: 4,
            ..TransferConfig::default()
        };

        send_file(&channel, &file, &config, &SignalOfStop::new(), |_| {})
            .await
            .unwrap();

        let frames = channel.frames.lock().unwrap().clone();
        assert!(matches!(frames[0], WireFrame::Text(_)));
        assert!(frames[1..4].iter().all(|f| matches!(f, WireFrame::Binary(_))));
        assert!(matches!(frames[4], WireFrame::Text(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_chunk() {
        let channel = RecordingChannel::default();
        let file = MemoryFile::new("c.bin", vec![1u8; 100]);
        let stop = SignalOfStop::new();
        stop.cancel();

        let err = send_file(&channel, &file, &TransferConfig::default(), &stop, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::TransferCancelled);
        assert!(channel.decoded().len() <= 1);
    }

    #[tokio::test]
    async fn test_channel_failure_is_peer_error() {
        let channel = RecordingChannel {
            fail_after: Some(2),
            ..Default::default()
        };
        let file = MemoryFile::new("f.bin", vec![1u8; 64]);
        let config = TransferConfig {
            chunk_size: 16,
            ..TransferConfig::default()
        };

        let err = send_file(&channel, &file, &config, &SignalOfStop::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::PeerError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_waits_for_drain() {
        let channel = RecordingChannel::default();
        channel.buffered.store(4096, Ordering::SeqCst);
        let config = TransferConfig {
            buffered_amount_high: 1024,
            ..TransferConfig::default()
        };

        let started = Instant::now();
        wait_for_buffer_space(&channel, 100, &config, &SignalOfStop::new())
            .await
            .unwrap();
        // 4096 -> 2048 -> 1024 -> 512: drained after a couple of polls.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(channel.buffered.load(Ordering::SeqCst) <= 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_delay_between_chunks() {
        let channel = RecordingChannel::default();
        let file = MemoryFile::new("p.bin", vec![0u8; 30]);
        let config = TransferConfig {
            chunk_size: 10,
            chunk_pacing_ms: 5,
            ..TransferConfig::default()
        };

        let started = Instant::now();
        send_file(&channel, &file, &config, &SignalOfStop::new(), |_| {})
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
