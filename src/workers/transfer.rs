//! `send` / `receive` flows driving a [`ConnectionManager`] from the terminal.
//!
//! Signals travel as compact tokens: each side prints its own token on
//! stdout and reads the remote one from stdin.

use anyhow::{anyhow, bail, Context, Result};
use peerbeam::core::events::AbandonedTransfer;
use peerbeam::utils::format::{format_file_size, format_speed};
use peerbeam::utils::path::sanitize_relative_path;
use peerbeam::utils::sos::SignalOfStop;
use peerbeam::{
    ConnectionManager, ConnectionState, DiskFile, EventStream, FileSource, ReceivedFile,
    SessionConfig, SessionEvent, SignalPayload, TransferStats,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// How long the sender lingers after the last chunk for the receiver to
/// hang up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn send(config: SessionConfig, file: PathBuf, session: Option<String>, sos: SignalOfStop) -> Result<()> {
    let manager = ConnectionManager::webrtc(config);
    let result = run_send(&manager, &file, session, &sos).await;
    manager.disconnect().await;
    result
}

pub async fn receive(config: SessionConfig, output: PathBuf, session: Option<String>, sos: SignalOfStop) -> Result<()> {
    let manager = ConnectionManager::webrtc(config);
    let result = run_receive(&manager, &output, session, &sos).await;
    manager.disconnect().await;
    result
}

async fn run_send(
    manager: &ConnectionManager,
    file: &Path,
    session: Option<String>,
    sos: &SignalOfStop,
) -> Result<()> {
    let source = DiskFile::open(file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    let session_id = session.unwrap_or_else(random_session_id);
    let mut events = manager.subscribe();

    let offer = cancellable(sos, manager.create_session(&session_id)).await??;
    print_token("offer", &session_id, &offer)?;

    let answer = read_token(sos, "answer").await?;
    manager.accept_signal(answer).await?;

    cancellable(sos, wait_connected(&mut events)).await??;
    eprintln!(
        "Connected. Sending {} ({})",
        source.name(),
        format_file_size(source.size())
    );

    let reporter = spawn_progress_reporter(manager.subscribe());
    let result = cancellable(sos, manager.send_file(&source)).await;
    reporter.abort();
    let stats = result?.context("sending file")?;

    eprintln!("\nSent {} at {}", format_file_size(stats.total_bytes), format_speed(stats.speed));
    // Close only once the receiver has hung up, so buffered chunks are not
    // cut off.
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, wait_disconnected(&mut events));
    if sos.race(drained).await.is_none() {
        info!(event = "send_interrupted", "Interrupted while waiting for receiver");
    }
    Ok(())
}

async fn run_receive(
    manager: &ConnectionManager,
    output: &Path,
    session: Option<String>,
    sos: &SignalOfStop,
) -> Result<()> {
    let session_id = session.unwrap_or_else(random_session_id);
    let mut events = manager.subscribe();

    manager.join_session(&session_id).await?;
    let offer = read_token(sos, "offer").await?;
    manager.accept_signal(offer).await?;

    let answer = cancellable(sos, manager.local_signal()).await??;
    print_token("answer", &session_id, &answer)?;

    let file = cancellable(sos, wait_for_file(&mut events)).await??;
    let path = write_received(output, &file).await?;
    eprintln!("\nSaved {} ({})", path.display(), format_file_size(file.data.len() as u64));
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn random_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

async fn cancellable<F: std::future::Future>(sos: &SignalOfStop, fut: F) -> Result<F::Output> {
    sos.race(fut).await.ok_or_else(|| anyhow!("interrupted"))
}

fn print_token(kind: &str, session_id: &str, signal: &SignalPayload) -> Result<()> {
    let token = signal.to_token().context("encoding signal token")?;
    eprintln!("Session {session_id}: share this {kind} token with the other side:");
    println!("{token}");
    Ok(())
}

async fn read_token(sos: &SignalOfStop, kind: &str) -> Result<SignalPayload> {
    eprintln!("Paste the {kind} token and press Enter:");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = cancellable(sos, lines.next_line())
            .await?
            .context("reading stdin")?
            .ok_or_else(|| anyhow!("stdin closed before a {kind} token arrived"))?;
        if line.trim().is_empty() {
            continue;
        }
        return Ok(SignalPayload::from_token(&line)?);
    }
}

async fn wait_connected(events: &mut EventStream) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PeerConnected(_) => return Ok(()),
            SessionEvent::Error(e) if e.is_connection_level() => return Err(e.into()),
            SessionEvent::StateChanged(info) if info.connection_state == ConnectionState::Failed => {
                bail!("connection failed")
            }
            _ => {}
        }
    }
    bail!("session closed")
}

async fn wait_disconnected(events: &mut EventStream) {
    while let Some(event) = events.recv().await {
        if let SessionEvent::PeerDisconnected(_) = event {
            return;
        }
        if let SessionEvent::StateChanged(info) = event {
            if info.connection_state != ConnectionState::Connected {
                return;
            }
        }
    }
}

async fn wait_for_file(events: &mut EventStream) -> Result<ReceivedFile> {
    let mut last_percent = None;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PeerConnected(_) => eprintln!("Connected. Waiting for file..."),
            SessionEvent::TransferProgress(stats) => print_progress(&stats, &mut last_percent),
            SessionEvent::FileReceived(file) => return Ok(file),
            SessionEvent::TransferAbandoned(AbandonedTransfer {
                file_name, reason, ..
            }) => {
                warn!(event = "transfer_abandoned", file = %file_name, ?reason, "Transfer abandoned");
            }
            SessionEvent::Error(e) if e.is_connection_level() => return Err(e.into()),
            SessionEvent::Error(e) => warn!(event = "transfer_error", error = %e, "Transfer error"),
            SessionEvent::PeerDisconnected(_) => bail!("peer disconnected before the file arrived"),
            SessionEvent::StateChanged(info) if info.connection_state == ConnectionState::Failed => {
                bail!("connection failed")
            }
            _ => {}
        }
    }
    bail!("session closed")
}

async fn write_received(output: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    let path = output.join(sanitize_relative_path(&file.file_name));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(&path, &file.data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn spawn_progress_reporter(mut events: EventStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_percent = None;
        while let Some(event) = events.recv().await {
            if let SessionEvent::TransferProgress(stats) = event {
                print_progress(&stats, &mut last_percent);
            }
        }
    })
}

fn print_progress(stats: &TransferStats, last_percent: &mut Option<u64>) {
    let percent = stats.progress.floor() as u64;
    if *last_percent == Some(percent) {
        return;
    }
    *last_percent = Some(percent);
    eprint!(
        "\r{:>3}%  {} / {}  {}",
        percent,
        format_file_size(stats.bytes_transferred),
        format_file_size(stats.total_bytes),
        format_speed(stats.speed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use peerbeam::{LoopbackNetwork, MemoryFile};
    use std::sync::Arc;

    fn loopback_manager(net: &LoopbackNetwork) -> ConnectionManager {
        ConnectionManager::new(Arc::new(net.clone()), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_write_received_stays_inside_output() {
        let dir = std::env::temp_dir().join(format!("peerbeam-recv-{}", uuid::Uuid::new_v4()));
        let file = ReceivedFile {
            file_name: "../../escape/notes.txt".into(),
            data: Bytes::from_static(b"hi"),
        };

        let path = write_received(&dir, &file).await.unwrap();
        assert_eq!(path, dir.join("escape").join("notes.txt"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hi");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_random_session_id() {
        let a = random_session_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, random_session_id());
    }

    #[tokio::test]
    async fn test_send_stops_when_cancelled() {
        let dir = std::env::temp_dir().join(format!("peerbeam-send-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let file = dir.join("payload.bin");
        tokio::fs::write(&file, b"payload").await.unwrap();

        let net = LoopbackNetwork::new();
        let manager = loopback_manager(&net);
        let sos = SignalOfStop::new();
        sos.cancel();

        let err = run_send(&manager, &file, Some("s".into()), &sos).await.unwrap_err();
        assert_eq!(err.to_string(), "interrupted");
        manager.disconnect().await;
        assert_eq!(manager.connection_info().await.connection_state, ConnectionState::Disconnected);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_receive_stops_when_cancelled() {
        let net = LoopbackNetwork::new();
        let manager = loopback_manager(&net);
        let sos = SignalOfStop::new();
        sos.cancel();

        let output = std::env::temp_dir().join(format!("peerbeam-out-{}", uuid::Uuid::new_v4()));
        let err = run_receive(&manager, &output, Some("r".into()), &sos).await.unwrap_err();
        assert_eq!(err.to_string(), "interrupted");
        assert_eq!(manager.connection_info().await.connection_state, ConnectionState::Connecting);
        manager.disconnect().await;
        assert_eq!(net.live_peers(), 0);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_waiting_for_file_is_interrupted_by_stop() {
        let net = LoopbackNetwork::new();
        let a = loopback_manager(&net);
        let b = loopback_manager(&net);
        let mut events = b.subscribe();

        let offer = a.create_session("w").await.unwrap();
        b.join_session("w").await.unwrap();
        b.accept_signal(offer).await.unwrap();
        a.accept_signal(b.local_signal().await.unwrap()).await.unwrap();

        let sos = SignalOfStop::new();
        let stopper = sos.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });

        let err = cancellable(&sos, wait_for_file(&mut events)).await.unwrap_err();
        assert_eq!(err.to_string(), "interrupted");
    }

    #[tokio::test]
    async fn test_wait_for_file_returns_delivered_file() {
        let net = LoopbackNetwork::new();
        let a = loopback_manager(&net);
        let b = loopback_manager(&net);
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        let offer = a.create_session("f").await.unwrap();
        b.join_session("f").await.unwrap();
        b.accept_signal(offer).await.unwrap();
        a.accept_signal(b.local_signal().await.unwrap()).await.unwrap();
        wait_connected(&mut a_events).await.unwrap();

        a.send_file(&MemoryFile::new("note.txt", b"hello".to_vec())).await.unwrap();
        let file = cancellable(&SignalOfStop::new(), wait_for_file(&mut b_events))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.file_name, "note.txt");
        assert_eq!(&file.data[..], b"hello");
    }
}
