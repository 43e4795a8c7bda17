//! Tracing setup: env filter, stderr fmt layer and an optional append-only
//! file layer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Default filter directives for a `-v` count. `RUST_LOG` wins when set.
///
/// webrtc_ice logs "unknown TransactionID" warnings for late STUN
/// responses, which are normal; they are silenced below trace.
pub fn default_directives(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,peerbeam=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    }
}

/// Install the global subscriber.
pub fn init(verbose: u8, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    let file_layer = log_file.map(FileLogLayer::new).transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn push(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if name == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{name} = {value}"));
        }
    }

    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields.join(", "),
            (false, false) => format!("{} {}", self.message, self.fields.join(", ")),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field.name(), format_args!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field.name(), format_args!("{value}"));
    }
}

// ── File Logging Layer ──────────────────────────────────────────────────────

/// A tracing layer that appends one line per event to a file, with full
/// ISO 8601 local timestamps.
pub struct FileLogLayer {
    writer: Arc<Mutex<File>>,
}

impl FileLogLayer {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(file)),
        })
    }
}

fn format_line(level: Level, target: &str, message: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
    let level_str = match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    };
    if message.is_empty() {
        format!("[{timestamp}] {level_str} {target}\n")
    } else {
        format!("[{timestamp}] {level_str} {target}: {message}\n")
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let line = format_line(*meta.level(), meta.target(), &visitor.finish());
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert!(default_directives(0).contains("peerbeam=info"));
        assert_eq!(default_directives(3), "trace");
        assert_eq!(default_directives(9), "trace");
    }

    #[test]
    fn test_file_layer_writes_lines() {
        let dir = std::env::temp_dir().join(format!("peerbeam-log-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("peerbeam.log");
        let layer = FileLogLayer::new(&path).unwrap();

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(event = "probe", bytes = 3, "hello file");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("INFO"));
        assert!(content.contains("hello file"));
        assert!(content.contains("event = probe"));
        assert!(content.ends_with('\n'));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
