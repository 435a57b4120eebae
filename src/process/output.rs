use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Receives child output one line at a time, per stream in order.
pub trait OutputSink: Send + Sync {
    fn write_line(&self, service: &str, stream: Stream, line: &str);
}

/// Discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_line(&self, _service: &str, _stream: Stream, _line: &str) {}
}

/// Forwards lines to the `log` facade with the service name as target.
pub struct LogSink;

impl OutputSink for LogSink {
    fn write_line(&self, service: &str, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => log::info!(target: "kubevisor::child", "{}   | {}", service, line),
            Stream::Stderr => log::warn!(target: "kubevisor::child", "{}   | {}", service, line),
        }
    }
}

/// Prints `service   | line` to stdout.
pub struct PrintSink;

impl OutputSink for PrintSink {
    fn write_line(&self, service: &str, _stream: Stream, line: &str) {
        println!("{}   | {}", service, line);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub service: String,
    pub stream: Stream,
    pub line: String,
}

/// Pushes lines into a channel; a dropped receiver silently discards output.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutputLine>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutputLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn write_line(&self, service: &str, stream: Stream, line: &str) {
        let _ = self.tx.send(OutputLine {
            service: service.to_string(),
            stream,
            line: line.to_string(),
        });
    }
}
