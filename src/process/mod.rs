pub mod output;
pub mod runner;

pub use output::{ChannelSink, LogSink, NullSink, OutputLine, OutputSink, PrintSink, Stream};
pub use runner::{ProcessRunner, DEFAULT_GRACE_PERIOD};
