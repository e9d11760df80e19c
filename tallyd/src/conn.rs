//! The connection handler: drains buffered bytes into parsed samples.
//!
//! The network layer owns the sockets; it hands this module a buffered view
//! of the stream. The contract is deliberately small: peek to see whether
//! anything is buffered, extract the next full line if there is one.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::warn;

use crate::flush::Pipeline;
use crate::parser::{self, MetricKind, Parsed};

/// Default cap on a single line; a peer that never sends a newline is framed
/// out rather than buffered forever.
pub const DEFAULT_MAX_LINE: usize = 8192;

/// Unrecoverable framing failure; the caller should drop the connection.
#[derive(Debug, Error, PartialEq)]
pub enum FramingError {
    /// The peer sent more than `max` bytes without a newline.
    #[error("line exceeds the {max} byte limit")]
    LineTooLong { max: usize },
}

/// Buffered view of one ingest stream.
pub trait ConnStream {
    /// Peeks at the next buffered byte without consuming it.
    fn peek_byte(&mut self) -> Option<u8>;

    /// Extracts the next complete line, without its newline. `Ok(None)` means
    /// more bytes are needed.
    fn extract_line(&mut self) -> Result<Option<Vec<u8>>, FramingError>;
}

/// A [`ConnStream`] over appended byte chunks.
pub struct LineBuffer {
    buf: VecDeque<u8>,
    max_line: usize,
}

impl LineBuffer {
    /// Creates an empty buffer with the given line-length cap.
    pub fn new(max_line: usize) -> LineBuffer {
        LineBuffer { buf: VecDeque::new(), max_line }
    }

    /// Appends bytes received from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl ConnStream for LineBuffer {
    fn peek_byte(&mut self) -> Option<u8> {
        self.buf.front().copied()
    }

    fn extract_line(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let mut line: Vec<u8> = self.buf.drain(..=idx).collect();
                line.pop();
                Ok(Some(line))
            }
            None => {
                if self.buf.len() > self.max_line {
                    return Err(FramingError::LineTooLong { max: self.max_line });
                }
                Ok(None)
            }
        }
    }
}

/// Drains every complete line from `stream`, routing samples into `pipeline`.
///
/// Returns once the buffer is empty or holds only a partial line; the caller
/// re-polls after the next read. A line that fails to parse is logged and
/// skipped and the connection stays up. Only a framing failure propagates.
pub fn handle_lines(stream: &mut impl ConnStream, pipeline: &Pipeline) -> Result<(), FramingError> {
    loop {
        if stream.peek_byte().is_none() {
            return Ok(());
        }
        let Some(line) = stream.extract_line()? else {
            return Ok(());
        };

        match parser::parse_line(&line) {
            Ok(parsed) => {
                if let Some(input_counter) = pipeline.config().input_counter.as_deref() {
                    let _ = pipeline.add_sample(MetricKind::Counter, input_counter, 1.0, 1.0);
                }
                match parsed {
                    Parsed::Sample { kind, name, value, rate } => {
                        if let Err(e) = pipeline.add_sample(kind, &name, value, rate) {
                            warn!(metric = %name, error = %e, "rejected sample");
                        }
                    }
                    Parsed::SetElement { name, element } => {
                        pipeline.set_update(&name, &element);
                    }
                }
            }
            Err(e) => {
                warn!(
                    line = %String::from_utf8_lossy(&line),
                    error = %e,
                    "failed to parse metric line"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    use super::{handle_lines, ConnStream, FramingError, LineBuffer};
    use crate::config::DaemonConfig;
    use crate::flush::{Pipeline, Sinks};
    use crate::registry::{MetricValue, Registry};
    use crate::sink::{Sink, SinkError};

    /// Captures each snapshot's counter sums and set sizes.
    #[derive(Default)]
    struct ProbeSink {
        counters: Mutex<Vec<(String, u64, f64)>>,
        sets: Mutex<Vec<(String, u64)>>,
    }

    impl Sink for ProbeSink {
        fn name(&self) -> &str {
            "probe"
        }

        fn flush(&self, snapshot: &Registry, _now: SystemTime) -> Result<(), SinkError> {
            snapshot.iter(|name, value| {
                match value {
                    MetricValue::Counter(c) => self
                        .counters
                        .lock()
                        .unwrap()
                        .push((name.to_string(), c.count(), c.sum())),
                    MetricValue::Set(s) => {
                        self.sets.lock().unwrap().push((name.to_string(), s.size()))
                    }
                    _ => {}
                }
                ControlFlow::Continue(())
            });
            Ok(())
        }
    }

    fn drained(pipeline: &Pipeline, probe: Arc<ProbeSink>) -> Arc<ProbeSink> {
        struct Shared(Arc<ProbeSink>);
        impl Sink for Shared {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn flush(&self, snapshot: &Registry, now: SystemTime) -> Result<(), SinkError> {
                self.0.flush(snapshot, now)
            }
        }
        let sinks: Sinks = Arc::new(vec![Box::new(Shared(Arc::clone(&probe))) as Box<dyn Sink>]);
        pipeline.final_flush(&sinks);
        probe
    }

    #[test]
    fn lines_are_routed_and_bad_ones_skipped() {
        let pipeline = Pipeline::new(Arc::new(DaemonConfig::default()));
        let mut buffer = LineBuffer::new(super::DEFAULT_MAX_LINE);

        buffer.feed(b"a:1|c\nnot a metric\na:2|c|@0.5\nu:alice|s\nu:bob|s\n");
        handle_lines(&mut buffer, &pipeline).expect("no framing error");
        assert!(buffer.is_empty());

        let probe = drained(&pipeline, Arc::new(ProbeSink::default()));
        let counters = probe.counters.lock().unwrap();
        assert_eq!(&*counters, &[("a".to_string(), 2, 5.0)]);
        let sets = probe.sets.lock().unwrap();
        assert_eq!(&*sets, &[("u".to_string(), 2)]);
    }

    #[test]
    fn input_counter_counts_parsed_lines() {
        let mut config = DaemonConfig::default();
        config.input_counter = Some("tallyd.input".to_string());
        let pipeline = Pipeline::new(Arc::new(config));
        let mut buffer = LineBuffer::new(super::DEFAULT_MAX_LINE);

        buffer.feed(b"a:1|c\nbogus\nb:2|c\n");
        handle_lines(&mut buffer, &pipeline).expect("no framing error");

        let probe = drained(&pipeline, Arc::new(ProbeSink::default()));
        let counters = probe.counters.lock().unwrap();
        let input = counters.iter().find(|(name, _, _)| name == "tallyd.input");
        // Two lines parsed; the bogus one is not counted.
        assert_eq!(input, Some(&("tallyd.input".to_string(), 2, 2.0)));
    }

    #[test]
    fn rejected_timer_sample_keeps_the_connection() {
        let pipeline = Pipeline::new(Arc::new(DaemonConfig::default()));
        let mut buffer = LineBuffer::new(super::DEFAULT_MAX_LINE);

        buffer.feed(b"t:nan|ms\na:1|c\n");
        handle_lines(&mut buffer, &pipeline).expect("no framing error");

        let probe = drained(&pipeline, Arc::new(ProbeSink::default()));
        let counters = probe.counters.lock().unwrap();
        assert_eq!(&*counters, &[("a".to_string(), 1, 1.0)]);
    }

    #[test]
    fn partial_lines_wait_for_more_bytes() {
        let mut buffer = LineBuffer::new(64);
        buffer.feed(b"a:1|c\nb:2");

        assert_eq!(buffer.extract_line().unwrap(), Some(b"a:1|c".to_vec()));
        assert_eq!(buffer.extract_line().unwrap(), None);

        buffer.feed(b"|c\n");
        assert_eq!(buffer.extract_line().unwrap(), Some(b"b:2|c".to_vec()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn overlong_line_is_a_framing_error() {
        let mut buffer = LineBuffer::new(8);
        buffer.feed(b"waaaaaaaay-too-long");
        assert_eq!(buffer.extract_line(), Err(FramingError::LineTooLong { max: 8 }));
    }

    #[test]
    fn complete_line_at_the_cap_still_extracts() {
        let mut buffer = LineBuffer::new(8);
        buffer.feed(b"abcdefghij\n");
        assert_eq!(buffer.extract_line().unwrap(), Some(b"abcdefghij".to_vec()));
    }
}
