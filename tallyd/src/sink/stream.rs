//! The stream sink: pipe each snapshot to a child process as text lines.
//!
//! Line format is `<prefix><name>[.<suffix>]|<value>|<unix_ts>`, one line per
//! emitted statistic, which is what the classic statsd ecosystem of shell and
//! script consumers expects on stdin.

use std::io::{self, BufWriter, Write};
use std::ops::ControlFlow;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tally_util::to_percentile;
use tracing::debug;

use crate::config::{DaemonConfig, StreamSinkConfig};
use crate::registry::{MetricValue, Registry};

use super::{Sink, SinkError};

pub struct StreamSink {
    config: StreamSinkConfig,
    global: Arc<DaemonConfig>,
}

impl StreamSink {
    pub fn new(config: StreamSinkConfig, global: Arc<DaemonConfig>) -> StreamSink {
        StreamSink { config, global }
    }

    fn write_snapshot(
        &self,
        out: &mut impl Write,
        snapshot: &Registry,
        ts: u64,
    ) -> io::Result<()> {
        let mut result = Ok(());
        snapshot.iter(|name, value| {
            match write_metric(out, &self.global, name, &value, ts) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    result = Err(e);
                    ControlFlow::Break(())
                }
            }
        });
        result
    }
}

impl Sink for StreamSink {
    fn name(&self) -> &str {
        "stream"
    }

    fn flush(&self, snapshot: &Registry, now: SystemTime) -> Result<(), SinkError> {
        let ts = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        debug!(command = %self.config.command, metrics = snapshot.num_metrics(), "streaming snapshot");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.config.command)
            .stdin(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let mut writer = BufWriter::new(stdin);
        let written = self.write_snapshot(&mut writer, snapshot, ts).and_then(|()| writer.flush());
        // Dropping the writer closes the pipe so the child sees EOF.
        drop(writer);

        let status = child.wait()?;
        written?;
        if !status.success() {
            return Err(SinkError::Command { command: self.config.command.clone(), status });
        }
        Ok(())
    }
}

fn write_metric(
    out: &mut impl Write,
    config: &DaemonConfig,
    name: &str,
    value: &MetricValue<'_>,
    ts: u64,
) -> io::Result<()> {
    let prefix = config.prefixes.for_kind(value.kind());

    match value {
        MetricValue::KeyVal(v) => {
            writeln!(out, "{prefix}{name}|{v:.6}|{ts}")?;
        }

        MetricValue::Gauge(g) => {
            writeln!(out, "{prefix}{name}|{:.6}|{ts}", g.value())?;
            writeln!(out, "{prefix}{name}.sum|{:.6}|{ts}", g.sum())?;
            writeln!(out, "{prefix}{name}.mean|{:.6}|{ts}", g.mean())?;
            writeln!(out, "{prefix}{name}.min|{:.6}|{ts}", g.min())?;
            writeln!(out, "{prefix}{name}.max|{:.6}|{ts}", g.max())?;
        }

        MetricValue::GaugeDirect(g) => {
            writeln!(out, "{prefix}{name}|{:.6}|{ts}", g.value())?;
        }

        MetricValue::Counter(c) => {
            if config.extended_counters {
                writeln!(out, "{prefix}{name}.count|{}|{ts}", c.count())?;
                writeln!(out, "{prefix}{name}.mean|{:.6}|{ts}", c.mean())?;
                writeln!(out, "{prefix}{name}.sum|{:.6}|{ts}", c.sum())?;
                writeln!(out, "{prefix}{name}.lower|{:.6}|{ts}", c.min())?;
                writeln!(out, "{prefix}{name}.upper|{:.6}|{ts}", c.max())?;
                writeln!(
                    out,
                    "{prefix}{name}.rate|{:.6}|{ts}",
                    c.sum() / config.flush_interval_secs()
                )?;
            } else {
                writeln!(out, "{prefix}{name}|{:.6}|{ts}", c.sum())?;
            }
        }

        MetricValue::Set(s) => {
            writeln!(out, "{prefix}{name}|{}|{ts}", s.size())?;
        }

        MetricValue::Timer(t) => {
            writeln!(out, "{prefix}{name}.mean|{:.6}|{ts}", t.mean())?;
            writeln!(out, "{prefix}{name}.lower|{:.6}|{ts}", t.min())?;
            writeln!(out, "{prefix}{name}.upper|{:.6}|{ts}", t.max())?;
            writeln!(out, "{prefix}{name}.count|{}|{ts}", t.count())?;

            for &q in &config.quantiles {
                if q == 0.5 {
                    writeln!(out, "{prefix}{name}.median|{:.6}|{ts}", t.query(0.5))?;
                }
                let Ok(percentile) = to_percentile(q) else {
                    continue;
                };
                writeln!(out, "{prefix}{name}.p{percentile}|{:.6}|{ts}", t.query(q))?;
            }

            let interval = config.flush_interval_secs();
            writeln!(out, "{prefix}{name}.rate|{:.6}|{ts}", t.sum() / interval)?;
            writeln!(
                out,
                "{prefix}{name}.sample_rate|{:.6}|{ts}",
                t.count() as f64 / interval
            )?;

            if let Some(hist) = t.histogram() {
                let layout = hist.config();
                writeln!(
                    out,
                    "{prefix}{name}.histogram.bin_<{:.2}|{}|{ts}",
                    layout.min_val(),
                    hist.underflow()
                )?;
                for (bound, count) in hist.interior() {
                    writeln!(out, "{prefix}{name}.histogram.bin_{bound:.2}|{count}|{ts}")?;
                }
                writeln!(
                    out,
                    "{prefix}{name}.histogram.bin_>{:.2}|{}|{ts}",
                    layout.max_val(),
                    hist.overflow()
                )?;
            }
        }
    }

    Ok(())
}
