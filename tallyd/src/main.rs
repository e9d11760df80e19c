use std::io::Read;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tallyd::config::{DaemonConfig, HttpSinkConfig, SinkConfig, StreamSinkConfig};
use tallyd::conn::{self, LineBuffer, DEFAULT_MAX_LINE};
use tallyd::flush::{Pipeline, Sinks};
use tallyd::sink;

#[derive(Debug, Parser)]
#[command(name = "tallyd", about = "A statsd-compatible metrics aggregation daemon.")]
struct Args {
    /// Address to listen on for TCP and UDP ingest.
    #[arg(long, default_value = "127.0.0.1:8125")]
    bind: String,

    /// Seconds between flushes.
    #[arg(long, default_value_t = 10.0)]
    flush_interval: f64,

    /// Emit count/mean/sum/lower/upper/rate for counters instead of the sum.
    #[arg(long)]
    extended_counters: bool,

    /// Shell command to stream flushed metrics to.
    #[arg(long)]
    stream_cmd: Option<String>,

    /// URL to POST flushed metric batches to.
    #[arg(long)]
    http_url: Option<String>,

    /// Count every received sample under this metric name.
    #[arg(long)]
    input_counter: Option<String>,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let mut config = DaemonConfig::default();
    config.flush_interval = Duration::from_secs_f64(args.flush_interval.max(0.0));
    config.extended_counters = args.extended_counters;
    config.input_counter = args.input_counter;
    if let Some(command) = args.stream_cmd {
        config.sinks.push(SinkConfig::Stream(StreamSinkConfig { command }));
    }
    if let Some(post_url) = args.http_url {
        config.sinks.push(SinkConfig::Http(HttpSinkConfig { post_url, ..HttpSinkConfig::default() }));
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }
    let config = Arc::new(config);

    let sinks: Sinks = match sink::build_sinks(&config) {
        Ok(sinks) => Arc::new(sinks),
        Err(e) => {
            error!(error = %e, "failed to build sinks");
            std::process::exit(1);
        }
    };

    let pipeline = Arc::new(Pipeline::new(Arc::clone(&config)));

    // Flush timer.
    {
        let pipeline = Arc::clone(&pipeline);
        let sinks = Arc::clone(&sinks);
        let interval = config.flush_interval;
        thread::spawn(move || loop {
            thread::sleep(interval);
            pipeline.flush_tick(&sinks);
        });
    }

    // UDP ingest: each datagram is one or more newline-separated lines.
    match UdpSocket::bind(&args.bind) {
        Ok(socket) => {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || udp_loop(&socket, &pipeline));
        }
        Err(e) => warn!(addr = %args.bind, error = %e, "failed to bind UDP socket"),
    }

    // TCP ingest.
    let listener = match TcpListener::bind(&args.bind) {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %args.bind, error = %e, "failed to bind TCP listener");
            std::process::exit(1);
        }
    };
    info!(addr = %args.bind, "listening");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || handle_conn(stream, &pipeline));
            }
            Err(e) => {
                error!(error = %e, "accept failed, shutting down");
                break;
            }
        }
    }

    pipeline.final_flush(&sinks);
}

fn handle_conn(mut stream: TcpStream, pipeline: &Pipeline) {
    let peer = stream.peer_addr().ok();
    let mut buffer = LineBuffer::new(DEFAULT_MAX_LINE);
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.feed(&chunk[..n]);
                if let Err(e) = conn::handle_lines(&mut buffer, pipeline) {
                    warn!(?peer, error = %e, "closing connection");
                    break;
                }
            }
            Err(e) => {
                debug!(?peer, error = %e, "read failed");
                break;
            }
        }
    }
}

fn udp_loop(socket: &UdpSocket, pipeline: &Pipeline) {
    let mut datagram = [0u8; 65536];
    loop {
        match socket.recv(&mut datagram) {
            Ok(n) => {
                let mut buffer = LineBuffer::new(DEFAULT_MAX_LINE);
                buffer.feed(&datagram[..n]);
                if datagram[..n].last() != Some(&b'\n') {
                    buffer.feed(b"\n");
                }
                if let Err(e) = conn::handle_lines(&mut buffer, pipeline) {
                    warn!(error = %e, "discarding datagram");
                }
            }
            Err(e) => {
                error!(error = %e, "UDP receive failed");
                return;
            }
        }
    }
}
