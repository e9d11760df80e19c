//! The HTTP sink: batch snapshots into JSON and POST them.
//!
//! Serialization happens on the flush thread; delivery happens on a small
//! pool of worker threads fed by a bounded LIFO queue, so a slow or down
//! endpoint sheds the stalest batches instead of blocking the flush path.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest::blocking::Client;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use tally_util::{to_percentile, LifoQueue};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{BuildError, DaemonConfig, HttpSinkConfig};
use crate::elide::ElideMap;
use crate::registry::{MetricValue, Registry};

use super::{Sink, SinkError};

/// Member cap per JSON object; one HTTP request carries about this many metrics.
const MAX_BODY_OBJECTS: usize = 10_000;

/// Pause after a failed send or token exchange.
const FAILURE_WAIT: Duration = Duration::from_secs(5);

/// Elide entries idle longer than this are garbage collected.
const ELIDE_GC_WINDOW: Duration = Duration::from_secs(15 * 60);

const USER_AGENT: &str = "tallyd-http/0";
const OAUTH2_GRANT: &str = "grant_type=client_credentials";

/// The characters curl leaves bare when escaping form values.
const FORM_ENCODE: &AsciiSet =
    &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

struct QueueEntry {
    body: Vec<u8>,
    not_before: u64,
}

struct SinkState {
    bearer: Option<Arc<str>>,
    elide: Option<ElideMap>,
}

struct HttpShared {
    config: HttpSinkConfig,
    global: Arc<DaemonConfig>,
    queue: LifoQueue<QueueEntry>,
    state: Mutex<SinkState>,
}

pub struct HttpSink {
    shared: Arc<HttpShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl HttpSink {
    /// Builds the sink and starts its worker pool.
    pub fn spawn(config: HttpSinkConfig, global: Arc<DaemonConfig>) -> Result<HttpSink, BuildError> {
        let elide = (config.elide_interval > 0).then(|| {
            let skip = rand::rng().random_range(0..config.elide_interval);
            info!(skip, interval = config.elide_interval, "eliding repeated zero-valued metrics");
            ElideMap::new(skip)
        });

        info!(capacity = config.max_buffer_size, "HTTP sink queue capacity");
        let shared = Arc::new(HttpShared {
            queue: LifoQueue::new(config.max_buffer_size),
            state: Mutex::new(SinkState { bearer: None, elide }),
            global,
            config,
        });

        let mut workers = Vec::with_capacity(shared.config.workers);
        for worker_num in 0..shared.config.workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("tallyd-http-{worker_num}"))
                .spawn(move || worker_loop(&shared, worker_num))?;
            workers.push(handle);
        }

        Ok(HttpSink { shared, workers: Mutex::new(workers) })
    }
}

impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    fn flush(&self, snapshot: &Registry, now: SystemTime) -> Result<(), SinkError> {
        let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        // The sink mutex covers only the elision state; it is released before
        // any payload hits the queue.
        let objects = {
            let mut state = self.shared.state.lock();
            if let Some(elide) = state.elide.as_mut() {
                let removed = elide.gc(now_secs.saturating_sub(ELIDE_GC_WINDOW.as_secs()));
                if removed > 0 {
                    debug!(removed, "dropped stale elide entries");
                }
            }
            build_objects(
                &self.shared.config,
                &self.shared.global,
                &mut state.elide,
                snapshot,
                now_secs,
                MAX_BODY_OBJECTS,
            )
        };

        // Smear the batch over [0, send_backoff_ms) so a fleet of daemons
        // flushing in lockstep does not burst the endpoint.
        let not_before = if self.shared.config.send_backoff_ms > 0 {
            let backoff =
                rand::rng().random::<f64>() * self.shared.config.send_backoff_ms as f64 / 1000.0;
            now_secs + backoff as u64
        } else {
            0
        };

        let timestamp =
            DateTime::<Local>::from(now).format(&self.shared.config.timestamp_format).to_string();

        for object in objects {
            if object.is_empty() {
                continue;
            }
            let json = serde_json::to_string(&Value::Object(object))?;
            let body = encode_body(&self.shared.config, &json, &timestamp);
            let size = body.len();

            let entry = QueueEntry { body: body.into_bytes(), not_before };
            if let Err(e) = self.shared.queue.push(entry, size, true, false) {
                error!(bytes = size, error = %e, "failed to enqueue metrics payload");
            }
        }

        Ok(())
    }

    fn close(&self) {
        self.shared.queue.close();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("HTTP worker panicked");
            }
        }
        info!("HTTP sink closed");
    }
}

/// Walks the snapshot into a list of JSON objects, each capped at
/// `max_objects` members.
fn build_objects(
    config: &HttpSinkConfig,
    global: &DaemonConfig,
    elide: &mut Option<ElideMap>,
    snapshot: &Registry,
    now: u64,
    max_objects: usize,
) -> Vec<Map<String, Value>> {
    let mut objects = vec![Map::new()];

    snapshot.iter(|name, value| {
        if objects.last().is_some_and(|object| object.len() >= max_objects) {
            objects.push(Map::new());
        }
        let object = objects.last_mut().expect("seeded with one object");
        add_metric(object, config, global, elide, name, &value, now);
        ControlFlow::Continue(())
    });

    objects
}

fn add_metric(
    object: &mut Map<String, Value>,
    config: &HttpSinkConfig,
    global: &DaemonConfig,
    elide: &mut Option<ElideMap>,
    name: &str,
    value: &MetricValue<'_>,
    now: u64,
) {
    let prefix = global.prefixes.for_kind(value.kind());
    let full_name = format!("{prefix}{name}");
    let interval = config.elide_interval;

    match value {
        MetricValue::GaugeDirect(g) => {
            if elided(elide, interval, &full_name, g.value(), now) {
                return;
            }
            object.insert(full_name, number(g.value()));
        }

        MetricValue::Gauge(g) => {
            if elided(elide, interval, &full_name, g.sum(), now) {
                return;
            }
            object.insert(format!("{full_name}.sum"), number(g.sum()));
            object.insert(format!("{full_name}.mean"), number(g.mean()));
            object.insert(format!("{full_name}.min"), number(g.min()));
            object.insert(format!("{full_name}.max"), number(g.max()));
            object.insert(full_name, number(g.value()));
        }

        MetricValue::Counter(c) => {
            if elided(elide, interval, &full_name, c.sum(), now) {
                return;
            }
            if global.extended_counters {
                object.insert(format!("{full_name}.count"), Value::from(c.count()));
                object.insert(format!("{full_name}.mean"), number(c.mean()));
                object.insert(format!("{full_name}.sum"), number(c.sum()));
                object.insert(format!("{full_name}.lower"), number(c.min()));
                object.insert(format!("{full_name}.upper"), number(c.max()));
                object.insert(
                    format!("{full_name}.rate"),
                    number(c.sum() / global.flush_interval_secs()),
                );
            } else {
                object.insert(full_name, number(c.sum()));
            }
        }

        MetricValue::Set(s) => {
            object.insert(full_name, Value::from(s.size()));
        }

        MetricValue::Timer(t) => {
            if elided(elide, interval, &full_name, t.mean(), now) {
                return;
            }
            object.insert(format!("{full_name}.mean"), number(t.mean()));
            object.insert(format!("{full_name}.lower"), number(t.min()));
            object.insert(format!("{full_name}.upper"), number(t.max()));
            object.insert(format!("{full_name}.count"), Value::from(t.count()));

            for &q in &global.quantiles {
                let Ok(percentile) = to_percentile(q) else {
                    continue;
                };
                object.insert(format!("{full_name}.p{percentile}"), number(t.query(q)));
            }

            let flush_secs = global.flush_interval_secs();
            object.insert(format!("{full_name}.rate"), number(t.sum() / flush_secs));
            object.insert(
                format!("{full_name}.sample_rate"),
                number(t.count() as f64 / flush_secs),
            );

            if let Some(hist) = t.histogram() {
                let layout = hist.config();
                object.insert(
                    format!("{full_name}.bin_<{:.2}", layout.min_val()),
                    Value::from(hist.underflow()),
                );
                for (bound, count) in hist.interior() {
                    object.insert(format!("{full_name}.bin_{bound:.2}"), Value::from(count));
                }
                object.insert(
                    format!("{full_name}.bin_>{:.2}", layout.max_val()),
                    Value::from(hist.overflow()),
                );
            }
        }

        // Key/value samples are a stream-sink passthrough.
        MetricValue::KeyVal(_) => {}
    }
}

/// Applies the elision policy; `true` means skip the whole metric group.
fn elided(elide: &mut Option<ElideMap>, interval: u32, full_name: &str, value: f64, now: u64) -> bool {
    let Some(map) = elide.as_mut() else {
        return false;
    };
    if value == 0.0 {
        map.mark(full_name, now) % interval != map.skip()
    } else {
        map.unmark(full_name, now);
        false
    }
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn form_encode(value: &str) -> String {
    utf8_percent_encode(value, FORM_ENCODE).to_string()
}

/// Builds the `application/x-www-form-urlencoded` request body.
fn encode_body(config: &HttpSinkConfig, json: &str, timestamp: &str) -> String {
    let mut body = format!("{}={}", config.metrics_name, form_encode(json));
    body.push('&');
    body.push_str(&format!("{}={}", config.timestamp_name, form_encode(timestamp)));
    for (key, value) in &config.params {
        body.push('&');
        body.push_str(&format!("{}={}", key, form_encode(value)));
    }
    body
}

#[derive(Debug, Error)]
enum AuthError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint returned {0}")]
    Status(StatusCode),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Runs the OAuth2 client-credentials exchange and stores the new bearer.
///
/// Called without the sink mutex held; if several workers race here, the last
/// token written wins and the extras are simply discarded by the endpoint.
fn fetch_bearer(client: &Client, shared: &HttpShared) -> Result<Arc<str>, AuthError> {
    let oauth = shared.config.oauth.as_ref().expect("caller checked oauth is configured");

    let response = client
        .post(&oauth.token_url)
        .basic_auth(&oauth.key, Some(&oauth.secret))
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(OAUTH2_GRANT)
        .send()?;

    if response.status() != StatusCode::OK {
        return Err(AuthError::Status(response.status()));
    }

    let token: TokenResponse = response.json()?;
    let bearer: Arc<str> = token.access_token.into();
    shared.state.lock().bearer = Some(Arc::clone(&bearer));
    info!("obtained OAuth2 bearer token");
    Ok(bearer)
}

fn requeue(shared: &HttpShared, entry: QueueEntry, size: usize, worker_num: usize) {
    if let Err(e) = shared.queue.push(entry, size, true, true) {
        error!(worker = worker_num, error = %e, "dropped metrics payload after failed send");
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn worker_loop(shared: &Arc<HttpShared>, worker_num: usize) {
    let client = match Client::builder()
        .timeout(shared.config.timeout)
        .user_agent(USER_AGENT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(worker = worker_num, error = %e, "failed to build HTTP client");
            return;
        }
    };
    let should_authenticate = shared.config.oauth.is_some();

    info!(worker = worker_num, "starting HTTP worker");
    loop {
        let Ok((entry, size)) = shared.queue.get() else {
            break;
        };

        // Honor the batch's backoff, in one-second slices so shutdown is not
        // held up behind a long delay.
        if !shared.queue.is_closed() {
            let mut delay = entry.not_before.saturating_sub(unix_now());
            if delay > 0 {
                debug!(worker = worker_num, delay, "delaying send");
            }
            while delay > 0 {
                if shared.queue.is_closed() {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
                delay -= 1;
            }
            thread::sleep(Duration::from_secs_f64(rand::rng().random::<f64>() * 0.5));
        }

        // Capture the bearer up front so a failure only clears the token this
        // request actually used, not one a faster worker refreshed meanwhile.
        let last_bearer = shared.state.lock().bearer.clone();
        let bearer = if should_authenticate {
            match last_bearer.clone() {
                Some(bearer) => Some(bearer),
                None => match fetch_bearer(&client, shared) {
                    Ok(bearer) => Some(bearer),
                    Err(e) => {
                        error!(worker = worker_num, error = %e, "OAuth2 token exchange failed");
                        thread::sleep(FAILURE_WAIT);
                        requeue(shared, entry, size, worker_num);
                        continue;
                    }
                },
            }
        } else {
            None
        };

        let mut request = client
            .post(&shared.config.post_url)
            .header(CONNECTION, "close")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(entry.body.clone());
        if let Some(bearer) = &bearer {
            request = request.bearer_auth(bearer);
        }

        debug!(worker = worker_num, bytes = size, url = %shared.config.post_url, "sending metrics");
        match request.send() {
            Ok(response) if response.status() == StatusCode::OK => {
                debug!(worker = worker_num, "delivered metrics payload");
            }
            outcome => {
                match outcome {
                    Ok(response) => {
                        let status = response.status();
                        let body = response.text().unwrap_or_default();
                        error!(worker = worker_num, %status, body, "metrics endpoint rejected payload");
                    }
                    Err(e) => error!(worker = worker_num, error = %e, "metrics POST failed"),
                }

                requeue(shared, entry, size, worker_num);

                let mut state = shared.state.lock();
                if let (Some(current), Some(last)) = (state.bearer.as_ref(), last_bearer.as_ref()) {
                    if Arc::ptr_eq(current, last) {
                        info!(worker = worker_num, "clearing OAuth2 bearer token");
                        state.bearer = None;
                    }
                }
                drop(state);

                thread::sleep(FAILURE_WAIT);
            }
        }
    }

    debug!(worker = worker_num, "HTTP worker exiting");
}
