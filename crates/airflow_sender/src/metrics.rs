//! Last-value mass-flow gauge and its Prometheus scrape endpoint.
//!
//! The sampler thread is the only writer; the HTTP server only reads. The
//! value lives in an `AtomicU64` as raw `f64` bits, so neither side locks.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use airflow_core::config::MetricsConfig;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const GAUGE_HELP: &str = "Current Air flow.";

/// Back-off after an accept error that is not tied to one connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Process-wide last mass-flow value. `NaN` until the first sample.
#[derive(Debug, Clone)]
pub struct FlowGauge(Arc<AtomicU64>);

impl FlowGauge {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(f64::NAN.to_bits())))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.0.load(Ordering::Relaxed));
        (!value.is_nan()).then_some(value)
    }
}

impl Default for FlowGauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Fully qualified gauge name.
fn metric_name(config: &MetricsConfig) -> String {
    match config.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}_{}", config.gauge_name),
        _ => config.gauge_name.clone(),
    }
}

/// Renders the gauge in Prometheus text exposition format.
///
/// Before the first sample only the HELP/TYPE header is emitted.
pub fn format_gauge(name: &str, value: Option<f64>) -> String {
    let mut output = format!("# HELP {name} {GAUGE_HELP}\n# TYPE {name} gauge\n");
    if let Some(v) = value {
        output.push_str(&format!("{name} {v}\n"));
    }
    output
}

/// HTTP server exposing the gauge.
pub struct MetricsServer {
    listener: TcpListener,
    metrics_path: String,
    name: String,
    gauge: FlowGauge,
}

impl MetricsServer {
    /// Binds the listen address. Must be called inside a tokio runtime.
    pub async fn bind(config: &MetricsConfig, gauge: FlowGauge) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!(
            "Metrics at http://{}{}",
            listener.local_addr()?,
            config.metrics_path
        );
        Ok(Self {
            listener,
            metrics_path: config.metrics_path.clone(),
            name: metric_name(config),
            gauge,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves requests forever. Accept errors are logged and retried.
    pub async fn run(self) {
        let route = Arc::new(Route {
            metrics_path: self.metrics_path,
            name: self.name,
            gauge: self.gauge,
        });

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    let pause = accept_pause(&e);
                    if pause.is_zero() {
                        debug!("Metrics accept failed: {e}");
                    } else {
                        warn!("Metrics accept failed: {e}; retrying in {pause:?}");
                        tokio::time::sleep(pause).await;
                    }
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let route = route.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let route = route.clone();
                    async move { Ok::<_, Infallible>(route.handle(req.uri().path())) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Metrics connection from {peer} failed: {e}");
                }
            });
        }
    }
}

/// How long to wait after a failed `accept`.
///
/// Errors that only concern the connection being accepted are retried at
/// once; anything else (ex: out of file descriptors) backs off.
fn accept_pause(e: &std::io::Error) -> Duration {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted => {
            Duration::ZERO
        }
        _ => ACCEPT_BACKOFF,
    }
}

struct Route {
    metrics_path: String,
    name: String,
    gauge: FlowGauge,
}

impl Route {
    fn handle(&self, path: &str) -> Response<Full<Bytes>> {
        if path == self.metrics_path {
            let body = format_gauge(&self.name, self.gauge.get());
            text_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        } else if path == "/health" || path == "/healthz" {
            text_response(StatusCode::OK, "text/plain", "OK".into())
        } else {
            debug!("Metrics: unknown path {path}");
            text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".into())
        }
    }
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn gauge_starts_empty_and_keeps_last_value() {
        let gauge = FlowGauge::new();
        assert_eq!(gauge.get(), None);
        gauge.set(118.3);
        gauge.set(117.9);
        assert_eq!(gauge.get(), Some(117.9));
    }

    #[test]
    fn gauge_clones_share_the_cell() {
        let writer = FlowGauge::new();
        let reader = writer.clone();
        writer.set(42.0);
        assert_eq!(reader.get(), Some(42.0));
    }

    #[test]
    fn format_includes_help_type_and_value() {
        let output = format_gauge("trailer_air_flow", Some(118.3));
        assert_eq!(
            output,
            "# HELP trailer_air_flow Current Air flow.\n\
             # TYPE trailer_air_flow gauge\n\
             trailer_air_flow 118.3\n"
        );
    }

    #[test]
    fn format_without_sample_has_no_value_line() {
        let output = format_gauge("trailer_air_flow", None);
        assert!(output.contains("# TYPE trailer_air_flow gauge"));
        assert!(!output.contains("trailer_air_flow 0"));
        assert_eq!(output.lines().count(), 2);
    }

    #[test]
    fn namespace_prefixes_name() {
        let config = MetricsConfig {
            namespace: Some("lab".into()),
            ..Default::default()
        };
        assert_eq!(metric_name(&config), "lab_trailer_air_flow");
        assert_eq!(metric_name(&MetricsConfig::default()), "trailer_air_flow");
    }

    #[test]
    fn routes_by_path() {
        let gauge = FlowGauge::new();
        gauge.set(1.5);
        let route = Route {
            metrics_path: "/metrics".into(),
            name: "trailer_air_flow".into(),
            gauge,
        };
        assert_eq!(route.handle("/metrics").status(), StatusCode::OK);
        assert_eq!(route.handle("/healthz").status(), StatusCode::OK);
        assert_eq!(route.handle("/nope").status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn accept_errors_never_end_the_server() {
        use std::io::{Error, ErrorKind};
        assert_eq!(accept_pause(&Error::from(ErrorKind::ConnectionAborted)), Duration::ZERO);
        assert_eq!(accept_pause(&Error::from(ErrorKind::ConnectionReset)), Duration::ZERO);
        // EMFILE surfaces as an uncategorized OS error
        assert_eq!(accept_pause(&Error::from_raw_os_error(24)), ACCEPT_BACKOFF);
        assert_eq!(accept_pause(&Error::other("boom")), ACCEPT_BACKOFF);
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_current_value_over_http() {
        let config = MetricsConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..Default::default()
        };
        let gauge = FlowGauge::new();
        let server = MetricsServer::bind(&config, gauge.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        gauge.set(118.3);
        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("trailer_air_flow 118.3\n"));

        let response = get(addr, "/other").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        // A client that disconnects without a request does not stop the server
        drop(tokio::net::TcpStream::connect(addr).await.unwrap());
        let response = get(addr, "/healthz").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    }
}
