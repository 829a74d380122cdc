use http_body_util::Full;
use hyper::{Request, Response, body::Bytes, service::service_fn};
use hyper_util::rt::TokioIo;
use owo_colors::OwoColorize;
use prometheus::{HistogramVec, IntCounterVec, TextEncoder};

/// Per-controller reconcile instrumentation. Metric names are prefixed by
/// the controller so all three controllers can register side by side.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = prometheus::register_int_counter_vec!(
            format!("drsyncer_{controller}_reconciles_total"),
            "Total number of reconcile invocations",
            &["name", "namespace"]
        )
        .expect("register reconcile counter");
        let action_counter = prometheus::register_int_counter_vec!(
            format!("drsyncer_{controller}_actions_total"),
            "Reconcile actions by outcome",
            &["name", "namespace", "action"]
        )
        .expect("register action counter");
        let read_histogram = prometheus::register_histogram_vec!(
            format!("drsyncer_{controller}_read_phase_seconds"),
            "Duration of the read phase of reconciliation",
            &["name", "namespace", "action"]
        )
        .expect("register read histogram");
        let write_histogram = prometheus::register_histogram_vec!(
            format!("drsyncer_{controller}_write_phase_seconds"),
            "Duration of the write phase of reconciliation",
            &["name", "namespace", "action"]
        )
        .expect("register write histogram");
        Self {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

async fn render(_req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let families = prometheus::gather();
    let body = TextEncoder::new()
        .encode_to_string(&families)
        .unwrap_or_default();
    Ok(Response::new(Full::new(Bytes::from(body))))
}

/// Serves the default prometheus registry on `/metrics` (and every other
/// path; the scrape config decides what to hit).
pub async fn serve(port: u16) {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", format!("metrics listener bind failed: {e}").red());
            return;
        }
    };
    println!("{}", format!("📈 Serving metrics on :{port}").green());
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("{}", format!("metrics accept failed: {e}").red());
                continue;
            }
        };
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_fn(render))
                .await
            {
                eprintln!("{}", format!("metrics connection error: {e}").red());
            }
        });
    }
}
