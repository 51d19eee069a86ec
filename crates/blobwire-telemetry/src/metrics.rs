//! Prometheus-backed transfer metrics.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Counts what the transport decides (redirects, retries, scheme upgrades,
//!   SSH bridge outcomes) rather than payload volume.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry for one transport client.
#[derive(Clone)]
pub struct TransferMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    http_requests_total: IntCounterVec,
    redirects_total: IntCounter,
    transport_retries_total: IntCounter,
    access_upgrades_total: IntCounterVec,
    ssh_resolutions_total: IntCounterVec,
    request_duration_seconds: Histogram,
}

/// Snapshot of selected counters for health reporting and tests.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Redirect hops followed.
    pub redirects_total: u64,
    /// Transport-level resends after a connection failure.
    pub transport_retries_total: u64,
    /// Access-mode upgrades triggered by auth challenges.
    pub access_upgrades_total: u64,
    /// SSH bridge resolutions that hit the token cache.
    pub ssh_cache_hits_total: u64,
    /// Completed request timings recorded in the latency histogram.
    pub timed_requests_total: u64,
}

const SSH_CACHE_HIT: &str = "cache_hit";
const ACCESS_MODES: [&str; 3] = ["basic", "ntlm", "negotiate"];

impl TransferMetrics {
    /// Construct a new metrics registry with the transfer collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "blobwire_http_requests_total",
                "HTTP responses received by method and status class",
            ),
            &["method", "class"],
        )
        .map_err(|source| collector("blobwire_http_requests_total", source))?;
        let redirects_total = IntCounter::with_opts(Opts::new(
            "blobwire_redirects_total",
            "Redirect hops followed",
        ))
        .map_err(|source| collector("blobwire_redirects_total", source))?;
        let transport_retries_total = IntCounter::with_opts(Opts::new(
            "blobwire_transport_retries_total",
            "Requests resent after a transport failure",
        ))
        .map_err(|source| collector("blobwire_transport_retries_total", source))?;
        let access_upgrades_total = IntCounterVec::new(
            Opts::new(
                "blobwire_access_upgrades_total",
                "Access mode upgrades by target mode",
            ),
            &["mode"],
        )
        .map_err(|source| collector("blobwire_access_upgrades_total", source))?;
        let ssh_resolutions_total = IntCounterVec::new(
            Opts::new(
                "blobwire_ssh_resolutions_total",
                "SSH credential bridge lookups by outcome",
            ),
            &["outcome"],
        )
        .map_err(|source| collector("blobwire_ssh_resolutions_total", source))?;
        let request_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "blobwire_request_duration_seconds",
            "Time from send to final response, redirects included",
        ))
        .map_err(|source| collector("blobwire_request_duration_seconds", source))?;

        register(
            &registry,
            "blobwire_http_requests_total",
            Box::new(http_requests_total.clone()),
        )?;
        register(
            &registry,
            "blobwire_redirects_total",
            Box::new(redirects_total.clone()),
        )?;
        register(
            &registry,
            "blobwire_transport_retries_total",
            Box::new(transport_retries_total.clone()),
        )?;
        register(
            &registry,
            "blobwire_access_upgrades_total",
            Box::new(access_upgrades_total.clone()),
        )?;
        register(
            &registry,
            "blobwire_ssh_resolutions_total",
            Box::new(ssh_resolutions_total.clone()),
        )?;
        register(
            &registry,
            "blobwire_request_duration_seconds",
            Box::new(request_duration_seconds.clone()),
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                http_requests_total,
                redirects_total,
                transport_retries_total,
                access_upgrades_total,
                ssh_resolutions_total,
                request_duration_seconds,
            }),
        })
    }

    /// Count a response for `method`, bucketed by status class (`2xx`, `4xx`, ...).
    pub fn inc_http_request(&self, method: &str, status: u16) {
        let class = format!("{}xx", status / 100);
        self.inner
            .http_requests_total
            .with_label_values(&[method, class.as_str()])
            .inc();
    }

    /// Count one followed redirect hop.
    pub fn inc_redirect(&self) {
        self.inner.redirects_total.inc();
    }

    /// Count one resend after a transport failure.
    pub fn inc_transport_retry(&self) {
        self.inner.transport_retries_total.inc();
    }

    /// Count an access-mode upgrade to `mode`.
    pub fn inc_access_upgrade(&self, mode: &str) {
        self.inner
            .access_upgrades_total
            .with_label_values(&[mode])
            .inc();
    }

    /// Count an SSH bridge lookup; `outcome` is `cache_hit`, `resolved`, or `failed`.
    pub fn inc_ssh_resolution(&self, outcome: &str) {
        self.inner
            .ssh_resolutions_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record the time taken by one request, redirects included.
    pub fn observe_request_duration(&self, duration: Duration) {
        self.inner
            .request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the transfer counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let access_upgrades_total = ACCESS_MODES
            .iter()
            .map(|mode| {
                self.inner
                    .access_upgrades_total
                    .with_label_values(&[*mode])
                    .get()
            })
            .sum();
        let ssh_cache_hits_total = self
            .inner
            .ssh_resolutions_total
            .with_label_values(&[SSH_CACHE_HIT])
            .get();

        MetricsSnapshot {
            redirects_total: self.inner.redirects_total.get(),
            transport_retries_total: self.inner.transport_retries_total.get(),
            access_upgrades_total,
            ssh_cache_hits_total,
            timed_requests_total: self.inner.request_duration_seconds.get_sample_count(),
        }
    }
}

fn collector(name: &'static str, source: prometheus::Error) -> TelemetryError {
    TelemetryError::MetricsCollector { name, source }
}

fn register(
    registry: &Registry,
    name: &'static str,
    collector: Box<dyn prometheus::core::Collector>,
) -> Result<()> {
    registry
        .register(collector)
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}
