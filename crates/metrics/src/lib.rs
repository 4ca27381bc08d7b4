//! Process-wide prometheus registry and the helpers components use to
//! register and log metrics. Register metrics with the `register_srk_*`
//! macros at module scope and log through the free functions so call sites
//! stay one line.

use std::{
    sync::LazyLock,
    time::Instant,
};

use prometheus::{
    Encoder,
    Histogram,
    HistogramOpts,
    IntCounter,
    IntGauge,
    Registry,
    TextEncoder,
};

// Re-exported for the registration macros.
pub use prometheus;

pub static SRK_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("invalid counter definition");
    SRK_METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .expect("duplicate metric registration");
    counter
}

pub fn register_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("invalid gauge definition");
    SRK_METRICS_REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("duplicate metric registration");
    gauge
}

pub fn register_histogram(name: &str, help: &str) -> Histogram {
    let histogram =
        Histogram::with_opts(HistogramOpts::new(name, help)).expect("invalid histogram definition");
    SRK_METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("duplicate metric registration");
    histogram
}

#[macro_export]
macro_rules! register_srk_counter {
    ($name:ident, $help:expr) => {
        pub static $name: ::std::sync::LazyLock<$crate::prometheus::IntCounter> =
            ::std::sync::LazyLock::new(|| {
                $crate::register_counter(&stringify!($name).to_ascii_lowercase(), $help)
            });
    };
}

#[macro_export]
macro_rules! register_srk_gauge {
    ($name:ident, $help:expr) => {
        pub static $name: ::std::sync::LazyLock<$crate::prometheus::IntGauge> =
            ::std::sync::LazyLock::new(|| {
                $crate::register_gauge(&stringify!($name).to_ascii_lowercase(), $help)
            });
    };
}

#[macro_export]
macro_rules! register_srk_histogram {
    ($name:ident, $help:expr) => {
        pub static $name: ::std::sync::LazyLock<$crate::prometheus::Histogram> =
            ::std::sync::LazyLock::new(|| {
                $crate::register_histogram(&stringify!($name).to_ascii_lowercase(), $help)
            });
    };
}

pub fn log_counter(counter: &IntCounter, amount: u64) {
    counter.inc_by(amount);
}

pub fn log_gauge(gauge: &IntGauge, value: i64) {
    gauge.set(value);
}

pub fn log_distribution(histogram: &Histogram, value: f64) {
    histogram.observe(value);
}

/// Times a region of code into a histogram, observing on `finish` or drop.
pub struct Timer {
    histogram: &'static LazyLock<Histogram>,
    start: Instant,
    observed: bool,
}

impl Timer {
    pub fn new(histogram: &'static LazyLock<Histogram>) -> Self {
        Self {
            histogram,
            start: Instant::now(),
            observed: false,
        }
    }

    pub fn finish(mut self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.histogram.observe(elapsed);
        self.observed = true;
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.observed {
            self.histogram.observe(self.start.elapsed().as_secs_f64());
        }
    }
}

/// Prometheus text exposition of every registered metric, for `/metrics`.
pub fn export_text() -> anyhow::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&SRK_METRICS_REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
