use prometheus::{Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub bookings_total: IntCounterVec,
    pub booking_transitions_total: IntCounterVec,
    pub route_estimates_total: IntCounterVec,
    pub route_estimate_latency_seconds: HistogramVec,
    pub payments_total: IntCounterVec,
    pub escrow_actions_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bookings_total = IntCounterVec::new(
            Opts::new("bookings_total", "Booking creation attempts by outcome"),
            &["outcome"],
        )
        .expect("valid bookings_total metric");

        let booking_transitions_total = IntCounterVec::new(
            Opts::new(
                "booking_transitions_total",
                "Applied booking status transitions by target status",
            ),
            &["to"],
        )
        .expect("valid booking_transitions_total metric");

        let route_estimates_total = IntCounterVec::new(
            Opts::new(
                "route_estimates_total",
                "Route estimates by the tier that produced them",
            ),
            &["source"],
        )
        .expect("valid route_estimates_total metric");

        let route_estimate_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "route_estimate_latency_seconds",
                "Time spent walking the routing fallback chain in seconds",
            ),
            &["source"],
        )
        .expect("valid route_estimate_latency_seconds metric");

        let payments_total = IntCounterVec::new(
            Opts::new("payments_total", "Payment attempts by outcome"),
            &["outcome"],
        )
        .expect("valid payments_total metric");

        let escrow_actions_total = IntCounterVec::new(
            Opts::new("escrow_actions_total", "Escrow release/refund actions"),
            &["action", "outcome"],
        )
        .expect("valid escrow_actions_total metric");

        registry
            .register(Box::new(bookings_total.clone()))
            .expect("register bookings_total");
        registry
            .register(Box::new(booking_transitions_total.clone()))
            .expect("register booking_transitions_total");
        registry
            .register(Box::new(route_estimates_total.clone()))
            .expect("register route_estimates_total");
        registry
            .register(Box::new(route_estimate_latency_seconds.clone()))
            .expect("register route_estimate_latency_seconds");
        registry
            .register(Box::new(payments_total.clone()))
            .expect("register payments_total");
        registry
            .register(Box::new(escrow_actions_total.clone()))
            .expect("register escrow_actions_total");

        Self {
            registry,
            bookings_total,
            booking_transitions_total,
            route_estimates_total,
            route_estimate_latency_seconds,
            payments_total,
            escrow_actions_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
