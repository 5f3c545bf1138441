use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_attempts_total: IntCounterVec,
    pub transitions_total: IntCounterVec,
    pub match_latency_seconds: HistogramVec,
    pub dispatch_queue_depth: IntGauge,
    pub dispatch_jobs_in_flight: IntGauge,
    pub dispatch_jobs_total: IntCounterVec,
    pub payment_events_total: IntCounterVec,
    pub courier_utilization: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_attempts_total = IntCounterVec::new(
            Opts::new(
                "dispatch_attempts_total",
                "Dispatch attempts by trigger and outcome",
            ),
            &["trigger", "outcome"],
        )
        .expect("valid dispatch_attempts_total metric");

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "order_transitions_total",
                "Conditional order writes by transition and whether they applied",
            ),
            &["transition", "outcome"],
        )
        .expect("valid order_transitions_total metric");

        let match_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "match_latency_seconds",
                "Time to snapshot the courier pool and score it, in seconds",
            ),
            &["trigger"],
        )
        .expect("valid match_latency_seconds metric");

        let dispatch_queue_depth = IntGauge::new(
            "dispatch_queue_depth",
            "Auto-assignment jobs waiting in the queue",
        )
        .expect("valid dispatch_queue_depth metric");

        let dispatch_jobs_in_flight = IntGauge::new(
            "dispatch_jobs_in_flight",
            "Auto-assignment jobs currently running",
        )
        .expect("valid dispatch_jobs_in_flight metric");

        let dispatch_jobs_total = IntCounterVec::new(
            Opts::new("dispatch_jobs_total", "Auto-assignment jobs by final outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_jobs_total metric");

        let payment_events_total = IntCounterVec::new(
            Opts::new(
                "payment_events_total",
                "Payment gateway callbacks by kind and gateway status",
            ),
            &["kind", "status"],
        )
        .expect("valid payment_events_total metric");

        let courier_utilization = GaugeVec::new(
            Opts::new(
                "courier_utilization",
                "Active orders over the load cap at the courier's last assignment [0..1]",
            ),
            &["courier_id"],
        )
        .expect("valid courier_utilization metric");

        registry
            .register(Box::new(dispatch_attempts_total.clone()))
            .expect("register dispatch_attempts_total");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(match_latency_seconds.clone()))
            .expect("register match_latency_seconds");
        registry
            .register(Box::new(dispatch_queue_depth.clone()))
            .expect("register dispatch_queue_depth");
        registry
            .register(Box::new(dispatch_jobs_in_flight.clone()))
            .expect("register dispatch_jobs_in_flight");
        registry
            .register(Box::new(dispatch_jobs_total.clone()))
            .expect("register dispatch_jobs_total");
        registry
            .register(Box::new(payment_events_total.clone()))
            .expect("register payment_events_total");
        registry
            .register(Box::new(courier_utilization.clone()))
            .expect("register courier_utilization");

        Self {
            registry,
            dispatch_attempts_total,
            transitions_total,
            match_latency_seconds,
            dispatch_queue_depth,
            dispatch_jobs_in_flight,
            dispatch_jobs_total,
            payment_events_total,
            courier_utilization,
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
