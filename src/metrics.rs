use tracing::trace;

// Trace-level counters; the Prometheus recorder picks up the exporter's own
// process metrics and these stay out of the hot path.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "listing.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "listing.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn item_outcome(outcome: &'static str, retried: bool) {
    trace!(
        target = "listing.metrics",
        outcome = outcome,
        retried = retried,
        "batch_items_total_inc"
    );
}

pub fn sandbox_run(mode: &'static str, ok: bool, elapsed_ms: u128) {
    trace!(
        target = "listing.metrics",
        mode = mode,
        ok = ok,
        elapsed_ms = elapsed_ms as u64,
        "sandbox_runs_total_inc"
    );
}
