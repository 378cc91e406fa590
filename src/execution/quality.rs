/// Execution quality score in [0, 1].
///
/// `1 / (1 + |slippage|/10 + fills/20 + latency_ms/10000)`; zero when nothing
/// filled. Strictly decreasing in each input.
pub fn execution_quality(slippage_bps: f64, fill_count: usize, latency_ms: u64) -> f64 {
    if fill_count == 0 {
        return 0.0;
    }
    let slip = if slippage_bps.is_finite() { slippage_bps.abs() } else { f64::MAX };
    let penalty = slip / 10.0 + fill_count as f64 / 20.0 + latency_ms as f64 / 10_000.0;
    (1.0 / (1.0 + penalty)).clamp(0.0, 1.0)
}
