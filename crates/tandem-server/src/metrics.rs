//! Prometheus metrics recorder and `/metrics` rendering.
//!
//! Metric names live in [`tandem_core::metrics`].

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_local_recorder() {
        // Local recorder and handle, no global install.
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn render_includes_recorded_counter() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(tandem_core::metrics::PAIRING_MATCHES_TOTAL).increment(3);
        });
        assert!(render(&handle).contains("pairing_matches_total 3"));
    }
}
