use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Workflow dispatch metrics recorded by the engine, backed by a shared
/// prometheus registry that the metrics collector module exposes as text.
#[derive(Clone)]
pub struct WorkflowMetrics {
    registry: Registry,
    triggered: IntCounterVec,
    duration: HistogramVec,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let triggered = IntCounterVec::new(
            Opts::new(
                "workflow_triggered_total",
                "Workflow dispatches by kind, action and outcome",
            ),
            &["kind", "action", "outcome"],
        )
        .unwrap_or_else(|e| panic!("workflow_triggered_total metric definition invalid: {e}"));

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "workflow_duration_seconds",
                "Workflow execution duration by kind and action",
            ),
            &["kind", "action"],
        )
        .unwrap_or_else(|e| panic!("workflow_duration_seconds metric definition invalid: {e}"));

        let _ = registry.register(Box::new(triggered.clone()));
        let _ = registry.register(Box::new(duration.clone()));

        Self {
            registry,
            triggered,
            duration,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe(&self, kind: &str, action: &str, outcome: &str, elapsed: std::time::Duration) {
        self.triggered
            .with_label_values(&[kind, action, outcome])
            .inc();
        self.duration
            .with_label_values(&[kind, action])
            .observe(elapsed.as_secs_f64());
    }
}

impl Default for WorkflowMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;
    use std::time::Duration;

    #[test]
    fn observe_records_labelled_series() {
        let metrics = WorkflowMetrics::new();
        metrics.observe("http", "finish", "completed", Duration::from_millis(5));
        metrics.observe("http", "finish", "completed", Duration::from_millis(7));
        metrics.observe("http", "finish", "failed", Duration::from_millis(1));

        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics.registry().gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains(
            r#"workflow_triggered_total{action="finish",kind="http",outcome="completed"} 2"#
        ));
        assert!(text.contains(
            r#"workflow_triggered_total{action="finish",kind="http",outcome="failed"} 1"#
        ));
        assert!(text.contains("workflow_duration_seconds"));
    }
}
