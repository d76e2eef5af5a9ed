//! Progress reporting side channel
//!
//! The pipeline emits progress through this two-method contract instead of
//! depending on any host (GUI, TUI, logging) type. Calls are fire-and-forget:
//! implementations return nothing and must not block; the pipeline is fully
//! functional against the no-op implementation.

/// Receiver for progress events emitted during a run
pub trait ProgressReporter: Send + Sync {
    /// Announce a status message; `hide_progress_bar` tells bar-style hosts
    /// to clear any running bar first.
    fn update_message(&self, _text: &str, _hide_progress_bar: bool) {}

    /// Report completion of `fraction` (in `[0, 1]`) of the work described by
    /// `label`.
    fn update_progress_bar(&self, _fraction: f64, _label: &str) {}
}

/// Reporter that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_accepts_events() {
        let progress = NoopProgress;
        progress.update_message("processing", true);
        progress.update_progress_bar(0.5, "pose prediction");
    }
}
