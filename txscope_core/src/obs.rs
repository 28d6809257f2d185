//! Structured logging and opt-in metrics for frame lifecycle events.

use crate::frame::TransactionFrame;
use crate::transactions::Outcome;

#[inline]
pub(crate) fn frame_begun(frame: &TransactionFrame, decision: &'static str) {
    tracing::debug!(
        frame = %frame.id(),
        data_source = frame.data_source(),
        depth = frame.depth(),
        savepoint = frame.savepoint().unwrap_or(""),
        decision = decision,
        "transaction frame begun"
    );
}

#[inline]
pub(crate) fn frame_ended(frame: &TransactionFrame, outcome: Outcome, success: bool) {
    let elapsed = frame.started().elapsed().as_millis() as u64;
    tracing::debug!(
        frame = %frame.id(),
        data_source = frame.data_source(),
        depth = frame.depth(),
        outcome = ?outcome,
        elapsed_ms = elapsed,
        success = success,
        "transaction frame ended"
    );
    #[cfg(feature = "metrics")]
    {
        let outcome = match outcome {
            Outcome::Commit => "commit",
            Outcome::Rollback => "rollback",
        };
        let depth = if frame.depth() == 0 { "top" } else { "nested" };
        metrics::counter!("tx_frames_total", 1, "outcome" => outcome, "depth" => depth, "success" => success.to_string());
        metrics::histogram!("tx_frame_duration_ms", elapsed as f64, "outcome" => outcome, "depth" => depth);
    }
}

#[inline]
#[allow(unused_variables)]
pub(crate) fn hook_failures(frame: &TransactionFrame, count: usize) {
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("tx_hook_failures_total", count as u64, "data_source" => frame.data_source().to_string());
    }
}
