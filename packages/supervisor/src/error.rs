//! Failure taxonomy for crawl runs.
//!
//! Three classes of failure drive different retry semantics:
//! - infra errors (storage/mount faults) are re-queued without charging
//!   the job's retry budget,
//! - configuration errors are surfaced and left for an operator,
//! - everything else is an ordinary failure subject to the retry budget.

use thiserror::Error;

/// Errors raised while driving a crawl stage.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The job's configuration is unusable; retrying cannot help.
    #[error("crawler configuration error: {0}")]
    Config(String),

    /// The container could not be launched.
    #[error("failed to launch crawl container: {0}")]
    Launch(String),
}

/// How a failed crawl should be charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Storage/mount infrastructure fault. Re-queued after a cooldown,
    /// never charged against the retry budget.
    Infra,
    /// Configuration or runtime fault that needs a human.
    Config,
    /// Ordinary crawl failure, retried up to the budget.
    Ordinary,
}

/// OS error codes that indicate storage/mount infrastructure trouble
/// rather than a fault in the crawl itself.
const INFRA_OS_ERROR_CODES: &[i32] = &[
    5,   // EIO
    19,  // ENODEV
    107, // ENOTCONN
    116, // ESTALE
    121, // EREMOTEIO
];

/// Classify an error to determine how the failed run is charged.
///
/// Walks the full cause chain: a `CrawlError::Config` or a storage
/// guardrail violation anywhere marks the run as operator-owned, and an
/// `std::io::Error` carrying one of the known infra OS codes marks it
/// as an infrastructure fault.
pub fn classify_failure(error: &anyhow::Error) -> FailureClass {
    for cause in error.chain() {
        if let Some(crawl) = cause.downcast_ref::<CrawlError>() {
            if matches!(crawl, CrawlError::Config(_)) {
                return FailureClass::Config;
            }
        }
        if cause
            .downcast_ref::<crate::guardrails::GuardrailError>()
            .is_some()
        {
            return FailureClass::Config;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(code) = io.raw_os_error() {
                if INFRA_OS_ERROR_CODES.contains(&code) {
                    return FailureClass::Infra;
                }
            }
        }
    }
    FailureClass::Ordinary
}
