//! Capture side: claims, live extension and the finalizing rewrite

mod claim;
mod finalizer;
mod rewrite;

pub use claim::{CaptureClaim, CaptureLock, ClaimOutcome};
pub use finalizer::{CapturePolicy, CaptureReport, Finalizer};
pub use rewrite::{finalize_headers, Confirmed};
