//! Integration testing module
//!
//! End-to-end tests for the fragment remuxer:
//! - Fast-path merge of video, audio and interleaved fragments
//! - Discontinuity accounting
//! - Re-encode fallback selection
//! - Cancellation and spill-store cleanup

pub mod e2e;
