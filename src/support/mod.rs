//! Cross-cutting support utilities

pub mod ocpp_frame;
pub mod retry;
pub mod shutdown;

pub use ocpp_frame::{FrameError, OcppFrame};
pub use retry::{retry_with_backoff, RetryConfig};
pub use shutdown::{listen_for_shutdown_signals, ShutdownSignal};
