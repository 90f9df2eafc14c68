//! Subline: cached, rate-adaptive subtitle translation dispatch.
//! Library root: module wiring, tracing setup and the public surface.

pub mod cancellation;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod formatter;
pub mod job;
pub mod metrics;
pub mod rate_limit;
pub mod state_machine;
pub mod translate;

pub use config::{ConfigError, PipelineConfig};
pub use dispatcher::BatchDispatcher;
pub use formatter::{FormattedResult, LineFormatter};
pub use job::{
    DispatchError, Job, JobReport, ProgressEvent, SegmentError, SegmentResult, TranslationParams,
};
pub use translate::cache::{FingerprintCache, TransferError};
pub use translate::openai::OpenAiCompatClient;
pub use translate::{TranslateError, TranslateRequest, Translator};

/// Install the global fmt subscriber. `RUST_LOG` overrides the default
/// `subline=info` filter. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("subline=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
