//! Builds the tokio runtime used by `camsend`/`camrecv` `main()` from a
//! `RuntimeConfig`, honoring `--max-workers`/`--max-blocking-threads`.

use crate::config::RuntimeConfig;

/// Build a multi-threaded runtime honoring `max_workers` (0 = tokio
/// default, which is the number of CPU cores) and `max_blocking_threads`
/// (0 = tokio default of 512).
pub fn build(config: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.max_workers > 0 {
        builder.worker_threads(config.max_workers);
    }
    if config.max_blocking_threads > 0 {
        builder.max_blocking_threads(config.max_blocking_threads);
    }
    builder.build()
}
