use anyhow::Result;
use tracing::Instrument;

use crate::config::Config;
use crate::logging::APPLY_SPAN;

/// Run the apply engine until the process is stopped.
pub async fn apply(config: &Config, log_db_password: Option<&str>) -> Result<()> {
    let log_store = super::open_log_store(config, log_db_password).await?;
    let queue = super::open_queue(config)?;
    let engine = super::build_apply(config, &log_store, queue)?;
    engine
        .run()
        .instrument(tracing::info_span!(APPLY_SPAN))
        .await
}
