use anyhow::Result;
use tracing::Instrument;

use crate::config::Config;
use crate::logging::{APPLY_SPAN, CAPTURE_SPAN};

/// Run capture and apply side by side in one process.
///
/// The engines share the log store pool and the queue file but nothing else;
/// each keeps its own loop. Returns only if one of them fails hard.
pub async fn run(config: &Config, log_db_password: Option<&str>) -> Result<()> {
    let log_store = super::open_log_store(config, log_db_password).await?;
    let capture = super::build_capture(config, &log_store, super::open_queue(config)?)?;
    let apply = super::build_apply(config, &log_store, super::open_queue(config)?)?;

    tracing::info!(
        project = %config.project_name,
        server_id = capture.server_id(),
        "starting capture and apply engines"
    );
    tokio::try_join!(
        capture.run().instrument(tracing::info_span!(CAPTURE_SPAN)),
        apply.run().instrument(tracing::info_span!(APPLY_SPAN)),
    )?;
    Ok(())
}
