use tracing::warn;

use super::{RebuildError, ReindexEngine, naming, with_cleanup};
use crate::index::PostgresIndex;

pub(super) async fn rebuild(engine: &ReindexEngine, index: &PostgresIndex) -> Result<(), RebuildError> {
    with_cleanup(
        async {
            engine
                .backend
                .reindex_concurrently(&index.id, engine.settings.statement_timeout)
                .await
                .map_err(|error| {
                    RebuildError::RebuildFailed(format!("reindexing {} failed: {error}", index.id))
                })
        },
        drop_artifacts(engine, index),
    )
    .await
}

/// Drops `_ccnew`/`_ccold` indexes postgres derived from the target, including ones left
/// by earlier interrupted runs.
async fn drop_artifacts(engine: &ReindexEngine, index: &PostgresIndex) {
    let summaries = match engine.catalog.list(&index.id.schema).await {
        Ok(summaries) => summaries,
        Err(error) => {
            warn!(index = %index.id, reason = %error, "could not scan for rebuild leftovers");
            return;
        }
    };
    for summary in summaries {
        if naming::is_native_artifact_of(&index.id.name, &summary.id.name) {
            engine.drop_index(&summary.id).await;
        }
    }
}
