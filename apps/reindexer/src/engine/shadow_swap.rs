use tracing::{debug, info};

use super::{LockRetryError, RebuildError, ReindexEngine, naming, with_cleanup};
use crate::index::{BuildRequest, IndexId, PostgresIndex, quote_ident_if_needed};

pub(super) async fn rebuild(engine: &ReindexEngine, index: &PostgresIndex) -> Result<(), RebuildError> {
    let shadow = index.id.sibling(naming::shadow_name(&index.id.name));
    let statement = shadow_statement(index, &shadow.name)?;

    // A shadow left by an interrupted run would block the build below.
    engine.drop_index(&shadow).await;

    with_cleanup(
        build_and_swap(engine, index, &shadow, statement),
        async {
            engine.drop_index(&shadow).await;
        },
    )
    .await
}

async fn build_and_swap(
    engine: &ReindexEngine,
    index: &PostgresIndex,
    shadow: &IndexId,
    statement: String,
) -> Result<(), RebuildError> {
    let request = BuildRequest {
        target: index.id.clone(),
        shadow: shadow.clone(),
        statement,
    };
    debug!(index = %index.id, statement = %request.statement, "building shadow index");
    engine
        .backend
        .create_index_concurrently(&request, engine.settings.statement_timeout)
        .await
        .map_err(|error| {
            RebuildError::RebuildFailed(format!("building {shadow} failed: {error}"))
        })?;

    let built = engine.catalog.fetch(shadow).await?;
    if !built.is_valid {
        return Err(RebuildError::BuildInvalid(shadow.clone()));
    }

    // target -> replaced, shadow -> target, replaced -> shadow, in one transaction so a
    // failed attempt leaves every name where it was.
    let replaced = naming::replaced_name(&index.id.name);
    let renames = [
        (index.id.name.clone(), replaced.clone()),
        (shadow.name.clone(), index.id.name.clone()),
        (replaced, shadow.name.clone()),
    ];
    let backend = engine.backend.as_ref();
    let schema = index.id.schema.as_str();
    let renames = &renames[..];
    engine
        .settings
        .swap_retries
        .run("swap index names", move |lock_timeout| {
            backend.rename_indexes(schema, renames, lock_timeout)
        })
        .await
        .map_err(|error| match error {
            LockRetryError::Exhausted { .. } => RebuildError::SwapLockTimeout(error.to_string()),
            LockRetryError::Backend(error) => {
                RebuildError::RebuildFailed(format!("swapping {} failed: {error}", index.id))
            }
        })?;

    info!(index = %index.id, shadow = %shadow, "swapped rebuilt index into place");
    Ok(())
}

/// Rewrites the target's `CREATE INDEX` statement to build `shadow_name` concurrently.
fn shadow_statement(index: &PostgresIndex, shadow_name: &str) -> Result<String, RebuildError> {
    let expected = format!("CREATE INDEX {} ON ", quote_ident_if_needed(&index.id.name));
    let Some(rest) = index.definition.strip_prefix(&expected) else {
        return Err(RebuildError::RebuildFailed(format!(
            "unexpected definition for {}: {}",
            index.id, index.definition
        )));
    };
    Ok(format!(
        "CREATE INDEX CONCURRENTLY {} ON {rest}",
        quote_ident_if_needed(shadow_name)
    ))
}
