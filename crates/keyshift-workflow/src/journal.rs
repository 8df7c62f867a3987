//! Migration idempotency guard
//!
//! The replication runtime records every traffic switch in a journal on the
//! source shards, keyed by a migration id derived from the target keyspace
//! and the streams involved. Finding an entry for the id of a migration that
//! is about to be created means a previous attempt already ran.

use crate::context::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::resolver::ShardPrimary;
use crate::stream::ControlStatements;
use parking_lot::Mutex;
use tracing::{debug, warn};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Deterministic, non-negative id of a migration
///
/// FNV-1 over the keyspace name and the sorted stream identifiers, with the
/// top bit cleared. The order of `streams` does not matter.
pub fn migration_id<S: AsRef<str>>(target_keyspace: &str, streams: &[S]) -> i64 {
    let mut sorted: Vec<&str> = streams.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    let mut hash = FNV_OFFSET_BASIS;
    let bytes = target_keyspace
        .bytes()
        .chain(sorted.iter().flat_map(|s| s.bytes()));
    for byte in bytes {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u64::from(byte);
    }
    (hash & i64::MAX as u64) as i64
}

/// `shard:id` identifiers of the streams about to be created
///
/// A fresh control table numbers each shard's streams from one.
pub fn candidate_streams<'a, I>(batches: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, usize)>,
{
    batches
        .into_iter()
        .flat_map(|(shard, rows)| (1..=rows).map(move |id| format!("{}:{}", shard, id)))
        .collect()
}

/// Fail if any source primary already journaled `migration_id`
pub(crate) async fn check_previous_journal(
    ctx: &EngineContext,
    sources: &[ShardPrimary],
    migration_id: i64,
    target_keyspace: &str,
    workflow: &str,
) -> Result<()> {
    let query = ControlStatements::new(&ctx.config).journal_entry(migration_id);
    let found = Mutex::new(Vec::new());

    ctx.for_all(sources, |source| {
        let query = query.as_str();
        let found = &found;
        async move {
            let result = ctx.vreplication_exec(&source.primary, query).await?;
            if !result.is_empty() {
                found.lock().push(source.primary.alias.to_string());
            }
            Ok(())
        }
    })
    .await?;

    let mut tablets = found.into_inner();
    if tablets.is_empty() {
        debug!(migration_id, workflow, "No previous journal entry");
        return Ok(());
    }
    tablets.sort();
    warn!(migration_id, workflow, tablets = ?tablets, "Found previous journal entry");
    Err(WorkflowError::Idempotency {
        migration_id,
        tablets,
        keyspace: target_keyspace.to_string(),
        workflow: workflow.to_string(),
    })
}
