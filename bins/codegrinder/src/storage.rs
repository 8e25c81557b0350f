use codegrinder_common::CommitBundle;
use redis::{AsyncCommands, RedisResult};

/// Redis key layout for graded commits - defines only semantics, not runtime
/// logic, so key naming stays deterministic across processes.

pub const COMMIT_PREFIX: &str = "codegrinder:commit";
pub const STATUS_PREFIX: &str = "codegrinder:status";

/// Graded commits are kept for 30 days.
const COMMIT_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;

/// A commit is the latest work for one step of one problem in one assignment.
pub fn commit_key(assignment_id: i64, problem_id: i64, step: i64) -> String {
    format!("{COMMIT_PREFIX}:{assignment_id}:{problem_id}:{step}")
}

pub fn status_key(assignment_id: i64, problem_id: i64, step: i64) -> String {
    format!("{STATUS_PREFIX}:{assignment_id}:{problem_id}:{step}")
}

fn encoding_error(err: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialization error",
        err.to_string(),
    ))
}

/// Persist a verified graded bundle, plus a small status record for quick
/// score lookups.
pub async fn store_bundle(
    conn: &mut redis::aio::ConnectionManager,
    bundle: &CommitBundle,
) -> RedisResult<()> {
    let commit = &bundle.commit;
    let key = commit_key(commit.assignment_id, commit.problem_id, commit.step);
    let payload = serde_json::to_string(bundle).map_err(encoding_error)?;
    let _: () = conn.set_ex(&key, payload, COMMIT_TTL_SECONDS).await?;

    let status = serde_json::json!({
        "action": commit.action,
        "score": commit.score,
        "passed": commit.report_card.as_ref().map(|card| card.passed).unwrap_or(false),
    });
    let status_payload = serde_json::to_string(&status).map_err(encoding_error)?;
    let _: () = conn
        .set_ex(
            &status_key(commit.assignment_id, commit.problem_id, commit.step),
            status_payload,
            COMMIT_TTL_SECONDS,
        )
        .await?;

    Ok(())
}

/// Fetch the stored bundle for a step, if any.
pub async fn get_bundle(
    conn: &mut redis::aio::ConnectionManager,
    assignment_id: i64,
    problem_id: i64,
    step: i64,
) -> RedisResult<Option<CommitBundle>> {
    let key = commit_key(assignment_id, problem_id, step);
    let payload: Option<String> = conn.get(&key).await?;
    match payload {
        Some(data) => {
            let bundle: CommitBundle = serde_json::from_str(&data).map_err(|err| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    err.to_string(),
                ))
            })?;
            Ok(Some(bundle))
        }
        None => Ok(None),
    }
}
