//! Liveness checks for the validator's own node.
//!
//! A node is live once its status endpoint answers and the chain reports a
//! height of at least 1. Until then the height query either exits with
//! [`NOT_READY_EXIT_CODE`] or reports a `null` height; both mean "ask again".

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{Result, ScenarioError};
use crate::poll::{poll_until, PollPolicy, Probe};
use crate::process::{CommandOutput, NodeCommand, NodeRunner};

/// Exit code of the height query while no block exists yet.
pub const NOT_READY_EXIT_CODE: i32 = 1;

const HEIGHT_PATH: [&str; 3] = ["block", "header", "height"];
const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Extracts the chain height from the height query output.
///
/// Accepts either the bare field (`12`, `"12"`, `null`) or the full block
/// JSON, from which `.block.header.height` is read. `Ok(None)` means the
/// node has no block yet, including when any step of that path is absent.
pub fn parse_height(output: &str) -> Result<Option<u64>, String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err("no output received".to_string());
    }
    if trimmed == "null" {
        return Ok(None);
    }
    if let Ok(height) = trimmed.parse::<u64>() {
        return Ok(Some(height));
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| format!("unparseable height `{trimmed}`: {e}"))?;
    let mut field = &value;
    if value.is_object() {
        // A missing or null step means no block yet.
        for step in HEIGHT_PATH {
            field = match field {
                Value::Object(map) => match map.get(step) {
                    Some(next) => next,
                    None => return Ok(None),
                },
                Value::Null => return Ok(None),
                other => return Err(format!("expected an object at `.{step}`, got {other}")),
            };
        }
    }
    match field {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("height {n} is not a block number")),
        Value::String(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|e| format!("height `{s}` is not a block number: {e}")),
        other => Err(format!("unexpected height value {other}")),
    }
}

/// Maps one height query result onto the poll loop.
pub fn classify_height(cmd: &NodeCommand, out: CommandOutput) -> Result<Probe<u64>> {
    if out.code == Some(NOT_READY_EXIT_CODE) {
        trace!("Height query reports no block yet");
        return Ok(Probe::Pending);
    }
    let out = out.check(cmd)?;
    match parse_height(&out.text()) {
        Ok(Some(height)) if height >= 1 => Ok(Probe::Ready(height)),
        Ok(Some(height)) => {
            debug!(height, "Chain has not produced its first block");
            Ok(Probe::Pending)
        }
        Ok(None) => Ok(Probe::Pending),
        Err(reason) => Err(ScenarioError::Process {
            command: cmd.line(),
            status: out.status(),
            output: reason,
        }),
    }
}

/// Polls `status_url` until it answers `200 OK`. Connection errors and other
/// statuses are retried.
pub async fn wait_for_server_ready(
    status_url: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(policy.interval.max(MIN_PROBE_TIMEOUT))
        .build()
        .map_err(|e| ScenarioError::Http(e.to_string()))?;

    poll_until("node status endpoint", policy, cancel, || {
        let request = client.get(status_url).send();
        async move {
            match request.await {
                Ok(response) if response.status() == StatusCode::OK => Ok(Probe::Ready(())),
                Ok(response) => {
                    trace!(status = %response.status(), "Status endpoint not ready");
                    Ok(Probe::Pending)
                }
                Err(e) => {
                    trace!(error = %e, "Status endpoint unreachable");
                    Ok(Probe::Pending)
                }
            }
        }
    })
    .await?;

    info!(%status_url, "Node status endpoint is up");
    Ok(())
}

/// Polls the height query until the chain reaches height 1.
pub async fn wait_for_first_block(
    runner: &dyn NodeRunner,
    query: &NodeCommand,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<u64> {
    let height = poll_until("first block", policy, cancel, move || async move {
        let out = runner.output(query).await?;
        classify_height(query, out)
    })
    .await?;

    info!(height, "Current block height");
    Ok(height)
}
