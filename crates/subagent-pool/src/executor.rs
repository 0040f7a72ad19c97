//! Task Executor (component C6): per-task flow — admit, acquire, write
//! request, await the keyed response, sanitize, release. Spec §4.6's
//! twelve-step sequence, annotated inline by step number.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info_span, warn, Instrument};

use subagent_protocol::{Request, Response, ResponseStatus, PROTOCOL_VERSION};

use crate::error::PoolError;
use crate::pool::Pool;

const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const RESULT_TRUNCATE_BYTES: usize = 1024 * 1024;
const TRUNCATED_MARKER: &str = "[TRUNCATED]";

/// Runs one task through the pool end-to-end. `ping` requests bypass the
/// breaker and rate limiter entirely (spec §4.6 "Ping").
pub async fn execute_task(
    pool: &Pool,
    mut request: Request,
    secrets: HashMap<String, String>,
    llm_api_key: Option<String>,
) -> Result<Response, PoolError> {
    let is_ping = matches!(request.request_type, subagent_protocol::RequestType::Ping);
    let span = info_span!("execute_task", request_id = %request.id, ping = is_ping);

    async move {
        if !is_ping {
            // Step 1: circuit breaker.
            let decision = pool.breaker.allow(&pool.config.image);
            if !decision.permitted {
                return Err(PoolError::CircuitOpen { retry_after: decision.retry_after });
            }

            // Step 2: rate limiter.
            let (allowed, retry_after) = pool.rate_limiter.allow();
            if !allowed {
                return Err(PoolError::RateLimit { retry_after });
            }
        }

        // Step 3: draining check.
        if pool.is_draining() {
            return Err(PoolError::draining());
        }

        // Step 4: acquire worker.
        let worker = pool.acquire().await?;

        // Step 5: reserve a pending slot, enforcing max_pending.
        if !worker.try_reserve_pending() {
            pool.release(&worker).await;
            pool.record_queue_full();
            return Err(PoolError::queue_full());
        }

        // Step 6: verify the worker is still running (TTL-cached).
        match worker.is_running().await {
            Ok(true) => {}
            _ => {
                worker.release_pending(&request.id).await;
                pool.mark_dead(&worker).await;
                pool.breaker.record_failure(&pool.config.image);
                pool.release(&worker).await;
                return Err(PoolError::container_dead());
            }
        }

        // Step 7: stamp version, allocate correlation id, attach secrets + key.
        request.version = PROTOCOL_VERSION.to_string();
        if request.correlation_id.is_empty() {
            request.correlation_id = request.id.clone();
        }
        request.secrets = secrets;
        request.llm_api_key = llm_api_key;

        // Step 8: register the PendingEntry.
        let rx = worker.register_pending(request.id.clone()).await;

        // Step 9: write with a 5 s write deadline.
        let line = match serde_json::to_string(&request) {
            Ok(json) => json + "\n",
            Err(e) => {
                worker.release_pending(&request.id).await;
                pool.release(&worker).await;
                return Err(PoolError::Validation(format!("request did not serialize: {e}")));
            }
        };

        if let Err(e) = worker.write_line(&line, WRITE_DEADLINE).await {
            warn!(request_id = %request.id, error = %e, "write to worker stdin failed");
            worker.release_pending(&request.id).await;
            pool.mark_dead(&worker).await;
            pool.breaker.record_failure(&pool.config.image);
            pool.release(&worker).await;
            return Err(PoolError::Adapter(crate::error::AdapterError::new(
                crate::error::AdapterOp::Attach,
                e.to_string(),
            )));
        }

        // Step 10: effective timeout.
        let effective_timeout = if request.timeout_s > 0 {
            Duration::from_secs(request.timeout_s)
        } else {
            pool.config.task_timeout()
        };

        // Step 11: select on response vs. deadline.
        let result = tokio::time::timeout(effective_timeout, rx).await;

        // Step 12: deferred cleanup — always runs, regardless of branch.
        let outcome = match result {
            Ok(Ok(response)) => {
                if response.status == ResponseStatus::Error {
                    pool.record_failed();
                    pool.breaker.record_failure(&pool.config.image);
                    Ok(response)
                } else {
                    let sanitized = sanitize_response(pool, response);
                    pool.record_completed();
                    pool.breaker.record_success();
                    Ok(sanitized)
                }
            }
            Ok(Err(_channel_dropped)) => {
                pool.record_failed();
                pool.breaker.record_failure(&pool.config.image);
                Err(PoolError::container_dead())
            }
            Err(_elapsed) => {
                pool.record_timed_out();
                pool.breaker.record_failure(&pool.config.image);
                Err(PoolError::timeout())
            }
        };

        worker.release_pending(&request.id).await;
        pool.release(&worker).await;

        outcome
    }
    .instrument(span)
    .await
}

/// Truncates `result` to 1 MiB with a `[TRUNCATED]` marker, then runs it
/// through the injection sanitizer (defense in depth — the worker already
/// sanitized its own output before this response was ever written).
fn sanitize_response(pool: &Pool, mut response: Response) -> Response {
    if let Some(result) = response.result.take() {
        let truncated = if result.len() > RESULT_TRUNCATE_BYTES {
            let mut cut = result;
            cut.truncate(RESULT_TRUNCATE_BYTES);
            cut.push_str(TRUNCATED_MARKER);
            cut
        } else {
            result
        };
        let sanitized = pool.sanitizer.sanitize_tool_output(&truncated).into_text();
        response.result = Some(sanitized);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::container::FakeAdapter;
    use crate::pool::Pool;
    use std::sync::Arc;
    use subagent_protocol::RequestType;

    fn execute_request(id: &str, task: &str, timeout_s: u64) -> Request {
        Request {
            version: "1.0".to_string(),
            id: id.to_string(),
            correlation_id: String::new(),
            request_type: RequestType::Execute,
            task: task.to_string(),
            timeout_s,
            deadline_unix: None,
            secrets: HashMap::new(),
            llm_api_key: None,
        }
    }

    #[tokio::test]
    async fn happy_path_completes_and_bumps_counters() {
        // Spawns the real `subagent-worker` binary (its default `TaskRunner`
        // echoes the sanitized task back) so this exercises the full
        // protocol round trip, not just the pool's in-process bookkeeping.
        let worker_bin = env!("CARGO_BIN_EXE_subagent-worker");
        let adapter: Arc<dyn crate::container::ContainerAdapter> = Arc::new(FakeAdapter::new(worker_bin));
        let mut cfg = PoolConfig::default();
        cfg.container_count = 1;
        let pool = Pool::start(cfg, adapter).await.expect("start");

        let req = execute_request("a", "summarize this", 5);
        let response = execute_task(&pool, req, HashMap::new(), None).await.expect("happy path");
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(response.result.unwrap().contains("summarize this"));
        assert_eq!(pool.metrics().tasks_completed, 1);
        assert!(pool.breaker.is_closed());

        pool.graceful_shutdown(Duration::from_millis(100), Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn draining_pool_rejects_execute_task() {
        let adapter: Arc<dyn crate::container::ContainerAdapter> = Arc::new(FakeAdapter::new("cat"));
        let mut cfg = PoolConfig::default();
        cfg.container_count = 1;
        let pool = Pool::start(cfg, adapter).await.expect("start");
        pool.graceful_shutdown(Duration::from_millis(10), Duration::from_secs(1)).await;

        let req = execute_request("x", "do thing", 1);
        let err = execute_task(&pool, req, HashMap::new(), None).await.expect_err("draining");
        match err {
            PoolError::Subagent { code, retry, .. } => {
                assert_eq!(code.to_string(), "DRAINING");
                assert!(!retry);
            }
            other => panic!("expected Subagent(DRAINING), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_when_worker_never_responds() {
        let adapter: Arc<dyn crate::container::ContainerAdapter> = Arc::new(FakeAdapter::new("sleep"));
        let mut cfg = PoolConfig::default();
        cfg.container_count = 1;
        let pool = Pool::start(cfg, adapter).await.expect("start");

        let req = execute_request("timeout-1", "never responds", 1);
        let started = Instant::now();
        let err = execute_task(&pool, req, HashMap::new(), None).await.expect_err("timeout");
        assert!(started.elapsed() >= Duration::from_millis(900));
        match err {
            PoolError::Subagent { code, retry, .. } => {
                assert_eq!(code.to_string(), "TIMEOUT");
                assert!(retry);
            }
            other => panic!("expected Subagent(TIMEOUT), got {other:?}"),
        }
        assert_eq!(pool.metrics().tasks_timed_out, 1);

        pool.graceful_shutdown(Duration::from_millis(50), Duration::from_secs(2)).await;
    }
}
