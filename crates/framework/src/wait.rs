//! Polling helpers for conditions that become true eventually.
//!
//! Conditions are checked at a fixed interval until they hold or the overall
//! timeout elapses. There is no backoff: cluster state converges on its own
//! schedule and polling faster than the interval buys nothing.
//!
//! [`for_condition`] blocks the calling thread, which is what feature steps
//! want. [`for_condition_async`] is the same loop on tokio for async step
//! code; pair it with the `_async` methods of [`KubeClient`], since the
//! blocking ones cannot run inside a runtime.

use crate::context::Context;
use crate::klient::{ClientError, KubeClient};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Default pause between two checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default overall deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Wait errors.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Condition not met within {timeout:?} after {attempts} attempts")]
    Timeout { timeout: Duration, attempts: u32 },

    #[error("Condition check failed: {0:#}")]
    Condition(#[source] anyhow::Error),

    #[error("Wait cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Pause before the next check, or `None` once `deadline` has passed.
///
/// The pause never runs past the deadline of `ctx`.
fn next_pause(opts: &WaitOptions, deadline: Instant, ctx: Option<&Context>) -> Option<Duration> {
    let remaining = deadline.checked_duration_since(Instant::now())?;
    if remaining.is_zero() {
        return None;
    }
    let pause = opts.interval.min(remaining);
    Some(match ctx.and_then(Context::deadline) {
        Some(limit) => pause.min(limit.saturating_duration_since(Instant::now())),
        None => pause,
    })
}

/// Block until `condition` returns `Ok(true)`.
///
/// An `Err` from the condition ends the wait at once.
pub fn for_condition<F>(opts: &WaitOptions, condition: F) -> Result<(), WaitError>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    poll(opts, None, condition)
}

/// Like [`for_condition`], but also gives up once `ctx` is cancelled or past
/// its deadline.
pub fn for_condition_with_context<F>(
    ctx: &Context,
    opts: &WaitOptions,
    condition: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    poll(opts, Some(ctx), condition)
}

fn poll<F>(opts: &WaitOptions, ctx: Option<&Context>, mut condition: F) -> Result<(), WaitError>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let deadline = Instant::now() + opts.timeout;
    let mut attempts = 0u32;

    loop {
        if ctx.is_some_and(Context::is_done) {
            return Err(WaitError::Cancelled { attempts });
        }

        attempts += 1;
        if condition().map_err(WaitError::Condition)? {
            debug!(target: "e2e.wait", attempts, "Condition met");
            return Ok(());
        }

        let Some(pause) = next_pause(opts, deadline, ctx) else {
            return Err(WaitError::Timeout {
                timeout: opts.timeout,
                attempts,
            });
        };
        std::thread::sleep(pause);
    }
}

/// Async variant of [`for_condition`].
pub async fn for_condition_async<F, Fut>(opts: &WaitOptions, condition: F) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    poll_async(opts, None, condition).await
}

/// Async variant of [`for_condition_with_context`].
///
/// Cancelling the context's token interrupts a pause in progress.
pub async fn for_condition_async_with_context<F, Fut>(
    ctx: &Context,
    opts: &WaitOptions,
    condition: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    poll_async(opts, Some(ctx), condition).await
}

async fn poll_async<F, Fut>(
    opts: &WaitOptions,
    ctx: Option<&Context>,
    mut condition: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = Instant::now() + opts.timeout;
    let mut attempts = 0u32;

    loop {
        if ctx.is_some_and(Context::is_done) {
            return Err(WaitError::Cancelled { attempts });
        }

        attempts += 1;
        if condition().await.map_err(WaitError::Condition)? {
            debug!(target: "e2e.wait", attempts, "Condition met");
            return Ok(());
        }

        let Some(pause) = next_pause(opts, deadline, ctx) else {
            return Err(WaitError::Timeout {
                timeout: opts.timeout,
                attempts,
            });
        };
        match ctx.and_then(Context::cancellation) {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!(target: "e2e.wait", attempts, "Wait cancelled during pause");
                        return Err(WaitError::Cancelled { attempts });
                    }
                    () = tokio::time::sleep(pause) => {}
                }
            }
            None => tokio::time::sleep(pause).await,
        }
    }
}

/// A 404 counts as "not yet"; any other request error ends the wait.
fn resource_ready<P>(
    fetched: Result<serde_json::Value, ClientError>,
    ready: P,
) -> anyhow::Result<bool>
where
    P: FnOnce(&serde_json::Value) -> bool,
{
    match fetched {
        Ok(object) => Ok(ready(&object)),
        Err(ClientError::RequestFailed { status: 404, .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn resource_gone(fetched: Result<serde_json::Value, ClientError>) -> anyhow::Result<bool> {
    match fetched {
        Ok(_) => Ok(false),
        Err(ClientError::RequestFailed { status: 404, .. }) => Ok(true),
        Err(err) => Err(err.into()),
    }
}

/// Wait until the object at `path` exists and satisfies `ready`.
///
/// A 404 from the API server counts as "not yet". Any other request error
/// ends the wait.
pub fn for_resource<P>(
    client: &KubeClient,
    path: &str,
    opts: &WaitOptions,
    ready: P,
) -> Result<(), WaitError>
where
    P: Fn(&serde_json::Value) -> bool,
{
    for_condition(opts, || resource_ready(client.get_json(path), &ready))
}

/// Wait until the object at `path` is gone.
pub fn for_deletion(client: &KubeClient, path: &str, opts: &WaitOptions) -> Result<(), WaitError> {
    for_condition(opts, || resource_gone(client.get_json(path)))
}

/// Async variant of [`for_resource`].
pub async fn for_resource_async<P>(
    client: &KubeClient,
    path: &str,
    opts: &WaitOptions,
    ready: P,
) -> Result<(), WaitError>
where
    P: Fn(&serde_json::Value) -> bool,
{
    let ready = &ready;
    for_condition_async(opts, move || async move {
        resource_ready(client.get_json_async(path).await, ready)
    })
    .await
}

/// Async variant of [`for_deletion`].
pub async fn for_deletion_async(
    client: &KubeClient,
    path: &str,
    opts: &WaitOptions,
) -> Result<(), WaitError> {
    for_condition_async(opts, move || async move {
        resource_gone(client.get_json_async(path).await)
    })
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick() -> WaitOptions {
        WaitOptions::new()
            .with_interval(Duration::from_millis(5))
            .with_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_defaults() {
        let opts = WaitOptions::default();
        assert_eq!(opts.interval, Duration::from_secs(2));
        assert_eq!(opts.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_condition_met_after_retries() {
        let mut calls = 0;
        let result = for_condition(&quick(), || {
            calls += 1;
            Ok(calls >= 3)
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_timeout() {
        let opts = WaitOptions::new()
            .with_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_millis(30));
        let err = for_condition(&opts, || Ok(false)).unwrap_err();
        assert!(matches!(
            err,
            WaitError::Timeout { timeout, attempts }
                if timeout == Duration::from_millis(30) && attempts >= 2
        ));
    }

    #[test]
    fn test_condition_error_stops_immediately() {
        let mut calls = 0;
        let err = for_condition(&quick(), || {
            calls += 1;
            Err(anyhow!("pod evicted"))
        })
        .unwrap_err();
        assert!(matches!(err, WaitError::Condition(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_cancelled_context() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = Context::new().with_cancellation(token);

        let err = for_condition_with_context(&ctx, &quick(), || Ok(true)).unwrap_err();
        assert!(matches!(err, WaitError::Cancelled { attempts: 0 }));
    }

    #[tokio::test]
    async fn test_async_condition_met_after_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);

        let result = for_condition_async(&quick(), move || {
            let attempts = Arc::clone(&seen);
            async move {
                let seen = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, anyhow::Error>(seen >= 2)
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_timeout() {
        let opts = WaitOptions::new()
            .with_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_millis(25));
        let err = for_condition_async(&opts, || async { Ok::<_, anyhow::Error>(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout { .. }));
    }

    #[test]
    fn test_context_deadline_caps_pause() {
        let ctx = Context::new().with_timeout(Duration::from_millis(30));
        let opts = WaitOptions::new()
            .with_interval(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(60));

        let started = Instant::now();
        let err = for_condition_with_context(&ctx, &opts, || Ok(false)).unwrap_err();
        assert!(matches!(err, WaitError::Cancelled { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_async_cancel_interrupts_pause() {
        let token = CancellationToken::new();
        let ctx = Context::new().with_cancellation(token.clone());
        let opts = WaitOptions::new()
            .with_interval(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(60));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = for_condition_async_with_context(&ctx, &opts, || async {
            Ok::<_, anyhow::Error>(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WaitError::Cancelled { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_async_wait_until_api_server_ready() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/readyz"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/readyz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let client = KubeClient::new(mock_server.uri()).unwrap();
        let client = &client;
        let ctx = Context::new().with_timeout(Duration::from_secs(5));

        let result = for_condition_async_with_context(&ctx, &quick(), move || async move {
            Ok::<_, anyhow::Error>(client.check_ready_async().await.is_ok())
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_for_resource_treats_not_found_as_pending() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/e2e"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/e2e"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": { "name": "e2e" },
                "status": { "phase": "Active" }
            })))
            .mount(&mock_server)
            .await;

        // The blocking client cannot run on the test runtime.
        let uri = mock_server.uri();
        let result = tokio::task::spawn_blocking(move || {
            let client = KubeClient::new(uri)?;
            for_resource(&client, "/api/v1/namespaces/e2e", &quick(), |ns| {
                ns.pointer("/status/phase").and_then(|p| p.as_str()) == Some("Active")
            })?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_for_resource_async_stops_on_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/e2e"))
            .respond_with(ResponseTemplate::new(500).set_body_string("etcd unavailable"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = KubeClient::new(mock_server.uri()).unwrap();
        let err = for_resource_async(&client, "/api/v1/namespaces/e2e", &quick(), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Condition(_)));
        assert!(err.to_string().contains("etcd unavailable"));
    }

    #[tokio::test]
    async fn test_for_deletion_async_finishes_on_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/e2e"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": { "phase": "Terminating" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/e2e"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = KubeClient::new(mock_server.uri()).unwrap();
        let result = for_deletion_async(&client, "/api/v1/namespaces/e2e", &quick()).await;
        assert!(result.is_ok());
    }
}
