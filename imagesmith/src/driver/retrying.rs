//! Retries for transient driver failures.

use super::{
    ArtifactRequest, ConvertedArtifact, DriverError, GuestDriver, GuestInstance, GuestSpec,
    PowerState,
};
use crate::boot::KeyInput;
use crate::cancellation::CancellationToken;
use crate::retry::{with_retry, RetryConfig, RetryError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Wraps a driver and retries its idempotent operations.
///
/// `send_keys` and `convert_to_artifact` are passed through once: resending
/// keys can re-trigger installer menus and a half-done conversion must not
/// be started twice. `destroy` retries against its own token so teardown
/// still gets its attempts after the build was cancelled.
#[derive(Debug)]
pub struct RetryingDriver<D> {
    inner: D,
    config: RetryConfig,
    cancel: Arc<CancellationToken>,
    teardown: CancellationToken,
}

impl<D: GuestDriver> RetryingDriver<D> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: D, config: RetryConfig, cancel: Arc<CancellationToken>) -> Self {
        Self {
            inner,
            config,
            cancel,
            teardown: CancellationToken::new(),
        }
    }

    /// The wrapped driver.
    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn retry<T, F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        with_retry(&self.config, key, cancel, DriverError::is_transient, operation)
            .await
            .map_err(|e| match e {
                RetryError::Failed(err) => err,
                RetryError::Cancelled => DriverError::Cancelled,
            })
    }
}

#[async_trait]
impl<D: GuestDriver> GuestDriver for RetryingDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create(&self, spec: &GuestSpec) -> Result<GuestInstance, DriverError> {
        self.retry("driver.create", &self.cancel, || self.inner.create(spec))
            .await
    }

    async fn send_keys(&self, guest: &GuestInstance, keys: &[KeyInput]) -> Result<(), DriverError> {
        self.inner.send_keys(guest, keys).await
    }

    async fn guest_address(&self, guest: &GuestInstance) -> Result<Option<String>, DriverError> {
        self.retry("driver.address", &self.cancel, || self.inner.guest_address(guest))
            .await
    }

    async fn power_state(&self, guest: &GuestInstance) -> Result<PowerState, DriverError> {
        self.retry("driver.power_state", &self.cancel, || self.inner.power_state(guest))
            .await
    }

    async fn power_off(&self, guest: &GuestInstance) -> Result<(), DriverError> {
        self.retry("driver.power_off", &self.cancel, || self.inner.power_off(guest))
            .await
    }

    async fn artifact_exists(&self, name: &str) -> Result<bool, DriverError> {
        self.retry("driver.artifact_exists", &self.cancel, || {
            self.inner.artifact_exists(name)
        })
        .await
    }

    async fn convert_to_artifact(
        &self,
        guest: &GuestInstance,
        request: &ArtifactRequest,
    ) -> Result<ConvertedArtifact, DriverError> {
        self.inner.convert_to_artifact(guest, request).await
    }

    async fn destroy(&self, guest: &GuestInstance) -> Result<(), DriverError> {
        self.retry("driver.destroy", &self.teardown, || self.inner.destroy(guest))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::JitterStrategy;
    use crate::testing::{DriverCall, MockGuestDriver};

    fn fast() -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(10)
            .with_jitter(JitterStrategy::None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_create_is_retried() {
        let mock = MockGuestDriver::new();
        mock.fail_next(DriverCall::Create, DriverError::Transient("busy".into()));
        let driver = RetryingDriver::new(mock, fast(), Arc::new(CancellationToken::new()));

        let spec = crate::testing::guest_spec("rhel9");
        driver.create(&spec).await.unwrap();
        assert_eq!(driver.inner().calls_of(DriverCall::Create), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let mock = MockGuestDriver::new();
        mock.fail_next(DriverCall::Create, DriverError::Fatal("quota".into()));
        let driver = RetryingDriver::new(mock, fast(), Arc::new(CancellationToken::new()));

        let err = driver.create(&crate::testing::guest_spec("rhel9")).await.unwrap_err();
        assert_eq!(err, DriverError::Fatal("quota".into()));
        assert_eq!(driver.inner().calls_of(DriverCall::Create), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_keys_never_retried() {
        let mock = MockGuestDriver::new();
        let guest = mock.guest("rhel9");
        mock.fail_next(DriverCall::SendKeys, DriverError::Transient("console busy".into()));
        let driver = RetryingDriver::new(mock, fast(), Arc::new(CancellationToken::new()));

        assert!(driver.send_keys(&guest, &[]).await.is_err());
        assert_eq!(driver.inner().calls_of(DriverCall::SendKeys), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_retries_after_cancellation() {
        let mock = MockGuestDriver::new();
        let guest = mock.guest("rhel9");
        mock.fail_next(DriverCall::Destroy, DriverError::Transient("locked".into()));
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("SIGTERM");
        let driver = RetryingDriver::new(mock, fast(), cancel);

        assert_eq!(
            driver.power_state(&guest).await.unwrap(),
            PowerState::Running
        );
        driver.destroy(&guest).await.unwrap();
        assert_eq!(driver.inner().calls_of(DriverCall::Destroy), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_backoff() {
        let mock = MockGuestDriver::new();
        let guest = mock.guest("rhel9");
        mock.fail_next(DriverCall::PowerOff, DriverError::Transient("busy".into()));
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("SIGINT");
        let driver = RetryingDriver::new(mock, fast(), cancel);

        assert_eq!(
            driver.power_off(&guest).await.unwrap_err(),
            DriverError::Cancelled
        );
    }
}
