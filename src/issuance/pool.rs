//! Bounded worker pool for issuance calls.
//!
//! Calls execute on a dedicated multi-thread runtime, separate from the one
//! driving the reconciliation loop and sweeper. A semaphore bounds in-flight
//! calls and every call is subject to a timeout that includes queueing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{AssetSpec, Delivery, DeliveryStatus, IssuanceError, Issuer};

pub struct IssuancePool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
    issuer: Arc<dyn Issuer>,
    call_timeout: Duration,
}

impl IssuancePool {
    pub fn new(
        issuer: Arc<dyn Issuer>,
        workers: usize,
        call_timeout: Duration,
    ) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("issuance-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Some(runtime),
            handle,
            permits: Arc::new(Semaphore::new(workers)),
            issuer,
            call_timeout,
        })
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, IssuanceError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Issuer>) -> Fut,
        Fut: Future<Output = Result<T, IssuanceError>> + Send + 'static,
    {
        let permit = match tokio::time::timeout(
            self.call_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(IssuanceError::WorkerUnavailable),
            Err(_) => return Err(IssuanceError::Timeout(self.call_timeout)),
        };

        let call = op(Arc::clone(&self.issuer));
        let mut task = self.handle.spawn(async move {
            let _permit = permit;
            call.await
        });

        match tokio::time::timeout(self.call_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "Issuance task did not complete");
                Err(IssuanceError::WorkerUnavailable)
            }
            Err(_) => {
                task.abort();
                Err(IssuanceError::Timeout(self.call_timeout))
            }
        }
    }

    /// Mint an asset.
    pub async fn issue(&self, spec: &AssetSpec) -> Result<String, IssuanceError> {
        let spec = spec.clone();
        self.run(move |issuer| async move { issuer.issue(&spec).await })
            .await
    }

    /// Transfer an asset to its owner.
    pub async fn deliver(&self, asset_ref: &str, owner: &str) -> Result<Delivery, IssuanceError> {
        let asset_ref = asset_ref.to_string();
        let owner = owner.to_string();
        self.run(move |issuer| async move { issuer.deliver(&asset_ref, &owner).await })
            .await
    }

    /// Mint then deliver. A failed delivery is reported, not raised: the
    /// asset exists and the owner can still claim it.
    pub async fn issue_and_deliver(
        &self,
        spec: &AssetSpec,
        owner: &str,
    ) -> Result<(String, Delivery), IssuanceError> {
        let asset_ref = self.issue(spec).await?;
        debug!(asset_ref = %asset_ref, name = %spec.name, "Asset issued");

        let delivery = match self.deliver(&asset_ref, owner).await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(asset_ref = %asset_ref, owner = %owner, error = %e, "Asset delivery failed");
                Delivery {
                    status: DeliveryStatus::Failed,
                    tx_ref: None,
                }
            }
        };

        Ok((asset_ref, delivery))
    }
}

impl Drop for IssuancePool {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics; detach instead.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
