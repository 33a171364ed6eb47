//! Data Flow Controller
//!
//! External collaborator abstracting the actual byte movement. The transfer
//! manager drives it through provision/start/deprovision; completion arrives
//! asynchronously through the completion channel, keyed by transfer id.
//!
//! All operations must be idempotent per transfer id: the dispatcher may
//! re-invoke them after a crash or lease expiry.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core_types::TransferId;
use crate::transfer::types::{ProvisionedResource, TransferProcess};

/// Pluggable controller performing the data movement mechanics.
///
/// Errors are treated as retryable by the transfer manager until its retry
/// bound is exceeded.
#[async_trait]
pub trait DataFlowController: Send + Sync {
    /// Controller name for logging
    fn name(&self) -> &'static str;

    /// Allocate whatever the transfer needs (endpoints, buffers, temp
    /// storage) and return the resource references to persist.
    async fn provision(
        &self,
        process: &TransferProcess,
    ) -> anyhow::Result<Vec<ProvisionedResource>>;

    /// Begin moving data. Completion is signaled later through the
    /// completion channel.
    async fn start(&self, process: &TransferProcess) -> anyhow::Result<()>;

    /// Release provisioned resources. Best-effort; may be retried forever.
    async fn deprovision(&self, process: &TransferProcess) -> anyhow::Result<()>;
}

/// Sender half handed to data flow controller implementations
#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::Sender<TransferId>,
}

impl CompletionSender {
    /// Signal that the data movement for a transfer finished
    pub async fn complete(&self, transfer_id: TransferId) -> Result<(), String> {
        debug!(transfer_id = %transfer_id, "Transfer completion signaled");
        self.tx
            .send(transfer_id)
            .await
            .map_err(|_| "completion channel closed".to_string())
    }
}

/// Receiver half drained by the dispatcher
pub struct CompletionReceiver {
    rx: mpsc::Receiver<TransferId>,
}

impl CompletionReceiver {
    /// Try to receive a completion signal (non-blocking)
    pub fn try_recv(&mut self) -> Option<TransferId> {
        self.rx.try_recv().ok()
    }

    /// Receive a completion signal (blocking until available or closed)
    pub async fn recv(&mut self) -> Option<TransferId> {
        self.rx.recv().await
    }
}

/// Create a new completion channel pair
pub fn completion_channel(buffer: usize) -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = mpsc::channel(buffer);
    (CompletionSender { tx }, CompletionReceiver { rx })
}


#[cfg(test)]
pub use mock::MockFlowController;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Role;
    use crate::transfer::types::DataDestination;

    fn process() -> TransferProcess {
        TransferProcess::new("agr-1", Role::Consumer, DataDestination::new("file"))
    }

    #[tokio::test]
    async fn test_completion_channel_roundtrip() {
        let (sender, mut receiver) = completion_channel(4);
        let id = TransferId::new();

        sender.complete(id).await.unwrap();
        assert_eq!(receiver.recv().await, Some(id));
    }

    #[tokio::test]
    async fn test_mock_controller_failure_injection() {
        let controller = MockFlowController::new();
        controller.fail_next_provisions(2);

        let process = process();
        assert!(controller.provision(&process).await.is_err());
        assert!(controller.provision(&process).await.is_err());
        let resources = controller.provision(&process).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(controller.provision_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_controller_completes_on_start() {
        let (sender, mut receiver) = completion_channel(4);
        let controller = MockFlowController::new().complete_on_start(sender);

        let process = process();
        controller.start(&process).await.unwrap();
        assert_eq!(receiver.recv().await, Some(process.id));
    }
}
