use crate::cancel::Cancellation;
use crate::error::{self, Result};
use models::client::TalosClient;

use std::net::Ipv4Addr;
use tokio::time::{sleep, Duration};
use tracing::{event, instrument, Level};

const DEFAULT_HEALTH_ATTEMPTS: u32 = 60;
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);
// Bounds each individual check so that a hung call cannot stretch the gate beyond its attempt budget.
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the health gate keeps polling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HealthGateSettings {
    pub attempts: u32,
    pub interval: Duration,
    pub check_timeout: Duration,
}

impl Default for HealthGateSettings {
    fn default() -> Self {
        HealthGateSettings {
            attempts: DEFAULT_HEALTH_ATTEMPTS,
            interval: DEFAULT_HEALTH_INTERVAL,
            check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
        }
    }
}

/// Proof that the cluster passed its aggregate health check. Only the health gate creates one, so work which
/// requires a working API server and etcd quorum takes it as an argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthyCluster {
    node: Ipv4Addr,
    kubeconfig: String,
}

impl HealthyCluster {
    /// The node which answered the health check.
    pub fn node(&self) -> Ipv4Addr {
        self.node
    }

    pub fn kubeconfig(&self) -> &str {
        &self.kubeconfig
    }
}

/// Blocks until the cluster reports healthy, polling on a fixed interval.
#[derive(Clone, Debug)]
pub struct HealthGate<T: TalosClient> {
    client: T,
    settings: HealthGateSettings,
}

impl<T: TalosClient> HealthGate<T> {
    pub fn new(client: T, settings: HealthGateSettings) -> Self {
        HealthGate { client, settings }
    }

    /// Polls the aggregate health of the cluster through `node` until it passes or the attempts run out.
    ///
    /// The gate holds no locks while waiting, and stops early if the run is cancelled.
    #[instrument(skip(self, kubeconfig, cancellation), err)]
    pub async fn wait(
        &self,
        node: Ipv4Addr,
        kubeconfig: &str,
        cancellation: &Cancellation,
    ) -> Result<HealthyCluster> {
        let mut last_error = String::from("no health check was attempted");
        for attempt in 1..=self.settings.attempts {
            match self.client.health(node, self.settings.check_timeout).await {
                Ok(()) => {
                    event!(Level::INFO, attempt, "Cluster is healthy.");
                    return Ok(HealthyCluster {
                        node,
                        kubeconfig: kubeconfig.to_string(),
                    });
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        attempt,
                        attempts = self.settings.attempts,
                        error = %err,
                        "Cluster is not healthy yet."
                    );
                    last_error = err.to_string();
                }
            }

            if attempt < self.settings.attempts {
                tokio::select! {
                    _ = sleep(self.settings.interval) => {},
                    _ = cancellation.cancelled() => {
                        return error::CancelledSnafu {
                            node: node.to_string(),
                            stage: "cluster health",
                        }
                        .fail();
                    }
                }
            }
        }

        error::HealthGateTimeoutSnafu {
            node,
            attempts: self.settings.attempts,
            last_error,
        }
        .fail()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use models::client::{ClientError, MockTalosClient};
    use std::sync::Arc;

    const NODE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);

    fn settings(attempts: u32) -> HealthGateSettings {
        HealthGateSettings {
            attempts,
            interval: Duration::ZERO,
            check_timeout: Duration::from_secs(1),
        }
    }

    fn unhealthy() -> ClientError {
        ClientError::TalosctlFailed {
            action: "health".to_string(),
            node: NODE,
            stderr: "waiting for etcd to be healthy".to_string(),
        }
    }

    #[tokio::test]
    async fn test_passes_after_retries() {
        let mut client = MockTalosClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_health()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(unhealthy()));
        client
            .expect_health()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let gate = HealthGate::new(Arc::new(client), settings(5));
        let healthy = gate
            .wait(NODE, "kubeconfig", &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(healthy.node(), NODE);
        assert_eq!(healthy.kubeconfig(), "kubeconfig");
    }

    #[tokio::test]
    async fn test_timeout_is_a_convergence_failure() {
        let mut client = MockTalosClient::new();
        client
            .expect_health()
            .times(3)
            .returning(|_, _| Err(unhealthy()));

        let gate = HealthGate::new(Arc::new(client), settings(3));
        let err = gate
            .wait(NODE, "kubeconfig", &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HealthGateTimeout { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::ConvergenceTimeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let mut client = MockTalosClient::new();
        client
            .expect_health()
            .times(1)
            .returning(|_, _| Err(unhealthy()));

        let cancellation = Cancellation::new();
        cancellation.cancel();
        let gate = HealthGate::new(
            Arc::new(client),
            HealthGateSettings {
                interval: Duration::from_secs(3600),
                ..settings(60)
            },
        );
        let err = gate.wait(NODE, "kubeconfig", &cancellation).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
