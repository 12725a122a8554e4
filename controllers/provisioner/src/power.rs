//! # Power-on retry
//!
//! Powering on a VM immediately after its disks were created can fail
//! while the hypervisor is still finalizing the new backing files in the
//! background. Task completion does not cover that finalization, so the
//! power-on is the one retried operation in the pipeline: attempts are
//! spaced by an explicit, independently constructible wait schedule
//! instead of literal sleeps, and tests drive it under paused time.

use crate::error::ProvisionError;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vsphere_client::{HypervisorBackend, PowerState, VsphereError};

/// Ordered list of waits between power-on attempts
///
/// A schedule of length `n` allows `n + 1` total attempts; `schedule[i]`
/// is slept after the `i`-th failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    waits: Vec<Duration>,
}

impl RetrySchedule {
    /// Create a schedule from explicit waits
    pub fn new(waits: Vec<Duration>) -> Self {
        Self { waits }
    }

    /// The schedule used against production vCenter: 10s, 30s, 60s.
    /// Chosen empirically to ride out background disk finalization.
    pub fn default_power_on() -> Self {
        Self::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ])
    }

    /// A schedule with no waits (single attempt)
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// Waits in order
    pub fn waits(&self) -> &[Duration] {
        &self.waits
    }

    /// Total attempts this schedule allows
    pub fn max_attempts(&self) -> usize {
        self.waits.len() + 1
    }

    /// Sum of all waits
    pub fn total_wait(&self) -> Duration {
        self.waits.iter().sum()
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::default_power_on()
    }
}

/// Block until the shutdown signal reads true.
///
/// Never resolves if the sender is dropped without signalling.
pub(crate) async fn wait_cancelled(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Power a VM on, retrying per `schedule`.
///
/// Re-issuing power-on against an already powered-on VM is a no-op
/// success; no task is submitted. On exhaustion the error carries the
/// attempt count, the cumulative wait, and the final cause.
pub async fn power_on_with_retry(
    backend: &dyn HypervisorBackend,
    vm_id: &str,
    schedule: &RetrySchedule,
    task_poll_interval: Duration,
    task_timeout: Duration,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), ProvisionError> {
    // Idempotence guard
    if backend.power_state(vm_id).await? == PowerState::PoweredOn {
        debug!("VM {} is already powered on", vm_id);
        return Ok(());
    }

    let mut total_wait = Duration::ZERO;
    let mut last_error: Option<ProvisionError> = None;

    for attempt in 1..=schedule.max_attempts() {
        if *shutdown.borrow() {
            return Err(ProvisionError::Cancelled);
        }

        debug!("Power-on attempt {}/{} for VM {}", attempt, schedule.max_attempts(), vm_id);
        match try_power_on(backend, vm_id, task_poll_interval, task_timeout).await {
            Ok(()) => {
                info!("VM {} powered on after {} attempt(s)", vm_id, attempt);
                return Ok(());
            }
            Err(error) => {
                warn!("Power-on attempt {} for VM {} failed: {}", attempt, vm_id, error);
                last_error = Some(error);
            }
        }

        // Sleep the scheduled wait before the next attempt, if one remains
        if let Some(&wait) = schedule.waits().get(attempt - 1) {
            tokio::select! {
                () = tokio::time::sleep(wait) => total_wait += wait,
                () = wait_cancelled(shutdown.clone()) => return Err(ProvisionError::Cancelled),
            }
        }
    }

    Err(ProvisionError::PowerOnExhausted {
        attempts: schedule.max_attempts(),
        total_wait,
        last: Box::new(last_error.unwrap_or_else(|| {
            // max_attempts() is always >= 1, so at least one attempt ran
            ProvisionError::Validation("empty retry schedule".to_string())
        })),
    })
}

async fn try_power_on(
    backend: &dyn HypervisorBackend,
    vm_id: &str,
    task_poll_interval: Duration,
    task_timeout: Duration,
) -> Result<(), ProvisionError> {
    let task = backend.power_on(vm_id).await?;
    match backend
        .wait_for_task(&task, task_poll_interval, task_timeout)
        .await
    {
        Ok(_) => Ok(()),
        Err(VsphereError::TaskTimeout { waited, .. }) => Err(ProvisionError::Timeout {
            operation: "power-on task".to_string(),
            waited,
        }),
        Err(error) => Err(ProvisionError::Remote(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{provisioned_shell, shutdown_channel};
    use vsphere_client::MockVsphereClient;

    const POLL: Duration = Duration::from_millis(100);
    const TIMEOUT: Duration = Duration::from_secs(120);

    fn schedule_10_30_60() -> RetrySchedule {
        RetrySchedule::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_scheduled_waits() {
        let mock = MockVsphereClient::new();
        let vm_id = provisioned_shell(&mock, "node-a").await;
        mock.fail_next_power_on_tasks(2);
        let (_tx, rx) = shutdown_channel();

        let started = tokio::time::Instant::now();
        power_on_with_retry(&mock, &vm_id, &schedule_10_30_60(), POLL, TIMEOUT, &rx)
            .await
            .unwrap();

        assert_eq!(mock.power_on_attempts(), 3);
        // Exactly the first two waits were slept: 10s + 30s
        assert_eq!(started.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_cumulative_wait() {
        let mock = MockVsphereClient::new();
        let vm_id = provisioned_shell(&mock, "node-a").await;
        mock.fail_next_power_on_tasks(usize::MAX);
        let (_tx, rx) = shutdown_channel();

        let schedule = schedule_10_30_60();
        let error = power_on_with_retry(&mock, &vm_id, &schedule, POLL, TIMEOUT, &rx)
            .await
            .unwrap_err();

        assert_eq!(mock.power_on_attempts(), schedule.max_attempts());
        match error {
            ProvisionError::PowerOnExhausted { attempts, total_wait, last } => {
                assert_eq!(attempts, 4);
                assert_eq!(total_wait, Duration::from_secs(100));
                assert!(matches!(*last, ProvisionError::Remote(_)));
            }
            other => panic!("expected PowerOnExhausted, got {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn powered_on_vm_is_a_no_op_success() {
        let mock = MockVsphereClient::new();
        let vm_id = provisioned_shell(&mock, "node-a").await;
        let (_tx, rx) = shutdown_channel();

        power_on_with_retry(&mock, &vm_id, &RetrySchedule::none(), POLL, TIMEOUT, &rx)
            .await
            .unwrap();
        assert_eq!(mock.power_on_attempts(), 1);

        // Second call must not issue another power-on task
        power_on_with_retry(&mock, &vm_id, &RetrySchedule::none(), POLL, TIMEOUT, &rx)
            .await
            .unwrap();
        assert_eq!(mock.power_on_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let mock = MockVsphereClient::new();
        let vm_id = provisioned_shell(&mock, "node-a").await;
        mock.fail_next_power_on_tasks(usize::MAX);
        let (tx, rx) = shutdown_channel();

        let schedule = RetrySchedule::new(vec![Duration::from_secs(3600)]);
        let handle = tokio::spawn({
            let mock = mock.clone();
            async move {
                power_on_with_retry(&mock, &vm_id, &schedule, POLL, TIMEOUT, &rx).await
            }
        });

        // Let the first attempt fail and the long sleep begin
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        let error = handle.await.unwrap().unwrap_err();
        assert!(matches!(error, ProvisionError::Cancelled));
        assert_eq!(mock.power_on_attempts(), 1);
    }
}
