use std::future::Future;
use std::time::Duration;

use crate::errors::{RecoveryError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay applied before `attempt` (1-based). The first attempt runs
/// immediately, later ones wait 2^(attempt - 2) seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        Duration::ZERO
    } else {
        Duration::from_secs(1u64 << (attempt - 2))
    }
}

/// Runs `op` up to `max_attempts` times, awaiting `sleep` with the
/// backoff delay before every attempt after the first. Returns the
/// first success or the last error seen.
pub async fn with_retry<T, Sleep, SleepFut, Op, OpFut>(
    label: &str,
    max_attempts: u32,
    mut sleep: Sleep,
    mut op: Op,
) -> Result<T>
where
    Sleep: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
    Op: FnMut(u32) -> OpFut,
    OpFut: Future<Output = Result<T>>,
{
    let mut last_err: Option<RecoveryError> = None;
    for attempt in 1..=max_attempts {
        let delay = backoff_delay(attempt);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(
                    "{} failed [attempt {}/{}]: {}",
                    label,
                    attempt,
                    max_attempts,
                    err
                );
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RecoveryError::Config(format!("{}: no attempts made", label))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn no_sleep(_delay: Duration) -> impl Future<Output = ()> {
        async {}
    }

    #[tokio::test]
    async fn first_success_skips_sleep() {
        let slept: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = slept.clone();
        let result = with_retry(
            "probe",
            3,
            move |delay| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(delay);
                }
            },
            |_attempt| async { Ok(42u32) },
        )
        .await
        .expect("first attempt succeeds");
        assert_eq!(result, 42);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn backoff_schedule_is_one_then_two_seconds() {
        let slept: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = slept.clone();
        let attempts: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = attempts.clone();
        let result = with_retry(
            "probe",
            3,
            move |delay| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(delay);
                }
            },
            move |attempt| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(attempt);
                    if attempt < 3 {
                        Err(RecoveryError::Http(format!("boom {}", attempt)))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await
        .expect("third attempt succeeds");
        assert_eq!(result, "done");
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            *slept.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let err = with_retry("probe", 2, no_sleep, |attempt| async move {
            Err::<(), _>(RecoveryError::Http(format!("boom {}", attempt)))
        })
        .await
        .expect_err("all attempts fail");
        assert!(err.to_string().contains("boom 2"));
    }

    #[test]
    fn delay_grows_with_attempt() {
        assert_eq!(backoff_delay(1), Duration::ZERO);
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(4));
    }
}
