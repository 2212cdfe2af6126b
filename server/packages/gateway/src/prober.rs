use std::time::{Duration, Instant};

use render_gateway_error::GatewayError;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::from_max_wait(Duration::from_secs(10))
    }
}

impl ProbePolicy {
    /// Eleven attempts spaced a tenth of `max_wait` apart.
    pub fn from_max_wait(max_wait: Duration) -> Self {
        let interval = max_wait / 10;
        Self {
            max_attempts: 11,
            interval,
            connect_timeout: interval.max(Duration::from_millis(50)),
        }
    }

    /// Upper bound on how long `wait_until_open` can take.
    pub fn budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.connect_timeout * attempts + self.interval * (attempts - 1)
    }
}

/// Polls `host:port` until a TCP connect succeeds. Returns the number of
/// attempts used.
pub async fn wait_until_open(host: &str, port: u16, policy: ProbePolicy) -> Result<u32, GatewayError> {
    let started = Instant::now();
    let attempts = policy.max_attempts.max(1);
    let probe = async {
        for attempt in 1..=attempts {
            match timeout(policy.connect_timeout, TcpStream::connect((host, port))).await {
                Ok(Ok(_)) => return Some(attempt),
                Ok(Err(_)) | Err(_) => {}
            }
            if attempt < attempts {
                sleep(policy.interval).await;
            }
        }
        None
    };

    match timeout(policy.budget(), probe).await {
        Ok(Some(attempt)) => {
            tracing::debug!(
                port,
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "port open"
            );
            Ok(attempt)
        }
        Ok(None) | Err(_) => {
            tracing::warn!(
                port,
                attempts,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "port never opened"
            );
            Err(GatewayError::ProbeTimeout { port, attempts })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_policy() -> ProbePolicy {
        ProbePolicy {
            max_attempts: 11,
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(50),
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    #[test]
    fn default_policy_matches_run_requests() {
        let policy = ProbePolicy::default();
        assert_eq!(policy.max_attempts, 11);
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn open_port_succeeds_first_try() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let attempts = wait_until_open("127.0.0.1", port, fast_policy())
            .await
            .expect("open");
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn closed_port_gives_up_within_budget() {
        let port = closed_port().await;
        let policy = fast_policy();
        let started = Instant::now();
        let err = wait_until_open("127.0.0.1", port, policy)
            .await
            .expect_err("closed");
        assert!(matches!(
            err,
            GatewayError::ProbeTimeout { attempts: 11, .. }
        ));
        assert!(started.elapsed() <= policy.budget() + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn late_listener_is_found() {
        let port = closed_port().await;
        let opener = tokio::spawn(async move {
            sleep(Duration::from_millis(40)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("rebind");
            sleep(Duration::from_secs(2)).await;
            drop(listener);
        });
        let attempts = wait_until_open("127.0.0.1", port, fast_policy())
            .await
            .expect("eventually open");
        assert!(attempts > 1);
        opener.abort();
    }
}
