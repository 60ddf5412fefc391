/*!
Channel helpers for asserting on broadcast fan-out in tests.
*/

use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::timeout;

/// Everything currently buffered, without waiting. Lag is skipped over.
pub fn drain<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(item) => items.push(item),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    items
}

/// Next item, or `None` if nothing arrives within `timeout_ms`.
pub async fn recv_within<T: Clone>(
    receiver: &mut broadcast::Receiver<T>,
    timeout_ms: u64,
) -> Option<T> {
    match timeout(Duration::from_millis(timeout_ms), receiver.recv()).await {
        Ok(Ok(item)) => Some(item),
        _ => None,
    }
}

/// Routes `tracing` output through the test harness; safe to call from
/// every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_and_recv_within() {
        let (tx, mut rx) = broadcast::channel(4);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(drain(&mut rx), vec![1, 2]);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(recv_within(&mut rx, 10).await, None);
        tx.send(3).unwrap();
        assert_eq!(recv_within(&mut rx, 10).await, Some(3));
    }

    #[tokio::test]
    async fn test_drain_skips_lag() {
        let (tx, mut rx) = broadcast::channel(2);
        for i in 0..5 {
            tx.send(i).unwrap();
        }
        assert_eq!(drain(&mut rx), vec![3, 4]);
    }
}
