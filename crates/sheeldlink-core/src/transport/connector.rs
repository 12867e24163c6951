//! Connection establishment with bounded retries

use std::sync::Arc;

use super::{Link, LinkFactory, Transport, TransportKind};
use crate::config::{ChunkConfig, RetryConfig};
use crate::device::BoardInfo;
use crate::protocol::ProtocolError;

/// Tries left for one connection attempt, plus the strategy rotation index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    tries_left: u32,
    rotation: usize,
}

impl RetryBudget {
    /// Create a budget of `tries` total tries
    pub fn new(tries: u32) -> Self {
        Self {
            tries_left: tries,
            rotation: 0,
        }
    }

    /// Consume one try, returning the rotation index to use for it
    pub fn next_try(&mut self) -> Option<usize> {
        if self.tries_left == 0 {
            return None;
        }
        self.tries_left -= 1;
        let index = self.rotation;
        self.rotation += 1;
        Some(index)
    }

    /// Tries not yet consumed
    pub fn tries_left(&self) -> u32 {
        self.tries_left
    }

    /// Whether every try has been used
    pub fn is_exhausted(&self) -> bool {
        self.tries_left == 0
    }
}

/// Builds transports from the registered link factories
#[derive(Clone)]
pub struct Connector {
    factories: Vec<Arc<dyn LinkFactory>>,
    retry: RetryConfig,
    chunk: ChunkConfig,
}

impl Connector {
    /// Create a connector. Factories of the same kind are tried in registration order.
    pub fn new(factories: Vec<Arc<dyn LinkFactory>>, retry: RetryConfig, chunk: ChunkConfig) -> Self {
        Self {
            factories,
            retry,
            chunk,
        }
    }

    /// Whether any factory can build a link of `kind`
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.factories.iter().any(|f| f.kind() == kind)
    }

    fn strategies(&self, kind: TransportKind) -> Vec<&Arc<dyn LinkFactory>> {
        self.factories.iter().filter(|f| f.kind() == kind).collect()
    }

    /// Establish a transport to `board`.
    ///
    /// Each try uses the next strategy for the board's transport kind, round-robin.
    /// `on_retry` receives the attempt number (2, 3, ...) before every retry.
    pub async fn establish<F>(&self, board: &BoardInfo, on_retry: F) -> Result<Transport, ProtocolError>
    where
        F: Fn(u32) + Send + Sync,
    {
        let strategies = self.strategies(board.kind);
        if strategies.is_empty() {
            return Err(ProtocolError::Unsupported(format!(
                "no link factory for {:?} transports",
                board.kind
            )));
        }

        let mut budget = RetryBudget::new(self.retry.connection_tries);
        let mut attempt = 0u32;
        let mut last_error = String::from("no connection attempt made");

        while let Some(index) = budget.next_try() {
            attempt += 1;
            if attempt > 1 {
                tokio::time::sleep(self.retry.retry_delay()).await;
                on_retry(attempt);
            }

            let strategy = strategies[index % strategies.len()];
            tracing::debug!(
                "connecting to {} using {} (attempt {}/{})",
                board.address(),
                strategy.name(),
                attempt,
                self.retry.connection_tries
            );

            match Self::try_strategy(strategy.as_ref(), board).await {
                Ok(link) => {
                    tracing::info!("link to {} established on attempt {}", board.address(), attempt);
                    return Ok(Transport::new(link, board.kind, &self.chunk));
                }
                Err(e) => {
                    tracing::warn!(
                        "attempt {} to {} via {} failed: {}",
                        attempt,
                        board.address(),
                        strategy.name(),
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(ProtocolError::ConnectionFailed(format!(
            "{} after {} tries: {}",
            board.address(),
            attempt,
            last_error
        )))
    }

    async fn try_strategy(
        strategy: &dyn LinkFactory,
        board: &BoardInfo,
    ) -> Result<Arc<dyn Link>, ProtocolError> {
        let link = strategy.open(board)?;
        if let Err(e) = link.connect().await {
            link.close().await;
            return Err(e);
        }
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct FlakyLink {
        succeed: bool,
    }

    #[async_trait]
    impl Link for FlakyLink {
        async fn connect(&self) -> Result<(), ProtocolError> {
            if self.succeed {
                Ok(())
            } else {
                Err(ProtocolError::Transport("socket refused".into()))
            }
        }

        async fn read(&self) -> Result<Vec<u8>, ProtocolError> {
            Err(ProtocolError::Closed)
        }

        async fn write(&self, _data: &[u8]) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Succeeds from the `succeed_from`-th open onwards (1-based)
    struct CountingFactory {
        name: String,
        kind: TransportKind,
        opens: AtomicU32,
        succeed_from: u32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl CountingFactory {
        fn new(name: &str, succeed_from: u32, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                kind: TransportKind::Stream,
                opens: AtomicU32::new(0),
                succeed_from,
                log,
            })
        }
    }

    impl LinkFactory for CountingFactory {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn open(&self, _board: &BoardInfo) -> Result<Arc<dyn Link>, ProtocolError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.lock().unwrap().push(self.name.clone());
            Ok(Arc::new(FlakyLink {
                succeed: n >= self.succeed_from,
            }))
        }
    }

    fn retry(tries: u32) -> RetryConfig {
        RetryConfig {
            connection_tries: tries,
            retry_delay_ms: 500,
        }
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut budget = RetryBudget::new(2);
        assert_eq!(budget.next_try(), Some(0));
        assert_eq!(budget.next_try(), Some(1));
        assert!(budget.is_exhausted());
        assert_eq!(budget.next_try(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = Connector::new(
            vec![CountingFactory::new("rfcomm", 3, log.clone())],
            retry(3),
            ChunkConfig::default(),
        );
        let retries = Arc::new(Mutex::new(Vec::new()));
        let seen = retries.clone();

        let started = Instant::now();
        let transport = connector
            .establish(&BoardInfo::new("AA:BB", TransportKind::Stream), move |n| {
                seen.lock().unwrap().push(n)
            })
            .await
            .expect("third try succeeds");

        assert_eq!(transport.kind(), TransportKind::Stream);
        assert_eq!(*retries.lock().unwrap(), vec![2, 3]);
        assert!(started.elapsed() >= std::time::Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_fails_terminally() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = Connector::new(
            vec![CountingFactory::new("rfcomm", u32::MAX, log.clone())],
            retry(2),
            ChunkConfig::default(),
        );
        let result = connector
            .establish(&BoardInfo::new("AA:BB", TransportKind::Stream), |_| {})
            .await;

        assert!(matches!(result, Err(ProtocolError::ConnectionFailed(_))));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategies_rotate_round_robin() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = Connector::new(
            vec![
                CountingFactory::new("secure", u32::MAX, log.clone()),
                CountingFactory::new("insecure", u32::MAX, log.clone()),
                CountingFactory::new("reflection", u32::MAX, log.clone()),
            ],
            retry(4),
            ChunkConfig::default(),
        );
        let _ = connector
            .establish(&BoardInfo::new("AA:BB", TransportKind::Stream), |_| {})
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["secure", "insecure", "reflection", "secure"]
        );
    }

    #[tokio::test]
    async fn test_unsupported_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = Connector::new(
            vec![CountingFactory::new("rfcomm", 1, log)],
            retry(1),
            ChunkConfig::default(),
        );
        assert!(!connector.supports(TransportKind::Chunked));
        let result = connector
            .establish(&BoardInfo::new("AA:BB", TransportKind::Chunked), |_| {})
            .await;
        assert!(matches!(result, Err(ProtocolError::Unsupported(_))));
    }
}
