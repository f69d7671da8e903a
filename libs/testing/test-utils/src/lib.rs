//! Shared test utilities for broker tests
//!
//! This crate provides reusable test infrastructure for the worker crates:
//! - `TestDataBuilder`: Deterministic exchange, queue and routing key names
//! - `eventually`: Poll an async condition until it holds or a deadline passes
//! - `init_test_tracing`: Log to the test writer, filtered by `RUST_LOG`
//! - `assertions`: Custom assertion helpers
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{eventually, TestDataBuilder};
//! use std::time::Duration;
//!
//! #[tokio::test]
//! async fn my_broker_test() {
//!     let names = TestDataBuilder::from_test_name("my_broker_test");
//!     let queue = names.queue("orders");
//!
//!     // ... publish ...
//!
//!     let drained = eventually(Duration::from_secs(2), || async {
//!         broker.queue_depth(&queue) == Some(0)
//!     })
//!     .await;
//!     assert!(drained);
//! }
//! ```

mod wait;

pub use wait::{eventually, DEFAULT_POLL_INTERVAL};

use uuid::Uuid;

/// Install a tracing subscriber writing to the test output.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Builder for test data with deterministic names
///
/// Tests sharing a broker stay isolated by deriving every exchange and queue
/// name from the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_publish_once");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic message id
    pub fn message_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Generate a unique name for testing
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.name("queue", "main"), "test-queue-7-main");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Exchange name, e.g. `events_test_12345`
    pub fn exchange(&self, prefix: &str) -> String {
        format!("{}_test_{}", prefix, self.seed)
    }

    /// Queue name, e.g. `test.12345.orders`
    pub fn queue(&self, suffix: &str) -> String {
        format!("test.{}.{}", self.seed, suffix)
    }

    /// Routing key, e.g. `12345.orders.created`
    pub fn routing_key(&self, suffix: &str) -> String {
        format!("{}.{}", self.seed, suffix)
    }

    /// Numbered payloads: `"{prefix}-0"`, `"{prefix}-1"`, ...
    pub fn payloads(&self, prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{}-{}", prefix, i)).collect()
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::collections::HashSet;
    use std::hash::Hash;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert every expected item appears in `actual` at least once
    pub fn assert_contains_all<T>(actual: &[T], expected: &[T], context: &str)
    where
        T: Eq + Hash + std::fmt::Debug,
    {
        let seen: HashSet<&T> = actual.iter().collect();
        let missing: Vec<&T> = expected.iter().filter(|e| !seen.contains(e)).collect();
        assert!(
            missing.is_empty(),
            "{}: {} of {} expected items missing: {:?}",
            context,
            missing.len(),
            expected.len(),
            missing
        );
    }
}
