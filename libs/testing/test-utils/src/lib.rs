//! Shared test utilities for the dispatch workspace
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic recipients, keys and namespaces (always available)
//!
//! # Redis Testing
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let conn = redis.connection_manager().await;
//!     let ns = TestDataBuilder::from_test_name("my_redis_test").namespace("queue");
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic values
///
/// Keeps tests reproducible and lets tests sharing one Redis container stay
/// out of each other's keys.
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
    /// let builder = TestDataBuilder::from_test_name("test_submit_dedupes");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Key namespace for Redis-backed components, e.g. `test-queue-1234`
    pub fn namespace(&self, component: &str) -> String {
        format!("test-{}-{}", component, self.seed)
    }

    /// Recipient address unique to this builder
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.recipient("alice"), "alice+7@example.test");
    /// ```
    pub fn recipient(&self, name: &str) -> String {
        format!("{}+{}@example.test", name, self.seed)
    }

    /// Idempotency key unique to this builder
    pub fn idempotency_key(&self, suffix: &str) -> String {
        format!("idem-{}-{}", self.seed, suffix)
    }

    /// Job id unique to this builder
    pub fn job_id(&self, suffix: &str) -> String {
        let id = uuid::Uuid::from_u64_pair(self.seed, self.seed.rotate_left(17));
        format!("{}-{}", id, suffix)
    }
}
