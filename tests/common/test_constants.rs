//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// Template used by launch fixtures.
pub const TEST_IMAGE_ID: &str = "tpl-ubuntu-1204";

/// Offering used by launch fixtures.
pub const TEST_PRODUCT_ID: &str = "svc-small";
