//! redb table definitions for the Stagehand state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow `{environment}/{service}`, `{service}:{seq}`
//! or `{repository}@{digest}`.

use redb::TableDefinition;

/// Live deployments keyed by `{environment}/{service}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Promotion audit records keyed by `{service}:{seq}` (zero-padded, so
/// lexicographic order is start order).
pub const PROMOTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("promotions");

/// Indexed images keyed by `{repository}@{digest}`.
pub const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("images");

/// Mutable tag pointers keyed by `{repository}:{tag}`, value is the digest.
pub const TAGS: TableDefinition<&str, &str> = TableDefinition::new("tags");

/// Monotonic counters.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Counter key for promotion sequence numbers.
pub const PROMOTION_SEQ: &str = "promotion_seq";
