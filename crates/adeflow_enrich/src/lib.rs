//! Rate-limited, cached enrichment of lookup keys against an external service.
//!
//! The flow for a batch of keys:
//! 1. Normalize and deduplicate the keys.
//! 2. Answer what we can from the persistent [`LookupCache`] (tombstones included).
//! 3. Fan the rest out over a bounded worker pool. Every outbound call takes a
//!    permit from the shared [`RateBudget`] first.
//! 4. Classify failures and let [`decide`] pick retry, tombstone or give up.
//! 5. Append each resolution to the cache as soon as it is known.
//!
//! Demo mode swaps the service for deterministic placeholders so the whole
//! pipeline can run offline.

mod cache;
mod client;
mod error;
mod key;
mod lookup;
mod rate;
mod retry;
pub mod rxnav;

pub use cache::{CacheEntry, CachedValue, LookupCache};
pub use client::{EnrichConfig, EnrichOutcome, EnrichmentClient, LookupStats, Resolution};
pub use error::{EnrichError, EnrichResult};
pub use key::normalize_key;
pub use lookup::{DemoLookup, Lookup, LookupMode, LookupRecord};
pub use rate::RateBudget;
pub use retry::{decide, Failure, RetryDecision, RetryPolicy};
pub use rxnav::{RxNavIngredientLookup, RxNavLookup};
