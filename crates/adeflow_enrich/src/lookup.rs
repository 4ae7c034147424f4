use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Failure;

/// One result row of a lookup: field name -> value.
pub type LookupRecord = BTreeMap<String, String>;

/// An external resolution service.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Cache namespace for answers from this service.
    fn domain(&self) -> &str;

    async fn lookup(&self, key: &str) -> Result<Vec<LookupRecord>, Failure>;
}

/// Where answers come from for this run.
#[derive(Clone)]
pub enum LookupMode {
    Live(Arc<dyn Lookup>),
    /// Offline placeholders; never touches the network.
    Demo(DemoLookup),
}

impl LookupMode {
    /// Demo answers are kept in their own namespace so they never mix with live ones.
    pub fn cache_domain(&self) -> String {
        match self {
            LookupMode::Live(lookup) => lookup.domain().to_string(),
            LookupMode::Demo(demo) => format!("{}.demo", demo.domain),
        }
    }

    pub fn is_demo(&self) -> bool {
        matches!(self, LookupMode::Demo(_))
    }
}

impl std::fmt::Debug for LookupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupMode::Live(lookup) => write!(f, "Live({})", lookup.domain()),
            LookupMode::Demo(demo) => write!(f, "Demo({})", demo.domain),
        }
    }
}

/// Deterministic stand-in for a live service.
#[derive(Debug, Clone)]
pub struct DemoLookup {
    domain: String,
    id_field: String,
    /// `(field, prefix)`: adds `field = <prefix><id mod 10^5, 5 digits>`.
    label: Option<(String, String)>,
}

const DEMO_ID_MODULUS: u64 = 100_000_000;

impl DemoLookup {
    pub fn new(domain: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            id_field: id_field.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, field: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.label = Some((field.into(), prefix.into()));
        self
    }

    /// Placeholder derived only from the key: a numeric id below 10^8 taken
    /// from the blake3 digest, tagged `source = demo`.
    pub fn records(&self, key: &str) -> Vec<LookupRecord> {
        let digest = blake3::hash(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let id = u64::from_be_bytes(prefix) % DEMO_ID_MODULUS;
        let mut record = BTreeMap::from([
            (self.id_field.clone(), id.to_string()),
            ("source".to_string(), "demo".to_string()),
        ]);
        if let Some((field, prefix)) = &self.label {
            record.insert(field.clone(), format!("{}{:05}", prefix, id % 100_000));
        }
        vec![record]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_records_depend_only_on_key() {
        let a = DemoLookup::new("rxnav", "rxcui");
        let b = DemoLookup::new("rxnav", "rxcui");
        assert_eq!(a.records("aspirin"), b.records("aspirin"));
        assert_ne!(a.records("aspirin"), a.records("ibuprofen"));

        let record = &a.records("aspirin")[0];
        let id: u64 = record["rxcui"].parse().unwrap();
        assert!(id < DEMO_ID_MODULUS);
        assert_eq!(record["source"], "demo");
    }

    #[test]
    fn demo_label_tracks_the_id() {
        let demo = DemoLookup::new("rxnav_ingredient", "ingredient_rxcui").with_label("inn", "ING-");
        let record = &demo.records("1191")[0];
        let id: u64 = record["ingredient_rxcui"].parse().unwrap();
        assert_eq!(record["inn"], format!("ING-{:05}", id % 100_000));
        assert_eq!(record["inn"].len(), 9);
    }

    #[test]
    fn demo_uses_separate_cache_domain() {
        let mode = LookupMode::Demo(DemoLookup::new("rxnav", "rxcui"));
        assert_eq!(mode.cache_domain(), "rxnav.demo");
        assert!(mode.is_demo());
    }
}
