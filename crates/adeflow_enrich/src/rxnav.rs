//! RxNorm resolution against the NLM RxNav REST API.
//!
//! Two lookups share one HTTP client:
//! - [`RxNavLookup`]: drug name -> RxCUI. `rxcui.json?search=2` first, then
//!   `approximateTerm.json?maxEntries=1` when the exact match is empty.
//! - [`RxNavIngredientLookup`]: RxCUI -> ingredient (INN) name and RxCUI via
//!   `rxcui/{id}/related.json?tty=IN`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{EnrichResult, Failure, Lookup, LookupRecord, RateBudget};

pub const RXNAV_BASE_URL: &str = "https://rxnav.nlm.nih.gov/REST";
pub const RXNAV_DOMAIN: &str = "rxnav";
pub const RXNAV_INGREDIENT_DOMAIN: &str = "rxnav_ingredient";
/// Record fields written by [`RxNavIngredientLookup`].
pub const INN_FIELD: &str = "inn";
pub const INGREDIENT_RXCUI_FIELD: &str = "ingredient_rxcui";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct RxcuiResponse {
    #[serde(rename = "idGroup", default)]
    id_group: Option<IdGroup>,
}

#[derive(Debug, Deserialize)]
struct IdGroup {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "rxnormId", default)]
    rxnorm_id: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApproximateResponse {
    #[serde(rename = "approximateGroup", default)]
    approximate_group: Option<ApproximateGroup>,
}

#[derive(Debug, Deserialize)]
struct ApproximateGroup {
    #[serde(default)]
    candidate: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    rxcui: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelatedResponse {
    #[serde(rename = "relatedGroup", default)]
    related_group: Option<RelatedGroup>,
}

#[derive(Debug, Deserialize)]
struct RelatedGroup {
    #[serde(rename = "conceptGroup", default)]
    concept_group: Vec<ConceptGroup>,
}

#[derive(Debug, Deserialize)]
struct ConceptGroup {
    #[serde(rename = "conceptProperties", default)]
    concept_properties: Vec<ConceptProperties>,
}

#[derive(Debug, Deserialize)]
struct ConceptProperties {
    rxcui: String,
    name: String,
}

#[derive(Debug, Clone)]
struct RxNavHttp {
    client: reqwest::Client,
    base_url: String,
}

impl RxNavHttp {
    fn new() -> EnrichResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("adeflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: RXNAV_BASE_URL.to_string(),
        })
    }

    fn set_base_url(&mut self, base_url: String) {
        self.base_url = base_url.trim_end_matches('/').to_string();
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Failure> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Failure::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        response
            .json()
            .await
            .map_err(|e| Failure::Permanent(format!("malformed response: {}", e)))
    }
}

/// Map a non-success status to a failure class.
pub fn classify_status(status: StatusCode) -> Failure {
    if status == StatusCode::NOT_FOUND {
        Failure::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Failure::Transient(format!("HTTP {}", status.as_u16()))
    } else {
        Failure::Permanent(format!("HTTP {}", status.as_u16()))
    }
}

fn name_record(rxcui: String, name: String, match_type: &str) -> LookupRecord {
    BTreeMap::from([
        ("rxcui".to_string(), rxcui),
        ("name".to_string(), name),
        ("match_type".to_string(), match_type.to_string()),
        ("source".to_string(), RXNAV_DOMAIN.to_string()),
    ])
}

fn records_from(body: RxcuiResponse, key: &str) -> Result<Vec<LookupRecord>, Failure> {
    let group = match body.id_group {
        Some(group) if !group.rxnorm_id.is_empty() => group,
        _ => return Err(Failure::NotFound),
    };
    let name = group.name.unwrap_or_else(|| key.to_string());
    Ok(group
        .rxnorm_id
        .into_iter()
        .map(|rxcui| name_record(rxcui, name.clone(), "exact"))
        .collect())
}

fn approximate_records(body: ApproximateResponse, key: &str) -> Result<Vec<LookupRecord>, Failure> {
    let best = body
        .approximate_group
        .and_then(|group| group.candidate.into_iter().next())
        .ok_or(Failure::NotFound)?;
    let name = best.name.unwrap_or_else(|| key.to_string());
    Ok(vec![name_record(best.rxcui, name, "approximate")])
}

/// First ingredient concept only; combination products report their first IN.
fn ingredient_records(body: RelatedResponse) -> Result<Vec<LookupRecord>, Failure> {
    let concept = body
        .related_group
        .into_iter()
        .flat_map(|group| group.concept_group)
        .flat_map(|group| group.concept_properties)
        .next()
        .ok_or(Failure::NotFound)?;
    Ok(vec![BTreeMap::from([
        (INN_FIELD.to_string(), concept.name),
        (INGREDIENT_RXCUI_FIELD.to_string(), concept.rxcui),
    ])])
}

/// Drug name -> RxCUI records, tagged `match_type = exact | approximate`.
pub struct RxNavLookup {
    http: RxNavHttp,
    /// Permit source for the approximate-match request. The worker pool only
    /// pays for the first request of each lookup.
    budget: Option<Arc<RateBudget>>,
}

impl RxNavLookup {
    pub fn new() -> EnrichResult<Self> {
        Ok(Self {
            http: RxNavHttp::new()?,
            budget: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.http.set_base_url(base_url.into());
        self
    }

    pub fn with_budget(mut self, budget: Arc<RateBudget>) -> Self {
        self.budget = Some(budget);
        self
    }
}

#[async_trait]
impl Lookup for RxNavLookup {
    fn domain(&self) -> &str {
        RXNAV_DOMAIN
    }

    async fn lookup(&self, key: &str) -> Result<Vec<LookupRecord>, Failure> {
        let exact = self
            .http
            .get_json::<RxcuiResponse>("rxcui.json", &[("name", key), ("search", "2")])
            .await
            .and_then(|body| records_from(body, key));
        match exact {
            Err(Failure::NotFound) => {}
            other => return other,
        }

        if let Some(budget) = &self.budget {
            budget.acquire().await;
        }
        let body: ApproximateResponse = self
            .http
            .get_json("approximateTerm.json", &[("term", key), ("maxEntries", "1")])
            .await?;
        approximate_records(body, key)
    }
}

/// RxCUI -> `inn` and `ingredient_rxcui`.
pub struct RxNavIngredientLookup {
    http: RxNavHttp,
}

impl RxNavIngredientLookup {
    pub fn new() -> EnrichResult<Self> {
        Ok(Self {
            http: RxNavHttp::new()?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.http.set_base_url(base_url.into());
        self
    }
}

#[async_trait]
impl Lookup for RxNavIngredientLookup {
    fn domain(&self) -> &str {
        RXNAV_INGREDIENT_DOMAIN
    }

    async fn lookup(&self, key: &str) -> Result<Vec<LookupRecord>, Failure> {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Failure::Permanent(format!("'{}' is not an RxCUI", key)));
        }
        let body: RelatedResponse = self
            .http
            .get_json(&format!("rxcui/{}/related.json", key), &[("tty", "IN")])
            .await?;
        ingredient_records(body)
    }
}
