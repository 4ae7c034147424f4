use adeflow_enrich::rxnav::{
    INGREDIENT_RXCUI_FIELD, INN_FIELD, RXNAV_DOMAIN, RXNAV_INGREDIENT_DOMAIN,
};
use adeflow_enrich::{
    normalize_key, DemoLookup, EnrichConfig, EnrichOutcome, EnrichmentClient, Lookup,
    LookupCache, LookupMode, LookupRecord, RateBudget, Resolution, RetryPolicy,
    RxNavIngredientLookup, RxNavLookup,
};
use adeflow_merge::{BatchSource, ParquetSource, SourceFilter};
use adeflow_store::BatchFileWriter;
use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{StageContext, StageRunner};

/// Status column of an enrichment artifact: `found`, `not_found` or `unresolved`.
pub const LOOKUP_STATUS_COLUMN: &str = "lookup_status";
const DEFAULT_ID_FIELD: &str = "rxcui";
const DEMO_INN_PREFIX: &str = "ING-";
const ROWS_PER_BATCH: usize = 8192;

/// Resolves the distinct values of one key column and writes one row per
/// returned record, sorted by key.
///
/// With ingredients enabled, the ids found in the first pass (`id_field`)
/// are resolved again to their ingredient, and every found record gains
/// `inn` and `ingredient_rxcui` columns.
#[derive(Clone)]
pub struct EnrichRunner {
    pub key_column: String,
    lookup: Option<Arc<dyn Lookup>>,
    ingredient_lookup: Option<Arc<dyn Lookup>>,
    pub ingredients: bool,
    base_url: Option<String>,
    /// Record field that carries the demo placeholder id.
    pub id_field: String,
    /// Output record columns; the union of returned fields when unset.
    pub fields: Option<Vec<String>>,
    pub retry: RetryPolicy,
}

impl EnrichRunner {
    /// Resolve against RxNav.
    pub fn rxnav(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            lookup: None,
            ingredient_lookup: None,
            ingredients: false,
            base_url: None,
            id_field: DEFAULT_ID_FIELD.to_string(),
            fields: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Resolve against any [`Lookup`].
    pub fn with_lookup(key_column: impl Into<String>, lookup: Arc<dyn Lookup>) -> Self {
        Self {
            lookup: Some(lookup),
            ..Self::rxnav(key_column)
        }
    }

    pub fn ingredients(mut self, enabled: bool) -> Self {
        self.ingredients = enabled;
        self
    }

    /// Resolve ingredients against any [`Lookup`]; enables the second pass.
    pub fn with_ingredient_lookup(mut self, lookup: Arc<dyn Lookup>) -> Self {
        self.ingredient_lookup = Some(lookup);
        self.ingredients = true;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn domain(&self) -> &str {
        match &self.lookup {
            Some(lookup) => lookup.domain(),
            None => RXNAV_DOMAIN,
        }
    }

    pub fn ingredient_domain(&self) -> &str {
        match &self.ingredient_lookup {
            Some(lookup) => lookup.domain(),
            None => RXNAV_INGREDIENT_DOMAIN,
        }
    }

    fn lookup_mode(&self, demo: bool, budget: &Arc<RateBudget>) -> Result<LookupMode> {
        if demo {
            return Ok(LookupMode::Demo(DemoLookup::new(self.domain(), &self.id_field)));
        }
        let lookup: Arc<dyn Lookup> = match &self.lookup {
            Some(lookup) => Arc::clone(lookup),
            None => {
                let mut rxnav = RxNavLookup::new()
                    .context("Failed to build RxNav client")?
                    .with_budget(Arc::clone(budget));
                if let Some(url) = &self.base_url {
                    rxnav = rxnav.with_base_url(url.clone());
                }
                Arc::new(rxnav)
            }
        };
        Ok(LookupMode::Live(lookup))
    }

    fn ingredient_mode(&self, demo: bool) -> Result<LookupMode> {
        if demo {
            let demo = DemoLookup::new(self.ingredient_domain(), INGREDIENT_RXCUI_FIELD)
                .with_label(INN_FIELD, DEMO_INN_PREFIX);
            return Ok(LookupMode::Demo(demo));
        }
        let lookup: Arc<dyn Lookup> = match &self.ingredient_lookup {
            Some(lookup) => Arc::clone(lookup),
            None => {
                let mut rxnav = RxNavIngredientLookup::new()
                    .context("Failed to build RxNav ingredient client")?;
                if let Some(url) = &self.base_url {
                    rxnav = rxnav.with_base_url(url.clone());
                }
                Arc::new(rxnav)
            }
        };
        Ok(LookupMode::Live(lookup))
    }

    async fn resolve<I, S>(
        &self,
        ctx: &StageContext<'_>,
        mode: LookupMode,
        keys: I,
    ) -> Result<EnrichOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cache = LookupCache::open(&ctx.env.cache_dir, &mode.cache_domain())
            .context("Failed to open lookup cache")?;
        let config = EnrichConfig {
            qps: ctx.env.qps,
            max_workers: ctx.env.max_workers,
            retry: self.retry.clone(),
        };
        let client =
            EnrichmentClient::new(Arc::new(cache), Arc::clone(&ctx.env.budget), mode, config)?;
        Ok(client.resolve_many(keys).await?)
    }

    /// Second pass: id -> ingredient, copied onto every found record.
    async fn add_ingredients(
        &self,
        ctx: &StageContext<'_>,
        resolutions: &mut BTreeMap<String, Resolution>,
    ) -> Result<()> {
        let ids: BTreeSet<String> = resolutions
            .values()
            .filter_map(|resolution| match resolution {
                Resolution::Found { records } => Some(records),
                _ => None,
            })
            .flatten()
            .filter_map(|record| record.get(&self.id_field).cloned())
            .collect();

        let mode = self.ingredient_mode(ctx.env.demo)?;
        let outcome = self.resolve(ctx, mode, &ids).await?;
        info!(
            stage = ctx.name(),
            ids = outcome.stats.unique_keys,
            cache_hits = outcome.stats.cache_hits,
            calls = outcome.stats.calls,
            unresolved = outcome.stats.unresolved,
            "Ingredient lookup resolved {} ids",
            outcome.resolutions.len()
        );

        for resolution in resolutions.values_mut() {
            let Resolution::Found { records } = resolution else {
                continue;
            };
            for record in records.iter_mut() {
                let ingredient = record
                    .get(&self.id_field)
                    .and_then(|id| normalize_key(id))
                    .and_then(|id| match outcome.resolutions.get(&id) {
                        Some(Resolution::Found { records }) => records.first(),
                        _ => None,
                    });
                if let Some(ingredient) = ingredient {
                    for field in [INN_FIELD, INGREDIENT_RXCUI_FIELD] {
                        if let Some(value) = ingredient.get(field) {
                            record.insert(field.to_string(), value.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Columns that must exist even when no record carries them.
    fn required_fields(&self) -> Vec<String> {
        if self.ingredients {
            vec![INN_FIELD.to_string(), INGREDIENT_RXCUI_FIELD.to_string()]
        } else {
            Vec::new()
        }
    }
}

impl fmt::Debug for EnrichRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrichRunner")
            .field("key_column", &self.key_column)
            .field("domain", &self.domain())
            .field("base_url", &self.base_url)
            .field("id_field", &self.id_field)
            .field("fields", &self.fields)
            .field("ingredients", &self.ingredients)
            .finish()
    }
}

#[async_trait]
impl StageRunner for EnrichRunner {
    async fn run(&self, ctx: &StageContext<'_>) -> Result<()> {
        let input = ctx.input(0)?.to_path_buf();
        let output = ctx.output(0)?.to_path_buf();
        let shard = ctx.shard();
        let filter = SourceFilter {
            shard: shard
                .is_sharded()
                .then(|| (self.key_column.clone(), shard)),
            limit: ctx.env.sample_size,
        };

        let key_column = self.key_column.clone();
        let keys = tokio::task::spawn_blocking(move || read_keys(&input, &key_column, filter))
            .await
            .context("Key reader task panicked")??;

        let mode = self.lookup_mode(ctx.env.demo, &ctx.env.budget)?;
        let mut outcome = self.resolve(ctx, mode, &keys).await?;

        info!(
            stage = ctx.name(),
            keys = outcome.stats.unique_keys,
            cache_hits = outcome.stats.cache_hits,
            calls = outcome.stats.calls,
            "Enrichment resolved {} keys",
            outcome.resolutions.len()
        );
        if outcome.stats.unresolved > 0 {
            warn!(
                stage = ctx.name(),
                unresolved = outcome.stats.unresolved,
                "Some keys stayed unresolved; rerun with --force-stage {} to retry them",
                ctx.name()
            );
        }

        if self.ingredients {
            self.add_ingredients(ctx, &mut outcome.resolutions).await?;
        }

        let key_column = self.key_column.clone();
        let fields = self.fields.clone();
        let required = self.required_fields();
        let rows = tokio::task::spawn_blocking(move || {
            write_resolutions(&output, &key_column, fields, &required, &outcome.resolutions)
        })
        .await
        .context("Enrichment writer task panicked")??;
        info!(stage = ctx.name(), rows, "Wrote enrichment artifact");
        Ok(())
    }
}

/// Non-null values of `column`, as strings, after the shard filter and row cap.
fn read_keys(path: &Path, column: &str, filter: SourceFilter) -> Result<Vec<String>> {
    let source = ParquetSource::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .with_filter(filter);
    let index = source
        .schema()
        .index_of(column)
        .with_context(|| format!("Key column '{}' not found in {}", column, path.display()))?;

    let mut keys = Vec::new();
    for batch in source.batches()? {
        let batch = batch?;
        let values = cast(batch.column(index), &DataType::Utf8)?;
        let values = values
            .as_any()
            .downcast_ref::<StringArray>()
            .context("Key column did not cast to strings")?;
        keys.extend(values.iter().flatten().map(str::to_string));
    }
    Ok(keys)
}

fn output_schema(key_column: &str, fields: &[String]) -> SchemaRef {
    let mut columns = vec![
        Field::new(key_column, DataType::Utf8, false),
        Field::new(LOOKUP_STATUS_COLUMN, DataType::Utf8, false),
    ];
    columns.extend(
        fields
            .iter()
            .map(|name| Field::new(name.as_str(), DataType::Utf8, true)),
    );
    Arc::new(Schema::new(columns))
}

/// One output row per record; keys without records get a single row of nulls.
///
/// `required` columns are appended when `fields` does not list them. Fields
/// named like the key or status column, and repeated fields, are dropped.
fn write_resolutions(
    path: &Path,
    key_column: &str,
    fields: Option<Vec<String>>,
    required: &[String],
    resolutions: &BTreeMap<String, Resolution>,
) -> Result<u64> {
    let mut fields = fields.unwrap_or_else(|| {
        let mut seen = BTreeSet::new();
        for resolution in resolutions.values() {
            if let Resolution::Found { records } = resolution {
                for record in records {
                    seen.extend(record.keys().cloned());
                }
            }
        }
        seen.into_iter().collect()
    });
    fields.extend(required.iter().cloned());
    let mut taken = BTreeSet::from([key_column.to_string(), LOOKUP_STATUS_COLUMN.to_string()]);
    fields.retain(|field| {
        let fresh = taken.insert(field.clone());
        if !fresh {
            debug!(field = %field, "Dropping record field that repeats an output column");
        }
        fresh
    });
    let schema = output_schema(key_column, &fields);

    let mut rows: Vec<(&str, &'static str, Option<&LookupRecord>)> = Vec::new();
    for (key, resolution) in resolutions {
        match resolution {
            Resolution::Found { records } if !records.is_empty() => {
                rows.extend(records.iter().map(|r| (key.as_str(), resolution.status(), Some(r))));
            }
            _ => rows.push((key.as_str(), resolution.status(), None)),
        }
    }

    let mut writer = BatchFileWriter::create(path, schema.clone())?;
    for chunk in rows.chunks(ROWS_PER_BATCH) {
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(chunk.iter().map(|r| r.0))),
            Arc::new(StringArray::from_iter_values(chunk.iter().map(|r| r.1))),
        ];
        for field in &fields {
            let values: StringArray = chunk
                .iter()
                .map(|r| r.2.and_then(|record| record.get(field)).map(String::as_str))
                .collect();
            columns.push(Arc::new(values));
        }
        writer.write_batch(&RecordBatch::try_new(schema.clone(), columns)?)?;
    }
    Ok(writer.close()?)
}
