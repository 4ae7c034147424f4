//! Built-in runners (enrich, merge, command) and TOML pipelines, end to end.

use adeflow::runners::{
    CommandRunner, EnrichRunner, MergeCoverage, MergeRunner, LOOKUP_STATUS_COLUMN,
};
use adeflow::{
    ForceMode, Orchestrator, Pipeline, PipelineError, PipelineFile, RunOptions, RunnerKind, Stage,
    StageDecision, StageStatus,
};
use adeflow_enrich::{Failure, Lookup, LookupRecord};
use adeflow_merge::JoinSpec;
use adeflow_store::{read_json, ArtifactReader, BatchFileWriter};
use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn write_parquet(path: &Path, columns: Vec<(&str, ArrayRef)>) {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let batch =
        RecordBatch::try_new(schema.clone(), columns.into_iter().map(|(_, a)| a).collect())
            .unwrap();
    let mut writer = BatchFileWriter::create(path, schema).unwrap();
    writer.write_batch(&batch).unwrap();
    writer.close().unwrap();
}

fn utf8(values: Vec<&str>) -> ArrayRef {
    Arc::new(StringArray::from(values))
}

fn int64(values: Vec<i64>) -> ArrayRef {
    Arc::new(Int64Array::from(values))
}

fn read_all(path: &Path) -> RecordBatch {
    let reader = ArtifactReader::open(path).unwrap();
    let schema = reader.schema();
    let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
    concat_batches(&schema, &batches).unwrap()
}

fn strings(batch: &RecordBatch, column: &str) -> Vec<Option<String>> {
    let index = batch.schema().index_of(column).unwrap();
    let array = batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
        .collect()
}

fn options(data_dir: &Path, run_id: &str) -> RunOptions {
    let mut options = RunOptions::new(data_dir);
    options.run_id = Some(run_id.to_string());
    options.qps = 1_000.0;
    options
}

fn seed_drug_dict(data_dir: &Path) {
    write_parquet(
        &data_dir.join("split/drug_dict.parquet"),
        vec![(
            "drugname_norm",
            Arc::new(StringArray::from(vec![
                Some("Aspirin"),
                Some(" aspirin "),
                Some("METFORMIN"),
                None,
                Some("   "),
            ])) as ArrayRef,
        )],
    );
}

#[tokio::test]
async fn demo_enrichment_is_offline_and_reproducible() {
    let dir = tempdir().unwrap();
    seed_drug_dict(dir.path());
    let stages = vec![Stage::new(
        "drug_enrich",
        RunnerKind::Enrich(EnrichRunner::rxnav("drugname_norm")),
    )
    .input("split/drug_dict.parquet")
    .unwrap()
    .output("drug_rxnorm.parquet")
    .unwrap()];
    let pipeline = Pipeline::new("enrich-demo", stages).unwrap();

    let mut demo = options(dir.path(), "demo1");
    demo.demo = true;
    Orchestrator::run(&pipeline, &demo).await.unwrap();

    let output = dir.path().join("drug_enrich/drug_rxnorm.parquet");
    let batch = read_all(&output);
    let names: Vec<String> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(
        names,
        vec!["drugname_norm", LOOKUP_STATUS_COLUMN, "rxcui", "source"]
    );
    assert_eq!(
        strings(&batch, "drugname_norm"),
        vec![Some("aspirin".to_string()), Some("metformin".to_string())]
    );
    assert!(strings(&batch, LOOKUP_STATUS_COLUMN)
        .iter()
        .all(|s| s.as_deref() == Some("found")));
    assert!(strings(&batch, "source")
        .iter()
        .all(|s| s.as_deref() == Some("demo")));

    // Demo answers are cached apart from live ones.
    assert!(dir.path().join("_cache/rxnav.demo.ndjson").is_file());
    assert!(!dir.path().join("_cache/rxnav.ndjson").exists());

    let before = std::fs::read(&output).unwrap();
    let mut again = options(dir.path(), "demo2");
    again.demo = true;
    again.force = ForceMode::All;
    let report = Orchestrator::run(&pipeline, &again).await.unwrap();
    assert_eq!(report.stages[0].status, StageStatus::Ran);
    assert_eq!(std::fs::read(&output).unwrap(), before);
}

/// Finds everything except `missing*`, counting calls.
#[derive(Default)]
struct CountingLookup {
    calls: AtomicUsize,
}

#[async_trait]
impl Lookup for CountingLookup {
    fn domain(&self) -> &str {
        "counting"
    }

    async fn lookup(&self, key: &str) -> Result<Vec<LookupRecord>, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if key.starts_with("missing") {
            return Err(Failure::NotFound);
        }
        Ok(vec![BTreeMap::from([(
            "rxcui".to_string(),
            format!("rx-{}", key),
        )])])
    }
}

#[tokio::test]
async fn live_enrichment_uses_the_cache_on_rerun() {
    let dir = tempdir().unwrap();
    write_parquet(
        &dir.path().join("split/drug_dict.parquet"),
        vec![("drug", utf8(vec!["b", "a", "missing", "A"]))],
    );
    let lookup = Arc::new(CountingLookup::default());
    let stages = vec![Stage::new(
        "drug_enrich",
        RunnerKind::Enrich(EnrichRunner::with_lookup("drug", lookup.clone())),
    )
    .input("split/drug_dict.parquet")
    .unwrap()
    .output("drug_rxnorm.parquet")
    .unwrap()];
    let pipeline = Pipeline::new("enrich-live", stages).unwrap();

    Orchestrator::run(&pipeline, &options(dir.path(), "live1"))
        .await
        .unwrap();
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);

    let batch = read_all(&dir.path().join("drug_enrich/drug_rxnorm.parquet"));
    assert_eq!(
        strings(&batch, "drug"),
        vec![
            Some("a".to_string()),
            Some("b".to_string()),
            Some("missing".to_string())
        ]
    );
    assert_eq!(
        strings(&batch, LOOKUP_STATUS_COLUMN),
        vec![
            Some("found".to_string()),
            Some("found".to_string()),
            Some("not_found".to_string())
        ]
    );
    assert_eq!(strings(&batch, "rxcui")[2], None);

    let mut forced = options(dir.path(), "live2");
    forced.force = ForceMode::All;
    Orchestrator::run(&pipeline, &forced).await.unwrap();
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
}

/// Minimal RxNav stand-in on a local port; returns its base URL.
async fn serve_rxnav() -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let body = if request.contains("GET /rxcui/1191/related.json") {
                    r#"{"relatedGroup":{"conceptGroup":[{"tty":"IN","conceptProperties":[{"rxcui":"1191","name":"aspirin"}]}]}}"#
                } else if request.contains("GET /approximateTerm.json") && request.contains("term=asprin") {
                    r#"{"approximateGroup":{"candidate":[{"rxcui":"1191","name":"aspirin"}]}}"#
                } else if request.contains("GET /approximateTerm.json") {
                    r#"{"approximateGroup":{}}"#
                } else if request.contains("name=aspirin") {
                    r#"{"idGroup":{"name":"aspirin","rxnormId":["1191"]}}"#
                } else {
                    r#"{"idGroup":{}}"#
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

fn rxnav_stage(runner: EnrichRunner) -> Vec<Stage> {
    vec![Stage::new("drug_enrich", RunnerKind::Enrich(runner))
        .input("split/drug_dict.parquet")
        .unwrap()
        .output("drug_rxnorm.parquet")
        .unwrap()]
}

#[tokio::test]
async fn rxnav_enrichment_falls_back_and_adds_ingredients() {
    let dir = tempdir().unwrap();
    write_parquet(
        &dir.path().join("split/drug_dict.parquet"),
        vec![("drugname_norm", utf8(vec!["Aspirin", "asprin", "unknownium"]))],
    );
    let base = serve_rxnav().await;
    let runner = EnrichRunner::rxnav("drugname_norm")
        .base_url(base)
        .ingredients(true);
    let pipeline = Pipeline::new("rxnav", rxnav_stage(runner)).unwrap();

    Orchestrator::run(&pipeline, &options(dir.path(), "rx1"))
        .await
        .unwrap();

    let batch = read_all(&dir.path().join("drug_enrich/drug_rxnorm.parquet"));
    let some = |v: &str| Some(v.to_string());
    assert_eq!(
        strings(&batch, "drugname_norm"),
        vec![some("aspirin"), some("asprin"), some("unknownium")]
    );
    assert_eq!(
        strings(&batch, "match_type"),
        vec![some("exact"), some("approximate"), None]
    );
    assert_eq!(
        strings(&batch, "inn"),
        vec![some("aspirin"), some("aspirin"), None]
    );
    assert_eq!(
        strings(&batch, "ingredient_rxcui"),
        vec![some("1191"), some("1191"), None]
    );
    assert_eq!(strings(&batch, LOOKUP_STATUS_COLUMN)[2], some("not_found"));

    assert!(dir.path().join("_cache/rxnav.ndjson").is_file());
    assert!(dir.path().join("_cache/rxnav_ingredient.ndjson").is_file());
}

#[tokio::test]
async fn demo_ingredients_are_placeholders() {
    let dir = tempdir().unwrap();
    seed_drug_dict(dir.path());
    let runner = EnrichRunner::rxnav("drugname_norm").ingredients(true);
    let pipeline = Pipeline::new("rxnav-demo", rxnav_stage(runner)).unwrap();

    let mut demo = options(dir.path(), "rxd1");
    demo.demo = true;
    Orchestrator::run(&pipeline, &demo).await.unwrap();

    let batch = read_all(&dir.path().join("drug_enrich/drug_rxnorm.parquet"));
    let inn = strings(&batch, "inn");
    assert_eq!(inn.len(), 2);
    assert!(inn.iter().all(|v| v.as_deref().is_some_and(|v| v.starts_with("ING-"))));
    assert!(strings(&batch, "ingredient_rxcui").iter().all(Option::is_some));
    assert!(dir.path().join("_cache/rxnav_ingredient.demo.ndjson").is_file());
}

fn seed_merge_inputs(data_dir: &Path) {
    write_parquet(
        &data_dir.join("split/drug_map.parquet"),
        vec![
            ("primaryid", int64(vec![1, 1, 2, 3])),
            (
                "drugname_norm",
                utf8(vec!["aspirin", "metformin", "aspirin", "unknown"]),
            ),
        ],
    );
    write_parquet(
        &data_dir.join("drug_enrich/drug_rxnorm.parquet"),
        vec![
            ("drugname_norm", utf8(vec!["aspirin", "metformin"])),
            ("rxcui", utf8(vec!["1191", "6809"])),
        ],
    );
    write_parquet(
        &data_dir.join("adr_map/reactions.parquet"),
        vec![
            ("primaryid", int64(vec![1, 2, 2])),
            (
                "pt",
                utf8(vec!["nausea", "rash", "headache"]),
            ),
        ],
    );
}

#[tokio::test]
async fn merge_back_writes_rows_and_coverage() {
    let dir = tempdir().unwrap();
    seed_merge_inputs(dir.path());
    let runner = MergeRunner::new(vec![
        JoinSpec::on(["drugname_norm"]),
        JoinSpec::on(["primaryid"]),
    ]);
    let stages = vec![Stage::new("merge_back", RunnerKind::Merge(runner))
        .input("split/drug_map.parquet")
        .unwrap()
        .input("drug_enrich/drug_rxnorm.parquet")
        .unwrap()
        .input("adr_map/reactions.parquet")
        .unwrap()
        .output("merged.parquet")
        .unwrap()
        .output("coverage.json")
        .unwrap()];
    let pipeline = Pipeline::new("merge", stages).unwrap();

    Orchestrator::run(&pipeline, &options(dir.path(), "m1"))
        .await
        .unwrap();

    let batch = read_all(&dir.path().join("merge_back/merged.parquet"));
    assert_eq!(batch.num_rows(), 5);
    assert_eq!(
        strings(&batch, "rxcui"),
        vec![
            Some("1191".to_string()),
            Some("6809".to_string()),
            Some("1191".to_string()),
            Some("1191".to_string()),
            None
        ]
    );

    let coverage: MergeCoverage =
        read_json(&dir.path().join("merge_back/coverage.json")).unwrap();
    assert_eq!(coverage.left_rows, 4);
    assert_eq!(coverage.rows_written, 5);
    assert_eq!(coverage.steps.len(), 2);
    assert_eq!(coverage.steps[0].right_input, "drug_enrich/drug_rxnorm.parquet");
    assert_eq!(coverage.steps[0].stats.matched_left_rows, 3);
    assert_eq!(coverage.steps[0].stats.unmatched_left_rows, 1);
    assert_eq!(coverage.steps[1].stats.unmatched_left_rows, 1);

    let inputs: Vec<(&str, u64)> = coverage
        .inputs
        .iter()
        .map(|i| (i.artifact.as_str(), i.rows))
        .collect();
    assert_eq!(
        inputs,
        vec![
            ("split/drug_map.parquet", 4),
            ("drug_enrich/drug_rxnorm.parquet", 2),
            ("adr_map/reactions.parquet", 3),
        ]
    );
    assert_eq!(
        coverage.outputs,
        vec!["merge_back/merged.parquet", "merge_back/coverage.json"]
    );
    let keys: Vec<(u64, u64, u64)> = coverage
        .steps
        .iter()
        .map(|s| (s.left_keys_before, s.right_keys, s.left_keys_after))
        .collect();
    // "unknown" has no rxcui but survives the left outer join.
    assert_eq!(keys, vec![(3, 2, 3), (3, 2, 3)]);
}

#[cfg(unix)]
mod command {
    use super::*;

    fn seed_raw(data_dir: &Path) {
        std::fs::create_dir_all(data_dir.join("raw")).unwrap();
        std::fs::write(data_dir.join("raw/source.txt"), "raw rows\n").unwrap();
    }

    fn shell_stage(name: &str, script: &str, extra: &[&str]) -> Stage {
        let mut args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        Stage::new(name, RunnerKind::Command(CommandRunner::new("sh").args(args)))
    }

    #[tokio::test]
    async fn placeholders_and_step_log() {
        let dir = tempdir().unwrap();
        seed_raw(dir.path());
        let stages = vec![shell_stage(
            "upper",
            "echo converting; tr a-z A-Z < \"$1\" > \"$2\"",
            &["{input:0}", "{output:0}"],
        )
        .input("raw/source.txt")
        .unwrap()
        .output("upper.txt")
        .unwrap()];
        let pipeline = Pipeline::new("cmd", stages).unwrap();

        Orchestrator::run(&pipeline, &options(dir.path(), "c1"))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("upper/upper.txt")).unwrap(),
            "RAW ROWS\n"
        );
        let log = std::fs::read_to_string(dir.path().join("_logs/steps/c1_upper.log")).unwrap();
        assert!(log.contains("converting"));
    }

    #[tokio::test]
    async fn environment_carries_run_parameters() {
        let dir = tempdir().unwrap();
        let stages = vec![shell_stage(
            "env",
            "printf '%s/%s' \"$ADEFLOW_SHARDS\" \"$ADEFLOW_DEMO\" > \"$ADEFLOW_OUTPUT_0\"",
            &[],
        )
        .output("env.txt")
        .unwrap()];
        let pipeline = Pipeline::new("cmd-env", stages).unwrap();

        let mut demo = options(dir.path(), "e1");
        demo.demo = true;
        Orchestrator::run(&pipeline, &demo).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("env/env.txt")).unwrap(),
            "1/1"
        );
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_stage() {
        let dir = tempdir().unwrap();
        let stages = vec![shell_stage("boom", "echo boom >&2; exit 3", &[])
            .output("never.txt")
            .unwrap()];
        let pipeline = Pipeline::new("cmd-fail", stages).unwrap();

        let err = Orchestrator::run(&pipeline, &options(dir.path(), "f1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { stage_index: 1, .. }));
        assert!(err.to_string().contains("exited with"));
        let log = std::fs::read_to_string(dir.path().join("_logs/steps/f1_boom.log")).unwrap();
        assert!(log.contains("[stderr] boom"));
        assert!(!dir.path().join("boom/never.txt").exists());
    }

    #[tokio::test]
    async fn toml_pipeline_runs_relative_to_its_file() {
        let dir = tempdir().unwrap();
        let toml_path = dir.path().join("copy.toml");
        std::fs::write(
            &toml_path,
            r#"
[settings]
name = "toml-e2e"
data_dir = "data"

[[stages]]
name = "copy"
kind = "command"
inputs = ["raw/source.txt"]
outputs = ["copy.txt"]

[stages.command]
program = "sh"
args = ["-c", "cp \"$1\" \"$2\"", "sh", "{input:0}", "{output:0}"]
"#,
        )
        .unwrap();
        seed_raw(&dir.path().join("data"));

        let file = PipelineFile::load(&toml_path).unwrap();
        let pipeline = file.build().unwrap();
        let mut run = file.run_options();
        run.run_id = Some("t1".to_string());
        let report = Orchestrator::run(&pipeline, &run).await.unwrap();

        assert_eq!(report.pipeline, "toml-e2e");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("data/copy/copy.txt")).unwrap(),
            "raw rows\n"
        );
    }
}

#[test]
fn bundled_faers_pipeline_builds() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../pipelines/faers.toml");
    let file = PipelineFile::load(&path).unwrap();
    let pipeline = file.build().unwrap();

    let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "parse",
            "er_tables",
            "baseline",
            "split",
            "adr_map",
            "drug_enrich",
            "merge_back",
            "cohorts",
            "qa",
            "release"
        ]
    );
    assert_eq!(pipeline.stages()[5].runner.kind(), "enrich");
    assert_eq!(pipeline.stages()[6].runner.kind(), "merge");
    assert!(!pipeline.stages()[8].critical);

    let data = tempdir().unwrap();
    let mut run = file.run_options();
    run.data_dir = data.path().to_path_buf();
    let status = Orchestrator::status(&pipeline, &run).unwrap();
    assert_eq!(
        status.stages[0].decision,
        StageDecision::BlockedBy {
            artifact: "raw/faers_ascii.zip".to_string()
        }
    );
    assert!(status.stages[1..]
        .iter()
        .all(|s| s.decision == StageDecision::NotReached));
}
