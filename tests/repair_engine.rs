use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ccsi_harness::cache::SqliteReplyCache;
use ccsi_harness::catalog::{EraId, RecordKey};
use ccsi_harness::config::EngineConfig;
use ccsi_harness::dataset::{Dataset, IndicatorRecord};
use ccsi_harness::gateway::{ProviderError, TextOracle};
use ccsi_harness::indicators::ScoreVector;
use ccsi_harness::prompts::PromptInstance;
use ccsi_harness::repair::{
    GenerationPlan, Provenance, RowRepairEngine, INTERPOLATED_NOTE, INTERPOLATED_SOURCES,
    MODERN_FALLBACK_NOTE,
};

const NOTE: &str = "Satavahana-era trade networks and guild patronage supported broad \
                    participation across caste and sect lines in the Deccan.";

fn valid_reply(value: u8) -> String {
    serde_json::json!({
        "scores": vec![value; 25],
        "notes": NOTE,
        "sources": ["Thapar 2002", "Ray 1986", "Sircar 1965"],
    })
    .to_string()
}

/// Replays scripted replies, then repeats the fallback forever.
struct ScriptedOracle {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: fn() -> Result<String, ProviderError>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    fn new(
        script: Vec<Result<String, ProviderError>>,
        fallback: fn() -> Result<String, ProviderError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextOracle for ScriptedOracle {
    async fn request(&self, _prompt: &PromptInstance) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| (self.fallback)())
    }

    fn identity(&self) -> String {
        "scripted/m1".to_string()
    }
}

fn timeout() -> Result<String, ProviderError> {
    Err(ProviderError::Timeout(Duration::from_secs(120)))
}

fn short_note() -> Result<String, ProviderError> {
    Ok(serde_json::json!({
        "scores": vec![1; 25],
        "notes": "Too short.",
        "sources": ["a", "b", "c"],
    })
    .to_string())
}

fn refused() -> Result<String, ProviderError> {
    Err(ProviderError::refused("blocked"))
}

fn bad_request() -> Result<String, ProviderError> {
    Err(ProviderError::invalid_request("unknown model"))
}

fn misconfigured() -> Result<String, ProviderError> {
    Err(ProviderError::config("no API credential configured"))
}

fn always_valid() -> Result<String, ProviderError> {
    Ok(valid_reply(3))
}

fn scored(era: u32, region: &str, value: u8) -> IndicatorRecord {
    let mut record = IndicatorRecord::placeholder(EraId::historical(era), region);
    record.set_scores(&ScoreVector::uniform(value));
    record.notes = "Scored.".to_string();
    record.sources = "A; B; C".to_string();
    record.recompute_totals();
    record
}

/// E05 / Deccan needs repair; its neighbours average to 3.
fn deccan() -> Dataset {
    let mut failed = IndicatorRecord::placeholder(EraId::historical(5), "Deccan");
    failed.notes = "Parsing failed; placeholder summary.".to_string();
    Dataset::from_records(vec![scored(4, "Deccan", 2), failed, scored(6, "Deccan", 4)]).unwrap()
}

fn target() -> RecordKey {
    RecordKey::new(EraId::historical(5), "Deccan")
}

#[tokio::test(start_paused = true)]
async fn retries_transport_errors_with_linear_backoff() {
    let oracle = ScriptedOracle::new(vec![timeout(), timeout(), Ok(valid_reply(1))], always_valid);
    let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());
    let mut dataset = deccan();

    let start = tokio::time::Instant::now();
    let report = engine.repair_all(&mut dataset).await;
    let elapsed = start.elapsed();

    assert_eq!(oracle.calls(), 3);
    // 2s after the first failure, 4s after the second.
    assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
    assert_eq!(report.selected, 1);
    assert_eq!(report.oracle, 1);
    assert_eq!(report.oracle_attempts, 3);

    let record = dataset.get(&EraId::historical(5), "Deccan").unwrap();
    assert_eq!(record.score_vector(), Some(ScoreVector::uniform(1)));
    assert_eq!(record.notes, NOTE);
    assert_eq!(record.sources, "Thapar 2002; Ray 1986; Sircar 1965");
    assert!(!record.interpolated);
    assert_eq!(record.totals.ccsi, 25);
    assert!(dataset.inconsistent_totals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn persistent_validation_failure_falls_back_to_interpolation() {
    let oracle = ScriptedOracle::new(Vec::new(), short_note);
    let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());
    let mut dataset = deccan();

    let report = engine.repair_all(&mut dataset).await;

    assert_eq!(oracle.calls(), 3);
    assert_eq!(report.interpolated, 1);
    let record = dataset.get(&EraId::historical(5), "Deccan").unwrap();
    assert_eq!(record.score_vector(), Some(ScoreVector::uniform(3)));
    assert!(record.interpolated);
    assert_eq!(record.notes, INTERPOLATED_NOTE);
    assert_eq!(record.totals.ccsi, 75);
    assert!(!record.needs_repair());
}

#[tokio::test(start_paused = true)]
async fn rejected_and_refused_requests_use_the_whole_attempt_budget() {
    for failure in [refused as fn() -> Result<String, ProviderError>, bad_request] {
        let oracle = ScriptedOracle::new(Vec::new(), failure);
        let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());

        let row = engine.repair_row(&deccan(), &target()).await.unwrap();
        assert_eq!(oracle.calls(), 3);
        assert_eq!(row.provenance, Provenance::Fallback);
        assert_eq!(row.attempts, 3);
        assert!(row.interpolated);
    }
}

#[tokio::test(start_paused = true)]
async fn refusal_then_valid_reply_is_accepted() {
    let oracle = ScriptedOracle::new(vec![refused(), bad_request()], always_valid);
    let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());

    let row = engine.repair_row(&deccan(), &target()).await.unwrap();
    assert_eq!(oracle.calls(), 3);
    assert_eq!(row.provenance, Provenance::Oracle);
    assert!(!row.interpolated);
}

#[tokio::test(start_paused = true)]
async fn configuration_error_stops_after_one_attempt() {
    let oracle = ScriptedOracle::new(Vec::new(), misconfigured);
    let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());

    let row = engine.repair_row(&deccan(), &target()).await.unwrap();
    assert_eq!(oracle.calls(), 1);
    assert_eq!(row.provenance, Provenance::Fallback);
    assert_eq!(row.attempts, 1);
}

fn payload(scores: Vec<u8>, note: &str, sources: &[&str]) -> String {
    serde_json::json!({ "scores": scores, "notes": note, "sources": sources }).to_string()
}

#[tokio::test(start_paused = true)]
async fn each_invalid_payload_falls_back_after_exhausting_retries() {
    let three = ["Thapar 2002", "Ray 1986", "Sircar 1965"];
    let mut score_of_five = vec![3u8; 24];
    score_of_five.push(5);
    let cases = [
        ("24 scores", payload(vec![3; 24], NOTE, &three)),
        ("score of 5", payload(score_of_five, NOTE, &three)),
        ("two sources", payload(vec![3; 25], NOTE, &three[..2])),
        ("short note", payload(vec![3; 25], "Brief.", &three)),
    ];

    for (case, reply) in cases {
        let script = (0..3).map(|_| Ok(reply.clone())).collect();
        let oracle = ScriptedOracle::new(script, always_valid);
        let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());

        let row = engine.repair_row(&deccan(), &target()).await.unwrap();
        assert_eq!(oracle.calls(), 3, "{case}");
        assert_eq!(row.provenance, Provenance::Fallback, "{case}");
        assert_eq!(row.scores, ScoreVector::uniform(3), "{case}");
        assert!(row.interpolated, "{case}");
        assert_eq!(row.notes, INTERPOLATED_NOTE, "{case}");
        assert_eq!(row.sources, INTERPOLATED_SOURCES, "{case}");
    }
}

#[tokio::test(start_paused = true)]
async fn repair_row_ignores_unknown_keys() {
    let oracle = ScriptedOracle::new(Vec::new(), always_valid);
    let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());

    let missing = RecordKey::new(EraId::historical(9), "Deccan");
    assert!(engine.repair_row(&deccan(), &missing).await.is_none());
    assert_eq!(oracle.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cached_reply_skips_the_oracle() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(SqliteReplyCache::new(dir.path().join("cache.sqlite")).unwrap());
    let dataset = deccan();

    let live = ScriptedOracle::new(Vec::new(), always_valid);
    let first = RowRepairEngine::new(live.clone(), &EngineConfig::default()).with_cache(cache.clone());
    let row = first.repair_row(&dataset, &target()).await.unwrap();
    assert_eq!(row.provenance, Provenance::Oracle);
    assert_eq!(live.calls(), 1);

    let broken = ScriptedOracle::new(Vec::new(), timeout);
    let second = RowRepairEngine::new(broken.clone(), &EngineConfig::default()).with_cache(cache);
    let row = second.repair_row(&dataset, &target()).await.unwrap();
    assert_eq!(row.provenance, Provenance::Cached);
    assert_eq!(row.attempts, 0);
    assert_eq!(row.scores, ScoreVector::uniform(3));
    assert_eq!(broken.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cached_reply_is_revalidated_under_current_rules() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(SqliteReplyCache::new(dir.path().join("cache.sqlite")).unwrap());
    let dataset = deccan();

    let live = ScriptedOracle::new(Vec::new(), always_valid);
    RowRepairEngine::new(live, &EngineConfig::default())
        .with_cache(cache.clone())
        .repair_row(&dataset, &target())
        .await
        .unwrap();

    let strict = EngineConfig {
        min_source_count: 5,
        ..EngineConfig::default()
    };
    let oracle = ScriptedOracle::new(Vec::new(), short_note);
    let row = RowRepairEngine::new(oracle.clone(), &strict)
        .with_cache(cache)
        .repair_row(&dataset, &target())
        .await
        .unwrap();
    assert_eq!(row.provenance, Provenance::Fallback);
    assert_eq!(oracle.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn rows_wait_between_live_calls() {
    let mut dataset = deccan();
    let mut second = IndicatorRecord::placeholder(EraId::historical(5), "Tamilakam");
    second.notes = "Parsing failed; placeholder summary.".to_string();
    dataset.insert(second).unwrap();

    let oracle = ScriptedOracle::new(Vec::new(), always_valid);
    let engine = RowRepairEngine::new(oracle.clone(), &EngineConfig::default());

    let start = tokio::time::Instant::now();
    let report = engine.repair_all(&mut dataset).await;

    assert_eq!(report.oracle, 2);
    assert_eq!(oracle.calls(), 2);
    assert!(start.elapsed() >= Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn generate_missing_skips_existing_and_checkpoints_every_row() {
    let mut existing = IndicatorRecord::placeholder(EraId::modern(1), "Deccan");
    existing.set_scores(&ScoreVector::uniform(4));
    let mut dataset = Dataset::from_records(vec![existing]).unwrap();

    let oracle = ScriptedOracle::new(vec![Ok("not a reply".to_string())], always_valid);
    let config = EngineConfig {
        max_retries: 1,
        ..EngineConfig::default()
    };
    let engine = RowRepairEngine::new(oracle.clone(), &config);

    let mut checkpoints = 0usize;
    let report = engine
        .generate_missing(&mut dataset, GenerationPlan::Modern, |d| {
            checkpoints += 1;
            assert!(d.inconsistent_totals().is_empty());
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(report.skipped_existing, 1);
    assert_eq!(report.generated, 44);
    assert_eq!(report.fallback, 1);
    assert_eq!(report.oracle, 43);
    assert_eq!(checkpoints, 44);
    assert_eq!(dataset.len(), 45);

    let untouched = dataset.get(&EraId::modern(1), "Deccan").unwrap();
    assert_eq!(untouched.score_vector(), Some(ScoreVector::uniform(4)));

    let fallback: Vec<_> = dataset
        .records()
        .iter()
        .filter(|r| r.notes == MODERN_FALLBACK_NOTE)
        .collect();
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0].score_vector(), Some(ScoreVector::uniform(2)));
    assert!(!fallback[0].interpolated);
}

#[tokio::test(start_paused = true)]
async fn historical_generation_failures_are_left_for_repair() {
    let oracle = ScriptedOracle::new(Vec::new(), refused);
    let engine = RowRepairEngine::new(oracle, &EngineConfig::default());
    let mut dataset = Dataset::new();

    let report = engine
        .generate_missing(&mut dataset, GenerationPlan::Historical, |_| Ok(()))
        .await
        .unwrap();

    assert_eq!(report.generated, GenerationPlan::Historical.grid().len());
    assert_eq!(report.fallback, report.generated);
    assert_eq!(dataset.records_needing_repair().len(), dataset.len());
}

#[tokio::test(start_paused = true)]
async fn modern_generation_accepts_shorter_notes_than_repair() {
    fn medium_note() -> Result<String, ProviderError> {
        Ok(payload(
            vec![2; 25],
            "Coalition politics and welfare schemes broadened access in the 2000s.",
            &["NSSO 2005", "NFHS-3", "Census 2001"],
        ))
    }

    let repair = ScriptedOracle::new(Vec::new(), medium_note);
    let row = RowRepairEngine::new(repair.clone(), &EngineConfig::default())
        .repair_row(&deccan(), &target())
        .await
        .unwrap();
    assert_eq!(row.provenance, Provenance::Fallback);

    let generate = ScriptedOracle::new(Vec::new(), medium_note);
    let mut dataset = Dataset::new();
    let report = RowRepairEngine::new(generate.clone(), &EngineConfig::default())
        .generate_missing(&mut dataset, GenerationPlan::Modern, |_| Ok(()))
        .await
        .unwrap();
    assert_eq!(report.fallback, 0);
    assert_eq!(report.oracle, report.generated);
    assert_eq!(generate.calls(), report.generated);
}
