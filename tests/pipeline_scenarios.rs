use async_trait::async_trait;
use echoql::availability::AvailabilityChecker;
use echoql::catalog::SchemaCatalog;
use echoql::config::PipelineConfig;
use echoql::error::{PipelineError, Result};
use echoql::execution::{DataStore, PolarsDataStore, ResultSet};
use echoql::execution_loop::{FailureContext, RepairState};
use echoql::generator::{SqlCandidate, SqlGenerator};
use echoql::llm::LanguageModel;
use echoql::observability::RunLog;
use echoql::pipeline::{Pipeline, PipelineComponents, PipelineSettings};
use echoql::safety::CancellationFlag;
use echoql::schema_rag::{Document, Embedder, Embedding, InMemoryVectorStore, TableRetriever};
use echoql::validator::{SqlValidator, ValidationStatus};
use polars::prelude::*;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn catalog_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("configs")
}

fn catalog() -> Arc<SchemaCatalog> {
    Arc::new(SchemaCatalog::load(&catalog_dir()).unwrap())
}

/// Sessions as Parquet, users as CSV
fn create_test_data_files(data_dir: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let mut sessions = df![
        "session_id" => ["s-001", "s-002", "s-003", "s-004", "s-005"],
        "user_id" => [1i64, 1, 2, 3, 1],
        "duration_min" => [12.5, 3.0, 45.0, 7.25, 20.0],
        "session_date" => ["2024-05-01", "2024-05-02", "2024-05-02", "2024-05-03", "2024-05-04"]
    ]?;
    let mut file = fs::File::create(data_dir.join("mock_user_sessions.parquet"))?;
    ParquetWriter::new(&mut file).finish(&mut sessions)?;

    fs::write(
        data_dir.join("mock_users.csv"),
        "id,name,email,birthday\n1,Ada,ada@example.com,1990-12-10\n2,Alan,alan@example.com,1992-06-23\n3,Grace,grace@example.com,1988-12-09\n",
    )?;
    Ok(())
}

struct FixedText(String);

#[async_trait]
impl LanguageModel for FixedText {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

struct UnitEmbedder;

#[async_trait]
impl Embedder for UnitEmbedder {
    async fn embed(&self, _text: &str) -> Result<Embedding> {
        Ok(vec![1.0, 0.0, 0.0, 0.0])
    }

    fn dimension(&self) -> usize {
        4
    }
}

/// Sessions closest to the unit query vector, answers farthest.
fn index() -> InMemoryVectorStore {
    let mut store = InMemoryVectorStore::new(4);
    let vectors = [
        ("mock_user_sessions", vec![1.0, 0.0, 0.0, 0.0]),
        ("mock_users", vec![0.8, 0.6, 0.0, 0.0]),
        ("mock_questions", vec![0.5, 0.0, 0.866, 0.0]),
        ("mock_answers", vec![0.0, 0.0, 0.0, 1.0]),
    ];
    for (name, embedding) in vectors {
        store
            .add_document(Document {
                id: format!("{}_description.txt", name),
                table_name: Some(name.to_string()),
                text: String::new(),
                embedding,
            })
            .unwrap();
    }
    store
}

struct QueueGenerator {
    replies: Mutex<VecDeque<&'static str>>,
    calls: AtomicUsize,
}

#[async_trait]
impl SqlGenerator for QueueGenerator {
    async fn generate(&self, _request: &str, _schema: &str, _failure: Option<&FailureContext>) -> Result<SqlCandidate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or("");
        SqlCandidate::new(reply).ok_or_else(|| PipelineError::GenerationFailed("empty".to_string()))
    }
}

struct QueueValidator {
    verdicts: Mutex<VecDeque<ValidationStatus>>,
}

#[async_trait]
impl SqlValidator for QueueValidator {
    async fn validate(&self, _candidate: &SqlCandidate, _schema: &str) -> Result<ValidationStatus> {
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ValidationStatus::Valid))
    }
}

struct CountingStore {
    inner: PolarsDataStore,
    calls: AtomicUsize,
}

#[async_trait]
impl DataStore for CountingStore {
    fn name(&self) -> &'static str {
        "counting-polars"
    }

    async fn execute(&self, sql: &str) -> Result<ResultSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(sql).await
    }
}

struct Harness {
    pipeline: Pipeline,
    generator: Arc<QueueGenerator>,
    store: Arc<CountingStore>,
    _data: tempfile::TempDir,
}

const ANSWERABLE: &str = r#"{"available": true, "explanation": "mock_user_sessions has user_id"}"#;

fn harness(reasoner_reply: &str, sql: Vec<&'static str>, verdicts: Vec<ValidationStatus>) -> Harness {
    let data = tempfile::tempdir().unwrap();
    create_test_data_files(data.path()).unwrap();

    let generator = Arc::new(QueueGenerator {
        replies: Mutex::new(sql.into()),
        calls: AtomicUsize::new(0),
    });
    let store = Arc::new(CountingStore {
        inner: PolarsDataStore::new(data.path()),
        calls: AtomicUsize::new(0),
    });

    let components = PipelineComponents {
        catalog: catalog(),
        enricher: Arc::new(FixedText("Count the sessions recorded for each user_id".to_string())),
        reasoner: Arc::new(FixedText(reasoner_reply.to_string())),
        embedder: Arc::new(UnitEmbedder),
        index: Arc::new(index()),
        generator: generator.clone(),
        validator: Arc::new(QueueValidator {
            verdicts: Mutex::new(verdicts.into()),
        }),
        store: store.clone(),
    };

    Harness {
        pipeline: Pipeline::new(components, PipelineSettings::default()),
        generator,
        store,
        _data: data,
    }
}

#[tokio::test]
async fn test_sessions_per_user_returns_one_row_per_user() {
    let h = harness(
        ANSWERABLE,
        vec!["SELECT user_id, COUNT(*) AS num_sessions FROM mock_user_sessions GROUP BY user_id ORDER BY user_id"],
        vec![ValidationStatus::Valid],
    );

    let output = h.pipeline.run("count of sessions per user").await.unwrap();

    assert!(output.sql.contains("GROUP BY user_id"));
    assert!(output.sql.contains("COUNT"));
    assert_eq!(output.repair_attempts, 0);
    assert_eq!(output.tables[0].id, "mock_user_sessions");
    assert_eq!(output.result.column_names(), vec!["user_id", "num_sessions"]);
    // users 1, 2 and 3
    assert_eq!(output.result.row_count(), 3);
    assert_eq!(output.result.rows[0][1], serde_json::json!(3));
}

#[tokio::test]
async fn test_signup_question_is_unanswerable() {
    let h = harness(
        r#"{"available": false, "explanation": "mock_users has no signup timestamp column"}"#,
        vec!["SELECT 1"],
        Vec::new(),
    );

    let err = h.pipeline.run("how many users signed up last month").await.unwrap_err();

    match err {
        PipelineError::Unanswerable(explanation) => assert!(explanation.contains("signup")),
        other => panic!("expected Unanswerable, got {:?}", other),
    }
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_repaired_sql_is_executed() {
    let h = harness(
        ANSWERABLE,
        vec![
            "SELECT user, COUNT(*) FROM mock_user_sessions GROUP BY user",
            "SELECT user_id, COUNT(*) AS num_sessions FROM mock_user_sessions GROUP BY user_id",
        ],
        vec![
            ValidationStatus::Invalid("column user does not exist".to_string()),
            ValidationStatus::Valid,
        ],
    );

    let output = h.pipeline.run("count of sessions per user").await.unwrap();

    assert_eq!(output.repair_attempts, 1);
    assert_eq!(output.repair_transitions.last().unwrap().to, RepairState::Valid);
    assert!(output.sql.contains("user_id"));
    assert_eq!(output.result.row_count(), 3);
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_repair_never_touches_store() {
    let h = harness(
        ANSWERABLE,
        vec!["SELECT signup FROM mock_users", "SELECT signup FROM mock_users"],
        vec![
            ValidationStatus::Invalid("first: unknown column signup".to_string()),
            ValidationStatus::Invalid("second: unknown column signup".to_string()),
        ],
    );

    let err = h.pipeline.run("count of sessions per user").await.unwrap_err();

    assert!(matches!(err, PipelineError::Exhausted(ref reason) if reason.starts_with("second")));
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_store_error_is_execution_failed_not_exhausted() {
    let h = harness(
        ANSWERABLE,
        vec!["SELECT * FROM mock_signups"],
        vec![ValidationStatus::Valid],
    );

    let err = h.pipeline.run("count of sessions per user").await.unwrap_err();
    assert!(matches!(err, PipelineError::ExecutionFailed(_)));
}

#[tokio::test]
async fn test_cancelled_run_stops_before_first_stage() {
    let h = harness(ANSWERABLE, vec!["SELECT 1"], Vec::new());
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let err = h
        .pipeline
        .run_with_cancellation("count of sessions per user", &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled(ref stage) if stage == "retrieval"));
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
}

/// Rewrites the query and aborts the run while doing so.
struct CancellingEnricher(CancellationFlag);

#[async_trait]
impl LanguageModel for CancellingEnricher {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.0.cancel();
        Ok("Count the sessions recorded for each user_id".to_string())
    }
}

struct SlowStore;

#[async_trait]
impl DataStore for SlowStore {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn execute(&self, _sql: &str) -> Result<ResultSet> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(ResultSet::new(Vec::new(), Vec::new()))
    }
}

fn components_with(
    enricher: Arc<dyn LanguageModel>,
    generator: Arc<QueueGenerator>,
    store: Arc<dyn DataStore>,
) -> PipelineComponents {
    PipelineComponents {
        catalog: catalog(),
        enricher,
        reasoner: Arc::new(FixedText(ANSWERABLE.to_string())),
        embedder: Arc::new(UnitEmbedder),
        index: Arc::new(index()),
        generator,
        validator: Arc::new(QueueValidator {
            verdicts: Mutex::new(VecDeque::new()),
        }),
        store,
    }
}

#[tokio::test]
async fn test_cancel_during_retrieval_stops_before_availability() {
    let cancel = CancellationFlag::new();
    let generator = Arc::new(QueueGenerator {
        replies: Mutex::new(vec!["SELECT 1"].into()),
        calls: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::new(
        components_with(
            Arc::new(CancellingEnricher(cancel.clone())),
            generator.clone(),
            Arc::new(SlowStore),
        ),
        PipelineSettings::default(),
    );

    let err = pipeline
        .run_with_cancellation("count of sessions per user", &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled(ref stage) if stage == "availability"));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let generator = Arc::new(QueueGenerator {
        replies: Mutex::new(vec!["SELECT user_id FROM mock_user_sessions"].into()),
        calls: AtomicUsize::new(0),
    });
    let mut settings = PipelineSettings::default();
    settings.timeouts.store = Duration::from_millis(50);
    let pipeline = Pipeline::new(
        components_with(
            Arc::new(FixedText("sessions by user".to_string())),
            generator,
            Arc::new(SlowStore),
        ),
        settings,
    );

    let err = pipeline.run("count of sessions per user").await.unwrap_err();

    match err {
        PipelineError::Timeout { stage, .. } => assert_eq!(stage, "query execution"),
        other => panic!("expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_blank_query_is_invalid_input() {
    let h = harness(ANSWERABLE, Vec::new(), Vec::new());
    let err = h.pipeline.run("   ").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_retrieval_returns_three_of_four_tables() {
    let retriever = TableRetriever::new(
        Arc::new(FixedText("sessions by user".to_string())),
        Arc::new(UnitEmbedder),
        Arc::new(index()),
        catalog(),
        Default::default(),
    );

    let result = retriever.retrieve("sessions per user", 3).await.unwrap();
    let cat = catalog();

    assert_eq!(result.tables.len(), 3);
    assert!(result.tables.iter().all(|t| cat.contains(&t.id)));
    assert!(result.tables.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(result.table_ids(), vec!["mock_user_sessions", "mock_users", "mock_questions"]);
}

#[tokio::test]
async fn test_checker_echoes_catalog_description() {
    let cat = catalog();
    let schema = cat.describe();
    let checker = AvailabilityChecker::new(
        Arc::new(FixedText(
            r#"{"available": true, "user_query": "x", "raw_schema_text": "Table: other"}"#.to_string(),
        )),
        Duration::from_secs(1),
    );

    for query in ["how many users", "average session length", "answers per question"] {
        let verdict = checker.check(query, &schema).await.unwrap();
        assert_eq!(verdict.raw_schema_text, schema);
        assert_eq!(verdict.user_query, query);
    }
    assert_eq!(cat.describe(), schema);
}

#[tokio::test]
async fn test_offline_pipeline_from_config_with_export_and_run_log() {
    let workdir = tempfile::tempdir().unwrap();
    let data_dir = workdir.path().join("data");
    fs::create_dir(&data_dir).unwrap();
    for table in ["mock_answers", "mock_questions", "mock_users", "mock_user_sessions"] {
        fs::write(data_dir.join(format!("{}.csv", table)), "id,value\n1,a\n2,b\n").unwrap();
    }
    let log_path = workdir.path().join("runs.jsonl");

    let config = PipelineConfig {
        catalog_path: catalog_dir(),
        data_dir: data_dir.clone(),
        run_log_path: Some(log_path.clone()),
        embedding_dim: 32,
        ..PipelineConfig::default()
    };
    assert!(config.is_offline());

    let pipeline = Pipeline::from_config(&config).await.unwrap();
    let output = pipeline.run("how many users are there").await.unwrap();

    assert!(output.sql.starts_with("SELECT * FROM mock_"));
    assert_eq!(output.result.row_count(), 2);

    let export_path = workdir.path().join("result.csv");
    output.result.write_csv(fs::File::create(&export_path).unwrap()).unwrap();
    let exported = fs::read_to_string(&export_path).unwrap();
    assert_eq!(exported.lines().next(), Some("id,value"));
    assert_eq!(exported.lines().count(), 3);

    let records = RunLog::read_all(&log_path).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_success());
    assert_eq!(records[0].row_count, Some(2));
}

#[tokio::test]
async fn test_missing_catalog_is_fatal() {
    let config = PipelineConfig {
        catalog_path: PathBuf::from("/definitely/missing/catalog"),
        ..PipelineConfig::default()
    };
    let err = Pipeline::from_config(&config).await.err().unwrap();
    assert!(matches!(err, PipelineError::CatalogUnavailable(_)));
}
