mod support;

use context_indexer::{HostEvent, RepoHash, RunRequest, StartOutcome};
use context_vector_store::StubEmbedder;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::{orchestrator, FailingEmbedder, Fault, ScriptedLlm, Workspace, AUGMENT_MARKER};

fn sample_project() -> Workspace {
    let ws = Workspace::new();
    ws.write("src/main.rs", "fn main() {\n    println!(\"hi\");\n}\n");
    ws.write("docs/guide.md", "# Guide\n\nRun the binary.\n");
    ws
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn unchanged_tree_is_not_reprocessed() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let orchestrator = orchestrator(ws.config(true), &llm, &embedder);

    let first = orchestrator
        .run(RunRequest::full())
        .await
        .expect("first run")
        .expect("not already running");
    let augmentation = first.augmentation.expect("augmentation stats");
    assert_eq!(augmentation.processed, 2);
    assert_eq!(first.vectorization.expect("vector stats").processed, 2);
    assert_eq!(llm.calls(), 2);
    let embed_calls = embedder.batch_calls();
    assert!(embed_calls > 0);

    let shadow = std::fs::read_to_string(ws.shadow("src/main.rs")).expect("shadow doc");
    assert!(shadow.starts_with(AUGMENT_MARKER));
    assert!(shadow.contains("println!"));

    let second = orchestrator
        .run(RunRequest::full())
        .await
        .expect("second run")
        .expect("not already running");
    assert_eq!(llm.calls(), 2);
    assert_eq!(embedder.batch_calls(), embed_calls);
    assert_eq!(second.augmentation.expect("augmentation stats").skipped, 2);
    assert_eq!(second.vectorization.expect("vector stats").skipped, 2);
    assert!(!second.aborted);
}

#[tokio::test]
async fn only_changed_files_are_reprocessed() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let orchestrator = orchestrator(ws.config(true), &llm, &embedder);
    orchestrator.run(RunRequest::full()).await.expect("first run");
    let embed_calls = embedder.batch_calls();

    ws.write("src/main.rs", "fn main() {\n    println!(\"changed\");\n}\n");
    let summary = orchestrator
        .run(RunRequest::full())
        .await
        .expect("second run")
        .expect("not already running");

    assert_eq!(llm.calls(), 3);
    assert_eq!(embedder.batch_calls(), embed_calls + 1);
    let augmentation = summary.augmentation.expect("augmentation stats");
    assert_eq!((augmentation.processed, augmentation.skipped), (1, 1));
    let shadow = std::fs::read_to_string(ws.shadow("src/main.rs")).expect("shadow doc");
    assert!(shadow.contains("changed"));
}

#[tokio::test]
async fn deleted_sources_disappear_from_every_artifact() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let config = ws.config(true);
    let orchestrator = orchestrator(config.clone(), &llm, &embedder);
    orchestrator.run(RunRequest::full()).await.expect("first run");
    assert!(ws.store(&config).await.contains_source(&ws.id("docs/guide.md")));

    ws.remove("docs/guide.md");
    let summary = orchestrator
        .run(RunRequest::full())
        .await
        .expect("second run")
        .expect("not already running");

    assert_eq!(summary.augmentation.expect("augmentation stats").deleted, 1);
    assert_eq!(summary.vectorization.expect("vector stats").deleted, 1);
    assert!(!ws.shadow("docs/guide.md").exists());
    let hashes = RepoHash::load(config.repo_hash_path()).await;
    assert!(hashes.get(&ws.path("docs/guide.md")).is_none());
    assert!(hashes.get(&ws.path("src/main.rs")).is_some());
    let store = ws.store(&config).await;
    assert!(!store.contains_source(&ws.id("docs/guide.md")));
    assert!(store.contains_source(&ws.id("src/main.rs")));
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn scoped_run_touches_only_the_given_paths() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let config = ws.config(false);
    let orchestrator = orchestrator(config.clone(), &llm, &embedder);
    orchestrator.run(RunRequest::full()).await.expect("first run");

    ws.write("src/main.rs", "fn main() {}\n");
    ws.write("docs/guide.md", "# Guide\n\nEdited but out of scope.\n");
    ws.write("src/extra.rs", "pub fn extra() {}\n");
    let summary = orchestrator
        .run(RunRequest::scoped(vec![ws.path("src")]))
        .await
        .expect("scoped run")
        .expect("not already running");

    let vectors = summary.vectorization.expect("vector stats");
    assert_eq!(vectors.total, 2);
    assert_eq!(vectors.processed, 2);
    assert!(summary.augmentation.is_none());

    ws.remove("src/extra.rs");
    let summary = orchestrator
        .run(RunRequest::scoped(vec![ws.path("src/extra.rs")]))
        .await
        .expect("scoped delete")
        .expect("not already running");
    assert_eq!(summary.vectorization.expect("vector stats").deleted, 1);

    let store = ws.store(&config).await;
    assert!(!store.contains_source(&ws.id("src/extra.rs")));
    assert!(store.contains_source(&ws.id("docs/guide.md")));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn abort_mid_file_leaves_no_trace_of_that_file() {
    let ws = Workspace::new();
    ws.write("done.rs", "pub fn done() {}\n");
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let config = ws.config(true);
    orchestrator(config.clone(), &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("seed run");

    ws.write("slow.rs", "// line of a long file\n".repeat(200));
    let slow_llm = Arc::new(ScriptedLlm::slow(Duration::from_millis(25)));
    let orchestrator = orchestrator(config.clone(), &slow_llm, &embedder);
    let StartOutcome::Started(handle) = orchestrator
        .start(RunRequest::full())
        .await
        .expect("start")
    else {
        panic!("no other run is active");
    };

    let partial = ws.shadow("slow.rs.partial");
    wait_until("partial document", || partial.exists()).await;
    assert!(orchestrator.abort());
    let summary = handle.wait().await.expect("aborted run");

    assert!(summary.aborted);
    assert!(summary.vectorization.is_none());
    assert!(!orchestrator.is_running());
    assert!(orchestrator.subscribe_progress().borrow().is_aborted);
    assert!(!partial.exists());
    assert!(!ws.shadow("slow.rs").exists());
    let hashes = RepoHash::load(config.repo_hash_path()).await;
    assert!(hashes.get(&ws.path("slow.rs")).is_none());
    assert!(hashes.get(&ws.path("done.rs")).is_some());
    assert!(ws.shadow("done.rs").exists());
    assert_eq!(slow_llm.calls(), 1);
}

#[tokio::test]
async fn overlapping_runs_are_rejected() {
    let ws = Workspace::new();
    ws.write("slow.rs", "// line of a long file\n".repeat(200));
    let llm = Arc::new(ScriptedLlm::slow(Duration::from_millis(25)));
    let embedder = Arc::new(StubEmbedder::new(16));
    let orchestrator = orchestrator(ws.config(true), &llm, &embedder);

    let StartOutcome::Started(handle) = orchestrator
        .start(RunRequest::full())
        .await
        .expect("start")
    else {
        panic!("no other run is active");
    };
    assert!(orchestrator.is_running());
    assert!(matches!(
        orchestrator.start(RunRequest::full()).await.expect("second start"),
        StartOutcome::AlreadyRunning
    ));
    assert!(orchestrator
        .run(RunRequest::scoped(vec![ws.path("slow.rs")]))
        .await
        .expect("third start")
        .is_none());

    orchestrator.abort();
    handle.wait().await.expect("aborted run");
    assert!(!orchestrator.is_running());
    assert!(!orchestrator.abort());
}

#[tokio::test]
async fn salt_changes_force_reprocessing() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let mut config = ws.config(true);
    orchestrator(config.clone(), &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("first run");
    assert_eq!(llm.calls(), 2);

    config.app_context = "Command line greeter".to_string();
    orchestrator(config.clone(), &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("new app context");
    assert_eq!(llm.calls(), 4);
    assert!(llm
        .prompts()
        .last()
        .is_some_and(|prompt| prompt.starts_with("Application context:\nCommand line greeter")));

    let mut raw = ws.config(false);
    orchestrator(raw.clone(), &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("raw run");
    let embed_calls = embedder.batch_calls();
    raw.embedding.chunk_size = Some(64);
    let summary = orchestrator(raw, &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("new chunk size")
        .expect("not already running");
    assert_eq!(summary.vectorization.expect("vector stats").processed, 2);
    assert!(embedder.batch_calls() >= embed_calls + 2);
    assert_eq!(llm.calls(), 4);
}

#[tokio::test]
async fn binary_and_oversized_files_are_mirrored_verbatim() {
    let ws = Workspace::new();
    ws.write("a.py", "def answer():\n    return 42\n");
    let binary = [0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0];
    ws.write("b.py", binary);
    let large = "Lorem ipsum dolor sit amet, consectetur adipiscing elit.\n".repeat(36_000);
    ws.write("c.md", &large);

    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(8));
    let config = ws.config(true);
    assert_eq!(config.augment_concurrency, 2);
    let orchestrator = orchestrator(config.clone(), &llm, &embedder);
    let summary = orchestrator
        .run(RunRequest::full())
        .await
        .expect("run")
        .expect("not already running");

    let augmentation = summary.augmentation.expect("augmentation stats");
    assert_eq!((augmentation.processed, augmentation.copied), (1, 2));
    assert!(augmentation.errors.is_empty());
    assert_eq!(llm.calls(), 1);
    assert_eq!(std::fs::read(ws.shadow("b.py")).expect("binary"), binary);
    assert_eq!(
        std::fs::read_to_string(ws.shadow("c.md")).expect("markdown"),
        large
    );
    assert_eq!(orchestrator.subscribe_progress().borrow().percent, 100.0);

    let store = ws.store(&config).await;
    assert!(store.contains_source(&ws.id("a.py")));
    assert!(store.contains_source(&ws.id("c.md")));
    assert!(!store.contains_source(&ws.id("b.py")));
    let hashes = RepoHash::load(config.repo_hash_path()).await;
    assert_eq!(hashes.len(), 3);
}

#[tokio::test]
async fn corrupt_store_is_rebuilt() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let config = ws.config(false);
    let store_path = config.store_path();
    std::fs::create_dir_all(store_path.parent().expect("store dir")).expect("mkdir");
    std::fs::write(&store_path, b"{ not json").expect("corrupt store");

    let summary = orchestrator(config.clone(), &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("run")
        .expect("not already running");

    assert_eq!(summary.vectorization.expect("vector stats").processed, 2);
    let store = ws.store(&config).await;
    assert_eq!(store.source_count(), 2);
}

#[tokio::test]
async fn namespaces_are_kept_apart() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let raw = ws.config(false);
    orchestrator(raw.clone(), &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("raw run");
    let raw_store = std::fs::read(raw.store_path()).expect("raw store");

    let augmented = ws.config(true);
    orchestrator(augmented.clone(), &llm, &embedder)
        .run(RunRequest::full())
        .await
        .expect("augmented run");

    assert_ne!(raw.store_path(), augmented.store_path());
    assert_eq!(std::fs::read(raw.store_path()).expect("raw store"), raw_store);
    assert_eq!(ws.store(&augmented).await.source_count(), 2);
}

#[tokio::test]
async fn host_receives_ordered_events() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(StubEmbedder::new(16));
    let orchestrator = orchestrator(ws.config(true), &llm, &embedder);

    let StartOutcome::Started(mut handle) = orchestrator
        .start(RunRequest::full())
        .await
        .expect("start")
    else {
        panic!("no other run is active");
    };
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    handle.wait().await.expect("run");

    assert_eq!(events.first(), Some(&HostEvent::Start));
    assert_eq!(events.last(), Some(&HostEvent::Done));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, HostEvent::Start | HostEvent::Done))
            .count(),
        2
    );
    let percents: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            HostEvent::Progress { value } => Some(*value),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));

    let state = orchestrator.subscribe_progress().borrow().clone();
    assert!(!state.is_in_progress);
    assert!(!state.is_aborted);
    assert_eq!(state.percent, 100.0);
}

async fn run_collecting_events(
    orchestrator: &context_indexer::PipelineOrchestrator,
) -> (context_indexer::Result<context_indexer::RunSummary>, Vec<HostEvent>) {
    let StartOutcome::Started(mut handle) = orchestrator
        .start(RunRequest::full())
        .await
        .expect("start")
    else {
        panic!("no other run is active");
    };
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    (handle.wait().await, events)
}

fn error_events(events: &[HostEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            HostEvent::Error { message } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn failed_llm_request_only_fails_that_file() {
    let ws = sample_project();
    ws.write("bad.rs", "pub fn bad() {}\n");
    let llm = Arc::new(ScriptedLlm::failing_on("bad.rs", Fault::Request));
    let embedder = Arc::new(StubEmbedder::new(16));
    let config = ws.config(true);
    let orchestrator = orchestrator(config.clone(), &llm, &embedder);

    let (summary, events) = run_collecting_events(&orchestrator).await;
    let summary = summary.expect("run");

    let augmentation = summary.augmentation.expect("augmentation stats");
    assert_eq!(augmentation.processed, 2);
    assert_eq!(augmentation.errors.len(), 1);
    assert!(augmentation.errors[0].contains("bad.rs"));
    let errors = error_events(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("bad.rs"));

    assert!(ws.shadow("src/main.rs").exists());
    assert!(!ws.shadow("bad.rs").exists());
    let hashes = RepoHash::load(config.repo_hash_path()).await;
    assert!(hashes.get(&ws.path("bad.rs")).is_none());
    assert!(hashes.get(&ws.path("docs/guide.md")).is_some());
    assert_eq!(orchestrator.subscribe_progress().borrow().percent, 100.0);

    // The next run retries only the file that failed.
    let llm_calls = llm.calls();
    orchestrator.run(RunRequest::full()).await.expect("retry run");
    assert_eq!(llm.calls(), llm_calls + 1);
}

#[tokio::test]
async fn cut_off_rewrite_is_discarded() {
    let ws = sample_project();
    ws.write("long.rs", "pub fn long() {}\n");
    let llm = Arc::new(ScriptedLlm::failing_on("long.rs", Fault::CutOff));
    let embedder = Arc::new(StubEmbedder::new(16));
    let config = ws.config(true);
    let orchestrator = orchestrator(config.clone(), &llm, &embedder);

    let summary = orchestrator
        .run(RunRequest::full())
        .await
        .expect("run")
        .expect("not already running");

    let augmentation = summary.augmentation.expect("augmentation stats");
    assert_eq!(augmentation.processed, 2);
    assert_eq!(augmentation.errors.len(), 1);
    assert!(augmentation.errors[0].contains("long.rs"));
    assert!(!ws.shadow("long.rs").exists());
    assert!(!ws.root().join(".context/shadow/long.rs.partial").exists());
    let hashes = RepoHash::load(config.repo_hash_path()).await;
    assert!(hashes.get(&ws.path("long.rs")).is_none());
    let store = ws.store(&config).await;
    assert!(!store.contains_source(&ws.id("long.rs")));
}

#[tokio::test]
async fn files_longer_than_one_response_are_mirrored_verbatim() {
    let ws = Workspace::new();
    ws.write("short.rs", "fn a() {}\n");
    let long = "pub fn step() -> u32 { 1 }\n".repeat(20);
    ws.write("long.rs", &long);
    let llm = Arc::new(ScriptedLlm::echo().with_max_output_tokens(64));
    let embedder = Arc::new(StubEmbedder::new(8));
    let orchestrator = orchestrator(ws.config(true), &llm, &embedder);

    let summary = orchestrator
        .run(RunRequest::full())
        .await
        .expect("run")
        .expect("not already running");

    let augmentation = summary.augmentation.expect("augmentation stats");
    assert_eq!((augmentation.processed, augmentation.copied), (1, 1));
    assert_eq!(llm.calls(), 1);
    assert_eq!(
        std::fs::read_to_string(ws.shadow("long.rs")).expect("mirrored"),
        long
    );
}

#[tokio::test]
async fn embedding_failure_ends_the_run_and_keeps_earlier_records() {
    let ws = sample_project();
    let llm = Arc::new(ScriptedLlm::echo());
    let embedder = Arc::new(FailingEmbedder::new(16, "EMBEDDING_REJECTED"));
    let config = ws.config(false);
    let orchestrator = orchestrator(config.clone(), &llm, &embedder);
    orchestrator.run(RunRequest::full()).await.expect("first run");

    ws.write("poison.rs", "// EMBEDDING_REJECTED\n");
    let (summary, events) = run_collecting_events(&orchestrator).await;

    assert!(summary.is_err());
    assert!(!error_events(&events).is_empty());
    assert!(!orchestrator.is_running());
    let store = ws.store(&config).await;
    assert!(store.contains_source(&ws.id("src/main.rs")));
    assert!(store.contains_source(&ws.id("docs/guide.md")));
    assert!(!store.contains_source(&ws.id("poison.rs")));

    ws.remove("poison.rs");
    let summary = orchestrator
        .run(RunRequest::full())
        .await
        .expect("run after the failure")
        .expect("slot was released");
    assert!(!summary.aborted);
}
