//! End-to-end lifecycle properties of the suite orchestrator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use gantry_core::{
    EventKind, EventListener, ExecutionConfig, ListenerSet, ParameterSet, ReportKind,
    ResourceMonitor, Stage, StageDescriptor, StageFault, StageKind, StageScope,
    SuiteOrchestrator, TestCase, TestEvent, TestSuite,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<TestEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<TestEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventListener for Recorder {
    fn publish_event(&self, event: &TestEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn listeners(recorder: &Arc<Recorder>) -> Arc<ListenerSet> {
    let mut set = ListenerSet::new();
    set.register(Arc::clone(recorder) as Arc<dyn EventListener>);
    Arc::new(set)
}

fn passing_stage(kind: StageKind, line: u32) -> Stage {
    Stage::sync(
        StageDescriptor::new(kind, "passing").with_line(line),
        Arc::new(|_scope: &StageScope| Ok(())),
    )
}

fn failing_body(line: u32) -> Stage {
    Stage::sync(
        StageDescriptor::new(StageKind::TestBody, "failing").with_line(line),
        Arc::new(move |_scope: &StageScope| {
            Err(StageFault::Assertion {
                line: Some(line),
                message: "expected 1 but was 2".to_string(),
            })
        }),
    )
}

async fn run(suite: &TestSuite, recorder: &Arc<Recorder>) -> gantry_core::SuiteSummary {
    let orchestrator = SuiteOrchestrator::new(ExecutionConfig::default());
    orchestrator
        .run(suite, listeners(recorder), &CancellationToken::new())
        .await
}

#[tokio::test]
async fn suite_events_fire_exactly_once_and_pairs_match_combinations() {
    let suite = TestSuite::builder("demo")
        .case(TestCase::new("demo.test_one", 1), passing_stage(StageKind::TestBody, 1))
        .case(TestCase::new("demo.test_two", 2), passing_stage(StageKind::TestBody, 2))
        .case(
            TestCase::new("demo.test_three", 3).skipped(),
            passing_stage(StageKind::TestBody, 3),
        )
        .build();

    let recorder = Arc::new(Recorder::default());
    run(&suite, &recorder).await;

    assert_eq!(recorder.count(EventKind::SuiteBefore), 1);
    assert_eq!(recorder.count(EventKind::SuiteAfter), 1);
    // Three (case × parameter set) combinations, including the skipped
    // one.
    assert_eq!(recorder.count(EventKind::TestBefore), 3);
    assert_eq!(recorder.count(EventKind::TestAfter), 3);
}

#[tokio::test]
async fn teardown_always_runs_after_setup_failure() {
    let teardown_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&teardown_ran);

    let suite = TestSuite::builder("demo")
        .before_test(Stage::sync(
            StageDescriptor::new(StageKind::TestSetup, "exploding_setup").with_line(10),
            Arc::new(|_scope: &StageScope| panic!("setup exploded")),
        ))
        .after_test(Stage::sync(
            StageDescriptor::new(StageKind::TestTeardown, "teardown").with_line(20),
            Arc::new(move |_scope: &StageScope| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ))
        .case(TestCase::new("demo.test_one", 1), passing_stage(StageKind::TestBody, 1))
        .build();

    let recorder = Arc::new(Recorder::default());
    let summary = run(&suite, &recorder).await;

    assert!(teardown_ran.load(Ordering::SeqCst));
    assert!(summary.statistics.is_failed);
}

#[tokio::test]
async fn one_pass_one_fail_aggregates_as_failed() {
    let suite = TestSuite::builder("demo")
        .case(TestCase::new("demo.test_pass", 1), passing_stage(StageKind::TestBody, 1))
        .case(TestCase::new("demo.test_fail", 2), failing_body(2))
        .build();

    let recorder = Arc::new(Recorder::default());
    let summary = run(&suite, &recorder).await;

    assert_eq!(recorder.count(EventKind::TestAfter), 2);
    assert!(summary.statistics.is_failed);
    assert_eq!(summary.statistics.completed_tests, 2);
    assert_eq!(summary.statistics.failed, 1);
}

#[tokio::test]
async fn parameterized_case_nests_three_pairs_under_one_outer_pair() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);

    let case = TestCase::new("demo.test_values", 5)
        .with_parameter_set(ParameterSet::new(vec![json!(1), json!(2)]))
        .with_parameter_set(ParameterSet::new(vec![json!(3), json!(4)]))
        .with_parameter_set(ParameterSet::new(vec![json!(5), json!(6)]));

    let body = Stage::sync(
        StageDescriptor::new(StageKind::TestBody, "test_values").with_line(5),
        Arc::new(move |scope: &StageScope| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(scope.args.len(), 2);
            Ok(())
        }),
    );

    let suite = TestSuite::builder("demo").case(case, body).build();
    let recorder = Arc::new(Recorder::default());
    let summary = run(&suite, &recorder).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(summary.statistics.completed_tests, 3);

    let events = recorder.events();
    let outer_befores = events
        .iter()
        .filter(|e| {
            e.kind == EventKind::TestBefore
                && e.test_name.as_deref() == Some("demo.test_values")
        })
        .count();
    let nested_befores = events
        .iter()
        .filter(|e| {
            e.kind == EventKind::TestBefore
                && e.test_name
                    .as_deref()
                    .is_some_and(|name| name.starts_with("demo.test_values:"))
        })
        .count();
    assert_eq!(outer_befores, 1);
    assert_eq!(nested_befores, 3);
}

#[tokio::test]
async fn skipped_case_fires_events_but_never_invokes_stages() {
    let invoked = Arc::new(AtomicBool::new(false));
    let setup_flag = Arc::clone(&invoked);
    let body_flag = Arc::clone(&invoked);
    let teardown_flag = Arc::clone(&invoked);

    let suite = TestSuite::builder("demo")
        .before_test(Stage::sync(
            StageDescriptor::new(StageKind::TestSetup, "setup"),
            Arc::new(move |_scope: &StageScope| {
                setup_flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ))
        .after_test(Stage::sync(
            StageDescriptor::new(StageKind::TestTeardown, "teardown"),
            Arc::new(move |_scope: &StageScope| {
                teardown_flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ))
        .case(
            TestCase::new("demo.test_skipped", 9).skipped(),
            Stage::sync(
                StageDescriptor::new(StageKind::TestBody, "body"),
                Arc::new(move |_scope: &StageScope| {
                    body_flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            ),
        )
        .build();

    let recorder = Arc::new(Recorder::default());
    let summary = run(&suite, &recorder).await;

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(recorder.count(EventKind::TestBefore), 1);
    assert_eq!(recorder.count(EventKind::TestAfter), 1);
    assert_eq!(summary.statistics.skipped, 1);
    assert_eq!(summary.statistics.completed_tests, 0);

    let after = recorder
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::TestAfter)
        .unwrap();
    assert!(after.reports.iter().any(|r| r.kind == ReportKind::Skipped));
}

struct FixedMonitor {
    orphans: usize,
}

impl ResourceMonitor for FixedMonitor {
    fn mark(&self) {}

    fn orphan_count(&self) -> usize {
        self.orphans
    }
}

#[tokio::test]
async fn orphan_count_synthesizes_front_inserted_warning() {
    let suite = TestSuite::builder("demo")
        .case(TestCase::new("demo.test_leaky", 3), failing_body(3))
        .build();

    let recorder = Arc::new(Recorder::default());
    let orchestrator = SuiteOrchestrator::new(ExecutionConfig::default())
        .with_monitor(Arc::new(FixedMonitor { orphans: 2 }));
    let summary = orchestrator
        .run(&suite, listeners(&recorder), &CancellationToken::new())
        .await;

    assert_eq!(summary.statistics.orphans, 2);

    let after = recorder
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::TestAfter)
        .unwrap();
    // The synthesized warning is front-inserted, ahead of the body's
    // own failure report.
    assert_eq!(after.reports[0].kind, ReportKind::Warning);
    assert!(after.reports[0].message.contains("2 orphaned"));
    assert_eq!(after.reports[1].kind, ReportKind::Failure);
}

#[tokio::test]
async fn stage_output_is_captured_as_one_stdout_report() {
    let body = Stage::sync(
        StageDescriptor::new(StageKind::TestBody, "chatty").with_line(8),
        Arc::new(|scope: &StageScope| {
            scope.output.write_line("hello from the body");
            Ok(())
        }),
    );

    let suite = TestSuite::builder("demo")
        .case(TestCase::new("demo.test_chatty", 8), body)
        .build();

    let recorder = Arc::new(Recorder::default());
    run(&suite, &recorder).await;

    let after = recorder
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::TestAfter)
        .unwrap();
    let stdout_reports: Vec<_> = after
        .reports
        .iter()
        .filter(|r| r.kind == ReportKind::Stdout)
        .collect();
    assert_eq!(stdout_reports.len(), 1);
    assert!(stdout_reports[0].message.contains("hello from the body"));
}

#[tokio::test]
async fn cancellation_stops_between_cases() {
    let cancellation = CancellationToken::new();
    let cancel_after_first = cancellation.clone();

    let first_body = Stage::sync(
        StageDescriptor::new(StageKind::TestBody, "first").with_line(1),
        Arc::new(move |_scope: &StageScope| {
            cancel_after_first.cancel();
            Ok(())
        }),
    );

    let suite = TestSuite::builder("demo")
        .case(TestCase::new("demo.test_first", 1), first_body)
        .case(
            TestCase::new("demo.test_second", 2),
            passing_stage(StageKind::TestBody, 2),
        )
        .build();

    let recorder = Arc::new(Recorder::default());
    let orchestrator = SuiteOrchestrator::new(ExecutionConfig::default());
    let summary = orchestrator
        .run(&suite, listeners(&recorder), &cancellation)
        .await;

    // Only the first case ran; the suite-after event still fired.
    assert_eq!(summary.statistics.completed_tests, 1);
    assert_eq!(recorder.count(EventKind::SuiteAfter), 1);
    assert_eq!(recorder.count(EventKind::TestAfter), 1);
}

#[tokio::test]
async fn iteration_count_expands_single_parameter_set() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);

    let case = TestCase::new("demo.test_repeated", 4).with_parameter_set(
        ParameterSet::new(vec![json!("x")])
            .with_iterations(4)
            .with_seed(99),
    );
    let body = Stage::sync(
        StageDescriptor::new(StageKind::TestBody, "repeated").with_line(4),
        Arc::new(move |scope: &StageScope| {
            assert_eq!(scope.seed, Some(99));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let suite = TestSuite::builder("demo").case(case, body).build();
    let recorder = Arc::new(Recorder::default());
    let summary = run(&suite, &recorder).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    // One parameter set → one combination, regardless of iterations.
    assert_eq!(summary.statistics.completed_tests, 1);
}

#[tokio::test]
async fn stage_timeout_produces_single_interrupted_report() {
    let descriptor = StageDescriptor::new(StageKind::TestBody, "slow")
        .with_line(12)
        .with_timeout(Duration::from_millis(50))
        .declared_async();
    let body = Stage::from_async(
        descriptor,
        Arc::new(|_scope: StageScope| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
        }),
    );

    let suite = TestSuite::builder("demo")
        .case(TestCase::new("demo.test_slow", 12), body)
        .build();

    let recorder = Arc::new(Recorder::default());
    let summary = run(&suite, &recorder).await;

    assert!(summary.statistics.is_failed);
    assert_eq!(summary.statistics.errors, 1);

    let after = recorder
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::TestAfter)
        .unwrap();
    let interrupted: Vec<_> = after
        .reports
        .iter()
        .filter(|r| r.kind == ReportKind::Interrupted)
        .collect();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].line, Some(12));
}
