mod support;

use serde_json::json;
use std::time::Duration;

use form_pilot::classifier::{Classification, FinalityVerdict};
use form_pilot::config::EngineConfig;
use form_pilot::engine::{Engine, RunContext, StepOutcome};
use form_pilot::error::{ClassifierError, FailureReason, FieldIssue};
use form_pilot::events::{EventSink, RunEvent};
use form_pilot::finality::DirectoryObserver;
use form_pilot::resolver::SelectorResolver;
use form_pilot::surface::{BrowsingSurface, DomRequest};
use form_pilot::types::{ActionSpec, FieldMapping, PageSnapshot, SourceValues, Strategy};

use support::{FakePage, FakeSurface, ScriptedClassifier, classified, fast_config};

const VEHICLE_URL: &str = "https://insurer.example/kasko/arac";
const DRIVER_URL: &str = "https://insurer.example/kasko/surucu";
const SUMMARY_URL: &str = "https://insurer.example/kasko/ozet";

fn vehicle_page() -> FakePage {
    FakePage::new(
        VEHICLE_URL,
        "<form><input id='plate'><button id='next'>Devam</button></form>",
    )
    .text_input("#plate")
    .button("Devam", "#next")
}

fn driver_page() -> FakePage {
    FakePage::new(DRIVER_URL, "<form><h1>Sürücü Bilgileri</h1></form>")
}

fn plate_source() -> SourceValues {
    SourceValues::new(json!({"plate_number": "34 ABC 123"}))
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn fills_plate_and_advances() {
    let surface = FakeSurface::new(vehicle_page()).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(
            FieldMapping::new().with("plate", "#plate"),
            vec![ActionSpec::text("Devam")],
        ),
    );
    let engine = Engine::new(&surface, &classifier, fast_config());

    let mut ctx = RunContext::new(Strategy::FastPath, plate_source());
    let start = PageSnapshot::new(
        "<form><input id='plate'><button id='next'>Devam</button></form>",
        VEHICLE_URL,
    );

    match engine.step(&mut ctx, start).await {
        StepOutcome::Continue(next) => assert_eq!(next.url, DRIVER_URL),
        StepOutcome::Finished(result) => panic!("unexpected finish: {result:?}"),
    }
    assert_eq!(surface.clicks(), ["#next"]);
    assert!(ctx.state.is_processed(VEHICLE_URL));
    assert_eq!(ctx.last_triggered.as_deref(), Some("#next"));
}

#[tokio::test]
async fn written_plate_reads_back_verbatim() {
    let surface = FakeSurface::new(vehicle_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(FieldMapping::new().with("plate", "#plate"), vec![]),
    );
    let engine = Engine::new(&surface, &classifier, fast_config());

    let mut ctx = RunContext::new(Strategy::FastPath, plate_source());
    let start = surface_snapshot(&surface).await;
    let _ = engine.step(&mut ctx, start).await;

    assert_eq!(surface.value_of("#plate").as_deref(), Some("34 ABC 123"));
    // One continue control fired out of the default labels.
    assert_eq!(surface.clicks(), ["#next"]);
}

#[tokio::test]
async fn final_page_without_navigation_reports_stuck_url() {
    let page = FakePage::new(
        SUMMARY_URL,
        "<main><h2>Teklif Özeti</h2><button id='cont'>Continue</button></main>",
    )
    .button("Continue", "#cont");
    let surface = FakeSurface::new(page);
    let classifier = ScriptedClassifier::new().page(
        SUMMARY_URL,
        Classification {
            ok: true,
            is_final: true,
            actions: vec![ActionSpec::text("Continue")],
            ..Default::default()
        },
    );
    let engine = Engine::new(&surface, &classifier, fast_config());

    let result = engine.run(SourceValues::default(), Strategy::FastPath).await;

    assert!(!result.ok);
    assert_eq!(result.error, Some(FailureReason::NoNavigationAfterAction));
    assert_eq!(result.stuck_url.as_deref(), Some(SUMMARY_URL));
    assert_eq!(result.final_selector.as_deref(), Some("#cont"));
    assert!(!result.should_fallback);
    assert_eq!(surface.clicks(), ["#cont"]);
}

#[tokio::test]
async fn low_confidence_escalates_without_touching_the_page() {
    let surface = FakeSurface::new(vehicle_page());
    let classifier = ScriptedClassifier::new()
        .page(
            VEHICLE_URL,
            classified(
                FieldMapping::new()
                    .with("plate_number", "#plate")
                    .with("national_id", "#tckn"),
                vec![ActionSpec::text("Devam")],
            ),
        )
        .wants_fallback();
    let engine = Engine::new(&surface, &classifier, fast_config());

    let result = engine.run(plate_source(), Strategy::FastPath).await;

    assert!(result.should_fallback);
    assert_eq!(result.error, Some(FailureReason::ShouldFallback));
    assert_eq!(result.method, Strategy::FastPath);
    assert_eq!(surface.write_count(), 0);
    assert!(surface.clicks().is_empty());
    assert_eq!(classifier.validate_calls(), 1);
}

#[tokio::test]
async fn processed_page_is_not_filled_again() {
    let surface = FakeSurface::new(vehicle_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(FieldMapping::new().with("plate", "#plate"), vec![]),
    );
    let engine = Engine::new(&surface, &classifier, fast_config());

    let mut ctx = RunContext::new(Strategy::FastPath, plate_source());
    ctx.state.mark_processed(VEHICLE_URL);

    for _ in 0..2 {
        let snapshot = surface_snapshot(&surface).await;
        let outcome = engine.step(&mut ctx, snapshot).await;
        match outcome {
            StepOutcome::Finished(result) => {
                assert_eq!(result.error, Some(FailureReason::NoNavigationAfterAction))
            }
            StepOutcome::Continue(_) => panic!("page did not change"),
        }
    }

    assert_eq!(surface.write_count(), 0);
    assert!(surface.clicks().is_empty());
    assert_eq!(classifier.classify_calls(), 0);
}

#[tokio::test]
async fn write_success_without_value_is_not_committed() {
    let page = FakePage::new(VEHICLE_URL, "<form><input id='plate'><input id='tckn'></form>")
        .stubborn_input("#plate")
        .text_input("#tckn")
        .button("Devam", "#next");
    let surface = FakeSurface::new(page);
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(
            FieldMapping::new()
                .with("plate_number", "#plate")
                .with("national_id", "#tckn"),
            vec![ActionSpec::text("Devam")],
        ),
    );
    let (events, mut rx) = EventSink::channel();
    let config = EngineConfig {
        max_iterations: 2,
        ..fast_config()
    };
    let engine = Engine::new(&surface, &classifier, config).with_events(events);

    let source = SourceValues::new(json!({
        "plate_number": "34 ABC 123",
        "national_id": "12345678901",
    }));
    let result = engine.run(source, Strategy::FastPath).await;

    // Plate never sticks: one of two commits is below the minimum of two.
    assert!(surface.clicks().is_empty());
    assert_eq!(result.error, Some(FailureReason::IterationLimit));
    assert_eq!(surface.value_of("#tckn").as_deref(), Some("12345678901"));
    // Identical markup on the second pass reuses the first classification.
    assert_eq!(classifier.classify_calls(), 1);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::FieldSkipped { issue: FieldIssue::NotCommitted { key, .. } } if key == "plate_number"
    )));
    assert!(!events.iter().any(|e| matches!(
        e,
        RunEvent::FieldCommitted { key, .. } if key == "plate_number"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Gate { permitted: false, committed: 1, required: 2, .. }
    )));
}

#[tokio::test]
async fn stale_mapping_still_fires_the_action() {
    let surface = FakeSurface::new(vehicle_page()).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new()
        .page(
            VEHICLE_URL,
            classified(
                FieldMapping::new()
                    .with("plate_number", "#plakaEski")
                    .with("national_id", "#tcknEski"),
                vec![ActionSpec::text("Devam")],
            ),
        )
        .filled(false);
    let (events, mut rx) = EventSink::channel();
    let engine = Engine::new(&surface, &classifier, fast_config()).with_events(events);

    let source = SourceValues::new(json!({
        "plate_number": "34 ABC 123",
        "national_id": "12345678901",
    }));
    let mut ctx = RunContext::new(Strategy::FastPath, source);
    let start = surface_snapshot(&surface).await;
    let outcome = engine.step(&mut ctx, start).await;

    assert!(matches!(outcome, StepOutcome::Continue(ref next) if next.url == DRIVER_URL));
    assert_eq!(surface.clicks(), ["#next"]);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        RunEvent::Gate { permitted: true, forced: true, committed: 0, .. }
    )));
}

#[tokio::test]
async fn single_resolvable_field_needs_one_commit() {
    let page = FakePage::new(VEHICLE_URL, "<form><input id='plate'><input id='mail'></form>")
        .text_input("#plate")
        .text_input("#mail")
        .button("Devam", "#next");
    let surface = FakeSurface::new(page).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(
            FieldMapping::new()
                .with("plate_number", "#plate")
                .with("email", "#mail"),
            vec![],
        ),
    );
    let engine = Engine::new(&surface, &classifier, fast_config());

    // Only the plate has data; email resolves to nothing.
    let mut ctx = RunContext::new(Strategy::FastPath, plate_source());
    let start = surface_snapshot(&surface).await;
    let outcome = engine.step(&mut ctx, start).await;

    assert!(matches!(outcome, StepOutcome::Continue(_)));
    assert_eq!(surface.clicks(), ["#next"]);
    assert!(!surface.requests().iter().any(|r| matches!(
        r,
        DomRequest::SetValue { selector, .. } if selector == "#mail"
    )));
}

#[tokio::test]
async fn escalated_run_finishes_on_document_link() {
    let result_page = FakePage::new(
        DRIVER_URL,
        "<main><p>Teklifiniz hazır</p><a href='/docs/teklif-991.pdf'>PDF indir</a></main>",
    );
    let surface = FakeSurface::new(vehicle_page()).on_click("#next", result_page);

    let fast = ScriptedClassifier::new().page(
        VEHICLE_URL,
        Classification {
            ok: false,
            ..Default::default()
        },
    );
    let heavy = ScriptedClassifier::new()
        .page(
            VEHICLE_URL,
            classified(
                FieldMapping::new().with("plate_number", "#plate"),
                vec![ActionSpec::selector("#next")],
            ),
        )
        .page(
            DRIVER_URL,
            Classification {
                ok: true,
                is_final: true,
                ..Default::default()
            },
        );
    let engine = Engine::new(&surface, &fast, fast_config());

    let result = engine.run_with_escalation(&heavy, plate_source()).await;

    assert!(result.ok, "{result:?}");
    assert_eq!(result.method, Strategy::Escalated);
    assert_eq!(result.artifact_path.as_deref(), Some("/docs/teklif-991.pdf"));
    assert_eq!(fast.classify_calls(), 1);
    assert_eq!(surface.value_of("#plate"), None, "page moved on");
}

#[tokio::test]
async fn observer_artifact_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new(SUMMARY_URL, "<main><button id='dl'>Teklif Al</button></main>")
        .button("Teklif Al", "#dl");
    let surface = FakeSurface::new(page);
    let classifier = ScriptedClassifier::new()
        .page(
            SUMMARY_URL,
            Classification {
                ok: true,
                is_final: true,
                cta_present: true,
                ..Default::default()
            },
        )
        .verdict(FinalityVerdict {
            is_final: true,
            hits: vec!["teklif no".into(), "prim".into()],
        });
    let observer = DirectoryObserver::default();
    let config = EngineConfig {
        download_dir: Some(dir.path().to_path_buf()),
        artifact_timeout_ms: 2_000,
        ..fast_config()
    };
    let engine = Engine::new(&surface, &classifier, config).with_observer(&observer);

    let target = dir.path().join("teklif.pdf");
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(target, b"%PDF-1.7").unwrap();
    });

    let result = engine.run(SourceValues::default(), Strategy::FastPath).await;
    writer.await.unwrap();

    assert!(result.ok, "{result:?}");
    assert!(result.artifact_path.unwrap().ends_with("teklif.pdf"));
    assert_eq!(result.final_selector.as_deref(), Some("#dl"));
}

#[tokio::test]
async fn unreadable_page_is_no_initial_snapshot() {
    let surface = FakeSurface::new(vehicle_page()).broken();
    let classifier = ScriptedClassifier::new();
    let engine = Engine::new(&surface, &classifier, fast_config());

    let result = engine.run(plate_source(), Strategy::FastPath).await;

    assert_eq!(result.error, Some(FailureReason::NoInitialSnapshot));
    assert_eq!(classifier.classify_calls(), 0);
    assert!(!result.message().contains("no_initial_snapshot"));
}

#[tokio::test]
async fn classifier_outage_depends_on_strategy() {
    let surface = FakeSurface::new(vehicle_page());
    let classifier =
        ScriptedClassifier::new().failing(ClassifierError::Unreachable("connection refused".into()));
    let engine = Engine::new(&surface, &classifier, fast_config());

    let fast = engine.run(plate_source(), Strategy::FastPath).await;
    assert!(fast.should_fallback);

    let escalated = engine.run(plate_source(), Strategy::Escalated).await;
    assert_eq!(escalated.error, Some(FailureReason::ClassifierUnreachable));
    assert!(!escalated.should_fallback);
    assert_eq!(surface.write_count(), 0);
}

#[tokio::test]
async fn attempt_budget_is_enforced() {
    let surface = FakeSurface::new(vehicle_page()).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(FieldMapping::new().with("plate", "#plate"), vec![]),
    );
    let config = EngineConfig {
        max_fast_path_attempts: 1,
        ..fast_config()
    };
    let engine = Engine::new(&surface, &classifier, config);

    let result = engine.run(plate_source(), Strategy::FastPath).await;

    assert_eq!(result.error, Some(FailureReason::AttemptsExhausted));
    assert_eq!(result.stuck_url.as_deref(), Some(DRIVER_URL));
    assert_eq!(classifier.classify_calls(), 1);
    assert_eq!(result.iterations, 2);
}

#[tokio::test]
async fn terminal_flag_resets_between_runs() {
    let surface = FakeSurface::new(vehicle_page());
    let classifier = ScriptedClassifier::new();
    let engine = Engine::new(&surface, &classifier, fast_config());

    let mut ctx = RunContext::new(Strategy::FastPath, plate_source());
    ctx.terminal_signal_seen = true;
    let _ = engine.run_in(&mut ctx).await;
    assert!(!ctx.terminal_signal_seen);
}

#[tokio::test]
async fn radio_group_commits_when_another_option_is_chosen() {
    let page = FakePage::new(
        VEHICLE_URL,
        "<form><input id='plate'><input type='radio' id='cinsE'><input type='radio' id='cinsK'></form>",
    )
    .text_input("#plate")
    .radio("#cinsE", "cinsiyet", "E")
    .radio("#cinsK", "cinsiyet", "K")
    .button("Devam", "#next");
    let surface = FakeSurface::new(page).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(
            FieldMapping::new()
                .with("plate_number", "#plate")
                .with("gender", "#cinsE"),
            vec![ActionSpec::text("Devam")],
        ),
    );
    let (events, mut rx) = EventSink::channel();
    let engine = Engine::new(&surface, &classifier, fast_config()).with_events(events);

    let source = SourceValues::new(json!({"plate_number": "34 ABC 123", "gender": "K"}));
    let mut ctx = RunContext::new(Strategy::FastPath, source);
    let start = surface_snapshot(&surface).await;
    let outcome = engine.step(&mut ctx, start).await;

    assert!(matches!(outcome, StepOutcome::Continue(ref next) if next.url == DRIVER_URL));
    // One click on the chosen option, then the continue control.
    assert_eq!(surface.clicks(), ["#cinsK", "#next"]);
    assert_eq!(ctx.cached_classifications(), 1);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::FieldCommitted { key, attempt: 0, .. } if key == "gender"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Gate { permitted: true, forced: false, committed: 2, required: 2 }
    )));
}

#[tokio::test]
async fn late_field_is_retried_after_settling() {
    let page = FakePage::new(VEHICLE_URL, "<form><div id='slot'></div></form>")
        .late_input("#plate", Duration::from_millis(40))
        .button("Devam", "#next");
    let surface = FakeSurface::new(page).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(
            FieldMapping::new().with("plate_number", "#plate"),
            vec![ActionSpec::text("Devam")],
        ),
    );
    let config = EngineConfig {
        field_settle_base_ms: 30,
        ..fast_config()
    };
    let (events, mut rx) = EventSink::channel();
    let engine = Engine::new(&surface, &classifier, config).with_events(events);

    let mut ctx = RunContext::new(Strategy::FastPath, plate_source());
    let start = surface_snapshot(&surface).await;
    let outcome = engine.step(&mut ctx, start).await;

    assert!(matches!(outcome, StepOutcome::Continue(ref next) if next.url == DRIVER_URL));
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::FieldSkipped { issue: FieldIssue::SelectorNotFound { key, .. } } if key == "plate_number"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::FieldCommitted { key, attempt, .. } if key == "plate_number" && *attempt >= 1
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Gate { permitted: true, forced: false, committed: 1, .. }
    )));
}

#[tokio::test]
async fn gate_reads_written_values_from_live_markup() {
    let page = || {
        FakePage::new(VEHICLE_URL, "<form><input id='plate'><input id='tckn'></form>")
            .text_input("#plate")
            .text_input("#tckn")
            .button("Devam", "#next")
    };
    let mapping = || {
        classified(
            FieldMapping::new()
                .with("plate_number", "#plate")
                .with("national_id", "#tckn"),
            vec![ActionSpec::text("Devam")],
        )
    };
    let source = || {
        SourceValues::new(json!({
            "plate_number": "34 ABC 123",
            "national_id": "12345678901",
        }))
    };

    let live = FakeSurface::new(page()).live_markup().on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new().page(VEHICLE_URL, mapping()).reads_markup();
    let engine = Engine::new(&live, &classifier, fast_config());
    let mut ctx = RunContext::new(Strategy::FastPath, source());
    let start = surface_snapshot(&live).await;
    let outcome = engine.step(&mut ctx, start).await;
    assert!(matches!(outcome, StepOutcome::Continue(ref next) if next.url == DRIVER_URL));

    // Markup that never reflects the writes keeps the gate closed.
    let frozen = FakeSurface::new(page()).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new().page(VEHICLE_URL, mapping()).reads_markup();
    let engine = Engine::new(&frozen, &classifier, fast_config());
    let mut ctx = RunContext::new(Strategy::FastPath, source());
    let start = surface_snapshot(&frozen).await;
    let outcome = engine.step(&mut ctx, start).await;
    assert!(matches!(outcome, StepOutcome::Continue(ref next) if next.url == VEHICLE_URL));
    assert!(frozen.clicks().is_empty());
}

#[tokio::test]
async fn transient_classifier_failure_is_retried() {
    let surface = FakeSurface::new(vehicle_page()).on_click("#next", driver_page());
    let classifier = ScriptedClassifier::new()
        .page(
            VEHICLE_URL,
            classified(
                FieldMapping::new().with("plate_number", "#plate"),
                vec![ActionSpec::text("Devam")],
            ),
        )
        .flaky(1, ClassifierError::Rejected {
            status: 503,
            message: "warming up".into(),
        });
    let config = EngineConfig {
        classifier_retries: 1,
        ..fast_config()
    };
    let engine = Engine::new(&surface, &classifier, config);

    let mut ctx = RunContext::new(Strategy::FastPath, plate_source());
    let start = surface_snapshot(&surface).await;
    let outcome = engine.step(&mut ctx, start).await;

    assert!(matches!(outcome, StepOutcome::Continue(ref next) if next.url == DRIVER_URL));
    assert_eq!(classifier.classify_calls(), 2);
    assert_eq!(ctx.state.attempts_used(Strategy::FastPath), 1);
}

#[tokio::test]
async fn strong_terminal_page_gets_the_extended_wait() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new(SUMMARY_URL, "<main><button id='dl'>Teklif Al</button></main>")
        .button("Teklif Al", "#dl");
    let surface = FakeSurface::new(page);
    let classifier = ScriptedClassifier::new().page(
        SUMMARY_URL,
        Classification {
            ok: true,
            is_final: true,
            cta_present: true,
            ..Default::default()
        },
    );
    let observer = DirectoryObserver::default();
    let config = EngineConfig {
        download_dir: Some(dir.path().to_path_buf()),
        artifact_timeout_ms: 40,
        artifact_extended_timeout_ms: 3_000,
        ..fast_config()
    };
    let engine = Engine::new(&surface, &classifier, config).with_observer(&observer);

    // Lands after the first wait has given up.
    let target = dir.path().join("police.pdf");
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(target, b"%PDF-1.7").unwrap();
    });

    let result = engine.run(SourceValues::default(), Strategy::FastPath).await;
    writer.await.unwrap();

    assert!(result.ok, "{result:?}");
    assert!(result.artifact_path.unwrap().ends_with("police.pdf"));
}

#[tokio::test]
async fn inline_document_after_terminal_page_is_success() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new(
        SUMMARY_URL,
        "<main><h2>Teklif Özeti</h2><a href='/teklif/55.pdf'>Görüntüle</a><button id='cont'>Continue</button></main>",
    )
    .button("Continue", "#cont");
    let surface = FakeSurface::new(page);
    let classifier = ScriptedClassifier::new().page(
        SUMMARY_URL,
        Classification {
            ok: true,
            is_final: true,
            actions: vec![ActionSpec::text("Continue")],
            ..Default::default()
        },
    );
    // Armed observer that never sees a file: only the page shows the document.
    let observer = DirectoryObserver::default();
    let config = EngineConfig {
        download_dir: Some(dir.path().to_path_buf()),
        ..fast_config()
    };
    let engine = Engine::new(&surface, &classifier, config).with_observer(&observer);

    let result = engine.run(SourceValues::default(), Strategy::FastPath).await;

    assert!(result.ok, "{result:?}");
    assert_eq!(result.artifact_path.as_deref(), Some("/teklif/55.pdf"));
    assert_eq!(result.final_selector.as_deref(), Some("#cont"));
    assert_eq!(surface.current_url(), SUMMARY_URL);
}

#[tokio::test]
async fn strong_terminal_page_without_document_is_artifact_timeout() {
    let page = FakePage::new(SUMMARY_URL, "<main><button id='dl'>Teklif Al</button></main>")
        .button("Teklif Al", "#dl");
    let surface = FakeSurface::new(page);
    let classifier = ScriptedClassifier::new().page(
        SUMMARY_URL,
        Classification {
            ok: true,
            is_final: true,
            cta_present: true,
            ..Default::default()
        },
    );
    let engine = Engine::new(&surface, &classifier, fast_config());

    let result = engine.run(SourceValues::default(), Strategy::FastPath).await;

    assert_eq!(result.error, Some(FailureReason::ArtifactTimeout));
    assert_eq!(result.stuck_url.as_deref(), Some(SUMMARY_URL));
    assert_eq!(result.final_selector.as_deref(), Some("#dl"));
}

#[tokio::test]
async fn exhausted_fast_path_escalates() {
    let result_page = FakePage::new(
        DRIVER_URL,
        "<main><p>Teklifiniz hazır</p><a href='/docs/teklif-12.pdf'>PDF</a></main>",
    );
    let surface = FakeSurface::new(vehicle_page()).on_click("#next", result_page);
    let fast = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(FieldMapping::new().with("plate_number", "#plate"), vec![]),
    );
    let heavy = ScriptedClassifier::new().page(
        DRIVER_URL,
        Classification {
            ok: true,
            is_final: true,
            ..Default::default()
        },
    );
    let config = EngineConfig {
        max_fast_path_attempts: 1,
        ..fast_config()
    };
    let (events, mut rx) = EventSink::channel();
    let engine = Engine::new(&surface, &fast, config).with_events(events);

    let result = engine.run_with_escalation(&heavy, plate_source()).await;

    assert!(result.ok, "{result:?}");
    assert_eq!(result.method, Strategy::Escalated);
    assert_eq!(heavy.classify_calls(), 1);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        RunEvent::Escalating { reason } if reason == "attempts_exhausted"
    )));
}

#[tokio::test]
async fn custom_resolver_maps_insurer_keys() {
    let surface = FakeSurface::new(vehicle_page());
    let classifier = ScriptedClassifier::new().page(
        VEHICLE_URL,
        classified(FieldMapping::new().with("plate_number", "#plate"), vec![]),
    );
    let resolver = SelectorResolver::empty().with_synonyms("plate_number", ["vehicle_reg"]);
    let engine = Engine::new(&surface, &classifier, fast_config()).with_resolver(resolver);

    let source = SourceValues::new(json!({"vehicle_reg": "06 XYZ 42"}));
    let mut ctx = RunContext::new(Strategy::FastPath, source);
    let start = surface_snapshot(&surface).await;
    let _ = engine.step(&mut ctx, start).await;

    assert_eq!(surface.value_of("#plate").as_deref(), Some("06 XYZ 42"));
}

async fn surface_snapshot(surface: &FakeSurface) -> PageSnapshot {
    surface.snapshot().await.unwrap()
}
