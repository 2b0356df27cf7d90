//! End-to-end tests driving hands through a catalog with the in-process engine.

use std::collections::{BTreeSet, HashMap};

use ery_engine::{CallCountingMiddleware, Engine, LocalEngineClient};
use ery_flow::{
    BlockType, Catalog, CatalogDocument, ConditionCompiler, FlowConfig, FlowEngine, FlowEvent, HandId,
    HandStatus, Redirect, StageKey, StageRef, Transition,
};
use ery_types::{EryError, NotFoundKind};
use serde_json::json;

const SURVEY: &str = r#"{
    "templates": [
        {"name": "Base", "frontend": "Web", "blocks": [
            {"name": "Root", "translations": [{"language": "en", "content": "<main/>"}]}
        ]},
        {"name": "Layout", "frontend": "Web", "parental_template": "Base", "blocks": [
            {"name": "title", "translations": [{"language": "en", "content": "Layout title"}]},
            {"name": "footer", "translations": [
                {"language": "en", "content": "Footer"},
                {"language": "de", "content": "Fusszeile"}
            ]}
        ]},
        {"name": "Page", "frontend": "Web", "parental_template": "Layout", "blocks": [
            {"name": "title", "translations": [{"language": "en", "content": "Page title"}]}
        ]}
    ],
    "modules": [{
        "name": "survey",
        "start_stage": "Intro",
        "variables": [
            {"name": "age", "default": 0},
            {"name": "visits", "default": 0}
        ],
        "conditions": [
            {"name": "is_senior", "left_type": "variable", "left_variable_definition": "age",
             "right_type": "expression", "right_expression": "65", "relation": "greater_or_equal"},
            {"name": "is_adult", "left_type": "variable", "left_variable_definition": "age",
             "right_type": "expression", "right_expression": "18", "relation": "greater_or_equal"},
            {"name": "is_teen", "left_type": "variable", "left_variable_definition": "age",
             "right_type": "expression", "right_expression": "13", "relation": "greater_or_equal"},
            {"name": "adult_and_teen", "left_type": "sub_condition", "left_sub_condition": "is_adult",
             "right_type": "sub_condition", "right_sub_condition": "is_teen", "operator": "op_and"}
        ],
        "actions": [
            {"name": "count_visit", "steps": [
                {"order": 1, "type": "set_variable", "variable": "visits", "value": "visits + 1"},
                {"order": 2, "type": "log", "message": "visited"}
            ]}
        ],
        "stage_definitions": [
            {"name": "Intro",
             "stage_templates": [{"template": "Page", "blocks": [
                {"name": "banner", "translations": [{"language": "en", "content": "Welcome"}]},
                {"name": "title", "translations": [{"language": "en", "content": "Intro title"}]}
             ]}],
             "redirects": [
                {"order": 1, "condition": "is_senior", "next_stage_definition": "Senior"},
                {"order": 2, "condition": "is_adult", "next_stage_definition": "Adult"},
                {"order": 3, "condition": "is_teen", "next_stage_definition": "Teen"},
                {"order": 4, "next_stage_definition": "Minor"}
             ]},
            {"name": "Adult", "pre_action": "count_visit",
             "stage_templates": [{"template": "Page"}],
             "redirects": [{"order": 1, "next_stage_definition": "Outro"}]},
            {"name": "Senior", "end_stage": true, "stage_templates": [{"template": "Page"}]},
            {"name": "Teen", "end_stage": true, "stage_templates": [{"template": "Page"}]},
            {"name": "Minor", "end_stage": true, "stage_templates": [{"template": "Page"}]},
            {"name": "Outro", "end_stage": true, "stage_templates": [{"template": "Page"}]}
        ]
    }]
}"#;

fn catalog() -> Catalog {
    Catalog::from_json(SURVEY).unwrap()
}

fn document() -> CatalogDocument {
    serde_json::from_str(SURVEY).unwrap()
}

fn flow(catalog: Catalog) -> FlowEngine {
    FlowEngine::new(catalog, Engine::new(LocalEngineClient::new())).unwrap()
}

fn key(stage: &str) -> StageKey {
    StageKey::new("survey", stage)
}

async fn hand_aged(flow: &mut FlowEngine, age: i64) -> HandId {
    flow.add_hand_with_variables("survey", "Web", "en", HashMap::from([("age".to_string(), json!(age))]))
        .await
        .unwrap()
}

async fn visits(flow: &FlowEngine, hand: HandId) -> f64 {
    flow.hand(hand)
        .unwrap()
        .context
        .get("visits")
        .await
        .and_then(|v| v.as_f64())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Redirects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_passing_redirect_wins_and_later_ones_are_not_evaluated() {
    let counter = CallCountingMiddleware::new();
    let engine = Engine::new(LocalEngineClient::new()).with_middleware(counter.clone());
    let mut flow = FlowEngine::new(catalog(), engine).unwrap();
    let hand = hand_aged(&mut flow, 30).await;

    assert_eq!(flow.get_redirect_stage(hand).await.unwrap(), key("Adult"));
    assert_eq!(counter.calls_for("is_senior"), 1);
    assert_eq!(counter.calls_for("is_adult"), 1);
    assert_eq!(counter.calls_for("is_teen"), 0);
    // Looking up the target does not move the hand
    assert_eq!(flow.current_stage(hand).unwrap(), key("Intro"));
}

#[tokio::test]
async fn unconditional_redirect_is_the_default_path() {
    let mut flow = flow(catalog());
    let hand = hand_aged(&mut flow, 5).await;
    assert_eq!(flow.get_redirect_stage(hand).await.unwrap(), key("Minor"));
}

#[tokio::test]
async fn no_passing_redirect_is_not_found() {
    let mut doc = document();
    let intro = doc.modules[0]
        .stage_definitions
        .iter_mut()
        .find(|s| s.name == "Intro")
        .unwrap();
    intro.redirects.retain(|r| r.condition.is_some());
    let mut flow = flow(Catalog::from_document(doc).unwrap());
    let hand = hand_aged(&mut flow, 5).await;

    let err = flow.submit(hand).await.unwrap_err();
    assert_eq!(err.not_found_kind(), Some(NotFoundKind::Redirect));
    assert_eq!(flow.current_stage(hand).unwrap(), key("Intro"));
}

#[test]
fn cross_module_redirect_is_rejected() {
    let mut catalog = catalog();
    let err = catalog
        .add_redirect(&key("Intro"), Redirect::new(9, StageRef::qualified("other", "Elsewhere")))
        .unwrap_err();
    assert!(matches!(err, EryError::Validation { ref field, .. } if field == "next_stage_definition"));

    let json = SURVEY.replace("\"next_stage_definition\": \"Minor\"", "\"next_stage_definition\": \"other/Minor\"");
    let result = FlowEngine::new(
        Catalog::from_json(&json).unwrap(),
        Engine::new(LocalEngineClient::new()),
    );
    assert!(matches!(result, Err(EryError::Validation { .. })));
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

#[test]
fn catalog_conditions_compile_recursively() {
    let catalog = catalog();
    let module = catalog.module("survey").unwrap();
    let compiler = ConditionCompiler::new(module, 32);
    assert_eq!(compiler.compile("is_adult").unwrap(), "(age) >= (18)");
    assert_eq!(
        compiler.compile("adult_and_teen").unwrap(),
        "((age) >= (18)) && ((age) >= (13))"
    );
}

// ---------------------------------------------------------------------------
// Submission, pre-actions and back navigation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_walks_to_an_end_stage() {
    let mut flow = flow(catalog());
    let hand = hand_aged(&mut flow, 30).await;

    let first = flow.submit(hand).await.unwrap();
    assert!(matches!(first, Transition::Redirected { ref to, .. } if *to == key("Adult")));
    assert_eq!(visits(&flow, hand).await, 1.0);
    assert_eq!(flow.hand(hand).unwrap().context.logs().await, vec!["visited".to_string()]);
    let stage = flow.hand(hand).unwrap().stage.unwrap();
    assert!(flow.runtime().stage(stage).unwrap().preaction_started);

    flow.submit(hand).await.unwrap();
    assert_eq!(flow.current_stage(hand).unwrap(), key("Outro"));
    assert_eq!(flow.hand(hand).unwrap().status, HandStatus::Finished);

    // Finished hands stay put
    assert_eq!(flow.submit(hand).await.unwrap(), Transition::Stayed);
    assert_eq!(flow.runtime().breadcrumbs().for_hand(hand).len(), 3);
}

#[tokio::test]
async fn back_then_submit_replays_the_recorded_path() {
    let mut flow = flow(catalog());
    let hand = hand_aged(&mut flow, 30).await;
    let Transition::Redirected { breadcrumb, .. } = flow.submit(hand).await.unwrap() else {
        panic!("expected a redirect");
    };

    assert!(flow.back(hand).unwrap());
    assert_eq!(flow.current_stage(hand).unwrap(), key("Intro"));
    // Nothing before the start stage
    assert!(!flow.back(hand).unwrap());

    let replay = flow.submit(hand).await.unwrap();
    assert_eq!(
        replay,
        Transition::Replayed {
            to: key("Adult"),
            breadcrumb,
        }
    );
    // Same stage instance, so the pre-action does not run again
    assert_eq!(flow.runtime().stages_of(&key("Adult")).len(), 1);
    assert_eq!(visits(&flow, hand).await, 1.0);
    assert_eq!(flow.runtime().breadcrumbs().for_hand(hand).len(), 2);
}

#[tokio::test]
async fn stage_without_back_links_cannot_go_back() {
    let mut doc = document();
    for stage in &mut doc.modules[0].stage_definitions {
        if stage.name == "Adult" {
            stage.breadcrumb_type = ery_flow::BreadcrumbType::None;
        }
    }
    let mut flow = flow(Catalog::from_document(doc).unwrap());
    let hand = hand_aged(&mut flow, 30).await;
    flow.submit(hand).await.unwrap();

    assert!(!flow.back(hand).unwrap());
    assert_eq!(flow.current_stage(hand).unwrap(), key("Adult"));
    let crumb = flow.hand(hand).unwrap().current_breadcrumb.unwrap();
    assert_eq!(flow.runtime().breadcrumbs().get(crumb).unwrap().previous, None);
}

#[tokio::test]
async fn redirect_on_submit_off_keeps_the_hand() {
    let mut doc = document();
    for stage in &mut doc.modules[0].stage_definitions {
        if stage.name == "Intro" {
            stage.redirect_on_submit = false;
        }
    }
    let mut flow = flow(Catalog::from_document(doc).unwrap());
    let hand = hand_aged(&mut flow, 30).await;
    assert_eq!(flow.submit(hand).await.unwrap(), Transition::Stayed);
    assert_eq!(flow.current_stage(hand).unwrap(), key("Intro"));
}

#[tokio::test]
async fn failed_pre_action_leaves_runtime_untouched() {
    let json = SURVEY.replace(
        "\"value\": \"visits + 1\"",
        "\"value\": \"no_such_variable + 1\"",
    );
    let mut flow = flow(Catalog::from_json(&json).unwrap());
    let hand = hand_aged(&mut flow, 30).await;

    let err = flow.submit(hand).await.unwrap_err();
    assert!(matches!(err, EryError::ActionFailed { ref action, step: 1, .. } if action == "count_visit"));
    assert_eq!(flow.current_stage(hand).unwrap(), key("Intro"));
    assert_eq!(flow.runtime().stages().count(), 1);
    assert_eq!(flow.runtime().breadcrumbs().len(), 1);
    assert_eq!(visits(&flow, hand).await, 0.0);
}

#[tokio::test]
async fn quit_step_ends_the_hand() {
    let json = SURVEY.replace(
        "{\"order\": 2, \"type\": \"log\", \"message\": \"visited\"}",
        "{\"order\": 2, \"type\": \"quit\"}",
    );
    let mut flow = flow(Catalog::from_json(&json).unwrap());
    let mut events = flow.subscribe();
    let hand = hand_aged(&mut flow, 30).await;
    flow.submit(hand).await.unwrap();

    assert_eq!(flow.hand(hand).unwrap().status, HandStatus::Quit);
    assert_eq!(visits(&flow, hand).await, 1.0);
    let mut quit = false;
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::HandQuit { stage, .. } = event {
            assert_eq!(stage, "survey/Adult");
            quit = true;
        }
    }
    assert!(quit);
}

#[tokio::test]
async fn unknown_variable_override_is_rejected() {
    let mut flow = flow(catalog());
    let err = flow
        .add_hand_with_variables("survey", "Web", "en", HashMap::from([("height".to_string(), json!(2))]))
        .await
        .unwrap_err();
    assert_eq!(err.not_found_kind(), Some(NotFoundKind::Variable));
    assert_eq!(flow.runtime().hands().count(), 0);
}

#[tokio::test]
async fn events_follow_the_hand() {
    let mut flow = flow(catalog());
    let mut rx = flow.subscribe();
    let hand = hand_aged(&mut flow, 30).await;
    flow.submit(hand).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(FlowEvent::HandStarted { module, .. }) if module == "survey"));
    let evaluated: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            FlowEvent::RedirectEvaluated { order, passed, .. } => Some((*order, *passed)),
            _ => None,
        })
        .collect();
    assert_eq!(evaluated, vec![(1, false), (2, true)]);
    assert!(seen.iter().any(|e| matches!(
        e,
        FlowEvent::PreActionRun { action, steps_run: 2, .. } if action == "count_visit"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        FlowEvent::StageEntered { stage, .. } if stage == "survey/Adult"
    )));
    assert!(seen
        .iter()
        .any(|e| matches!(e, FlowEvent::RedirectSelected { to, .. } if to == "survey/Adult")));
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocks_merge_stage_and_template_generations() {
    let mut flow = flow(catalog());
    let hand = flow.add_hand("survey", "Web", "de").await.unwrap();
    let blocks = flow.get_blocks(hand).unwrap();

    let names: Vec<_> = blocks.keys().cloned().collect();
    assert_eq!(names, vec!["Root", "banner", "footer", "title"]);

    // Stage template blocks beat template blocks
    let title = &blocks["title"];
    assert_eq!(title.content, "Intro title");
    assert_eq!(title.block_type, BlockType::StageTemplateBlock);
    assert_eq!(title.ancestor_id, None);

    // Preferred language where a translation exists
    assert_eq!(blocks["footer"].content, "Fusszeile");
    assert_eq!(blocks["footer"].ancestor_id.as_deref(), Some("Layout"));
    // Primary language otherwise
    assert_eq!(blocks["banner"].content, "Welcome");
    assert_eq!(blocks["Root"].ancestor_id.as_deref(), Some("Base"));
}

#[tokio::test]
async fn nearest_template_generation_wins() {
    let mut flow = flow(catalog());
    let hand = hand_aged(&mut flow, 30).await;
    flow.submit(hand).await.unwrap();
    let blocks = flow.get_blocks(hand).unwrap();
    assert_eq!(blocks["title"].content, "Page title");
    assert_eq!(blocks["title"].ancestor_id.as_deref(), Some("Page"));
    assert_eq!(blocks["title"].block_type, BlockType::TemplateBlock);
}

#[tokio::test]
async fn unknown_frontend_has_no_stage_template() {
    let mut flow = flow(catalog());
    let hand = flow.add_hand("survey", "Kiosk", "en").await.unwrap();
    let err = flow.get_blocks(hand).unwrap_err();
    assert_eq!(err.not_found_kind(), Some(NotFoundKind::StageTemplate));
}

// ---------------------------------------------------------------------------
// Deletion and breadcrumb repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleting_a_middle_stage_relinks_neighbours_and_moves_hands() {
    let mut flow = flow(catalog());
    let walker = hand_aged(&mut flow, 30).await;
    flow.submit(walker).await.unwrap();
    flow.submit(walker).await.unwrap();
    let crumbs: Vec<_> = flow
        .runtime()
        .breadcrumbs()
        .for_hand(walker)
        .iter()
        .map(|c| c.id)
        .collect();
    let [intro, adult, outro] = crumbs[..] else {
        panic!("expected three breadcrumbs, got {crumbs:?}");
    };

    let waiting = hand_aged(&mut flow, 40).await;
    flow.submit(waiting).await.unwrap();
    let waiting_intro = flow.runtime().breadcrumbs().get(
        flow.hand(waiting).unwrap().current_breadcrumb.unwrap(),
    )
    .unwrap()
    .previous
    .unwrap();

    let report = flow.delete_stage_definition(&key("Adult")).unwrap();
    assert_eq!(report.stages_removed, 2);
    assert_eq!(report.repair.removed.len(), 2);

    let arena = flow.runtime().breadcrumbs();
    assert!(!arena.contains(adult));
    assert_eq!(arena.get(intro).unwrap().next, Some(outro));
    assert_eq!(arena.get(outro).unwrap().previous, Some(intro));
    assert_eq!(flow.hand(walker).unwrap().current_breadcrumb, Some(outro));

    // No next crumb, so the waiting hand falls back to the previous one
    assert_eq!(flow.hand(waiting).unwrap().current_breadcrumb, Some(waiting_intro));
    assert_eq!(flow.current_stage(waiting).unwrap(), key("Intro"));
    arena.check_links().unwrap();

    // Incoming redirects go with the definition
    let targets: BTreeSet<_> = flow
        .catalog()
        .stage_definition(&key("Intro"))
        .unwrap()
        .redirects
        .iter()
        .map(|r| r.next_stage_definition.stage.clone())
        .collect();
    assert!(!targets.contains("Adult"));
    assert_eq!(
        flow.catalog().stage_definition(&key("Adult")).unwrap_err().not_found_kind(),
        Some(NotFoundKind::StageDefinition)
    );
}

#[tokio::test]
async fn deleting_the_only_stage_of_a_hand_clears_its_pointer() {
    let mut flow = flow(catalog());
    let hand = hand_aged(&mut flow, 30).await;
    flow.delete_stage_definition(&key("Intro")).unwrap();

    let hand = flow.hand(hand).unwrap();
    assert_eq!(hand.current_breadcrumb, None);
    assert_eq!(hand.stage, None);
    assert!(flow.runtime().breadcrumbs().is_empty());
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checkpoint_and_restore_resume_the_hand() {
    let dir = tempfile::tempdir().unwrap();
    let config = FlowConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..FlowConfig::default()
    };

    let mut first = FlowEngine::with_config(catalog(), Engine::new(LocalEngineClient::new()), config.clone()).unwrap();
    let hand = hand_aged(&mut first, 30).await;
    first.submit(hand).await.unwrap();
    let path = first.checkpoint().await.unwrap().unwrap();
    assert!(path.ends_with("runtime.json"));

    let mut second = FlowEngine::with_config(catalog(), Engine::new(LocalEngineClient::new()), config).unwrap();
    assert!(second.restore().await.unwrap());
    assert_eq!(second.current_stage(hand).unwrap(), key("Adult"));
    assert_eq!(visits(&second, hand).await, 1.0);
    assert_eq!(second.hand(hand).unwrap().context.logs().await, vec!["visited".to_string()]);

    second.submit(hand).await.unwrap();
    assert_eq!(second.current_stage(hand).unwrap(), key("Outro"));
    assert_eq!(second.hand(hand).unwrap().status, HandStatus::Finished);
}

#[tokio::test]
async fn restore_without_checkpoint_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut flow = flow(catalog());
    assert!(!flow.restore().await.unwrap());
    assert!(!flow.restore_from(dir.path()).await.unwrap());
    assert!(flow.checkpoint().await.unwrap().is_none());
}
