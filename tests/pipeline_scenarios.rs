//! End-to-end runs of build-and-publish pipelines against a mock registry

mod common;

use common::*;
use dockhand::core::ExecutionStatus;
use dockhand::execution::RunOutcome;
use dockhand::persistence::{create_summary, InMemoryPersistence, PersistenceBackend};
use std::sync::Arc;

const BACKEND_SHA_TAG: &str = "ghcr.io/acme/shop-backend:abc123";
const BACKEND_LATEST_TAG: &str = "ghcr.io/acme/shop-backend:latest";

#[tokio::test]
async fn test_backend_push_to_main_publishes_both_tags() {
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::new());

    let outcome = engine(runtime.clone())
        .run(&request(BACKEND, push_to("main"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Succeeded);
    assert_eq!(step_ids(ctx), vec!["checkout", "build", "publish"]);

    let artifact = ctx.artifact.as_ref().expect("build produced an artifact");
    assert_eq!(artifact.path, ws.join("target").join("shop-1.0.jar"));
    assert_eq!(artifact.tag, "abc123");

    assert_eq!(
        runtime.calls(),
        vec![
            "login ghcr.io octocat".to_string(),
            "build ARTIFACT=target/shop-1.0.jar PORT=8080".to_string(),
            format!("tag sha256:feedbeef {}", BACKEND_SHA_TAG),
            format!("tag sha256:feedbeef {}", BACKEND_LATEST_TAG),
            format!("push {}", BACKEND_SHA_TAG),
            format!("push {}", BACKEND_LATEST_TAG),
        ]
    );
    assert_eq!(ctx.images, vec![BACKEND_SHA_TAG, BACKEND_LATEST_TAG]);

    let publish = &ctx.results[2];
    assert_eq!(publish.outputs.get("image_id").map(String::as_str), Some("sha256:feedbeef"));
}

#[tokio::test]
async fn test_rejected_login_stops_before_build() {
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::rejecting_login());

    let outcome = engine(runtime.clone())
        .run(&request(BACKEND, push_to("main"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_step_failed_with(ctx, "publish", "AuthError");
    assert!(runtime.calls_to("build").is_empty());
    assert!(runtime.calls_to("push").is_empty());
    assert!(ctx.images.is_empty());
}

#[tokio::test]
async fn test_missing_token_is_an_auth_error_without_registry_calls() {
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::new());
    let request = request(BACKEND, push_to("main"), &ws)
        .with_credentials(dockhand::core::Credentials::new(None, Some(ACTOR.to_string())));

    let outcome = engine(runtime.clone()).run(&request).await;

    let ctx = finished(&outcome);
    assert_step_failed_with(ctx, "publish", "AuthError");
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_failed_build_aborts_the_run() {
    let yaml = BACKEND.replace(
        "mkdir -p target && echo jar > target/shop-1.0.jar",
        "echo compilation failed >&2; exit 1",
    );
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::new());

    let outcome = engine(runtime.clone())
        .run(&request(&yaml, push_to("main"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(step_ids(ctx), vec!["checkout", "build"]);
    assert_step_failed_with(ctx, "build", "BuildError");
    assert!(ctx.artifact.is_none());
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_ambiguous_artifact_is_a_build_error() {
    let yaml = BACKEND.replace(
        "mkdir -p target && echo jar > target/shop-1.0.jar",
        "mkdir -p target && touch target/a.jar target/b.jar",
    );
    let (_dir, ws) = workspace();

    let outcome = engine(Arc::new(MockContainerRuntime::new()))
        .run(&request(&yaml, push_to("main"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_step_failed_with(ctx, "build", "BuildError");
    let error = ctx.results[1].error.as_ref().unwrap();
    assert!(error.message().contains("2 artifacts"), "{}", error);
}

#[tokio::test]
async fn test_rejected_push_reports_what_was_pushed() {
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::failing_push(BACKEND_LATEST_TAG));

    let outcome = engine(runtime.clone())
        .run(&request(BACKEND, push_to("main"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_step_failed_with(ctx, "publish", "PublishError");
    let error = ctx.results[2].error.as_ref().unwrap();
    assert!(error.message().contains(BACKEND_SHA_TAG), "{}", error);
}

#[tokio::test]
async fn test_frontend_passes_step_outputs_to_later_steps() {
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::new());

    let outcome = engine(runtime.clone())
        .run(&request(FRONTEND, push_to("main"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Succeeded);
    assert!(ws.join("dist").join("index.html").exists());
    assert_eq!(
        ctx.env.get("steps.build.outputs.bundle").map(String::as_str),
        Some("dist")
    );
    assert_eq!(runtime.calls_to("build"), vec!["build BUNDLE=dist PORT=80"]);
    assert_eq!(
        ctx.images,
        vec!["ghcr.io/acme/shop-frontend:abc123", "ghcr.io/acme/shop-frontend:latest"]
    );
}

#[tokio::test]
async fn test_abort_skips_the_remaining_steps() {
    let yaml = r#"
name: chain
on:
  manual: true
steps:
  - id: first
    run: "true"
  - id: second
    run: "exit 3"
  - id: third
    run: "touch third-ran"
"#;
    let (_dir, ws) = workspace();

    let outcome = engine(Arc::new(MockContainerRuntime::new()))
        .run(&request(yaml, dockhand::core::Event::manual("main", "abc123"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(step_ids(ctx), vec!["first", "second"]);
    assert_step_failed_with(ctx, "second", "StepError");
    assert_eq!(ctx.results[1].exit_code, Some(3));
    assert!(!ws.join("third-ran").exists());
}

#[tokio::test]
async fn test_continue_policy_keeps_the_run_going() {
    let yaml = r#"
name: lint-then-build
on:
  manual: true
steps:
  - id: lint
    run: "exit 1"
    on_failure: continue
  - id: report
    run: 'echo "lint=${{ steps.lint.outcome }}" >> "$DOCKHAND_OUTPUT"'
"#;
    let (_dir, ws) = workspace();

    let outcome = engine(Arc::new(MockContainerRuntime::new()))
        .run(&request(yaml, dockhand::core::Event::manual("main", "abc123"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Succeeded);
    assert_eq!(ctx.failed_steps(), 1);
    assert_eq!(
        ctx.results[1].outputs.get("lint").map(String::as_str),
        Some("failure")
    );
}

#[tokio::test]
async fn test_step_outputs_are_passed_through_literally() {
    let yaml = r#"
name: literal-outputs
on:
  manual: true
steps:
  - id: a
    run: |
      o='$'
      echo "note=${o}{{ secrets.token }}" >> "$DOCKHAND_OUTPUT"
      echo "msg=use ${o}{{ matrix.os }} here" >> "$DOCKHAND_OUTPUT"
  - id: b
    run: "printf '%s' '${{ steps.a.outputs.note }}' > note.txt"
  - id: c
    run: "printf '%s' '${{ steps.a.outputs.msg }}' > msg.txt"
"#;
    let (_dir, ws) = workspace();

    let outcome = engine(Arc::new(MockContainerRuntime::new()))
        .run(&request(yaml, dockhand::core::Event::manual("main", "abc123"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Succeeded);
    assert_eq!(step_ids(ctx), vec!["a", "b", "c"]);

    let note = std::fs::read_to_string(ws.join("note.txt")).unwrap();
    assert_eq!(note, "${{ secrets.token }}");
    assert!(!note.contains(TOKEN));
    let msg = std::fs::read_to_string(ws.join("msg.txt")).unwrap();
    assert_eq!(msg, "use ${{ matrix.os }} here");
}

#[tokio::test]
async fn test_rerun_of_same_commit_is_idempotent() {
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::new());
    let engine = engine(runtime.clone());
    let request = request(BACKEND, push_to("main"), &ws);
    let store = InMemoryPersistence::new();

    let first = engine.run(&request).await;
    let second = engine.run(&request).await;

    let (first, second) = (finished(&first), finished(&second));
    assert_eq!(first.status, ExecutionStatus::Succeeded);
    assert_eq!(second.status, ExecutionStatus::Succeeded);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.images, second.images);
    assert_eq!(first.artifact, second.artifact);

    store.save_execution(&create_summary(first)).await.unwrap();
    store.save_execution(&create_summary(second)).await.unwrap();
    assert_eq!(store.list_executions("backend").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_pipelines_run_concurrently_and_independently() {
    let (_backend_dir, backend_ws) = workspace();
    let (_frontend_dir, frontend_ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::failing_push(BACKEND_SHA_TAG));

    let outcomes = engine(runtime.clone())
        .run_all(&[
            request(BACKEND, push_to("main"), &backend_ws),
            request(FRONTEND, push_to("main"), &frontend_ws),
        ])
        .await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].pipeline_name(), "backend");
    assert!(!outcomes[0].is_success());
    assert_eq!(outcomes[1].pipeline_name(), "frontend");
    assert!(outcomes[1].is_success());

    let RunOutcome::Finished(frontend) = &outcomes[1] else {
        panic!("frontend should have run");
    };
    assert!(frontend.images.iter().all(|i| i.contains("shop-frontend")));
}

#[tokio::test]
async fn test_token_never_appears_in_step_output() {
    let yaml = r#"
name: leaky
on:
  manual: true
steps:
  - id: echo
    run: 'echo "token is ${{ secrets.token }}"'
"#;
    let (_dir, ws) = workspace();

    let outcome = engine(Arc::new(MockContainerRuntime::new()))
        .run(&request(yaml, dockhand::core::Event::manual("main", "abc123"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Succeeded);
    assert!(!ctx.results[0].output.contains(TOKEN));
    assert!(ctx.results[0].output.contains("token is"));
}

#[test]
fn test_shipped_pipelines_are_valid() {
    let registry = dockhand::actions::ActionRegistry::builtin(Arc::new(MockContainerRuntime::new()));

    for name in ["backend", "frontend"] {
        let path = format!("{}/pipelines/{}.yml", env!("CARGO_MANIFEST_DIR"), name);
        let config = dockhand::core::PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.name, name);
        assert!(config.trigger.manual);
        for uses in config.action_refs() {
            assert!(registry.contains(uses), "{} uses unknown action {}", name, uses);
        }
    }
}

#[tokio::test]
async fn test_split_publish_steps_share_one_image_id() {
    let yaml = r#"
name: split
on:
  manual: true
settings:
  image: "ghcr.io/acme/shop-split"
steps:
  - id: tags
    uses: image-metadata
  - id: login
    uses: registry-login
  - id: image
    uses: image-build
  - id: push
    uses: image-push
    with:
      image_id: "${{ steps.image.outputs.image_id }}"
"#;
    let (_dir, ws) = workspace();
    let runtime = Arc::new(MockContainerRuntime::new());

    let outcome = engine(runtime.clone())
        .run(&request(yaml, dockhand::core::Event::manual("main", "abc123"), &ws))
        .await;

    let ctx = finished(&outcome);
    assert_eq!(ctx.status, ExecutionStatus::Succeeded);
    assert_eq!(
        ctx.env.get("steps.tags.outputs.sha_tag").map(String::as_str),
        Some("ghcr.io/acme/shop-split:abc123")
    );
    assert_eq!(
        runtime.calls_to("tag"),
        vec![
            "tag sha256:feedbeef ghcr.io/acme/shop-split:abc123",
            "tag sha256:feedbeef ghcr.io/acme/shop-split:latest",
        ]
    );
    assert_eq!(runtime.calls()[0], "login ghcr.io octocat");
}
