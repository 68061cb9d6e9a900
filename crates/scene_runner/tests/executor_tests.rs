//! Integration tests for the execution layer.
//!
//! These tests use the mock and dry-run executors so no Blender
//! installation is required.

use std::sync::Arc;
use std::time::Duration;

use scene_runner::{
    BlenderExecutor, DryRunExecutor, ExecutorConfig, MockExecutor, MockFailure, MockResponse,
    RenderOptions, RenderTarget, RunnerError, SceneExecutor, SceneHandle, ScriptArtifact,
};

fn script(scene: &SceneHandle, label: &str) -> ScriptArtifact {
    ScriptArtifact::new(scene.clone(), label, "import bpy\nbpy.ops.mesh.primitive_cube_add()")
}

/// A missing Blender binary is reported before any work starts.
#[test]
fn test_blender_executor_requires_binary() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExecutorConfig::new()
        .blender_path(dir.path().join("no-blender-here"))
        .work_dir(dir.path());

    match BlenderExecutor::new(config) {
        Err(RunnerError::DependencyMissing(msg)) => assert!(msg.contains("no-blender-here")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("executor created without a binary"),
    }
}

/// Dry-run writes each script in order.
#[tokio::test]
async fn test_dry_run_writes_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let executor = DryRunExecutor::new().with_output_dir(dir.path());
    let scene = SceneHandle::in_dir("s1", dir.path());

    for label in ["structure", "surface"] {
        let report = executor
            .execute(&script(&scene, label), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.stdout.starts_with("[DRY-RUN]"));
    }

    assert!(dir.path().join("s1-01-structure.py").is_file());
    assert!(dir.path().join("s1-02-surface.py").is_file());
    assert_eq!(executor.scripts_for("s1").len(), 2);
    assert!(executor.scripts_for("other").is_empty());
}

/// Dry-run render succeeds without producing a file.
#[tokio::test]
async fn test_dry_run_render() {
    let dir = tempfile::tempdir().unwrap();
    let executor = DryRunExecutor::new();
    let scene = SceneHandle::in_dir("s1", dir.path());
    let target = RenderTarget::still(dir.path().join("s1.png"));

    let report = executor
        .render(&scene, &target, &RenderOptions::default())
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.output_path, target.output_path);
    assert!(!target.output_path.exists());
}

/// Render failures surface as errors or unsuccessful reports.
#[tokio::test]
async fn test_mock_render_failures() {
    let executor = MockExecutor::new()
        .add_render_response(MockResponse::error(MockFailure::RenderFailed("no camera".into())))
        .add_render_response(MockResponse::failure("out of memory"));
    let scene = SceneHandle::in_dir("s1", std::path::Path::new("/tmp"));
    let target = RenderTarget::still("/tmp/s1.png");

    let first = executor.render(&scene, &target, &RenderOptions::default()).await;
    assert!(matches!(first, Err(RunnerError::RenderFailed(_))));

    let second = executor
        .render(&scene, &target, &RenderOptions::default())
        .await
        .unwrap();
    assert!(!second.success);
    assert_eq!(second.log, "out of memory");

    assert_eq!(executor.get_method_calls("render").len(), 2);
}

/// Different scenes are not serialized against each other.
#[tokio::test]
async fn test_mock_executor_parallel_scenes() {
    let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(50)));
    let dir = std::path::Path::new("/tmp");

    let mut handles = Vec::new();
    for id in ["a", "b", "c"] {
        let executor = executor.clone();
        let artifact = script(&SceneHandle::in_dir(id, dir), "structure");
        handles.push(tokio::spawn(async move {
            executor.execute(&artifact, Duration::from_secs(1)).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert!(executor.peak_concurrency() > 1);
    assert_eq!(executor.call_count(), 3);
}

/// Transient classification covers timeouts only.
#[test]
fn test_runner_error_transience() {
    assert!(RunnerError::Timeout(10).is_transient());
    assert!(!RunnerError::DependencyMissing("blender".into()).is_transient());
    assert!(!RunnerError::ExecutionFailed("boom".into()).is_transient());
}
