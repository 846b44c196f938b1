/// Scene stage tests
///
/// End-to-end runs of the registry over on-disk scene layers.
/// Run with: cargo test --test scene_stage_tests
use serde_json::json;
use stagecache::{
    FsSceneEngine, RegistryConfig, StageError, StageRegistry, StageTemplate, TemplateKind, UpAxis,
};
use std::sync::Arc;
use tempfile::TempDir;

fn registry(config: RegistryConfig) -> Arc<StageRegistry<FsSceneEngine>> {
    StageRegistry::new(FsSceneEngine::new(), config).unwrap()
}

#[tokio::test]
async fn test_physics_template_with_z_up() {
    let dir = TempDir::new().unwrap();
    let registry = registry(RegistryConfig::new());
    let template = StageTemplate::new(TemplateKind::Physics).up_axis(UpAxis::Z);

    let handle = registry
        .open(dir.path().join("sim/physics.usd"), true, &template)
        .await
        .unwrap();

    let (up_axis, default_prim, gravity) = registry
        .with_read(handle, |stage| {
            (
                stage.up_axis(),
                stage.default_prim().map(str::to_string),
                stage
                    .attribute("/World/PhysicsScene", "gravityMagnitude")
                    .cloned(),
            )
        })
        .await
        .unwrap();

    assert_eq!(up_axis, UpAxis::Z);
    assert_eq!(default_prim.as_deref(), Some("/World"));
    assert_eq!(gravity, Some(json!(9.81)));
    assert!(dir.path().join("sim/physics.usd").exists());
}

#[tokio::test]
async fn test_edits_persist_across_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scene.usd");
    let registry = registry(RegistryConfig::new());

    let handle = registry.open(&path, true, &StageTemplate::default()).await.unwrap();
    registry
        .with_mutation(handle, |stage| {
            stage.define_prim("/root/Props/Crate", "Cube")?;
            stage.set_attribute("/root/Props/Crate", "size", json!(2.5))
        })
        .await
        .unwrap();
    registry.close(handle, true).await.unwrap();

    let reopened = registry.open(&path, false, &StageTemplate::default()).await.unwrap();
    assert_ne!(reopened, handle);

    let (size, parent_type) = registry
        .with_read(reopened, |stage| {
            (
                stage.attribute("/root/Props/Crate", "size").cloned(),
                stage.prim("/root/Props").map(|prim| prim.type_name.clone()),
            )
        })
        .await
        .unwrap();
    assert_eq!(size, Some(json!(2.5)));
    assert_eq!(parent_type.as_deref(), Some("Xform"));
}

#[tokio::test]
async fn test_close_without_save_discards_edits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scratch.usd");
    let registry = registry(RegistryConfig::new());

    let handle = registry.open(&path, true, &StageTemplate::default()).await.unwrap();
    registry
        .with_mutation(handle, |stage| stage.define_prim("/root/Temp", "Sphere").map(|_| ()))
        .await
        .unwrap();
    registry.close(handle, false).await.unwrap();

    let reopened = registry.open(&path, false, &StageTemplate::default()).await.unwrap();
    let has_temp = registry
        .with_read(reopened, |stage| stage.prim("/root/Temp").is_some())
        .await
        .unwrap();
    assert!(!has_temp);
}

#[tokio::test]
async fn test_open_missing_and_corrupt_files() {
    let dir = TempDir::new().unwrap();
    let registry = registry(RegistryConfig::new());

    let missing = registry
        .open(dir.path().join("missing.usd"), false, &StageTemplate::default())
        .await;
    assert!(matches!(missing, Err(StageError::NotFound(_))));

    let broken = dir.path().join("broken.usd");
    std::fs::write(&broken, b"not a layer").unwrap();
    let corrupt = registry.open(&broken, true, &StageTemplate::default()).await;
    assert!(matches!(corrupt, Err(StageError::Corrupt { .. })));

    // The corrupt file is left untouched and nothing became resident.
    assert_eq!(std::fs::read(&broken).unwrap(), b"not a layer");
    assert_eq!(registry.status().unwrap().resident_count, 0);
}

#[tokio::test]
async fn test_evicted_stage_is_saved_and_reloaded() {
    let dir = TempDir::new().unwrap();
    let registry = registry(RegistryConfig::new().max_resident_stages(1));
    let first = dir.path().join("first.usd");

    let handle = registry.open(&first, true, &StageTemplate::default()).await.unwrap();
    registry
        .with_mutation(handle, |stage| stage.define_prim("/root/Kept", "Xform").map(|_| ()))
        .await
        .unwrap();
    registry.release(handle).await.unwrap();

    // Opening a second stage evicts the unreferenced, dirty first one.
    registry
        .open(dir.path().join("second.usd"), true, &StageTemplate::default())
        .await
        .unwrap();
    assert!(registry.lookup(&first).unwrap().is_none());
    assert_eq!(registry.status().unwrap().evictions_to_date, 1);

    let reloaded = registry.open(&first, false, &StageTemplate::default()).await.unwrap();
    let kept = registry
        .with_read(reloaded, |stage| stage.prim("/root/Kept").is_some())
        .await
        .unwrap();
    assert!(kept);
}
