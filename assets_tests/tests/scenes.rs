//! Scene loading, activation and teardown through the host.

use std::sync::Arc;

use assets_shared::prelude::*;
use assets_tests::*;

const FOREST: &str = "levels/forest.scene";
const CAVE: &str = "levels/cave.scene";

async fn scene_loader() -> anyhow::Result<(AssetLoader, Arc<RecordingHost>)> {
    let manifest = sample_manifest();
    let host = RecordingHost::new();
    let loader = loader_with(manifest.clone(), MemoryTransport::new(&manifest), host.clone()).await?;
    Ok((loader, host))
}

fn opens(host: &RecordingHost) -> usize {
    host.events().iter().filter(|e| e.starts_with("open ")).count()
}

#[tokio::test]
async fn scene_opens_active_and_is_cached() -> anyhow::Result<()> {
    let (loader, host) = scene_loader().await?;
    let cancel = CancellationToken::new();

    let scene = loader.load_scene(FOREST, LoadSceneMode::Single, true, &cancel).await;
    assert!(scene.is_valid());
    assert!(scene.is_done());
    assert!(scene.is_activated());
    assert_eq!(scene.progress(), 1.0);
    assert_eq!(scene.ref_count(), 1);
    assert_eq!(bundle_refs(&loader, "levels.bundle"), 1);
    assert_eq!(bundle_refs(&loader, "common.bundle"), 1);

    let again = loader.load_scene(FOREST, LoadSceneMode::Single, true, &cancel).await;
    assert!(Arc::ptr_eq(&scene, &again));
    assert_eq!(scene.ref_count(), 2);
    assert_eq!(opens(&host), 1);
    assert_eq!(host.open_scenes(), 1);
    Ok(())
}

#[tokio::test]
async fn paused_scene_activates_on_request() -> anyhow::Result<()> {
    let (loader, host) = scene_loader().await?;
    let cancel = CancellationToken::new();

    let scene = loader
        .load_scene(FOREST, LoadSceneMode::Additive, false, &cancel)
        .await;
    assert!(scene.is_valid());
    assert!(!scene.is_activated());

    loader.activate_scene(&scene).await?;
    assert!(scene.is_activated());
    let id = scene.scene_id().expect("open scene has an id");
    assert!(host.events().contains(&format!("activate #{}", id.0)));

    // Already active: no second host call.
    loader.activate_scene(&scene).await?;
    let activations = host.events().iter().filter(|e| e.starts_with("activate")).count();
    assert_eq!(activations, 1);
    Ok(())
}

#[tokio::test]
async fn unknown_scene_reports_error_on_handle() -> anyhow::Result<()> {
    let (loader, host) = scene_loader().await?;
    let cancel = CancellationToken::new();

    let scene = loader
        .load_scene("levels/nowhere.scene", LoadSceneMode::Single, true, &cancel)
        .await;
    assert!(scene.is_done());
    assert!(scene.has_error());
    assert!(!scene.is_valid());
    assert!(loader.activate_scene(&scene).await.is_err());
    assert!(loader.handle("levels/nowhere.scene").is_none());
    assert!(host.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn host_failure_gives_back_the_bundle_hold() -> anyhow::Result<()> {
    // The loader's manifest lists a scene the served bundle does not carry.
    let served = sample_manifest();
    let mut bundles = served.bundles().to_vec();
    for bundle in &mut bundles {
        if bundle.name == "levels.bundle" {
            bundle.assets.push("levels/ghost.scene".to_string());
        }
    }
    let listed = BundleManifest::new(bundles);
    let host = RecordingHost::new();
    let loader = loader_with(listed, MemoryTransport::new(&served), host.clone()).await?;

    let scene = loader
        .load_scene("levels/ghost.scene", LoadSceneMode::Single, true, &CancellationToken::new())
        .await;
    let err = scene.error().expect("host refused the scene");
    assert!(format!("{err:#}").contains("not found"));
    assert!(loader.handle("levels/ghost.scene").is_none());
    assert_eq!(bundle_refs(&loader, "levels.bundle"), 0);
    assert_eq!(bundle_refs(&loader, "common.bundle"), 0);
    assert_eq!(host.open_scenes(), 0);
    Ok(())
}

#[tokio::test]
async fn sweep_closes_released_scenes() -> anyhow::Result<()> {
    let (loader, host) = scene_loader().await?;
    let cancel = CancellationToken::new();

    let scene = loader.load_scene(FOREST, LoadSceneMode::Single, true, &cancel).await;
    let id = scene.scene_id().expect("open scene has an id");

    // Still referenced: the sweep leaves it open.
    loader.unload_unused().await;
    assert_eq!(host.open_scenes(), 1);
    assert!(scene.is_valid());

    loader.release(FOREST);
    let report = loader.unload_unused().await;
    assert_eq!(report, SweepReport { assets: 1, bundles: 2 });
    assert!(!scene.is_valid());
    assert_eq!(host.open_scenes(), 0);
    assert!(host.events().contains(&format!("close #{}", id.0)));
    assert_eq!(host.reclaim_count(), 2);
    Ok(())
}

#[tokio::test]
async fn scene_and_asset_kinds_do_not_mix() -> anyhow::Result<()> {
    let (loader, _) = scene_loader().await?;
    let cancel = CancellationToken::new();

    let scene = loader.load_scene(FOREST, LoadSceneMode::Single, true, &cancel).await;
    assert!(scene.is_valid());
    assert!(loader.load_asset(FOREST, &cancel).await.is_none());
    assert_eq!(scene.ref_count(), 1);
    assert_eq!(loader.handle(FOREST).map(|h| h.kind()), Some(HandleKind::Scene));
    Ok(())
}

#[tokio::test]
async fn single_mode_invalidates_replaced_scenes() -> anyhow::Result<()> {
    let (loader, host) = scene_loader().await?;
    let cancel = CancellationToken::new();

    let forest = loader.load_scene(FOREST, LoadSceneMode::Single, true, &cancel).await;
    let forest_id = forest.scene_id().expect("open scene has an id");
    let cave = loader.load_scene(CAVE, LoadSceneMode::Single, true, &cancel).await;
    assert!(cave.is_valid());
    assert!(!forest.is_valid());
    assert_eq!(host.open_scenes(), 1);
    assert_eq!(bundle_refs(&loader, "levels.bundle"), 1);

    // The host already closed the forest: the sweep drops the handle only.
    let report = loader.unload_unused().await;
    assert_eq!(report, SweepReport { assets: 1, bundles: 0 });
    assert!(!host.events().contains(&format!("close #{}", forest_id.0)));
    assert!(cave.is_valid());

    let again = loader.load_scene(FOREST, LoadSceneMode::Additive, true, &cancel).await;
    assert!(again.is_valid());
    assert!(!Arc::ptr_eq(&again, &forest));
    assert_eq!(opens(&host), 3);
    assert_eq!(host.open_scenes(), 2);
    Ok(())
}
