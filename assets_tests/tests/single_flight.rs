//! Concurrent requests sharing one bundle load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assets_shared::prelude::*;
use assets_tests::*;

async fn gated_loader() -> anyhow::Result<(AssetLoader, Arc<MemoryTransport>)> {
    let manifest = sample_manifest();
    let transport = MemoryTransport::gated(&manifest);
    let loader = loader_with(manifest, transport.clone(), Arc::new(HeadlessHost::new())).await?;
    Ok((loader, transport))
}

fn spawn_load(
    loader: &AssetLoader,
    path: &'static str,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<Option<Arc<AssetHandle>>> {
    let loader = loader.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { loader.load_asset(path, &cancel).await })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_loads_share_one_fetch() -> anyhow::Result<()> {
    let (loader, transport) = gated_loader().await?;
    let cancel = CancellationToken::new();

    const CALLERS: usize = 8;
    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| spawn_load(&loader, "ui/a.png", &cancel))
        .collect();
    wait_until("all callers waiting", || {
        loader.snapshot().waiters("ui.bundle") == CALLERS
    })
    .await?;
    transport.open_gate();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await?.expect("load"));
    }
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(handles[0].ref_count(), CALLERS);
    assert_eq!(transport.fetches("ui.bundle"), 1);
    assert_eq!(transport.fetches("common.bundle"), 1);
    assert_eq!(bundle_refs(&loader, "ui.bundle"), 1);
    assert!(!loader.is_loading("ui.bundle"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_dependency_scenario() -> anyhow::Result<()> {
    let (loader, transport) = gated_loader().await?;
    let cancel = CancellationToken::new();

    let first = spawn_load(&loader, "ui/a.png", &cancel);
    let second = spawn_load(&loader, "ui/a.png", &cancel);
    wait_until("both callers waiting", || {
        loader.snapshot().waiters("ui.bundle") == 2
    })
    .await?;
    transport.open_gate();
    let a = first.await?.expect("first load");
    second.await?.expect("second load");

    assert_eq!(transport.fetches("ui.bundle"), 1);
    assert_eq!(transport.fetches("common.bundle"), 1);
    assert_eq!(a.ref_count(), 2);

    loader.release("ui/a.png");
    assert_eq!(a.ref_count(), 1);
    assert_eq!(bundle_refs(&loader, "ui.bundle"), 1);
    assert_eq!(bundle_refs(&loader, "common.bundle"), 1);

    loader.release("ui/a.png");
    let ui = loader.bundle("ui.bundle").expect("still cached");
    let common = loader.bundle("common.bundle").expect("still cached");
    assert_eq!(a.ref_count(), 0);
    assert_eq!(ui.ref_count(), 0);
    assert_eq!(common.ref_count(), 0);
    assert!(a.is_valid() && ui.is_valid() && common.is_valid());

    loader.unload_unused().await;
    assert!(!a.is_valid());
    assert!(ui.is_disposed() && common.is_disposed());
    assert!(loader.handle("ui/a.png").is_none());
    assert!(loader.bundle("ui.bundle").is_none());
    assert!(loader.bundle("common.bundle").is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_waiter_leaves_others_unaffected() -> anyhow::Result<()> {
    let (loader, transport) = gated_loader().await?;
    let keep = CancellationToken::new();
    let abandon = CancellationToken::new();

    let survivor = spawn_load(&loader, "hud/c.png", &keep);
    let quitter = spawn_load(&loader, "hud/c.png", &abandon);
    wait_until("both callers waiting", || {
        loader.snapshot().waiters("hud.bundle") == 2
    })
    .await?;

    abandon.cancel();
    assert!(quitter.await?.is_none());
    assert_eq!(loader.snapshot().waiters("hud.bundle"), 1);
    assert!(loader.is_loading("hud.bundle"));

    transport.open_gate();
    let handle = survivor.await?.expect("survivor load");
    assert_eq!(handle.ref_count(), 1);
    assert!(handle.is_valid());
    assert_eq!(transport.fetches("hud.bundle"), 1);
    assert_eq!(bundle_refs(&loader, "hud.bundle"), 1);
    assert_eq!(bundle_refs(&loader, "common.bundle"), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_every_waiter_still_caches_the_bundle() -> anyhow::Result<()> {
    let (loader, transport) = gated_loader().await?;
    let cancel = CancellationToken::new();

    let task = spawn_load(&loader, "ui/b.png", &cancel);
    wait_until("caller waiting", || {
        loader.snapshot().waiters("ui.bundle") == 1
    })
    .await?;
    cancel.cancel();
    assert!(task.await?.is_none());

    transport.open_gate();
    wait_until("load published", || !loader.is_loading("ui.bundle")).await?;
    assert_eq!(bundle_refs(&loader, "ui.bundle"), 0);
    assert_eq!(bundle_refs(&loader, "common.bundle"), 0);
    assert!(loader.handle("ui/b.png").is_none());

    let report = loader.unload_unused().await;
    assert_eq!(report, SweepReport { assets: 0, bundles: 2 });
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_load_does_not_poison_the_registry() -> anyhow::Result<()> {
    let (loader, transport) = sample_loader().await?;
    let cancel = CancellationToken::new();

    transport.fail("ui.bundle");
    let results = loader.load_assets(&["ui/a.png", "ui/b.png"], &cancel).await;
    assert!(results.iter().all(Option::is_none));
    assert!(!loader.is_loading("ui.bundle"));
    assert!(loader.bundle("ui.bundle").is_none());
    assert_eq!(
        bundle_refs(&loader, "common.bundle"),
        0,
        "dependency ref given back on failure"
    );

    transport.heal("ui.bundle");
    let handle = loader.load_asset("ui/a.png", &cancel).await.expect("retry");
    assert_eq!(handle.ref_count(), 1);
    assert_eq!(bundle_refs(&loader, "ui.bundle"), 1);
    assert_eq!(bundle_refs(&loader, "common.bundle"), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_dependency_fails_the_dependent() -> anyhow::Result<()> {
    let (loader, transport) = sample_loader().await?;
    let cancel = CancellationToken::new();

    transport.fail("common.bundle");
    assert!(loader.load_asset("hud/c.png", &cancel).await.is_none());
    assert_eq!(transport.fetches("hud.bundle"), 0);
    assert!(loader.bundle("hud.bundle").is_none());

    transport.heal("common.bundle");
    assert!(loader.load_asset("hud/c.png", &cancel).await.is_some());
    assert_eq!(transport.fetches("common.bundle"), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn promotion_survives_concurrent_dependency_release() -> anyhow::Result<()> {
    let (loader, transport) = sample_loader().await?;
    let cancel = CancellationToken::new();
    loader.load_asset("ui/a.png", &cancel).await.expect("ui");
    let common = loader.bundle("common.bundle").expect("loaded as dependency");
    assert!(common.is_dependency_only());

    // Keeps dropping ui.bundle (and its hold on common.bundle) and taking it back.
    let stop = CancellationToken::new();
    let rounds = Arc::new(AtomicUsize::new(0));
    let churn = {
        let loader = loader.clone();
        let stop = stop.clone();
        let rounds = Arc::clone(&rounds);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            while !stop.is_cancelled() {
                loader.release("ui/a.png");
                loader.load_asset("ui/a.png", &cancel).await;
                rounds.fetch_add(1, Ordering::Relaxed);
                tokio::task::yield_now().await;
            }
        })
    };
    wait_until("churn running", || rounds.load(Ordering::Relaxed) > 0).await?;

    for _ in 0..50 {
        let font = loader.load_asset("common/font.ttf", &cancel).await.expect("font");
        for _ in 0..10 {
            assert!(common.ref_count() >= 1, "direct holder lost its reference");
            assert!(!common.is_dependency_only());
            assert!(font.is_valid());
            tokio::task::yield_now().await;
        }
        loader.release("common/font.ttf");
    }

    let font = loader.load_asset("common/font.ttf", &cancel).await.expect("font");
    stop.cancel();
    churn.await?;

    assert!(font.is_valid());
    assert!(!common.is_dependency_only());
    assert_eq!(common.ref_count(), 2, "direct hold plus ui.bundle");
    assert_eq!(transport.fetches("common.bundle"), 1);
    loader.release("ui/a.png");
    assert_eq!(common.ref_count(), 1);
    Ok(())
}
