mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeRegistry, FakeRuntime, target};
use csi_image::executor::{MountExecutor, MountOptions, PullKey};
use csi_image::snapshot::SnapshotMounter;
use csi_image::status::{Status, StatusRecorder};
use csi_image::volume::{CTX_IMAGE, CTX_POD_UID, PublishRequest};
use csi_image::NodeService;
use csi_image_common::{CsiImageError, ImageId, NodeConfig, SnapshotKey};
use csi_image_remote::{ImageReference, StaticKeyring};
use tokio_util::sync::CancellationToken;

const ALPINE: &str = "docker.io/library/alpine:3.19";

fn publish_request(volume_id: &str, pod: &str) -> PublishRequest {
    PublishRequest {
        volume_id: volume_id.to_string(),
        target_path: PathBuf::from(format!("/var/lib/kubelet/pods/{pod}/volumes/{volume_id}/mount")),
        volume_context: HashMap::from([
            (CTX_IMAGE.to_string(), "alpine:3.19".to_string()),
            (CTX_POD_UID.to_string(), pod.to_string()),
        ]),
        read_only: true,
        ..Default::default()
    }
}

async fn start(config: &NodeConfig) -> (Arc<FakeRuntime>, Arc<FakeRegistry>, NodeService, CancellationToken) {
    start_with_pull_delay(config, Duration::from_secs(2)).await
}

async fn start_with_pull_delay(
    config: &NodeConfig,
    delay: Duration,
) -> (Arc<FakeRuntime>, Arc<FakeRegistry>, NodeService, CancellationToken) {
    let runtime = FakeRuntime::new();
    let registry = FakeRegistry::new(runtime.clone(), delay);
    let shutdown = CancellationToken::new();
    let node = NodeService::start(
        runtime.clone(),
        registry.clone(),
        Arc::new(StaticKeyring::default()),
        config,
        &shutdown,
    )
    .await
    .unwrap();
    (runtime, registry, node, shutdown)
}

#[test_log::test(tokio::test(start_paused = true))]
async fn publish_and_unpublish_share_one_snapshot() {
    let config = NodeConfig::default().with_async_pull(Duration::from_secs(60));
    let (runtime, registry, node, _shutdown) = start(&config).await;

    let first = publish_request("vol-a", "pod-a");
    let second = publish_request("vol-b", "pod-b");
    let (a, b) = futures::join!(node.publish(&first, &[]), node.publish(&second, &[]));
    a.unwrap();
    b.unwrap();

    assert_eq!(registry.pull_count(), 1);
    assert_eq!(runtime.snapshot_keys().len(), 1);
    assert_eq!(runtime.mounted().len(), 2);

    node.unpublish("vol-a", &first.target_path).await.unwrap();
    assert_eq!(runtime.snapshot_keys().len(), 1);
    node.unpublish("vol-b", &second.target_path).await.unwrap();
    assert!(runtime.snapshot_keys().is_empty());
    assert!(runtime.leases().is_empty());

    node.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn republishing_a_mounted_target_is_a_no_op() {
    let (runtime, registry, node, _shutdown) = start(&NodeConfig::default()).await;
    let request = publish_request("vol-a", "pod-a");

    node.publish(&request, &[]).await.unwrap();
    node.publish(&request, &[]).await.unwrap();

    assert_eq!(registry.pull_count(), 1);
    assert_eq!(runtime.mount_calls.load(Ordering::SeqCst), 1);
    let target = target(request.target_path.to_str().unwrap());
    assert_eq!(node.mounts().status(&target), Status::Processed);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn invalid_requests_are_rejected_before_any_work() {
    let (runtime, registry, node, _shutdown) = start(&NodeConfig::default()).await;

    let mut request = publish_request("vol-a", "pod-a");
    request.target_path = PathBuf::from("relative/mount");
    let err = node.publish(&request, &[]).await.unwrap_err();
    assert_eq!(err.code(), "InvalidArgument");

    let err = node.unpublish("", Path::new("/mnt/x")).await.unwrap_err();
    assert!(matches!(err, CsiImageError::InvalidArgument { .. }));

    assert_eq!(registry.pull_count(), 0);
    assert!(runtime.leases().is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn failed_mount_is_reported_and_retried() {
    let (runtime, _registry, node, _shutdown) = start(&NodeConfig::default()).await;
    let request = publish_request("vol-a", "pod-a");
    let target = target(request.target_path.to_str().unwrap());

    runtime.fail_mounts(true);
    assert!(node.publish(&request, &[]).await.is_err());
    assert_eq!(node.mounts().status(&target), Status::Errored);
    assert!(node.mounts().last_error(&target).unwrap().contains("bind mount refused"));
    assert_eq!(node.mounts().locked_targets(), 0);

    runtime.fail_mounts(false);
    node.publish(&request, &[]).await.unwrap();
    assert_eq!(node.mounts().last_error(&target), None);
    assert_eq!(runtime.mounted(), vec![target]);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn mount_locks_do_not_outlive_their_targets() {
    let config = NodeConfig::default().with_async_mount();
    let (runtime, _registry, node, _shutdown) = start(&config).await;
    let (first, second) = (publish_request("vol-a", "pod-a"), publish_request("vol-b", "pod-b"));

    node.publish(&first, &[]).await.unwrap();
    assert_eq!(node.mounts().locked_targets(), 1);
    node.unpublish("vol-a", &first.target_path).await.unwrap();
    assert_eq!(node.mounts().locked_targets(), 0);

    // A target whose mount failed and is never unpublished.
    runtime.fail_mounts(true);
    assert!(node.publish(&second, &[]).await.is_err());
    let target = target(second.target_path.to_str().unwrap());
    assert_eq!(node.mounts().status(&target), Status::Errored);
    assert_eq!(node.mounts().locked_targets(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn unpublish_forgets_the_pull_of_its_last_target() {
    let config = NodeConfig::default().with_async_pull(Duration::from_secs(60));
    let (_runtime, registry, node, _shutdown) = start(&config).await;
    // Same pod, so both volumes depend on one pull.
    let (first, second) = (publish_request("vol-a", "pod-a"), publish_request("vol-b", "pod-a"));

    node.publish(&first, &[]).await.unwrap();
    node.publish(&second, &[]).await.unwrap();
    assert_eq!(registry.pull_count(), 1);
    assert_eq!(node.pulls().status().len(), 1);

    node.unpublish("vol-a", &first.target_path).await.unwrap();
    assert_eq!(node.pulls().status().len(), 1);
    node.unpublish("vol-b", &second.target_path).await.unwrap();
    assert!(node.pulls().status().is_empty());

    node.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn unpublish_forgets_a_failed_pull() {
    let (_runtime, registry, node, _shutdown) = start(&NodeConfig::default()).await;
    let request = publish_request("vol-a", "pod-a");

    registry.fail_pulls(true);
    assert!(node.publish(&request, &[]).await.is_err());
    assert_eq!(node.pulls().status().len(), 1);

    node.unpublish("vol-a", &request.target_path).await.unwrap();
    assert!(node.pulls().status().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn async_pull_publish_never_races_its_own_pull() {
    let config = NodeConfig::default().with_async_pull(Duration::from_secs(60));
    for i in 0..100 {
        let (runtime, _registry, node, _shutdown) =
            start_with_pull_delay(&config, Duration::from_millis(1)).await;
        let request = publish_request(&format!("vol-{i}"), "pod-a");

        node.publish(&request, &[])
            .await
            .unwrap_or_else(|e| panic!("publish {i} failed: {e}"));
        assert_eq!(runtime.mounted().len(), 1);
        node.shutdown().await;
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn async_mounts_complete_in_the_background() {
    let config = NodeConfig::default().with_async_mount();
    let (runtime, _registry, node, _shutdown) = start(&config).await;
    let request = publish_request("vol-a", "pod-a");

    node.publish(&request, &[]).await.unwrap();

    let target = target(request.target_path.to_str().unwrap());
    assert_eq!(node.mounts().status(&target), Status::Processed);
    assert_eq!(runtime.mounted(), vec![target.clone()]);

    node.unpublish("vol-a", &request.target_path).await.unwrap();
    assert_eq!(node.mounts().status(&target), Status::NotFound);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn mount_requires_a_completed_pull() {
    let runtime = FakeRuntime::new();
    runtime.add_image(ALPINE, "sha256:aa11");
    let mounter = Arc::new(SnapshotMounter::new(runtime.clone(), &NodeConfig::default()).await.unwrap());
    let pull_status = Arc::new(StatusRecorder::new());
    let executor = MountExecutor::new(mounter, pull_status.clone(), false);

    let image = ImageReference::parse(ALPINE).unwrap();
    let opts = MountOptions {
        volume_id: "vol-a".to_string(),
        target: target("/pods/a/mount"),
        pull: PullKey::new(&image, Some("pod-a")),
        read_only: true,
    };

    let err = executor.start_mounting(&opts).await.unwrap_err();
    assert!(matches!(err, CsiImageError::FailedPrecondition { .. }));
    assert_eq!(runtime.mount_calls.load(Ordering::SeqCst), 0);

    pull_status.update(&opts.pull, Status::StillProcessing);
    assert!(executor.start_mounting(&opts).await.is_err());

    pull_status.update(&opts.pull, Status::Processed);
    executor.start_mounting(&opts).await.unwrap();
    executor.start_mounting(&opts).await.unwrap();
    executor
        .wait_for_mount(&opts.target, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(runtime.mount_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        runtime.snapshot_keys(),
        vec![SnapshotKey::read_only(&ImageId::new("sha256:aa11"))]
    );
}
