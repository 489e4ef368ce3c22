#![forbid(unsafe_code)]

mod common;

use common::*;
use keel_core::{NodeStatus, RemoteEvent};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn own_writes_are_not_drift() {
    let fake = FakeCluster::new();
    let rec = reconciler(&fake, opts());
    let a = cm("demo", "a");
    rec.submit([node(&a, json!({"k": "v"}))]).unwrap();
    rec.converge(&CancellationToken::new()).await.unwrap();

    let echo = RemoteEvent { id: a.clone(), object: fake.object(&a) };
    assert!(!rec.observe(&echo));
    assert_eq!(rec.state(&a).status, NodeStatus::Applied);
}

#[tokio::test(start_paused = true)]
async fn external_edit_is_reverted_on_next_run() {
    let fake = FakeCluster::new();
    let rec = reconciler(&fake, opts());
    let (a, b) = (cm("demo", "a"), cm("demo", "b"));
    rec.submit([node(&a, json!({"k": "a"})), node(&b, json!({"k": "b"})).depends_on(a.clone())]).unwrap();
    rec.converge(&CancellationToken::new()).await.unwrap();
    fake.clear_log();

    let ev = fake.tamper(&b, json!({"data": {"k": "hacked"}}));
    assert!(rec.observe(&ev));
    assert_eq!(rec.state(&b).status, NodeStatus::Unknown);

    let report = rec.converge(&CancellationToken::new()).await.unwrap();
    assert!(report.is_converged());
    assert_eq!(fake.count(Op::Get, Some(&b)), 1);
    assert_eq!(fake.count(Op::Update, Some(&b)), 1);
    assert_eq!(fake.mutations(), 1, "untouched nodes stay quiet");
    assert_eq!(fake.object(&b).unwrap()["data"]["k"], "b");
}

#[tokio::test(start_paused = true)]
async fn external_delete_is_recreated() {
    let fake = FakeCluster::new();
    let rec = reconciler(&fake, opts());
    let a = cm("demo", "a");
    rec.submit([node(&a, json!({"k": "v"}))]).unwrap();
    rec.converge(&CancellationToken::new()).await.unwrap();
    fake.clear_log();

    assert!(rec.observe(&fake.remove(&a)));
    rec.converge(&CancellationToken::new()).await.unwrap();
    assert_eq!(fake.count(Op::Create, Some(&a)), 1);
    assert!(fake.exists(&a));
}

#[tokio::test(start_paused = true)]
async fn fields_outside_desired_spec_are_left_alone() {
    let fake = FakeCluster::new();
    let rec = reconciler(&fake, opts());
    let a = cm("demo", "a");
    rec.submit([node(&a, json!({"k": "v"}))]).unwrap();
    rec.converge(&CancellationToken::new()).await.unwrap();
    fake.clear_log();

    let ev = fake.tamper(&a, json!({"data": {"injected": "by-webhook"}}));
    assert!(rec.observe(&ev), "content changed, so the shadow is stale");
    rec.converge(&CancellationToken::new()).await.unwrap();
    assert_eq!(fake.count(Op::Get, Some(&a)), 1);
    assert_eq!(fake.mutations(), 0);
    assert_eq!(fake.object(&a).unwrap()["data"]["injected"], "by-webhook");
}

#[tokio::test(start_paused = true)]
async fn invalidate_forces_a_resync_only() {
    let fake = FakeCluster::new();
    let rec = reconciler(&fake, opts());
    let a = cm("demo", "a");
    rec.submit([node(&a, json!({"k": "v"}))]).unwrap();
    rec.converge(&CancellationToken::new()).await.unwrap();
    fake.clear_log();

    assert!(rec.invalidate(&a));
    assert!(!rec.invalidate(&cm("demo", "unmanaged")));
    rec.converge(&CancellationToken::new()).await.unwrap();
    assert_eq!(fake.count(Op::Get, Some(&a)), 1);
    assert_eq!(fake.mutations(), 0);
}

#[tokio::test]
async fn events_for_unmanaged_objects_are_ignored() {
    let fake = FakeCluster::new();
    let rec = reconciler(&fake, opts());
    let ev = RemoteEvent { id: cm("demo", "stranger"), object: Some(json!({"data": {}})) };
    assert!(!rec.observe(&ev));
}
