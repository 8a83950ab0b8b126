#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kestrel_api::{Storage, WatchHandle};
use kestrel_backends::{MemTree, TreeClient, TreeStorage, TreeWatchConfig};
use kestrel_core::{is_synthesized, Event, JsonCodec, LabelSelector, Layout, Object, RawObject, Selector};

fn storage(tree: &MemTree) -> TreeStorage<RawObject> {
    TreeStorage::new(Arc::new(tree.clone()), Arc::new(JsonCodec::new()), "/kestrel", Layout::Namespaced).with_config(TreeWatchConfig {
        supervise_interval: Duration::from_millis(50),
        force_sync_interval: Duration::from_secs(300),
        channel_capacity: 64,
    })
}

fn app(ns: &str, name: &str, v: i64) -> RawObject {
    RawObject::new(Some(ns), name).with_field("v", serde_json::json!(v))
}

async fn next(rx: &mut WatchHandle<RawObject>) -> Event<RawObject> {
    tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.expect("timed out waiting for event").expect("watch closed")
}

async fn quiet(rx: &mut WatchHandle<RawObject>) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_none(), "unexpected extra event");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn namespace_watch_sees_create_then_delete() {
    let tree = MemTree::new();
    tree.create("/kestrel/apps/ns1", b"", None).await.unwrap();
    let s = storage(&tree);
    let mut rx = s.watch("apps/ns1", &Selector::everything()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    s.create("apps/ns1/app1", &app("ns1", "app1", 1), 0).await.unwrap();
    match next(&mut rx).await {
        Event::Updated(o) => assert_eq!(o, app("ns1", "app1", 1)),
        other => panic!("expected Updated, got {other:?}"),
    }

    let prev = s.delete("apps/ns1/app1").await.unwrap();
    assert_eq!(prev, Some(app("ns1", "app1", 1)));
    match next(&mut rx).await {
        Event::Deleted(o) => {
            assert_eq!(o.identity(), (Some("ns1"), "app1"));
            assert!(is_synthesized(&o));
        }
        other => panic!("expected Deleted, got {other:?}"),
    }
    quiet(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn type_watch_discovers_new_namespaces_without_events_for_them() {
    let tree = MemTree::new();
    let s = storage(&tree);
    s.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap();
    let mut rx = s.watch("apps", &Selector::everything()).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Updated(o) if o.name() == "a"));

    // creating ns2/b makes the ns2 containment node too; only b is reported
    s.create("apps/ns2/b", &app("ns2", "b", 1), 0).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Updated(o) if o.identity() == (Some("ns2"), "b")));
    quiet(&mut rx).await;

    s.create("apps/ns2/b", &app("ns2", "b", 2), 0).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Updated(o) if o == app("ns2", "b", 2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_key_watches_every_type() {
    let tree = MemTree::new();
    let s = storage(&tree);
    s.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap();
    s.create("jobs/ns1/j", &app("ns1", "j", 1), 0).await.unwrap();
    let mut rx = s.watch("", &Selector::everything()).await.unwrap();
    let mut names = vec![next(&mut rx).await.into_object().unwrap().name().to_string(), next(&mut rx).await.into_object().unwrap().name().to_string()];
    names.sort();
    assert_eq!(names, vec!["a", "j"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovers_after_watches_are_lost() {
    let tree = MemTree::new();
    let s = storage(&tree);
    s.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap();
    let mut rx = s.watch("apps", &Selector::everything()).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Updated(_)));

    tree.expire_watches();
    tree.set("/kestrel/apps/ns1/a", &serde_json::to_vec(&app("ns1", "a", 2)).unwrap()).await.unwrap();
    loop {
        match next(&mut rx).await {
            Event::Updated(o) if o == app("ns1", "a", 2) => break,
            Event::Updated(_) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }

    // children watches are re-armed too
    s.create("apps/ns9/z", &app("ns9", "z", 1), 0).await.unwrap();
    loop {
        match next(&mut rx).await {
            Event::Updated(o) if o.name() == "z" => break,
            Event::Updated(_) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn selector_filters_and_reports_objects_leaving_it() {
    let tree = MemTree::new();
    let s = storage(&tree);
    let web = LabelSelector::new().equals("tier", "web");
    let sel = Selector::and([Selector::namespace("ns1"), Selector::labels(web)]);
    let mut rx = s.watch("apps", &sel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut a = app("ns1", "a", 1);
    a.meta.labels.insert("tier".into(), "web".into());
    s.create("apps/ns1/a", &a, 0).await.unwrap();
    let mut other_ns = app("ns2", "b", 1);
    other_ns.meta.labels.insert("tier".into(), "web".into());
    s.create("apps/ns2/b", &other_ns, 0).await.unwrap();
    s.create("apps/ns1/c", &app("ns1", "c", 1), 0).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Updated(o) if o.name() == "a"));
    quiet(&mut rx).await;

    // relabelled out of the selector
    s.create("apps/ns1/a", &app("ns1", "a", 2), 0).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Deleted(o) if o.name() == "a"));
    s.delete("apps/ns1/a").await.unwrap();
    s.delete("apps/ns2/b").await.unwrap();
    quiet(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_the_handle_ends_the_stream() {
    let tree = MemTree::new();
    let s = storage(&tree);
    s.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap();
    let mut rx = s.watch("apps/ns1", &Selector::everything()).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Updated(_)));
    rx.stop();
    let end = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("stream did not end");
    assert!(end.is_none());
    // node tasks are gone: no armed watches remain
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tree.watch_count(), 0);
}

#[tokio::test]
async fn list_walks_subtree_and_skips_containment_and_garbage() {
    let tree = MemTree::new();
    let s = storage(&tree);
    s.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap();
    s.create("apps/ns2/b", &app("ns2", "b", 1), 0).await.unwrap();
    tree.create("/kestrel/apps/ns2/broken", b"{not json", None).await.unwrap();

    let mut all = s.list("apps", &Selector::everything()).await.unwrap();
    all.sort_by(|x, y| x.name().cmp(y.name()));
    assert_eq!(all, vec![app("ns1", "a", 1), app("ns2", "b", 1)]);
    assert_eq!(s.list("apps/ns2", &Selector::everything()).await.unwrap(), vec![app("ns2", "b", 1)]);
    assert_eq!(s.list("apps/ns1/a", &Selector::everything()).await.unwrap(), vec![app("ns1", "a", 1)]);
    assert_eq!(s.list("apps", &Selector::namespace("ns1")).await.unwrap().len(), 1);
    assert!(s.list("apps/none", &Selector::everything()).await.unwrap().is_empty());
}

#[tokio::test]
async fn get_create_delete_contract() {
    let tree = MemTree::new();
    let s = storage(&tree);
    assert!(s.get("apps/ns1/a", true).await.unwrap().is_none());
    assert!(s.get("apps/ns1/a", false).await.unwrap_err().is_not_found());
    assert_eq!(s.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap(), None);
    assert_eq!(s.create("apps/ns1/a", &app("ns1", "a", 2), 0).await.unwrap(), Some(app("ns1", "a", 1)));
    assert_eq!(s.get("apps/ns1/a", false).await.unwrap(), Some(app("ns1", "a", 2)));
    assert!(s.create("apps//a", &app("ns1", "a", 1), 0).await.is_err());
    assert_eq!(s.delete("apps/ns1/a").await.unwrap(), Some(app("ns1", "a", 2)));
    assert!(s.delete("apps/ns1/a").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn create_with_ttl_expires() {
    let tree = MemTree::new();
    let s = storage(&tree);
    s.create("apps/ns1/tmp", &app("ns1", "tmp", 1), 1).await.unwrap();
    assert!(s.get("apps/ns1/tmp", true).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(s.get("apps/ns1/tmp", true).await.unwrap().is_none());
}

#[tokio::test]
async fn replacing_keeps_the_original_lifetime() {
    let tree = MemTree::new();
    let s = storage(&tree);
    s.create("apps/ns1/keep", &app("ns1", "keep", 1), 0).await.unwrap();
    s.create("apps/ns1/keep", &app("ns1", "keep", 2), 1).await.unwrap();
    s.create("apps/ns1/tmp", &app("ns1", "tmp", 1), 1).await.unwrap();
    s.create("apps/ns1/tmp", &app("ns1", "tmp", 2), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(s.get("apps/ns1/keep", true).await.unwrap(), Some(app("ns1", "keep", 2)));
    assert!(s.get("apps/ns1/tmp", true).await.unwrap().is_none());
}
