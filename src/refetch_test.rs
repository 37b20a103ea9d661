use super::*;
use crate::api::ActionItemSummary;
use crate::test_support::{FakeBackstop, eventually};
use frames::NotificationPayload;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

fn seeded_backstop() -> Arc<FakeBackstop> {
    let fake = FakeBackstop::default();
    fake.unread.store(3, Ordering::SeqCst);
    fake.unread_messages.store(2, Ordering::SeqCst);
    *fake.notifications.lock().expect("notifications") =
        vec![NotificationPayload { id: Some("n-1".into()), title: "PO approved".into(), ..Default::default() }];
    *fake.action_items.lock().expect("action items") =
        ActionItemSummary { counts: BTreeMap::from([("approvals".to_owned(), 4)]) };
    Arc::new(fake)
}

fn start(cache: &Arc<QueryCache>, fake: &Arc<FakeBackstop>) -> BackstopRefetcher {
    BackstopRefetcher::spawn(&RealtimeConfig::default(), Arc::clone(cache), Arc::clone(fake) as Arc<dyn Backstop>)
}

async fn wait_for_polls(fake: &FakeBackstop, polls: usize) {
    eventually(|| fake.action_item_calls.load(Ordering::SeqCst) >= polls).await;
}

#[test]
fn covered_by_matches_key_prefixes() {
    assert_eq!(BackstopQuery::covered_by(&keys::unread_messages()), [BackstopQuery::MessageUnread]);
    assert_eq!(
        BackstopQuery::covered_by(&keys::notifications()),
        [BackstopQuery::Notifications, BackstopQuery::NotificationUnread]
    );
    assert_eq!(BackstopQuery::covered_by(&keys::notification_unread()), [BackstopQuery::NotificationUnread]);
    assert!(BackstopQuery::covered_by(&keys::conversations()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn first_tick_fills_every_query() {
    let cache = Arc::new(QueryCache::new());
    let fake = seeded_backstop();
    let _refetcher = start(&cache, &fake);

    eventually(|| !cache.is_stale(&keys::action_items())).await;
    assert_eq!(cache.get(&keys::notification_unread()), Some(json!(3)));
    assert_eq!(cache.get(&keys::unread_messages()), Some(json!(2)));
    assert_eq!(cache.get(&keys::action_items()), Some(json!({"approvals": 4})));
    let list = cache.get(&keys::notification_list()).expect("list cached");
    assert_eq!(list[0]["id"], "n-1");
}

#[tokio::test(start_paused = true)]
async fn invalidation_refetches_only_covered_queries() {
    let cache = Arc::new(QueryCache::new());
    let fake = seeded_backstop();
    let _refetcher = start(&cache, &fake);
    wait_for_polls(&fake, 1).await;
    eventually(|| !cache.is_stale(&keys::action_items())).await;

    fake.unread_messages.store(9, Ordering::SeqCst);
    cache.invalidate(&keys::unread_messages());
    eventually(|| cache.get(&keys::unread_messages()) == Some(json!(9))).await;

    assert!(!cache.is_stale(&keys::unread_messages()));
    assert_eq!(fake.action_item_calls.load(Ordering::SeqCst), 1, "only the covered query is refetched");
}

#[tokio::test(start_paused = true)]
async fn periodic_poll_refreshes_after_interval() {
    let cache = Arc::new(QueryCache::new());
    let fake = seeded_backstop();
    let _refetcher = start(&cache, &fake);
    wait_for_polls(&fake, 1).await;

    fake.action_items.lock().expect("action items").counts.insert("approvals".to_owned(), 7);
    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_for_polls(&fake, 2).await;
    eventually(|| cache.get(&keys::action_items()) == Some(json!({"approvals": 7}))).await;
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_keeps_last_value_until_next_poll() {
    let cache = Arc::new(QueryCache::new());
    let fake = seeded_backstop();
    let _refetcher = start(&cache, &fake);
    wait_for_polls(&fake, 1).await;
    eventually(|| !cache.is_stale(&keys::action_items())).await;

    fake.fail.store(true, Ordering::SeqCst);
    fake.unread.store(7, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_for_polls(&fake, 2).await;
    assert_eq!(cache.get(&keys::notification_unread()), Some(json!(3)));

    fake.fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(60)).await;
    eventually(|| cache.get(&keys::notification_unread()) == Some(json!(7))).await;
}

#[tokio::test(start_paused = true)]
async fn dropping_refetcher_stops_polling() {
    let cache = Arc::new(QueryCache::new());
    let fake = seeded_backstop();
    let refetcher = start(&cache, &fake);
    wait_for_polls(&fake, 1).await;

    drop(refetcher);
    tokio::time::sleep(Duration::from_secs(300)).await;
    cache.invalidate(&keys::action_items());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fake.action_item_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_the_task() {
    let cache = Arc::new(QueryCache::new());
    let fake = seeded_backstop();
    let refetcher = start(&cache, &fake);
    wait_for_polls(&fake, 1).await;

    refetcher.shutdown().await;
    cache.invalidate(&keys::action_items());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fake.action_item_calls.load(Ordering::SeqCst), 1);
}
