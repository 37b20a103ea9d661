use super::*;
use crate::config::RealtimeConfig;
use crate::test_support::{FakeBackstop, eventually, offline_manager};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};

fn push(manager: &ConnectionManager, payload: serde_json::Value) -> usize {
    let frame = json!({"type": "notification", "payload": payload, "timestamp": "2026-01-05T10:00:00Z"});
    manager.router().dispatch(&frame.to_string())
}

fn small_manager(limit: usize) -> ConnectionManager {
    let config = RealtimeConfig { notification_limit: limit, ..RealtimeConfig::default() };
    ConnectionManager::new(config, Arc::new(crate::auth::MemoryTokenStore::default()))
}

#[test]
fn record_normalizes_aliases_and_fills_defaults() {
    let payload: NotificationPayload = serde_json::from_value(json!({
        "title": "Invoice overdue",
        "body": "INV-9 is 10 days late",
        "notification_type": "finance",
        "read": false,
        "action_url": "/finance/invoices/9"
    }))
    .expect("payload");
    let record = NotificationRecord::from(payload);

    assert!(Uuid::parse_str(&record.id).is_ok(), "missing id gets a generated one");
    assert_eq!(record.message, "INV-9 is 10 days late");
    assert_eq!(record.notification_type, "finance");
    assert_eq!(record.priority, "normal");
    assert_eq!(record.link.as_deref(), Some("/finance/invoices/9"));
    assert!(!record.created_at.is_empty());
}

#[test]
fn record_defaults_type_to_info() {
    let record = NotificationRecord::from(NotificationPayload { id: Some("n-1".into()), ..Default::default() });
    assert_eq!(record.id, "n-1");
    assert_eq!(record.notification_type, "info");
}

#[tokio::test]
async fn push_prepends_and_counts_unread() {
    let manager = offline_manager();
    let feed = NotificationFeed::mount(&manager, Arc::new(FakeBackstop::default()));

    assert_eq!(push(&manager, json!({"id": "n-1", "title": "first"})), 1);
    push(&manager, json!({"id": "n-2", "title": "second"}));
    push(&manager, json!({"id": "n-3", "title": "already seen", "is_read": true}));

    let ids: Vec<_> = feed.snapshot().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, ["n-3", "n-2", "n-1"]);
    assert_eq!(feed.unread_count(), 2);
}

#[tokio::test]
async fn feed_evicts_oldest_beyond_limit() {
    let manager = small_manager(3);
    let feed = NotificationFeed::mount(&manager, Arc::new(FakeBackstop::default()));

    for i in 0..5 {
        push(&manager, json!({"id": format!("n-{i}"), "title": "t"}));
    }
    let ids: Vec<_> = feed.snapshot().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, ["n-4", "n-3", "n-2"]);
    assert_eq!(feed.unread_count(), 5, "evicted entries still count as unread");
}

#[tokio::test]
async fn push_triggers_action_item_refetch() {
    let manager = offline_manager();
    let backstop = Arc::new(FakeBackstop::default());
    backstop.action_items.lock().expect("items").counts.insert("pending_approvals".into(), 4);
    let feed = NotificationFeed::mount(&manager, Arc::clone(&backstop) as Arc<dyn Backstop>);

    push(&manager, json!({"id": "n-1", "title": "PO needs approval"}));
    eventually(|| feed.action_items().total() == 4).await;
    assert_eq!(backstop.action_item_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refetch_keeps_subscription_alive() {
    let manager = offline_manager();
    let backstop = Arc::new(FakeBackstop { fail: AtomicBool::new(true), ..FakeBackstop::default() });
    let feed = NotificationFeed::mount(&manager, Arc::clone(&backstop) as Arc<dyn Backstop>);

    push(&manager, json!({"id": "n-1", "title": "a"}));
    eventually(|| backstop.action_item_calls.load(Ordering::SeqCst) == 1).await;

    assert_eq!(push(&manager, json!({"id": "n-2", "title": "b"})), 1);
    assert_eq!(feed.snapshot().len(), 2);
}

#[tokio::test]
async fn refresh_replaces_feed_with_server_view() {
    let manager = small_manager(2);
    let backstop = Arc::new(FakeBackstop::default());
    *backstop.notifications.lock().expect("list") = vec![
        NotificationPayload { id: Some("s-1".into()), ..Default::default() },
        NotificationPayload { id: Some("s-2".into()), is_read: true, ..Default::default() },
        NotificationPayload { id: Some("s-3".into()), ..Default::default() },
    ];
    backstop.unread.store(7, Ordering::SeqCst);
    let feed = NotificationFeed::mount(&manager, Arc::clone(&backstop) as Arc<dyn Backstop>);
    push(&manager, json!({"id": "local", "title": "x"}));

    feed.refresh().await.expect("refresh");
    let ids: Vec<_> = feed.snapshot().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, ["s-1", "s-2"]);
    assert_eq!(feed.unread_count(), 7);
}

#[tokio::test]
async fn mark_read_updates_after_server_accepts() {
    let manager = offline_manager();
    let backstop = Arc::new(FakeBackstop::default());
    let feed = NotificationFeed::mount(&manager, Arc::clone(&backstop) as Arc<dyn Backstop>);
    push(&manager, json!({"id": "n-1", "title": "a"}));
    push(&manager, json!({"id": "n-2", "title": "b"}));

    feed.mark_read("n-1").await.expect("mark");
    feed.mark_read("n-1").await.expect("mark again");
    assert_eq!(feed.unread_count(), 1);
    assert_eq!(backstop.marked(), ["n-1", "n-1"]);

    feed.mark_all_read().await.expect("mark all");
    assert_eq!(feed.unread_count(), 0);
    assert!(feed.snapshot().iter().all(|n| n.is_read));
}

#[tokio::test]
async fn mark_read_failure_leaves_state_untouched() {
    let manager = offline_manager();
    let backstop = Arc::new(FakeBackstop::default());
    let feed = NotificationFeed::mount(&manager, Arc::clone(&backstop) as Arc<dyn Backstop>);
    push(&manager, json!({"id": "n-1", "title": "a"}));

    backstop.fail.store(true, Ordering::SeqCst);
    assert!(feed.mark_all_read().await.is_err());
    assert_eq!(feed.unread_count(), 1);
}

#[tokio::test]
async fn dropping_feed_unsubscribes() {
    let manager = offline_manager();
    let feed = NotificationFeed::mount(&manager, Arc::new(FakeBackstop::default()));
    assert_eq!(manager.registry().handler_count(&MessageKind::Notification), 1);

    drop(feed);
    assert_eq!(push(&manager, json!({"id": "n-1"})), 0);
}
