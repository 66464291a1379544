//! Distribution Hub Integration Tests
//!
//! Exercises fan-out across concurrent subscriber tasks: ordering, bounded
//! queues, keep-alives and registration lifetime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use alert_relay::{Alert, DistributionHub, HubConfig, HubEvent};
use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn alert(id: &str) -> Arc<Alert> {
    Arc::new(Alert::new(
        id,
        1,
        vec!["Ashkelon".to_string()],
        "ירי רקטות וטילים",
        Utc::now(),
    ))
}

fn hub_with_capacity(capacity: usize) -> DistributionHub {
    DistributionHub::new(HubConfig {
        subscriber_capacity: capacity,
        ..HubConfig::default()
    })
}

#[tokio::test]
async fn concurrent_subscribers_see_publish_order() {
    let hub = DistributionHub::with_defaults();
    let mut readers = Vec::new();

    for _ in 0..4 {
        let mut subscription = hub.subscribe();
        readers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while ids.len() < 10 {
                match subscription.recv().await {
                    Some(HubEvent::Alert(alert)) => ids.push(alert.id.clone()),
                    Some(HubEvent::KeepAlive) => {}
                    None => break,
                }
            }
            ids
        }));
    }

    for i in 0..10 {
        hub.publish(alert(&i.to_string()));
    }

    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    for reader in readers {
        let ids = timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ids, expected);
    }
}

#[tokio::test]
async fn slow_subscriber_drops_oldest_without_affecting_others() {
    let hub = hub_with_capacity(3);
    let mut slow = hub.subscribe();
    let mut fast = hub.subscribe();

    let mut fast_ids = Vec::new();
    for i in 0..6 {
        hub.publish(alert(&i.to_string()));
        if let Some(HubEvent::Alert(alert)) = fast.try_recv() {
            fast_ids.push(alert.id.clone());
        }
    }

    assert_eq!(fast_ids, vec!["0", "1", "2", "3", "4", "5"]);
    assert_eq!(fast.dropped(), 0);

    let mut slow_ids = Vec::new();
    while let Some(HubEvent::Alert(alert)) = slow.try_recv() {
        slow_ids.push(alert.id.clone());
    }
    assert_eq!(slow_ids, vec!["3", "4", "5"]);
    assert_eq!(slow.dropped(), 3);
    assert_eq!(hub.stats().dropped_total, 3);
}

#[tokio::test]
async fn dropped_subscription_is_unregistered() {
    let hub = DistributionHub::with_defaults();
    let kept = hub.subscribe();
    let task = {
        let mut subscription = hub.subscribe();
        tokio::spawn(async move { subscription.recv().await.is_some() })
    };
    assert_eq!(hub.subscriber_count(), 2);

    task.abort();
    let _ = task.await;

    assert_eq!(hub.subscriber_count(), 1);
    assert_eq!(hub.publish(alert("1")), 1);
    drop(kept);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn close_all_ends_every_stream() {
    let hub = DistributionHub::with_defaults();
    let mut first = hub.subscribe();
    let mut second = hub.subscribe();
    hub.publish(alert("1"));

    hub.close_all();

    assert!(matches!(first.recv().await, Some(HubEvent::Alert(_))));
    assert!(first.recv().await.is_none());
    assert!(matches!(second.recv().await, Some(HubEvent::Alert(_))));
    assert!(second.recv().await.is_none());
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_subscribers_receive_keep_alives() {
    let hub = DistributionHub::new(HubConfig {
        subscriber_capacity: 4,
        keep_alive_interval: Duration::from_secs(30),
    });
    let mut subscription = hub.subscribe();
    let cancel = CancellationToken::new();
    let ticker = hub.spawn_keep_alive(cancel.clone());

    let event = timeout(Duration::from_secs(31), subscription.recv())
        .await
        .unwrap();
    assert!(matches!(event, Some(HubEvent::KeepAlive)));

    cancel.cancel();
    ticker.await.unwrap();
}
