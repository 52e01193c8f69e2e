//! Integration tests for the event log.

mod common;

use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::json;

use keel::{Error, NewEvent, StoredEvent};

fn page_event(id: &str, event_type: &str, version: i64) -> NewEvent {
    NewEvent::new("Page", id, event_type, version, json!({ "v": version }))
}

fn versions(events: &[StoredEvent]) -> Vec<i64> {
    events.iter().map(StoredEvent::version).collect()
}

#[tokio::test]
async fn append_returns_stored_event() {
    let (_db, events, _) = common::stores().await;

    let stored = events
        .append(
            NewEvent::new("Page", "home", "PageCreated", 1, json!({ "title": "Home" }))
                .with_id("evt-1")
                .with_scope("harbor-1")
                .with_metadata(json!({ "user": "ada" })),
        )
        .await
        .expect("append should succeed");

    assert!(stored.sequence() > 0);
    assert_eq!(stored.id(), "evt-1");
    assert_eq!(stored.scope_id(), Some("harbor-1"));
    assert_eq!(stored.aggregate_type(), "Page");
    assert_eq!(stored.aggregate_id(), "home");
    assert_eq!(stored.event_type(), "PageCreated");
    assert_eq!(stored.version(), 1);
    assert_eq!(stored.payload(), &json!({ "title": "Home" }));
    assert_eq!(stored.metadata(), Some(&json!({ "user": "ada" })));

    let loaded = events.events("Page", "home", 0).await.expect("load");
    assert_eq!(loaded, vec![stored]);
}

#[tokio::test]
async fn duplicate_version_conflicts() {
    let (_db, events, _) = common::stores().await;

    events
        .append(page_event("home", "PageCreated", 1))
        .await
        .expect("first writer wins");
    let err = events
        .append(page_event("home", "PageUpdated", 1))
        .await
        .expect_err("second writer must conflict");

    assert_eq!(
        err,
        Error::Conflict {
            aggregate_type: "Page".into(),
            aggregate_id: "home".into(),
            version: 1,
        }
    );
    let stored = events.events("Page", "home", 0).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].event_type(), "PageCreated");
}

#[tokio::test]
async fn same_version_on_other_aggregates_is_fine() {
    let (_db, events, _) = common::stores().await;

    events.append(page_event("home", "PageCreated", 1)).await.unwrap();
    events.append(page_event("about", "PageCreated", 1)).await.unwrap();
    events
        .append(NewEvent::new("Blueprint", "home", "BlueprintCreated", 1, json!({})))
        .await
        .unwrap();

    assert_eq!(events.events("Page", "home", 0).await.unwrap().len(), 1);
    assert_eq!(events.events("Page", "about", 0).await.unwrap().len(), 1);
    assert_eq!(events.events("Blueprint", "home", 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_event_id_is_rejected() {
    let (_db, events, _) = common::stores().await;

    events
        .append(page_event("home", "PageCreated", 1).with_id("evt-1"))
        .await
        .unwrap();
    let err = events
        .append(page_event("about", "PageCreated", 1).with_id("evt-1"))
        .await
        .expect_err("ids are unique");

    assert_eq!(err, Error::DuplicateEventId("evt-1".into()));
}

#[rstest]
#[case::zero(0)]
#[case::negative(-3)]
#[tokio::test]
async fn non_positive_version_is_rejected(#[case] version: i64) {
    let (_db, events, _) = common::stores().await;

    let err = events
        .append(page_event("home", "PageCreated", version))
        .await
        .expect_err("versions start at 1");

    assert!(matches!(err, Error::Validation(_)));
    assert!(events.events("Page", "home", 0).await.unwrap().is_empty());
}

#[rstest]
#[case::in_order(vec![1, 2, 3, 4])]
#[case::reversed(vec![4, 3, 2, 1])]
#[case::shuffled(vec![3, 1, 4, 2])]
#[tokio::test]
async fn events_are_ordered_by_version(#[case] insertion_order: Vec<i64>) {
    let (_db, events, _) = common::stores().await;
    for version in insertion_order {
        events
            .append(page_event("home", "PageUpdated", version))
            .await
            .unwrap();
    }

    let all = events.events("Page", "home", 0).await.unwrap();
    assert_eq!(versions(&all), vec![1, 2, 3, 4]);

    let after_two = events.events("Page", "home", 2).await.unwrap();
    assert_eq!(versions(&after_two), vec![3, 4]);

    let none = events.events("Page", "home", 4).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn unknown_aggregate_has_no_events() {
    let (_db, events, _) = common::stores().await;
    assert!(events.events("Page", "missing", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn events_by_type_spans_aggregates() {
    let (_db, events, _) = common::stores().await;
    events.append(page_event("home", "PageCreated", 1)).await.unwrap();
    events.append(page_event("home", "PageUpdated", 2)).await.unwrap();
    events.append(page_event("about", "PageCreated", 1)).await.unwrap();
    events.append(page_event("home", "PageUpdated", 3)).await.unwrap();
    events.append(page_event("about", "PageUpdated", 2)).await.unwrap();

    let updated = events.events_by_type("PageUpdated", None).await.unwrap();
    let keys: Vec<(&str, i64)> = updated
        .iter()
        .map(|e| (e.aggregate_id(), e.version()))
        .collect();
    assert_eq!(keys, vec![("home", 2), ("about", 2), ("home", 3)]);

    let capped = events.events_by_type("PageUpdated", Some(2)).await.unwrap();
    assert_eq!(capped.len(), 2);

    assert!(events.events_by_type("PageDeleted", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn global_feed_follows_sequence() {
    let (_db, events, _) = common::stores().await;
    let first = events.append(page_event("home", "PageCreated", 1)).await.unwrap();
    let second = events.append(page_event("about", "PageCreated", 1)).await.unwrap();
    let third = events.append(page_event("home", "PageUpdated", 2)).await.unwrap();

    assert!(first.sequence() < second.sequence() && second.sequence() < third.sequence());

    let all = events.events_after(0, None).await.unwrap();
    assert_eq!(all, vec![first.clone(), second.clone(), third.clone()]);

    let tail = events.events_after(first.sequence(), Some(1)).await.unwrap();
    assert_eq!(tail, vec![second]);
}

#[tokio::test]
async fn scoped_feed_only_returns_that_scope() {
    let (_db, events, _) = common::stores().await;
    let a1 = events
        .append(page_event("home", "PageCreated", 1).with_scope("a"))
        .await
        .unwrap();
    events
        .append(page_event("home", "PageCreated", 1).with_scope("b").with_id("other"))
        .await
        .expect_err("same aggregate and version conflicts regardless of scope");
    events
        .append(page_event("about", "PageCreated", 1).with_scope("b"))
        .await
        .unwrap();
    let a2 = events
        .append(page_event("home", "PageUpdated", 2).with_scope("a"))
        .await
        .unwrap();

    let scoped = events.events_for_scope("a", 0, None).await.unwrap();
    assert_eq!(scoped, vec![a1.clone(), a2.clone()]);

    let after = events.events_for_scope("a", a1.sequence(), None).await.unwrap();
    assert_eq!(after, vec![a2]);
}

#[tokio::test]
async fn next_version_is_max_plus_one() {
    let (_db, events, _) = common::stores().await;
    assert_eq!(events.next_version("Page", "home").await.unwrap(), 1);

    events.append(page_event("home", "PageCreated", 1)).await.unwrap();
    events.append(page_event("home", "PageUpdated", 2)).await.unwrap();
    assert_eq!(events.next_version("Page", "home").await.unwrap(), 3);

    // The hint is not a reservation: two callers may read the same value,
    // and only one of them can append with it.
    let next = events.next_version("Page", "home").await.unwrap();
    events.append(page_event("home", "PageUpdated", next)).await.unwrap();
    let err = events
        .append(page_event("home", "PageUpdated", next))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { version: 3, .. }));
}
