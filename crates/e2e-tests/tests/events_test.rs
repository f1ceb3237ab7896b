//! Event flow E2E tests.
//!
//! Drives storage mutations and checks what live listeners receive and
//! what the durable event log records, including after a reopen.

use std::path::Path;
use std::time::Duration;

use pretty_assertions::assert_eq;

use afs_events::{EventsBus, EventsStore, TopicFilter};
use afs_types::{
    NodeEvent, NodeGenericMetadata, DEPENDENCY_TOPIC, NODE_TOPIC, TIME_SERIES_TOPIC,
};
use e2e_tests::{build_sample_tree, random_payload, TestHarness};

#[test]
fn test_node_lifecycle_is_logged_in_order() {
    let harness = TestHarness::with_event_log();
    let storage = &harness.storage;
    let log = harness.events_store.as_ref().unwrap();

    let root = harness.root();
    let node = storage
        .create_node(&root.id, "node", "data", "", 0, NodeGenericMetadata::default())
        .unwrap();
    storage.write_data(&node.id, "d", b"x").unwrap();
    storage.mark_consistent(&node.id).unwrap();
    storage.rename(&node.id, "renamed").unwrap();
    storage.delete_node(&node.id).unwrap();
    storage.flush().unwrap();

    let events: Vec<NodeEvent> = log
        .read_topic(NODE_TOPIC, 0, usize::MAX)
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(
        events,
        vec![
            NodeEvent::NodeCreated {
                id: root.id.clone(),
                parent_id: None
            },
            NodeEvent::NodeCreated {
                id: node.id.clone(),
                parent_id: Some(root.id.clone())
            },
            NodeEvent::NodeDataUpdated {
                id: node.id.clone(),
                data_name: "d".to_string()
            },
            NodeEvent::NodeConsistent {
                id: node.id.clone()
            },
            NodeEvent::AttributeUpdated {
                id: node.id.clone(),
                attribute: "name".to_string()
            },
            NodeEvent::NodeRemoved {
                id: node.id.clone(),
                parent_id: Some(root.id.clone())
            },
        ]
    );
}

#[test]
fn test_listeners_only_see_their_topics() {
    let harness = TestHarness::new();
    let bus = harness.storage.events_bus();
    let node_sub = bus.add_listener(TopicFilter::topic(NODE_TOPIC));
    let series_sub = bus.add_listener(TopicFilter::topic(TIME_SERIES_TOPIC));
    let all_sub = bus.add_listener(TopicFilter::All);

    let tree = build_sample_tree(&harness.storage, &random_payload(64));

    let node_events = node_sub.drain();
    assert!(node_events.iter().all(|e| e.topic == NODE_TOPIC));
    // root, dir1, dir2, file
    assert_eq!(
        node_events
            .iter()
            .filter(|e| matches!(e.event, NodeEvent::NodeCreated { .. }))
            .count(),
        4
    );

    let series_events: Vec<NodeEvent> = series_sub.drain().into_iter().map(|e| e.event).collect();
    assert_eq!(series_events.len(), 4);
    assert!(series_events.iter().all(|e| e.node_id() == tree.file.id));

    let all_events = all_sub.drain();
    assert!(all_events.iter().any(|e| e.topic == DEPENDENCY_TOPIC));
    assert_eq!(
        all_events.len(),
        node_events.len() + series_events.len() + 1,
        "one dependency event for the one edge"
    );

    assert!(bus.remove_listener(all_sub.id()));
    assert!(!bus.remove_listener(all_sub.id()));
    harness.storage.write_data(&tree.file.id, "more", b"y").unwrap();
    assert!(all_sub.drain().is_empty());
    assert_eq!(node_sub.drain().len(), 1);
}

#[test]
fn test_event_log_survives_reopen() {
    let harness = TestHarness::with_event_log();
    let tree = build_sample_tree(&harness.storage, b"payload");
    let log = harness.events_store.as_ref().unwrap();
    let last = log.last_sequence().unwrap();
    let dependency_events = log.read_topic(DEPENDENCY_TOPIC, 0, usize::MAX).unwrap();
    assert_eq!(dependency_events.len(), 1);
    harness.storage.close().unwrap();

    // the storage holds the other reference to the log
    let settings = harness.settings.clone();
    drop(harness.events_store);
    drop(harness.storage);

    let reopened = EventsStore::open(Path::new(&settings.events.log_path), &settings.events).unwrap();
    assert_eq!(reopened.last_sequence(), Some(last));
    let replayed = reopened.read_topic(DEPENDENCY_TOPIC, 0, usize::MAX).unwrap();
    assert_eq!(replayed, dependency_events);
    assert_eq!(
        replayed[0].event,
        NodeEvent::DependencyAdded {
            id: tree.file.id.clone(),
            dependency_name: "input".to_string()
        }
    );

    let sequence = reopened
        .push_grouped_event(
            NodeEvent::NodeConsistent {
                id: tree.dir1.id.clone(),
            },
            NODE_TOPIC,
            Some("batch-1"),
        )
        .unwrap();
    assert_eq!(sequence, last + 1);
    let group = reopened.read_group("batch-1").unwrap();
    assert_eq!(group.len(), 1);
    assert_eq!(group[0].group.as_deref(), Some("batch-1"));
}

#[test]
fn test_listener_on_another_thread() {
    let harness = TestHarness::new();
    let root = harness.root();
    let sub = harness
        .storage
        .events_bus()
        .add_listener(TopicFilter::topic(NODE_TOPIC));

    let storage = harness.storage.clone();
    let root_id = root.id.clone();
    let writer = std::thread::spawn(move || {
        for i in 0..20 {
            storage
                .create_node(&root_id, &format!("n{}", i), "data", "", 0, NodeGenericMetadata::default())
                .unwrap();
        }
    });

    let mut received = Vec::new();
    while received.len() < 20 {
        match sub.recv_timeout(Duration::from_secs(5)) {
            Some(event) => received.push(event.event),
            None => break,
        }
    }
    writer.join().unwrap();

    assert_eq!(received.len(), 20);
    assert!(received
        .iter()
        .all(|e| matches!(e, NodeEvent::NodeCreated { parent_id: Some(p), .. } if *p == root.id)));
}
