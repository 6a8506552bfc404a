mod common;

use common::*;
use serde_json::json;

#[test]
fn test_limit_without_order_keeps_smallest_ids() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_first", "SELECT * FROM items LIMIT 1", json!(null))
        .unwrap();
    let rx = session.subscribe("v_first").unwrap();
    drain(&rx);

    create_item(session, "items:20", json!(1));
    let update = last_update(&rx).unwrap();
    assert_eq!(ids(&update.current_ids), vec!["items:20"]);

    // A smaller record id evicts the larger one.
    create_item(session, "items:10", json!(2));
    let update = last_update(&rx).unwrap();
    assert_eq!(ids(&update.current_ids), vec!["items:10"]);
    assert_eq!(ids(&update.removed_ids), vec!["items:20"]);
    assert_eq!(ids(&update.added_ids), vec!["items:10"]);
}

#[test]
fn test_order_by_desc_with_limit() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view(
            "v_top",
            "SELECT * FROM items ORDER BY val DESC LIMIT 2",
            json!(null),
        )
        .unwrap();
    let rx = session.subscribe("v_top").unwrap();
    drain(&rx);

    create_item(session, "items:1", json!(10));
    create_item(session, "items:2", json!(20));
    create_item(session, "items:3", json!(5));

    let current = session.current_ids("v_top").unwrap();
    assert_eq!(ids(&current), vec!["items:2", "items:1"]);
}

#[test]
fn test_equal_order_keys_break_ties_on_id() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view(
            "v_tie",
            "SELECT * FROM items ORDER BY val DESC LIMIT 2",
            json!(null),
        )
        .unwrap();

    create_item(session, "items:3", json!(5));
    create_item(session, "items:1", json!(5));
    create_item(session, "items:2", json!(5));

    // All order keys are equal; record id ascending decides.
    let current = session.current_ids("v_tie").unwrap();
    assert_eq!(ids(&current), vec!["items:1", "items:2"]);
}

#[test]
fn test_or_filter_matches_either_side() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view(
            "v_or",
            "SELECT * FROM items WHERE val = 10 OR val = 100",
            json!(null),
        )
        .unwrap();
    let rx = session.subscribe("v_or").unwrap();
    drain(&rx);

    create_item(session, "items:1", json!(10));
    let update = last_update(&rx).unwrap();
    assert_eq!(ids(&update.added_ids), vec!["items:1"]);

    // val=20 matches neither branch: the subscriber hears nothing.
    create_item(session, "items:2", json!(20));
    assert!(drain(&rx).is_empty());

    create_item(session, "items:3", json!(100));
    let update = last_update(&rx).unwrap();
    assert_eq!(ids(&update.added_ids), vec!["items:3"]);
    assert_eq!(ids(&update.current_ids), vec!["items:1", "items:3"]);
}

#[test]
fn test_nulls_sort_last_asc_first_desc() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view(
            "v_asc",
            "SELECT * FROM items ORDER BY val ASC LIMIT 10",
            json!(null),
        )
        .unwrap();
    session
        .register_view(
            "v_desc",
            "SELECT * FROM items ORDER BY val DESC LIMIT 10",
            json!(null),
        )
        .unwrap();

    create_item(session, "items:1", json!(1));
    create_item(session, "items:2", json!(null));
    create_item(session, "items:3", json!(3));

    let asc = session.current_ids("v_asc").unwrap();
    assert_eq!(ids(&asc), vec!["items:1", "items:3", "items:2"]);

    let desc = session.current_ids("v_desc").unwrap();
    assert_eq!(ids(&desc), vec!["items:2", "items:3", "items:1"]);
}

#[test]
fn test_noop_update_emits_nothing() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_all", "SELECT * FROM items", json!(null))
        .unwrap();
    create_item(session, "items:1", json!(10));

    let rx = session.subscribe("v_all").unwrap();
    drain(&rx);
    let hash_before = session.total_hash("items:1").unwrap();

    session.update("items:1", json!({ "val": 10 })).unwrap();
    assert!(drain(&rx).is_empty());
    assert_eq!(session.total_hash("items:1").unwrap(), hash_before);
}

#[test]
fn test_content_update_moves_root_without_membership_change() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_all", "SELECT * FROM items", json!(null))
        .unwrap();
    create_item(session, "items:1", json!(10));
    let rx = session.subscribe("v_all").unwrap();
    let seed = last_update(&rx).unwrap();

    session.update("items:1", json!({ "val": 11 })).unwrap();
    let update = last_update(&rx).unwrap();
    assert!(update.added_ids.is_empty());
    assert!(update.removed_ids.is_empty());
    assert_eq!(ids(&update.current_ids), vec!["items:1"]);
    assert_ne!(update.root_hash, seed.root_hash);
}

#[test]
fn test_filter_update_moves_record_out() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_ten", "SELECT * FROM items WHERE val = 10", json!(null))
        .unwrap();
    create_item(session, "items:1", json!(10));
    let rx = session.subscribe("v_ten").unwrap();
    drain(&rx);

    session.update("items:1", json!({ "val": 20 })).unwrap();
    let update = last_update(&rx).unwrap();
    assert_eq!(ids(&update.removed_ids), vec!["items:1"]);
    assert!(update.current_ids.is_empty());
}

#[test]
fn test_delete_of_unmatched_record_is_silent() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_ten", "SELECT * FROM items WHERE val = 10", json!(null))
        .unwrap();
    create_item(session, "items:1", json!(20));
    let rx = session.subscribe("v_ten").unwrap();
    drain(&rx);

    session.delete("items:1").unwrap();
    assert!(drain(&rx).is_empty());
}

#[test]
fn test_type_mismatch_isolates_to_view() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_ten", "SELECT * FROM items WHERE val = 10", json!(null))
        .unwrap();
    session
        .register_view("v_all", "SELECT * FROM items", json!(null))
        .unwrap();
    let rx_ten = session.subscribe("v_ten").unwrap();
    let rx_all = session.subscribe("v_all").unwrap();
    drain(&rx_ten);
    drain(&rx_all);

    // A string val cannot be compared against 10: the filter view drops
    // the delta, the unfiltered view still sees the record.
    create_item(session, "items:1", json!("not a number"));
    assert!(drain(&rx_ten).is_empty());
    let update = last_update(&rx_all).unwrap();
    assert_eq!(ids(&update.added_ids), vec!["items:1"]);

    // The filter view keeps working for well-typed rows afterwards.
    create_item(session, "items:2", json!(10));
    let update = last_update(&rx_ten).unwrap();
    assert_eq!(ids(&update.added_ids), vec!["items:2"]);
}

#[test]
fn test_join_counts_multiplicity() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view(
            "v_threads",
            "SELECT * FROM thread WHERE id = comment.thread",
            json!(null),
        )
        .unwrap();
    create_author(session, "author:alice", "Alice");
    create_thread(session, "thread:t1", "A", "author:alice");
    let rx = session.subscribe("v_threads").unwrap();
    drain(&rx);

    // Two matching comments; deleting one keeps the thread in the view.
    create_comment(session, "comment:c1", "x", "thread:t1", "author:alice");
    create_comment(session, "comment:c2", "y", "thread:t1", "author:alice");
    let update = last_update(&rx).unwrap();
    assert_eq!(ids(&update.current_ids), vec!["thread:t1"]);

    session.delete("comment:c1").unwrap();
    let current = session.current_ids("v_threads").unwrap();
    assert_eq!(ids(&current), vec!["thread:t1"]);

    session.delete("comment:c2").unwrap();
    let update = last_update(&rx).unwrap();
    assert_eq!(ids(&update.removed_ids), vec!["thread:t1"]);
    assert!(session.current_ids("v_threads").unwrap().is_empty());
}

#[test]
fn test_prefix_match_on_record_id() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view(
            "v_prefix",
            "SELECT * FROM items WHERE id = 'items:2*'",
            json!(null),
        )
        .unwrap();

    create_item(session, "items:19", json!(1));
    create_item(session, "items:21", json!(2));
    create_item(session, "items:22", json!(3));

    let current = session.current_ids("v_prefix").unwrap();
    assert_eq!(ids(&current), vec!["items:21", "items:22"]);
}
