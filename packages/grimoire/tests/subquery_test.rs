mod common;

use common::*;
use serde_json::json;

const THREAD_WITH_COMMENTS: &str =
    "SELECT *, (SELECT * FROM comment WHERE thread = $parent.id LIMIT 2) AS comments FROM thread";

#[test]
fn test_related_subquery_exposes_limited_children() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_threads", THREAD_WITH_COMMENTS, json!(null))
        .unwrap();
    create_author(session, "author:alice", "Alice");
    create_thread(session, "thread:t1", "A", "author:alice");
    let rx = session.subscribe("v_threads").unwrap();
    drain(&rx);

    create_comment(session, "comment:c1", "one", "thread:t1", "author:alice");
    create_comment(session, "comment:c2", "two", "thread:t1", "author:alice");
    create_comment(session, "comment:c3", "three", "thread:t1", "author:alice");

    // The thread row plus the first two comments by id; the third is
    // beyond the subquery limit.
    let current = session.current_ids("v_threads").unwrap();
    assert_eq!(ids(&current), vec!["thread:t1", "comment:c1", "comment:c2"]);
}

#[test]
fn test_subquery_children_leave_with_their_parent() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_threads", THREAD_WITH_COMMENTS, json!(null))
        .unwrap();
    create_author(session, "author:alice", "Alice");
    create_thread(session, "thread:t1", "A", "author:alice");
    create_comment(session, "comment:c1", "one", "thread:t1", "author:alice");

    let rx = session.subscribe("v_threads").unwrap();
    drain(&rx);

    session.delete("thread:t1").unwrap();
    let update = last_update(&rx).unwrap();
    assert!(session.current_ids("v_threads").unwrap().is_empty());
    let removed = ids(&update.removed_ids);
    assert!(removed.contains(&"thread:t1"));
    assert!(removed.contains(&"comment:c1"));
}

#[test]
fn test_deleting_exposed_child_promotes_next() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_threads", THREAD_WITH_COMMENTS, json!(null))
        .unwrap();
    create_author(session, "author:alice", "Alice");
    create_thread(session, "thread:t1", "A", "author:alice");
    create_comment(session, "comment:c1", "one", "thread:t1", "author:alice");
    create_comment(session, "comment:c2", "two", "thread:t1", "author:alice");
    create_comment(session, "comment:c3", "three", "thread:t1", "author:alice");

    session.delete("comment:c1").unwrap();

    // The limit window slides: c2 stays, c3 is promoted.
    let current = session.current_ids("v_threads").unwrap();
    assert_eq!(ids(&current), vec!["thread:t1", "comment:c2", "comment:c3"]);
}

#[test]
fn test_subquery_edit_moves_root() {
    let mut t = setup();
    let session = &mut t.session;

    session
        .register_view("v_threads", THREAD_WITH_COMMENTS, json!(null))
        .unwrap();
    create_author(session, "author:alice", "Alice");
    create_thread(session, "thread:t1", "A", "author:alice");
    create_comment(session, "comment:c1", "one", "thread:t1", "author:alice");

    let rx = session.subscribe("v_threads").unwrap();
    let seed = last_update(&rx).unwrap();

    // Membership is unchanged but the comment's leaf (and the thread's
    // total, via the cascade) both move.
    session
        .update("comment:c1", json!({ "content": "edited" }))
        .unwrap();
    let update = last_update(&rx).unwrap();
    assert_eq!(
        ids(&update.current_ids),
        vec!["thread:t1", "comment:c1"]
    );
    assert_ne!(update.root_hash, seed.root_hash);
}
