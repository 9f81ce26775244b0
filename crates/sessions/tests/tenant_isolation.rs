//! Cross-tenant isolation through the public store API.

use ag_sessions::{SessionStore, UserStore};

#[test]
fn one_users_sessions_are_invisible_to_another() {
    let dir = tempfile::tempdir().unwrap();
    let users = UserStore::new(dir.path(), 30).unwrap();
    let sessions = SessionStore::new(dir.path()).unwrap();

    let (u1, _) = users.register("wang_er", "pw1", None).unwrap();
    let (u2, _) = users.register("li_si", "pw2", None).unwrap();

    let s = sessions.create(&u1.user_id, None).unwrap();
    let handle = sessions
        .begin_turn(&u1.user_id, &s.session_id, "My name is Wang Er, I am 26.")
        .unwrap();
    sessions
        .commit_turn(handle, "Nice to meet you, Wang Er.", &[])
        .unwrap();

    // Read attempts by u2 return NotFound, indistinguishable from absence.
    assert_eq!(
        sessions.get(&u2.user_id, &s.session_id).unwrap_err().kind(),
        "not_found"
    );
    assert_eq!(
        sessions
            .delete(&u2.user_id, &s.session_id)
            .unwrap_err()
            .kind(),
        "not_found"
    );
    assert!(sessions.list(&u2.user_id).is_empty());

    // A begin_turn attempt by u2 is also NotFound, not Busy.
    assert_eq!(
        sessions
            .begin_turn(&u2.user_id, &s.session_id, "hi")
            .unwrap_err()
            .kind(),
        "not_found"
    );

    // The owner still sees the committed turn exactly once.
    let record = sessions.get(&u1.user_id, &s.session_id).unwrap();
    let assistant_count = record
        .messages
        .iter()
        .filter(|m| m.content == "Nice to meet you, Wang Er.")
        .count();
    assert_eq!(assistant_count, 1);
}

#[test]
fn token_resolution_is_per_user() {
    let dir = tempfile::tempdir().unwrap();
    let users = UserStore::new(dir.path(), 30).unwrap();

    let (u1, t1) = users.register("a", "pw", None).unwrap();
    let (u2, t2) = users.register("b", "pw", None).unwrap();

    assert_eq!(users.resolve_token(&t1), Some(u1.user_id));
    assert_eq!(users.resolve_token(&t2), Some(u2.user_id));
    assert_eq!(users.resolve_token("forged-token"), None);
}
