mod common;

use parley_api::membership::{Authorized, MembershipError, ensure_user_in_group};
use parley_types::models::MemberRole;
use uuid::Uuid;

#[tokio::test]
async fn first_join_bootstraps_thread_and_appointment() {
    let (_dir, state) = common::test_state().await;
    state.db.create_user_if_absent("u1", Uuid::new_v4()).unwrap();

    let outcome = ensure_user_in_group(&state, "g1", "u1").await.unwrap();
    assert_eq!(outcome, Authorized::Joined);

    let appointment = state
        .db
        .get_appointment("g1")
        .unwrap()
        .expect("appointment created")
        .into_appointment()
        .unwrap();

    // Exactly the moderator and the requesting user.
    let members = state
        .db
        .list_thread_members(appointment.chat_thread_id)
        .unwrap();
    assert_eq!(members.len(), 2);
    let roles: Vec<_> = members.iter().map(|m| m.role.clone()).collect();
    assert!(roles.contains(&MemberRole::Moderator.as_str().to_string()));
    assert!(roles.contains(&MemberRole::User.as_str().to_string()));

    assert!(state.db.appointment_user_exists("g1", "u1").unwrap());
}

#[tokio::test]
async fn repeat_join_is_idempotent() {
    let (_dir, state) = common::test_state().await;
    state.db.create_user_if_absent("u1", Uuid::new_v4()).unwrap();

    assert_eq!(
        ensure_user_in_group(&state, "g1", "u1").await.unwrap(),
        Authorized::Joined
    );
    assert_eq!(
        ensure_user_in_group(&state, "g1", "u1").await.unwrap(),
        Authorized::AlreadyMember
    );

    let appointment = state
        .db
        .get_appointment("g1")
        .unwrap()
        .unwrap()
        .into_appointment()
        .unwrap();
    // Still exactly two members, and the version untouched by the repeat.
    let members = state
        .db
        .list_thread_members(appointment.chat_thread_id)
        .unwrap();
    assert_eq!(members.len(), 2);
    let thread = state
        .db
        .get_thread(appointment.chat_thread_id)
        .unwrap()
        .unwrap();
    assert_eq!(thread.version, 2);
}

#[tokio::test]
async fn second_user_joins_the_existing_thread() {
    let (_dir, state) = common::test_state().await;
    state.db.create_user_if_absent("u1", Uuid::new_v4()).unwrap();
    state.db.create_user_if_absent("u2", Uuid::new_v4()).unwrap();

    ensure_user_in_group(&state, "g1", "u1").await.unwrap();
    ensure_user_in_group(&state, "g1", "u2").await.unwrap();

    let appointment = state
        .db
        .get_appointment("g1")
        .unwrap()
        .unwrap()
        .into_appointment()
        .unwrap();
    let members = state
        .db
        .list_thread_members(appointment.chat_thread_id)
        .unwrap();
    assert_eq!(members.len(), 3);
}

#[tokio::test]
async fn unknown_user_is_rejected_before_any_bootstrap() {
    let (_dir, state) = common::test_state().await;

    let err = ensure_user_in_group(&state, "g1", "ghost").await.unwrap_err();
    assert!(matches!(err, MembershipError::UnknownUser(_)));
    assert!(state.db.get_appointment("g1").unwrap().is_none());
}

#[tokio::test]
async fn concurrent_first_joins_converge_on_one_appointment() {
    let (_dir, state) = common::test_state().await;
    state.db.create_user_if_absent("u1", Uuid::new_v4()).unwrap();
    state.db.create_user_if_absent("u2", Uuid::new_v4()).unwrap();

    let a = ensure_user_in_group(&state, "g1", "u1");
    let b = ensure_user_in_group(&state, "g1", "u2");
    let (ra, rb) = tokio::join!(a, b);
    assert_eq!(ra.unwrap(), Authorized::Joined);
    assert_eq!(rb.unwrap(), Authorized::Joined);

    // One appointment survives and both users are members of its thread.
    let appointment = state
        .db
        .get_appointment("g1")
        .unwrap()
        .unwrap()
        .into_appointment()
        .unwrap();
    let members = state
        .db
        .list_thread_members(appointment.chat_thread_id)
        .unwrap();
    let users = members.iter().filter(|m| m.role == "user").count();
    assert_eq!(users, 2);
}
