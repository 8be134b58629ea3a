use serde_json::{json, Value};
use uuid::Uuid;

use super::harness::{engine, TestEngine};
use crate::cache::Cache;
use crate::errors::EngineError;
use crate::models::*;
use crate::session_service::{session_detail_key, session_list_key};
use crate::submission::{ALREADY_COMPLETED, SUBMITTED};

fn mc_answer(option: &str) -> Value {
    json!({"type": "multiple_choice", "selected_option": option})
}

async fn submit(engine: &TestEngine, user: Uuid, session_id: Uuid, body: Value) -> Result<SubmissionResult, EngineError> {
    engine.state.submissions.submit_answers(user, session_id, body).await
}

#[tokio::test]
async fn test_two_question_scoring_with_negative_marks() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(2, 4.0, 1.0).await;
    let created = engine.create(user, 2).await;
    let q1 = created.questions[0].id;
    let q2 = created.questions[1].id;

    let result = submit(
        &engine,
        user,
        created.session.id,
        json!({"answers": {q1.to_string(): mc_answer("a"), q2.to_string(): mc_answer("b")}}),
    )
    .await
    .unwrap();

    assert_eq!(result.message, SUBMITTED);
    assert!(result.is_completed);
    assert_eq!(result.total_questions, 2);
    assert_eq!(result.total_attempted, 2);
    assert_eq!(result.total_correct, 1);
    assert_eq!(result.score, 3.0);
    assert_eq!(result.max_score, 8.0);
    assert_eq!(
        result.results,
        vec![
            QuestionResult { question_id: q1, is_correct: true, marks_awarded: 4.0 },
            QuestionResult { question_id: q2, is_correct: false, marks_awarded: -1.0 },
        ]
    );
    assert!(result.skipped_question_ids.is_empty());

    let stored = engine.db.get_session(created.session.id, user).await.unwrap().unwrap();
    assert!(stored.is_completed);
    assert!(stored.end_time.is_some());
    assert_eq!(stored.score, 3.0);
}

#[tokio::test]
async fn test_resubmission_returns_stored_result() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(2, 4.0, 1.0).await;
    let created = engine.create(user, 2).await;
    let q1 = created.questions[0].id;
    let q2 = created.questions[1].id;
    let body = json!({"answers": {q1.to_string(): mc_answer("a"), q2.to_string(): mc_answer("b")}});

    let first = submit(&engine, user, created.session.id, body).await.unwrap();
    let flipped = json!({"answers": {q1.to_string(): mc_answer("b"), q2.to_string(): mc_answer("a")}});
    let second = submit(&engine, user, created.session.id, flipped).await.unwrap();

    assert_eq!(second.message, ALREADY_COMPLETED);
    assert!(second.results.is_empty());
    assert_eq!(second.score, first.score);
    assert_eq!(second.total_attempted, first.total_attempted);
    assert_eq!(second.total_correct, first.total_correct);
    assert_eq!(engine.db.get_attempts_for_session(created.session.id).await.unwrap().len(), 2);

    // A completed session answers even when the body would not validate
    let garbage = submit(&engine, user, created.session.id, json!({"nope": 1})).await.unwrap();
    assert_eq!(garbage.message, ALREADY_COMPLETED);
}

#[tokio::test]
async fn test_fresh_topic_mastery_after_one_wrong_answer() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(1, 4.0, 1.0).await;
    let created = engine.create(user, 1).await;

    submit(
        &engine,
        user,
        created.session.id,
        json!({"answers": {created.questions[0].id.to_string(): mc_answer("b")}}),
    )
    .await
    .unwrap();

    let mastery = engine.state.mastery.list_for_user(user).await.unwrap();
    assert_eq!(mastery.len(), 1);
    assert_eq!(mastery[0].topic_id, engine.topic_id);
    assert_eq!(mastery[0].questions_attempted, 1);
    assert_eq!(mastery[0].questions_correct, 0);
    assert_eq!(mastery[0].accuracy_percentage, 0);
    assert_eq!(mastery[0].mastery_level, MasteryLevel::Beginner);
}

#[tokio::test]
async fn test_partial_submission_completes_session() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(3, 2.0, 0.5).await;
    let created = engine.create(user, 3).await;
    let answered = created.questions[1].id;
    let outsider = Uuid::new_v4();

    let result = submit(
        &engine,
        user,
        created.session.id,
        json!({
            "answers": {answered.to_string(): mc_answer("b"), outsider.to_string(): mc_answer("a")},
            "timing_data": {"total_duration": 300, "question_times": {answered.to_string(): 42}}
        }),
    )
    .await
    .unwrap();

    assert!(result.is_completed);
    assert_eq!(result.total_attempted, 1);
    assert_eq!(result.score, -0.5);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].question_id, answered);

    let stored = engine.db.get_session(created.session.id, user).await.unwrap().unwrap();
    assert_eq!(stored.duration, Some(300));
    let links = engine.db.get_session_questions(created.session.id).await.unwrap();
    let link = links.iter().find(|l| l.question_id == answered).unwrap();
    assert_eq!(link.time_spent, Some(42));
}

#[tokio::test]
async fn test_malformed_details_are_skipped_not_scored() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    let broken = engine
        .seed_question(QuestionKind::MultipleChoice, r#"{"options":[{"id":"a","text":"A"}]}"#.to_string(), 4.0, 1.0)
        .await;
    let created = engine.create(user, 1).await;

    let result = submit(
        &engine,
        user,
        created.session.id,
        json!({"answers": {broken.id.to_string(): mc_answer("a")}}),
    )
    .await
    .unwrap();

    assert_eq!(result.skipped_question_ids, vec![broken.id]);
    assert!(result.results.is_empty());
    assert_eq!(result.total_attempted, 0);
    assert_eq!(result.score, 0.0);
    assert!(engine.state.mastery.list_for_user(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_answer_of_wrong_kind_is_skipped() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(1, 4.0, 1.0).await;
    let created = engine.create(user, 1).await;
    let question = created.questions[0].id;

    let result = submit(
        &engine,
        user,
        created.session.id,
        json!({"answers": {question.to_string(): {"type": "sequence_ordering", "sequence": ["a"]}}}),
    )
    .await
    .unwrap();

    assert_eq!(result.skipped_question_ids, vec![question]);
    assert_eq!(result.total_attempted, 0);
}

#[tokio::test]
async fn test_invalid_body_leaves_session_open() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(1, 4.0, 1.0).await;
    let created = engine.create(user, 1).await;
    let question = created.questions[0].id;

    let result = submit(
        &engine,
        user,
        created.session.id,
        json!({"answers": {question.to_string(): {"type": "multiple_choice", "selected_option": ""}}}),
    )
    .await;

    assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    let stored = engine.db.get_session(created.session.id, user).await.unwrap().unwrap();
    assert!(!stored.is_completed);
}

#[tokio::test]
async fn test_submission_is_owner_scoped() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(1, 4.0, 1.0).await;
    let created = engine.create(user, 1).await;
    let body = json!({"answers": {created.questions[0].id.to_string(): mc_answer("a")}});

    let result = submit(&engine, Uuid::new_v4(), created.session.id, body.clone()).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    let missing = submit(&engine, user, Uuid::new_v4(), body).await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));

    let stored = engine.db.get_session(created.session.id, user).await.unwrap().unwrap();
    assert!(!stored.is_completed);
}

#[tokio::test]
async fn test_submission_invalidates_session_caches() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(1, 4.0, 1.0).await;
    let created = engine.create(user, 1).await;

    let before = engine.state.sessions.get_session(user, created.session.id).await.unwrap();
    assert!(!before.session.is_completed);
    engine.state.sessions.list_sessions(user, 20).await;

    submit(
        &engine,
        user,
        created.session.id,
        json!({"answers": {created.questions[0].id.to_string(): mc_answer("a")}}),
    )
    .await
    .unwrap();

    let detail_key = session_detail_key(user, created.session.id);
    assert_eq!(engine.cache.get(&detail_key).await.unwrap(), None);
    assert_eq!(engine.cache.get(&session_list_key(user, 20)).await.unwrap(), None);

    let after = engine.state.sessions.get_session(user, created.session.id).await.unwrap();
    assert!(after.session.is_completed);
    let listed = engine.state.sessions.list_sessions(user, 20).await;
    assert_eq!(listed.source, DataSource::Database);
    assert!(listed.data[0].is_completed);
}
