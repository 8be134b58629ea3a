use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::mastery::{accuracy_percentage, level_for};
use crate::models::*;
use crate::question_pool::QuestionStore;
use crate::{log_db_operation, log_performance};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::new_with_options(database_url, 5).await
    }

    pub async fn new_with_options(database_url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL '{}'", database_url))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // Every connection to `sqlite::memory:` is its own database, so an
        // in-memory store is pinned to one connection that is never recycled.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let db = Database { pool };
        db.migrate().await?;
        log_db_operation!(info, "migrate", "database initialized");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS questions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                topic_id TEXT,
                subtopic_id TEXT,
                question_text TEXT NOT NULL,
                marks REAL NOT NULL DEFAULT 1.0,
                negative_marks REAL NOT NULL DEFAULT 0.0,
                details TEXT NOT NULL,
                provenance TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_questions_pool ON questions (subject_id, topic_id, subtopic_id, is_active)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                topic_id TEXT,
                subtopic_id TEXT,
                session_type TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration INTEGER,
                total_questions INTEGER NOT NULL,
                questions_attempted INTEGER NOT NULL DEFAULT 0,
                questions_correct INTEGER NOT NULL DEFAULT 0,
                score REAL NOT NULL DEFAULT 0.0,
                max_score REAL NOT NULL DEFAULT 0.0,
                is_completed INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions (user_id, start_time)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_questions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                question_order INTEGER NOT NULL,
                time_spent INTEGER,
                UNIQUE (session_id, question_id),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE,
                FOREIGN KEY (question_id) REFERENCES questions(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // No unique constraint on (session_id, question_id): duplicates are
        // prevented by the conditional insert in `persist_attempts`.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS question_attempts (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                session_question_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_answer TEXT NOT NULL,
                is_correct INTEGER NOT NULL,
                marks_awarded REAL NOT NULL,
                time_taken INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE,
                FOREIGN KEY (session_question_id) REFERENCES session_questions(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_attempts_session_question ON question_attempts (session_id, question_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topic_mastery (
                user_id TEXT NOT NULL,
                topic_id TEXT NOT NULL,
                questions_attempted INTEGER NOT NULL DEFAULT 0,
                questions_correct INTEGER NOT NULL DEFAULT 0,
                accuracy_percentage INTEGER NOT NULL DEFAULT 0,
                mastery_level TEXT NOT NULL DEFAULT 'beginner',
                last_practiced TEXT NOT NULL,
                PRIMARY KEY (user_id, topic_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_quotas (
                user_id TEXT PRIMARY KEY,
                subscription_tier TEXT NOT NULL DEFAULT 'free',
                tests_used_today INTEGER NOT NULL DEFAULT 0,
                tests_used_total INTEGER NOT NULL DEFAULT 0,
                limit_per_day INTEGER NOT NULL,
                usage_date TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Question operations
    pub async fn insert_question(&self, request: NewQuestion) -> Result<Question> {
        let question = Question {
            id: Uuid::new_v4(),
            kind: request.kind,
            subject_id: request.subject_id,
            topic_id: request.topic_id,
            subtopic_id: request.subtopic_id,
            question_text: request.question_text,
            marks: request.marks,
            negative_marks: request.negative_marks,
            details: request.details,
            provenance: request.provenance,
            is_active: true,
        };

        sqlx::query(
            r#"
            INSERT INTO questions (id, kind, subject_id, topic_id, subtopic_id, question_text,
                                   marks, negative_marks, details, provenance, is_active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)
            "#,
        )
        .bind(question.id.to_string())
        .bind(question.kind.as_str())
        .bind(question.subject_id.to_string())
        .bind(question.topic_id.map(|id| id.to_string()))
        .bind(question.subtopic_id.map(|id| id.to_string()))
        .bind(&question.question_text)
        .bind(question.marks)
        .bind(question.negative_marks)
        .bind(&question.details)
        .bind(&question.provenance)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(question)
    }

    pub async fn set_question_active(&self, question_id: Uuid, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE questions SET is_active = ?1 WHERE id = ?2")
            .bind(is_active)
            .bind(question_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Session operations
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, subject_id, topic_id, subtopic_id, session_type, start_time,
                                  end_time, duration, total_questions, questions_attempted, questions_correct,
                                  score, max_score, is_completed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(session.subject_id.to_string())
        .bind(session.topic_id.map(|id| id.to_string()))
        .bind(session.subtopic_id.map(|id| id.to_string()))
        .bind(session.session_type.as_str())
        .bind(session.start_time.to_rfc3339())
        .bind(session.end_time.map(|d| d.to_rfc3339()))
        .bind(session.duration)
        .bind(session.total_questions)
        .bind(session.questions_attempted)
        .bind(session.questions_correct)
        .bind(session.score)
        .bind(session.max_score)
        .bind(session.is_completed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a session and, through the cascade, its question links.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Link the drawn questions to the session in presentation order and fix
    /// `max_score`, all in one transaction.
    pub async fn insert_session_questions(&self, session_id: Uuid, questions: &[Question]) -> Result<Vec<SessionQuestion>> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut links = Vec::with_capacity(questions.len());
        let mut max_score = 0.0;

        for (index, question) in questions.iter().enumerate() {
            let link = SessionQuestion {
                id: Uuid::new_v4(),
                session_id,
                question_id: question.id,
                question_order: index as i64 + 1,
                time_spent: None,
            };

            sqlx::query(
                "INSERT INTO session_questions (id, session_id, question_id, question_order) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(link.id.to_string())
            .bind(session_id.to_string())
            .bind(question.id.to_string())
            .bind(link.question_order)
            .execute(&mut *tx)
            .await?;

            max_score += question.marks;
            links.push(link);
        }

        sqlx::query("UPDATE sessions SET max_score = ?1 WHERE id = ?2")
            .bind(max_score)
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        log_db_operation!(debug, "insert_session_questions", session_id = session_id, duration_ms = start.elapsed().as_millis() as u64);
        Ok(links)
    }

    pub async fn get_session(&self, session_id: Uuid, user_id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1 AND user_id = ?2")
            .bind(session_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_session(&row)).transpose()
    }

    pub async fn list_sessions(&self, user_id: Uuid, limit: i64) -> Result<Vec<Session>> {
        let start = Instant::now();
        let rows = sqlx::query("SELECT * FROM sessions WHERE user_id = ?1 ORDER BY start_time DESC LIMIT ?2")
            .bind(user_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let sessions = rows.iter().map(row_to_session).collect::<Result<Vec<_>>>()?;
        log_db_operation!(debug, "list_sessions", count = sessions.len(), duration_ms = start.elapsed().as_millis() as u64);
        Ok(sessions)
    }

    pub async fn count_sessions_for_user(&self, user_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sessions WHERE user_id = ?1")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    pub async fn get_session_questions(&self, session_id: Uuid) -> Result<Vec<SessionQuestion>> {
        let rows = sqlx::query("SELECT * FROM session_questions WHERE session_id = ?1 ORDER BY question_order ASC")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_session_question).collect()
    }

    /// Session-question links for `question_ids` joined with their
    /// questions, in presentation order. Ids outside the session are absent.
    pub async fn get_assigned_questions(&self, session_id: Uuid, question_ids: &[Uuid]) -> Result<Vec<AssignedQuestion>> {
        if question_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT sq.id AS sq_id, sq.session_id AS sq_session_id, sq.question_order, sq.time_spent, q.* \
             FROM session_questions sq JOIN questions q ON q.id = sq.question_id WHERE sq.session_id = ",
        );
        query.push_bind(session_id.to_string());
        query.push(" AND sq.question_id IN (");
        let mut ids = query.separated(", ");
        for id in question_ids {
            ids.push_bind(id.to_string());
        }
        ids.push_unseparated(") ORDER BY sq.question_order ASC");

        let rows = query.build().fetch_all(&self.pool).await?;

        let mut assigned = Vec::with_capacity(rows.len());
        for row in rows {
            let question = row_to_question(&row)?;
            assigned.push(AssignedQuestion {
                session_question: SessionQuestion {
                    id: parse_uuid(&row.get::<String, _>("sq_id"))?,
                    session_id: parse_uuid(&row.get::<String, _>("sq_session_id"))?,
                    question_id: question.id,
                    question_order: row.get("question_order"),
                    time_spent: row.get("time_spent"),
                },
                question,
            });
        }
        Ok(assigned)
    }

    /// Which of `question_ids` already have an attempt in this session.
    pub async fn get_attempted_question_ids(&self, session_id: Uuid, question_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        if question_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT DISTINCT question_id FROM question_attempts WHERE session_id = ");
        query.push_bind(session_id.to_string());
        query.push(" AND question_id IN (");
        let mut ids = query.separated(", ");
        for id in question_ids {
            ids.push_bind(id.to_string());
        }
        ids.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| parse_uuid(&row.get::<String, _>("question_id")))
            .collect()
    }

    /// Insert the staged attempts and their time-spent updates in one
    /// transaction. Each insert only happens if no attempt exists yet for
    /// (session, question); returns the question ids actually inserted.
    pub async fn persist_attempts(&self, attempts: &[QuestionAttempt]) -> Result<Vec<Uuid>> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(attempts.len());

        for attempt in attempts {
            let answer_json = serde_json::to_string(&attempt.user_answer)?;
            let result = sqlx::query(
                r#"
                INSERT INTO question_attempts (id, session_id, session_question_id, question_id, user_id,
                                               user_answer, is_correct, marks_awarded, time_taken, created_at)
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
                WHERE NOT EXISTS (
                    SELECT 1 FROM question_attempts WHERE session_id = ?2 AND question_id = ?4
                )
                "#,
            )
            .bind(attempt.id.to_string())
            .bind(attempt.session_id.to_string())
            .bind(attempt.session_question_id.to_string())
            .bind(attempt.question_id.to_string())
            .bind(attempt.user_id.to_string())
            .bind(answer_json)
            .bind(attempt.is_correct)
            .bind(attempt.marks_awarded)
            .bind(attempt.time_taken)
            .bind(attempt.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }

            if let Some(seconds) = attempt.time_taken {
                sqlx::query("UPDATE session_questions SET time_spent = ?1 WHERE id = ?2")
                    .bind(seconds)
                    .bind(attempt.session_question_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
            inserted.push(attempt.question_id);
        }

        tx.commit().await?;
        log_performance!("persist_attempts", duration_ms = start.elapsed().as_millis() as u64, items = inserted.len());
        Ok(inserted)
    }

    pub async fn get_attempts_for_session(&self, session_id: Uuid) -> Result<Vec<QuestionAttempt>> {
        let rows = sqlx::query("SELECT * FROM question_attempts WHERE session_id = ?1 ORDER BY created_at ASC")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in rows {
            attempts.push(QuestionAttempt {
                id: parse_uuid(&row.get::<String, _>("id"))?,
                session_id: parse_uuid(&row.get::<String, _>("session_id"))?,
                session_question_id: parse_uuid(&row.get::<String, _>("session_question_id"))?,
                question_id: parse_uuid(&row.get::<String, _>("question_id"))?,
                user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
                user_answer: serde_json::from_str(&row.get::<String, _>("user_answer"))?,
                is_correct: row.get("is_correct"),
                marks_awarded: row.get("marks_awarded"),
                time_taken: row.get("time_taken"),
                created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            });
        }
        Ok(attempts)
    }

    /// Rebuild the attempt counters and score from the full attempt history.
    pub async fn recompute_session_aggregates(&self, session_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                questions_attempted = (SELECT COUNT(*) FROM question_attempts WHERE session_id = ?1),
                questions_correct = (SELECT COUNT(*) FROM question_attempts WHERE session_id = ?1 AND is_correct = 1),
                score = (SELECT COALESCE(SUM(marks_awarded), 0.0) FROM question_attempts WHERE session_id = ?1)
            WHERE id = ?1
            "#,
        )
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the session completed and return its row. `end_time` is only
    /// set on the first completion, `duration` only when supplied.
    pub async fn complete_session(&self, session_id: Uuid, user_id: Uuid, duration: Option<i64>) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            UPDATE sessions SET
                is_completed = 1,
                end_time = CASE WHEN is_completed = 0 THEN ?1 ELSE end_time END,
                duration = COALESCE(?2, duration)
            WHERE id = ?3 AND user_id = ?4
            RETURNING *
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(duration)
        .bind(session_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_session(&row)).transpose()
    }

    // Topic mastery operations

    /// Apply one attempt to the (user, topic) mastery row, creating it on
    /// first use. The upsert runs first so the transaction takes the write
    /// lock before it reads.
    pub async fn apply_mastery_attempt(&self, user_id: Uuid, topic_id: Uuid, is_correct: bool) -> Result<TopicMastery> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO topic_mastery (user_id, topic_id, questions_attempted, questions_correct,
                                       accuracy_percentage, mastery_level, last_practiced)
            VALUES (?1, ?2, 1, ?3, 0, 'beginner', ?4)
            ON CONFLICT (user_id, topic_id) DO UPDATE SET
                questions_attempted = questions_attempted + 1,
                questions_correct = questions_correct + excluded.questions_correct,
                last_practiced = excluded.last_practiced
            RETURNING questions_attempted, questions_correct
            "#,
        )
        .bind(user_id.to_string())
        .bind(topic_id.to_string())
        .bind(if is_correct { 1i64 } else { 0i64 })
        .bind(now.to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;

        let questions_attempted: i64 = row.get("questions_attempted");
        let questions_correct: i64 = row.get("questions_correct");
        let accuracy = accuracy_percentage(questions_correct, questions_attempted);
        let level = level_for(questions_attempted, accuracy);

        sqlx::query(
            "UPDATE topic_mastery SET accuracy_percentage = ?1, mastery_level = ?2 WHERE user_id = ?3 AND topic_id = ?4",
        )
        .bind(accuracy)
        .bind(level.as_str())
        .bind(user_id.to_string())
        .bind(topic_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TopicMastery {
            user_id,
            topic_id,
            questions_attempted,
            questions_correct,
            accuracy_percentage: accuracy,
            mastery_level: level,
            last_practiced: now,
        })
    }

    pub async fn list_topic_mastery(&self, user_id: Uuid) -> Result<Vec<TopicMastery>> {
        let rows = sqlx::query("SELECT * FROM topic_mastery WHERE user_id = ?1 ORDER BY last_practiced DESC")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut rows_out = Vec::with_capacity(rows.len());
        for row in rows {
            rows_out.push(TopicMastery {
                user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
                topic_id: parse_uuid(&row.get::<String, _>("topic_id"))?,
                questions_attempted: row.get("questions_attempted"),
                questions_correct: row.get("questions_correct"),
                accuracy_percentage: row.get("accuracy_percentage"),
                mastery_level: MasteryLevel::from_str(&row.get::<String, _>("mastery_level"))?,
                last_practiced: parse_timestamp(&row.get::<String, _>("last_practiced"))?,
            });
        }
        Ok(rows_out)
    }

    // Quota operations

    /// Stored quota for the user with `tests_used_today` reset when the
    /// recorded usage day is not `today`.
    pub async fn get_quota(&self, user_id: Uuid, today: &str) -> Result<Option<QuotaState>> {
        let row = sqlx::query(
            r#"
            SELECT subscription_tier,
                   CASE WHEN usage_date = ?2 THEN tests_used_today ELSE 0 END AS tests_used_today,
                   tests_used_total,
                   limit_per_day
            FROM user_quotas WHERE user_id = ?1
            "#,
        )
        .bind(user_id.to_string())
        .bind(today)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| QuotaState {
            subscription_tier: row.get("subscription_tier"),
            tests_used_today: row.get("tests_used_today"),
            tests_used_total: row.get("tests_used_total"),
            limit_per_day: row.get("limit_per_day"),
        }))
    }

    pub async fn increment_quota_usage(&self, user_id: Uuid, default_limit: i64, today: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_quotas (user_id, subscription_tier, tests_used_today, tests_used_total, limit_per_day, usage_date)
            VALUES (?1, 'free', 1, 1, ?2, ?3)
            ON CONFLICT (user_id) DO UPDATE SET
                tests_used_today = CASE WHEN usage_date = excluded.usage_date THEN tests_used_today + 1 ELSE 1 END,
                tests_used_total = tests_used_total + 1,
                usage_date = excluded.usage_date
            "#,
        )
        .bind(user_id.to_string())
        .bind(default_limit)
        .bind(today)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrite a user's quota row, e.g. when their subscription changes.
    pub async fn set_quota(&self, user_id: Uuid, state: &QuotaState, today: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_quotas (user_id, subscription_tier, tests_used_today, tests_used_total, limit_per_day, usage_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (user_id) DO UPDATE SET
                subscription_tier = excluded.subscription_tier,
                tests_used_today = excluded.tests_used_today,
                tests_used_total = excluded.tests_used_total,
                limit_per_day = excluded.limit_per_day,
                usage_date = excluded.usage_date
            "#,
        )
        .bind(user_id.to_string())
        .bind(&state.subscription_tier)
        .bind(state.tests_used_today)
        .bind(state.tests_used_total)
        .bind(state.limit_per_day)
        .bind(today)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QuestionStore for Database {
    async fn list_active_questions(&self, filter: &PoolFilter, provenance: &str) -> Result<Vec<Question>> {
        let start = Instant::now();
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM questions WHERE is_active = 1 AND subject_id = ");
        query.push_bind(filter.subject_id.to_string());
        query.push(" AND provenance = ");
        query.push_bind(provenance.to_string());
        if let Some(topic_id) = filter.topic_id {
            query.push(" AND topic_id = ");
            query.push_bind(topic_id.to_string());
        }
        if let Some(subtopic_id) = filter.subtopic_id {
            query.push(" AND subtopic_id = ");
            query.push_bind(subtopic_id.to_string());
        }
        query.push(" ORDER BY created_at ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        let questions = rows.iter().map(row_to_question).collect::<Result<Vec<_>>>()?;
        log_db_operation!(debug, "list_active_questions", count = questions.len(), duration_ms = start.elapsed().as_millis() as u64);
        Ok(questions)
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid UUID '{}' in database", raw))
}

fn parse_optional_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_uuid).transpose()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn row_to_session(row: &SqliteRow) -> Result<Session> {
    Ok(Session {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
        subject_id: parse_uuid(&row.get::<String, _>("subject_id"))?,
        topic_id: parse_optional_uuid(row.get("topic_id"))?,
        subtopic_id: parse_optional_uuid(row.get("subtopic_id"))?,
        session_type: SessionType::from_str(&row.get::<String, _>("session_type"))?,
        start_time: parse_timestamp(&row.get::<String, _>("start_time"))?,
        end_time: row
            .get::<Option<String>, _>("end_time")
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        duration: row.get("duration"),
        total_questions: row.get("total_questions"),
        questions_attempted: row.get("questions_attempted"),
        questions_correct: row.get("questions_correct"),
        score: row.get("score"),
        max_score: row.get("max_score"),
        is_completed: row.get("is_completed"),
    })
}

fn row_to_session_question(row: &SqliteRow) -> Result<SessionQuestion> {
    Ok(SessionQuestion {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        session_id: parse_uuid(&row.get::<String, _>("session_id"))?,
        question_id: parse_uuid(&row.get::<String, _>("question_id"))?,
        question_order: row.get("question_order"),
        time_spent: row.get("time_spent"),
    })
}

fn row_to_question(row: &SqliteRow) -> Result<Question> {
    Ok(Question {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        kind: QuestionKind::from_str(&row.get::<String, _>("kind"))?,
        subject_id: parse_uuid(&row.get::<String, _>("subject_id"))?,
        topic_id: parse_optional_uuid(row.get("topic_id"))?,
        subtopic_id: parse_optional_uuid(row.get("subtopic_id"))?,
        question_text: row.get("question_text"),
        marks: row.get("marks"),
        negative_marks: row.get("negative_marks"),
        details: row.get("details"),
        provenance: row.get("provenance"),
        is_active: row.get("is_active"),
    })
}
