use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Practice,
    Test,
    Review,
    Custom,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Practice => "practice",
            SessionType::Test => "test",
            SessionType::Review => "review",
            SessionType::Custom => "custom",
        }
    }
}

impl FromStr for SessionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "practice" => Ok(SessionType::Practice),
            "test" => Ok(SessionType::Test),
            "review" => Ok(SessionType::Review),
            "custom" => Ok(SessionType::Custom),
            other => Err(anyhow::anyhow!("Unknown session type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subject_id: Uuid,
    pub topic_id: Option<Uuid>,
    pub subtopic_id: Option<Uuid>,
    pub session_type: SessionType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>, // seconds
    pub total_questions: i64,
    pub questions_attempted: i64,
    pub questions_correct: i64,
    pub score: f64,
    pub max_score: f64,
    pub is_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionQuestion {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question_id: Uuid,
    pub question_order: i64,
    pub time_spent: Option<i64>,
}

/// Type tag of a question. Selects both the details shape and the
/// evaluation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    MultipleCorrectStatements,
    AssertionReason,
    Matching,
    SequenceOrdering,
    DiagramBased,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice => "multiple_choice",
            QuestionKind::MultipleCorrectStatements => "multiple_correct_statements",
            QuestionKind::AssertionReason => "assertion_reason",
            QuestionKind::Matching => "matching",
            QuestionKind::SequenceOrdering => "sequence_ordering",
            QuestionKind::DiagramBased => "diagram_based",
        }
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multiple_choice" => Ok(QuestionKind::MultipleChoice),
            "multiple_correct_statements" => Ok(QuestionKind::MultipleCorrectStatements),
            "assertion_reason" => Ok(QuestionKind::AssertionReason),
            "matching" => Ok(QuestionKind::Matching),
            "sequence_ordering" => Ok(QuestionKind::SequenceOrdering),
            "diagram_based" => Ok(QuestionKind::DiagramBased),
            other => Err(anyhow::anyhow!("Unknown question type '{}'", other)),
        }
    }
}

/// A question record as supplied by the question store. `details` stays in
/// its stored JSON form until it is parsed against `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub kind: QuestionKind,
    pub subject_id: Uuid,
    pub topic_id: Option<Uuid>,
    pub subtopic_id: Option<Uuid>,
    pub question_text: String,
    pub marks: f64,
    pub negative_marks: f64,
    pub details: String,
    pub provenance: String,
    pub is_active: bool,
}

impl Question {
    pub fn parse_details(&self) -> Result<QuestionDetails, serde_json::Error> {
        QuestionDetails::parse(self.kind, &self.details)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledItem {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipleChoiceDetails {
    pub options: Vec<ChoiceOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipleCorrectStatementsDetails {
    pub statements: Vec<ChoiceOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionReasonDetails {
    pub assertion: String,
    pub reason: String,
    pub options: Vec<ChoiceOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingDetails {
    pub left_items: Vec<LabeledItem>,
    pub right_items: Vec<LabeledItem>,
    pub correct_pairs: Vec<MatchPair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceOrderingDetails {
    pub items: Vec<LabeledItem>,
    pub correct_sequence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramBasedDetails {
    pub diagram_url: Option<String>,
    pub options: Vec<ChoiceOption>,
}

/// Strongly-typed question payload, one variant per question kind.
#[derive(Debug, Clone, PartialEq)]
pub enum QuestionDetails {
    MultipleChoice(MultipleChoiceDetails),
    MultipleCorrectStatements(MultipleCorrectStatementsDetails),
    AssertionReason(AssertionReasonDetails),
    Matching(MatchingDetails),
    SequenceOrdering(SequenceOrderingDetails),
    DiagramBased(DiagramBasedDetails),
}

impl QuestionDetails {
    pub fn parse(kind: QuestionKind, raw: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            QuestionKind::MultipleChoice => QuestionDetails::MultipleChoice(serde_json::from_str(raw)?),
            QuestionKind::MultipleCorrectStatements => {
                QuestionDetails::MultipleCorrectStatements(serde_json::from_str(raw)?)
            }
            QuestionKind::AssertionReason => QuestionDetails::AssertionReason(serde_json::from_str(raw)?),
            QuestionKind::Matching => QuestionDetails::Matching(serde_json::from_str(raw)?),
            QuestionKind::SequenceOrdering => QuestionDetails::SequenceOrdering(serde_json::from_str(raw)?),
            QuestionKind::DiagramBased => QuestionDetails::DiagramBased(serde_json::from_str(raw)?),
        })
    }

    pub fn kind(&self) -> QuestionKind {
        match self {
            QuestionDetails::MultipleChoice(_) => QuestionKind::MultipleChoice,
            QuestionDetails::MultipleCorrectStatements(_) => QuestionKind::MultipleCorrectStatements,
            QuestionDetails::AssertionReason(_) => QuestionKind::AssertionReason,
            QuestionDetails::Matching(_) => QuestionKind::Matching,
            QuestionDetails::SequenceOrdering(_) => QuestionKind::SequenceOrdering,
            QuestionDetails::DiagramBased(_) => QuestionKind::DiagramBased,
        }
    }

    /// Client-facing copy of the payload with every answer key removed.
    pub fn redacted(&self) -> PresentedDetails {
        fn strip(options: &[ChoiceOption]) -> Vec<PresentedOption> {
            options
                .iter()
                .map(|o| PresentedOption { id: o.id.clone(), text: o.text.clone() })
                .collect()
        }

        match self {
            QuestionDetails::MultipleChoice(d) => PresentedDetails::MultipleChoice { options: strip(&d.options) },
            QuestionDetails::MultipleCorrectStatements(d) => {
                PresentedDetails::MultipleCorrectStatements { statements: strip(&d.statements) }
            }
            QuestionDetails::AssertionReason(d) => PresentedDetails::AssertionReason {
                assertion: d.assertion.clone(),
                reason: d.reason.clone(),
                options: strip(&d.options),
            },
            QuestionDetails::Matching(d) => PresentedDetails::Matching {
                left_items: d.left_items.clone(),
                right_items: d.right_items.clone(),
            },
            QuestionDetails::SequenceOrdering(d) => PresentedDetails::SequenceOrdering { items: d.items.clone() },
            QuestionDetails::DiagramBased(d) => PresentedDetails::DiagramBased {
                diagram_url: d.diagram_url.clone(),
                options: strip(&d.options),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentedOption {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresentedDetails {
    MultipleChoice { options: Vec<PresentedOption> },
    MultipleCorrectStatements { statements: Vec<PresentedOption> },
    AssertionReason { assertion: String, reason: String, options: Vec<PresentedOption> },
    Matching { left_items: Vec<LabeledItem>, right_items: Vec<LabeledItem> },
    SequenceOrdering { items: Vec<LabeledItem> },
    DiagramBased { diagram_url: Option<String>, options: Vec<PresentedOption> },
}

/// A user's answer, tagged with the question kind it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserAnswer {
    MultipleChoice { selected_option: String },
    MultipleCorrectStatements { selected_options: Vec<String> },
    AssertionReason { selected_option: String },
    Matching { pairs: BTreeMap<String, String> },
    SequenceOrdering { sequence: Vec<String> },
    DiagramBased { selected_option: String },
}

impl UserAnswer {
    pub fn kind(&self) -> QuestionKind {
        match self {
            UserAnswer::MultipleChoice { .. } => QuestionKind::MultipleChoice,
            UserAnswer::MultipleCorrectStatements { .. } => QuestionKind::MultipleCorrectStatements,
            UserAnswer::AssertionReason { .. } => QuestionKind::AssertionReason,
            UserAnswer::Matching { .. } => QuestionKind::Matching,
            UserAnswer::SequenceOrdering { .. } => QuestionKind::SequenceOrdering,
            UserAnswer::DiagramBased { .. } => QuestionKind::DiagramBased,
        }
    }
}

/// A session-question link together with the question it points at.
#[derive(Debug, Clone)]
pub struct AssignedQuestion {
    pub session_question: SessionQuestion,
    pub question: Question,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAttempt {
    pub id: Uuid,
    pub session_id: Uuid,
    pub session_question_id: Uuid,
    pub question_id: Uuid,
    pub user_id: Uuid,
    pub user_answer: UserAnswer,
    pub is_correct: bool,
    pub marks_awarded: f64,
    pub time_taken: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryLevel {
    Beginner,
    Intermediate,
    Advanced,
    Mastered,
}

impl MasteryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryLevel::Beginner => "beginner",
            MasteryLevel::Intermediate => "intermediate",
            MasteryLevel::Advanced => "advanced",
            MasteryLevel::Mastered => "mastered",
        }
    }
}

impl FromStr for MasteryLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginner" => Ok(MasteryLevel::Beginner),
            "intermediate" => Ok(MasteryLevel::Intermediate),
            "advanced" => Ok(MasteryLevel::Advanced),
            "mastered" => Ok(MasteryLevel::Mastered),
            other => Err(anyhow::anyhow!("Unknown mastery level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMastery {
    pub user_id: Uuid,
    pub topic_id: Uuid,
    pub questions_attempted: i64,
    pub questions_correct: i64,
    pub accuracy_percentage: i64,
    pub mastery_level: MasteryLevel,
    pub last_practiced: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub subscription_tier: String,
    pub tests_used_today: i64,
    pub tests_used_total: i64,
    pub limit_per_day: i64,
}

impl QuotaState {
    /// Conservative stand-in used when the quota store cannot be read.
    pub fn free_tier_default(limit_per_day: i64) -> Self {
        Self {
            subscription_tier: "free".to_string(),
            tests_used_today: 0,
            tests_used_total: 0,
            limit_per_day,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Filter identifying one question pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolFilter {
    pub subject_id: Uuid,
    pub topic_id: Option<Uuid>,
    pub subtopic_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuestion {
    pub kind: QuestionKind,
    pub subject_id: Uuid,
    pub topic_id: Option<Uuid>,
    pub subtopic_id: Option<Uuid>,
    pub question_text: String,
    pub marks: f64,
    pub negative_marks: f64,
    pub details: String,
    pub provenance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub subject_id: Uuid,
    pub topic_id: Option<Uuid>,
    pub subtopic_id: Option<Uuid>,
    pub session_type: SessionType,
    pub question_count: u32,
}

/// Question as presented to the user at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionView {
    pub id: Uuid,
    pub kind: QuestionKind,
    pub question_text: String,
    pub topic_id: Option<Uuid>,
    pub marks: f64,
    pub negative_marks: f64,
    pub order: i64,
    pub details: Option<PresentedDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session: Session,
    pub questions: Vec<QuestionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: Session,
    pub questions: Vec<SessionQuestion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingData {
    pub total_duration: Option<u32>,
    #[serde(default)]
    pub question_times: HashMap<Uuid, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitAnswersRequest {
    pub answers: HashMap<Uuid, UserAnswer>,
    pub timing_data: Option<TimingData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: Uuid,
    pub is_correct: bool,
    pub marks_awarded: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub session_id: Uuid,
    pub message: String,
    pub is_completed: bool,
    pub total_questions: i64,
    pub total_attempted: i64,
    pub total_correct: i64,
    pub score: f64,
    pub max_score: f64,
    pub results: Vec<QuestionResult>,
    pub skipped_question_ids: Vec<Uuid>,
}

/// Where a read-path value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    Cache,
    Database,
    Stale,
    ErrorDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub data: T,
    pub source: DataSource,
}
