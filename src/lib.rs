pub mod logging;

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod evaluator;
pub mod mastery;
pub mod models;
pub mod question_pool;
pub mod quota;
pub mod resilience;
pub mod session_service;
pub mod submission;


pub use cache::{Cache, MemoryCache};
pub use config::Config;
pub use database::Database;
pub use errors::*;
pub use evaluator::{evaluate, EvaluationError};
pub use mastery::TopicMasteryUpdater;
pub use models::*;
pub use question_pool::{QuestionPool, QuestionStore};
pub use quota::{DatabaseQuotaService, QuotaGate, QuotaService};
pub use session_service::SessionManager;
pub use submission::SubmissionPipeline;
