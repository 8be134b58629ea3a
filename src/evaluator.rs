//! Answer evaluation, one pure function per question kind.

use std::collections::{BTreeMap, HashSet};

use crate::models::*;

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Question details are malformed: {0}")]
    MalformedDetails(String),

    #[error("Answer of kind '{answer}' submitted for a '{question}' question")]
    AnswerKindMismatch { question: QuestionKind, answer: QuestionKind },
}

/// Decide whether `answer` is correct for `question`. Correctness is
/// all-or-nothing.
pub fn evaluate(question: &Question, answer: &UserAnswer) -> Result<bool, EvaluationError> {
    let details = question
        .parse_details()
        .map_err(|e| EvaluationError::MalformedDetails(e.to_string()))?;
    evaluate_details(&details, answer)
}

pub fn evaluate_details(details: &QuestionDetails, answer: &UserAnswer) -> Result<bool, EvaluationError> {
    match (details, answer) {
        (QuestionDetails::MultipleChoice(d), UserAnswer::MultipleChoice { selected_option }) => {
            single_correct_option(&d.options, selected_option)
        }
        (
            QuestionDetails::MultipleCorrectStatements(d),
            UserAnswer::MultipleCorrectStatements { selected_options },
        ) => correct_statement_set(d, selected_options),
        (QuestionDetails::AssertionReason(d), UserAnswer::AssertionReason { selected_option }) => {
            single_correct_option(&d.options, selected_option)
        }
        (QuestionDetails::Matching(d), UserAnswer::Matching { pairs }) => matching_pairs(d, pairs),
        (QuestionDetails::SequenceOrdering(d), UserAnswer::SequenceOrdering { sequence }) => {
            sequence_order(d, sequence)
        }
        (QuestionDetails::DiagramBased(d), UserAnswer::DiagramBased { selected_option }) => {
            single_correct_option(&d.options, selected_option)
        }
        (details, answer) => Err(EvaluationError::AnswerKindMismatch {
            question: details.kind(),
            answer: answer.kind(),
        }),
    }
}

fn single_correct_option(options: &[ChoiceOption], selected: &str) -> Result<bool, EvaluationError> {
    let correct = options
        .iter()
        .find(|o| o.is_correct)
        .ok_or_else(|| EvaluationError::MalformedDetails("no option is flagged correct".to_string()))?;
    Ok(correct.id == selected)
}

fn correct_statement_set(
    details: &MultipleCorrectStatementsDetails,
    selected: &[String],
) -> Result<bool, EvaluationError> {
    let correct: HashSet<&str> = details
        .statements
        .iter()
        .filter(|s| s.is_correct)
        .map(|s| s.id.as_str())
        .collect();
    if correct.is_empty() {
        return Err(EvaluationError::MalformedDetails("no statement is flagged correct".to_string()));
    }
    let chosen: HashSet<&str> = selected.iter().map(String::as_str).collect();
    Ok(chosen == correct)
}

fn matching_pairs(details: &MatchingDetails, submitted: &BTreeMap<String, String>) -> Result<bool, EvaluationError> {
    if details.correct_pairs.is_empty() {
        return Err(EvaluationError::MalformedDetails("matching question has no correct pairs".to_string()));
    }
    let correct: BTreeMap<&str, &str> = details
        .correct_pairs
        .iter()
        .map(|p| (p.left.as_str(), p.right.as_str()))
        .collect();
    let submitted: BTreeMap<&str, &str> = submitted.iter().map(|(l, r)| (l.as_str(), r.as_str())).collect();
    Ok(submitted == correct)
}

fn sequence_order(details: &SequenceOrderingDetails, submitted: &[String]) -> Result<bool, EvaluationError> {
    if details.correct_sequence.is_empty() {
        return Err(EvaluationError::MalformedDetails("ordering question has no correct sequence".to_string()));
    }
    Ok(details.correct_sequence.as_slice() == submitted)
}

/// Marks for one evaluated answer: full marks when correct, minus the
/// negative marks otherwise. Unanswered questions never reach here.
pub fn marks_awarded(question: &Question, is_correct: bool) -> f64 {
    if is_correct {
        question.marks
    } else {
        -question.negative_marks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn question(kind: QuestionKind, details: &str) -> Question {
        Question {
            id: Uuid::new_v4(),
            kind,
            subject_id: Uuid::new_v4(),
            topic_id: None,
            subtopic_id: None,
            question_text: "q".to_string(),
            marks: 4.0,
            negative_marks: 1.0,
            details: details.to_string(),
            provenance: "ai_generated".to_string(),
            is_active: true,
        }
    }

    fn mc(selected: &str) -> UserAnswer {
        UserAnswer::MultipleChoice { selected_option: selected.to_string() }
    }

    #[test]
    fn test_single_option_kinds() {
        let q = question(
            QuestionKind::MultipleChoice,
            r#"{"options":[{"id":"a","text":"A"},{"id":"b","text":"B","is_correct":true}]}"#,
        );
        assert!(evaluate(&q, &mc("b")).unwrap());
        assert!(!evaluate(&q, &mc("a")).unwrap());
        assert!(!evaluate(&q, &mc("zzz")).unwrap());

        let q = question(
            QuestionKind::AssertionReason,
            r#"{"assertion":"A","reason":"R","options":[{"id":"1","text":"both true","is_correct":true},{"id":"2","text":"A false"}]}"#,
        );
        assert!(evaluate(&q, &UserAnswer::AssertionReason { selected_option: "1".to_string() }).unwrap());

        let q = question(
            QuestionKind::DiagramBased,
            r#"{"diagram_url":null,"options":[{"id":"x","text":"X","is_correct":true}]}"#,
        );
        assert!(!evaluate(&q, &UserAnswer::DiagramBased { selected_option: "y".to_string() }).unwrap());
    }

    #[test]
    fn test_correct_statements_use_set_equality() {
        let q = question(
            QuestionKind::MultipleCorrectStatements,
            r#"{"statements":[{"id":"s1","text":"1","is_correct":true},{"id":"s2","text":"2"},{"id":"s3","text":"3","is_correct":true}]}"#,
        );
        let answer = |ids: &[&str]| UserAnswer::MultipleCorrectStatements {
            selected_options: ids.iter().map(|s| s.to_string()).collect(),
        };

        assert!(evaluate(&q, &answer(&["s3", "s1"])).unwrap());
        assert!(!evaluate(&q, &answer(&["s1"])).unwrap());
        assert!(!evaluate(&q, &answer(&["s1", "s2", "s3"])).unwrap());
    }

    #[test]
    fn test_matching_and_sequence() {
        let q = question(
            QuestionKind::Matching,
            r#"{"left_items":[{"label":"A","text":"a"},{"label":"B","text":"b"}],
                "right_items":[{"label":"1","text":"one"},{"label":"2","text":"two"}],
                "correct_pairs":[{"left":"A","right":"2"},{"left":"B","right":"1"}]}"#,
        );
        let pairs = |p: &[(&str, &str)]| UserAnswer::Matching {
            pairs: p.iter().map(|(l, r)| (l.to_string(), r.to_string())).collect(),
        };
        assert!(evaluate(&q, &pairs(&[("B", "1"), ("A", "2")])).unwrap());
        assert!(!evaluate(&q, &pairs(&[("A", "2")])).unwrap());

        let q = question(
            QuestionKind::SequenceOrdering,
            r#"{"items":[{"label":"x","text":"x"},{"label":"y","text":"y"}],"correct_sequence":["y","x"]}"#,
        );
        let seq = |s: &[&str]| UserAnswer::SequenceOrdering { sequence: s.iter().map(|s| s.to_string()).collect() };
        assert!(evaluate(&q, &seq(&["y", "x"])).unwrap());
        assert!(!evaluate(&q, &seq(&["x", "y"])).unwrap());
    }

    #[test]
    fn test_malformed_and_mismatched() {
        let broken = question(QuestionKind::MultipleChoice, r#"{"opts":[]}"#);
        assert!(matches!(evaluate(&broken, &mc("a")), Err(EvaluationError::MalformedDetails(_))));

        let no_key = question(QuestionKind::MultipleChoice, r#"{"options":[{"id":"a","text":"A"}]}"#);
        assert!(matches!(evaluate(&no_key, &mc("a")), Err(EvaluationError::MalformedDetails(_))));

        let q = question(
            QuestionKind::MultipleChoice,
            r#"{"options":[{"id":"a","text":"A","is_correct":true}]}"#,
        );
        let wrong_kind = UserAnswer::SequenceOrdering { sequence: vec!["a".to_string()] };
        assert!(matches!(
            evaluate(&q, &wrong_kind),
            Err(EvaluationError::AnswerKindMismatch { question: QuestionKind::MultipleChoice, .. })
        ));
    }

    #[test]
    fn test_marks_sign_rule() {
        let q = question(QuestionKind::MultipleChoice, "{}");
        assert_eq!(marks_awarded(&q, true), 4.0);
        assert_eq!(marks_awarded(&q, false), -1.0);
    }
}
