use proptest::prelude::*;
use std::io::Write;
use task_orchestrator::config::QuestionTimeoutMode;
use task_orchestrator::{JobKind, OrchestratorConfig, OrchestratorError};

proptest! {
    #[test]
    fn prop_sliding_timeout_below_floor_rejected(ms in 0u64..1_000) {
        let config = OrchestratorConfig::default();
        let result = config.sliding_timeout_for(JobKind::Interactive, Some(ms));
        prop_assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[test]
    fn prop_sliding_timeout_above_ceiling_rejected(ms in 86_400_001u64..u64::MAX) {
        let config = OrchestratorConfig::default();
        let result = config.sliding_timeout_for(JobKind::Interactive, Some(ms));
        prop_assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[test]
    fn prop_sliding_timeout_in_range_accepted(ms in 1_000u64..=86_400_000) {
        let config = OrchestratorConfig::default();
        let timeout = config.sliding_timeout_for(JobKind::Interactive, Some(ms)).unwrap();
        prop_assert_eq!(timeout.as_millis() as u64, ms);
    }

    #[test]
    fn prop_quick_query_ceiling(ms in 300_001u64..86_400_000) {
        let config = OrchestratorConfig::default();
        prop_assert!(config.sliding_timeout_for(JobKind::QuickQuery, Some(ms)).is_err());
        prop_assert!(config.sliding_timeout_for(JobKind::Interactive, Some(ms)).is_ok());
    }
}

#[test]
fn test_yaml_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "default_sliding_timeout_ms: 60000\n\
         question_timeout_ms: 15000\n\
         question_timeout_policy: fallback\n\
         question_fallback_answer: skip\n\
         max_pending_questions: 3"
    )
    .unwrap();

    let config = OrchestratorConfig::from_file(file.path()).unwrap();
    assert_eq!(config.default_sliding_timeout_ms, 60_000);
    assert_eq!(config.question_timeout_ms, 15_000);
    assert_eq!(config.question_timeout_policy, QuestionTimeoutMode::Fallback);
    assert_eq!(config.max_pending_questions, 3);
    assert_eq!(config.max_turns, 25);
}

#[test]
fn test_invalid_yaml_config_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "default_sliding_timeout_ms: 500").unwrap();
    assert!(matches!(
        OrchestratorConfig::from_file(file.path()),
        Err(OrchestratorError::Validation(_))
    ));
}
