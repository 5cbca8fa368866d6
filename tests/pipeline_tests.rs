//! End-to-end pipeline behavior against mocked mailbox and model backends

mod common;

use common::*;
use gmail_labeller::cache::{ClassificationCache, FileCacheStore};
use gmail_labeller::error::{FailureKind, LabellerError};
use gmail_labeller::label_manager::LabelRegistry;
use gmail_labeller::models::{DropReason, LabelAction};
use gmail_labeller::orchestrator::{RunOrchestrator, RunSignal};
use gmail_labeller::state::MessageState;
use gmail_labeller::store::FileResultStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn predefined_registry(ctx: &gmail_labeller::RunContext, account: &[gmail_labeller::LabelInfo]) -> LabelRegistry {
    LabelRegistry::for_mode(&ctx.label_mode, account)
}

#[tokio::test]
async fn test_electricity_bill_gets_utilities_with_one_apply_call() {
    let ctx = predefined_context(&["Financials", "Utilities", "Personal"]);

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_list_unread()
        .times(1)
        .returning(|_| Ok(vec![electricity_bill("m1")]));
    mailbox.expect_list_labels().times(1).returning(|| {
        Ok(vec![
            system_label("INBOX"),
            user_label("Label_7", "Utilities"),
            user_label("Label_9", "Financials"),
        ])
    });
    mailbox.expect_create_label().times(0);
    mailbox
        .expect_apply_labels()
        .withf(|id: &str, ids: &[String]| id == "m1" && ids.to_vec() == vec!["Label_7".to_string()])
        .times(1)
        .returning(|_, _| Ok(()));

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .withf(|prompt: &str, _| prompt.contains("$84.20") && prompt.contains("Utilities"))
        .times(1)
        .returning(|_, _| Ok(categories_json(&["Utilities"])));

    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .run(&RunSignal::unbounded())
        .await
        .unwrap();

    assert_eq!(outcome.records.len(), 1);
    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Applied);
    assert_eq!(record.resolved.as_ref().unwrap().names(), vec!["Utilities"]);
    assert_eq!(
        record.action,
        Some(LabelAction::Applied {
            label_ids: vec!["Label_7".to_string()]
        })
    );
    assert_eq!(outcome.run.messages_applied, 1);
    assert!(outcome.run.labels_created.is_empty());
}

#[tokio::test]
async fn test_unknown_category_in_predefined_mode_is_dropped_and_skipped() {
    let ctx = predefined_context(&["Financials", "Utilities", "Personal"]);

    let mut mailbox = MockMailbox::new();
    mailbox.expect_create_label().times(0);
    mailbox.expect_apply_labels().times(0);

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .times(1)
        .returning(|_, _| Ok(categories_json(&["Promotions"])));

    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![promotion("p1")], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Skipped);
    assert_eq!(record.action, Some(LabelAction::NoLabels));
    assert_eq!(record.dropped.len(), 1);
    assert_eq!(record.dropped[0].raw, "Promotions");
    assert_eq!(record.dropped[0].reason, DropReason::NotPredefined);
    assert_eq!(
        record.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::LabelResolution)
    );
}

#[tokio::test]
async fn test_none_answer_skips_without_a_cause() {
    let ctx = predefined_context(&["Work"]);

    let mut mailbox = MockMailbox::new();
    mailbox.expect_apply_labels().times(0);

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .returning(|_, _| Ok(categories_json(&["NONE"])));

    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![promotion("p1")], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Skipped);
    assert!(record.dropped.is_empty());
    assert!(record.failure.is_none());
}

#[tokio::test]
async fn test_retryable_failures_use_exactly_the_attempt_budget() {
    let ctx = context(|config| {
        config.labels.predefined = vec!["Utilities".to_string()];
        config.retry.max_attempts = 3;
        config.execution.dry_run = false;
    });

    let mut mailbox = MockMailbox::new();
    mailbox.expect_apply_labels().times(0);

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .times(3)
        .returning(|_, _| Err(retryable_error()));

    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![electricity_bill("m1")], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Failed);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::RetryExhausted);
    assert!(failure.message.contains("3 attempts"));
    assert_eq!(outcome.run.failed_message_ids, vec!["m1".to_string()]);
}

#[tokio::test]
async fn test_non_retryable_failure_short_circuits() {
    let ctx = predefined_context(&["Utilities"]);

    let mut mailbox = MockMailbox::new();
    mailbox.expect_apply_labels().times(0);

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .times(1)
        .returning(|_, _| Err(non_retryable_error()));

    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![electricity_bill("m1")], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Failed);
    assert_eq!(
        record.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::ModelCall)
    );
}

#[tokio::test]
async fn test_dry_run_never_touches_the_mailbox() {
    let ctx = context(|config| {
        config.labels.predefined = vec!["Financials".to_string(), "Utilities".to_string()];
    });
    assert!(ctx.dry_run);

    let mut mailbox = MockMailbox::new();
    mailbox.expect_create_label().times(0);
    mailbox.expect_apply_labels().times(0);

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .times(1)
        .returning(|_, _| Ok(categories_json(&["Utilities", "Financials"])));

    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![electricity_bill("m1")], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Skipped);
    assert_eq!(
        record.action,
        Some(LabelAction::DryRun {
            labels: vec!["Utilities".to_string(), "Financials".to_string()]
        })
    );
    assert!(outcome.run.dry_run);
}

#[tokio::test]
async fn test_model_auth_error_aborts_the_run() {
    let ctx = predefined_context(&["Utilities"]);

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_list_unread()
        .returning(|_| Ok(vec![electricity_bill("m1"), promotion("p1")]));
    mailbox.expect_list_labels().returning(|| Ok(vec![]));
    mailbox.expect_apply_labels().times(0);

    let mut gateway = MockGateway::new();
    gateway.expect_generate().returning(|_, _| {
        Err(LabellerError::AuthError(
            "openai rejected credentials: Incorrect API key provided".to_string(),
        ))
    });

    let result = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .run(&RunSignal::unbounded())
        .await;

    assert!(matches!(result, Err(LabellerError::AuthError(_))));
}

#[tokio::test]
async fn test_mailbox_auth_error_aborts_before_processing() {
    let ctx = predefined_context(&["Utilities"]);

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_list_unread()
        .returning(|_| Err(LabellerError::AuthError("token expired".to_string())));
    let mut gateway = MockGateway::new();
    gateway.expect_generate().times(0);

    let result = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .run(&RunSignal::unbounded())
        .await;

    assert!(matches!(result, Err(LabellerError::AuthError(_))));
}

#[tokio::test]
async fn test_cancelled_run_marks_messages_failed() {
    let ctx = predefined_context(&["Utilities"]);

    let mut mailbox = MockMailbox::new();
    mailbox.expect_apply_labels().times(0);
    let mut gateway = MockGateway::new();
    gateway.expect_generate().times(0);

    let signal = RunSignal::unbounded();
    signal.cancel();

    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(
            vec![electricity_bill("m1"), promotion("p1")],
            registry,
            &signal,
        )
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.count(MessageState::Failed), 2);
    for record in &outcome.records {
        assert_eq!(
            record.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::Cancelled)
        );
    }
}

#[tokio::test]
async fn test_one_failing_message_does_not_stop_the_others() {
    let ctx = predefined_context(&["Utilities"]);

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_apply_labels()
        .withf(|id: &str, _| id == "m1")
        .times(1)
        .returning(|_, _| Ok(()));
    mailbox
        .expect_create_label()
        .times(1)
        .returning(|_| Ok("Label_new".to_string()));

    let mut gateway = MockGateway::new();
    gateway.expect_generate().returning(|prompt: &str, _| {
        if prompt.contains("50% off") {
            Ok("I think this is a promotion".to_string())
        } else {
            Ok(categories_json(&["Utilities"]))
        }
    });

    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(
            vec![electricity_bill("m1"), promotion("p1")],
            registry,
            &RunSignal::unbounded(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.count(MessageState::Applied), 1);
    assert_eq!(outcome.count(MessageState::Failed), 1);
    // newest first
    assert_eq!(outcome.records[0].message_id, "p1");
    assert_eq!(
        outcome.records[0].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::RetryExhausted)
    );
    // predefined label missing from the mailbox is created on first use
    assert_eq!(outcome.run.labels_created, vec!["Utilities".to_string()]);
}

#[tokio::test]
async fn test_empty_message_is_skipped_at_extraction() {
    let ctx = predefined_context(&["Utilities"]);

    let mailbox = MockMailbox::new();
    let mut gateway = MockGateway::new();
    gateway.expect_generate().times(0);

    let empty = create_test_message("e1", 3, "someone@example.com", "(no subject)", "   ");
    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![empty], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Skipped);
    assert_eq!(
        record.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Extraction)
    );
    assert_eq!(record.history.len(), 2);
}

#[tokio::test]
async fn test_full_content_summarizes_before_classifying() {
    let ctx = context(|config| {
        config.labels.predefined = vec!["News".to_string()];
        config.fetch.use_full_content = true;
    });
    assert!(ctx.summarize);

    let mailbox = MockMailbox::new();
    let mut gateway = MockGateway::new();
    let mut seq = mockall::Sequence::new();
    gateway
        .expect_generate()
        .withf(|prompt: &str, config| {
            prompt.contains("Rates held steady") && !prompt.contains("tracking()") && config.temperature > 0.0
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| {
            Ok(r#"{"summary": "The central bank held rates steady.", "entities": ["central bank"]}"#
                .to_string())
        });
    gateway
        .expect_generate()
        .withf(|prompt: &str, config| {
            prompt.contains("The central bank held rates steady.") && config.temperature == 0.0
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(categories_json(&["News"])));

    let message = html_message(
        "h1",
        "<html><head><style>p { color: red }</style></head><body><p>Rates held steady</p>\
         <script>tracking()</script></body></html>",
    );
    let registry = predefined_registry(&ctx, &[]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![message], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Skipped);
    let summary = record.summary.as_ref().unwrap();
    assert_eq!(summary.prompt_version.as_deref(), Some("summarize@2"));
    assert_eq!(record.resolved.as_ref().unwrap().names(), vec!["News"]);
}

#[tokio::test]
async fn test_open_ended_classification_creates_nested_label() {
    let ctx = context(|config| {
        config.labels.create_labels = true;
        config.execution.dry_run = false;
    });

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_list_unread()
        .returning(|_| Ok(vec![electricity_bill("m1")]));
    mailbox
        .expect_list_labels()
        .returning(|| Ok(vec![system_label("INBOX"), system_label("UNREAD")]));
    mailbox
        .expect_create_label()
        .times(2)
        .returning(|name: &str| Ok(format!("id:{}", name)));
    mailbox
        .expect_apply_labels()
        .withf(|_, ids: &[String]| ids.to_vec() == vec!["id:Utilities/Bills".to_string()])
        .times(1)
        .returning(|_, _| Ok(()));

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .withf(|prompt: &str, _| prompt.contains("Major/Minor"))
        .times(1)
        .returning(|_, _| {
            Ok(
                r#"{"categories": [], "category_major": "Utilities", "category_minor": "Bills"}"#
                    .to_string(),
            )
        });

    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .run(&RunSignal::unbounded())
        .await
        .unwrap();

    assert_eq!(outcome.records[0].state, MessageState::Applied);
    assert_eq!(outcome.run.labels_created, vec!["Utilities/Bills".to_string()]);
    assert_eq!(outcome.labels, vec!["Utilities/Bills".to_string()]);
}

#[tokio::test]
async fn test_open_ended_prompt_is_kept_for_the_whole_run() {
    let ctx = context(|config| {
        config.labels.create_labels = true;
        config.execution.dry_run = false;
        config.execution.max_concurrent = 1;
    });

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_list_unread()
        .returning(|_| Ok(vec![electricity_bill("m1"), electricity_bill("m2")]));
    mailbox
        .expect_list_labels()
        .returning(|| Ok(vec![system_label("INBOX")]));
    mailbox
        .expect_create_label()
        .times(2)
        .returning(|name: &str| Ok(format!("id:{}", name)));
    mailbox
        .expect_apply_labels()
        .withf(|_, ids: &[String]| ids.to_vec() == vec!["id:Utilities/Bills".to_string()])
        .times(2)
        .returning(|_, _| Ok(()));

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .withf(|prompt: &str, _| prompt.contains("Major/Minor"))
        .times(2)
        .returning(|_, _| {
            Ok(
                r#"{"categories": [], "category_major": "Utilities", "category_minor": "Bills"}"#
                    .to_string(),
            )
        });

    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .run(&RunSignal::unbounded())
        .await
        .unwrap();

    assert_eq!(outcome.count(MessageState::Applied), 2);
    for record in &outcome.records {
        assert_eq!(record.classification.as_ref().unwrap().prompt_version, "classify-open@1");
    }
}

#[tokio::test]
async fn test_concurrent_workers_create_a_new_label_once() {
    let ctx = context(|config| {
        config.labels.create_labels = true;
        config.execution.dry_run = false;
        config.execution.max_concurrent = 4;
    });

    let mut mailbox = MockMailbox::new();
    mailbox.expect_list_unread().returning(|_| {
        Ok(vec![
            create_test_message("t1", 2, "trips@air.example", "Your flight to Lisbon", "Boarding pass for TP 1351"),
            create_test_message("t2", 3, "stay@hotel.example", "Booking confirmed", "Two nights in Porto"),
            create_test_message("t3", 4, "cars@rent.example", "Rental pickup", "Pick up your car at 10:00"),
        ])
    });
    mailbox
        .expect_list_labels()
        .returning(|| Ok(vec![system_label("INBOX"), user_label("Label_1", "Work")]));
    mailbox
        .expect_create_label()
        .withf(|name: &str| name == "Travel")
        .times(1)
        .returning(|_| Ok("Label_T".to_string()));
    mailbox
        .expect_apply_labels()
        .withf(|_, ids: &[String]| ids.to_vec() == vec!["Label_T".to_string()])
        .times(3)
        .returning(|_, _| Ok(()));

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .times(3)
        .returning(|_, _| Ok(categories_json(&["Travel"])));

    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .run(&RunSignal::unbounded())
        .await
        .unwrap();

    assert_eq!(outcome.count(MessageState::Applied), 3);
    assert_eq!(outcome.run.labels_created, vec!["Travel".to_string()]);
}

#[tokio::test]
async fn test_deadline_during_backoff_cancels_in_flight_messages() {
    let ctx = context(|config| {
        config.labels.predefined = vec!["Utilities".to_string()];
        config.execution.dry_run = false;
        config.retry.initial_backoff_ms = 5_000;
        config.retry.max_backoff_ms = 5_000;
    });

    let mut mailbox = MockMailbox::new();
    mailbox.expect_apply_labels().times(0);
    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .returning(|_, _| Err(retryable_error()));

    let signal = RunSignal::new(CancellationToken::new(), Some(Duration::from_millis(100)));
    let registry = predefined_registry(&ctx, &[]);
    let started = Instant::now();
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(
            vec![electricity_bill("m1"), promotion("p1")],
            registry,
            &signal,
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(outcome.cancelled);
    assert_eq!(outcome.count(MessageState::Failed), 2);
    for record in &outcome.records {
        assert_eq!(
            record.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::Cancelled)
        );
    }
}

#[tokio::test]
async fn test_account_labels_without_creation_drop_unknown() {
    let ctx = context(|config| {
        config.labels.use_user_labels = true;
        config.execution.dry_run = false;
    });

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_list_unread()
        .returning(|_| Ok(vec![electricity_bill("m1")]));
    mailbox
        .expect_list_labels()
        .returning(|| Ok(vec![system_label("INBOX"), user_label("Label_3", "Bills")]));
    mailbox.expect_create_label().times(0);
    mailbox
        .expect_apply_labels()
        .withf(|_, ids: &[String]| ids.to_vec() == vec!["Label_3".to_string()])
        .times(1)
        .returning(|_, _| Ok(()));

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .withf(|prompt: &str, _| prompt.contains("Bills") && !prompt.contains("INBOX"))
        .returning(|_, _| Ok(categories_json(&["bills", "Energy"])));

    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .run(&RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Applied);
    assert_eq!(record.dropped.len(), 1);
    assert_eq!(record.dropped[0].reason, DropReason::NotInAccount);
}

#[tokio::test]
async fn test_apply_failure_marks_message_failed() {
    let ctx = predefined_context(&["Utilities"]);

    let mut mailbox = MockMailbox::new();
    mailbox.expect_apply_labels().returning(|_, _| {
        Err(LabellerError::ServerError {
            status: 500,
            message: "backend error".to_string(),
        })
    });

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .returning(|_, _| Ok(categories_json(&["Utilities"])));

    let registry = predefined_registry(&ctx, &[user_label("Label_7", "Utilities")]);
    let outcome = RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .process_batch(vec![electricity_bill("m1")], registry, &RunSignal::unbounded())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.state, MessageState::Failed);
    assert_eq!(
        record.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::MailboxApply)
    );
}

#[tokio::test]
async fn test_cache_hit_skips_model_on_second_run() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("cache.json");

    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .times(1)
        .returning(|_, _| Ok(categories_json(&["Utilities"])));
    let gateway = Arc::new(gateway);

    for run in 0..2 {
        let ctx = context(|config| {
            config.labels.predefined = vec!["Utilities".to_string()];
            config.cache.enabled = true;
        });
        let store = FileCacheStore::open(&cache_path).await.unwrap();
        let cache = Arc::new(ClassificationCache::new(16, Box::new(store)));
        let registry = predefined_registry(&ctx, &[]);

        let outcome = RunOrchestrator::new(ctx, Arc::new(MockMailbox::new()), gateway.clone())
            .with_cache(cache)
            .process_batch(vec![electricity_bill("m1")], registry, &RunSignal::unbounded())
            .await
            .unwrap();

        let record = &outcome.records[0];
        assert_eq!(record.cache_hit, run == 1, "run {}", run);
        assert_eq!(record.resolved.as_ref().unwrap().names(), vec!["Utilities"]);
        assert_eq!(outcome.run.cache_hits, run);
    }
}

#[tokio::test]
async fn test_records_are_persisted_once_per_message() {
    let dir = TempDir::new().unwrap();
    let ctx = predefined_context(&["Utilities"]);
    let run_id = ctx.run_id.clone();

    let mut mailbox = MockMailbox::new();
    mailbox.expect_apply_labels().returning(|_, _| Ok(()));
    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .returning(|_, _| Ok(categories_json(&["Utilities"])));

    let store = Arc::new(FileResultStore::new(dir.path(), true));
    let registry = predefined_registry(&ctx, &[user_label("Label_7", "Utilities")]);
    RunOrchestrator::new(ctx, Arc::new(mailbox), Arc::new(gateway))
        .with_store(store)
        .process_batch(
            vec![electricity_bill("m1"), promotion("p1")],
            registry,
            &RunSignal::unbounded(),
        )
        .await
        .unwrap();

    let run_dir = dir.path().join(&run_id);
    assert!(run_dir.join("messages/m1.json").exists());
    assert!(run_dir.join("messages/p1.json").exists());
    assert!(run_dir.join("run.json").exists());
}
