use super::*;
use crate::events::payload;
use serde_json::json;

fn context(values: Value) -> RuleContext {
    RuleContext::for_test(payload(values), 12, 2)
}

fn condition(field: ConditionField, operator: Operator, value: Value) -> RuleCondition {
    RuleCondition {
        field,
        operator,
        value,
        case_sensitive: false,
    }
}

fn simple_rule(id: &str, conditions: Vec<RuleCondition>, actions: Vec<RuleAction>) -> Rule {
    Rule {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        enabled: true,
        priority: 0,
        combinator: Combinator::And,
        conditions,
        actions,
        created_at: Utc::now(),
        last_triggered: None,
        trigger_count: 0,
    }
}

fn engine() -> (RulesEngine, mpsc::UnboundedReceiver<RuleCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RulesEngine::new(tx), rx)
}

// --- condition evaluation ---

#[test]
fn contains_is_case_insensitive_by_default() {
    let cond = condition(
        ConditionField::Url,
        Operator::Contains,
        json!("HOST.example"),
    );
    let ctx = context(json!({"url": "https://host.example/v/abc"}));
    assert!(cond.evaluate(&ctx));
}

#[test]
fn case_sensitive_flag_is_honored() {
    let mut cond = condition(ConditionField::Title, Operator::Equals, json!("My Video"));
    cond.case_sensitive = true;
    assert!(cond.evaluate(&context(json!({"title": "My Video"}))));
    assert!(!cond.evaluate(&context(json!({"title": "my video"}))));
}

#[test]
fn domain_is_extracted_from_url() {
    let cond = condition(
        ConditionField::Domain,
        Operator::Equals,
        json!("host.example"),
    );
    let ctx = context(json!({"url": "https://HOST.example/v/abc?x=1"}));
    assert!(cond.evaluate(&ctx));
}

#[test]
fn regex_match_and_not_match() {
    let matches = condition(
        ConditionField::Uploader,
        Operator::Matches,
        json!(".*music.*"),
    );
    let not_matches = condition(
        ConditionField::Uploader,
        Operator::NotMatches,
        json!(".*music.*"),
    );
    let music = context(json!({"uploader": "Epic Music Channel"}));
    let news = context(json!({"uploader": "News Daily"}));

    assert!(matches.evaluate(&music));
    assert!(!matches.evaluate(&news));
    assert!(!not_matches.evaluate(&music));
    assert!(not_matches.evaluate(&news));
}

#[test]
fn invalid_regex_is_false_not_panic() {
    let cond = condition(ConditionField::Title, Operator::Matches, json!("[unclosed"));
    assert!(!cond.evaluate(&context(json!({"title": "anything"}))));
}

#[test]
fn numeric_comparisons() {
    let ctx = context(json!({"duration_seconds": 120}));
    assert!(
        condition(ConditionField::DurationSeconds, Operator::LessThan, json!(300)).evaluate(&ctx)
    );
    assert!(
        !condition(ConditionField::DurationSeconds, Operator::GreaterThan, json!(300))
            .evaluate(&ctx)
    );
    assert!(
        condition(ConditionField::DurationSeconds, Operator::GreaterEqual, json!(120))
            .evaluate(&ctx)
    );
    assert!(
        condition(ConditionField::DurationSeconds, Operator::LessEqual, json!(120)).evaluate(&ctx)
    );
}

#[test]
fn numeric_comparison_parses_string_values() {
    let ctx = context(json!({"file_size": "2048"}));
    assert!(condition(ConditionField::FileSize, Operator::GreaterThan, json!(1024)).evaluate(&ctx));
}

#[test]
fn in_range_is_inclusive() {
    let cond = condition(ConditionField::HourOfDay, Operator::InRange, json!([12, 14]));
    assert!(cond.evaluate(&context(json!({}))), "hour 12 is in [12, 14]");

    let outside = condition(ConditionField::HourOfDay, Operator::InRange, json!([13, 14]));
    assert!(!outside.evaluate(&context(json!({}))));
}

#[test]
fn in_range_with_malformed_value_is_false() {
    let cond = condition(ConditionField::HourOfDay, Operator::InRange, json!([1]));
    assert!(!cond.evaluate(&context(json!({}))));
    let cond = condition(ConditionField::HourOfDay, Operator::InRange, json!("12-14"));
    assert!(!cond.evaluate(&context(json!({}))));
}

#[test]
fn missing_context_value_is_false() {
    let cond = condition(ConditionField::Title, Operator::Contains, json!("x"));
    assert!(!cond.evaluate(&context(json!({}))));
}

#[test]
fn ambient_day_of_week_is_available() {
    let cond = condition(ConditionField::DayOfWeek, Operator::Equals, json!(2));
    assert!(cond.evaluate(&context(json!({}))));
}

// --- rule matching ---

#[test]
fn and_combinator_requires_all_conditions() {
    let rule = simple_rule(
        "r1",
        vec![
            condition(ConditionField::QueueSize, Operator::GreaterThan, json!(10)),
            condition(ConditionField::FileSize, Operator::GreaterThan, json!(100)),
        ],
        vec![],
    );
    assert!(rule.matches(&context(json!({"queue_size": 11, "file_size": 200}))));
    assert!(!rule.matches(&context(json!({"queue_size": 11, "file_size": 50}))));
}

#[test]
fn or_combinator_requires_any_condition() {
    let mut rule = simple_rule(
        "r1",
        vec![
            condition(ConditionField::QueueSize, Operator::GreaterThan, json!(10)),
            condition(ConditionField::FileSize, Operator::GreaterThan, json!(100)),
        ],
        vec![],
    );
    rule.combinator = Combinator::Or;
    assert!(rule.matches(&context(json!({"queue_size": 1, "file_size": 200}))));
    assert!(!rule.matches(&context(json!({"queue_size": 1, "file_size": 1}))));
}

#[test]
fn disabled_rule_never_matches() {
    let mut rule = simple_rule(
        "r1",
        vec![condition(ConditionField::QueueSize, Operator::GreaterEqual, json!(0))],
        vec![],
    );
    rule.enabled = false;
    assert!(!rule.matches(&context(json!({"queue_size": 5}))));
}

#[test]
fn rule_without_conditions_never_matches() {
    let rule = simple_rule("r1", vec![], vec![]);
    assert!(!rule.matches(&context(json!({"queue_size": 5}))));
}

// --- engine evaluation ---

fn queued_event(data: Value) -> Event {
    Event::new(
        EventType::DownloadQueued,
        "scheduler",
        payload(data),
        Default::default(),
    )
}

#[tokio::test]
async fn matching_rule_posts_commands() {
    let (engine, mut rx) = engine();
    engine
        .add_rule(simple_rule(
            "urgent-host",
            vec![condition(
                ConditionField::Url,
                Operator::Contains,
                json!("host.example"),
            )],
            vec![RuleAction::SetPriority {
                priority: Priority::Urgent,
            }],
        ))
        .await
        .unwrap();

    let matched = engine
        .evaluate(&queued_event(
            json!({"item_id": "abc123", "url": "https://host.example/v/1"}),
        ))
        .await;

    assert_eq!(matched, vec!["urgent-host".to_string()]);
    let command = rx.try_recv().unwrap();
    assert_eq!(
        command,
        RuleCommand::SetPriority {
            item_id: ItemId::new("abc123"),
            priority: Priority::Urgent,
        }
    );
}

#[tokio::test]
async fn rules_evaluate_in_priority_order_without_short_circuit() {
    let (engine, mut rx) = engine();

    let mut low = simple_rule(
        "low",
        vec![condition(ConditionField::Url, Operator::Contains, json!("x"))],
        vec![RuleAction::SetQuality {
            quality: "low-rule".into(),
        }],
    );
    low.priority = 1;
    let mut high = simple_rule(
        "high",
        vec![condition(ConditionField::Url, Operator::Contains, json!("x"))],
        vec![RuleAction::SetQuality {
            quality: "high-rule".into(),
        }],
    );
    high.priority = 10;

    engine.add_rule(low).await.unwrap();
    engine.add_rule(high).await.unwrap();

    let matched = engine
        .evaluate(&queued_event(json!({"item_id": "i1", "url": "https://x/"})))
        .await;

    assert_eq!(
        matched,
        vec!["high".to_string(), "low".to_string()],
        "higher priority rule evaluates first and both fire"
    );

    let first = rx.try_recv().unwrap();
    match first {
        RuleCommand::SetQuality { quality, .. } => assert_eq!(quality, "high-rule"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[tokio::test]
async fn trigger_counters_update_only_on_match() {
    let (engine, _rx) = engine();
    engine
        .add_rule(simple_rule(
            "r1",
            vec![condition(ConditionField::Url, Operator::Contains, json!("match-me"))],
            vec![RuleAction::Notify {
                message: "hit".into(),
                severity: NotifySeverity::Info,
            }],
        ))
        .await
        .unwrap();

    engine
        .evaluate(&queued_event(json!({"url": "https://other/"})))
        .await;
    let rule = engine.get_rule("r1").await.unwrap();
    assert_eq!(rule.trigger_count, 0);
    assert!(rule.last_triggered.is_none());

    engine
        .evaluate(&queued_event(json!({"url": "https://match-me/"})))
        .await;
    let rule = engine.get_rule("r1").await.unwrap();
    assert_eq!(rule.trigger_count, 1);
    assert!(rule.last_triggered.is_some());
}

#[tokio::test]
async fn item_actions_without_item_id_are_skipped() {
    let (engine, mut rx) = engine();
    engine
        .add_rule(simple_rule(
            "r1",
            vec![condition(ConditionField::QueueSize, Operator::GreaterThan, json!(1))],
            vec![
                RuleAction::SetPriority {
                    priority: Priority::High,
                },
                RuleAction::Notify {
                    message: "queue is busy".into(),
                    severity: NotifySeverity::Info,
                },
            ],
        ))
        .await
        .unwrap();

    engine
        .evaluate(&queued_event(json!({"queue_size": 5})))
        .await;

    // Only the notify command arrives; the set_priority had no target
    let command = rx.try_recv().unwrap();
    assert!(matches!(command, RuleCommand::Notify { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_rule_id_is_rejected() {
    let (engine, _rx) = engine();
    engine
        .add_rule(simple_rule("dup", vec![], vec![]))
        .await
        .unwrap();
    let err = engine
        .add_rule(simple_rule("dup", vec![], vec![]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("dup"));
}

#[tokio::test]
async fn enable_disable_and_remove() {
    let (engine, _rx) = engine();
    engine
        .add_rule(simple_rule("r1", vec![], vec![]))
        .await
        .unwrap();

    assert!(engine.set_enabled("r1", false).await);
    assert!(!engine.get_rule("r1").await.unwrap().enabled);
    assert!(!engine.set_enabled("ghost", false).await);

    assert!(engine.remove_rule("r1").await);
    assert!(!engine.remove_rule("r1").await);
    assert!(engine.get_rule("r1").await.is_none());
}

// --- persistence ---

#[tokio::test]
async fn rules_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");

    let (engine, _rx) = engine();
    for rule in RulesEngine::default_rules() {
        engine.add_rule(rule).await.unwrap();
    }
    engine.save_to_file(&path).await.unwrap();

    let (fresh, _rx2) = self::engine();
    let loaded = fresh.load_from_file(&path).await.unwrap();
    assert_eq!(loaded, 5);

    let rules = fresh.list_rules().await;
    assert!(rules.iter().any(|r| r.id == "short_video_priority"));
    assert!(rules.iter().any(|r| r.id == "block_large_files_full_queue"));
}

#[tokio::test]
async fn missing_rules_file_loads_empty() {
    let (engine, _rx) = engine();
    let loaded = engine
        .load_from_file(Path::new("/nonexistent/rules.json"))
        .await
        .unwrap();
    assert_eq!(loaded, 0);
}

#[tokio::test]
async fn invalid_rules_are_skipped_at_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");

    let doc = json!([
        {
            "id": "good",
            "name": "Good",
            "conditions": [
                {"field": "url", "operator": "contains", "value": "x"}
            ],
            "actions": [
                {"action": "set_priority", "priority": "high"}
            ]
        },
        {
            "id": "bad-operator",
            "name": "Bad",
            "conditions": [
                {"field": "url", "operator": "sounds_like", "value": "x"}
            ],
            "actions": []
        },
        {
            "id": "bad-action",
            "name": "Bad",
            "conditions": [],
            "actions": [
                {"action": "launch_rocket"}
            ]
        }
    ]);
    tokio::fs::write(&path, doc.to_string()).await.unwrap();

    let (engine, _rx) = engine();
    let loaded = engine.load_from_file(&path).await.unwrap();
    assert_eq!(loaded, 1, "unknown operator/action must reject only that rule");
    assert!(engine.get_rule("good").await.is_some());
}

#[test]
fn rule_json_uses_stable_tags() {
    let rule = simple_rule(
        "r1",
        vec![condition(ConditionField::DurationSeconds, Operator::LessThan, json!(300))],
        vec![RuleAction::SetPriority {
            priority: Priority::High,
        }],
    );
    let json = serde_json::to_value(&rule).unwrap();
    assert_eq!(json["conditions"][0]["field"], "duration_seconds");
    assert_eq!(json["conditions"][0]["operator"], "less_than");
    assert_eq!(json["actions"][0]["action"], "set_priority");
    assert_eq!(json["combinator"], "AND");
}

#[tokio::test]
async fn default_rules_are_valid_and_loadable() {
    let rules = RulesEngine::default_rules();
    assert_eq!(rules.len(), 5);
    // Every default rule serializes and re-parses
    let json = serde_json::to_string(&rules).unwrap();
    let back: Vec<Rule> = serde_json::from_str(&json).unwrap();
    assert_eq!(back.len(), 5);
}

#[tokio::test]
async fn statistics_reflect_engine_state() {
    let (engine, _rx) = engine();
    engine
        .add_rule(simple_rule(
            "r1",
            vec![condition(ConditionField::Url, Operator::Contains, json!("x"))],
            vec![RuleAction::Notify {
                message: "m".into(),
                severity: NotifySeverity::Info,
            }],
        ))
        .await
        .unwrap();
    let mut disabled = simple_rule("r2", vec![], vec![]);
    disabled.enabled = false;
    engine.add_rule(disabled).await.unwrap();

    engine
        .evaluate(&queued_event(json!({"url": "https://x/"})))
        .await;

    let stats = engine.statistics().await;
    assert_eq!(stats.total_rules, 2);
    assert_eq!(stats.enabled_rules, 1);
    assert_eq!(stats.rules_triggered, 1);
    assert_eq!(stats.actions_executed, 1);
}
