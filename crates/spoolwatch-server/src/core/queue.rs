use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::json;
use spoolwatch_model::{
    ActorContext, AuditAction, BulkItemResult, BulkOperationResult, MessageId,
    MessageStatus, OperationOutcome, OperationResult, QueueEntry,
    QueueOperation, ValidationError, echo_input, now_utc, validate_message_id
};
use tracing::{info, warn};

use super::audit::AuditRecorder;
use super::bus::{BusEvent, MessageBus};
use super::command::{
    CommandOutput, CommandRunner, EximCommand, classify_outcome,
    parse_queue_listing
};
use super::store::Repository;

/// Status the cache is corrected to after a successful operation.
fn corrective_status(operation: QueueOperation) -> Option<MessageStatus> {
    match operation {
        QueueOperation::Deliver => None,
        QueueOperation::Freeze => Some(MessageStatus::Frozen),
        QueueOperation::Thaw => Some(MessageStatus::Queued),
        QueueOperation::Delete => Some(MessageStatus::Bounced),
    }
}

/// The only path from a caller to a mutating exim command.
///
/// Every mutating call writes exactly one audit entry, whatever the outcome,
/// including calls refused by validation. Listing and inspection are
/// read-only and not audited.
pub struct QueueMediator<R, C, B> {
    repo: Arc<R>,
    runner: Arc<C>,
    bus: Arc<B>,
    audit: AuditRecorder<R>,
    bulk_limit: usize,
}

impl<R: Repository, C: CommandRunner, B: MessageBus> QueueMediator<R, C, B> {
    pub fn new(
        repo: Arc<R>,
        runner: Arc<C>,
        bus: Arc<B>,
        bulk_limit: usize,
    ) -> Self {
        Self {
            audit: AuditRecorder::new(repo.clone()),
            repo,
            runner,
            bus,
            bulk_limit: bulk_limit.max(1),
        }
    }

    /// Accepts the operation by name; names outside the allow-list are
    /// audited as `queue_rejected`.
    pub async fn execute_str(
        &self,
        operation: &str,
        message_id: &str,
        actor: &ActorContext,
    ) -> Result<OperationResult, ValidationError> {
        match operation.parse::<QueueOperation>() {
            Ok(operation) => self.execute(operation, message_id, actor).await,
            Err(err) => {
                self.record_rejection(AuditAction::QueueRejected, operation, message_id, actor, &err)
                    .await;
                Err(err)
            }
        }
    }

    pub async fn execute(
        &self,
        operation: QueueOperation,
        message_id: &str,
        actor: &ActorContext,
    ) -> Result<OperationResult, ValidationError> {
        let validated = check_actor(actor).and_then(|_| validate_message_id(message_id));
        let message_id = match validated {
            Ok(id) => id,
            Err(err) => {
                self.record_rejection(
                    operation.audit_action(),
                    operation.as_str(),
                    message_id,
                    actor,
                    &err
                )
                .await;
                return Err(err);
            }
        };

        let result = self.run_operation(operation, message_id).await;

        if result.outcome.is_success() {
            self.apply_corrective_status(&result).await;
        }

        self.audit
            .record(
                operation.audit_action(),
                Some(result.message_id.clone()),
                actor,
                json!({
                    "operation": operation.as_str(),
                    "result": result.outcome.as_str(),
                    "exit_code": result.exit_code,
                    "message": result.message,
                }),
            )
            .await;

        info!(
            "queue operation: operation={}, message_id={}, actor={}, outcome={}",
            operation,
            result.message_id,
            actor.actor_id,
            result.outcome
        );

        self.bus.publish(BusEvent::QueueOperation {
            actor_id: actor.actor_id.clone(),
            result: result.clone(),
        });

        Ok(result)
    }

    /// Bulk counterpart of [`Self::execute_str`]. An unknown operation name is
    /// audited once as `queue_rejected` and no command runs.
    pub async fn execute_bulk_str(
        &self,
        operation: &str,
        message_ids: &[String],
        actor: &ActorContext,
    ) -> Result<BulkOperationResult, ValidationError> {
        match operation.parse::<QueueOperation>() {
            Ok(operation) => self.execute_bulk(operation, message_ids, actor).await,
            Err(err) => {
                warn!(
                    "bulk queue request rejected: operation={}, actor={}, count={}, error={}",
                    echo_input(operation),
                    actor.actor_id,
                    message_ids.len(),
                    err
                );
                self.audit
                    .record(
                        AuditAction::QueueRejected,
                        None,
                        actor,
                        json!({
                            "operation": echo_input(operation),
                            "bulk": true,
                            "count": message_ids.len(),
                            "result": "rejected",
                            "error": err.code(),
                            "reason": err.to_string(),
                        }),
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// Applies `operation` to every id independently. A request-level
    /// refusal (no actor, empty or oversized list) is audited once; otherwise
    /// each id gets its own audit entry.
    pub async fn execute_bulk(
        &self,
        operation: QueueOperation,
        message_ids: &[String],
        actor: &ActorContext,
    ) -> Result<BulkOperationResult, ValidationError> {
        let checked = check_actor(actor).and_then(|_| {
            if message_ids.is_empty() {
                Err(ValidationError::EmptyBulk)
            } else if message_ids.len() > self.bulk_limit {
                Err(ValidationError::BulkTooLarge {
                    count: message_ids.len(),
                    limit: self.bulk_limit,
                })
            } else {
                Ok(())
            }
        });

        if let Err(err) = checked {
            self.audit
                .record(
                    operation.audit_action(),
                    None,
                    actor,
                    json!({
                        "operation": operation.as_str(),
                        "bulk": true,
                        "count": message_ids.len(),
                        "result": "rejected",
                        "error": err.code(),
                    }),
                )
                .await;
            return Err(err);
        }

        let mut items = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let item = match self.execute(operation, message_id, actor).await {
                Ok(result) => BulkItemResult {
                    message_id: message_id.clone(),
                    outcome: Some(result.outcome),
                    error: (!result.outcome.is_success()).then(|| {
                        result.message.clone().unwrap_or_else(|| result.outcome.to_string())
                    }),
                },
                Err(err) => BulkItemResult {
                    message_id: echo_input(message_id),
                    outcome: None,
                    error: Some(err.to_string()),
                },
            };
            items.push(item);
        }

        let result = BulkOperationResult::from_items(operation, items);

        info!(
            "bulk queue operation: operation={}, actor={}, succeeded={}, failed={}",
            operation,
            actor.actor_id,
            result.succeeded,
            result.failed
        );

        self.bus.publish(BusEvent::BulkOperation {
            actor_id: actor.actor_id.clone(),
            operation,
            succeeded: result.succeeded,
            failed: result.failed,
        });

        Ok(result)
    }

    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        let output = self.runner.run(EximCommand::List.args()).await?;
        if !output.success() {
            bail!(
                "queue listing failed: exit_code={:?}, error={}",
                output.exit_code,
                output.diagnostic().unwrap_or_default()
            );
        }
        Ok(parse_queue_listing(&output.stdout))
    }

    /// Header spool text for one queued message.
    pub async fn inspect(
        &self,
        message_id: &str,
    ) -> Result<String> {
        let message_id = validate_message_id(message_id)?;
        let output = self.runner.run(EximCommand::Inspect(&message_id).args()).await?;
        match classify_outcome(&output, &message_id) {
            OperationOutcome::Success => Ok(output.stdout),
            outcome => bail!(
                "inspect failed: message_id={}, outcome={}, error={}",
                message_id,
                outcome,
                output.diagnostic().unwrap_or_default()
            ),
        }
    }

    async fn run_operation(
        &self,
        operation: QueueOperation,
        message_id: MessageId,
    ) -> OperationResult {
        let args = EximCommand::Operation(operation, &message_id).args();
        let output = match self.runner.run(args).await {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    "exim command failed to run: operation={}, message_id={}, error={:#}",
                    operation,
                    message_id,
                    err
                );
                return OperationResult {
                    operation,
                    message_id,
                    outcome: OperationOutcome::UnknownFailure,
                    exit_code: None,
                    message: Some(format!("{err:#}")),
                };
            }
        };

        let outcome = classify_outcome(&output, &message_id);
        OperationResult {
            operation,
            message_id,
            outcome,
            exit_code: output.exit_code,
            message: describe(&output, outcome),
        }
    }

    async fn apply_corrective_status(
        &self,
        result: &OperationResult,
    ) {
        let Some(status) = corrective_status(result.operation) else {
            return;
        };
        match self.repo.set_message_status(&result.message_id, status, now_utc()).await {
            Ok(()) => self.bus.publish(BusEvent::StatusAdvanced {
                message_id: result.message_id.clone(),
                status,
            }),
            Err(err) => warn!(
                "corrective status write failed: message_id={}, status={}, error={:#}",
                result.message_id,
                status,
                err
            ),
        }
    }

    async fn record_rejection(
        &self,
        action: AuditAction,
        operation: &str,
        message_id: &str,
        actor: &ActorContext,
        err: &ValidationError,
    ) {
        warn!(
            "queue request rejected: operation={}, actor={}, error={}",
            echo_input(operation),
            actor.actor_id,
            err
        );
        self.audit
            .record(
                action,
                MessageId::parse(message_id).ok(),
                actor,
                json!({
                    "operation": echo_input(operation),
                    "input": echo_input(message_id),
                    "result": "rejected",
                    "error": err.code(),
                    "reason": err.to_string(),
                }),
            )
            .await;
    }
}

fn check_actor(actor: &ActorContext) -> Result<(), ValidationError> {
    if actor.actor_id.trim().is_empty() {
        return Err(ValidationError::MissingActor);
    }
    Ok(())
}

fn describe(
    output: &CommandOutput,
    outcome: OperationOutcome,
) -> Option<String> {
    if outcome.is_success() { None } else { output.diagnostic() }
}

#[cfg(test)]
mod tests {
    use spoolwatch_model::LogSource;

    use super::*;
    use crate::config::IngestConfig;
    use crate::core::bus::BroadcastBus;
    use crate::core::command::ScriptedRunner;
    use crate::core::ingest::Ingestor;
    use crate::core::memory::MemoryRepository;
    use crate::core::parser::LineParser;
    use crate::core::status::ServiceStats;

    const ID: &str = "1a2b3c-4d5e6f-7g8h9i";

    struct Fixture {
        repo: Arc<MemoryRepository>,
        runner: Arc<ScriptedRunner>,
        bus: Arc<BroadcastBus>,
        mediator: QueueMediator<MemoryRepository, ScriptedRunner, BroadcastBus>,
    }

    fn fixture(bulk_limit: usize) -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let runner = Arc::new(ScriptedRunner::new());
        let bus = Arc::new(BroadcastBus::new(64));
        bus.start();
        let mediator = QueueMediator::new(repo.clone(), runner.clone(), bus.clone(), bulk_limit);
        Fixture { repo, runner, bus, mediator }
    }

    fn actor() -> ActorContext {
        ActorContext::new("alice", Some("192.0.2.10".to_string()))
    }

    #[tokio::test]
    async fn deliver_success_is_audited_once() {
        let fx = fixture(10);

        let result = fx.mediator.execute_str("deliver", ID, &actor()).await.unwrap();

        assert_eq!(result.outcome, OperationOutcome::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(fx.runner.calls(), vec![vec!["-M".to_string(), ID.to_string()]]);

        let audit = fx.repo.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::QueueDeliver);
        assert_eq!(audit[0].detail["result"], "success");
        assert_eq!(audit[0].actor_id, "alice");
        assert_eq!(audit[0].message_id.as_ref().map(MessageId::as_str), Some(ID));
    }

    #[tokio::test]
    async fn malformed_ids_never_reach_the_command() {
        let fx = fixture(10);
        let bad = [
            "1a2b3c-4d5e6f-7g;rm",
            "../../etc/passwd",
            "1a2b3c-4d5e6-7g",
            "1a2b3c-4d5e6f",
            "-Mrm",
            "1a2b3c-4d5e6f-7g 1a2b3c-4d5e6f-8h",
            "",
        ];

        for input in bad {
            let err = fx.mediator.execute(QueueOperation::Delete, input, &actor()).await;
            assert!(err.is_err(), "accepted {input:?}");
        }

        assert!(fx.runner.calls().is_empty());
        let audit = fx.repo.audit();
        assert_eq!(audit.len(), bad.len());
        assert!(audit.iter().all(|entry| entry.detail["result"] == "rejected"));
        assert!(audit.iter().all(|entry| entry.action == AuditAction::QueueDelete));
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected_and_audited() {
        let fx = fixture(10);

        let err = fx.mediator.execute_str("shutdown", ID, &actor()).await.unwrap_err();

        assert_eq!(err.code(), "OPERATION_NOT_ALLOWED");
        assert!(fx.runner.calls().is_empty());
        let audit = fx.repo.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::QueueRejected);
        assert_eq!(audit[0].detail["operation"], "shutdown");
    }

    #[tokio::test]
    async fn missing_actor_is_rejected() {
        let fx = fixture(10);
        let err = fx
            .mediator
            .execute(QueueOperation::Freeze, ID, &ActorContext::new(" ", None))
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingActor);
        assert!(fx.runner.calls().is_empty());
        assert_eq!(fx.repo.audit().len(), 1);
    }

    #[tokio::test]
    async fn command_failures_map_to_typed_outcomes() {
        let fx = fixture(10);
        fx.runner.respond("-Mf", 0, "Message 1a2b3c-4d5e6f-7g8h9i is already frozen\n", "");
        fx.runner.respond("-Mt", 1, "", "exim: permission denied\n");
        fx.runner.respond("-Mrm", 1, "", "Message 1a2b3c-4d5e6f-7g8h9i does not exist\n");
        fx.runner.respond("-M", 2, "", "spool file locked\n");

        let freeze = fx.mediator.execute(QueueOperation::Freeze, ID, &actor()).await.unwrap();
        let thaw = fx.mediator.execute(QueueOperation::Thaw, ID, &actor()).await.unwrap();
        let delete = fx.mediator.execute(QueueOperation::Delete, ID, &actor()).await.unwrap();
        let deliver = fx.mediator.execute(QueueOperation::Deliver, ID, &actor()).await.unwrap();

        assert_eq!(freeze.outcome, OperationOutcome::AlreadyInState);
        assert_eq!(thaw.outcome, OperationOutcome::PermissionDenied);
        assert_eq!(delete.outcome, OperationOutcome::NotFound);
        assert_eq!(deliver.outcome, OperationOutcome::UnknownFailure);
        assert_eq!(deliver.message.as_deref(), Some("spool file locked"));

        assert_eq!(fx.repo.audit().len(), 4);
        let id = MessageId::parse(ID).unwrap();
        assert_eq!(fx.repo.status_of(&id), None);
    }

    #[tokio::test]
    async fn audit_failure_does_not_change_the_result() {
        let fx = fixture(10);
        fx.repo.set_audit_failing(true);

        let result = fx.mediator.execute(QueueOperation::Deliver, ID, &actor()).await.unwrap();

        assert_eq!(result.outcome, OperationOutcome::Success);
        assert!(fx.repo.audit().is_empty());
    }

    #[tokio::test]
    async fn successful_operations_correct_the_cached_status() {
        let fx = fixture(10);
        let id = MessageId::parse(ID).unwrap();
        let mut rx = fx.bus.subscribe();

        fx.mediator.execute(QueueOperation::Freeze, ID, &actor()).await.unwrap();
        assert_eq!(fx.repo.status_of(&id), Some(MessageStatus::Frozen));

        fx.mediator.execute(QueueOperation::Thaw, ID, &actor()).await.unwrap();
        assert_eq!(fx.repo.status_of(&id), Some(MessageStatus::Queued));

        fx.mediator.execute(QueueOperation::Delete, ID, &actor()).await.unwrap();
        assert_eq!(fx.repo.status_of(&id), Some(MessageStatus::Bounced));

        match rx.try_recv().unwrap() {
            BusEvent::StatusAdvanced { status, .. } => assert_eq!(status, MessageStatus::Frozen),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), BusEvent::QueueOperation { .. }));
    }

    #[tokio::test]
    async fn bulk_reports_per_id_results() {
        let fx = fixture(10);
        fx.runner.respond("-Mt 0a0a0a-1b1b1b-2c", 0, "Message 0a0a0a-1b1b1b-2c is not frozen\n", "");
        let ids: Vec<String> = vec![
            "1a2b3c-4d5e6f-7g".into(),
            "bad;id".into(),
            "0a0a0a-1b1b1b-2c".into(),
            "9z9z9z-8y8y8y-7x".into(),
        ];

        let result = fx.mediator.execute_bulk(QueueOperation::Thaw, &ids, &actor()).await.unwrap();

        assert_eq!((result.succeeded, result.failed), (2, 2));
        let failed: Vec<&str> = result.errors().map(|(id, _)| id).collect();
        assert_eq!(failed, vec!["bad;id", "0a0a0a-1b1b1b-2c"]);
        assert_eq!(fx.repo.audit().len(), 4);
        assert_eq!(fx.runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn bulk_with_unknown_operation_is_audited_once() {
        let fx = fixture(10);
        let ids: Vec<String> = vec!["1a2b3c-4d5e6f-7g".into(), "0a0a0a-1b1b1b-2c".into()];

        let err = fx
            .mediator
            .execute_bulk_str("purge", &ids, &actor())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "OPERATION_NOT_ALLOWED");
        assert!(fx.runner.calls().is_empty());
        let audit = fx.repo.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::QueueRejected);
        assert_eq!(audit[0].detail["operation"], "purge");
        assert_eq!(audit[0].detail["count"], 2);

        let result = fx.mediator.execute_bulk_str("freeze", &ids, &actor()).await.unwrap();
        assert_eq!(result.succeeded, 2);
        assert_eq!(fx.repo.audit().len(), 3);
    }

    #[tokio::test]
    async fn delivery_after_freeze_and_deliver_ends_delivered() {
        let fx = fixture(10);
        let id = MessageId::parse(ID).unwrap();

        fx.mediator.execute(QueueOperation::Freeze, ID, &actor()).await.unwrap();
        fx.mediator.execute(QueueOperation::Deliver, ID, &actor()).await.unwrap();
        assert_eq!(fx.repo.status_of(&id), Some(MessageStatus::Frozen));

        let mut ingestor = Ingestor::new(
            Arc::new(LineParser::compile().unwrap()),
            fx.repo.clone(),
            fx.bus.clone(),
            Arc::new(ServiceStats::new()),
            &IngestConfig::default(),
        );
        for line in [
            format!("2024-01-01 12:00:00 {ID} => bob@example.net R=dnslookup T=remote_smtp C=\"250 OK\""),
            format!("2024-01-01 12:00:00 {ID} Completed"),
        ] {
            ingestor.ingest_line(&line, LogSource::Main);
        }
        assert!(ingestor.flush().await);

        assert_eq!(fx.repo.status_of(&id), Some(MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn bulk_limits_are_enforced_before_any_command() {
        let fx = fixture(2);
        let ids: Vec<String> = vec![
            "1a2b3c-4d5e6f-7g".into(),
            "0a0a0a-1b1b1b-2c".into(),
            "9z9z9z-8y8y8y-7x".into(),
        ];

        let err = fx.mediator.execute_bulk(QueueOperation::Deliver, &ids, &actor()).await.unwrap_err();
        assert_eq!(err, ValidationError::BulkTooLarge { count: 3, limit: 2 });

        let err = fx.mediator.execute_bulk(QueueOperation::Deliver, &[], &actor()).await.unwrap_err();
        assert_eq!(err, ValidationError::EmptyBulk);

        assert!(fx.runner.calls().is_empty());
        assert_eq!(fx.repo.audit().len(), 2);
    }

    #[tokio::test]
    async fn lists_and_inspects_without_auditing() {
        let fx = fixture(10);
        fx.runner.respond(
            "-bp",
            0,
            " 5m  1.0K 1a2b3c-4d5e6f-7g8h9i <a@example.com> *** frozen ***\n          b@example.net\n",
            "",
        );
        fx.runner.respond("-Mvh", 0, "1a2b3c-4d5e6f-7g8h9i-H\nalice 1000 1000\n", "");

        let entries = fx.mediator.list_queue().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].frozen);

        let headers = fx.mediator.inspect(ID).await.unwrap();
        assert!(headers.starts_with("1a2b3c-4d5e6f-7g8h9i-H"));

        assert!(fx.mediator.inspect("x;y").await.is_err());
        assert!(fx.repo.audit().is_empty());
    }
}
