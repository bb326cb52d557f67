//! The executor state machine:
//! `pending -> running -> {completed|failed|cancelled|waiting_approval}`,
//! `waiting_approval -> running` on `resume_execution`.

use chrono::Utc;
use serde_json::{json, Value};

use crate::err::{EleanorError, Result};

use super::action::ActionRegistry;
use super::model::{
    Approval, ApprovalStatus, ConditionClause, ConditionOp, ExecutionStatus, Playbook,
    PlaybookExecution, Step, StepResult, StepStatus, StepType,
};
use super::store::PlaybookStore;
use super::template::{lookup, resolve};

/// A hard cap on `delay` steps; longer delays require an external
/// scheduler, out of scope here.
const MAX_DELAY_SECS: u64 = 300;

pub struct PlaybookEngine {
    store: PlaybookStore,
    actions: ActionRegistry,
}

impl PlaybookEngine {
    pub fn new(store: PlaybookStore, actions: ActionRegistry) -> Self {
        Self { store, actions }
    }

    /// Starts a new execution of `playbook` with `input`, running steps
    /// until the execution reaches a terminal state or suspends on an
    /// approval.
    pub async fn start_execution(&self, playbook: &Playbook, input: Value, tenant: &str) -> Result<PlaybookExecution> {
        let now = Utc::now();
        let mut execution = PlaybookExecution::new(playbook.id.clone(), input, now);
        execution.status = ExecutionStatus::Running;
        let Some(first) = playbook.first_step() else {
            execution.status = ExecutionStatus::Completed;
            execution.completed_at = Some(now);
            self.store.put_execution(&execution)?;
            return Ok(execution);
        };
        execution.current_step_id = Some(first.id.clone());
        self.store.put_execution(&execution)?;

        self.run_from(playbook, &mut execution, tenant).await?;
        Ok(execution)
    }

    /// Resumes an execution paused at an approval step. `InvalidState` if
    /// the execution is not currently `waiting_approval`.
    pub async fn resume_execution(
        &self,
        playbook: &Playbook,
        execution_id: &str,
        approved: bool,
        comment: Option<String>,
        decided_by: impl Into<String>,
        tenant: &str,
    ) -> Result<PlaybookExecution> {
        let mut execution = self
            .store
            .get_execution(execution_id)?
            .ok_or_else(|| EleanorError::invalid_state(format!("no such execution: {execution_id}")))?;

        if execution.status != ExecutionStatus::WaitingApproval {
            return Err(EleanorError::invalid_state(format!(
                "cannot resume execution {execution_id} in status {:?}",
                execution.status
            )));
        }

        let Some(step_id) = execution.current_step_id.clone() else {
            return Err(EleanorError::invalid_state("waiting execution has no current step"));
        };
        let mut approval = self
            .store
            .get_approval(execution_id, &step_id)?
            .ok_or_else(|| EleanorError::invalid_state("no approval recorded for current step"))?;

        if approval.status != ApprovalStatus::Pending {
            return Err(EleanorError::invalid_state(format!(
                "approval for step {step_id} already decided: {:?}",
                approval.status
            )));
        }

        let now = Utc::now();
        if now >= approval.expires_at {
            approval.status = ApprovalStatus::Expired;
            self.store.put_approval(&approval)?;
            return Err(EleanorError::timeout(format!("approval for step {step_id} expired at {}", approval.expires_at)));
        }
        approval.status = if approved { ApprovalStatus::Approved } else { ApprovalStatus::Denied };
        approval.decided_by = Some(decided_by.into());
        approval.decided_at = Some(now);
        self.store.put_approval(&approval)?;

        let step = playbook
            .step(&step_id)
            .ok_or_else(|| EleanorError::invalid_state(format!("playbook has no step {step_id}")))?;

        execution.step_results.push(StepResult {
            step_id: step_id.clone(),
            status: if approved { StepStatus::Succeeded } else { StepStatus::Failed },
            output: json!({"comment": comment, "approved": approved}),
            error: if approved { None } else { Some("Approval denied".to_string()) },
            at: now,
        });

        let next = if approved { step.on_approve.clone() } else { step.on_deny.clone() };
        execution.status = ExecutionStatus::Running;

        match next {
            Some(next_id) => execution.current_step_id = Some(next_id),
            None if approved => {
                execution.status = ExecutionStatus::Completed;
                execution.completed_at = Some(now);
                execution.current_step_id = None;
            }
            None => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some("Approval denied".to_string());
                execution.completed_at = Some(now);
                execution.current_step_id = None;
            }
        }

        self.store.put_execution(&execution)?;
        if execution.status == ExecutionStatus::Running {
            self.run_from(playbook, &mut execution, tenant).await?;
        }
        Ok(execution)
    }

    /// Sweeps one execution's pending approval past its `expires_at`: the
    /// timeout converts to a denial, following `on_deny` the same way a
    /// human-submitted denial would, or failing the execution if no
    /// `on_deny` edge is declared. A no-op if the execution isn't
    /// currently waiting on an unexpired approval. Intended to be called
    /// periodically (e.g. a timer task alongside the correlation cleanup
    /// sweep) rather than driven by caller action.
    pub async fn expire_approval_if_due(&self, playbook: &Playbook, execution_id: &str, tenant: &str) -> Result<Option<PlaybookExecution>> {
        let Some(mut execution) = self.store.get_execution(execution_id)? else {
            return Ok(None);
        };
        if execution.status != ExecutionStatus::WaitingApproval {
            return Ok(None);
        }
        let Some(step_id) = execution.current_step_id.clone() else {
            return Ok(None);
        };
        let Some(mut approval) = self.store.get_approval(execution_id, &step_id)? else {
            return Ok(None);
        };
        if approval.status != ApprovalStatus::Pending {
            return Ok(None);
        }

        let now = Utc::now();
        if now < approval.expires_at {
            return Ok(None);
        }

        approval.status = ApprovalStatus::Expired;
        self.store.put_approval(&approval)?;

        let step = playbook
            .step(&step_id)
            .ok_or_else(|| EleanorError::invalid_state(format!("playbook has no step {step_id}")))?;

        execution.step_results.push(StepResult {
            step_id: step_id.clone(),
            status: StepStatus::Failed,
            output: json!({"approved": false, "timed_out": true}),
            error: Some("Approval expired".to_string()),
            at: now,
        });

        match step.on_deny.clone() {
            Some(next_id) => {
                execution.status = ExecutionStatus::Running;
                execution.current_step_id = Some(next_id);
                self.store.put_execution(&execution)?;
                self.run_from(playbook, &mut execution, tenant).await?;
            }
            None => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some("Approval expired".to_string());
                execution.completed_at = Some(now);
                execution.current_step_id = None;
                self.store.put_execution(&execution)?;
            }
        }

        Ok(Some(execution))
    }

    /// Cancels a non-terminal execution. `InvalidState` for an already
    /// terminal execution.
    pub fn cancel_execution(&self, execution_id: &str) -> Result<PlaybookExecution> {
        let mut execution = self
            .store
            .get_execution(execution_id)?
            .ok_or_else(|| EleanorError::invalid_state(format!("no such execution: {execution_id}")))?;

        if execution.status.is_terminal() {
            return Err(EleanorError::invalid_state(format!(
                "cannot cancel execution {execution_id} already in terminal status {:?}",
                execution.status
            )));
        }

        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(Utc::now());
        self.store.put_execution(&execution)?;
        Ok(execution)
    }

    /// Drives the execution forward from `execution.current_step_id`
    /// until it terminates or suspends on an approval.
    async fn run_from(&self, playbook: &Playbook, execution: &mut PlaybookExecution, tenant: &str) -> Result<()> {
        loop {
            let Some(step_id) = execution.current_step_id.clone() else {
                execution.status = ExecutionStatus::Completed;
                execution.completed_at = Some(Utc::now());
                break;
            };
            let Some(step) = playbook.step(&step_id) else {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(format!("unknown step id: {step_id}"));
                execution.completed_at = Some(Utc::now());
                break;
            };

            match self.run_step(step, execution, tenant).await? {
                StepOutcome::Suspended => break,
                StepOutcome::Advance(next) => {
                    execution.current_step_id = next;
                    if execution.current_step_id.is_none() {
                        execution.status = ExecutionStatus::Completed;
                        execution.completed_at = Some(Utc::now());
                        break;
                    }
                }
                StepOutcome::Terminate(error) => {
                    execution.status = ExecutionStatus::Failed;
                    execution.error = error;
                    execution.completed_at = Some(Utc::now());
                    break;
                }
            }
        }

        self.store.put_execution(execution)?;
        Ok(())
    }

    async fn run_step(&self, step: &Step, execution: &mut PlaybookExecution, tenant: &str) -> Result<StepOutcome> {
        let now = Utc::now();
        let context = json!({
            "input": execution.input,
            "steps": steps_context(&execution.step_results),
        });

        match step.kind {
            StepType::Action => {
                let resolved = resolve(&step.params, &context);
                let action_name = resolved.get("action").and_then(Value::as_str).unwrap_or_default().to_string();
                let action_params = resolved.get("params").cloned().unwrap_or(Value::Null);
                let result = self.actions.call(&action_name, action_params, tenant).await;

                let status = if result.is_ok() { StepStatus::Succeeded } else { StepStatus::Failed };
                execution.step_results.push(StepResult {
                    step_id: step.id.clone(),
                    status,
                    output: result.output,
                    error: result.error,
                    at: now,
                });
                Ok(branch(step, status))
            }

            StepType::Approval => {
                let timeout_hours = step.params.get("timeout_hours").and_then(Value::as_i64).unwrap_or(24);
                let approval = Approval {
                    execution_id: execution.id.clone(),
                    step_id: step.id.clone(),
                    status: ApprovalStatus::Pending,
                    required_approvers: step
                        .params
                        .get("required_approvers")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                    decided_by: None,
                    decided_at: None,
                    expires_at: now + chrono::Duration::hours(timeout_hours),
                    context: resolve(&step.params, &context),
                };
                self.store.put_approval(&approval)?;
                execution.status = ExecutionStatus::WaitingApproval;
                execution.current_step_id = Some(step.id.clone());
                Ok(StepOutcome::Suspended)
            }

            StepType::Delay => {
                let requested = step.params.get("seconds").and_then(Value::as_u64).unwrap_or(0);
                let capped = requested.min(MAX_DELAY_SECS);
                tokio::time::sleep(std::time::Duration::from_secs(capped)).await;
                execution.step_results.push(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Succeeded,
                    output: json!({"slept_secs": capped}),
                    error: None,
                    at: now,
                });
                Ok(branch(step, StepStatus::Succeeded))
            }

            StepType::Condition => {
                let branch_name = evaluate_condition(&step.params, &context);
                execution.step_results.push(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Succeeded,
                    output: json!({"branch": branch_name}),
                    error: None,
                    at: now,
                });
                Ok(StepOutcome::Advance(branch_name))
            }

            StepType::Notification => {
                let resolved = resolve(&step.params, &context);
                let notifier = resolved.get("channel").and_then(Value::as_str).unwrap_or_default().to_string();
                let result = self.actions.call(&format!("notify:{notifier}"), resolved, tenant).await;
                // Notifications never block execution progress, regardless of outcome.
                execution.step_results.push(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Succeeded,
                    output: result.output,
                    error: result.error,
                    at: now,
                });
                Ok(branch(step, StepStatus::Succeeded))
            }

            StepType::Workflow => {
                let resolved = resolve(&step.params, &context);
                let result = self.actions.call("workflow:dispatch", resolved, tenant).await;
                let status = if result.is_ok() { StepStatus::Succeeded } else { StepStatus::Failed };
                execution.step_results.push(StepResult {
                    step_id: step.id.clone(),
                    status,
                    output: result.output,
                    error: result.error,
                    at: now,
                });
                Ok(branch(step, status))
            }
        }
    }
}

enum StepOutcome {
    Advance(Option<String>),
    Suspended,
    Terminate(Option<String>),
}

/// Resolves the next step id (or execution end) after a step completes:
/// missing `on_failure` on a failed step fails the execution; a succeeded
/// step with no `on_success` ends the execution.
fn branch(step: &Step, status: StepStatus) -> StepOutcome {
    match status {
        StepStatus::Succeeded => StepOutcome::Advance(step.on_success.clone()),
        StepStatus::Failed => match &step.on_failure {
            Some(next) => StepOutcome::Advance(Some(next.clone())),
            None => StepOutcome::Terminate(Some(format!("step {} failed with no on_failure edge", step.id))),
        },
        StepStatus::WaitingApproval => StepOutcome::Suspended,
    }
}

fn steps_context(results: &[StepResult]) -> Value {
    let mut map = serde_json::Map::new();
    for r in results {
        map.insert(
            r.step_id.clone(),
            json!({"status": r.status, "output": r.output, "error": r.error}),
        );
    }
    Value::Object(map)
}

/// Evaluates condition clauses in order against `{input, steps}`; first
/// match wins, else the params' `default_branch`.
fn evaluate_condition(params: &Value, context: &Value) -> Option<String> {
    let clauses: Vec<ConditionClause> = params
        .get("clauses")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    for clause in &clauses {
        let actual = lookup(context, &clause.field);
        let matched = match clause.op {
            ConditionOp::Eq => actual.as_ref() == Some(&clause.value),
            ConditionOp::Neq => actual.as_ref() != Some(&clause.value),
            ConditionOp::Contains => match (&actual, clause.value.as_str()) {
                (Some(Value::String(s)), Some(needle)) => s.contains(needle),
                _ => false,
            },
            ConditionOp::Gt => match (actual.as_ref().and_then(Value::as_f64), clause.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOp::Lt => match (actual.as_ref().and_then(Value::as_f64), clause.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            ConditionOp::Exists => actual.is_some(),
        };

        if matched {
            return Some(clause.branch.clone());
        }
    }
    params.get("default_branch").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::action::{ActionExecutor, ActionResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct AlwaysOk;
    #[async_trait]
    impl ActionExecutor for AlwaysOk {
        async fn execute(&self, params: Value, _tenant: &str) -> ActionResult {
            ActionResult::ok(params)
        }
    }

    fn simple_playbook() -> Playbook {
        Playbook {
            id: "pb1".to_string(),
            name: "simple".to_string(),
            status: "active".to_string(),
            steps: vec![
                Step {
                    id: "s1".to_string(),
                    kind: StepType::Action,
                    on_success: Some("s2".to_string()),
                    on_failure: None,
                    on_approve: None,
                    on_deny: None,
                    params: json!({"action": "do_thing", "params": {"x": "{{ input.x }}"}}),
                },
                Step {
                    id: "s2".to_string(),
                    kind: StepType::Approval,
                    on_success: None,
                    on_failure: None,
                    on_approve: None,
                    on_deny: Some("s3".to_string()),
                    params: json!({"timeout_hours": 1}),
                },
                Step {
                    id: "s3".to_string(),
                    kind: StepType::Notification,
                    on_success: None,
                    on_failure: None,
                    on_approve: None,
                    on_deny: None,
                    params: json!({"channel": "email", "message": "denied"}),
                },
            ],
        }
    }

    fn engine() -> (PlaybookEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaybookStore::open(dir.path().join("pb.db").to_str().unwrap()).unwrap();
        let mut actions = ActionRegistry::new();
        actions.register("do_thing", Box::new(AlwaysOk));
        actions.register("notify:email", Box::new(AlwaysOk));
        (PlaybookEngine::new(store, actions), dir)
    }

    #[tokio::test]
    async fn execution_suspends_on_approval_step() {
        let (engine, _dir) = engine();
        let playbook = simple_playbook();
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::WaitingApproval);
        assert_eq!(execution.current_step_id.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn resume_with_denial_follows_on_deny_then_completes() {
        let (engine, _dir) = engine();
        let playbook = simple_playbook();
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();

        let resumed = engine
            .resume_execution(&playbook, &execution.id, false, Some("not now".to_string()), "alice", "tenant-a")
            .await
            .unwrap();

        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert!(resumed.step_results.iter().any(|r| r.step_id == "s3"));
    }

    #[tokio::test]
    async fn resume_on_non_waiting_execution_is_invalid_state() {
        let (engine, _dir) = engine();
        let playbook = simple_playbook();
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();
        engine
            .resume_execution(&playbook, &execution.id, true, None, "alice", "tenant-a")
            .await
            .unwrap();

        let second = engine.resume_execution(&playbook, &execution.id, true, None, "alice", "tenant-a").await;
        assert!(matches!(second, Err(EleanorError::InvalidState(_))));
    }

    #[tokio::test]
    async fn denial_with_no_on_deny_edge_fails_execution() {
        let mut playbook = simple_playbook();
        playbook.steps[1].on_deny = None;
        let (engine, _dir) = engine();
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();

        let resumed = engine
            .resume_execution(&playbook, &execution.id, false, None, "alice", "tenant-a")
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Failed);
        assert_eq!(resumed.error.as_deref(), Some("Approval denied"));
    }

    #[tokio::test]
    async fn expired_approval_follows_on_deny_like_a_real_denial() {
        let (engine, _dir) = engine();
        let mut playbook = simple_playbook();
        // Force an immediate expiry window so the sweep has something to do.
        playbook.steps[1].params = json!({"timeout_hours": 0});
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::WaitingApproval);

        // timeout_hours truncates to 0, so expires_at == now; sleep a tick
        // past it rather than relying on exact equality.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let swept = engine
            .expire_approval_if_due(&playbook, &execution.id, "tenant-a")
            .await
            .unwrap()
            .expect("pending approval past expiry should be swept");
        assert_eq!(swept.status, ExecutionStatus::Completed);
        assert!(swept.step_results.iter().any(|r| r.step_id == "s2" && r.error.as_deref() == Some("Approval expired")));
    }

    #[tokio::test]
    async fn resume_after_expiry_returns_timeout_not_a_live_decision() {
        let (engine, _dir) = engine();
        let mut playbook = simple_playbook();
        playbook.steps[1].params = json!({"timeout_hours": 0});
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let result = engine.resume_execution(&playbook, &execution.id, true, None, "alice", "tenant-a").await;
        assert!(matches!(result, Err(EleanorError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancel_non_terminal_execution_succeeds() {
        let (engine, _dir) = engine();
        let playbook = simple_playbook();
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();
        let cancelled = engine.cancel_execution(&execution.id).unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_terminal_execution_is_invalid_state() {
        let (engine, _dir) = engine();
        let playbook = simple_playbook();
        let execution = engine.start_execution(&playbook, json!({"x": 1}), "tenant-a").await.unwrap();
        engine.cancel_execution(&execution.id).unwrap();

        let second = engine.cancel_execution(&execution.id);
        assert!(matches!(second, Err(EleanorError::InvalidState(_))));
    }
}
