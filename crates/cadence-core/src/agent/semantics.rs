//! Semantic validation and salvage for model outputs.
//!
//! Schema conformance is the provider's job; these checks enforce the rules
//! a schema cannot express. In strict mode a violation raises; otherwise
//! whatever is safely repairable is fixed in place and a note is appended
//! to the output's reasoning.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use cadence_api::{ExecutionStrategy, RecommendedActionType};
use cadence_llm::ModelError;

use super::{PlanOutput, ScheduleOutput};

/// Salvage applied when the scheduler proposes a non-future timestamp.
const SCHEDULE_FALLBACK_SECS: i64 = 60;

/// Validate a plan, salvaging in place unless `strict`.
pub fn validate_plan(
    plan: &mut PlanOutput,
    now: DateTime<Utc>,
    strict: bool,
) -> Result<(), ModelError> {
    let mut violations: Vec<String> = Vec::new();
    let mut salvages: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    if plan.endpoints_to_call.is_empty() {
        warnings.push("plan contains no endpoints to call".to_string());
    }

    // parallel requires an explicit concurrency of at least 2.
    if plan.execution_strategy == ExecutionStrategy::Parallel
        && plan.concurrency_limit.is_none_or(|limit| limit < 2)
    {
        violations.push("parallel requires concurrencyLimit >= 2".to_string());
        if !strict {
            plan.concurrency_limit = Some(2);
            salvages.push("set concurrencyLimit to 2".to_string());
        }
    }

    // Every dependency must reference a planned endpoint.
    let planned_ids: HashSet<String> = plan
        .endpoints_to_call
        .iter()
        .map(|c| c.endpoint_id.clone())
        .collect();
    for call in &mut plan.endpoints_to_call {
        let Some(deps) = &mut call.depends_on else {
            continue;
        };
        let dangling: Vec<String> = deps
            .iter()
            .filter(|d| !planned_ids.contains(*d))
            .cloned()
            .collect();
        if dangling.is_empty() {
            continue;
        }
        violations.push(format!(
            "endpoint {} depends on unresolved ids: {}",
            call.endpoint_id,
            dangling.join(", ")
        ));
        if !strict {
            deps.retain(|d| planned_ids.contains(d));
            salvages.push(format!(
                "dropped dangling dependencies of {}",
                call.endpoint_id
            ));
            if deps.is_empty() {
                call.depends_on = None;
            }
        }
    }

    // Dependency graph must be acyclic.
    while let Some(cyclic) = cyclic_nodes(plan) {
        violations.push(format!("dependency cycle involving: {}", cyclic.join(", ")));
        if strict {
            break;
        }
        match drop_closing_edge(plan, &cyclic) {
            Some((from, to)) => {
                salvages.push(format!("dropped cyclic dependency {from} -> {to}"));
            }
            None => break,
        }
    }

    // A preliminary next-run hint must be a parseable future timestamp.
    if let Some(raw) = &plan.preliminary_next_run_at {
        let valid = DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc) > now)
            .unwrap_or(false);
        if !valid {
            violations.push(format!(
                "preliminaryNextRunAt {raw:?} is not a parseable future timestamp"
            ));
            if !strict {
                plan.preliminary_next_run_at = None;
                salvages.push("dropped preliminaryNextRunAt".to_string());
            }
        }
    }

    finish(
        &mut plan.reasoning,
        violations,
        salvages,
        warnings,
        strict,
    )
}

/// Validate a schedule decision, salvaging in place unless `strict`.
pub fn validate_schedule(
    decision: &mut ScheduleOutput,
    now: DateTime<Utc>,
    strict: bool,
) -> Result<(), ModelError> {
    let mut violations: Vec<String> = Vec::new();
    let mut salvages: Vec<String> = Vec::new();

    // A decision that pauses the job is allowed to carry any timestamp.
    let pauses_job = decision
        .recommended_actions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|a| a.action_type == RecommendedActionType::PauseJob);

    let parsed = DateTime::parse_from_rfc3339(&decision.next_run_at)
        .map(|ts| ts.with_timezone(&Utc));
    let valid = match parsed {
        Ok(ts) => pauses_job || ts > now,
        Err(_) => false,
    };

    if !valid {
        violations.push(format!(
            "nextRunAt {:?} is a past or current timestamp",
            decision.next_run_at
        ));
        if !strict {
            let fallback = now + chrono::Duration::seconds(SCHEDULE_FALLBACK_SECS);
            decision.next_run_at = fallback.to_rfc3339();
            salvages.push(format!(
                "set nextRunAt to now + {SCHEDULE_FALLBACK_SECS}s"
            ));
        }
    }

    finish(&mut decision.reasoning, violations, salvages, Vec::new(), strict)
}

/// Raise in strict mode; otherwise append the salvage/warning notes.
fn finish(
    reasoning: &mut String,
    violations: Vec<String>,
    salvages: Vec<String>,
    warnings: Vec<String>,
    strict: bool,
) -> Result<(), ModelError> {
    if strict && !violations.is_empty() {
        return Err(ModelError::SemanticViolation(violations.join("; ")));
    }
    if !salvages.is_empty() {
        reasoning.push_str(" [SemanticSalvage] ");
        reasoning.push_str(&salvages.join("; "));
    }
    if !warnings.is_empty() {
        reasoning.push_str(" [SemanticWarnings] ");
        reasoning.push_str(&warnings.join("; "));
    }
    Ok(())
}

/// Kahn's algorithm over the dependency graph. Returns the ids left with
/// unsatisfiable in-degrees (the cyclic region and its descendants), in
/// plan order, or `None` when the graph is acyclic.
fn cyclic_nodes(plan: &PlanOutput) -> Option<Vec<String>> {
    let ids: Vec<&str> = plan
        .endpoints_to_call
        .iter()
        .map(|c| c.endpoint_id.as_str())
        .collect();
    let known: HashSet<&str> = ids.iter().copied().collect();

    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for call in &plan.endpoints_to_call {
        let Some(deps) = &call.depends_on else {
            continue;
        };
        for dep in deps {
            if !known.contains(dep.as_str()) {
                continue;
            }
            *in_degree.entry(call.endpoint_id.as_str()).or_default() += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(call.endpoint_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = ids
        .iter()
        .copied()
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut resolved = 0usize;

    while let Some(id) = queue.pop_front() {
        resolved += 1;
        if let Some(children) = dependents.get(id) {
            for child in children {
                let degree = in_degree.get_mut(child).expect("child is a known id");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if resolved == ids.len() {
        return None;
    }

    Some(
        ids.iter()
            .filter(|id| in_degree[*id] > 0)
            .map(|id| id.to_string())
            .collect(),
    )
}

/// Remove the last edge (in plan order) whose endpoints both sit in the
/// cyclic region. Returns the removed `(dependent, dependency)` pair.
fn drop_closing_edge(plan: &mut PlanOutput, cyclic: &[String]) -> Option<(String, String)> {
    let cyclic: HashSet<&str> = cyclic.iter().map(String::as_str).collect();

    for call in plan.endpoints_to_call.iter_mut().rev() {
        if !cyclic.contains(call.endpoint_id.as_str()) {
            continue;
        }
        let Some(deps) = &mut call.depends_on else {
            continue;
        };
        if let Some(pos) = deps.iter().rposition(|d| cyclic.contains(d.as_str())) {
            let removed = deps.remove(pos);
            let from = call.endpoint_id.clone();
            if deps.is_empty() {
                call.depends_on = None;
            }
            return Some((from, removed));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_api::{ActionPriority, PlannedCall, RecommendedAction};

    fn call(id: &str, deps: &[&str]) -> PlannedCall {
        PlannedCall {
            endpoint_id: id.to_string(),
            parameters: None,
            headers: None,
            priority: 1,
            depends_on: if deps.is_empty() {
                None
            } else {
                Some(deps.iter().map(|d| d.to_string()).collect())
            },
            critical: false,
        }
    }

    fn plan(calls: Vec<PlannedCall>, strategy: ExecutionStrategy) -> PlanOutput {
        PlanOutput {
            endpoints_to_call: calls,
            execution_strategy: strategy,
            concurrency_limit: None,
            preliminary_next_run_at: None,
            reasoning: "base".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn valid_plan_is_unchanged() {
        let mut p = plan(
            vec![call("a", &[]), call("b", &["a"])],
            ExecutionStrategy::Mixed,
        );
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert_eq!(p.reasoning, "base", "no salvage note for a valid plan");
        assert_eq!(p.endpoints_to_call[1].depends_on.as_deref(), Some(&["a".to_string()][..]));
    }

    #[test]
    fn parallel_without_limit_is_salvaged_to_two() {
        let mut p = plan(vec![call("a", &[])], ExecutionStrategy::Parallel);
        p.concurrency_limit = Some(1);
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert_eq!(p.concurrency_limit, Some(2));
        assert!(p.reasoning.contains("[SemanticSalvage]"));
    }

    #[test]
    fn parallel_without_limit_raises_in_strict_mode() {
        let mut p = plan(vec![call("a", &[])], ExecutionStrategy::Parallel);
        p.concurrency_limit = Some(1);
        let err = validate_plan(&mut p, Utc::now(), true).unwrap_err();
        assert_eq!(err.category(), "semantic_violation");
        assert!(err.to_string().contains("parallel requires concurrencyLimit >= 2"));
    }

    #[test]
    fn dangling_dependencies_are_dropped() {
        let mut p = plan(
            vec![call("a", &[]), call("b", &["a", "ghost"])],
            ExecutionStrategy::Mixed,
        );
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert_eq!(
            p.endpoints_to_call[1].depends_on.as_deref(),
            Some(&["a".to_string()][..])
        );
        assert!(p.reasoning.contains("[SemanticSalvage]"));
    }

    #[test]
    fn all_dependencies_dangling_becomes_none() {
        let mut p = plan(
            vec![call("a", &[]), call("b", &["ghost"])],
            ExecutionStrategy::Mixed,
        );
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert!(p.endpoints_to_call[1].depends_on.is_none());
    }

    #[test]
    fn cycle_is_broken_by_dropping_an_edge() {
        let mut p = plan(
            vec![call("a", &["c"]), call("b", &["a"]), call("c", &["b"])],
            ExecutionStrategy::Mixed,
        );
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert!(cyclic_nodes(&p).is_none(), "salvaged plan must be acyclic");
        assert!(p.reasoning.contains("dropped cyclic dependency"));
    }

    #[test]
    fn cycle_raises_in_strict_mode() {
        let mut p = plan(
            vec![call("a", &["b"]), call("b", &["a"])],
            ExecutionStrategy::Mixed,
        );
        let err = validate_plan(&mut p, Utc::now(), true).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn self_dependency_counts_as_cycle() {
        let mut p = plan(vec![call("a", &["a"])], ExecutionStrategy::Mixed);
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert!(p.endpoints_to_call[0].depends_on.is_none());
    }

    #[test]
    fn past_preliminary_timestamp_is_dropped() {
        let mut p = plan(vec![call("a", &[])], ExecutionStrategy::Sequential);
        p.preliminary_next_run_at = Some("2000-01-01T00:00:00Z".to_string());
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert!(p.preliminary_next_run_at.is_none());
    }

    #[test]
    fn unparseable_preliminary_timestamp_is_dropped() {
        let mut p = plan(vec![call("a", &[])], ExecutionStrategy::Sequential);
        p.preliminary_next_run_at = Some("next tuesday".to_string());
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert!(p.preliminary_next_run_at.is_none());
    }

    #[test]
    fn future_preliminary_timestamp_survives() {
        let future = (Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
        let mut p = plan(vec![call("a", &[])], ExecutionStrategy::Sequential);
        p.preliminary_next_run_at = Some(future.clone());
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert_eq!(p.preliminary_next_run_at, Some(future));
    }

    #[test]
    fn empty_plan_gets_a_warning_note() {
        let mut p = plan(vec![], ExecutionStrategy::Sequential);
        validate_plan(&mut p, Utc::now(), false).unwrap();
        assert!(p.reasoning.contains("[SemanticWarnings]"));
    }

    fn schedule(next_run_at: String) -> ScheduleOutput {
        ScheduleOutput {
            next_run_at,
            reasoning: "base".to_string(),
            confidence: 0.8,
            recommended_actions: None,
        }
    }

    #[test]
    fn future_schedule_passes_unchanged() {
        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let mut s = schedule(future.clone());
        validate_schedule(&mut s, Utc::now(), false).unwrap();
        assert_eq!(s.next_run_at, future);
        assert_eq!(s.reasoning, "base");
    }

    #[test]
    fn past_schedule_is_salvaged_to_one_minute_out() {
        let now = Utc::now();
        let mut s = schedule("2000-01-01T00:00:00Z".to_string());
        validate_schedule(&mut s, now, false).unwrap();

        let salvaged: DateTime<Utc> = DateTime::parse_from_rfc3339(&s.next_run_at)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(salvaged, now + chrono::Duration::seconds(60));
        assert!(s.reasoning.contains("[SemanticSalvage]"));
    }

    #[test]
    fn past_schedule_raises_in_strict_mode() {
        let mut s = schedule("2000-01-01T00:00:00Z".to_string());
        let err = validate_schedule(&mut s, Utc::now(), true).unwrap_err();
        assert!(err.to_string().contains("past or current timestamp"));
    }

    #[test]
    fn pausing_decision_allows_past_timestamp() {
        let mut s = schedule("2000-01-01T00:00:00Z".to_string());
        s.recommended_actions = Some(vec![RecommendedAction {
            action_type: RecommendedActionType::PauseJob,
            details: "definition asks for a one-off run".to_string(),
            priority: ActionPriority::High,
        }]);
        validate_schedule(&mut s, Utc::now(), false).unwrap();
        assert_eq!(s.next_run_at, "2000-01-01T00:00:00Z");
    }
}
