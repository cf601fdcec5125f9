//! Prompt-context optimization.
//!
//! Trims a job's message and usage history to fit the model context budget.
//! Only the AI payload shrinks; stored history is untouched.

use cadence_api::{JobContext, MessageRole};

use crate::config::PromptConfig;

/// Trim messages and usage history under the configured caps.
///
/// System messages are always kept. Of the remaining messages, the most
/// recent `min_recent_messages` are preserved when available; the merged,
/// time-ordered list is then truncated to `max_messages` (dropping from the
/// oldest end). Usage history keeps the most recent
/// `max_endpoint_usage_entries` rows.
pub fn optimize_context(context: &JobContext, config: &PromptConfig) -> JobContext {
    if !config.enabled {
        return context.clone();
    }

    let mut optimized = context.clone();

    let system: Vec<usize> = context
        .messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::System)
        .map(|(i, _)| i)
        .collect();

    // Fill the remaining budget with the most recent non-system messages,
    // but never keep fewer than the guaranteed recent window.
    let recent_budget = config
        .max_messages
        .saturating_sub(system.len())
        .max(config.min_recent_messages);
    let recent_non_system: Vec<usize> = context
        .messages
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, m)| m.role != MessageRole::System)
        .take(recent_budget)
        .map(|(i, _)| i)
        .collect();

    // Merge in original (time) order, then truncate from the oldest end,
    // never dropping below the guaranteed recent window.
    let mut keep: Vec<usize> = system.into_iter().chain(recent_non_system).collect();
    keep.sort_unstable();
    keep.dedup();

    if keep.len() > config.max_messages {
        let drop = keep.len() - config.max_messages;
        keep.drain(..drop);
    }

    optimized.messages = keep
        .into_iter()
        .map(|i| context.messages[i].clone())
        .collect();

    let usage_len = context.endpoint_usage.len();
    if usage_len > config.max_endpoint_usage_entries {
        optimized.endpoint_usage = context.endpoint_usage
            [usage_len - config.max_endpoint_usage_entries..]
            .to_vec();
    }

    optimized
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use cadence_api::{
        EndpointUsage, Job, JobStatus, Message, MessageContent, TokenUsage,
    };

    fn message(role: MessageRole, text: &str, minutes_ago: i64) -> Message {
        Message {
            role,
            content: MessageContent::Text(text.to_string()),
            source: None,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn usage_row(minutes_ago: i64) -> EndpointUsage {
        EndpointUsage {
            endpoint_id: "e1".into(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            request_size: 0,
            response_size: 10,
            execution_time_ms: 50,
            status_code: 200,
            success: true,
            truncated: false,
            error_message: None,
        }
    }

    fn context(messages: Vec<Message>, usage: Vec<EndpointUsage>) -> JobContext {
        JobContext {
            job: Job {
                id: Uuid::new_v4(),
                definition: "poll the service".into(),
                status: JobStatus::Active,
                next_run_at: None,
                locked: true,
                lock_expires_at: None,
                user_id: "u1".into(),
                token_usage: TokenUsage::default(),
                default_headers: None,
            },
            endpoints: vec![],
            messages,
            endpoint_usage: usage,
        }
    }

    fn config() -> PromptConfig {
        PromptConfig {
            enabled: true,
            max_messages: 5,
            min_recent_messages: 3,
            max_endpoint_usage_entries: 2,
        }
    }

    #[test]
    fn disabled_returns_context_unchanged() {
        let ctx = context(
            (0..20)
                .map(|i| message(MessageRole::User, "m", i))
                .collect(),
            (0..10).map(usage_row).collect(),
        );
        let mut cfg = config();
        cfg.enabled = false;

        let optimized = optimize_context(&ctx, &cfg);
        assert_eq!(optimized.messages.len(), 20);
        assert_eq!(optimized.endpoint_usage.len(), 10);
    }

    #[test]
    fn respects_message_cap() {
        let ctx = context(
            (0..20)
                .map(|i| message(MessageRole::User, "m", 20 - i))
                .collect(),
            vec![],
        );
        let optimized = optimize_context(&ctx, &config());
        assert!(optimized.messages.len() <= 5);
    }

    #[test]
    fn keeps_all_system_messages() {
        let mut messages = vec![message(MessageRole::System, "rules", 100)];
        messages.extend((0..10).map(|i| message(MessageRole::User, "u", 10 - i)));
        let ctx = context(messages, vec![]);

        let optimized = optimize_context(&ctx, &config());
        let systems = optimized
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .count();
        assert_eq!(systems, 1);
    }

    #[test]
    fn keeps_minimum_recent_non_system_messages() {
        let mut messages = vec![
            message(MessageRole::System, "a", 50),
            message(MessageRole::System, "b", 49),
        ];
        messages.extend((0..8).map(|i| message(MessageRole::User, "u", 8 - i)));
        let ctx = context(messages, vec![]);

        let optimized = optimize_context(&ctx, &config());
        let non_system = optimized
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .count();
        assert!(non_system >= 3, "kept {non_system} non-system messages");
    }

    #[test]
    fn fewer_messages_than_minimum_keeps_all() {
        let ctx = context(
            vec![
                message(MessageRole::User, "only", 2),
                message(MessageRole::Assistant, "reply", 1),
            ],
            vec![],
        );
        let optimized = optimize_context(&ctx, &config());
        assert_eq!(optimized.messages.len(), 2);
    }

    #[test]
    fn output_preserves_time_order() {
        let mut messages = vec![message(MessageRole::System, "s", 30)];
        messages.extend((0..6).map(|i| message(MessageRole::User, "u", 6 - i)));
        let ctx = context(messages, vec![]);

        let optimized = optimize_context(&ctx, &config());
        for pair in optimized.messages.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn usage_keeps_most_recent_entries() {
        let ctx = context(vec![], (0..6).map(|i| usage_row(6 - i)).collect());
        let optimized = optimize_context(&ctx, &config());
        assert_eq!(optimized.endpoint_usage.len(), 2);
        // Most recent rows are the ones with the latest timestamps.
        assert!(
            optimized.endpoint_usage[0].timestamp <= optimized.endpoint_usage[1].timestamp
        );
        let newest_kept = optimized.endpoint_usage[1].timestamp;
        let newest_overall = ctx
            .endpoint_usage
            .iter()
            .map(|u| u.timestamp)
            .max()
            .unwrap();
        assert_eq!(newest_kept, newest_overall);
    }
}
