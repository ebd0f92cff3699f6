//! Merge and ordering rules shared by the reconciliation engines.

use crate::alarms::SyntheticAlarm;
use relay_pipeline::Event;
use std::collections::HashMap;
use uuid::Uuid;

/// Severity first, newest first within a severity
pub fn sort_by_priority(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.category
            .rank()
            .cmp(&b.category.rank())
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

/// Server events plus active synthetic alarms, one entry per id. A later
/// entry with the same id replaces the earlier one.
pub fn merge(server: Vec<Event>, alarms: &[SyntheticAlarm]) -> Vec<Event> {
    let mut index: HashMap<Uuid, usize> = HashMap::with_capacity(server.len() + alarms.len());
    let mut merged: Vec<Event> = Vec::with_capacity(server.len() + alarms.len());

    let candidates = server
        .into_iter()
        .chain(alarms.iter().filter(|a| a.active).map(SyntheticAlarm::to_event));

    for event in candidates {
        match index.get(&event.id) {
            Some(&slot) => merged[slot] = event,
            None => {
                index.insert(event.id, merged.len());
                merged.push(event);
            }
        }
    }

    merged
}

/// Merge, sort and bound
pub fn prioritize(server: Vec<Event>, alarms: &[SyntheticAlarm], max: usize) -> Vec<Event> {
    let mut entries = merge(server, alarms);
    sort_by_priority(&mut entries);
    entries.truncate(max);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::{AlarmBook, AlarmKey};
    use chrono::{Duration, Utc};
    use relay_pipeline::Category;
    use serde_json::json;

    fn event(category: Category, minutes_ago: i64) -> Event {
        let mut event = Event::detect("gas", json!({}));
        event.category = category;
        event.created_at = Utc::now() - Duration::minutes(minutes_ago);
        event
    }

    #[test]
    fn test_severity_order_regardless_of_input_order() {
        let input = vec![
            event(Category::Alert, 1),
            event(Category::Threat, 2),
            event(Category::Detect, 3),
            event(Category::Alarm, 4),
        ];

        let sorted = prioritize(input, &[], 10);
        let categories: Vec<Category> = sorted.iter().map(|e| e.category).collect();
        assert_eq!(
            categories,
            vec![Category::Threat, Category::Alarm, Category::Alert, Category::Detect]
        );
    }

    #[test]
    fn test_newest_first_within_severity_and_unknown_last() {
        let old = event(Category::Alert, 30);
        let new = event(Category::Alert, 1);
        let odd = event(Category::Unknown, 0);

        let sorted = prioritize(vec![odd.clone(), old.clone(), new.clone()], &[], 10);
        assert_eq!(sorted[0].id, new.id);
        assert_eq!(sorted[1].id, old.id);
        assert_eq!(sorted[2].id, odd.id);
    }

    #[test]
    fn test_truncates_after_sorting() {
        let mut input: Vec<Event> = (0..10).map(|i| event(Category::Detect, i)).collect();
        input.push(event(Category::Threat, 100));

        let sorted = prioritize(input, &[], 3);
        assert_eq!(sorted.len(), 3);
        assert_eq!(sorted[0].category, Category::Threat);
    }

    #[test]
    fn test_merge_includes_only_active_alarms_and_dedups_ids() {
        let mut book = AlarmBook::new();
        book.raise(AlarmKey::fetch_failure("events"), "down", Utc::now());
        let resolved = AlarmKey::subscription_failure("gas");
        book.raise(resolved.clone(), "rejected", Utc::now());
        book.clear(&resolved, Utc::now());

        let a = event(Category::Detect, 1);
        let mut a_updated = a.clone();
        a_updated.acknowledged = true;

        let merged = merge(vec![a, a_updated], &book.all());
        assert_eq!(merged.len(), 2);
        assert!(merged[0].acknowledged);
        assert_eq!(merged[1].topic, "server_unreachable");
    }
}
