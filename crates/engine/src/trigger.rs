//! Trigger filter: decides whether an inbound event starts a workflow.

use crate::models::{Event, Trigger, Workflow};

/// `true` when the event's source and status both equal the trigger's.
pub fn matches(trigger: &Trigger, event: &Event) -> bool {
    event.source == trigger.source && event.status == trigger.status
}

impl Trigger {
    pub fn new(source: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: status.into(),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        matches(self, event)
    }
}

impl Workflow {
    /// A workflow fires (once) when any of its triggers matches.
    pub fn is_triggered_by(&self, event: &Event) -> bool {
        self.triggers.iter().any(|t| t.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(source: &str, status: &str) -> Event {
        Event::new(source, status, json!({}))
    }

    #[test]
    fn exact_source_and_status_match() {
        let trigger = Trigger::new("api", "active");
        assert!(matches(&trigger, &event("api", "active")));
    }

    #[test]
    fn different_source_does_not_match() {
        let trigger = Trigger::new("api", "active");
        assert!(!matches(&trigger, &event("webhook", "active")));
    }

    #[test]
    fn different_status_does_not_match() {
        let trigger = Trigger::new("api", "active");
        assert!(!matches(&trigger, &event("api", "pending")));
    }

    #[test]
    fn comparison_is_case_sensitive_and_exact() {
        let trigger = Trigger::new("api", "active");
        assert!(!trigger.matches(&event("API", "active")));
        assert!(!trigger.matches(&event("api", "active ")));
        assert!(!trigger.matches(&event("", "")));
    }

    #[test]
    fn workflow_fires_if_any_trigger_matches() {
        let wf = Workflow::new(
            "wf",
            vec![],
            vec![Trigger::new("api", "active"), Trigger::new("billing", "paid")],
        );
        assert!(wf.is_triggered_by(&event("billing", "paid")));
        assert!(!wf.is_triggered_by(&event("billing", "refunded")));

        let untriggered = Workflow::new("manual", vec![], vec![]);
        assert!(!untriggered.is_triggered_by(&event("api", "active")));
    }
}
