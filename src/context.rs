//! Hierarchical context fields stamped onto outgoing events
//!
//! Providers form a parent/child tree mirroring the logger hierarchy. The
//! parent link is a `Weak` handle fixed at construction, so cycles are
//! unconstructible and a provider outliving its parent degrades to its own
//! fields. Field resolution is parent first, then self, with custom fields
//! overriding common fields within a level.

use crate::record::{Event, EventProperty};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

/// Field-name prefix for auth tickets
const TICKET_FIELD_PREFIX: &str = "ticket.";

/// Field carrying the comma-joined experiment ids for the event's name
const EXPERIMENT_IDS_FIELD: &str = "app.experiment_ids";

/// Auth ticket classes the provider can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TicketType {
    User,
    Device,
    Application,
}

impl TicketType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Device => "device",
            Self::Application => "application",
        }
    }
}

#[derive(Default)]
struct ContextState {
    /// Insertion-ordered: a `Vec` of pairs, upserted in place
    common_fields: Vec<(String, EventProperty)>,
    custom_fields: Vec<(String, EventProperty)>,
    /// event name -> comma-joined experiment config ids
    event_to_experiment_ids: HashMap<String, String>,
    tickets: BTreeMap<TicketType, String>,
}

fn upsert(fields: &mut Vec<(String, EventProperty)>, name: String, value: EventProperty) {
    match fields.iter_mut().find(|(n, _)| *n == name) {
        Some((_, existing)) => *existing = value,
        None => fields.push((name, value)),
    }
}

/// Bag of common/custom fields, experiment ids, and tickets for one logger level
pub struct ContextFieldsProvider {
    parent: Option<Weak<ContextFieldsProvider>>,
    state: Mutex<ContextState>,
}

impl Default for ContextFieldsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextFieldsProvider {
    /// Root provider with no parent
    pub fn new() -> Self {
        Self {
            parent: None,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// Child provider inheriting from `parent`
    pub fn with_parent(parent: &Arc<ContextFieldsProvider>) -> Self {
        Self {
            parent: Some(Arc::downgrade(parent)),
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn set_common_field(&self, name: impl Into<String>, value: EventProperty) {
        let mut state = self.state.lock().expect("context state poisoned");
        upsert(&mut state.common_fields, name.into(), value);
    }

    pub fn set_custom_field(&self, name: impl Into<String>, value: EventProperty) {
        let mut state = self.state.lock().expect("context state poisoned");
        upsert(&mut state.custom_fields, name.into(), value);
    }

    pub fn set_ticket(&self, ticket_type: TicketType, value: impl Into<String>) {
        let mut state = self.state.lock().expect("context state poisoned");
        state.tickets.insert(ticket_type, value.into());
    }

    /// Upsert the comma-joined config id string for one event name
    pub fn set_event_experiment_ids(
        &self,
        event_name: impl Into<String>,
        ids: impl Into<String>,
    ) {
        let mut state = self.state.lock().expect("context state poisoned");
        state
            .event_to_experiment_ids
            .insert(event_name.into(), ids.into());
    }

    pub fn clear_experiment_ids(&self) {
        let mut state = self.state.lock().expect("context state poisoned");
        state.event_to_experiment_ids.clear();
    }

    /// Stamp accumulated fields onto the event
    ///
    /// Resolution order is parent first, then self, so a child's value wins
    /// on name collision; within a level custom fields are applied after
    /// common fields. With `common_only` custom fields are skipped. Stamping
    /// twice with unchanged state yields an identical event.
    ///
    /// No two provider locks are held at once: the parent is visited before
    /// this provider's own state is locked, so the parent state observed is a
    /// snapshot and may lag a concurrent parent mutation.
    pub fn write_to_event(&self, event: &mut Event, common_only: bool) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.write_to_event(event, common_only);
        }

        let (common, custom, experiment_ids, tickets) = {
            let state = self.state.lock().expect("context state poisoned");
            (
                state.common_fields.clone(),
                if common_only {
                    Vec::new()
                } else {
                    state.custom_fields.clone()
                },
                state.event_to_experiment_ids.get(&event.name).cloned(),
                state.tickets.clone(),
            )
        };

        for (name, value) in common {
            event.set_property(name, value);
        }
        for (name, value) in custom {
            event.set_property(name, value);
        }
        for (ticket_type, value) in tickets {
            event.set_property(
                format!("{}{}", TICKET_FIELD_PREFIX, ticket_type.as_str()),
                EventProperty::str(value),
            );
        }
        if let Some(ids) = experiment_ids {
            event.set_property(EXPERIMENT_IDS_FIELD, EventProperty::str(ids));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PropertyValue;

    fn property_str(event: &Event, name: &str) -> Option<String> {
        event.get_property(name).and_then(|p| match &p.value {
            PropertyValue::Str(s) => Some(s.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_child_overrides_parent_and_custom_overrides_common() {
        let parent = Arc::new(ContextFieldsProvider::new());
        parent.set_common_field("app", EventProperty::str("foo"));

        let child = ContextFieldsProvider::with_parent(&parent);
        child.set_common_field("app", EventProperty::str("baz"));
        child.set_custom_field("user", EventProperty::str("bar"));

        let mut event = Event::new("t1", "page.view");
        child.write_to_event(&mut event, false);

        assert_eq!(property_str(&event, "app").as_deref(), Some("baz"));
        assert_eq!(property_str(&event, "user").as_deref(), Some("bar"));
    }

    #[test]
    fn test_custom_wins_over_common_within_a_level() {
        let provider = ContextFieldsProvider::new();
        provider.set_common_field("session", EventProperty::str("common"));
        provider.set_custom_field("session", EventProperty::str("custom"));

        let mut event = Event::new("t1", "page.view");
        provider.write_to_event(&mut event, false);

        assert_eq!(property_str(&event, "session").as_deref(), Some("custom"));
    }

    #[test]
    fn test_common_only_skips_custom_fields() {
        let provider = ContextFieldsProvider::new();
        provider.set_common_field("app", EventProperty::str("foo"));
        provider.set_custom_field("user", EventProperty::str("bar"));

        let mut event = Event::new("t1", "page.view");
        provider.write_to_event(&mut event, true);

        assert_eq!(property_str(&event, "app").as_deref(), Some("foo"));
        assert!(event.get_property("user").is_none());
    }

    #[test]
    fn test_parent_mutation_visible_to_child() {
        let parent = Arc::new(ContextFieldsProvider::new());
        let child = ContextFieldsProvider::with_parent(&parent);

        parent.set_common_field("region", EventProperty::str("eu"));
        let mut event = Event::new("t1", "page.view");
        child.write_to_event(&mut event, false);
        assert_eq!(property_str(&event, "region").as_deref(), Some("eu"));

        parent.set_common_field("region", EventProperty::str("us"));
        let mut event = Event::new("t1", "page.view");
        child.write_to_event(&mut event, false);
        assert_eq!(property_str(&event, "region").as_deref(), Some("us"));
    }

    #[test]
    fn test_child_mutation_does_not_touch_parent() {
        let parent = Arc::new(ContextFieldsProvider::new());
        parent.set_common_field("app", EventProperty::str("foo"));

        let child = ContextFieldsProvider::with_parent(&parent);
        child.set_common_field("app", EventProperty::str("baz"));

        let mut event = Event::new("t1", "page.view");
        parent.write_to_event(&mut event, false);
        assert_eq!(property_str(&event, "app").as_deref(), Some("foo"));
    }

    #[test]
    fn test_dead_parent_is_skipped() {
        let parent = Arc::new(ContextFieldsProvider::new());
        parent.set_common_field("app", EventProperty::str("foo"));
        let child = ContextFieldsProvider::with_parent(&parent);
        drop(parent);

        child.set_custom_field("user", EventProperty::str("bar"));
        let mut event = Event::new("t1", "page.view");
        child.write_to_event(&mut event, false);

        assert!(event.get_property("app").is_none());
        assert_eq!(property_str(&event, "user").as_deref(), Some("bar"));
    }

    #[test]
    fn test_tickets_and_experiment_ids() {
        let provider = ContextFieldsProvider::new();
        provider.set_ticket(TicketType::User, "ticket-123");
        provider.set_event_experiment_ids("page.view", "exp1,exp2");
        provider.set_event_experiment_ids("other.event", "exp9");

        let mut event = Event::new("t1", "page.view");
        provider.write_to_event(&mut event, false);

        assert_eq!(
            property_str(&event, "ticket.user").as_deref(),
            Some("ticket-123")
        );
        assert_eq!(
            property_str(&event, "app.experiment_ids").as_deref(),
            Some("exp1,exp2")
        );

        provider.clear_experiment_ids();
        let mut event = Event::new("t1", "page.view");
        provider.write_to_event(&mut event, false);
        assert!(event.get_property("app.experiment_ids").is_none());
    }

    #[test]
    fn test_stamping_is_idempotent() {
        let provider = ContextFieldsProvider::new();
        provider.set_common_field("app", EventProperty::str("foo"));
        provider.set_ticket(TicketType::Device, "d-1");

        let mut event = Event::new("t1", "page.view");
        provider.write_to_event(&mut event, false);
        let first = event.clone();
        provider.write_to_event(&mut event, false);

        assert_eq!(event.properties, first.properties);
    }
}
