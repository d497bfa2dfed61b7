use crate::error::SessionError;
use crate::protocol::{WidgetState, WidgetStates, WidgetValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Identity of a widget as reported by the UI when it submits a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WidgetInfo {
    pub id: String,
    pub form_id: Option<String>,
}

impl WidgetInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            form_id: None,
        }
    }

    pub fn in_form(id: impl Into<String>, form_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            form_id: Some(form_id.into()),
        }
    }

    fn form(&self) -> Option<&str> {
        self.form_id.as_deref().filter(|form_id| !form_id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetEntry {
    pub id: String,
    pub value: WidgetValue,
    pub is_in_form: bool,
    pub form_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOutcome {
    /// Stored and should be reported to the server.
    Committed,
    /// Buffered until the owning form is submitted.
    HeldForForm,
}

#[derive(Debug, Clone, Default)]
struct FormState {
    pending: BTreeMap<String, WidgetEntry>,
    uploads_in_progress: u32,
}

impl FormState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.uploads_in_progress == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct WidgetStateStore {
    widgets: BTreeMap<String, WidgetEntry>,
    forms: HashMap<String, FormState>,
}

impl WidgetStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, widget: &WidgetInfo, value: WidgetValue) -> ValueOutcome {
        let entry = WidgetEntry {
            id: widget.id.clone(),
            value,
            is_in_form: widget.form().is_some(),
            form_id: widget.form().map(str::to_string),
        };

        match widget.form() {
            Some(form_id) => {
                self.forms
                    .entry(form_id.to_string())
                    .or_default()
                    .pending
                    .insert(widget.id.clone(), entry);
                ValueOutcome::HeldForForm
            }
            None => {
                self.widgets.insert(widget.id.clone(), entry);
                ValueOutcome::Committed
            }
        }
    }

    /// Triggers are one-shot: they are reported once and then cleared with
    /// [`WidgetStateStore::clear_triggers`].
    pub fn set_trigger(&mut self, widget: &WidgetInfo) {
        self.widgets.insert(
            widget.id.clone(),
            WidgetEntry {
                id: widget.id.clone(),
                value: WidgetValue::TriggerValue(true),
                is_in_form: widget.form().is_some(),
                form_id: widget.form().map(str::to_string),
            },
        );
    }

    pub fn clear_triggers(&mut self) {
        self.widgets
            .retain(|_, entry| !matches!(entry.value, WidgetValue::TriggerValue(_)));
    }

    pub fn get(&self, id: &str) -> Option<&WidgetEntry> {
        self.widgets.get(id)
    }

    pub fn pending_form_value(&self, form_id: &str, id: &str) -> Option<&WidgetEntry> {
        self.forms.get(form_id)?.pending.get(id)
    }

    pub fn has_pending_changes(&self, form_id: &str) -> bool {
        self.forms
            .get(form_id)
            .is_some_and(|form| !form.pending.is_empty())
    }

    pub fn set_uploads_in_progress(&mut self, form_id: &str, count: u32) {
        let form = self.forms.entry(form_id.to_string()).or_default();
        form.uploads_in_progress = count;
        if form.is_idle() {
            self.forms.remove(form_id);
        }
    }

    pub fn uploads_in_progress(&self, form_id: &str) -> u32 {
        self.forms
            .get(form_id)
            .map(|form| form.uploads_in_progress)
            .unwrap_or(0)
    }

    /// Moves the form's buffered values into the committed store. Returns
    /// how many values were committed.
    pub fn submit_form(&mut self, form_id: &str) -> Result<usize, SessionError> {
        let count = self.uploads_in_progress(form_id);
        if count > 0 {
            return Err(SessionError::UploadsInProgress {
                form_id: form_id.to_string(),
                count,
            });
        }

        let Some(form) = self.forms.remove(form_id) else {
            return Ok(0);
        };

        let committed = form.pending.len();
        self.widgets.extend(form.pending);
        Ok(committed)
    }

    /// Forgets every widget (committed or buffered in a form) whose id is not
    /// in `active_ids`.
    pub fn remove_inactive(&mut self, active_ids: &HashSet<String>) {
        let before = self.widgets.len();
        self.widgets.retain(|id, _| active_ids.contains(id));

        for form in self.forms.values_mut() {
            form.pending.retain(|id, _| active_ids.contains(id));
        }
        self.forms.retain(|_, form| !form.is_idle());

        let removed = before - self.widgets.len();
        if removed > 0 {
            debug!(removed, remaining = self.widgets.len(), "pruned inactive widgets");
        }
    }

    pub fn clear(&mut self) {
        self.widgets.clear();
        self.forms.clear();
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.widgets.keys().map(String::as_str)
    }

    pub fn widget_states(&self) -> WidgetStates {
        WidgetStates {
            widgets: self
                .widgets
                .values()
                .map(|entry| WidgetState {
                    id: entry.id.clone(),
                    value: entry.value.clone(),
                })
                .collect(),
        }
    }
}
