//! Session core: routes inbound envelopes and user intents to their
//! handlers and reports the outcome as a list of [`Effect`]s.
//!
//! Handlers run to completion on the caller's thread. Nothing here blocks or
//! sleeps; the only deferred work is the debounced tree flush, driven by the
//! host through [`SessionCore::next_deadline`] and [`SessionCore::poll_timers`].

use crate::config::SessionConfig;
use crate::connection::{ConnectionState, ConnectionTransition, classify};
use crate::element_tree::ElementTree;
use crate::error::{ProtocolError, SessionError};
use crate::mutation_buffer::MutationBuffer;
use crate::protocol::{
    AppConfig, BackMsg, ClientState, Delta, ExceptionInfo, ForwardMsgType, GitInfo, NewSession,
    PageConfig, PageDescriptor, PageProfile, RawForwardMsg, ScriptFinishedStatus, SessionEvent,
    SessionStatus, WidgetValue,
};
use crate::run_state::ScriptRunState;
use crate::session_identity::{
    RunIdentity, SessionMetadata, compute_app_hash, continues_same_app, is_newer_version,
};
use crate::widget_state::{ValueOutcome, WidgetInfo, WidgetStateStore};
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Work the host must carry out after a handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(BackMsg),
    Publish(ElementTree),
    Notify(Notification),
    /// The server runs a newer version; incremental sync is unsafe.
    Reload {
        server_version: String,
        recorded_version: String,
    },
    SessionInitialized(SessionMetadata),
    ScriptRunStateChanged(ScriptRunState),
    PageChanged {
        page_script_hash: String,
        page_name: String,
    },
    AppPagesChanged(Vec<PageDescriptor>),
    PageConfigChanged(PageConfig),
    QueryStringChanged(String),
    GitInfoChanged(GitInfo),
    PageProfile {
        metadata: SessionMetadata,
        profile: PageProfile,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    ProtocolWarning,
    CompilationError(ExceptionInfo),
    PageNotFound { page_name: String },
    ScriptChangedOnDisk,
    ConnectionLost,
    ConnectionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    fn new(level: NotificationLevel, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
        }
    }

    /// Blocking notifications hold the UI until dismissed.
    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, NotificationKind::CompilationError(_))
    }
}

/// Requests originating from the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum UserIntent {
    RerunScript,
    StopScript,
    SetRunOnSave(bool),
    ClearCache,
    LoadGitInfo,
    SetWidgetValue { widget: WidgetInfo, value: WidgetValue },
    TriggerWidget(WidgetInfo),
    SubmitForm(String),
    SetFormUploads { form_id: String, count: u32 },
    ChangePage(String),
    DebugShutdownRuntime,
    DebugDisconnectWebsocket,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFinished {
    pub script_run_id: String,
    pub status: ScriptFinishedStatus,
}

pub type ScriptFinishedListener = Box<dyn FnMut(&ScriptFinished) + Send>;

pub struct SessionCore {
    config: SessionConfig,
    run_state: ScriptRunState,
    connection: ConnectionState,
    metadata: Option<SessionMetadata>,
    script_run_id: String,
    run_on_save: bool,
    app_config: AppConfig,
    page_config: PageConfig,
    query_string: String,
    git_info: Option<GitInfo>,
    script_changed_on_disk: bool,
    buffer: MutationBuffer,
    widgets: WidgetStateStore,
    script_finished_listeners: Vec<ScriptFinishedListener>,
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("run_state", &self.run_state)
            .field("connection", &self.connection)
            .field("script_run_id", &self.script_run_id)
            .field("metadata", &self.metadata)
            .field("widgets", &self.widgets.len())
            .field("listeners", &self.script_finished_listeners.len())
            .finish_non_exhaustive()
    }
}

impl SessionCore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            run_state: ScriptRunState::default(),
            connection: ConnectionState::default(),
            metadata: None,
            script_run_id: String::new(),
            run_on_save: false,
            app_config: AppConfig::default(),
            page_config: PageConfig::default(),
            query_string: String::new(),
            git_info: None,
            script_changed_on_disk: false,
            buffer: MutationBuffer::new(),
            widgets: WidgetStateStore::new(),
            script_finished_listeners: Vec::new(),
        }
    }

    pub fn run_state(&self) -> ScriptRunState {
        self.run_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn metadata(&self) -> Option<&SessionMetadata> {
        self.metadata.as_ref()
    }

    pub fn script_run_id(&self) -> &str {
        &self.script_run_id
    }

    pub fn published_tree(&self) -> &ElementTree {
        self.buffer.published()
    }

    pub fn widgets(&self) -> &WidgetStateStore {
        &self.widgets
    }

    pub fn run_on_save(&self) -> bool {
        self.run_on_save
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    pub fn page_config(&self) -> &PageConfig {
        &self.page_config
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn git_info(&self) -> Option<&GitInfo> {
        self.git_info.as_ref()
    }

    pub fn script_changed_on_disk(&self) -> bool {
        self.script_changed_on_disk
    }

    /// Registers a callback run after each completed run, once the final
    /// tree has been published and, for full runs, widgets pruned.
    pub fn subscribe_script_finished(&mut self, listener: ScriptFinishedListener) {
        self.script_finished_listeners.push(listener);
    }

    /// Top-level entry for inbound envelopes. Protocol errors stop here and
    /// come back as a warning notification.
    pub fn handle_envelope(&mut self, raw: &RawForwardMsg, now: Instant) -> Vec<Effect> {
        match self.dispatch(raw, now) {
            Ok(effects) => effects,
            Err(err) => self.report_protocol_error(&err),
        }
    }

    pub fn report_protocol_error(&self, err: &ProtocolError) -> Vec<Effect> {
        warn!(error = %err, "dropping inbound message");
        vec![Effect::Notify(Notification::new(
            NotificationLevel::Warning,
            NotificationKind::ProtocolWarning,
            err.to_string(),
        ))]
    }

    pub fn dispatch(&mut self, raw: &RawForwardMsg, now: Instant) -> Result<Vec<Effect>, ProtocolError> {
        let msg = raw.decode_variant()?;
        let mut effects = Vec::new();

        match msg {
            ForwardMsgType::NewSession(new_session) => {
                self.handle_new_session(new_session, &mut effects)
            }
            ForwardMsgType::SessionStatusChanged(status) => {
                self.handle_session_status(status, &mut effects)
            }
            ForwardMsgType::SessionEvent(event) => self.handle_session_event(event, &mut effects),
            ForwardMsgType::Delta(delta) => {
                let path = raw.delta_path().ok_or(ProtocolError::MissingDeltaPath)?;
                self.handle_delta(path, &delta, now)?;
            }
            ForwardMsgType::PageConfigChanged(page_config) => {
                self.page_config = page_config.clone();
                effects.push(Effect::PageConfigChanged(page_config));
            }
            ForwardMsgType::PageInfoChanged(page_info) => {
                self.query_string = page_info.query_string.clone();
                effects.push(Effect::QueryStringChanged(page_info.query_string));
            }
            ForwardMsgType::PagesChanged(pages) => {
                if let Some(metadata) = self.metadata.as_mut() {
                    metadata.app_pages = pages.app_pages.clone();
                }
                effects.push(Effect::AppPagesChanged(pages.app_pages));
            }
            ForwardMsgType::PageNotFound(not_found) => {
                self.handle_page_not_found(&not_found.page_name, &mut effects)
            }
            ForwardMsgType::GitInfoChanged(git_info) => {
                self.git_info = Some(git_info.clone());
                effects.push(Effect::GitInfoChanged(git_info));
            }
            ForwardMsgType::ScriptFinished(status) => {
                self.handle_script_finished(status, &mut effects)
            }
            ForwardMsgType::PageProfile(profile) => effects.push(Effect::PageProfile {
                metadata: self.metadata.clone().unwrap_or_default(),
                profile,
            }),
        }

        Ok(effects)
    }

    fn handle_new_session(&mut self, new_session: NewSession, effects: &mut Vec<Effect>) {
        let initialize = &new_session.initialize;

        let recorded_version = self
            .metadata
            .as_ref()
            .map(|metadata| metadata.server_version.clone())
            .or_else(|| self.config.client_version.clone());
        if let Some(recorded_version) = recorded_version {
            if is_newer_version(&initialize.server_version, &recorded_version) {
                warn!(
                    server_version = %initialize.server_version,
                    %recorded_version,
                    "server version changed; reload required"
                );
                effects.push(Effect::Reload {
                    server_version: initialize.server_version.clone(),
                    recorded_version,
                });
                return;
            }
        }

        let identity = RunIdentity {
            script_run_id: new_session.script_run_id.clone(),
            app_hash: compute_app_hash(&initialize.installation_id, &new_session.main_script_path),
            main_script_path: new_session.main_script_path.clone(),
            page_script_hash: new_session.page_script_hash.clone(),
        };

        let first_session = self.metadata.is_none();
        let continues = self
            .metadata
            .as_ref()
            .is_some_and(|metadata| continues_same_app(metadata, &identity));
        let previous_page = self
            .metadata
            .as_ref()
            .map(|metadata| metadata.current_page_script_hash.clone());
        let pages_changed = self
            .metadata
            .as_ref()
            .is_none_or(|metadata| metadata.app_pages != new_session.app_pages);

        let mut metadata = self.metadata.take().unwrap_or_default();
        if first_session {
            metadata.installation_id = initialize.installation_id.clone();
            metadata.session_id = initialize.session_id.clone();
        }
        metadata.server_version = initialize.server_version.clone();
        metadata.app_hash = identity.app_hash.clone();
        metadata.main_script_path = identity.main_script_path.clone();
        metadata.current_page_script_hash = identity.page_script_hash.clone();
        metadata.app_pages = new_session.app_pages.clone();

        if first_session {
            info!(
                session_id = %metadata.session_id,
                app_hash = %metadata.app_hash,
                "session initialized"
            );
            effects.push(Effect::SessionInitialized(metadata.clone()));
        }

        self.app_config = new_session.config.clone();
        self.handle_session_status(initialize.session_status, effects);

        if continues {
            debug!(
                run_id = %identity.script_run_id,
                "new run continues current app"
            );
        } else {
            info!(
                run_id = %identity.script_run_id,
                app_hash = %identity.app_hash,
                page = %identity.page_script_hash,
                "new app or page; resetting element tree and widget state"
            );
            self.widgets.clear();
            effects.push(Effect::Publish(self.buffer.reset()));
        }
        self.script_run_id = identity.script_run_id;

        if previous_page.as_deref() != Some(metadata.current_page_script_hash.as_str()) {
            effects.push(Effect::PageChanged {
                page_script_hash: metadata.current_page_script_hash.clone(),
                page_name: metadata
                    .page_name(&metadata.current_page_script_hash)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if pages_changed {
            effects.push(Effect::AppPagesChanged(metadata.app_pages.clone()));
        }

        self.metadata = Some(metadata);
    }

    fn handle_session_status(&mut self, status: SessionStatus, effects: &mut Vec<Effect>) {
        self.run_on_save = status.run_on_save;
        let next = self.run_state.on_session_status(status.script_is_running);
        self.transition(next, effects);
    }

    fn handle_session_event(&mut self, event: SessionEvent, effects: &mut Vec<Effect>) {
        match event {
            SessionEvent::ScriptChangedOnDisk(true) => {
                self.script_changed_on_disk = true;
                effects.push(Effect::Notify(Notification::new(
                    NotificationLevel::Info,
                    NotificationKind::ScriptChangedOnDisk,
                    "source file changed",
                )));
            }
            SessionEvent::ScriptWasManuallyStopped(true) => {
                let next = self.run_state.on_manual_stop();
                self.transition(next, effects);
            }
            SessionEvent::ScriptCompilationException(exception) => {
                let next = self.run_state.on_compilation_error();
                self.transition(next, effects);
                let message = format!("{}: {}", exception.kind, exception.message);
                effects.push(Effect::Notify(Notification::new(
                    NotificationLevel::Error,
                    NotificationKind::CompilationError(exception),
                    message,
                )));
            }
            SessionEvent::ScriptChangedOnDisk(false) | SessionEvent::ScriptWasManuallyStopped(false) => {}
        }
    }

    fn handle_delta(&mut self, path: &[u32], delta: &Delta, now: Instant) -> Result<(), ProtocolError> {
        self.buffer.apply_patch(
            path,
            delta,
            &self.script_run_id,
            now,
            self.run_state.is_running(),
        )?;
        Ok(())
    }

    fn handle_page_not_found(&mut self, page_name: &str, effects: &mut Vec<Effect>) {
        let fallback = self
            .metadata
            .as_mut()
            .and_then(|metadata| {
                let first = metadata.app_pages.first()?.clone();
                metadata.current_page_script_hash = first.page_script_hash.clone();
                Some(first)
            });

        let Some(fallback) = fallback else {
            error!(page_name, "{}", SessionError::NoAppPages);
            return;
        };

        warn!(page_name, fallback = %fallback.page_name, "page not found");
        effects.push(Effect::Notify(Notification::new(
            NotificationLevel::Warning,
            NotificationKind::PageNotFound {
                page_name: page_name.to_string(),
            },
            format!("page '{page_name}' not found; showing '{}'", fallback.page_name),
        )));
        effects.push(Effect::PageChanged {
            page_script_hash: fallback.page_script_hash,
            page_name: fallback.page_name,
        });
    }

    fn handle_script_finished(&mut self, status: ScriptFinishedStatus, effects: &mut Vec<Effect>) {
        if !status.completed_run() {
            debug!(?status, "script finished without output");
            return;
        }

        if status.triggers_reconciliation() {
            let tree = self.buffer.finish_run(&self.script_run_id);
            let active_ids = tree.widget_ids();
            effects.push(Effect::Publish(tree));
            self.widgets.remove_inactive(&active_ids);
        } else {
            effects.push(Effect::Publish(self.buffer.finish_fragment()));
        }

        let finished = ScriptFinished {
            script_run_id: self.script_run_id.clone(),
            status,
        };
        debug!(run_id = %finished.script_run_id, ?status, "run finished");
        for listener in &mut self.script_finished_listeners {
            listener(&finished);
        }
    }

    pub fn on_connection_state_changed(&mut self, next: ConnectionState) -> Vec<Effect> {
        let previous = self.connection;
        self.connection = next;
        let mut effects = Vec::new();

        match classify(previous, next) {
            ConnectionTransition::Established => {
                info!(?previous, "connected");
                if self.metadata.is_some() {
                    let states = self.widgets.widget_states();
                    // Cannot fail: the connection was just established.
                    let _ = self.send(BackMsg::UpdateWidgets(states), &mut effects);
                }
            }
            ConnectionTransition::Lost => {
                warn!(?next, "connection lost");
                let state = self.run_state.on_connection_lost();
                self.transition(state, &mut effects);
                effects.push(Effect::Notify(Notification::new(
                    NotificationLevel::Warning,
                    NotificationKind::ConnectionLost,
                    "connection to the server was lost",
                )));
            }
            ConnectionTransition::Closed => {
                error!("connection closed permanently");
                let state = self.run_state.on_connection_lost();
                self.transition(state, &mut effects);
                effects.push(Effect::Notify(Notification::new(
                    NotificationLevel::Error,
                    NotificationKind::ConnectionClosed,
                    "connection to the server was closed",
                )));
            }
            ConnectionTransition::Progress | ConnectionTransition::Unchanged => {}
        }

        effects
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffer.next_deadline()
    }

    pub fn poll_timers(&mut self, now: Instant) -> Vec<Effect> {
        self.buffer
            .poll(now)
            .map(Effect::Publish)
            .into_iter()
            .collect()
    }

    pub fn apply_intent(&mut self, intent: UserIntent) -> Result<Vec<Effect>, SessionError> {
        match intent {
            UserIntent::RerunScript => self.rerun_script(),
            UserIntent::StopScript => self.stop_script(),
            UserIntent::SetRunOnSave(enabled) => self.set_run_on_save(enabled),
            UserIntent::ClearCache => self.clear_cache(),
            UserIntent::LoadGitInfo => self.load_git_info(),
            UserIntent::SetWidgetValue { widget, value } => self.set_widget_value(&widget, value),
            UserIntent::TriggerWidget(widget) => self.trigger_widget(&widget),
            UserIntent::SubmitForm(form_id) => self.submit_form(&form_id),
            UserIntent::SetFormUploads { form_id, count } => {
                self.set_form_uploads_in_progress(&form_id, count);
                Ok(Vec::new())
            }
            UserIntent::ChangePage(page_script_hash) => self.request_page_change(&page_script_hash),
            UserIntent::DebugShutdownRuntime => self.debug_shutdown_runtime(),
            UserIntent::DebugDisconnectWebsocket => self.debug_disconnect_websocket(),
        }
    }

    /// Explicit rerun. Dropped while a run is in progress or already requested.
    pub fn rerun_script(&mut self) -> Result<Vec<Effect>, SessionError> {
        let next = self.run_state.on_rerun_requested();
        if next == self.run_state {
            debug!(state = ?self.run_state, "rerun request dropped");
            return Ok(Vec::new());
        }

        let mut effects = Vec::new();
        self.send(self.rerun_msg(None), &mut effects)?;
        self.script_changed_on_disk = false;
        self.transition(next, &mut effects);
        Ok(effects)
    }

    pub fn stop_script(&mut self) -> Result<Vec<Effect>, SessionError> {
        let next = self.run_state.on_stop_requested();
        if next == self.run_state {
            debug!(state = ?self.run_state, "stop request dropped");
            return Ok(Vec::new());
        }

        let mut effects = Vec::new();
        self.send(BackMsg::StopScript, &mut effects)?;
        self.transition(next, &mut effects);
        Ok(effects)
    }

    pub fn set_run_on_save(&mut self, enabled: bool) -> Result<Vec<Effect>, SessionError> {
        self.send_only(BackMsg::SetRunOnSave(enabled))
    }

    pub fn clear_cache(&mut self) -> Result<Vec<Effect>, SessionError> {
        self.send_only(BackMsg::ClearCache)
    }

    pub fn load_git_info(&mut self) -> Result<Vec<Effect>, SessionError> {
        self.send_only(BackMsg::LoadGitInfo)
    }

    /// Stores a widget value. Values outside forms trigger a rerun; form
    /// members wait for the form to be submitted.
    pub fn set_widget_value(
        &mut self,
        widget: &WidgetInfo,
        value: WidgetValue,
    ) -> Result<Vec<Effect>, SessionError> {
        match self.widgets.set_value(widget, value) {
            ValueOutcome::HeldForForm => Ok(Vec::new()),
            ValueOutcome::Committed => self.send_only(self.rerun_msg(None)),
        }
    }

    /// Records a value without reporting it, e.g. a widget's default on mount.
    pub fn register_widget_value(&mut self, widget: &WidgetInfo, value: WidgetValue) {
        self.widgets.set_value(widget, value);
    }

    pub fn trigger_widget(&mut self, widget: &WidgetInfo) -> Result<Vec<Effect>, SessionError> {
        self.widgets.set_trigger(widget);
        let result = self.send_only(self.rerun_msg(None));
        self.widgets.clear_triggers();
        result
    }

    pub fn submit_form(&mut self, form_id: &str) -> Result<Vec<Effect>, SessionError> {
        let committed = self.widgets.submit_form(form_id)?;
        debug!(form_id, committed, "form submitted");
        self.send_only(self.rerun_msg(None))
    }

    pub fn set_form_uploads_in_progress(&mut self, form_id: &str, count: u32) {
        self.widgets.set_uploads_in_progress(form_id, count);
    }

    pub fn request_page_change(&mut self, page_script_hash: &str) -> Result<Vec<Effect>, SessionError> {
        let known = self
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.page_name(page_script_hash))
            .is_some();
        if !known {
            return Err(SessionError::UnknownPage(page_script_hash.to_string()));
        }
        self.send_only(self.rerun_msg(Some(page_script_hash)))
    }

    pub fn debug_shutdown_runtime(&mut self) -> Result<Vec<Effect>, SessionError> {
        if !self.config.debug_enabled {
            return Err(SessionError::DebugDisabled);
        }
        self.send_only(BackMsg::DebugShutdownRuntime)
    }

    pub fn debug_disconnect_websocket(&mut self) -> Result<Vec<Effect>, SessionError> {
        if !self.config.debug_enabled {
            return Err(SessionError::DebugDisabled);
        }
        self.send_only(BackMsg::DebugDisconnectWebsocket)
    }

    fn rerun_msg(&self, page_change: Option<&str>) -> BackMsg {
        let current_page = self
            .metadata
            .as_ref()
            .map(|metadata| metadata.current_page_script_hash.as_str())
            .unwrap_or_default();

        let state = match page_change {
            Some(page_script_hash) => ClientState {
                // Query parameters belong to the page being left.
                query_string: String::new(),
                widget_states: self.widgets.widget_states(),
                page_script_hash: page_script_hash.to_string(),
                page_name: self
                    .metadata
                    .as_ref()
                    .and_then(|metadata| metadata.page_name(page_script_hash))
                    .unwrap_or_default()
                    .to_string(),
            },
            None => ClientState {
                query_string: self.query_string.clone(),
                widget_states: self.widgets.widget_states(),
                page_script_hash: current_page.to_string(),
                page_name: String::new(),
            },
        };
        BackMsg::RerunScript(state)
    }

    fn send_only(&self, msg: BackMsg) -> Result<Vec<Effect>, SessionError> {
        let mut effects = Vec::new();
        self.send(msg, &mut effects)?;
        Ok(effects)
    }

    fn send(&self, msg: BackMsg, effects: &mut Vec<Effect>) -> Result<(), SessionError> {
        if !self.connection.is_connected() {
            warn!(msg = msg.name(), "{}", SessionError::Disconnected);
            return Err(SessionError::Disconnected);
        }
        effects.push(Effect::Send(msg));
        Ok(())
    }

    fn transition(&mut self, next: ScriptRunState, effects: &mut Vec<Effect>) {
        if next == self.run_state {
            return;
        }
        debug!(from = ?self.run_state, to = ?next, "script run state");
        self.run_state = next;
        effects.push(Effect::ScriptRunStateChanged(next));
    }
}
