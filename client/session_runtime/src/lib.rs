pub mod config;
pub mod connection;
pub mod debug;
pub mod element_tree;
pub mod error;
pub mod logging;
pub mod mutation_buffer;
pub mod protocol;
pub mod run_state;
pub mod session;
pub mod session_identity;
pub mod widget_state;

use crate::protocol::{
    BackMsg, GitInfo, PageConfig, PageDescriptor, PageProfile, RawForwardMsg, reader_loop,
    writer_loop,
};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub use crate::config::SessionConfig;
pub use crate::connection::ConnectionState;
pub use crate::debug::DebugControl;
pub use crate::element_tree::{AppNode, ElementTree};
pub use crate::error::{HostError, ProtocolError, SessionError, TreeError};
pub use crate::protocol::{CLIENT_TO_SERVER_CAP, SERVER_TO_CLIENT_CAP};
pub use crate::run_state::ScriptRunState;
pub use crate::session::{Effect, Notification, SessionCore, UserIntent};
pub use crate::session_identity::SessionMetadata;
pub use crate::widget_state::WidgetInfo;
pub use serde_json;

/// Presentation side of the session. Only `publish` and `notify` are
/// required; the remaining hooks default to no-ops.
pub trait Renderer {
    fn publish(&mut self, tree: &ElementTree);
    fn notify(&mut self, notification: &Notification);

    fn session_initialized(&mut self, _metadata: &SessionMetadata) {}
    fn run_state_changed(&mut self, _state: ScriptRunState) {}
    fn page_changed(&mut self, _page_script_hash: &str, _page_name: &str) {}
    fn app_pages_changed(&mut self, _pages: &[PageDescriptor]) {}
    fn page_config_changed(&mut self, _page_config: &PageConfig) {}
    fn query_string_changed(&mut self, _query_string: &str) {}
    fn git_info_changed(&mut self, _git_info: &GitInfo) {}
    fn page_profile(&mut self, _metadata: &SessionMetadata, _profile: &PageProfile) {}
}

#[derive(Debug)]
pub(crate) enum HostEvent {
    Inbound(Result<RawForwardMsg, ProtocolError>),
    Connection(ConnectionState),
    Intent(UserIntent),
    InboundClosed,
}

/// Cloneable entry point for the UI thread(s). Every call is queued and
/// handled on the session loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: Sender<HostEvent>,
}

impl SessionHandle {
    pub(crate) fn from_sender(tx: Sender<HostEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the session loop has exited.
    pub fn submit(&self, intent: UserIntent) -> bool {
        self.tx.send(HostEvent::Intent(intent)).is_ok()
    }

    /// Reports a transport state change owned outside the session.
    pub fn set_connection_state(&self, state: ConnectionState) -> bool {
        self.tx.send(HostEvent::Connection(state)).is_ok()
    }
}

pub struct SessionHost {
    config: SessionConfig,
    core: SessionCore,
    events_tx: Sender<HostEvent>,
    events_rx: Receiver<HostEvent>,
}

impl SessionHost {
    pub fn new(config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            core: SessionCore::new(config.clone()),
            config,
            events_tx,
            events_rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::from_sender(self.events_tx.clone())
    }

    pub fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    /// Runs the session over length-prefixed frames on stdin/stdout until
    /// the inbound stream closes. A required reload surfaces as
    /// [`HostError::ReloadRequired`].
    pub fn run_stdio<R: Renderer>(self, renderer: &mut R) -> Result<(), HostError> {
        let SessionHost {
            config,
            mut core,
            events_tx,
            events_rx,
        } = self;

        let (back_tx, back_rx) = mpsc::sync_channel(config.outbound_queue_cap);
        let writer_handle = thread::spawn(move || writer_loop(back_rx));

        let reader_tx = events_tx.clone();
        let max_inbound_frame = config.max_inbound_frame;
        let reader_handle = thread::spawn(move || {
            let read_result = reader_loop(max_inbound_frame, |msg| {
                let _ = reader_tx.send(HostEvent::Inbound(msg));
            });

            if let Err(err) = &read_result {
                error!(error = %err, "reader loop terminated");
            }
            let _ = reader_tx.send(HostEvent::InboundClosed);
            read_result
        });
        drop(events_tx);

        let mut outbound = Outbound::new(back_tx, config.outbound_queue_cap);

        // A byte stream is connected as soon as it exists.
        let mut result = apply_effects(
            core.on_connection_state_changed(ConnectionState::Connecting),
            &mut outbound,
            renderer,
        );
        if result.is_ok() {
            result = apply_effects(
                core.on_connection_state_changed(ConnectionState::Connected),
                &mut outbound,
                renderer,
            );
        }
        if result.is_ok() {
            result = drive(&mut core, &events_rx, &mut outbound, renderer);
        }

        // Closing the queue lets the writer drain and exit.
        drop(outbound);

        if reader_handle.is_finished() {
            match reader_handle.join() {
                Ok(Ok(())) => {}
                // A broken transport outranks a clean shutdown.
                Ok(Err(err)) => {
                    if result.is_ok() {
                        result = Err(HostError::Io(err));
                    }
                }
                Err(err) => error!(?err, "reader thread join failed"),
            }
        } else {
            // Avoid hanging process exit on a blocked stdio read during teardown.
            debug!("reader thread still active during shutdown; skipping join");
        }

        match writer_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "writer thread returned error"),
            Err(err) => error!(?err, "writer thread join failed"),
        }

        result
    }
}

struct Outbound {
    tx: SyncSender<BackMsg>,
    capacity: usize,
    dropped: u64,
}

impl Outbound {
    fn new(tx: SyncSender<BackMsg>, capacity: usize) -> Self {
        Self {
            tx,
            capacity,
            dropped: 0,
        }
    }

    /// Never blocks the session loop; a full queue drops the message.
    fn enqueue(&mut self, msg: BackMsg) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.dropped += 1;
                if self.dropped == 1 || self.dropped.is_power_of_two() {
                    warn!(
                        capacity = self.capacity,
                        dropped = self.dropped,
                        msg = msg.name(),
                        "outbound queue full; message dropped"
                    );
                }
            }
            Err(TrySendError::Disconnected(msg)) => {
                error!(msg = msg.name(), "outbound writer closed; message dropped");
            }
        }
    }
}

fn drive<R: Renderer>(
    core: &mut SessionCore,
    events: &Receiver<HostEvent>,
    outbound: &mut Outbound,
    renderer: &mut R,
) -> Result<(), HostError> {
    loop {
        let event = match core.next_deadline() {
            Some(due) => match events.recv_timeout(due.saturating_duration_since(Instant::now())) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            },
            None => match events.recv() {
                Ok(event) => Some(event),
                Err(_) => return Ok(()),
            },
        };

        let now = Instant::now();
        let mut finished = false;
        let mut effects = match event {
            None => Vec::new(),
            Some(HostEvent::Inbound(Ok(raw))) => core.handle_envelope(&raw, now),
            Some(HostEvent::Inbound(Err(err))) => core.report_protocol_error(&err),
            Some(HostEvent::Connection(state)) => core.on_connection_state_changed(state),
            Some(HostEvent::Intent(intent)) => core.apply_intent(intent).unwrap_or_else(|err| {
                warn!(error = %err, "intent rejected");
                Vec::new()
            }),
            Some(HostEvent::InboundClosed) => {
                info!("inbound stream closed");
                finished = true;
                core.on_connection_state_changed(ConnectionState::DisconnectedForever)
            }
        };
        effects.extend(core.poll_timers(now));
        apply_effects(effects, outbound, renderer)?;

        if finished {
            return Ok(());
        }
    }
}

fn apply_effects<R: Renderer>(
    effects: Vec<Effect>,
    outbound: &mut Outbound,
    renderer: &mut R,
) -> Result<(), HostError> {
    for effect in effects {
        match effect {
            Effect::Send(msg) => outbound.enqueue(msg),
            Effect::Publish(tree) => renderer.publish(&tree),
            Effect::Notify(notification) => renderer.notify(&notification),
            Effect::Reload { server_version, .. } => {
                return Err(HostError::ReloadRequired(server_version));
            }
            Effect::SessionInitialized(metadata) => renderer.session_initialized(&metadata),
            Effect::ScriptRunStateChanged(state) => renderer.run_state_changed(state),
            Effect::PageChanged {
                page_script_hash,
                page_name,
            } => renderer.page_changed(&page_script_hash, &page_name),
            Effect::AppPagesChanged(pages) => renderer.app_pages_changed(&pages),
            Effect::PageConfigChanged(page_config) => renderer.page_config_changed(&page_config),
            Effect::QueryStringChanged(query_string) => renderer.query_string_changed(&query_string),
            Effect::GitInfoChanged(git_info) => renderer.git_info_changed(&git_info),
            Effect::PageProfile { metadata, profile } => renderer.page_profile(&metadata, &profile),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Element;
    use crate::session::NotificationKind;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingRenderer {
        published: Vec<ElementTree>,
        notifications: Vec<Notification>,
        run_states: Vec<ScriptRunState>,
    }

    impl Renderer for RecordingRenderer {
        fn publish(&mut self, tree: &ElementTree) {
            self.published.push(tree.clone());
        }

        fn notify(&mut self, notification: &Notification) {
            self.notifications.push(notification.clone());
        }

        fn run_state_changed(&mut self, state: ScriptRunState) {
            self.run_states.push(state);
        }
    }

    fn new_session(run_id: &str, version: &str) -> RawForwardMsg {
        RawForwardMsg::new(
            "newSession",
            json!({
                "initialize": {
                    "serverVersion": version,
                    "installationId": "i",
                    "sessionId": "s",
                    "sessionStatus": {"scriptIsRunning": true}
                },
                "scriptRunId": run_id,
                "mainScriptPath": "app.py",
                "pageScriptHash": "p1",
                "appPages": [{"pageScriptHash": "p1", "pageName": "main"}]
            }),
        )
    }

    fn connected(core: &mut SessionCore) {
        core.on_connection_state_changed(ConnectionState::Connected);
    }

    #[test]
    fn outbound_drops_when_queue_is_full() {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut outbound = Outbound::new(tx, 1);

        outbound.enqueue(BackMsg::ClearCache);
        outbound.enqueue(BackMsg::StopScript);

        assert_eq!(outbound.dropped, 1);
        assert_eq!(rx.try_recv().expect("first message stays queued"), BackMsg::ClearCache);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn drive_publishes_reconciled_tree_and_closes() {
        let mut core = SessionCore::new(SessionConfig::default());
        connected(&mut core);
        let (events_tx, events_rx) = mpsc::channel();
        let (back_tx, _back_rx) = mpsc::sync_channel(8);
        let mut outbound = Outbound::new(back_tx, 8);
        let mut renderer = RecordingRenderer::default();

        let delta = RawForwardMsg::new("delta", json!({"newElement": Element::new("text")}))
            .with_delta_path(vec![0]);
        let finished = RawForwardMsg::new("scriptFinished", json!("FINISHED_SUCCESSFULLY"));
        for msg in [new_session("r1", "1.0.0"), delta, finished] {
            events_tx
                .send(HostEvent::Inbound(Ok(msg)))
                .expect("queue inbound");
        }
        events_tx
            .send(HostEvent::InboundClosed)
            .expect("queue close");

        drive(&mut core, &events_rx, &mut outbound, &mut renderer).expect("drive");

        let last = renderer.published.last().expect("published tree");
        assert_eq!(last.elements().len(), 1);
        assert_eq!(last.get(&[0]).map(AppNode::script_run_id), Some("r1"));
        assert!(
            renderer
                .notifications
                .iter()
                .any(|n| n.kind == NotificationKind::ConnectionClosed)
        );
        assert_eq!(renderer.run_states.first(), Some(&ScriptRunState::Running));
    }

    #[test]
    fn drive_stops_on_reload() {
        let mut core = SessionCore::new(SessionConfig::default());
        connected(&mut core);
        let (events_tx, events_rx) = mpsc::channel();
        let (back_tx, _back_rx) = mpsc::sync_channel(8);
        let mut outbound = Outbound::new(back_tx, 8);
        let mut renderer = RecordingRenderer::default();

        for msg in [new_session("r1", "1.0.0"), new_session("r2", "1.2.0")] {
            events_tx
                .send(HostEvent::Inbound(Ok(msg)))
                .expect("queue inbound");
        }

        let result = drive(&mut core, &events_rx, &mut outbound, &mut renderer);
        assert!(matches!(result, Err(HostError::ReloadRequired(version)) if version == "1.2.0"));
    }

    #[test]
    fn intents_from_handle_reach_outbound_queue() {
        let mut core = SessionCore::new(SessionConfig::default());
        connected(&mut core);
        let (events_tx, events_rx) = mpsc::channel();
        let (back_tx, back_rx) = mpsc::sync_channel(8);
        let mut outbound = Outbound::new(back_tx, 8);
        let mut renderer = RecordingRenderer::default();

        let handle = SessionHandle::from_sender(events_tx);
        assert!(handle.submit(UserIntent::ClearCache));
        assert!(handle.submit(UserIntent::SubmitForm("missing".into())));
        drop(handle);

        drive(&mut core, &events_rx, &mut outbound, &mut renderer).expect("drive");

        assert_eq!(back_rx.try_recv().expect("clear cache"), BackMsg::ClearCache);
        assert!(matches!(back_rx.try_recv(), Ok(BackMsg::RerunScript(_))));
    }
}
