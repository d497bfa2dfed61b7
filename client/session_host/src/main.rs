use scriptsync_session_runtime::logging::init_tracing;
use scriptsync_session_runtime::protocol::PageConfig;
use scriptsync_session_runtime::session::NotificationLevel;
use scriptsync_session_runtime::{
    ElementTree, HostError, Notification, Renderer, ScriptRunState, SessionConfig, SessionHost,
    SessionMetadata,
};
use std::process;
use tracing::{debug, error, info, warn};

const EXIT_RELOAD: i32 = 3;

/// Headless renderer: reports every presentation change to the log.
#[derive(Debug, Default)]
struct LoggingRenderer {
    publishes: u64,
}

impl Renderer for LoggingRenderer {
    fn publish(&mut self, tree: &ElementTree) {
        self.publishes += 1;
        info!(
            publish = self.publishes,
            nodes = tree.node_count(),
            elements = tree.elements().len(),
            "tree published"
        );
        match serde_json::to_string(&tree.elements()) {
            Ok(elements) => debug!(%elements, "published elements"),
            Err(err) => warn!(error = %err, "failed to encode published elements"),
        }
    }

    fn notify(&mut self, notification: &Notification) {
        match notification.level {
            NotificationLevel::Info => info!(kind = ?notification.kind, "{}", notification.message),
            NotificationLevel::Warning => {
                warn!(kind = ?notification.kind, "{}", notification.message)
            }
            NotificationLevel::Error => error!(
                kind = ?notification.kind,
                blocking = notification.is_blocking(),
                "{}",
                notification.message
            ),
        }
    }

    fn session_initialized(&mut self, metadata: &SessionMetadata) {
        info!(
            session_id = %metadata.session_id,
            server_version = %metadata.server_version,
            pages = metadata.app_pages.len(),
            "session ready"
        );
    }

    fn run_state_changed(&mut self, state: ScriptRunState) {
        info!(?state, "script run state");
    }

    fn page_changed(&mut self, page_script_hash: &str, page_name: &str) {
        info!(page_script_hash, page_name, "page changed");
    }

    fn page_config_changed(&mut self, page_config: &PageConfig) {
        info!(
            title = page_config.title.as_deref().unwrap_or_default(),
            layout = page_config.layout.as_deref().unwrap_or_default(),
            "page config"
        );
    }
}

fn main() {
    if let Err(err) = init_tracing() {
        eprintln!("session_host: {err}");
    }

    let config = SessionConfig::from_env();
    info!(
        debug_enabled = config.debug_enabled,
        outbound_queue_cap = config.outbound_queue_cap,
        "starting session host"
    );

    let mut host = SessionHost::new(config);
    host.core_mut()
        .subscribe_script_finished(Box::new(|finished| {
            info!(run_id = %finished.script_run_id, status = ?finished.status, "run finished");
        }));

    let mut renderer = LoggingRenderer::default();
    match host.run_stdio(&mut renderer) {
        Ok(()) => info!(publishes = renderer.publishes, "session ended"),
        Err(HostError::ReloadRequired(server_version)) => {
            warn!(%server_version, "server upgraded; restart required");
            process::exit(EXIT_RELOAD);
        }
        Err(err) => {
            error!(error = %err, "session host fatal error");
            process::exit(1);
        }
    }
}
