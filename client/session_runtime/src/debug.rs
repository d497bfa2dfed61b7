use crate::SessionHandle;
use crate::session::UserIntent;

/// Developer-only controls. Requests are forwarded to the session, which
/// refuses them unless debug mode is enabled in [`crate::SessionConfig`].
pub trait DebugControl {
    /// Asks the server runtime to shut down. Returns false if the session is gone.
    fn shutdown_runtime(&self) -> bool;

    /// Asks the server to drop this client's connection.
    fn disconnect_websocket(&self) -> bool;
}

impl DebugControl for SessionHandle {
    fn shutdown_runtime(&self) -> bool {
        self.submit(UserIntent::DebugShutdownRuntime)
    }

    fn disconnect_websocket(&self) -> bool {
        self.submit(UserIntent::DebugDisconnectWebsocket)
    }
}
