//! Lifecycle of the server-side script as seen by the client.
//!
//! Transitions are pure: each takes the current state and returns the next.
//! A pending stop outranks everything else; a pending rerun or an unresolved
//! compile error holds off the idle transition.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScriptRunState {
    #[default]
    NotRunning,
    Running,
    RerunRequested,
    StopRequested,
    CompilationError,
}

impl ScriptRunState {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// `sessionStatusChanged` from the server.
    pub fn on_session_status(self, script_is_running: bool) -> Self {
        match (self, script_is_running) {
            (Self::StopRequested, true) => self,
            (_, true) => Self::Running,
            (Self::RerunRequested | Self::CompilationError, false) => self,
            (_, false) => Self::NotRunning,
        }
    }

    /// User-initiated rerun. Duplicate requests are dropped.
    pub fn on_rerun_requested(self) -> Self {
        match self {
            Self::Running | Self::RerunRequested => self,
            _ => Self::RerunRequested,
        }
    }

    pub fn on_stop_requested(self) -> Self {
        match self {
            Self::NotRunning | Self::StopRequested => self,
            _ => Self::StopRequested,
        }
    }

    pub fn on_compilation_error(self) -> Self {
        Self::CompilationError
    }

    /// The server confirmed that a stop took effect.
    pub fn on_manual_stop(self) -> Self {
        match self {
            Self::CompilationError => self,
            _ => Self::NotRunning,
        }
    }

    /// Without a server there is nothing running; a pending request cannot be
    /// honoured either.
    pub fn on_connection_lost(self) -> Self {
        match self {
            Self::CompilationError => self,
            _ => Self::NotRunning,
        }
    }
}
