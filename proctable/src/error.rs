use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("required command not found: {0}")]
    ToolMissing(&'static str),

    #[error(transparent)]
    Command(#[from] subproc::SubprocError),

    #[error("no processes found matching {0:?}")]
    NoMatch(String),

    #[error("multiple processes found matching {fragment:?}: {pids:?}")]
    Ambiguous { fragment: String, pids: Vec<Pid> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, InventoryError>;
