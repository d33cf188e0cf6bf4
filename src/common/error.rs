use thiserror::Error;

/// 路由核心的错误分类
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("proxy '{0}' not found")]
    NotFound(String),

    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("connection rejected by '{0}'")]
    Rejected(String),

    #[error("no proxy available in group '{0}'")]
    NoSelection(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RouterError {
    /// Try to extract a RouterError from an anyhow::Error, or classify
    /// the underlying error heuristically (e.g. io::Error kinds).
    pub fn classify(err: &anyhow::Error) -> RouterErrorKind {
        if let Some(re) = err.downcast_ref::<RouterError>() {
            return re.kind();
        }
        if err.downcast_ref::<std::io::Error>().is_some() {
            return RouterErrorKind::Io;
        }
        if err.downcast_ref::<reqwest::Error>().is_some() {
            return RouterErrorKind::Fetch;
        }
        RouterErrorKind::Other
    }

    pub fn kind(&self) -> RouterErrorKind {
        match self {
            RouterError::Io(_) => RouterErrorKind::Io,
            RouterError::Config(_) => RouterErrorKind::Config,
            RouterError::NotFound(_) => RouterErrorKind::NotFound,
            RouterError::Cycle(_) => RouterErrorKind::Cycle,
            RouterError::Rejected(_) => RouterErrorKind::Rejected,
            RouterError::NoSelection(_) => RouterErrorKind::NoSelection,
            RouterError::Unsupported(_) => RouterErrorKind::Unsupported,
            RouterError::Fetch(_) => RouterErrorKind::Fetch,
            RouterError::Other(_) => RouterErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterErrorKind {
    Io,
    Config,
    NotFound,
    Cycle,
    Rejected,
    NoSelection,
    Unsupported,
    Fetch,
    Other,
}

impl RouterErrorKind {
    /// 加载阶段错误：整批配置被拒绝
    pub fn is_fatal_at_load(self) -> bool {
        matches!(self, RouterErrorKind::Config | RouterErrorKind::Cycle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RouterErrorKind::Io => "IO",
            RouterErrorKind::Config => "CONFIG",
            RouterErrorKind::NotFound => "NOT_FOUND",
            RouterErrorKind::Cycle => "CYCLE",
            RouterErrorKind::Rejected => "REJECTED",
            RouterErrorKind::NoSelection => "NO_SELECTION",
            RouterErrorKind::Unsupported => "UNSUPPORTED",
            RouterErrorKind::Fetch => "FETCH",
            RouterErrorKind::Other => "OTHER",
        }
    }
}

impl From<RouterError> for std::io::Error {
    fn from(e: RouterError) -> Self {
        std::io::Error::other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_downcasts_router_error() {
        let err: anyhow::Error = RouterError::NotFound("hk".to_string()).into();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::NotFound);
    }

    #[test]
    fn classify_io_error() {
        let err: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::Io);
    }

    #[test]
    fn cycle_message_contains_full_path() {
        let err = RouterError::Cycle(vec!["A".into(), "B".into(), "A".into()]);
        assert_eq!(err.to_string(), "cycle detected: A -> B -> A");
        assert!(err.kind().is_fatal_at_load());
    }

    #[test]
    fn kind_strings() {
        assert_eq!(RouterErrorKind::Rejected.as_str(), "REJECTED");
        assert_eq!(RouterErrorKind::NoSelection.as_str(), "NO_SELECTION");
    }
}
