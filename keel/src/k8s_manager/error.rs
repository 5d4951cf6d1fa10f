use thiserror::Error;

/// Coarse classification of gateway failures. Callers decide retry policy on
/// the kind, never on status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    Timeout,
    Connection,
    Fatal,
}

#[derive(Error, Debug)]
pub enum K8sError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("cannot reach the Kubernetes API server: {0}")]
    Connection(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("{0}")]
    Failed(String),

    #[error("Kubernetes reported error ({code} {reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("Kubernetes client error: {source}")]
    Kube {
        #[source]
        source: kube::Error,
    },
}

impl K8sError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            K8sError::NotFound(_) => ErrorKind::NotFound,
            K8sError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            K8sError::Conflict(_) => ErrorKind::Conflict,
            K8sError::Timeout(_) => ErrorKind::Timeout,
            K8sError::Connection(_) => ErrorKind::Connection,
            K8sError::Manifest(_)
            | K8sError::Failed(_)
            | K8sError::Api { .. }
            | K8sError::Kube { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

impl From<kube::Error> for K8sError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
                (404, _) => K8sError::NotFound(resp.message),
                (409, "AlreadyExists") => K8sError::AlreadyExists(resp.message),
                (409, _) => K8sError::Conflict(resp.message),
                (code, reason) => K8sError::Api {
                    code,
                    reason: reason.to_string(),
                    message: resp.message,
                },
            },
            kube::Error::HyperError(e) => K8sError::Connection(e.to_string()),
            kube::Error::Service(e) => K8sError::Connection(e.to_string()),
            other => K8sError::Kube { source: other },
        }
    }
}
