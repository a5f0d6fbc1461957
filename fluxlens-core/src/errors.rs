use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct FluxLensError(Box<ErrorKind>);

#[derive(Error, Debug)]
#[error(transparent)]
pub enum ErrorKind {
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    /// Any list/get/watch call to the API server that failed. Aggregation aborts on it,
    /// the live store only logs it.
    #[error("KubeClientError: {0}")]
    KubeClientError(#[from] kube::Error),
    #[error("KubeconfigError: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),
    #[error("KubeconfigInferError: {0}")]
    KubeconfigInferError(#[from] kube::config::InClusterError),
    #[error("HelmStorageError: {0}")]
    HelmStorageError(String),
    #[error("InvalidResourceTypeError: {0}")]
    InvalidResourceTypeError(String),
    #[error("NotFound: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("AlreadySuspended: {0}")]
    AlreadySuspended(String),
    #[error("InvalidState: {0}")]
    InvalidState(String),
    #[error("Timeout: timed out waiting for reconciliation of {0}")]
    Timeout(String),
    #[error("ReadinessFailed: {0}")]
    ReadinessFailed(String),
    #[error("MalformedEvent: {0}")]
    MalformedEvent(String),
}

impl<E> From<E> for FluxLensError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        FluxLensError(Box::new(ErrorKind::from(err)))
    }
}

impl FluxLensError {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub fn is_conflict(&self) -> bool {
        matches!(*self.0, ErrorKind::Conflict(_))
    }

    /// Also true for a raw 404 from a list call, e.g. a Flux CRD that is not installed.
    pub fn is_not_found(&self) -> bool {
        match &*self.0 {
            ErrorKind::NotFound(_) => true,
            ErrorKind::KubeClientError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

/// Maps API server status codes onto the error taxonomy the orchestrator reasons about.
/// 404 and 409 become `NotFound` and `Conflict`, anything else stays a client error.
pub fn classify_kube_error(err: kube::Error, target: &str) -> FluxLensError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ErrorKind::NotFound(target.to_string()).into(),
        kube::Error::Api(ae) if ae.code == 409 => {
            ErrorKind::Conflict(format!("{target}: {}", ae.message)).into()
        }
        other => other.into(),
    }
}
