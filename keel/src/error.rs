use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::k8s_manager::{ErrorKind, K8sError};

/// Step of an install an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lookup,
    OperatorGroup,
    Subscription,
    InstallPlanApproval,
    CsvSucceeded,
    ManifestApply,
    Rollout,
    PackageSync,
    Restart,
    Snapshot,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Lookup => "lookup",
            Stage::OperatorGroup => "operator group",
            Stage::Subscription => "subscription",
            Stage::InstallPlanApproval => "install plan approval",
            Stage::CsvSucceeded => "cluster service version",
            Stage::ManifestApply => "manifest apply",
            Stage::Rollout => "deployment rollout",
            Stage::PackageSync => "package sync",
            Stage::Restart => "restart",
            Stage::Snapshot => "deployment snapshot",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("{subject}: cancelled during {stage}")]
    Cancelled { subject: String, stage: Stage },

    #[error("{subject}: timed out during {stage}")]
    Timeout { subject: String, stage: Stage },

    #[error("{subject}: {stage} failed: {source}. Make sure Kubernetes is running and is accessible from this computer/server")]
    Connection {
        subject: String,
        stage: Stage,
        #[source]
        source: K8sError,
    },

    #[error("{subject}: {stage} failed: {source}")]
    Kube {
        subject: String,
        stage: Stage,
        #[source]
        source: K8sError,
    },

    #[error("{subject}: invalid manifest: {message}")]
    Manifest { subject: String, message: String },
}

impl InstallError {
    /// Wraps a gateway error, keeping timeouts and connection failures apart
    /// from everything else.
    pub fn from_k8s(subject: impl Into<String>, stage: Stage, err: K8sError) -> Self {
        let subject = subject.into();
        match err.kind() {
            ErrorKind::Timeout => InstallError::Timeout { subject, stage },
            ErrorKind::Connection => InstallError::Connection {
                subject,
                stage,
                source: err,
            },
            _ => match err {
                K8sError::Manifest(message) => InstallError::Manifest { subject, message },
                source => InstallError::Kube {
                    subject,
                    stage,
                    source,
                },
            },
        }
    }

    pub fn cancelled(subject: impl Into<String>, stage: Stage) -> Self {
        InstallError::Cancelled {
            subject: subject.into(),
            stage,
        }
    }

    pub fn timeout(subject: impl Into<String>, stage: Stage) -> Self {
        InstallError::Timeout {
            subject: subject.into(),
            stage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, InstallError::Timeout { .. })
    }

    pub fn subject(&self) -> &str {
        match self {
            InstallError::Cancelled { subject, .. }
            | InstallError::Timeout { subject, .. }
            | InstallError::Connection { subject, .. }
            | InstallError::Kube { subject, .. }
            | InstallError::Manifest { subject, .. } => subject,
        }
    }
}

/// Runs a gateway call unless `cancel` fires first. Only use it for reads and
/// waits, dropping an in-flight update is not safe.
pub async fn with_cancel<T, F>(
    cancel: &CancellationToken,
    subject: &str,
    stage: Stage,
    call: F,
) -> Result<T, InstallError>
where
    F: Future<Output = Result<T, K8sError>>,
{
    if cancel.is_cancelled() {
        return Err(InstallError::cancelled(subject, stage));
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(InstallError::cancelled(subject, stage)),
        res = call => res.map_err(|e| InstallError::from_k8s(subject, stage, e)),
    }
}
