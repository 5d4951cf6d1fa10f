use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Result};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    Minikube,
    Eks,
    Generic,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterType::Minikube => "minikube",
            ClusterType::Eks => "eks",
            ClusterType::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// guesses the cluster flavour from the storage class provisioners
pub fn cluster_type_from_provisioners<S: AsRef<str>>(provisioners: &[S]) -> ClusterType {
    for p in provisioners.iter().map(AsRef::as_ref) {
        if p.contains("aws") {
            return ClusterType::Eks;
        }
        if p.contains("minikube")
            || p.contains("kubevirt.io/hostpath-provisioner")
            || p.contains("standard")
        {
            return ClusterType::Minikube;
        }
    }
    ClusterType::Generic
}

/// Validates a namespace name against RFC 1035 label rules and rejects the
/// namespaces the installer reserves for itself.
pub fn validate_namespace(namespace: &str, reserved: &[&str]) -> Result<()> {
    let rfc1035 = Regex::new("^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$")?;
    if reserved.contains(&namespace) {
        bail!(
            "'{}' namespace is reserved for internal components. Please specify another namespace",
            namespace
        );
    }
    if !rfc1035.is_match(namespace) {
        bail!(
            "'{}' is not RFC 1035 compatible. The name should contain only lowercase alphanumeric \
             characters or '-', start with an alphabetic character, end with an alphanumeric character",
            namespace
        );
    }
    Ok(())
}

/// Splits a comma-separated namespace list, validating every entry.
/// Blank entries are skipped and duplicates collapse to their first position.
pub fn validate_namespaces(list: &str, reserved: &[&str]) -> Result<Vec<String>> {
    let mut namespaces: Vec<String> = Vec::new();
    for ns in list.split(',').map(str::trim).filter(|ns| !ns.is_empty()) {
        validate_namespace(ns, reserved)?;
        if !namespaces.iter().any(|seen| seen == ns) {
            namespaces.push(ns.to_string());
        }
    }
    if namespaces.is_empty() {
        bail!("namespace list is empty. Specify at least one namespace");
    }
    Ok(namespaces)
}

/// Expands a leading `~` in a kubeconfig path to the user's home directory.
pub fn expand_kubeconfig_path(path: &str) -> Result<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let Some(home) = home::home_dir() else {
                bail!("cannot expand '{}': home directory is unknown", path);
            };
            Ok(home.join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn detects_cluster_type() {
        assert_eq!(
            cluster_type_from_provisioners(&["ebs.csi.aws.com"]),
            ClusterType::Eks
        );
        assert_eq!(
            cluster_type_from_provisioners(&["k8s.io/minikube-hostpath"]),
            ClusterType::Minikube
        );
        assert_eq!(
            cluster_type_from_provisioners(&["rancher.io/local-path"]),
            ClusterType::Generic
        );
        assert_eq!(
            cluster_type_from_provisioners::<&str>(&[]),
            ClusterType::Generic
        );
    }

    #[test]
    fn rejects_reserved_and_invalid_namespaces() {
        assert!(validate_namespace("keel", &["keel"]).is_err());
        assert!(validate_namespace("Upper", &[]).is_err());
        assert!(validate_namespace("1abc", &[]).is_err());
        assert!(validate_namespace("abc-", &[]).is_err());
        assert!(validate_namespace("db-prod", &["keel"]).is_ok());
    }

    #[test]
    fn splits_and_dedupes_namespace_lists() {
        let list = validate_namespaces(" prod, staging,,prod ,dev", &["keel-system"]).unwrap();
        assert_eq!(list, vec!["prod", "staging", "dev"]);

        assert!(validate_namespaces("prod,keel-system", &["keel-system"]).is_err());
        assert!(validate_namespaces("prod,Bad_Name", &[]).is_err());
        assert!(validate_namespaces(" , ", &[]).is_err());
    }

    #[test]
    fn keeps_absolute_kubeconfig_paths() {
        let path = expand_kubeconfig_path("/etc/kube/config").unwrap();
        assert_eq!(path, PathBuf::from("/etc/kube/config"));
    }

    proptest! {
        #[test]
        fn valid_labels_are_accepted(ns in "[a-z]([-a-z0-9]{0,20}[a-z0-9])?") {
            prop_assert!(validate_namespace(&ns, &[]).is_ok());
        }

        #[test]
        fn names_with_uppercase_are_rejected(ns in "[a-z]{1,10}[A-Z][a-z]{0,10}") {
            prop_assert!(validate_namespace(&ns, &[]).is_err());
        }
    }
}
