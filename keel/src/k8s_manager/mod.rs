pub mod error;
pub mod k8s_watch;
pub mod memory;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
    storage::v1::StorageClass,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::chrono::Utc;
use kube::{
    api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, GroupVersionKind},
    discovery::{pinned_kind, Scope},
    Client, Config, Resource, ResourceExt,
};
use log::{debug, info};
use serde_json::json;

use helpers::k8s_helpers::manifest;
use types::{
    engine_deployment_names,
    olm::{
        CatalogSource, ClusterServiceVersion, EnvVar, InstallPlan, OperatorGroup,
        OperatorGroupSpec, PackageManifest, Subscription, SubscriptionConfig, SubscriptionSpec,
    },
    InstallRequest, NamespacedName,
};

pub use error::{ErrorKind, K8sError};

pub const FIELD_MANAGER: &str = "keel";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Everything the installer needs from the API server.
///
/// Each call is a single attempt, retrying is up to the caller. Errors carry an
/// [`ErrorKind`] so callers can tell a missing object from a lost update.
#[async_trait]
pub trait KubeGateway: Send + Sync {
    /// Server-side applies every document of a multi-document YAML file, in order.
    async fn apply_file(&self, data: &[u8]) -> Result<(), K8sError>;

    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Deployment, K8sError>;

    async fn get_operator_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<OperatorGroup, K8sError>;

    async fn create_operator_group(
        &self,
        namespace: &str,
        name: &str,
        target_namespaces: &[String],
    ) -> Result<OperatorGroup, K8sError>;

    /// Subscribes to `req.name` from the request's catalog. Fails with
    /// `AlreadyExists` when the subscription is already there.
    async fn create_subscription_for_catalog(
        &self,
        req: &InstallRequest,
    ) -> Result<Subscription, K8sError>;

    async fn get_subscription(&self, namespace: &str, name: &str)
        -> Result<Subscription, K8sError>;

    async fn get_install_plan(&self, namespace: &str, name: &str)
        -> Result<InstallPlan, K8sError>;

    /// Replaces the plan. The plan's resourceVersion must be current, otherwise
    /// the call fails with `Conflict`.
    async fn update_install_plan(
        &self,
        namespace: &str,
        plan: &InstallPlan,
    ) -> Result<InstallPlan, K8sError>;

    /// Waits for the subscription to report its installed CSV and returns it.
    async fn get_subscription_csv(
        &self,
        subscription: &NamespacedName,
        timeout: Duration,
    ) -> Result<NamespacedName, K8sError>;

    async fn do_rollout_wait(&self, key: &NamespacedName, timeout: Duration)
        -> Result<(), K8sError>;

    async fn do_package_wait(
        &self,
        namespace: &str,
        package: &str,
        timeout: Duration,
    ) -> Result<(), K8sError>;

    /// Waits for the CSV to reach `Succeeded`. A `Failed` CSV ends the wait with an error.
    async fn do_csv_wait(&self, key: &NamespacedName, timeout: Duration) -> Result<(), K8sError>;

    /// Names of the database engine controller deployments in `namespace`, sorted.
    async fn list_engine_deployment_names(&self, namespace: &str)
        -> Result<Vec<String>, K8sError>;

    async fn restart_deployment(&self, name: &str, namespace: &str) -> Result<(), K8sError>;

    /// Applies a bare Namespace object, which is a no-op when it exists.
    async fn ensure_namespace(&self, name: &str) -> Result<(), K8sError> {
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        });
        let data = serde_json::to_vec(&doc).map_err(|e| K8sError::Manifest(e.to_string()))?;
        self.apply_file(&data).await
    }
}

/// Gateway backed by a real cluster.
pub struct KubeClient {
    client: Client,
    initialized: bool,
    // gvk -> (resource, namespaced)
    scheme: Scheme,
    engine_deployments: Vec<String>,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        let mut kube_client = KubeClient {
            client,
            initialized: false,
            scheme: HashMap::new(),
            engine_deployments: engine_deployment_names(),
        };
        kube_client.init();
        kube_client
    }

    /// Builds a client from the kubeconfig at `path`, or from the inferred
    /// config (in-cluster or `$KUBECONFIG`) when no path is given.
    pub async fn from_kubeconfig(path: Option<&Path>) -> Result<Self, K8sError> {
        let config = match path {
            Some(path) => {
                debug!("loading kubeconfig from {}", path.display());
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    K8sError::Failed(format!("reading kubeconfig {}: {}", path.display(), e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| K8sError::Failed(format!("loading kubeconfig: {}", e)))?
            }
            None => Config::infer()
                .await
                .map_err(|e| K8sError::Failed(format!("inferring kube config: {}", e)))?,
        };
        let client = Client::try_from(config)?;
        Ok(KubeClient::new(client))
    }

    // runs once per instance
    fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.scheme.extend(known_kinds());
        self.initialized = true;
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), K8sError> {
        if let Some(known) = self.scheme.get(gvk) {
            return Ok(known.clone());
        }
        debug!("discovering {}/{} {}", gvk.group, gvk.version, gvk.kind);
        let (ar, caps) = pinned_kind(&self.client, gvk).await?;
        Ok((ar, caps.scope == Scope::Namespaced))
    }

    async fn apply_document(&self, doc: &serde_json::Value) -> Result<(), K8sError> {
        let api_version = manifest::api_version(doc)
            .ok_or_else(|| K8sError::Manifest("document without apiVersion".to_string()))?;
        let kind = manifest::kind(doc)
            .ok_or_else(|| K8sError::Manifest("document without kind".to_string()))?;
        let name = manifest::name(doc)
            .ok_or_else(|| K8sError::Manifest(format!("{} without metadata.name", kind)))?;

        let (group, version) = manifest::group_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, namespaced) = self.resolve(&gvk).await?;

        let api: Api<DynamicObject> = if namespaced {
            let ns = manifest::namespace(doc).unwrap_or("default");
            Api::namespaced_with(self.client.clone(), ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(doc)).await?;
        debug!("applied {}/{}", kind.to_lowercase(), name);
        Ok(())
    }

    pub async fn apiserver_version(&self) -> Result<String, K8sError> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    pub async fn storage_provisioners(&self) -> Result<Vec<String>, K8sError> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let classes = api.list(&ListParams::default()).await?;
        Ok(classes.items.into_iter().map(|sc| sc.provisioner).collect())
    }
}

#[async_trait]
impl KubeGateway for KubeClient {
    async fn apply_file(&self, data: &[u8]) -> Result<(), K8sError> {
        let docs =
            manifest::decode_manifests(data).map_err(|e| K8sError::Manifest(format!("{:#}", e)))?;
        for doc in &docs {
            self.apply_document(doc).await?;
        }
        Ok(())
    }

    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Deployment, K8sError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_operator_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<OperatorGroup, K8sError> {
        let api: Api<OperatorGroup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_operator_group(
        &self,
        namespace: &str,
        name: &str,
        target_namespaces: &[String],
    ) -> Result<OperatorGroup, K8sError> {
        let targets = if target_namespaces.is_empty() {
            None
        } else {
            Some(target_namespaces.to_vec())
        };
        let mut og = OperatorGroup::new(
            name,
            OperatorGroupSpec {
                target_namespaces: targets,
            },
        );
        og.metadata.namespace = Some(namespace.to_string());

        info!("creating operatorgroup {}/{}", namespace, name);
        let api: Api<OperatorGroup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), &og).await?)
    }

    async fn create_subscription_for_catalog(
        &self,
        req: &InstallRequest,
    ) -> Result<Subscription, K8sError> {
        let sub = subscription_for(req);
        info!("creating subscription {}", req.key());
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), &req.namespace);
        Ok(api.create(&PostParams::default(), &sub).await?)
    }

    async fn get_subscription(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Subscription, K8sError> {
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_install_plan(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<InstallPlan, K8sError> {
        let api: Api<InstallPlan> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_install_plan(
        &self,
        namespace: &str,
        plan: &InstallPlan,
    ) -> Result<InstallPlan, K8sError> {
        let api: Api<InstallPlan> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&plan.name_any(), &PostParams::default(), plan)
            .await?)
    }

    async fn get_subscription_csv(
        &self,
        subscription: &NamespacedName,
        timeout: Duration,
    ) -> Result<NamespacedName, K8sError> {
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), &subscription.namespace);
        k8s_watch::wait_for_subscription_csv(api, subscription, timeout).await
    }

    async fn do_rollout_wait(
        &self,
        key: &NamespacedName,
        timeout: Duration,
    ) -> Result<(), K8sError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        k8s_watch::wait_for_rollout(api, key, timeout).await
    }

    async fn do_package_wait(
        &self,
        namespace: &str,
        package: &str,
        timeout: Duration,
    ) -> Result<(), K8sError> {
        let api: Api<PackageManifest> = Api::namespaced(self.client.clone(), namespace);
        k8s_watch::wait_for_package(api, package, timeout).await
    }

    async fn do_csv_wait(&self, key: &NamespacedName, timeout: Duration) -> Result<(), K8sError> {
        let api: Api<ClusterServiceVersion> =
            Api::namespaced(self.client.clone(), &key.namespace);
        k8s_watch::wait_for_csv(api, key, timeout).await
    }

    async fn list_engine_deployment_names(
        &self,
        namespace: &str,
    ) -> Result<Vec<String>, K8sError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        let mut names: Vec<String> = list
            .items
            .iter()
            .map(|d| d.name_any())
            .filter(|name| self.engine_deployments.contains(name))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn restart_deployment(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
        info!("restarting deployment {}/{}", namespace, name);
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = restart_patch(&Utc::now().to_rfc3339());
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

type Scheme = HashMap<GroupVersionKind, (ApiResource, bool)>;

fn register<K: Resource<DynamicType = ()>>(scheme: &mut Scheme, namespaced: bool) {
    let ar = ApiResource::erase::<K>(&());
    let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
    scheme.insert(gvk, (ar, namespaced));
}

/// Kinds `apply_file` resolves without discovery.
fn known_kinds() -> Scheme {
    let mut scheme = Scheme::new();
    register::<Subscription>(&mut scheme, true);
    register::<InstallPlan>(&mut scheme, true);
    register::<OperatorGroup>(&mut scheme, true);
    register::<ClusterServiceVersion>(&mut scheme, true);
    register::<CatalogSource>(&mut scheme, true);
    register::<PackageManifest>(&mut scheme, true);

    register::<Namespace>(&mut scheme, false);
    register::<CustomResourceDefinition>(&mut scheme, false);
    register::<ClusterRole>(&mut scheme, false);
    register::<ClusterRoleBinding>(&mut scheme, false);
    register::<Deployment>(&mut scheme, true);
    register::<ServiceAccount>(&mut scheme, true);
    register::<ConfigMap>(&mut scheme, true);
    register::<Secret>(&mut scheme, true);
    register::<Service>(&mut scheme, true);
    register::<Role>(&mut scheme, true);
    register::<RoleBinding>(&mut scheme, true);
    scheme
}

/// Subscription object for an install request. Env vars keep the request's
/// (sorted) order.
pub fn subscription_for(req: &InstallRequest) -> Subscription {
    let config = if req.env.is_empty() {
        None
    } else {
        Some(SubscriptionConfig {
            env: req
                .env
                .iter()
                .map(|(name, value)| EnvVar::new(name, value))
                .collect(),
        })
    };

    let mut sub = Subscription::new(
        &req.name,
        SubscriptionSpec {
            source: req.catalog_source.clone(),
            source_namespace: req.catalog_source_namespace.clone(),
            name: req.name.clone(),
            channel: Some(req.channel.clone()),
            starting_csv: req.starting_csv.clone(),
            install_plan_approval: Some(req.install_plan_approval),
            config,
        },
    );
    sub.metadata.namespace = Some(req.namespace.clone());
    sub
}

pub fn restart_patch(timestamp: &str) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: timestamp
                    }
                }
            }
        }
    })
}
