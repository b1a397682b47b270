//! Machine actuator
//!
//! Implements the four verbs the machine controller calls for every
//! (Cluster, Machine) pair. Each verb opens a [`MachineScope`], drives the
//! cloud collaborators, and closes the scope so that status changes are
//! written back whether the verb succeeded or not.
//!
//! Verbs are safe to call concurrently and repeatedly: Create relies on the
//! instance service's create-or-get idempotency, Delete treats missing and
//! terminating instances as done, and the only cross-machine coordination is
//! the control plane init lock.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

use keel_common::crd::{provider_id_for, Cluster, Machine};
use keel_common::Error;

use crate::accessor::{ClusterAccessor, KubeClusterAccessor};
use crate::client::{KubeMachineClient, MachineClient};
use crate::config::ActuatorConfig;
use crate::elb::{reconcile_lb_attachment, LoadBalancerService};
use crate::ensure::{ensure_security_groups, ensure_tags};
use crate::instance::InstanceService;
use crate::join::{control_plane_machines, determine_join, NodeBootstrap};
use crate::locker::{ConfigMapInitLocker, ControlPlaneInitLocker};
use crate::outdated::is_machine_outdated;
use crate::scope::MachineScope;
use crate::token::{ControlPlaneEndpoint, KubeTokenIssuer, TokenIssuer};

/// Contract between the machine controller and a cloud provider
///
/// A [`Error::RequeueAfter`] result is a scheduling hint, not a failure.
#[async_trait]
pub trait MachineActuator: Send + Sync {
    /// Bring a backing instance into existence for the machine
    async fn create(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<(), Error>;

    /// Terminate the machine's instance, if it still has one
    async fn delete(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<(), Error>;

    /// Converge mutable instance attributes, rejecting immutable changes
    async fn update(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<(), Error>;

    /// Whether the machine has a live (pending or running) instance
    async fn exists(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<bool, Error>;
}

/// Collaborators an [`Actuator`] is built from
pub struct ActuatorParams {
    /// Tunables
    pub config: ActuatorConfig,
    /// Machine store access
    pub machines: Arc<dyn MachineClient>,
    /// Cloud instance operations
    pub instances: Arc<dyn InstanceService>,
    /// API server load balancer operations
    pub load_balancers: Arc<dyn LoadBalancerService>,
    /// Control plane init lock
    pub locker: Arc<dyn ControlPlaneInitLocker>,
    /// Control plane address and kubeconfig lookup
    pub accessor: Arc<dyn ClusterAccessor>,
    /// Bootstrap token issuance
    pub tokens: Arc<dyn TokenIssuer>,
}

/// The machine actuator
pub struct Actuator {
    config: ActuatorConfig,
    machines: Arc<dyn MachineClient>,
    instances: Arc<dyn InstanceService>,
    load_balancers: Arc<dyn LoadBalancerService>,
    locker: Arc<dyn ControlPlaneInitLocker>,
    accessor: Arc<dyn ClusterAccessor>,
    tokens: Arc<dyn TokenIssuer>,
}

impl Actuator {
    /// Create an actuator from explicit collaborators
    pub fn new(params: ActuatorParams) -> Self {
        Self {
            config: params.config,
            machines: params.machines,
            instances: params.instances,
            load_balancers: params.load_balancers,
            locker: params.locker,
            accessor: params.accessor,
            tokens: params.tokens,
        }
    }

    /// Create an actuator whose Kubernetes-side collaborators use `client`
    ///
    /// The cloud-side services are supplied by the provider integration.
    pub fn with_kube_client(
        client: Client,
        config: ActuatorConfig,
        instances: Arc<dyn InstanceService>,
        load_balancers: Arc<dyn LoadBalancerService>,
    ) -> Self {
        Self::new(ActuatorParams {
            config,
            machines: Arc::new(KubeMachineClient::new(client.clone())),
            instances,
            load_balancers,
            locker: Arc::new(ConfigMapInitLocker::new(client.clone())),
            accessor: Arc::new(KubeClusterAccessor::new(client)),
            tokens: Arc::new(KubeTokenIssuer::new()),
        })
    }

    fn open_scope(&self, cluster: &Cluster, machine: &Machine) -> Result<MachineScope, Error> {
        MachineScope::new(cluster, machine, Arc::clone(&self.machines))
    }

    async fn reconcile_create(&self, scope: &mut MachineScope) -> Result<(), Error> {
        let machines = self
            .config
            .bounded("list cluster machines", scope.list_cluster_machines())
            .await?;
        if control_plane_machines(&machines).is_empty() {
            info!("no control plane machines exist yet, requeuing");
            return Err(Error::requeue_after(
                self.config.control_plane_machine_wait,
                "no control plane machines exist yet",
            ));
        }

        let bootstrap = determine_join(
            self.locker.as_ref(),
            &scope.cluster,
            &scope.machine,
            &self.config,
        )
        .await?;

        let bootstrap_token = match bootstrap {
            NodeBootstrap::Init => {
                info!("machine will init the cluster");
                String::new()
            }
            NodeBootstrap::Join => {
                info!("machine will join the cluster");
                self.issue_join_token(&scope.cluster).await?
            }
        };

        let instance = self
            .config
            .bounded(
                "create or get instance",
                self.instances.create_or_get_instance(scope, &bootstrap_token),
            )
            .await
            .map_err(|e| e.context("failed to create or get machine"))?;

        scope.record_instance(&instance)?;
        scope.set_annotation(self.config.managed_annotation(), "true");

        self.config
            .bounded(
                "register instance with load balancer",
                reconcile_lb_attachment(self.load_balancers.as_ref(), scope, &instance),
            )
            .await?;

        info!(instance_id = %instance.id, state = %instance.state, "create completed");
        Ok(())
    }

    async fn issue_join_token(&self, cluster: &Cluster) -> Result<String, Error> {
        let endpoint = self.control_plane_endpoint(cluster).await.map_err(|e| {
            e.context(format!(
                "unable to proceed until control plane is ready for cluster {}/{}",
                cluster.namespace().unwrap_or_default(),
                cluster.name_any()
            ))
        })?;

        self.config
            .bounded(
                "issue bootstrap token",
                self.tokens
                    .new_bootstrap_token(&endpoint, self.config.token_ttl),
            )
            .await
            .map_err(|e| e.context("failed to create new bootstrap token"))
    }

    async fn control_plane_endpoint(&self, cluster: &Cluster) -> Result<ControlPlaneEndpoint, Error> {
        let host = self
            .config
            .bounded("get control plane address", self.accessor.get_ip(cluster))
            .await?;
        let kubeconfig = self
            .config
            .bounded("get kubeconfig", self.accessor.get_kubeconfig(cluster))
            .await?;

        Ok(ControlPlaneEndpoint {
            url: format!("https://{}:{}", host, self.config.api_server_port),
            kubeconfig,
        })
    }

    async fn reconcile_delete(&self, scope: &MachineScope) -> Result<(), Error> {
        let mut instance = match scope.instance_id() {
            Some(id) => self
                .config
                .bounded("describe instance", self.instances.instance_if_exists(&id))
                .await
                .map_err(|e| e.context("failed to get instance"))?,
            None => None,
        };

        if instance.is_none() {
            instance = self
                .config
                .bounded("find instance by tags", self.instances.instance_by_tags(scope))
                .await
                .map_err(|e| e.context("failed to query instance by tags"))?;
        }

        let Some(instance) = instance else {
            debug!("instance does not exist, nothing to delete");
            return Ok(());
        };

        if instance.state.is_terminating() {
            info!(
                instance_id = %instance.id,
                state = %instance.state,
                "instance is shutting down or already terminated"
            );
            return Ok(());
        }

        info!(instance_id = %instance.id, "terminating instance");
        self.config
            .bounded(
                "terminate instance",
                self.instances.terminate_instance(&instance.id),
            )
            .await
            .map_err(|e| e.context("failed to terminate instance"))
    }

    async fn reconcile_update(&self, scope: &mut MachineScope) -> Result<(), Error> {
        let not_found = |target: &str| {
            Error::provider_for(
                self.config.provider.as_str(),
                "describe instance",
                target,
                "instance not found",
            )
        };

        let instance_id = scope.instance_id().ok_or_else(|| not_found(&scope.name()))?;
        let instance = self
            .config
            .bounded(
                "describe instance",
                self.instances.instance_if_exists(&instance_id),
            )
            .await
            .map_err(|e| e.context("failed to get instance"))?
            .ok_or_else(|| not_found(&instance_id))?;

        let violations = is_machine_outdated(scope.machine_config(), &instance);
        if !violations.is_empty() {
            return Err(Error::immutable_fields(scope.name(), violations));
        }

        let existing_groups = self
            .config
            .bounded(
                "get instance security groups",
                self.instances.get_instance_security_groups(&instance_id),
            )
            .await?;

        ensure_security_groups(
            self.instances.as_ref(),
            &self.config,
            scope,
            &instance_id,
            &existing_groups,
        )
        .await
        .map_err(|e| e.context("failed to apply security groups"))?;

        ensure_tags(self.instances.as_ref(), &self.config, scope, &instance_id)
            .await
            .map_err(|e| e.context("failed to ensure tags"))?;

        Ok(())
    }

    async fn reconcile_exists(&self, scope: &mut MachineScope) -> Result<bool, Error> {
        let Some(instance_id) = scope.instance_id() else {
            debug!("no instance recorded");
            return Ok(false);
        };

        let Some(instance) = self
            .config
            .bounded(
                "describe instance",
                self.instances.instance_if_exists(&instance_id),
            )
            .await
            .map_err(|e| e.context("failed to retrieve instance"))?
        else {
            debug!(instance_id = %instance_id, "recorded instance no longer exists");
            return Ok(false);
        };

        if !instance.state.is_alive() {
            info!(instance_id = %instance_id, state = %instance.state, "instance is not alive");
            return Ok(false);
        }

        debug!(instance_id = %instance_id, state = %instance.state, "found instance for machine");
        scope.set_instance_state(instance.state);

        self.config
            .bounded(
                "register instance with load balancer",
                reconcile_lb_attachment(self.load_balancers.as_ref(), scope, &instance),
            )
            .await?;

        if scope.provider_id().is_none() {
            scope.set_provider_id(provider_id_for(&self.config.provider, &instance_id));
        }

        Ok(true)
    }
}

fn require_cluster<'a>(cluster: Option<&'a Cluster>, machine: &Machine) -> Result<&'a Cluster, Error> {
    cluster.ok_or_else(|| {
        Error::validation(format!(
            "missing cluster for machine {}",
            machine.qualified_name()
        ))
    })
}

#[async_trait]
impl MachineActuator for Actuator {
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.qualified_name()))]
    async fn create(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<(), Error> {
        let cluster = require_cluster(cluster, machine)?;
        info!(cluster = %cluster.name_any(), "creating machine");

        if !cluster.readiness().is_infrastructure_ready() {
            info!(cluster = %cluster.name_any(), "cluster infrastructure is not ready yet, requeuing");
            return Err(Error::requeue_after(
                self.config.infrastructure_ready_wait,
                "cluster infrastructure is not ready yet",
            ));
        }

        let mut scope = self.open_scope(cluster, machine)?;
        let result = self.reconcile_create(&mut scope).await;
        scope.close(result).await
    }

    #[instrument(skip(self, cluster, machine), fields(machine = %machine.qualified_name()))]
    async fn delete(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<(), Error> {
        let cluster = require_cluster(cluster, machine)?;
        info!(cluster = %cluster.name_any(), "deleting machine");

        let scope = self.open_scope(cluster, machine)?;
        let result = self.reconcile_delete(&scope).await;
        scope.close(result).await
    }

    #[instrument(skip(self, cluster, machine), fields(machine = %machine.qualified_name()))]
    async fn update(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<(), Error> {
        let cluster = require_cluster(cluster, machine)?;
        info!(cluster = %cluster.name_any(), "updating machine");

        let mut scope = self.open_scope(cluster, machine)?;
        let result = self.reconcile_update(&mut scope).await;
        scope.close(result).await
    }

    #[instrument(skip(self, cluster, machine), fields(machine = %machine.qualified_name()))]
    async fn exists(&self, cluster: Option<&Cluster>, machine: &Machine) -> Result<bool, Error> {
        let cluster = require_cluster(cluster, machine)?;
        debug!(cluster = %cluster.name_any(), "checking if machine exists");

        let mut scope = self.open_scope(cluster, machine)?;
        let result = self.reconcile_exists(&mut scope).await;
        scope.close(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::MockClusterAccessor;
    use crate::client::MockMachineClient;
    use crate::elb::MockLoadBalancerService;
    use crate::instance::MockInstanceService;
    use crate::locker::MockControlPlaneInitLocker;
    use crate::testing::{cluster, cluster_with, control_plane_machine, instance, worker_machine};
    use crate::token::MockTokenIssuer;
    use keel_common::crd::{
        AwsMachineProviderStatus, ClusterReadiness, InstanceState, MachineStatus,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Mocks with no expectations: any unexpected call panics
    struct Mocks {
        machines: MockMachineClient,
        instances: MockInstanceService,
        load_balancers: MockLoadBalancerService,
        locker: MockControlPlaneInitLocker,
        accessor: MockClusterAccessor,
        tokens: MockTokenIssuer,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                machines: MockMachineClient::new(),
                instances: MockInstanceService::new(),
                load_balancers: MockLoadBalancerService::new(),
                locker: MockControlPlaneInitLocker::new(),
                accessor: MockClusterAccessor::new(),
                tokens: MockTokenIssuer::new(),
            }
        }

        fn into_actuator(self) -> Actuator {
            Actuator::new(ActuatorParams {
                config: ActuatorConfig::default(),
                machines: Arc::new(self.machines),
                instances: Arc::new(self.instances),
                load_balancers: Arc::new(self.load_balancers),
                locker: Arc::new(self.locker),
                accessor: Arc::new(self.accessor),
                tokens: Arc::new(self.tokens),
            })
        }

        fn expect_persist(&mut self) {
            self.machines.expect_update_machine().returning(|_| Ok(()));
            self.machines
                .expect_update_machine_status()
                .returning(|_| Ok(()));
        }
    }

    fn linked(mut machine: Machine, instance_id: &str) -> Machine {
        machine.status = Some(MachineStatus {
            provider_status: AwsMachineProviderStatus {
                instance_id: Some(instance_id.to_string()),
                instance_state: Some(InstanceState::Running),
            },
        });
        machine
    }

    // =========================================================================
    // Preconditions
    // =========================================================================

    #[rstest::rstest]
    #[case::create("create")]
    #[case::delete("delete")]
    #[case::update("update")]
    #[case::exists("exists")]
    #[tokio::test]
    async fn story_every_verb_requires_a_cluster(#[case] verb: &str) {
        let actuator = Mocks::new().into_actuator();
        let machine = worker_machine("worker-0");
        let err = match verb {
            "create" => actuator.create(None, &machine).await.err(),
            "delete" => actuator.delete(None, &machine).await.err(),
            "update" => actuator.update(None, &machine).await.err(),
            _ => actuator.exists(None, &machine).await.err(),
        }
        .expect("missing cluster should fail");

        assert!(matches!(err, Error::Validation { .. }));
        assert!(err
            .to_string()
            .contains("missing cluster for machine default/worker-0"));
        assert!(!err.is_retryable());
    }

    // =========================================================================
    // Create
    // =========================================================================

    #[tokio::test]
    async fn story_create_waits_for_cluster_infrastructure() {
        let actuator = Mocks::new().into_actuator();
        let err = actuator
            .create(
                Some(&cluster_with(ClusterReadiness::NOT_READY)),
                &worker_machine("worker-0"),
            )
            .await
            .expect_err("create should requeue");
        assert_eq!(err.requeue_delay(), Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn story_control_plane_annotation_alone_does_not_open_create() {
        let actuator = Mocks::new().into_actuator();
        let control_plane_only = ClusterReadiness {
            infrastructure: false,
            control_plane: true,
        };
        let err = actuator
            .create(
                Some(&cluster_with(control_plane_only)),
                &control_plane_machine("cp-0"),
            )
            .await
            .expect_err("create should requeue");
        assert_eq!(err.requeue_delay(), Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn story_create_refuses_to_relink_machine_to_another_instance() {
        let mut mocks = Mocks::new();
        mocks
            .machines
            .expect_list_cluster_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("cp-0")]));
        mocks.locker.expect_acquire().returning(|_| true);
        mocks
            .instances
            .expect_create_or_get_instance()
            .times(1)
            .returning(|_, _| Ok(instance("i-new", InstanceState::Pending)));
        mocks
            .load_balancers
            .expect_register_instance_with_api_server_lb()
            .never();
        mocks.machines.expect_update_machine().returning(|_| Ok(()));
        mocks
            .machines
            .expect_update_machine_status()
            .withf(|m| {
                m.status
                    .as_ref()
                    .and_then(|s| s.provider_status.instance_id.as_deref())
                    == Some("i-old")
            })
            .returning(|_| Ok(()));

        let err = mocks
            .into_actuator()
            .create(
                Some(&cluster()),
                &linked(control_plane_machine("cp-0"), "i-old"),
            )
            .await
            .expect_err("relink should fail");
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("i-new"));
        assert!(!err.is_retryable());
        assert_eq!(err.requeue_delay(), None);
    }

    #[tokio::test]
    async fn story_create_waits_for_a_control_plane_machine() {
        let mut mocks = Mocks::new();
        mocks
            .machines
            .expect_list_cluster_machines()
            .withf(|ns, cluster| ns == "default" && cluster == "prod")
            .returning(|_, _| Ok(vec![worker_machine("worker-0")]));

        let err = mocks
            .into_actuator()
            .create(Some(&cluster()), &worker_machine("worker-0"))
            .await
            .expect_err("create should requeue");
        assert_eq!(err.requeue_delay(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn story_first_control_plane_machine_inits_without_token() {
        let mut mocks = Mocks::new();
        mocks
            .machines
            .expect_list_cluster_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("cp-0")]));
        mocks.locker.expect_acquire().times(1).returning(|_| true);
        mocks
            .instances
            .expect_create_or_get_instance()
            .times(1)
            .withf(|_, token| token.is_empty())
            .returning(|_, _| Ok(instance("i-cp", InstanceState::Pending)));
        mocks
            .load_balancers
            .expect_register_instance_with_api_server_lb()
            .times(1)
            .withf(|_, id| id == "i-cp")
            .returning(|_, _| Ok(()));
        mocks
            .machines
            .expect_update_machine()
            .times(1)
            .withf(|m| {
                m.annotations().get("cluster-api-provider-aws").map(String::as_str) == Some("true")
            })
            .returning(|_| Ok(()));
        mocks
            .machines
            .expect_update_machine_status()
            .times(1)
            .withf(|m| {
                let status = m.status.as_ref().map(|s| &s.provider_status);
                status.and_then(|s| s.instance_id.as_deref()) == Some("i-cp")
                    && status.and_then(|s| s.instance_state) == Some(InstanceState::Pending)
            })
            .returning(|_| Ok(()));

        mocks
            .into_actuator()
            .create(Some(&cluster()), &control_plane_machine("cp-0"))
            .await
            .expect("init create should succeed");
    }

    #[tokio::test]
    async fn story_worker_joins_with_one_token_and_no_lb_registration() {
        let mut mocks = Mocks::new();
        mocks
            .machines
            .expect_list_cluster_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("cp-0"), worker_machine("worker-0")]));
        mocks
            .accessor
            .expect_get_ip()
            .returning(|_| Ok("prod-apiserver.example.com".to_string()));
        mocks
            .accessor
            .expect_get_kubeconfig()
            .returning(|_| Ok("apiVersion: v1".to_string()));
        mocks
            .tokens
            .expect_new_bootstrap_token()
            .times(1)
            .withf(|endpoint, ttl| {
                endpoint.url == "https://prod-apiserver.example.com:6443"
                    && *ttl == Duration::from_secs(600)
            })
            .returning(|_, _| Ok("abcdef.0123456789abcdef".to_string()));
        mocks
            .instances
            .expect_create_or_get_instance()
            .times(1)
            .withf(|_, token| token == "abcdef.0123456789abcdef")
            .returning(|_, _| Ok(instance("i-w", InstanceState::Pending)));
        mocks
            .load_balancers
            .expect_register_instance_with_api_server_lb()
            .never();
        mocks.expect_persist();

        mocks
            .into_actuator()
            .create(
                Some(&cluster_with(ClusterReadiness::CONTROL_PLANE_READY)),
                &worker_machine("worker-0"),
            )
            .await
            .expect("join create should succeed");
    }

    #[tokio::test]
    async fn story_lock_loser_requeues_without_creating() {
        let mut mocks = Mocks::new();
        mocks
            .machines
            .expect_list_cluster_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("cp-0"), control_plane_machine("cp-1")]));
        mocks.locker.expect_acquire().returning(|_| false);
        mocks.instances.expect_create_or_get_instance().never();

        let err = mocks
            .into_actuator()
            .create(Some(&cluster()), &control_plane_machine("cp-1"))
            .await
            .expect_err("loser should requeue");
        assert_eq!(err.requeue_delay(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_token_failure_is_wrapped_and_stops_create() {
        let mut mocks = Mocks::new();
        mocks
            .machines
            .expect_list_cluster_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("cp-0")]));
        mocks
            .accessor
            .expect_get_ip()
            .returning(|_| Ok("10.0.0.1".to_string()));
        mocks
            .accessor
            .expect_get_kubeconfig()
            .returning(|_| Ok("apiVersion: v1".to_string()));
        mocks
            .tokens
            .expect_new_bootstrap_token()
            .returning(|_, _| Err(Error::bootstrap_with_context("token", "forbidden")));
        mocks.instances.expect_create_or_get_instance().never();

        let err = mocks
            .into_actuator()
            .create(
                Some(&cluster_with(ClusterReadiness::CONTROL_PLANE_READY)),
                &worker_machine("worker-0"),
            )
            .await
            .expect_err("token failure should propagate");
        assert!(err
            .to_string()
            .contains("failed to create new bootstrap token: forbidden"));
    }

    #[tokio::test]
    async fn test_lb_failure_fails_create_but_keeps_instance_link() {
        let mut mocks = Mocks::new();
        mocks
            .machines
            .expect_list_cluster_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("cp-0")]));
        mocks.locker.expect_acquire().returning(|_| true);
        mocks
            .instances
            .expect_create_or_get_instance()
            .returning(|_, _| Ok(instance("i-cp", InstanceState::Pending)));
        mocks
            .load_balancers
            .expect_register_instance_with_api_server_lb()
            .returning(|_, _| Err(Error::provider_for("aws", "register", "elb", "throttled")));
        mocks.machines.expect_update_machine().returning(|_| Ok(()));
        mocks
            .machines
            .expect_update_machine_status()
            .times(1)
            .withf(|m| {
                m.status
                    .as_ref()
                    .and_then(|s| s.provider_status.instance_id.as_deref())
                    == Some("i-cp")
            })
            .returning(|_| Ok(()));

        let err = mocks
            .into_actuator()
            .create(Some(&cluster()), &control_plane_machine("cp-0"))
            .await
            .expect_err("lb failure should propagate");
        assert!(err.to_string().contains("i-cp"));
        assert!(err.is_retryable());
    }

    // =========================================================================
    // Delete
    // =========================================================================

    #[tokio::test]
    async fn story_delete_terminates_running_instance() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .withf(|id| id == "i-1")
            .returning(|_| Ok(Some(instance("i-1", InstanceState::Running))));
        mocks
            .instances
            .expect_terminate_instance()
            .times(1)
            .withf(|id| id == "i-1")
            .returning(|_| Ok(()));

        mocks
            .into_actuator()
            .delete(Some(&cluster()), &linked(worker_machine("worker-0"), "i-1"))
            .await
            .expect("delete should succeed");
    }

    #[rstest::rstest]
    #[case::shutting_down(InstanceState::ShuttingDown)]
    #[case::terminated(InstanceState::Terminated)]
    #[tokio::test]
    async fn story_delete_of_terminating_instance_is_a_no_op(#[case] state: InstanceState) {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(move |_| Ok(Some(instance("i-1", state))));
        mocks.instances.expect_terminate_instance().never();

        let actuator = mocks.into_actuator();
        let machine = linked(worker_machine("worker-0"), "i-1");
        for _ in 0..2 {
            actuator
                .delete(Some(&cluster()), &machine)
                .await
                .expect("delete should succeed");
        }
    }

    #[tokio::test]
    async fn story_delete_falls_back_to_tag_lookup() {
        let mut mocks = Mocks::new();
        mocks.instances.expect_instance_if_exists().never();
        mocks
            .instances
            .expect_instance_by_tags()
            .times(1)
            .returning(|_| Ok(Some(instance("i-orphan", InstanceState::Pending))));
        mocks
            .instances
            .expect_terminate_instance()
            .times(1)
            .withf(|id| id == "i-orphan")
            .returning(|_| Ok(()));

        mocks
            .into_actuator()
            .delete(Some(&cluster()), &worker_machine("worker-0"))
            .await
            .expect("delete should succeed");
    }

    #[tokio::test]
    async fn story_delete_of_never_created_machine_succeeds() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(|_| Ok(None));
        mocks
            .instances
            .expect_instance_by_tags()
            .returning(|_| Ok(None));
        mocks.instances.expect_terminate_instance().never();

        mocks
            .into_actuator()
            .delete(Some(&cluster()), &linked(worker_machine("worker-0"), "i-gone"))
            .await
            .expect("delete should succeed");
    }

    #[tokio::test]
    async fn test_terminate_failure_propagates_with_context() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(|_| Ok(Some(instance("i-1", InstanceState::Running))));
        mocks
            .instances
            .expect_terminate_instance()
            .returning(|_| Err(Error::provider_for("aws", "terminate instance", "i-1", "throttled")));

        let err = mocks
            .into_actuator()
            .delete(Some(&cluster()), &linked(worker_machine("worker-0"), "i-1"))
            .await
            .expect_err("terminate failure should propagate");
        assert!(err
            .to_string()
            .contains("failed to terminate instance: throttled"));
    }

    // =========================================================================
    // Update
    // =========================================================================

    #[tokio::test]
    async fn story_immutable_change_is_rejected_before_any_mutation() {
        let mut mocks = Mocks::new();
        mocks.instances.expect_instance_if_exists().returning(|_| {
            let mut observed = instance("i-1", InstanceState::Running);
            observed.instance_type = "m5.xlarge".to_string();
            Ok(Some(observed))
        });
        mocks.instances.expect_get_instance_security_groups().never();
        mocks.instances.expect_update_instance_security_groups().never();
        mocks.instances.expect_update_resource_tags().never();

        let err = mocks
            .into_actuator()
            .update(Some(&cluster()), &linked(worker_machine("worker-0"), "i-1"))
            .await
            .expect_err("immutable change should fail");
        match &err {
            Error::ImmutableFieldChange { violations, .. } => assert_eq!(violations.len(), 1),
            other => panic!("expected ImmutableFieldChange, got {:?}", other),
        }
        let msg = err.to_string();
        assert!(msg.contains("m5.xlarge"));
        assert!(msg.contains("m5.large"));
    }

    #[tokio::test]
    async fn story_update_converges_groups_and_tags() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(|_| Ok(Some(instance("i-1", InstanceState::Running))));
        mocks
            .instances
            .expect_get_instance_security_groups()
            .returning(|_| Ok(BTreeMap::from([("sg-node".to_string(), "node".to_string())])));
        mocks
            .instances
            .expect_get_core_security_groups()
            .returning(|_| Ok(vec!["sg-node".to_string()]));
        mocks
            .instances
            .expect_update_instance_security_groups()
            .times(1)
            .withf(|_, groups| groups == &["sg-extra", "sg-node"])
            .returning(|_, _| Ok(()));
        mocks
            .instances
            .expect_update_resource_tags()
            .times(1)
            .returning(|_, _, _| Ok(()));
        mocks
            .machines
            .expect_update_machine()
            .times(1)
            .withf(|m| {
                m.annotations()
                    .get("cluster-api-provider-aws-last-applied-tags")
                    .map(String::as_str)
                    == Some(r#"{"env":"prod"}"#)
            })
            .returning(|_| Ok(()));

        let mut machine = linked(worker_machine("worker-0"), "i-1");
        machine.spec.provider_spec.additional_security_groups =
            vec![keel_common::crd::AwsResourceReference::by_id("sg-extra")];
        machine.spec.provider_spec.additional_tags =
            BTreeMap::from([("env".to_string(), "prod".to_string())]);

        mocks
            .into_actuator()
            .update(Some(&cluster()), &machine)
            .await
            .expect("update should succeed");
    }

    #[tokio::test]
    async fn story_update_without_instance_is_retryable_and_mutates_nothing() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(|_| Ok(None));
        mocks.instances.expect_update_instance_security_groups().never();
        mocks.instances.expect_update_resource_tags().never();
        let actuator = mocks.into_actuator();

        let err = actuator
            .update(Some(&cluster()), &worker_machine("worker-0"))
            .await
            .expect_err("unlinked machine cannot be updated");
        assert!(err.to_string().contains("instance not found"));
        assert!(err.is_retryable());

        let err = actuator
            .update(Some(&cluster()), &linked(worker_machine("worker-0"), "i-gone"))
            .await
            .expect_err("missing instance cannot be updated");
        assert!(err.to_string().contains("i-gone"));
    }

    // =========================================================================
    // Exists
    // =========================================================================

    #[tokio::test]
    async fn story_exists_is_false_without_recorded_instance() {
        let actuator = Mocks::new().into_actuator();
        let exists = actuator
            .exists(Some(&cluster()), &worker_machine("worker-0"))
            .await
            .expect("exists should not fail");
        assert!(!exists);
    }

    #[rstest::rstest]
    #[case::absent(None)]
    #[case::stopped(Some(InstanceState::Stopped))]
    #[case::terminated(Some(InstanceState::Terminated))]
    #[case::shutting_down(Some(InstanceState::ShuttingDown))]
    #[tokio::test]
    async fn story_exists_is_false_for_missing_or_dead_instances(
        #[case] state: Option<InstanceState>,
    ) {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(move |id| Ok(state.map(|s| instance(id, s))));
        mocks
            .load_balancers
            .expect_register_instance_with_api_server_lb()
            .never();

        let exists = mocks
            .into_actuator()
            .exists(Some(&cluster()), &linked(control_plane_machine("cp-0"), "i-1"))
            .await
            .expect("exists should not fail");
        assert!(!exists);
    }

    #[tokio::test]
    async fn story_exists_records_state_registers_and_sets_provider_id() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(|id| Ok(Some(instance(id, InstanceState::Pending))));
        mocks
            .load_balancers
            .expect_register_instance_with_api_server_lb()
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .machines
            .expect_update_machine()
            .times(1)
            .withf(|m| m.spec.provider_id.as_deref() == Some("aws:////i-1"))
            .returning(|_| Ok(()));
        mocks
            .machines
            .expect_update_machine_status()
            .times(1)
            .withf(|m| {
                m.status
                    .as_ref()
                    .and_then(|s| s.provider_status.instance_state)
                    == Some(InstanceState::Pending)
            })
            .returning(|_| Ok(()));

        let exists = mocks
            .into_actuator()
            .exists(Some(&cluster()), &linked(control_plane_machine("cp-0"), "i-1"))
            .await
            .expect("exists should succeed");
        assert!(exists);
    }

    #[tokio::test]
    async fn test_exists_keeps_existing_provider_id() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(|id| Ok(Some(instance(id, InstanceState::Running))));
        // Running state and provider id already recorded: nothing to persist
        mocks.machines.expect_update_machine().never();
        mocks.machines.expect_update_machine_status().never();

        let mut machine = linked(worker_machine("worker-0"), "i-1");
        machine.spec.provider_id = Some("aws:////i-1".to_string());

        let exists = mocks
            .into_actuator()
            .exists(Some(&cluster()), &machine)
            .await
            .expect("exists should succeed");
        assert!(exists);
    }

    #[tokio::test]
    async fn test_exists_surfaces_lb_failure() {
        let mut mocks = Mocks::new();
        mocks
            .instances
            .expect_instance_if_exists()
            .returning(|id| Ok(Some(instance(id, InstanceState::Running))));
        mocks
            .load_balancers
            .expect_register_instance_with_api_server_lb()
            .returning(|_, _| Err(Error::provider_for("aws", "register", "elb", "denied")));

        let err = mocks
            .into_actuator()
            .exists(Some(&cluster()), &linked(control_plane_machine("cp-0"), "i-1"))
            .await
            .expect_err("lb failure should surface");
        assert!(err.to_string().contains("denied"));
    }
}
