//! Assembling the director's subsystems from its config.

use std::sync::Arc;

use anyhow::Context;
use fleet_agent::LocalAgents;
use fleet_cloud::DummyCloud;
use fleet_cloudcheck::CloudReconciler;
use fleet_director::{DeploymentDeleter, InstanceDeleter, VmDeleter};
use fleet_dns::DnsSynchronizer;
use fleet_events::EventLog;
use fleet_pool::TaskPool;
use fleet_rollout::RollingUpdateCoordinator;
use fleet_state::StateStore;
use tracing::info;

use crate::config::DirectorConfig;

pub struct Director {
    pub config: DirectorConfig,
    pub store: StateStore,
    pub events: EventLog,
    pub cloud: DummyCloud,
    pub agents: Arc<LocalAgents>,
    /// Record synchronizer; also the teardown's deletion path.
    pub records: DnsSynchronizer,
    pub pool: TaskPool,
    pub coordinator: RollingUpdateCoordinator,
}

impl Director {
    pub fn open(config: DirectorConfig) -> anyhow::Result<Self> {
        let data_dir = &config.director.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;

        let db_path = data_dir.join("fleet.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        let events = EventLog::with_file(&data_dir.join("events.jsonl"))?;
        let cloud = DummyCloud::open(&config.vm_dir())?;
        let agents = Arc::new(LocalAgents::new(&config.agents_dir(), cloud.clone()));
        let pool = TaskPool::new(config.director.max_threads);
        let records = DnsSynchronizer::new(
            store.clone(),
            agents.clone(),
            pool,
            config.dns.settings.clone(),
        )?;
        let dns = config.dns.enabled.then(|| records.clone());
        info!(enabled = config.dns.enabled, domain = %config.dns.settings.domain_name, "local dns configured");

        let coordinator = RollingUpdateCoordinator::new(
            store.clone(),
            events.clone(),
            Arc::new(cloud.clone()),
            agents.clone(),
            dns,
        );

        Ok(Self {
            config,
            store,
            events,
            cloud,
            agents,
            records,
            pool,
            coordinator,
        })
    }

    pub fn deployment_deleter(&self) -> DeploymentDeleter {
        DeploymentDeleter::new(
            self.store.clone(),
            self.events.clone(),
            Arc::new(self.records.clone()),
            self.config.director.max_threads,
            self.config.dns.enabled,
        )
    }

    pub fn vm_deleter(&self) -> VmDeleter {
        VmDeleter::new(Arc::new(self.cloud.clone()), self.store.clone())
    }

    pub fn instance_deleter(&self) -> InstanceDeleter {
        InstanceDeleter::new(
            self.store.clone(),
            self.agents.clone(),
            Arc::new(self.vm_deleter()),
        )
    }

    pub fn reconciler(&self) -> CloudReconciler {
        CloudReconciler::new(
            self.store.clone(),
            self.events.clone(),
            Arc::new(self.cloud.clone()),
            self.coordinator.updater().clone(),
            self.pool,
        )
    }
}
