//! Building DNS rows and the agent payload.

use fleet_cloud::{LocalDnsRecords, RecordInfo};
use fleet_state::{DnsRecord, DnsRecordSpec, Instance};
use serde::{Deserialize, Serialize};

use crate::canonical::Canonicalizer;
use crate::error::DnsResult;

/// Local DNS settings shared by every deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Top-level suffix of every hostname.
    pub domain_name: String,
    /// Also publish `<index>.<group>.<network>.<deployment>.<domain>`.
    pub include_index: bool,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            domain_name: "bosh".to_string(),
            include_index: false,
        }
    }
}

/// `<instance-id>.<group>.<network>.<deployment>.<domain>`
pub fn hostname(spec: &DnsRecordSpec) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        spec.instance_id, spec.instance_group, spec.network, spec.deployment, spec.domain
    )
}

/// `<index>.<group>.<network>.<deployment>.<domain>`
pub fn index_hostname(spec: &DnsRecordSpec) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        spec.index, spec.instance_group, spec.network, spec.deployment, spec.domain
    )
}

/// Derives DNS rows from instances and renders record sets for agents.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    canonicalizer: Canonicalizer,
    settings: DnsSettings,
}

impl RecordBuilder {
    pub fn new(settings: DnsSettings) -> DnsResult<Self> {
        Ok(Self {
            canonicalizer: Canonicalizer::new()?,
            settings,
        })
    }

    pub fn settings(&self) -> &DnsSettings {
        &self.settings
    }

    /// The row an instance should own. Needs identity only, not a VM.
    pub fn spec(&self, instance: &Instance) -> DnsRecordSpec {
        DnsRecordSpec {
            instance_id: instance.id.clone(),
            index: instance.index,
            instance_group: self.canonicalizer.canonicalize(&instance.group),
            az: instance.az.clone(),
            network: self.canonicalizer.canonicalize(&instance.network),
            deployment: self.canonicalizer.canonicalize(&instance.deployment),
            ip: instance.ip.clone(),
            domain: self.settings.domain_name.clone(),
            agent_id: instance.agent_id.clone(),
        }
    }

    /// Target rows for a deployment: one per live instance, by group and index.
    ///
    /// An instance still waiting for a dynamic address has nothing to resolve
    /// to and gets no row yet.
    pub fn target(&self, instances: &[Instance]) -> Vec<DnsRecordSpec> {
        let mut live: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.state.is_live() && !i.ip.is_empty())
            .collect();
        live.sort_by(|a, b| (&a.group, a.index).cmp(&(&b.group, b.index)));
        live.into_iter().map(|i| self.spec(i)).collect()
    }

    /// Agent payload for `records` at `version`, rows ordered by row id.
    pub fn to_wire(&self, version: u64, records: &[DnsRecord]) -> LocalDnsRecords {
        let mut rows: Vec<&DnsRecord> = records.iter().collect();
        rows.sort_by_key(|r| r.id);

        let mut hosts = Vec::with_capacity(rows.len());
        for row in &rows {
            hosts.push((row.spec.ip.clone(), hostname(&row.spec)));
        }
        if self.settings.include_index {
            for row in &rows {
                hosts.push((row.spec.ip.clone(), index_hostname(&row.spec)));
            }
        }

        let infos = rows
            .iter()
            .map(|row| RecordInfo {
                id: row.spec.instance_id.clone(),
                instance_group: row.spec.instance_group.clone(),
                az: row.spec.az.clone(),
                network: row.spec.network.clone(),
                deployment: row.spec.deployment.clone(),
                ip: row.spec.ip.clone(),
                domain: row.spec.domain.clone(),
                agent_id: row.spec.agent_id.clone(),
            })
            .collect();
        LocalDnsRecords::new(version, hosts, infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::InstanceLifecycle;

    fn instance(index: u32, state: InstanceLifecycle) -> Instance {
        Instance {
            id: format!("uuid-{index}"),
            deployment: "simple.local_dns".to_string(),
            group: "job_to_test_local_dns".to_string(),
            index,
            az: None,
            network: "local_dns".to_string(),
            ip: format!("10.0.0.{}", index + 2),
            dynamic_ip: false,
            agent_id: format!("agent-{index}"),
            state,
            vm_cid: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn spec_canonicalizes_names() {
        let builder = RecordBuilder::new(DnsSettings::default()).unwrap();
        let spec = builder.spec(&instance(0, InstanceLifecycle::Desired));
        assert_eq!(
            hostname(&spec),
            "uuid-0.job-to-test-local-dns.local-dns.simplelocal-dns.bosh"
        );
        assert_eq!(spec.agent_id, "agent-0");
    }

    #[test]
    fn target_skips_instances_being_deleted() {
        let builder = RecordBuilder::new(DnsSettings::default()).unwrap();
        let target = builder.target(&[
            instance(1, InstanceLifecycle::Running),
            instance(0, InstanceLifecycle::Desired),
            instance(2, InstanceLifecycle::Deleting),
        ]);
        let ids: Vec<&str> = target.iter().map(|s| s.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["uuid-0", "uuid-1"]);
    }

    #[test]
    fn target_waits_for_a_dynamic_address() {
        let builder = RecordBuilder::new(DnsSettings::default()).unwrap();
        let mut pending = instance(0, InstanceLifecycle::Desired);
        pending.dynamic_ip = true;
        pending.ip = String::new();
        let target = builder.target(&[pending, instance(1, InstanceLifecycle::Running)]);
        let ids: Vec<&str> = target.iter().map(|s| s.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["uuid-1"]);
    }

    #[test]
    fn include_index_adds_index_hostnames() {
        let builder = RecordBuilder::new(DnsSettings {
            domain_name: "bosh".to_string(),
            include_index: true,
        })
        .unwrap();
        let record = DnsRecord {
            id: 1,
            owner: "simple.local_dns".to_string(),
            spec: builder.spec(&instance(3, InstanceLifecycle::Running)),
        };
        let wire = builder.to_wire(4, &[record]);
        let hosts: Vec<&str> = wire.hostnames().collect();
        assert_eq!(
            hosts,
            vec![
                "uuid-3.job-to-test-local-dns.local-dns.simplelocal-dns.bosh",
                "3.job-to-test-local-dns.local-dns.simplelocal-dns.bosh",
            ]
        );
        assert_eq!(wire.record_infos.len(), 1);
        assert_eq!(wire.version, 4);
    }
}
