//! DNS sync payload sent to agents and written to their `records.json`.

use serde::{Deserialize, Serialize};

/// Column names of each `record_infos` row, in order.
pub const RECORD_KEYS: [&str; 8] = [
    "id",
    "instance_group",
    "az",
    "network",
    "deployment",
    "ip",
    "domain",
    "agent_id",
];

/// Full local DNS record set at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDnsRecords {
    pub version: u64,
    /// `[ip, hostname]` pairs.
    pub records: Vec<(String, String)>,
    pub record_keys: Vec<String>,
    pub record_infos: Vec<RecordInfo>,
}

impl LocalDnsRecords {
    pub fn new(version: u64, records: Vec<(String, String)>, record_infos: Vec<RecordInfo>) -> Self {
        Self {
            version,
            records,
            record_keys: RECORD_KEYS.iter().map(|k| k.to_string()).collect(),
            record_infos,
        }
    }

    /// Hosts-file rendering: one `<ip> <hostname>` line per record.
    pub fn hosts_file(&self) -> String {
        self.records
            .iter()
            .map(|(ip, host)| format!("{ip} {host}\n"))
            .collect()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|(_, host)| host.as_str())
    }
}

/// One `record_infos` row. Serialized as a JSON array in [`RECORD_KEYS`] order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RecordInfoRow", from = "RecordInfoRow")]
pub struct RecordInfo {
    /// Instance id.
    pub id: String,
    pub instance_group: String,
    pub az: Option<String>,
    pub network: String,
    pub deployment: String,
    pub ip: String,
    pub domain: String,
    pub agent_id: String,
}

type RecordInfoRow = (String, String, Option<String>, String, String, String, String, String);

impl From<RecordInfo> for RecordInfoRow {
    fn from(r: RecordInfo) -> Self {
        (
            r.id,
            r.instance_group,
            r.az,
            r.network,
            r.deployment,
            r.ip,
            r.domain,
            r.agent_id,
        )
    }
}

impl From<RecordInfoRow> for RecordInfo {
    fn from(row: RecordInfoRow) -> Self {
        let (id, instance_group, az, network, deployment, ip, domain, agent_id) = row;
        Self {
            id,
            instance_group,
            az,
            network,
            deployment,
            ip,
            domain,
            agent_id,
        }
    }
}
