//! Local DNS files of one agent.
//!
//! Layout of the agent directory:
//!
//! ```text
//! <dir>/hosts                    <ip> <hostname> per line
//! <dir>/records.json             LocalDnsRecords of the applied version
//! <dir>/records-at-prestart.json records.json as seen when jobs started
//! ```
//!
//! Both files are replaced atomically (write temp, rename) so readers see
//! either the old or the new record set, never a mix.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use fleet_cloud::{AgentError, AgentResult, LocalDnsRecords, SyncOutcome};
use tracing::debug;

const HOSTS_FILE: &str = "hosts";
const RECORDS_FILE: &str = "records.json";
const PRESTART_FILE: &str = "records-at-prestart.json";

/// Local DNS state of one agent, rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalDns {
    dir: PathBuf,
}

impl LocalDns {
    pub fn open(dir: &Path) -> AgentResult<Self> {
        std::fs::create_dir_all(dir).map_err(storage_err)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The record set currently applied, if any.
    pub async fn current(&self) -> AgentResult<Option<LocalDnsRecords>> {
        self.read_records(RECORDS_FILE).await
    }

    /// Version of the applied record set (0 when nothing was applied yet).
    pub async fn applied_version(&self) -> AgentResult<u64> {
        Ok(self.current().await?.map(|r| r.version).unwrap_or(0))
    }

    /// Apply a record set unless the same or a newer version is applied.
    pub async fn apply(&self, records: &LocalDnsRecords) -> AgentResult<SyncOutcome> {
        let applied = self.applied_version().await?;
        if records.version <= applied {
            debug!(dir = ?self.dir, received = records.version, applied, "ignoring stale dns sync");
            return Ok(SyncOutcome::Stale);
        }
        self.write_atomic(HOSTS_FILE, records.hosts_file().into_bytes())
            .await?;
        let json = serde_json::to_vec_pretty(records).map_err(storage_err)?;
        self.write_atomic(RECORDS_FILE, json).await?;
        debug!(dir = ?self.dir, version = records.version, records = records.records.len(), "dns records applied");
        Ok(SyncOutcome::Applied)
    }

    /// Copy the applied record set aside as it stands when jobs start.
    pub async fn snapshot_prestart(&self) -> AgentResult<()> {
        let records = self.current().await?;
        let json = serde_json::to_vec_pretty(&records).map_err(storage_err)?;
        self.write_atomic(PRESTART_FILE, json).await
    }

    /// Record set captured by the last [`Self::snapshot_prestart`].
    pub async fn prestart_records(&self) -> AgentResult<Option<LocalDnsRecords>> {
        self.read_records(PRESTART_FILE).await
    }

    /// Entries of the applied hosts file, in file order.
    pub async fn hosts(&self) -> AgentResult<Vec<(IpAddr, String)>> {
        let content = match tokio::fs::read_to_string(self.dir.join(HOSTS_FILE)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(e)),
        };
        content.lines().map(hosts_entry).collect()
    }

    /// Resolve a hostname through the applied hosts file.
    pub async fn resolve(&self, hostname: &str) -> AgentResult<Vec<IpAddr>> {
        Ok(self
            .hosts()
            .await?
            .into_iter()
            .filter(|(_, host)| host.eq_ignore_ascii_case(hostname))
            .map(|(ip, _)| ip)
            .collect())
    }

    async fn read_records(&self, file: &str) -> AgentResult<Option<LocalDnsRecords>> {
        match tokio::fs::read(self.dir.join(file)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(storage_err),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn write_atomic(&self, file: &str, bytes: Vec<u8>) -> AgentResult<()> {
        let tmp = self.dir.join(format!(".{file}.tmp"));
        tokio::fs::write(&tmp, bytes).await.map_err(storage_err)?;
        tokio::fs::rename(&tmp, self.dir.join(file))
            .await
            .map_err(storage_err)
    }
}

/// One `<ip> <hostname>` line as written by [`LocalDnsRecords::hosts_file`].
fn hosts_entry(line: &str) -> AgentResult<(IpAddr, String)> {
    let corrupt = || AgentError::Storage(format!("corrupt hosts entry {line:?}"));
    let (ip, host) = line.split_once(' ').ok_or_else(corrupt)?;
    let ip = ip.parse::<IpAddr>().map_err(|_| corrupt())?;
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(corrupt());
    }
    Ok((ip, host.to_string()))
}

fn storage_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_cloud::RecordInfo;

    fn records(version: u64, hosts: &[(&str, &str)]) -> LocalDnsRecords {
        LocalDnsRecords::new(
            version,
            hosts
                .iter()
                .map(|(ip, host)| (ip.to_string(), host.to_string()))
                .collect(),
            hosts
                .iter()
                .map(|(ip, host)| RecordInfo {
                    id: host.split('.').next().unwrap_or_default().to_string(),
                    instance_group: "web".to_string(),
                    az: None,
                    network: "default".to_string(),
                    deployment: "app".to_string(),
                    ip: ip.to_string(),
                    domain: "bosh".to_string(),
                    agent_id: "agent".to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn hosts_entries_are_strict() {
        let (ip, host) = hosts_entry("10.0.0.2 a.web.default.app.bosh").unwrap();
        assert_eq!(ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(host, "a.web.default.app.bosh");

        assert!(hosts_entry("not-an-ip a.web.bosh").is_err());
        assert!(hosts_entry("10.0.0.2").is_err());
        assert!(hosts_entry("10.0.0.2 a.web.bosh b.web.bosh").is_err());
    }

    #[tokio::test]
    async fn corrupt_hosts_file_fails_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let dns = LocalDns::open(dir.path()).unwrap();
        assert!(dns.hosts().await.unwrap().is_empty());
        std::fs::write(dir.path().join(HOSTS_FILE), "10.0.0.2 a.web.bosh\n# edited\n").unwrap();
        assert!(matches!(
            dns.resolve("a.web.bosh").await,
            Err(AgentError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn apply_is_version_gated() {
        let dir = tempfile::tempdir().unwrap();
        let dns = LocalDns::open(dir.path()).unwrap();
        assert_eq!(dns.applied_version().await.unwrap(), 0);

        let v2 = records(2, &[("10.0.0.2", "a.web.default.app.bosh")]);
        assert_eq!(dns.apply(&v2).await.unwrap(), SyncOutcome::Applied);
        assert_eq!(dns.apply(&v2).await.unwrap(), SyncOutcome::Stale);

        let v1 = records(1, &[("10.0.0.9", "old.web.default.app.bosh")]);
        assert_eq!(dns.apply(&v1).await.unwrap(), SyncOutcome::Stale);
        assert_eq!(dns.current().await.unwrap().unwrap(), v2);
        assert!(dns.resolve("old.web.default.app.bosh").await.unwrap().is_empty());
        assert_eq!(
            dns.resolve("A.web.default.app.bosh").await.unwrap(),
            vec!["10.0.0.2".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn applied_version_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        LocalDns::open(dir.path())
            .unwrap()
            .apply(&records(5, &[]))
            .await
            .unwrap();
        let reopened = LocalDns::open(dir.path()).unwrap();
        assert_eq!(reopened.applied_version().await.unwrap(), 5);
        assert_eq!(
            reopened.apply(&records(4, &[])).await.unwrap(),
            SyncOutcome::Stale
        );
    }
}
