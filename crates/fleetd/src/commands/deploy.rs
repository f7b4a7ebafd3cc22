use std::path::Path;

use fleet_director::DeploymentPlan;
use fleet_rollout::DeployOptions;

use crate::director::Director;

pub async fn deploy(director: &Director, manifest: &Path, recreate: bool) -> anyhow::Result<()> {
    let plan = DeploymentPlan::from_file(manifest)?;
    match director
        .coordinator
        .deploy(&plan, DeployOptions { recreate })
        .await
    {
        Ok(report) => {
            println!("Deployment '{}'", report.deployment);
            for group in &report.groups {
                println!(
                    "  {}: {} deleted, {} created, {} updated ({:?})",
                    group.group, group.deleted, group.admitted, group.updated, group.phase
                );
            }
            println!("Succeeded");
            Ok(())
        }
        Err(e) => {
            eprintln!("Deploy failed: {e}");
            Err(e.into())
        }
    }
}
