use fleet_director::TeardownPlan;

use crate::director::Director;

pub async fn delete_deployment(director: &Director, deployment: &str) -> anyhow::Result<()> {
    let plan = TeardownPlan::load(&director.store, deployment)?;
    let report = director
        .deployment_deleter()
        .delete(&plan, &director.instance_deleter(), &director.vm_deleter())
        .await?;

    println!("Deleted deployment '{}'", report.deployment);
    println!(
        "  unlinked {} stemcells, {} releases; {} properties",
        report.unlinked.stemcells.len(),
        report.unlinked.release_versions.len(),
        report.properties_deleted
    );
    if let Some(count) = report.dns_records_deleted {
        println!("  {count} local dns records deleted");
    }
    for failure in report.instance_failures.iter().chain(&report.vm_failures) {
        println!("  warning: {failure}");
    }
    println!("Succeeded");
    Ok(())
}
