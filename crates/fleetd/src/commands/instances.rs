use crate::director::Director;

pub fn instances(director: &Director, deployment: &str) -> anyhow::Result<()> {
    let instances = director.store.list_instances(deployment)?;
    println!("Deployment '{deployment}'");
    println!("{:<48} {:<10} {:<6} {:<16} {}", "Instance", "State", "AZ", "IPs", "VM CID");
    for instance in &instances {
        println!(
            "{:<48} {:<10} {:<6} {:<16} {}",
            format!("{}/{}", instance.group, instance.id),
            format!("{:?}", instance.state).to_lowercase(),
            instance.az.as_deref().unwrap_or("-"),
            instance.ip,
            instance.vm_cid.as_deref().unwrap_or("-"),
        );
    }
    println!("{} instances", instances.len());
    Ok(())
}
