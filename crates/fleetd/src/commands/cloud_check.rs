use dialoguer::Select;
use fleet_cloudcheck::{CheckReport, Resolution, default_resolution, resolutions_for};

use crate::director::Director;

/// How problems get resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Ask for every problem.
    Interactive,
    /// Apply the default resolution to every problem.
    Auto,
    /// Only list problems.
    Report,
}

pub async fn cloud_check(director: &Director, deployment: &str, mode: Mode) -> anyhow::Result<()> {
    let reconciler = director.reconciler();
    let report = match mode {
        Mode::Auto => reconciler.auto(deployment).await?,
        Mode::Report => reconciler.report(deployment).await?,
        Mode::Interactive => {
            let scan = reconciler.scan(deployment).await?;
            if scan.problems.is_empty() {
                CheckReport::scan_only(scan)
            } else {
                let mut choices = Vec::with_capacity(scan.problems.len());
                for problem in &scan.problems {
                    println!("Problem {} of {}: {}", problem.id, problem.kind.as_str(), problem.description);
                    choices.push((problem.clone(), choose(problem.kind)?));
                }
                reconciler.apply(scan, choices).await?
            }
        }
    };

    print!("{}", report.render());
    if report.succeeded() {
        return Ok(());
    }
    let failed = report.failed().len();
    if failed > 0 {
        anyhow::bail!("{failed} problem resolutions failed")
    }
    anyhow::bail!("{} problems remain open", report.remaining.unwrap_or(0))
}

fn choose(kind: fleet_state::ProblemKind) -> anyhow::Result<Resolution> {
    let options = resolutions_for(kind);
    let labels: Vec<&str> = options.iter().map(|r| r.label()).collect();
    let default = options
        .iter()
        .position(|r| *r == default_resolution(kind))
        .unwrap_or(0);
    let picked = Select::new()
        .with_prompt("Resolution")
        .items(&labels)
        .default(default)
        .interact()?;
    Ok(options[picked])
}
