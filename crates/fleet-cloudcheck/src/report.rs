//! Cloud-check reports.

use fleet_state::Problem;

use crate::reconciler::Scan;
use crate::resolution::Resolution;

/// One resolution as applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResolution {
    pub problem: Problem,
    pub resolution: Resolution,
    /// Why the resolution failed, if it did.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub scan: Scan,
    pub applied: Vec<AppliedResolution>,
    /// Open problems after resolving; `None` when nothing was resolved.
    pub remaining: Option<usize>,
}

impl CheckReport {
    pub fn scan_only(scan: Scan) -> Self {
        Self {
            scan,
            applied: Vec::new(),
            remaining: None,
        }
    }

    pub fn failed(&self) -> Vec<&AppliedResolution> {
        self.applied.iter().filter(|a| a.error.is_some()).collect()
    }

    /// Every resolution applied and no problem left open after them.
    pub fn succeeded(&self) -> bool {
        self.failed().is_empty() && self.remaining.unwrap_or(0) == 0
    }

    /// Text report as printed by `fleetd cloud-check`.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Scanning {} VMs\n{} problems\n",
            self.scan.scanned,
            self.scan.problems.len()
        );
        for problem in &self.scan.problems {
            out.push_str(&format!(
                "  {}: {}: {}\n",
                problem.id,
                problem.kind.as_str(),
                problem.description
            ));
        }

        if !self.applied.is_empty() {
            out.push_str("\nApplying problem resolutions\n");
            for applied in &self.applied {
                out.push_str(&format!(
                    "  {} {}: {}",
                    applied.problem.kind.as_str(),
                    applied.problem.id,
                    applied.resolution.label()
                ));
                if let Some(error) = &applied.error {
                    out.push_str(&format!(" (error: {error})"));
                }
                out.push('\n');
            }
        }
        if let Some(remaining) = self.remaining {
            out.push_str(&format!("Remaining problems: {remaining}\n"));
        }

        out.push('\n');
        out.push_str(if self.succeeded() { "Succeeded" } else { "Failed" });
        out.push('\n');
        out
    }
}
