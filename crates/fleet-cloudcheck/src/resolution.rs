//! Resolutions offered for each problem kind.

use std::fmt;

use fleet_state::ProblemKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Skip,
    RebootVm,
    /// Boot a new VM from the image the old one ran, with a new agent id.
    RecreateVm,
    /// Delete the VM and keep the instance without one.
    DeleteVm,
    /// Forget the VM without asking the cloud. The VM may leak.
    DeleteVmReference,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Skip => "skip",
            Resolution::RebootVm => "reboot_vm",
            Resolution::RecreateVm => "recreate_vm",
            Resolution::DeleteVm => "delete_vm",
            Resolution::DeleteVmReference => "delete_vm_reference",
        }
    }

    /// Menu label.
    pub fn label(self) -> &'static str {
        match self {
            Resolution::Skip => "Skip for now",
            Resolution::RebootVm => "Reboot VM",
            Resolution::RecreateVm => "Recreate VM using last known apply spec",
            Resolution::DeleteVm => "Delete VM",
            Resolution::DeleteVmReference => "Delete VM reference (DANGEROUS!)",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        ALL.into_iter().find(|r| r.as_str() == name)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL: [Resolution; 5] = [
    Resolution::Skip,
    Resolution::RebootVm,
    Resolution::RecreateVm,
    Resolution::DeleteVm,
    Resolution::DeleteVmReference,
];

/// Resolutions for `kind`, in menu order.
pub fn resolutions_for(kind: ProblemKind) -> &'static [Resolution] {
    match kind {
        ProblemKind::MissingVm => &[
            Resolution::Skip,
            Resolution::RecreateVm,
            Resolution::DeleteVmReference,
        ],
        ProblemKind::UnresponsiveAgent => &ALL,
    }
}

/// What `--auto` applies.
pub fn default_resolution(kind: ProblemKind) -> Resolution {
    match kind {
        ProblemKind::MissingVm | ProblemKind::UnresponsiveAgent => Resolution::RecreateVm,
    }
}

/// Numbered menu, one `  N. label` line per resolution.
pub fn menu(kind: ProblemKind) -> String {
    resolutions_for(kind)
        .iter()
        .enumerate()
        .map(|(i, r)| format!("  {}. {}", i + 1, r.label()))
        .collect::<Vec<_>>()
        .join("\n")
}
