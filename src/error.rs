use crate::{
    address_space::{memory_range::MemoryRange, NormalizeStep},
    monitor::RegistrationStage,
};
use nix::errno::Errno;
use std::{io, time::Duration};
use thiserror::Error;

/// Everything that can go wrong while setting up or driving the harness.
///
/// Failures inside the monitor's fault loop are not represented here: a
/// writer is stalled in the kernel at that point, so the monitor aborts the
/// process instead of returning.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("could not enumerate memory regions: {0}")]
    Catalog(String),

    #[error("userfaultfd write-protect monitoring is unavailable: {0}")]
    Unsupported(String),

    #[error("userfaultfd feature negotiation failed during {stage}: {errno}")]
    Negotiation { stage: &'static str, errno: Errno },

    #[error("region registration failed ({stage}) for {region}: {errno}")]
    Registration {
        region: MemoryRange,
        stage: RegistrationStage,
        errno: Errno,
    },

    #[error("address space normalization failed for {region} at step `{step}`: {errno}")]
    Normalization {
        region: String,
        step: NormalizeStep,
        errno: Errno,
    },

    #[error("could not map harness-private memory: {0}")]
    PrivateMemory(Errno),

    #[error("could not start the protection monitor thread: {0}")]
    MonitorThread(Errno),

    #[error("protection monitor did not arm within {0:?}")]
    ArmTimeout(Duration),

    #[error("{in_flight} write fault(s) still unresolved {timeout:?} after the target returned")]
    DrainTimeout { in_flight: usize, timeout: Duration },

    #[error("restored memory differs from its baseline after iteration {iteration} in {region}")]
    RestoreMismatch { iteration: usize, region: MemoryRange },

    #[error("could not re-arm write protection for page {page:#x}: {errno}")]
    Rearm { page: usize, errno: Errno },

    #[error("harness is {actual}, but this operation needs it {expected}")]
    Lifecycle {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("target execution context: {0}")]
    ExecutionContext(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HarnessError {
    /// The sub-operation that failed, for exit messages.
    pub fn phase(&self) -> &'static str {
        match self {
            HarnessError::Catalog(_) => "region enumeration",
            HarnessError::Unsupported(_) | HarnessError::Negotiation { .. } => {
                "facility negotiation"
            }
            HarnessError::Registration { .. } | HarnessError::ArmTimeout(_) => {
                "region registration"
            }
            HarnessError::Normalization { .. } => "address-space normalization",
            HarnessError::PrivateMemory(_) | HarnessError::MonitorThread(_) => "harness setup",
            HarnessError::DrainTimeout { .. }
            | HarnessError::RestoreMismatch { .. }
            | HarnessError::Rearm { .. }
            | HarnessError::ExecutionContext(_) => "iteration",
            HarnessError::Lifecycle { .. } => "lifecycle",
            HarnessError::Io(_) => "i/o",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_sub_operation_test() {
        let e = HarnessError::Registration {
            region: MemoryRange::from_range(0x1000, 0x2000),
            stage: RegistrationStage::Register,
            errno: Errno::EINVAL,
        };
        let msg = e.to_string();
        assert!(msg.contains("0x1000-0x2000"), "{}", msg);
        assert!(msg.contains("UFFDIO_REGISTER"), "{}", msg);
        assert_eq!(e.phase(), "region registration");

        let e = HarnessError::Normalization {
            region: "[heap]".into(),
            step: NormalizeStep::MapFixed,
            errno: Errno::ENOMEM,
        };
        assert!(e.to_string().contains("[heap]"));
        assert_eq!(e.phase(), "address-space normalization");
    }
}
