mod vm;

pub use self::vm::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the orchestration must do for a node, derived from its role and whether it holds the cluster endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum NodeDuty {
    /// The single control-plane node on which etcd is formed and from which credentials are fetched.
    ControlPlaneBootstrap,
    /// A control-plane node which joins through the OS's own join protocol.
    ControlPlaneJoin,
    Worker,
}

impl NodeDuty {
    pub fn bootstraps(&self) -> bool {
        matches!(self, Self::ControlPlaneBootstrap)
    }
}

/// Where a node's machine comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum Placement {
    /// A VM that we create on the hypervisor, booted from the node's image profile ISO.
    Hypervisor(VmRequest),
    /// A machine outside our control. It only receives configuration.
    External,
}

/// A node's position in the provisioning state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum ProvisionStage {
    Unprovisioned,
    /// The machine exists and can receive configuration. External machines enter this stage without any work.
    VmReady,
    ConfigApplied,
    Bootstrapped,
    CredentialsIssued,
    Ready,
}

impl ProvisionStage {
    /// The stage a node of the given duty moves to once the work for this stage succeeds.
    pub fn on_success(&self, duty: NodeDuty) -> Self {
        match self {
            Self::Unprovisioned => Self::VmReady,
            Self::VmReady => Self::ConfigApplied,
            Self::ConfigApplied if duty.bootstraps() => Self::Bootstrapped,
            Self::ConfigApplied => Self::Ready,
            Self::Bootstrapped => Self::CredentialsIssued,
            Self::CredentialsIssued => Self::Ready,
            Self::Ready => Self::Ready,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum VmState {
    Provisioned,
    Absent,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConfigState {
    Applied,
    Pending,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BootstrapState {
    Done,
    NotApplicable,
    Pending,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CredentialState {
    Retrieved,
    NotApplicable,
    Pending,
}

/// The runtime view of a node, as reported after provisioning.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub vm: VmState,
    pub config: ConfigState,
    pub bootstrap: BootstrapState,
    pub credentials: CredentialState,
}

impl NodeState {
    pub fn new(duty: NodeDuty) -> Self {
        let (bootstrap, credentials) = if duty.bootstraps() {
            (BootstrapState::Pending, CredentialState::Pending)
        } else {
            (BootstrapState::NotApplicable, CredentialState::NotApplicable)
        };
        NodeState {
            vm: VmState::Absent,
            config: ConfigState::Pending,
            bootstrap,
            credentials,
        }
    }

    /// Records that a node has reached `stage`. `hypervisor` tells whether entering `VmReady` involved a VM.
    pub fn reached(self, stage: ProvisionStage, hypervisor: bool) -> Self {
        match stage {
            ProvisionStage::VmReady if hypervisor => NodeState {
                vm: VmState::Provisioned,
                ..self
            },
            ProvisionStage::ConfigApplied => NodeState {
                config: ConfigState::Applied,
                ..self
            },
            ProvisionStage::Bootstrapped => NodeState {
                bootstrap: BootstrapState::Done,
                ..self
            },
            ProvisionStage::CredentialsIssued => NodeState {
                credentials: CredentialState::Retrieved,
                ..self
            },
            _ => self,
        }
    }
}

/// What is remembered about a node between runs, so that completed steps are not repeated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub vm_id: Option<u32>,
    pub iso_file_id: Option<String>,
    /// Fingerprint of the non-secret generator inputs (patch, role, endpoint, versions) most recently applied.
    pub applied_config: Option<String>,
    #[serde(default)]
    pub bootstrapped: bool,
    pub kubeconfig: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}
