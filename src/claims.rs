//! Workload claims and deploy requests decoded upstream of the manager.
//!
//! The manager stores these values but never verifies signatures or issuer
//! allow-listing itself; that happens in the out-of-scope control-plane decoder.

use serde::{Deserialize, Serialize};

/// Signed assertions about a workload, decoded upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadClaims {
    /// Workload name (the signed subject).
    pub subject: String,
    /// Issuer that signed the claims.
    pub issuer: String,
    /// Content hash of the workload artifact.
    pub hash: String,
    /// Declared workload type (e.g. "v8", "wasm", "oci").
    pub workload_type: String,
    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Optional encryption recipient for sealed workload payloads.
    #[serde(default)]
    pub encrypted_for: Option<String>,
}

/// A validated deploy request bound to a warm VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Tenant namespace the workload is deployed under.
    pub namespace: String,
    /// Decoded, upstream-verified claims.
    pub claims: WorkloadClaims,
    /// Total size of the workload artifact in bytes.
    pub total_bytes: u64,
    /// External subjects that should be forwarded to the workload as triggers.
    #[serde(default)]
    pub trigger_subjects: Vec<String>,
    /// Opaque workload payload (executable bytes or a reference to them).
    pub payload: Vec<u8>,
}

impl DeployRequest {
    pub fn workload_type(&self) -> &str {
        &self.claims.workload_type
    }

    pub fn workload_name(&self) -> &str {
        &self.claims.subject
    }

    pub fn wants_triggers(&self) -> bool {
        !self.trigger_subjects.is_empty()
    }
}

/// Canonical encoding of a deploy request sent to the guest agent over the
/// internal bus (§6, `agentint.<vmid>.deploy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployEnvelope {
    pub namespace: String,
    pub workload_name: String,
    pub workload_type: String,
    pub hash: String,
    pub payload: Vec<u8>,
}

impl From<&DeployRequest> for DeployEnvelope {
    fn from(req: &DeployRequest) -> Self {
        Self {
            namespace: req.namespace.clone(),
            workload_name: req.workload_name().to_string(),
            workload_type: req.workload_type().to_string(),
            hash: req.claims.hash.clone(),
            payload: req.payload.clone(),
        }
    }
}

/// Reply the guest agent sends for a deploy request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReply {
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}
