//! Kubernetes CNI args (`K8S_POD_NAMESPACE=..;K8S_POD_NAME=..`).

use std::str::FromStr;

use crate::error::ProtocolError;

/// Pod identity passed by the container runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeArgs {
    /// `K8S_POD_NAMESPACE`
    pub pod_namespace: String,
    /// `K8S_POD_NAME`
    pub pod_name: String,
    /// `K8S_POD_UID`
    pub pod_uid: Option<String>,
    /// `K8S_POD_INFRA_CONTAINER_ID`
    pub infra_container_id: Option<String>,
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true")
}

impl FromStr for KubeArgs {
    type Err = ProtocolError;

    fn from_str(args: &str) -> Result<Self, Self::Err> {
        let mut pairs = Vec::new();
        for pair in args.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ProtocolError::MalformedArgs(format!("{pair:?} is not KEY=VALUE")))?;
            pairs.push((key.trim(), value.trim()));
        }

        let ignore_unknown = pairs
            .iter()
            .any(|(k, v)| *k == "IgnoreUnknown" && is_truthy(v));

        let mut parsed = KubeArgs::default();
        for (key, value) in pairs {
            match key {
                "K8S_POD_NAMESPACE" => parsed.pod_namespace = value.to_string(),
                "K8S_POD_NAME" => parsed.pod_name = value.to_string(),
                "K8S_POD_UID" => parsed.pod_uid = Some(value.to_string()),
                "K8S_POD_INFRA_CONTAINER_ID" => parsed.infra_container_id = Some(value.to_string()),
                "IgnoreUnknown" => {}
                _ if ignore_unknown => {}
                other => return Err(ProtocolError::UnknownArg(other.to_string())),
            }
        }

        if parsed.pod_namespace.is_empty() {
            return Err(ProtocolError::MissingArg("K8S_POD_NAMESPACE".to_string()));
        }
        if parsed.pod_name.is_empty() {
            return Err(ProtocolError::MissingArg("K8S_POD_NAME".to_string()));
        }
        Ok(parsed)
    }
}
