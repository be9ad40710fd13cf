//! Prints the CRD manifests for `ClusterIPPool` and `ClusterIP`.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/bases/ipam.yaml`

use crds::{ClusterIP, ClusterIPPool};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ClusterIPPool::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ClusterIP::crd())?);
    Ok(())
}
