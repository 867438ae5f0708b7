//! Prints the VaultService CustomResourceDefinition as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crds/vaultservice.yaml`

use crds::VaultService;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crd = VaultService::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
