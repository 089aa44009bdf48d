//! CRD YAML Generator
//!
//! Prints the manifests for every custom resource the operator uses.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use pachyderm_backup_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
