//! Generates yaml CRD resources from rust code.
//! By default this will target the helm chart's `crds` directory!
//! Designed to be used inside of a mise command that sets the `CRDS_DIR` environment variable.
use std::{fs::File, io::Write, path};

use chartkeeper_crd::ChartRelease;
use kube::CustomResourceExt;

#[allow(clippy::unwrap_used)]
fn main() {
    let schema = serde_yaml::to_string(&ChartRelease::crd()).unwrap();
    let crd_path = path::Path::new(&std::env::var_os("CRDS_DIR").unwrap())
        .join("chartrelease-crd.yaml");
    let mut file = File::create(crd_path).unwrap();
    file.write_all(schema.as_bytes()).unwrap();
}
