use installer::{Sample, SampleHelm};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [Sample::crd(), SampleHelm::crd()];
    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    for document in documents {
        print!("{}", document);
    }
    Ok(())
}
