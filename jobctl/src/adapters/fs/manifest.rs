// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Job manifests: one TOML file per job, naming its input files, resources
//! and the parameters used to regenerate inputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::app::types::{
    FileBundle, FileEntry, JobSpec, ResourceRequest, SolverParams, parse_wall_clock, roles,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    name: String,
    resources: ManifestResources,
    #[serde(default)]
    files: BTreeMap<String, ManifestFileRef>,
    #[serde(default)]
    params: SolverParams,
    checkpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestResources {
    nodes: u32,
    tasks_per_node: u32,
    wall_clock: String,
    partition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFileRef {
    Path(String),
    Detailed {
        path: String,
        file_name: Option<String>,
    },
}

impl ManifestFileRef {
    fn parts(&self) -> (&str, Option<&str>) {
        match self {
            ManifestFileRef::Path(path) => (path, None),
            ManifestFileRef::Detailed { path, file_name } => (path, file_name.as_deref()),
        }
    }
}

fn resolve(base: &Path, raw: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(raw).into_owned());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn remote_file_name(role: &str, path: &Path, explicit: Option<&str>) -> Result<String> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    if let Some(name) = roles::default_file_name(role) {
        return Ok(name.to_string());
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("cannot derive a file name for role {role}"))
}

/// Reads a manifest and every input file it names. Relative paths are
/// resolved against the manifest's directory.
pub async fn load_manifest(path: &Path) -> Result<JobSpec> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest: ManifestFile = toml::from_str(&raw)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let name = manifest.name.trim().to_string();
    if name.is_empty() {
        bail!("manifest {} has an empty job name", path.display());
    }

    let wall_clock = parse_wall_clock(&manifest.resources.wall_clock)
        .map_err(|err| anyhow!("invalid wall_clock in {}: {err}", path.display()))?;
    let resources = ResourceRequest {
        nodes: manifest.resources.nodes,
        tasks_per_node: manifest.resources.tasks_per_node,
        wall_clock,
        partition: manifest.resources.partition,
    };

    let mut bundle = FileBundle::new();
    for (role, file_ref) in &manifest.files {
        let (raw_path, explicit_name) = file_ref.parts();
        let local = resolve(base, raw_path);
        let content = tokio::fs::read(&local)
            .await
            .with_context(|| format!("failed to read {role} input {}", local.display()))?;
        let file_name = remote_file_name(role, &local, explicit_name)?;
        tracing::debug!(
            role = %role,
            file = %local.display(),
            bytes = content.len(),
            "loaded input"
        );
        bundle.insert(role.clone(), FileEntry::new(file_name, content));
    }

    Ok(JobSpec {
        name,
        bundle,
        resources,
        params: manifest.params,
        checkpoint: manifest.checkpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::KMesh;
    use std::time::Duration;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn loads_files_resources_and_params() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "INCAR", "ENCUT = 520\n");
        write(dir.path(), "si.vasp", "Si\n1.0\n");
        write(dir.path(), "extra.dat", "1 2 3\n");
        write(
            dir.path(),
            "si.toml",
            r#"
name = "si-relax"
checkpoint = "/scratch/alice/si-old/CONTCAR"

[resources]
nodes = 2
tasks_per_node = 32
wall_clock = "1-02:00:00"
partition = "standard"

[files]
parameters = "INCAR"
structure = "si.vasp"
notes = { path = "extra.dat", file_name = "NOTES" }

[params.parameters]
ENCUT = "520"

[params.k_mesh]
mode = "gamma"
grid = [4, 4, 4]
"#,
        );

        let spec = load_manifest(&dir.path().join("si.toml")).await.unwrap();
        assert_eq!(spec.name, "si-relax");
        assert_eq!((spec.resources.nodes, spec.resources.tasks_per_node), (2, 32));
        assert_eq!(spec.resources.wall_clock, Duration::from_secs(26 * 3600));
        assert_eq!(spec.checkpoint.as_deref(), Some("/scratch/alice/si-old/CONTCAR"));
        assert_eq!(spec.bundle.get(roles::STRUCTURE).unwrap().file_name, "POSCAR");
        assert_eq!(spec.bundle.get("notes").unwrap().file_name, "NOTES");
        assert_eq!(spec.params.parameters["ENCUT"], "520");
        assert!(matches!(spec.params.k_mesh, Some(KMesh::Gamma { grid: [4, 4, 4], .. })));
    }

    #[tokio::test]
    async fn missing_input_file_names_the_role() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "job.toml",
            r#"
name = "si"
[resources]
nodes = 1
tasks_per_node = 4
wall_clock = "00:30:00"
[files]
potentials = "POTCAR"
"#,
        );
        let err = load_manifest(&dir.path().join("job.toml")).await.unwrap_err();
        assert!(format!("{err:#}").contains("potentials"));
    }

    #[tokio::test]
    async fn bad_wall_clock_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "job.toml",
            r#"
name = "si"
[resources]
nodes = 1
tasks_per_node = 4
wall_clock = "soon"
"#,
        );
        let err = load_manifest(&dir.path().join("job.toml")).await.unwrap_err();
        assert!(err.to_string().contains("wall_clock"));
    }

    #[tokio::test]
    async fn bundled_demo_manifest_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/si-relax/job.toml");
        let spec = load_manifest(&path).await.unwrap();
        assert_eq!(spec.name, "si-relax");
        crate::app::services::validator::validate(&spec.bundle).unwrap();
    }
}
