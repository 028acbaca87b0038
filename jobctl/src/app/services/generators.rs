// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::app::errors::GenerateError;
use crate::app::services::validator::validate_role;
use crate::app::types::{FileBundle, FileEntry, KMesh, SolverParams, roles};

pub type Generator = fn(&SolverParams) -> Result<String, GenerateError>;

/// Keys written first, in this order, when rendering a parameter file.
const PARAMETER_ORDER: &[&str] = &[
    "SYSTEM", "ISTART", "ICHARG", "PREC", "ENCUT", "EDIFF", "EDIFFG", "ALGO", "NELM", "ISMEAR",
    "SIGMA", "ISPIN", "MAGMOM", "IBRION", "NSW", "ISIF", "POTIM", "LREAL", "LWAVE", "LCHARG",
    "LORBIT", "NEDOS", "NPAR", "KPAR",
];

/// Role to generator mapping used when a support file has to be rebuilt.
#[derive(Clone)]
pub struct RoleGenerators {
    generators: HashMap<&'static str, Generator>,
}

impl Default for RoleGenerators {
    fn default() -> Self {
        let mut generators: HashMap<&'static str, Generator> = HashMap::new();
        generators.insert(roles::PARAMETERS, generate_parameters);
        generators.insert(roles::K_MESH, generate_k_mesh);
        Self { generators }
    }
}

impl RoleGenerators {
    pub fn empty() -> Self {
        Self {
            generators: HashMap::new(),
        }
    }

    pub fn register(&mut self, role: &'static str, generator: Generator) {
        self.generators.insert(role, generator);
    }

    pub fn has(&self, role: &str) -> bool {
        self.generators.contains_key(role)
    }

    pub fn generate(&self, role: &str, params: &SolverParams) -> Result<String, GenerateError> {
        let generator = self
            .generators
            .get(role)
            .ok_or_else(|| GenerateError::NoGenerator(role.to_string()))?;
        generator(params)
    }

    /// Generates `role` into `bundle` and checks the result with the same
    /// rules as hand-written input.
    pub fn regenerate_into(
        &self,
        bundle: &FileBundle,
        role: &str,
        params: &SolverParams,
    ) -> Result<FileEntry, GenerateError> {
        let content = self.generate(role, params)?;
        let file_name = bundle
            .get(role)
            .map(|entry| entry.file_name.clone())
            .or_else(|| roles::default_file_name(role).map(str::to_string))
            .unwrap_or_else(|| role.to_string());
        let entry = FileEntry::new(file_name, content);
        let candidate = bundle.with_role(role, entry.clone());
        validate_role(&candidate, role).map_err(|source| GenerateError::Invalid {
            role: role.to_string(),
            source,
        })?;
        Ok(entry)
    }
}

pub fn generate_parameters(params: &SolverParams) -> Result<String, GenerateError> {
    if params.parameters.is_empty() {
        return Err(GenerateError::MissingParams {
            role: roles::PARAMETERS.to_string(),
            detail: "parameter mapping is empty".to_string(),
        });
    }
    let mut out = String::new();
    let normalized: Vec<(String, &String)> = params
        .parameters
        .iter()
        .map(|(key, value)| (key.trim().to_ascii_uppercase(), value))
        .collect();
    for key in PARAMETER_ORDER {
        if let Some((_, value)) = normalized.iter().find(|(k, _)| k == key) {
            let _ = writeln!(out, "{key} = {}", value.trim());
        }
    }
    let mut rest: Vec<&(String, &String)> = normalized
        .iter()
        .filter(|(key, _)| !PARAMETER_ORDER.contains(&key.as_str()))
        .collect();
    rest.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in rest {
        let _ = writeln!(out, "{key} = {}", value.trim());
    }
    Ok(out)
}

pub fn generate_k_mesh(params: &SolverParams) -> Result<String, GenerateError> {
    let Some(mesh) = &params.k_mesh else {
        return Err(GenerateError::MissingParams {
            role: roles::K_MESH.to_string(),
            detail: "no k_mesh in parameters".to_string(),
        });
    };
    let content = match mesh {
        KMesh::Gamma { grid, shift } => automatic_mesh("Gamma", grid, shift),
        KMesh::MonkhorstPack { grid, shift } => automatic_mesh("Monkhorst-Pack", grid, shift),
        KMesh::LineMode { divisions, path } => {
            if *divisions == 0 || path.is_empty() {
                return Err(GenerateError::MissingParams {
                    role: roles::K_MESH.to_string(),
                    detail: "line mode needs divisions and at least one segment".to_string(),
                });
            }
            let mut out = format!("k-path\n{divisions}\nLine-mode\nReciprocal\n");
            for [start, end] in path {
                for point in [start, end] {
                    let [a, b, c] = point.coords;
                    let _ = writeln!(out, "{a:.6} {b:.6} {c:.6} ! {}", point.label);
                }
                out.push('\n');
            }
            out
        }
        KMesh::Explicit { content } => content.clone(),
    };
    Ok(content)
}

fn automatic_mesh(kind: &str, grid: &[u32; 3], shift: &[f64; 3]) -> String {
    format!(
        "Automatic mesh\n0\n{kind}\n {} {} {}\n {} {} {}\n",
        grid[0], grid[1], grid[2], shift[0], shift[1], shift[2]
    )
}
