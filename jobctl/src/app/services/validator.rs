// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::errors::{MalformedRole, ValidationError};
use crate::app::types::{FileBundle, roles};

type RoleCheck = fn(&str, &FileBundle) -> Result<(), String>;

/// Structural check for a role, if it has one. Roles without a check only
/// need to be present and non-empty.
fn role_check(role: &str) -> Option<RoleCheck> {
    match role {
        roles::PARAMETERS => Some(check_parameters),
        roles::STRUCTURE => Some(check_structure),
        roles::K_MESH => Some(check_k_mesh),
        roles::POTENTIALS => Some(check_potentials),
        _ => None,
    }
}

/// Validates the solver's required roles.
pub fn validate(bundle: &FileBundle) -> Result<(), ValidationError> {
    validate_roles(bundle, &roles::REQUIRED)
}

/// Checks presence and non-emptiness of `required`, then runs the
/// structural check of every role present in the bundle.
pub fn validate_roles(bundle: &FileBundle, required: &[&str]) -> Result<(), ValidationError> {
    let mut err = ValidationError::default();
    for role in required {
        match bundle.get(role) {
            None => err.missing_roles.push(role.to_string()),
            Some(entry) if entry.text().trim().is_empty() => {
                err.empty_roles.push(role.to_string())
            }
            Some(_) => {}
        }
    }
    for (role, entry) in bundle.iter() {
        let text = entry.text();
        if text.trim().is_empty() {
            if !required.contains(&role) {
                err.empty_roles.push(role.to_string());
            }
            continue;
        }
        let Some(check) = role_check(role) else {
            continue;
        };
        if let Err(reason) = check(&text, bundle) {
            err.malformed_roles.push(MalformedRole {
                role: role.to_string(),
                reason,
            });
        }
    }
    if err.is_empty() { Ok(()) } else { Err(err) }
}

/// Checks one role in the context of `bundle`.
pub fn validate_role(bundle: &FileBundle, role: &str) -> Result<(), ValidationError> {
    let mut err = ValidationError::default();
    match bundle.get(role) {
        None => err.missing_roles.push(role.to_string()),
        Some(entry) if entry.text().trim().is_empty() => err.empty_roles.push(role.to_string()),
        Some(entry) => {
            if let Some(check) = role_check(role) {
                if let Err(reason) = check(&entry.text(), bundle) {
                    err.malformed_roles.push(MalformedRole {
                        role: role.to_string(),
                        reason,
                    });
                }
            }
        }
    }
    if err.is_empty() { Ok(()) } else { Err(err) }
}

fn strip_comment(line: &str) -> &str {
    let end = line.find(['#', '!']).unwrap_or(line.len());
    &line[..end]
}

fn check_parameters(text: &str, _bundle: &FileBundle) -> Result<(), String> {
    let has_assignment = text.lines().any(|line| {
        strip_comment(line).split(';').any(|stmt| {
            let Some((key, value)) = stmt.split_once('=') else {
                return false;
            };
            let key = key.trim();
            let mut chars = key.chars();
            let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
            starts_alpha
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !value.trim().is_empty()
        })
    });
    if has_assignment {
        Ok(())
    } else {
        Err("no KEY = VALUE line".to_string())
    }
}

fn parse_floats(line: &str, n: usize) -> Option<Vec<f64>> {
    let values: Vec<f64> = line
        .split_whitespace()
        .take(n)
        .map(|tok| tok.parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    (values.len() == n).then_some(values)
}

/// Element symbols listed in a structure file. Empty for the older layout
/// without a species line.
pub fn structure_elements(text: &str) -> Result<Vec<String>, String> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 7 {
        return Err(format!("expected at least 7 lines, found {}", lines.len()));
    }
    if parse_floats(lines[1], 1).is_none() {
        return Err("line 2 is not a scaling factor".to_string());
    }
    for (idx, line) in lines[2..5].iter().enumerate() {
        if parse_floats(line, 3).is_none() {
            return Err(format!("lattice vector {} is not three numbers", idx + 1));
        }
    }
    let species_line: Vec<&str> = lines[5].split_whitespace().collect();
    if species_line.is_empty() {
        return Err("line 6 is empty".to_string());
    }
    let has_symbols = species_line
        .iter()
        .all(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_alphabetic()));
    let (elements, counts_line) = if has_symbols {
        let elements = species_line
            .iter()
            .map(|tok| element_symbol(tok).to_string())
            .collect::<Vec<_>>();
        (elements, lines[6])
    } else {
        (Vec::new(), lines[5])
    };
    let counts = counts_line
        .split_whitespace()
        .map(|tok| tok.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| "atom counts are not integers".to_string())?;
    if counts.is_empty() || counts.iter().all(|c| *c == 0) {
        return Err("no atoms".to_string());
    }
    if has_symbols && counts.len() != elements.len() {
        return Err(format!(
            "{} species but {} atom counts",
            elements.len(),
            counts.len()
        ));
    }
    Ok(elements)
}

/// `Fe_pv` and `Fe/` both name iron.
fn element_symbol(label: &str) -> &str {
    label
        .split(['_', '/', '.'])
        .next()
        .unwrap_or(label)
        .trim()
}

fn check_structure(text: &str, _bundle: &FileBundle) -> Result<(), String> {
    structure_elements(text).map(|_| ())
}

fn check_k_mesh(text: &str, _bundle: &FileBundle) -> Result<(), String> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    if lines.len() < 3 {
        return Err("expected at least 3 lines".to_string());
    }
    let count = lines[1]
        .split_whitespace()
        .next()
        .and_then(|tok| tok.parse::<i64>().ok())
        .ok_or_else(|| "line 2 is not a k-point count".to_string())?;
    if count < 0 {
        return Err("negative k-point count".to_string());
    }
    let mode = lines[2]
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .ok_or_else(|| "line 3 is empty".to_string())?;
    match mode {
        'G' | 'M' if count == 0 => {
            let grid = lines
                .get(3)
                .and_then(|line| parse_floats(line, 3))
                .ok_or_else(|| "automatic mesh needs three subdivisions on line 4".to_string())?;
            if grid.iter().any(|v| *v < 1.0 || v.fract() != 0.0) {
                return Err("mesh subdivisions must be positive integers".to_string());
            }
            Ok(())
        }
        'L' if count == 0 => Err("line mode needs a positive division count".to_string()),
        'A' | 'L' | 'C' | 'K' | 'R' | 'G' | 'M' => Ok(()),
        other => Err(format!("unknown k-point mode {other:?}")),
    }
}

/// A potential record: the element it describes and whether it carries
/// both the title and the end-of-dataset marker.
struct PotentialRecord {
    element: String,
    complete: bool,
}

fn potential_records(text: &str) -> Vec<PotentialRecord> {
    let mut records: Vec<PotentialRecord> = Vec::new();
    let mut current: Option<(String, bool)> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some((element, has_title)) = current.as_mut() {
            if trimmed.starts_with("TITEL") {
                *has_title = true;
            } else if trimmed.starts_with("End of Dataset") {
                records.push(PotentialRecord {
                    element: element.clone(),
                    complete: *has_title,
                });
                current = None;
            }
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        let (Some(kind), Some(label)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        if kind.starts_with("PAW") || kind == "US" {
            current = Some((element_symbol(label).to_string(), false));
        }
    }
    if let Some((element, _)) = current {
        records.push(PotentialRecord {
            element,
            complete: false,
        });
    }
    records
}

fn check_potentials(text: &str, bundle: &FileBundle) -> Result<(), String> {
    let records = potential_records(text);
    if records.is_empty() {
        return Err("no potential records".to_string());
    }
    if let Some(broken) = records.iter().find(|r| !r.complete) {
        return Err(format!("record for {} is truncated", broken.element));
    }
    let elements = bundle
        .get(roles::STRUCTURE)
        .and_then(|entry| structure_elements(&entry.text()).ok())
        .unwrap_or_default();
    if elements.is_empty() {
        return Ok(());
    }
    for element in &elements {
        if !records.iter().any(|r| &r.element == element) {
            return Err(format!("no complete record for {element}"));
        }
    }
    let order: Vec<&str> = records.iter().map(|r| r.element.as_str()).collect();
    if order != elements.iter().map(String::as_str).collect::<Vec<_>>() {
        return Err(format!(
            "record order {:?} does not match structure species {:?}",
            order, elements
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::app::types::{FileBundle, FileEntry, roles};

    pub const INCAR: &str = "SYSTEM = Si\nENCUT = 520\nISMEAR = 0 ! Gaussian\n";
    pub const POSCAR: &str = "Si2\n1.0\n5.43 0.0 0.0\n0.0 5.43 0.0\n0.0 0.0 5.43\nSi\n2\nDirect\n0.0 0.0 0.0\n0.25 0.25 0.25\n";
    pub const KPOINTS: &str = "Automatic mesh\n0\nGamma\n 6 6 6\n 0 0 0\n";
    pub const POTCAR: &str = "  PAW_PBE Si 05Jan2001\n 4.00000000000000\n parameters from PSCTR are:\n   TITEL  = PAW_PBE Si 05Jan2001\n End of Dataset\n";

    pub fn complete_bundle() -> FileBundle {
        let mut bundle = FileBundle::new();
        bundle.insert(roles::PARAMETERS, FileEntry::new("INCAR", INCAR));
        bundle.insert(roles::STRUCTURE, FileEntry::new("POSCAR", POSCAR));
        bundle.insert(roles::K_MESH, FileEntry::new("KPOINTS", KPOINTS));
        bundle.insert(roles::POTENTIALS, FileEntry::new("POTCAR", POTCAR));
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::app::types::FileEntry;

    #[test]
    fn complete_bundle_is_valid() {
        assert_eq!(validate(&complete_bundle()), Ok(()));
    }

    #[test]
    fn removing_any_required_role_names_it() {
        for role in roles::REQUIRED {
            let mut bundle = FileBundle::new();
            for (name, entry) in complete_bundle().iter() {
                if name != role {
                    bundle.insert(name, entry.clone());
                }
            }
            let err = validate(&bundle).unwrap_err();
            assert_eq!(err.missing_roles, vec![role.to_string()], "role {role}");
        }
    }

    #[test]
    fn whitespace_only_role_is_empty_not_missing() {
        let bundle =
            complete_bundle().with_role(roles::K_MESH, FileEntry::new("KPOINTS", " \n\n"));
        let err = validate(&bundle).unwrap_err();
        assert!(err.missing_roles.is_empty());
        assert_eq!(err.empty_roles, vec!["k-mesh".to_string()]);
    }

    #[test]
    fn parameters_need_an_assignment() {
        let bundle = complete_bundle().with_role(
            roles::PARAMETERS,
            FileEntry::new("INCAR", "# only a comment\nENCUT\n= 3\n"),
        );
        let err = validate(&bundle).unwrap_err();
        assert_eq!(err.malformed_roles[0].role, "parameters");
    }

    #[test]
    fn potentials_need_a_record_per_element() {
        let poscar = "FeO\n1.0\n4.0 0 0\n0 4.0 0\n0 0 4.0\nFe O\n1 1\nDirect\n0 0 0\n0.5 0.5 0.5\n";
        let bundle = complete_bundle()
            .with_role(roles::STRUCTURE, FileEntry::new("POSCAR", poscar))
            .with_role(
                roles::POTENTIALS,
                FileEntry::new(
                    "POTCAR",
                    "PAW_PBE Fe_pv 06Sep2000\n TITEL = PAW_PBE Fe_pv\n End of Dataset\n",
                ),
            );
        let err = validate(&bundle).unwrap_err();
        assert_eq!(err.malformed_roles.len(), 1);
        assert!(err.malformed_roles[0].reason.contains("no complete record for O"));
    }

    #[test]
    fn truncated_potential_record_is_malformed() {
        let bundle = complete_bundle().with_role(
            roles::POTENTIALS,
            FileEntry::new("POTCAR", "PAW_PBE Si 05Jan2001\n TITEL = PAW_PBE Si\n"),
        );
        let err = validate(&bundle).unwrap_err();
        assert!(err.malformed_roles[0].reason.contains("truncated"));
    }

    #[test]
    fn potential_order_must_follow_structure() {
        let poscar = "FeO\n1.0\n4.0 0 0\n0 4.0 0\n0 0 4.0\nFe O\n1 1\nDirect\n0 0 0\n0.5 0.5 0.5\n";
        let potcar = "PAW_PBE O 08Apr2002\n TITEL = O\n End of Dataset\nPAW_PBE Fe 06Sep2000\n TITEL = Fe\n End of Dataset\n";
        let bundle = complete_bundle()
            .with_role(roles::STRUCTURE, FileEntry::new("POSCAR", poscar))
            .with_role(roles::POTENTIALS, FileEntry::new("POTCAR", potcar));
        let err = validate(&bundle).unwrap_err();
        assert!(err.malformed_roles[0].reason.contains("order"));
    }

    #[test]
    fn structure_without_species_line_is_accepted() {
        let poscar = "Si2\n1.0\n5.43 0 0\n0 5.43 0\n0 0 5.43\n2\nDirect\n0 0 0\n0.25 0.25 0.25\n";
        assert_eq!(structure_elements(poscar), Ok(Vec::new()));
        let bundle =
            complete_bundle().with_role(roles::STRUCTURE, FileEntry::new("POSCAR", poscar));
        assert_eq!(validate(&bundle), Ok(()));
    }

    #[test]
    fn k_mesh_checks_automatic_grid() {
        let bundle = complete_bundle().with_role(
            roles::K_MESH,
            FileEntry::new("KPOINTS", "Automatic mesh\n0\nMonkhorst-Pack\n4 0 4\n"),
        );
        let err = validate(&bundle).unwrap_err();
        assert_eq!(err.malformed_roles[0].role, "k-mesh");

        let line_mode = "k-path\n20\nLine-mode\nreciprocal\n0 0 0 ! G\n0.5 0 0.5 ! X\n";
        let bundle =
            complete_bundle().with_role(roles::K_MESH, FileEntry::new("KPOINTS", line_mode));
        assert_eq!(validate(&bundle), Ok(()));
    }

    #[test]
    fn validation_is_repeatable() {
        let bundle =
            complete_bundle().with_role(roles::POTENTIALS, FileEntry::new("POTCAR", "junk"));
        assert_eq!(validate(&bundle), validate(&bundle));
    }
}
