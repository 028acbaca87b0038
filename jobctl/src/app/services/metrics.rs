// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

pub const FREE_ENERGY: &str = "free_energy_ev";
pub const FERMI_ENERGY: &str = "fermi_energy_ev";
pub const ELAPSED_TIME: &str = "elapsed_time_s";
pub const IONIC_STEPS: &str = "ionic_steps";

static TOTEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"free\s+energy\s+TOTEN\s*=\s*(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)")
        .unwrap_or_else(|err| panic!("invalid TOTEN pattern: {err}"))
});
static FERMI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"E-fermi\s*:\s*(-?\d+(?:\.\d+)?)")
        .unwrap_or_else(|err| panic!("invalid E-fermi pattern: {err}"))
});
static ELAPSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Elapsed time \(sec\):\s*(\d+(?:\.\d+)?)")
        .unwrap_or_else(|err| panic!("invalid elapsed time pattern: {err}"))
});

fn last_capture(pattern: &Regex, log: &str) -> Option<f64> {
    pattern
        .captures_iter(log)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .last()
}

/// Pulls the handful of numbers worth keeping from a primary log. Missing
/// values are left out rather than zeroed.
pub fn extract_metrics(log: &str) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    if let Some(energy) = last_capture(&TOTEN, log) {
        metrics.insert(FREE_ENERGY.to_string(), energy);
    }
    if let Some(fermi) = last_capture(&FERMI, log) {
        metrics.insert(FERMI_ENERGY.to_string(), fermi);
    }
    if let Some(elapsed) = last_capture(&ELAPSED, log) {
        metrics.insert(ELAPSED_TIME.to_string(), elapsed);
    }
    let steps = TOTEN.find_iter(log).count();
    if steps > 0 {
        metrics.insert(IONIC_STEPS.to_string(), steps as f64);
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
 E-fermi :   5.6120     XC(G=0): -11.1396     alpha+bet :-13.7285
  free  energy   TOTEN  =       -10.83421557 eV
 E-fermi :   5.7001     XC(G=0): -11.1396     alpha+bet :-13.7285
  free  energy   TOTEN  =       -10.84508710 eV
 General timing and accounting informations for this job:
                            Elapsed time (sec):       41.218
";

    #[test]
    fn keeps_last_values_and_counts_steps() {
        let metrics = extract_metrics(LOG);
        assert_eq!(metrics[FREE_ENERGY], -10.84508710);
        assert_eq!(metrics[FERMI_ENERGY], 5.7001);
        assert_eq!(metrics[ELAPSED_TIME], 41.218);
        assert_eq!(metrics[IONIC_STEPS], 2.0);
    }

    #[test]
    fn empty_log_has_no_metrics() {
        assert!(extract_metrics("running...\n").is_empty());
    }
}
