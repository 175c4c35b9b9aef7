//! Permutation expander (C4): cross-products variants x iterations x
//! variable sets into concrete job descriptors, then renders job-script
//! templates. Pure function of its inputs — no scheduler or filesystem
//! access here.

pub mod legacy;

use crate::model::VariableSpec;
use std::collections::BTreeMap;

/// One named sub-configuration within a benchmark (a distinct job script).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Variant {
    pub name: String,
    pub jobscript_template: String,
    pub iterations: u32,
}

/// One concrete (variant, variable-binding, iteration) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    pub identificator: String,
    pub permutation_number: u64,
    pub iteration: u32,
    pub variant_name: String,
    pub binding: BTreeMap<String, String>,
    pub jobscript: String,
    pub user_jobscript: String,
}

/// Partitions `variables` into single-valued constants and multi-valued
/// axes, then computes the Cartesian product across the multi-valued axes
/// only. Each resulting tuple is merged with the constants into one
/// binding.
pub fn variable_bindings(variables: &[VariableSpec]) -> Vec<BTreeMap<String, String>> {
    let mut constants = BTreeMap::new();
    let mut axes: Vec<(&str, &[String])> = Vec::new();

    for variable in variables {
        if variable.selected.len() <= 1 {
            if let Some(value) = variable.selected.first() {
                constants.insert(variable.key.clone(), value.clone());
            }
        } else {
            axes.push((variable.key.as_str(), variable.selected.as_slice()));
        }
    }

    if axes.is_empty() {
        return vec![constants];
    }

    let mut bindings = vec![constants];
    for (key, values) in axes {
        let mut next = Vec::with_capacity(bindings.len() * values.len());
        for binding in &bindings {
            for value in values {
                let mut extended = binding.clone();
                extended.insert(key.to_string(), value.clone());
                next.push(extended);
            }
        }
        bindings = next;
    }
    bindings
}

/// Renders `template` by replacing every `#KEY#` placeholder with the
/// binding's value for `KEY`. List-valued substitutions are not needed here
/// (bindings are already scalar per-variable); callers pass comma-joined
/// strings for variables that keep multiple selections as one constant.
pub fn render_template(template: &str, binding: &BTreeMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in binding {
        rendered = rendered.replace(&format!("#{key}#"), value);
    }
    comment_out_empty_nodelist(&rendered)
}

/// An empty `--nodelist=` directive makes the scheduler reject the job, so
/// an unset nodelist placeholder is commented out instead of emitted blank.
fn comment_out_empty_nodelist(script: &str) -> String {
    script
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("#SBATCH --nodelist=") && trimmed.ends_with("--nodelist=") {
                format!("# {trimmed}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Real capture-start/stop emitters: appends epoch seconds to
/// `${jobId}.time.log` under the documented keys.
fn with_capture_emitters(template: &str) -> String {
    template
        .replace("#XBAT-START#", "echo \"captureStart=$(date +%s)\" >> ${jobId}.time.log")
        .replace("#XBAT-STOP#", "echo \"captureEnd=$(date +%s)\" >> ${jobId}.time.log")
}

/// User-visible variant: the same markers become comments instead of real
/// emitters.
fn with_comment_markers(template: &str) -> String {
    template
        .replace("#XBAT-START#", "# -- capture start --")
        .replace("#XBAT-STOP#", "# -- capture end --")
}

/// Expands `variants` x `variable_bindings(variables)` x `iterations` into
/// one permutation per tuple, in that nesting order, per the documented
/// algorithm.
pub fn expand(run_number: u64, variants: &[Variant], variables: &[VariableSpec]) -> Vec<Permutation> {
    let bindings = variable_bindings(variables);
    let mut permutations = Vec::new();
    let mut permutation_number = 0u64;

    for (variant_index, variant) in variants.iter().enumerate() {
        for binding in &bindings {
            for iteration in 0..variant.iterations {
                let identificator = format!("{run_number}-{variant_index}-{iteration}");
                let scheduler_template = with_capture_emitters(&variant.jobscript_template);
                let user_template = with_comment_markers(&variant.jobscript_template);

                permutations.push(Permutation {
                    identificator,
                    permutation_number,
                    iteration,
                    variant_name: variant.name.clone(),
                    binding: binding.clone(),
                    jobscript: render_template(&scheduler_template, binding),
                    user_jobscript: render_template(&user_template, binding),
                });
                permutation_number += 1;
            }
        }
    }

    permutations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str, values: &[&str]) -> VariableSpec {
        VariableSpec { key: key.to_string(), selected: values.iter().map(|s| s.to_string()).collect() }
    }

    #[test]
    fn single_valued_variables_become_constants() {
        let vars = vec![spec("N", &["1"])];
        let bindings = variable_bindings(&vars);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].get("N"), Some(&"1".to_string()));
    }

    #[test]
    fn multi_valued_variables_cartesian_product() {
        let vars = vec![spec("N", &["1", "2"]), spec("M", &["a", "b"])];
        let bindings = variable_bindings(&vars);
        assert_eq!(bindings.len(), 4);
    }

    #[test]
    fn happy_path_s1_emits_four_permutations() {
        let variants = vec![Variant {
            name: "baseline".to_string(),
            jobscript_template: "#SBATCH --nodelist=#NODES#\necho N=#N#".to_string(),
            iterations: 2,
        }];
        let variables = vec![spec("N", &["1", "2"])];

        let permutations = expand(7, &variants, &variables);
        assert_eq!(permutations.len(), 4);
        assert_eq!(permutations[0].identificator, "7-0-0");
        assert_eq!(permutations[1].identificator, "7-0-1");
    }

    #[test]
    fn empty_nodelist_directive_is_commented_out() {
        let template = "#SBATCH --nodelist=#NODELIST#\necho hi";
        let mut binding = BTreeMap::new();
        binding.insert("NODELIST".to_string(), String::new());
        let rendered = render_template(template, &binding);
        let first_line = rendered.lines().next().unwrap();
        assert!(first_line.trim_start().starts_with("# #SBATCH"));
        assert!(first_line.ends_with("--nodelist="));
    }

    #[test]
    fn capture_emitters_differ_between_scheduler_and_user_script() {
        let template = "#XBAT-START#\nwork\n#XBAT-STOP#";
        let scheduler = with_capture_emitters(template);
        let user = with_comment_markers(template);
        assert!(scheduler.contains(".time.log"));
        assert!(!user.contains(".time.log"));
    }
}
