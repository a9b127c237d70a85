//! Config-phase steps: runtime config edits, label edits, timestamp
//! rewrites, and build-arg history removal.

use oci_spec::image::{Arch, Config, Os};
use regex::Regex;

use crate::dag::ManifestNode;
use crate::digest::DigestAlgorithm;
use crate::error::{ModError, Result};
use crate::options::ConfigStep;

/// Apply one config step to a node's configuration, tracking the modified
/// flag. Nodes without a config (indexes, opaque artifacts) are skipped.
pub(crate) fn apply(node: &mut ManifestNode, step: &ConfigStep) -> Result<()> {
    let top = node.top;
    let platform = node.platform.clone();
    let Some(cfg) = node.config.as_mut() else {
        return Ok(());
    };
    let changed = match step {
        ConfigStep::Label {
            selector,
            key,
            value,
        } => {
            if !selector.matches(top, platform.as_ref()) {
                return Ok(());
            }
            set_label(&mut cfg.config, key, value.as_deref())
        }
        ConfigStep::Cmd(cmd) => {
            with_exec_config(&mut cfg.config, |ec| {
                ec.set_cmd(cmd.clone());
            })
        }
        ConfigStep::Entrypoint(entrypoint) => {
            with_exec_config(&mut cfg.config, |ec| {
                ec.set_entrypoint(entrypoint.clone());
            })
        }
        ConfigStep::ExposedPorts(ports) => {
            with_exec_config(&mut cfg.config, |ec| {
                ec.set_exposed_ports(ports.clone());
            })
        }
        ConfigStep::Volumes(volumes) => {
            with_exec_config(&mut cfg.config, |ec| {
                ec.set_volumes(volumes.clone());
            })
        }
        ConfigStep::Platform {
            os,
            architecture,
            variant,
        } => set_platform(&mut cfg.config, os, architecture, variant.as_deref())?,
        ConfigStep::Timestamp(spec) => {
            let labels = cfg
                .config
                .config()
                .as_ref()
                .and_then(|c| c.labels().clone());
            let resolved = spec.resolve(labels.as_ref())?;
            let mut changed = false;
            if let Some(created) = cfg.config.created().clone() {
                if let Some(new) = resolved.adjust_rfc3339(&created)? {
                    cfg.config.set_created(Some(new));
                    changed = true;
                }
            }
            let mut history = cfg.config.history().clone().unwrap_or_default();
            for entry in &mut history {
                if let Some(created) = entry.created().clone() {
                    if let Some(new) = resolved.adjust_rfc3339(&created)? {
                        entry.set_created(Some(new));
                        changed = true;
                    }
                }
            }
            if changed {
                cfg.config.set_history(Some(history));
            }
            changed
        }
        ConfigStep::BuildArgRm { name, value } => build_arg_rm(&mut cfg.config, name, value.as_ref()),
        ConfigStep::DigestAlgo(algo) => {
            DigestAlgorithm::from_digest(cfg.desc.digest())? != *algo
        }
    };
    if changed {
        cfg.modified = true;
    }
    Ok(())
}

/// Clone-patch-store round trip over the optional exec config, reporting
/// whether the document changed.
fn with_exec_config(
    config: &mut oci_spec::image::ImageConfiguration,
    patch: impl FnOnce(&mut Config),
) -> bool {
    let before = config.config().clone().unwrap_or_default();
    let mut after = before.clone();
    patch(&mut after);
    if after == before {
        return false;
    }
    config.set_config(Some(after));
    true
}

fn set_label(
    config: &mut oci_spec::image::ImageConfiguration,
    key: &str,
    value: Option<&str>,
) -> bool {
    with_exec_config(config, |ec| {
        let mut labels = ec.labels().clone().unwrap_or_default();
        match value {
            Some(v) => {
                labels.insert(key.to_string(), v.to_string());
            }
            None => {
                labels.remove(key);
            }
        }
        ec.set_labels((!labels.is_empty()).then_some(labels));
    })
}

fn set_platform(
    config: &mut oci_spec::image::ImageConfiguration,
    os: &str,
    architecture: &str,
    variant: Option<&str>,
) -> Result<bool> {
    let os: Os = serde_json::from_value(serde_json::Value::String(os.to_string()))
        .map_err(|_| ModError::invalid_input(format!("unknown os {os}")))?;
    let arch: Arch =
        serde_json::from_value(serde_json::Value::String(architecture.to_string()))
            .map_err(|_| ModError::invalid_input(format!("unknown architecture {architecture}")))?;
    let mut changed = false;
    if config.os() != &os {
        config.set_os(os);
        changed = true;
    }
    if config.architecture() != &arch {
        config.set_architecture(arch);
        changed = true;
    }
    let variant = variant.map(str::to_string);
    if config.variant() != &variant {
        config.set_variant(variant);
        changed = true;
    }
    Ok(changed)
}

/// Remove empty-layer `ARG` history entries for `name`, optionally
/// requiring the assigned value to match a pattern.
fn build_arg_rm(
    config: &mut oci_spec::image::ImageConfiguration,
    name: &str,
    value: Option<&Regex>,
) -> bool {
    let arg_re = Regex::new(&format!(
        r"^(?:/bin/sh -c #\(nop\)\s+)?ARG\s+{}(?:=(.*))?$",
        regex::escape(name)
    ))
    .expect("escaped literal pattern");
    let mut history = config.history().clone().unwrap_or_default();
    let before = history.len();
    history.retain(|entry| {
        if !entry.empty_layer().unwrap_or(false) {
            return true;
        }
        let Some(created_by) = entry.created_by() else {
            return true;
        };
        let Some(caps) = arg_re.captures(created_by) else {
            return true;
        };
        match value {
            Some(re) => {
                let assigned = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                !re.is_match(assigned)
            }
            None => false,
        }
    });
    if history.len() == before {
        return false;
    }
    config.set_history(Some(history));
    true
}
