//! Pod syncer configuration
//!
//! `PodSyncerConfig` is the raw, deserializable form handed over by whatever
//! bootstraps the process. `PodSyncerOptions::from_config` validates it once,
//! at construction time, so a malformed node selector fails the controller
//! start instead of every reconcile.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use serde::Deserialize;
use tracing::warn;
use twinsync_common::Error;

/// Default template for the per-tenant log root on the host
pub const DEFAULT_LOG_ROOT_TEMPLATE: &str = "/tmp/twinsync/{target_namespace}/{name}/log";

const TAINT_EFFECTS: &[&str] = &["NoSchedule", "PreferNoSchedule", "NoExecute"];

/// Raw syncer configuration
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSyncerConfig {
    /// Tenant name; falls back to `service_name` when empty
    pub name: String,
    /// Name of the tenant's control-plane service
    pub service_name: String,
    /// Host namespace the tenant's physical pods live in
    pub target_namespace: String,
    /// A scheduler runs inside the virtual cluster; only sync pods it has placed
    pub enable_scheduler: bool,
    /// Merge `node_selector` into every physical pod
    pub enforce_node_selector: bool,
    /// Label selector in `key=value,key2=value2` form
    pub node_selector: String,
    /// Tolerations in `key[=value][:Effect]` form
    pub tolerations: Vec<String>,
    /// Pod security standard to enforce (empty disables the check)
    pub enforce_pod_security_standard: String,
    /// Host log root, with `{target_namespace}` and `{name}` placeholders
    pub log_root_template: Option<String>,
}

/// Validated syncer options
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSyncerOptions {
    /// Host namespace the tenant's physical pods live in
    pub target_namespace: String,
    /// Only sync pods that already carry a node name
    pub enable_scheduler: bool,
    /// Labels merged into the node selector of unassigned pods
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Tolerations appended to every physical pod
    pub tolerations: Vec<Toleration>,
    /// Pod security standard to enforce
    pub pod_security_standard: Option<String>,
    /// Per-tenant host directory that replaces the node's log directory
    pub virtual_logs_path: String,
}

impl PodSyncerOptions {
    /// Validate and parse a raw config
    pub fn from_config(config: &PodSyncerConfig) -> Result<Self, Error> {
        let node_selector = if config.enforce_node_selector && !config.node_selector.is_empty() {
            Some(parse_node_selector(&config.node_selector)?)
        } else {
            None
        };

        let tolerations = config
            .tolerations
            .iter()
            .filter_map(|raw| match parse_toleration(raw) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(toleration = %raw, error = %e, "ignoring invalid toleration");
                    None
                }
            })
            .collect();

        let name = if config.name.is_empty() {
            &config.service_name
        } else {
            &config.name
        };
        let template = config
            .log_root_template
            .as_deref()
            .unwrap_or(DEFAULT_LOG_ROOT_TEMPLATE);

        Ok(Self {
            target_namespace: config.target_namespace.clone(),
            enable_scheduler: config.enable_scheduler,
            node_selector,
            tolerations,
            pod_security_standard: Some(config.enforce_pod_security_standard.clone())
                .filter(|s| !s.is_empty()),
            virtual_logs_path: render_log_root(template, &config.target_namespace, name),
        })
    }
}

fn render_log_root(template: &str, target_namespace: &str, name: &str) -> String {
    template
        .replace("{target_namespace}", target_namespace)
        .replace("{name}", name)
}

/// Parse a label selector that may only contain `key=value` requirements.
///
/// Set-based and inequality requirements are rejected, as is an empty
/// selector: enforcing "no labels" would be a silent no-op.
pub fn parse_node_selector(selector: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut labels = BTreeMap::new();

    for term in split_requirements(selector) {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        if is_expression(term) {
            return Err(Error::validation_for_field(
                "nodeSelector",
                "match expressions in the node selector are not supported",
            ));
        }

        let (key, value) = term
            .split_once("==")
            .or_else(|| term.split_once('='))
            .ok_or_else(|| {
                Error::validation_for_field(
                    "nodeSelector",
                    format!("parse node selector: invalid requirement '{}'", term),
                )
            })?;
        let (key, value) = (key.trim(), value.trim());
        if !is_label_token(key, true) || !is_label_token(value, false) {
            return Err(Error::validation_for_field(
                "nodeSelector",
                format!("parse node selector: invalid requirement '{}'", term),
            ));
        }
        labels.insert(key.to_string(), value.to_string());
    }

    if labels.is_empty() {
        return Err(Error::validation_for_field(
            "nodeSelector",
            "at least one label=value pair has to be defined in the label selector",
        ));
    }
    Ok(labels)
}

/// Split on commas that are not inside a `(...)` value set
fn split_requirements(selector: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&selector[start..]);
    parts
}

fn is_expression(term: &str) -> bool {
    term.starts_with('!')
        || term.contains("!=")
        || term.contains(" in ")
        || term.contains(" notin ")
        || !term.contains('=')
}

fn is_label_token(token: &str, required: bool) -> bool {
    if token.is_empty() {
        return !required;
    }
    token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

/// Parse a toleration in `key[=value][:Effect]` form.
///
/// A value selects the `Equal` operator, no value selects `Exists`.
/// An omitted effect tolerates every effect.
pub fn parse_toleration(raw: &str) -> Result<Toleration, Error> {
    let (spec, effect) = match raw.rsplit_once(':') {
        Some((spec, effect)) => (spec, Some(effect.trim())),
        None => (raw, None),
    };

    if let Some(effect) = effect {
        if !TAINT_EFFECTS.contains(&effect) {
            return Err(Error::validation_for_field(
                "tolerations",
                format!("unsupported taint effect '{}' in '{}'", effect, raw),
            ));
        }
    }

    let (key, value) = match spec.split_once('=') {
        Some((key, value)) => (key.trim(), Some(value.trim())),
        None => (spec.trim(), None),
    };
    if !is_label_token(key, true) || !value.map(|v| is_label_token(v, false)).unwrap_or(true) {
        return Err(Error::validation_for_field(
            "tolerations",
            format!("invalid toleration '{}'", raw),
        ));
    }

    Ok(Toleration {
        key: Some(key.to_string()),
        operator: Some(if value.is_some() { "Equal" } else { "Exists" }.to_string()),
        value: value.map(str::to_string),
        effect: effect.map(str::to_string),
        toleration_seconds: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PodSyncerConfig {
        PodSyncerConfig {
            service_name: "tenant-a".to_string(),
            target_namespace: "host-ns".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn node_selector_accepts_equality_pairs() {
        let labels = parse_node_selector("pool=tenants, zone==eu-1").unwrap();
        assert_eq!(labels.get("pool").map(String::as_str), Some("tenants"));
        assert_eq!(labels.get("zone").map(String::as_str), Some("eu-1"));
    }

    #[test]
    fn node_selector_rejects_expressions() {
        for selector in ["pool!=x", "zone in (a,b)", "!gpu", "gpu", "a=b,zone notin (c)"] {
            let err = parse_node_selector(selector).unwrap_err();
            assert!(
                err.to_string().contains("not supported"),
                "{} -> {}",
                selector,
                err
            );
        }
    }

    #[test]
    fn node_selector_requires_at_least_one_pair() {
        let err = parse_node_selector(" , ").unwrap_err();
        assert!(err.to_string().contains("at least one label=value pair"));
    }

    #[test]
    fn node_selector_rejects_malformed_pairs() {
        assert!(parse_node_selector("=value").is_err());
        assert!(parse_node_selector("bad key=value").is_err());
    }

    #[test]
    fn toleration_forms() {
        let t = parse_toleration("dedicated=tenants:NoSchedule").unwrap();
        assert_eq!(t.key.as_deref(), Some("dedicated"));
        assert_eq!(t.operator.as_deref(), Some("Equal"));
        assert_eq!(t.value.as_deref(), Some("tenants"));
        assert_eq!(t.effect.as_deref(), Some("NoSchedule"));

        let t = parse_toleration("gpu:NoExecute").unwrap();
        assert_eq!(t.operator.as_deref(), Some("Exists"));
        assert_eq!(t.value, None);

        let t = parse_toleration("spot").unwrap();
        assert_eq!(t.effect, None);

        assert!(parse_toleration("gpu:Sometimes").is_err());
        assert!(parse_toleration(":NoSchedule").is_err());
    }

    #[test]
    fn options_skip_invalid_tolerations() {
        let mut cfg = config();
        cfg.tolerations = vec!["a=b:NoSchedule".to_string(), "broken:Never".to_string()];
        let opts = PodSyncerOptions::from_config(&cfg).unwrap();
        assert_eq!(opts.tolerations.len(), 1);
    }

    #[test]
    fn options_only_parse_selector_when_enforced() {
        let mut cfg = config();
        cfg.node_selector = "pool!=x".to_string();
        assert_eq!(PodSyncerOptions::from_config(&cfg).unwrap().node_selector, None);

        cfg.enforce_node_selector = true;
        assert!(PodSyncerOptions::from_config(&cfg).is_err());

        cfg.node_selector = "pool=tenants".to_string();
        let opts = PodSyncerOptions::from_config(&cfg).unwrap();
        assert_eq!(opts.node_selector.unwrap().len(), 1);
    }

    #[test]
    fn log_root_falls_back_to_service_name() {
        let opts = PodSyncerOptions::from_config(&config()).unwrap();
        assert_eq!(opts.virtual_logs_path, "/tmp/twinsync/host-ns/tenant-a/log");

        let mut cfg = config();
        cfg.name = "alpha".to_string();
        cfg.log_root_template = Some("/logs/{name}".to_string());
        let opts = PodSyncerOptions::from_config(&cfg).unwrap();
        assert_eq!(opts.virtual_logs_path, "/logs/alpha");
    }

    #[test]
    fn service_name_only_shapes_the_log_root() {
        let opts = PodSyncerOptions::from_config(&config()).unwrap();
        assert_eq!(
            opts,
            PodSyncerOptions {
                target_namespace: "host-ns".to_string(),
                virtual_logs_path: "/tmp/twinsync/host-ns/tenant-a/log".to_string(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn empty_security_standard_disables_check() {
        let opts = PodSyncerOptions::from_config(&config()).unwrap();
        assert_eq!(opts.pod_security_standard, None);

        let mut cfg = config();
        cfg.enforce_pod_security_standard = "baseline".to_string();
        let opts = PodSyncerOptions::from_config(&cfg).unwrap();
        assert_eq!(opts.pod_security_standard.as_deref(), Some("baseline"));
    }

    #[test]
    fn config_deserializes_from_camel_case() {
        let cfg: PodSyncerConfig = serde_json::from_value(serde_json::json!({
            "serviceName": "tenant-a",
            "enableScheduler": true,
            "tolerations": ["a:NoSchedule"],
        }))
        .unwrap();
        assert!(cfg.enable_scheduler);
        assert_eq!(cfg.tolerations.len(), 1);
        assert!(!cfg.enforce_node_selector);
    }
}
