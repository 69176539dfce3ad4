//! Instance name derivation.
//!
//! The functions here form the single naming contract shared by the topology calculator, the
//! operation conflict checker and the progress tracker. They are pure and deterministic: the
//! same declared topology always yields the same ordered instance-name set.

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::InstanceTemplate;
use crate::error::{OpsError, OpsResult};

/// The template name recorded for instances generated from the anonymous default template.
pub const DEFAULT_TEMPLATE: &str = "";

/// Derive the active instance-name set implied by a declared component topology.
///
/// Returns a map of instance name to owning template name, ordered by name. Templates consume
/// their declared replica counts in declaration order; the default template receives the
/// remainder. Ordinals are assigned from 0 upward per template, skipping any name present in
/// the offline set — offline instances keep their names in bookkeeping but are excluded from
/// the active set.
pub fn instance_name_set(
    cluster: &str, component: &str, replicas: i32, templates: &[InstanceTemplate], offline_instances: &[String],
) -> OpsResult<BTreeMap<String, String>> {
    let mut seen = BTreeSet::new();
    for template in templates {
        if !seen.insert(template.name.as_str()) {
            return Err(OpsError::fatal(format!(
                r#"instance template "{}" is declared more than once for component "{}""#,
                template.name, component
            )));
        }
    }
    let templated: i32 = templates.iter().map(InstanceTemplate::replicas).sum();
    if templated > replicas {
        return Err(OpsError::fatal(format!(
            r#"the total number of replicas for the instance templates can not be greater than the number of replicas for component "{}""#,
            component
        )));
    }

    let offline: BTreeSet<&str> = offline_instances.iter().map(String::as_str).collect();
    let mut names = BTreeMap::new();
    for template in templates {
        let prefix = format!("{}-{}-{}", cluster, component, template.name);
        for name in generate_names(&prefix, template.replicas(), &offline) {
            names.insert(name, template.name.clone());
        }
    }
    let prefix = format!("{}-{}", cluster, component);
    for name in generate_names(&prefix, replicas - templated, &offline) {
        names.insert(name, DEFAULT_TEMPLATE.into());
    }
    Ok(names)
}

/// Resolve the template name which owns the given instance name.
///
/// Used for instances which are named explicitly in a request rather than generated, e.g. an
/// offline instance being brought back online.
pub fn template_of(cluster: &str, component: &str, templates: &[InstanceTemplate], instance: &str) -> String {
    let base = format!("{}-{}-", cluster, component);
    let suffix = match instance.strip_prefix(&base) {
        Some(suffix) => suffix,
        None => return DEFAULT_TEMPLATE.into(),
    };
    templates
        .iter()
        .find(|template| {
            suffix
                .strip_prefix(template.name.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
                .map(|ordinal| ordinal.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .map(|template| template.name.clone())
        .unwrap_or_else(|| DEFAULT_TEMPLATE.into())
}

/// Generate `count` ordinal-suffixed names under the given prefix, skipping offline names.
fn generate_names(prefix: &str, count: i32, offline: &BTreeSet<&str>) -> Vec<String> {
    let mut names = Vec::with_capacity(count.max(0) as usize);
    let mut ordinal = 0;
    while (names.len() as i32) < count {
        let name = format!("{}-{}", prefix, ordinal);
        ordinal += 1;
        if offline.contains(name.as_str()) {
            continue;
        }
        names.push(name);
    }
    names
}
