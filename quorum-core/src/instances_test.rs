use crate::crd::InstanceTemplate;
use crate::instances;

fn template(name: &str, replicas: i32) -> InstanceTemplate {
    InstanceTemplate { name: name.into(), replicas: Some(replicas) }
}

#[test]
fn test_default_template_naming() {
    let names = instances::instance_name_set("mydb", "shard", 3, &[], &[]).expect("expected name derivation to succeed");
    let expected: Vec<&str> = vec!["mydb-shard-0", "mydb-shard-1", "mydb-shard-2"];
    assert_eq!(names.keys().map(String::as_str).collect::<Vec<_>>(), expected);
    assert!(names.values().all(String::is_empty), "default template instances must carry the empty template name");
}

#[test]
fn test_templates_consume_declared_counts_in_order() {
    let templates = vec![template("cache", 2), template("arm", 1)];
    let names = instances::instance_name_set("mydb", "shard", 5, &templates, &[]).expect("expected name derivation to succeed");
    assert_eq!(names.get("mydb-shard-cache-0").map(String::as_str), Some("cache"));
    assert_eq!(names.get("mydb-shard-cache-1").map(String::as_str), Some("cache"));
    assert_eq!(names.get("mydb-shard-arm-0").map(String::as_str), Some("arm"));
    assert_eq!(names.get("mydb-shard-0").map(String::as_str), Some(""));
    assert_eq!(names.get("mydb-shard-1").map(String::as_str), Some(""));
    assert_eq!(names.len(), 5);
}

#[test]
fn test_offline_names_are_skipped_not_renamed() {
    let offline = vec!["mydb-shard-1".to_string()];
    let names = instances::instance_name_set("mydb", "shard", 3, &[], &offline).expect("expected name derivation to succeed");
    let expected: Vec<&str> = vec!["mydb-shard-0", "mydb-shard-2", "mydb-shard-3"];
    assert_eq!(names.keys().map(String::as_str).collect::<Vec<_>>(), expected);
}

#[test]
fn test_determinism() {
    let templates = vec![template("cache", 2)];
    let offline = vec!["mydb-shard-cache-0".to_string()];
    let a = instances::instance_name_set("mydb", "shard", 4, &templates, &offline).expect("expected name derivation to succeed");
    let b = instances::instance_name_set("mydb", "shard", 4, &templates, &offline).expect("expected name derivation to succeed");
    assert_eq!(a, b, "identical inputs must yield identical name sets");
}

#[test]
fn test_over_allocated_templates_is_fatal() {
    let templates = vec![template("cache", 4)];
    let err = instances::instance_name_set("mydb", "shard", 3, &templates, &[]).expect_err("expected over-allocated templates to error");
    assert!(err.is_fatal(), "over-allocated templates must be a fatal error, got: {}", err);
}

#[test]
fn test_duplicate_template_names_is_fatal() {
    let templates = vec![template("cache", 1), template("cache", 1)];
    let err = instances::instance_name_set("mydb", "shard", 3, &templates, &[]).expect_err("expected duplicate template names to error");
    assert!(err.is_fatal(), "duplicate template names must be a fatal error, got: {}", err);
}

#[test]
fn test_template_of_resolves_generated_and_explicit_names() {
    let templates = vec![template("cache", 2)];
    assert_eq!(instances::template_of("mydb", "shard", &templates, "mydb-shard-cache-1"), "cache");
    assert_eq!(instances::template_of("mydb", "shard", &templates, "mydb-shard-3"), "");
    assert_eq!(instances::template_of("mydb", "shard", &templates, "unrelated-pod"), "");
}
