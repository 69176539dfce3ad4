use crate::graph::Dag;

#[test]
fn test_ordered_respects_dependencies() {
    let mut dag: Dag<&str, &str> = Dag::new();
    dag.add_vertex("sts", "sts");
    dag.add_vertex("headless", "headless");
    dag.add_vertex("env", "env");
    dag.add_vertex("svc", "svc");
    dag.depend_on(&"sts", &["headless", "env", "svc"]);

    let ordered = dag.into_ordered();
    assert_eq!(ordered.len(), 4);
    let position = |name: &str| ordered.iter().position(|v| *v == name).expect("vertex missing from order");
    let sts = position("sts");
    assert!(position("headless") < sts, "headless service must be materialized before the workload");
    assert!(position("env") < sts, "env config must be materialized before the workload");
    assert!(position("svc") < sts, "frontend service must be materialized before the workload");
}

#[test]
fn test_ordered_chain() {
    let mut dag: Dag<u32, u32> = Dag::new();
    for key in [3u32, 1, 2] {
        dag.add_vertex(key, key);
    }
    dag.connect(&1, &2);
    dag.connect(&2, &3);
    assert_eq!(dag.into_ordered(), vec![1, 2, 3]);
}

#[test]
fn test_add_vertex_replaces_existing_key() {
    let mut dag: Dag<&str, u32> = Dag::new();
    dag.add_vertex("a", 1);
    dag.add_vertex("a", 2);
    assert_eq!(dag.len(), 1);
    assert_eq!(dag.into_ordered(), vec![2]);
}

#[test]
#[should_panic(expected = "cycle")]
fn test_cycle_panics() {
    let mut dag: Dag<&str, &str> = Dag::new();
    dag.add_vertex("a", "a");
    dag.add_vertex("b", "b");
    dag.connect(&"a", &"b");
    dag.connect(&"b", &"a");
    let _ = dag.into_ordered();
}

#[test]
#[should_panic(expected = "unknown graph vertex")]
fn test_edge_against_unknown_vertex_panics() {
    let mut dag: Dag<&str, &str> = Dag::new();
    dag.add_vertex("a", "a");
    dag.connect(&"a", &"missing");
}
