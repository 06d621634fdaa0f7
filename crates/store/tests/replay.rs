#![forbid(unsafe_code)]

use driftless_core::{Delta, DeltaKind, Gvk};
use driftless_store::Coalescer;

fn obj(name: &str, ns: Option<&str>, rv: u32) -> serde_json::Value {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv.to_string() });
    if let Some(ns) = ns { meta["namespace"] = serde_json::Value::String(ns.to_string()); }
    serde_json::json!({ "metadata": meta })
}

fn cm(kind: DeltaKind, raw: serde_json::Value) -> Delta { Delta { gvk: Gvk::new("", "v1", "ConfigMap"), kind, raw } }

#[test]
fn replay_bursty_sequence() {
    let mut q = Coalescer::with_capacity(16);

    let deltas = vec![
        cm(DeltaKind::Applied, obj("a", Some("ns"), 1)),
        // duplicate collapses into the first slot
        cm(DeltaKind::Applied, obj("a", Some("ns"), 2)),
        cm(DeltaKind::Applied, obj("b", Some("ns"), 1)),
        // same name in another namespace is a different object
        cm(DeltaKind::Applied, obj("a", Some("other"), 1)),
        cm(DeltaKind::Deleted, obj("b", Some("ns"), 2)),
        // nameless deltas are ignored
        cm(DeltaKind::Applied, serde_json::json!({})),
    ];

    for d in deltas[..2].iter().cloned() {
        q.push(d);
    }
    let first = q.drain_ready();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].raw["metadata"]["resourceVersion"], "2");

    for d in deltas[2..].iter().cloned() {
        q.push(d);
    }
    let second = q.drain_ready();
    let seen: Vec<(String, DeltaKind)> = second
        .iter()
        .map(|d| (d.raw["metadata"]["namespace"].as_str().unwrap().to_string() + "/" + d.raw["metadata"]["name"].as_str().unwrap(), d.kind))
        .collect();
    assert_eq!(seen, vec![("ns/b".to_string(), DeltaKind::Deleted), ("other/a".to_string(), DeltaKind::Applied)]);
    assert!(q.is_empty());
    assert_eq!(q.dropped(), 0);
}

#[test]
fn overflow_drops_oldest_first() {
    let mut q = Coalescer::with_capacity(3);
    for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        q.push(cm(DeltaKind::Applied, obj(name, Some("ns"), i as u32)));
    }
    assert_eq!(q.dropped(), 2);
    let names: Vec<String> = q.drain_ready().iter().map(|d| d.raw["metadata"]["name"].as_str().unwrap().to_string()).collect();
    assert_eq!(names, vec!["c", "d", "e"]);
}
