//! Integration tests for the task template registry.

use chrono::Utc;
use dispatchd::model::{CanonicalEvent, EventKind, ResourceRef, TaskTemplate};
use dispatchd::normalize::event_id;
use dispatchd::templates::TemplateRegistry;
use std::path::Path;

fn write(dir: &Path, file: &str, content: &str) {
    std::fs::write(dir.join(file), content).unwrap();
}

fn event(resource: &str, kind: EventKind) -> CanonicalEvent {
    let now = Utc::now();
    CanonicalEvent {
        id: event_id("111122223333", resource, "1"),
        source_account: "111122223333".to_string(),
        resource: ResourceRef::parse(resource).unwrap(),
        kind,
        occurred_at: now,
        received_at: now,
    }
}

fn template(name: &str, prefix: &str, kinds: &[EventKind]) -> TaskTemplate {
    TaskTemplate {
        name: name.to_string(),
        reference: format!("{name}-task:1"),
        match_prefix: prefix.to_string(),
        event_kinds: kinds.to_vec(),
        resources: Default::default(),
        identity: "role/runner".to_string(),
        env: Default::default(),
    }
}

#[test]
fn loads_templates_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "ingest.toml",
        r#"
[template]
name = "ingest"
reference = "etl-task:7"
match_prefix = "ingest/incoming/"
identity = "role/etl-runner"

[template.resources]
cpu_units = 1024
memory_mib = 2048

[template.env]
OUTPUT_BUCKET = "processed"
"#,
    );
    write(
        dir.path(),
        "purge.toml",
        r#"
[template]
name = "purge"
reference = "purge-task:2"
match_prefix = "ingest/"
event_kinds = ["removed"]
identity = "role/purger"
"#,
    );
    write(dir.path(), "README.md", "not a template");

    let registry = TemplateRegistry::load_from_dir(dir.path()).unwrap();
    assert_eq!(registry.len(), 2);

    let ingest = registry.get("ingest").unwrap();
    assert_eq!(ingest.event_kinds, vec![EventKind::Created]);
    assert_eq!(ingest.resources.cpu_units, 1024);
    assert_eq!(ingest.env["OUTPUT_BUCKET"], "processed");

    let purge = registry.get("purge").unwrap();
    assert_eq!(purge.resources.memory_mib, 512);
}

#[test]
fn longest_prefix_wins() {
    let registry = TemplateRegistry::from_templates([
        template("catch-all", "", &[EventKind::Created]),
        template("ingest", "ingest/", &[EventKind::Created]),
        template("incoming", "ingest/incoming/", &[EventKind::Created]),
    ])
    .unwrap();

    let hit = registry.match_event(&event("ingest/incoming/a.csv", EventKind::Created));
    assert_eq!(hit.unwrap().name, "incoming");
    let hit = registry.match_event(&event("ingest/other/a.csv", EventKind::Created));
    assert_eq!(hit.unwrap().name, "ingest");
    let hit = registry.match_event(&event("reports/a.pdf", EventKind::Created));
    assert_eq!(hit.unwrap().name, "catch-all");
}

#[test]
fn event_kind_must_be_listed() {
    let registry =
        TemplateRegistry::from_templates([template("ingest", "ingest/", &[EventKind::Created])])
            .unwrap();
    assert!(registry
        .match_event(&event("ingest/a.csv", EventKind::Removed))
        .is_none());
}

#[test]
fn equal_prefixes_resolve_by_name() {
    let registry = TemplateRegistry::from_templates([
        template("zeta", "ingest/", &[EventKind::Created]),
        template("alpha", "ingest/", &[EventKind::Created]),
    ])
    .unwrap();
    let hit = registry.match_event(&event("ingest/a.csv", EventKind::Created));
    assert_eq!(hit.unwrap().name, "alpha");
}

#[test]
fn empty_registry_routes_nothing() {
    let registry = TemplateRegistry::empty();
    assert!(registry.is_empty());
    assert!(registry
        .match_event(&event("ingest/a.csv", EventKind::Created))
        .is_none());
}

#[test]
fn invalid_templates_are_rejected() {
    assert!(
        TemplateRegistry::from_templates([
            template("ingest", "a/", &[EventKind::Created]),
            template("ingest", "b/", &[EventKind::Created]),
        ])
        .is_err()
    );
    assert!(TemplateRegistry::from_templates([template("none", "a/", &[])]).is_err());

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "broken.toml", "[template]\nname = \"broken\"\n");
    assert!(TemplateRegistry::load_from_dir(dir.path()).is_err());
}

#[test]
fn missing_directory_is_a_config_error() {
    let err = TemplateRegistry::load_from_dir(Path::new("/nonexistent/dispatchd/templates"))
        .unwrap_err();
    assert!(matches!(err, dispatchd::error::Error::Config(_)));
}
