//! Scenario: any tampering with the migration audit log breaks the hash
//! chain and is reported with the offending line.

use ctm_audit::{verify_hash_chain, verify_hash_chain_str, AuditWriter, VerifyResult};
use serde_json::json;
use uuid::Uuid;

fn write_three_events(path: &std::path::Path) {
    let mut w = AuditWriter::new(path, true).unwrap();
    let customer = Uuid::new_v4();
    w.append(
        customer,
        "migration.mark_legacy",
        json!({"from": "CURRENT", "to": "LEGACY"}),
    )
    .unwrap();
    w.append(
        customer,
        "migration.begin_dual",
        json!({"from": "LEGACY", "to": "DUAL"}),
    )
    .unwrap();
    w.append(
        customer,
        "migration.complete",
        json!({"from": "DUAL", "to": "CURRENT"}),
    )
    .unwrap();
}

#[test]
fn intact_chain_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    write_three_events(&path);

    assert_eq!(
        verify_hash_chain(&path).unwrap(),
        VerifyResult::Valid { lines: 3 }
    );
}

#[test]
fn edited_payload_breaks_chain_at_that_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    write_three_events(&path);

    let content = std::fs::read_to_string(&path).unwrap();
    let tampered = content.replace("begin_dual", "begin_dual_forged");

    match verify_hash_chain_str(&tampered).unwrap() {
        VerifyResult::Broken { line, .. } => assert_eq!(line, 2),
        other => panic!("expected broken chain, got {other:?}"),
    }
}

#[test]
fn deleted_line_breaks_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    write_three_events(&path);

    let content = std::fs::read_to_string(&path).unwrap();
    let without_second: Vec<&str> = content
        .lines()
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(_, l)| l)
        .collect();

    match verify_hash_chain_str(&without_second.join("\n")).unwrap() {
        VerifyResult::Broken { line, .. } => assert_eq!(line, 2),
        other => panic!("expected broken chain, got {other:?}"),
    }
}
