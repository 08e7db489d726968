use ccb_adapters::RestBugList;
use ccb_core::{normalize, CanonicalBugRow, RawBug};

#[test]
fn bugzilla_sample_matches_snapshot() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let dir = root.join("fixtures/bugzilla/sample");

    let bugs: RestBugList =
        serde_json::from_str(&std::fs::read_to_string(dir.join("bugs.json")).unwrap()).unwrap();
    let expected: Vec<CanonicalBugRow> =
        serde_json::from_str(&std::fs::read_to_string(dir.join("snapshot.json")).unwrap()).unwrap();

    let rows = bugs
        .bugs
        .into_iter()
        .map(RawBug::from)
        .map(|raw| normalize(&raw).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(rows, expected);
    assert!(rows
        .iter()
        .all(|r| !r.summary.contains(['"', '\'']) && !r.customer_data.contains(['"', '\''])));
}
