use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use image::{ImageFormat, Rgba, RgbaImage};
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use kroma_guard_core::gateway::ScriptedGateway;
use kroma_guard_core::history::{HistoryStore, SqliteHistoryStore, TerminalState};
use kroma_guard_core::retry::RetryController;
use kroma_guard_core::settings::GuardSettings;
use kroma_guard_core::tools::ToolCallProposal;

fn encode_png(image: &RgbaImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("png encode should succeed");
    out.into_inner()
}

fn source() -> RgbaImage {
    RgbaImage::from_fn(100, 100, |x, _| {
        if x < 40 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    })
}

fn temp_db() -> (PathBuf, PathBuf) {
    let root = std::env::temp_dir().join(format!("kroma_guard_it_{}", Uuid::new_v4()));
    let db = root.join("var/guard/history.db");
    (root, db)
}

#[test]
fn records_survive_reopening_the_database() {
    let (root, db) = temp_db();
    let before = source();
    let after = RgbaImage::from_fn(100, 100, |x, y| {
        if x < 40 {
            Rgba([255, 0, 0, 0])
        } else {
            *before.get_pixel(x, y)
        }
    });
    let source_bytes = encode_png(&before);

    let store = Arc::new(SqliteHistoryStore::new(&db));
    let controller = RetryController::new(
        GuardSettings::default(),
        Arc::new(ScriptedGateway::new([Ok(encode_png(&after))])),
        store,
    );
    let accepted = controller
        .run(
            &ToolCallProposal::from_value("remove_color", json!({"colors": ["#ff0000"]})),
            &source_bytes,
        )
        .expect("accepted run");
    let rejected = controller
        .run(
            &ToolCallProposal::from_value("remove_color", json!({"colors": ["#00ff00"]})),
            &source_bytes,
        )
        .expect("rejected run");
    assert!(accepted.accepted);
    assert_eq!(rejected.terminal_state, TerminalState::Rejected);

    let reopened = SqliteHistoryStore::new(&db);
    let recent = reopened
        .recent_for_tool("remove_color", 10)
        .expect("read history");
    let ids = recent.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids, vec![rejected.record_id.clone(), accepted.record_id.clone()]);

    let successes = reopened
        .successful_for_tool("remove_color", 10)
        .expect("read successes");
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].image_snapshot.width, 100);
    assert_eq!(successes[0].parameters["colors"], json!(["#ff0000"]));

    let similar = reopened
        .similar_successes(
            "remove_color",
            json!({"colors": ["#ff0000"], "tolerance": 12})
                .as_object()
                .expect("object"),
            0.1,
            10,
        )
        .expect("similar");
    assert_eq!(similar.len(), 1);

    let _ = std::fs::remove_dir_all(root);
}
