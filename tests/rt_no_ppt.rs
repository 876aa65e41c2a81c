use std::fs;
use std::path::Path;

/// Render-path modules must not call the non-RT `assert_invariant`, which acquires a Mutex.
#[test]
fn render_path_does_not_call_assert_invariant() {
    for file in ["rt.rs", "node.rs", "nodes.rs", "states.rs", "chunk.rs"] {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("src").join(file);
        let src = fs::read_to_string(&path).expect("failed to read render-path source");
        assert!(
            !src.contains("assert_invariant("),
            "{file} is on the render path and must not call assert_invariant (acquires Mutex)."
        );
    }
}
