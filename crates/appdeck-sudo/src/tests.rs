use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use super::*;

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "appdeck-sudo-test-{}-{}",
        std::process::id(),
        TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn fallback_client(root: &PathBuf) -> SudoClient {
    SudoClient::fallback(SudoServer::new(vec![root.clone()]))
}

#[test]
fn request_paths_must_be_absolute() {
    let err = validate_request_paths(&SudoRequest::RemoveRecursive {
        path: PathBuf::from("relative/path"),
    })
    .expect_err("relative path must be rejected");
    assert!(err.to_string().contains("must be absolute"));
}

#[test]
fn request_paths_must_not_contain_parent_components() {
    let err = validate_request_paths(&SudoRequest::Unmount {
        target: PathBuf::from("/srv/apps/../../etc"),
        force: false,
    })
    .expect_err("parent components must be rejected");
    assert!(err.to_string().contains("relative components"));
}

#[test]
fn protocol_round_trip() {
    let request = SudoRequest::Mount {
        device: PathBuf::from("/dev/loop3"),
        target: PathBuf::from("/srv/app-images/com.example.nav"),
        read_only: true,
    };
    let encoded = serde_json::to_string(&request).expect("must encode");
    let decoded: SudoRequest = serde_json::from_str(&encoded).expect("must decode");
    assert_eq!(decoded, request);

    let response = SudoResponse::failure("mount failed");
    let encoded = serde_json::to_string(&response).expect("must encode");
    let decoded: SudoResponse = serde_json::from_str(&encoded).expect("must decode");
    assert_eq!(decoded, response);
}

#[test]
fn server_refuses_paths_outside_allowed_roots() {
    let root = test_root();
    let client = fallback_client(&root);

    assert!(!client.remove_recursive(&PathBuf::from("/etc/passwd-like")));
    assert!(client
        .last_error()
        .contains("outside the allowed installation roots"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn remove_recursive_removes_nested_tree() {
    let root = test_root();
    let client = fallback_client(&root);

    let tree = root.join("com.example.app");
    fs::create_dir_all(tree.join("assets/deep")).expect("must create dirs");
    fs::write(tree.join("assets/deep/data.bin"), b"x").expect("must write file");
    fs::write(tree.join("app"), b"#!/bin/sh\n").expect("must write file");

    assert!(client.remove_recursive(&tree));
    assert!(!tree.exists());
    assert!(client.last_error().is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn remove_recursive_grants_itself_traversal_permission() {
    let root = test_root();
    let client = fallback_client(&root);

    let tree = root.join("com.example.locked");
    fs::create_dir_all(tree.join("inner")).expect("must create dirs");
    fs::write(tree.join("inner/file"), b"x").expect("must write file");
    let mut perms = fs::metadata(tree.join("inner"))
        .expect("must stat")
        .permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o500);
    fs::set_permissions(tree.join("inner"), perms).expect("must restrict dir");

    assert!(client.remove_recursive(&tree));
    assert!(!tree.exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn remove_recursive_does_not_follow_symlinks() {
    let root = test_root();
    let client = fallback_client(&root);

    let outside = root.join("outside");
    fs::create_dir_all(&outside).expect("must create dirs");
    fs::write(outside.join("keep.txt"), b"keep").expect("must write file");

    let tree = root.join("com.example.linked");
    fs::create_dir_all(&tree).expect("must create dirs");
    std::os::unix::fs::symlink(&outside, tree.join("escape"))
        .expect("must create symlink");

    assert!(client.remove_recursive(&tree));
    assert!(!tree.exists());
    assert!(outside.join("keep.txt").exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn remove_recursive_on_missing_path_reports_success() {
    let root = test_root();
    let client = fallback_client(&root);

    assert!(client.remove_recursive(&root.join("never-created")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn mount_only_accepts_loopback_devices() {
    let root = test_root();
    let client = fallback_client(&root);

    let target = root.join("mnt");
    fs::create_dir_all(&target).expect("must create mount point");
    assert!(!client.mount(&PathBuf::from("/dev/sda1"), &target, true));
    assert!(client.last_error().contains("not a loopback device"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unmount_of_unmounted_path_reports_success() {
    let root = test_root();
    let client = fallback_client(&root);

    let target = root.join("never-mounted");
    fs::create_dir_all(&target).expect("must create dir");
    assert!(client.unmount(&target, false));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn detach_loopback_is_idempotent_for_missing_device() {
    let root = test_root();
    let client = fallback_client(&root);

    assert!(client.detach_loopback(&PathBuf::from("/dev/loop987654")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn detach_loopback_rejects_non_loop_devices() {
    let root = test_root();
    let client = fallback_client(&root);

    assert!(!client.detach_loopback(&PathBuf::from("/dev/sda1")));
    assert!(client.last_error().contains("not a loopback device"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn last_error_is_cleared_by_successful_call() {
    let root = test_root();
    let client = fallback_client(&root);

    assert!(!client.remove_recursive(&PathBuf::from("/nowhere/allowed")));
    assert!(!client.last_error().is_empty());

    assert!(client.ping());
    assert!(client.last_error().is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn serve_answers_requests_and_survives_malformed_lines() {
    let root = test_root();
    let server = SudoServer::new(vec![root.clone()]);

    let input = "{\"op\":\"ping\"}\nnot json\n";
    let mut output = Vec::new();
    serve(&server, Cursor::new(input), &mut output).expect("serve must succeed");

    let raw = String::from_utf8(output).expect("must be utf-8");
    let mut lines = raw.lines();

    let first: SudoResponse =
        serde_json::from_str(lines.next().expect("must answer ping")).expect("must decode");
    assert!(first.ok);
    assert_eq!(first.value.as_deref(), Some("pong"));

    let second: SudoResponse =
        serde_json::from_str(lines.next().expect("must answer bad line")).expect("must decode");
    assert!(!second.ok);
    assert!(second
        .error
        .expect("must carry error")
        .contains("malformed sudo request"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn fallback_client_reports_fallback_mode() {
    let root = test_root();
    let client = fallback_client(&root);
    assert!(client.is_fallback());

    let _ = fs::remove_dir_all(&root);
}
