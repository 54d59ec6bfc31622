use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use ed25519_dalek::{Signer, SigningKey};

use appdeck_core::{ErrorCode, InstallationReport, PackageHeader};
use appdeck_sudo::{SudoClient, SudoServer};

use super::*;
use crate::registry::ApplicationRecord;
use crate::users::find_unused_user_id;

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "appdeck-installer-test-{}-{}",
        std::process::id(),
        TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

struct Fixture {
    root: PathBuf,
    paths: InstallerPaths,
    locations: Arc<LocationRegistry>,
    registry: Arc<FileApplicationRegistry>,
    sudo: Arc<SudoClient>,
    engine: TaskEngine,
    events: mpsc::Receiver<TaskEvent>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_settings(|_| {})
    }

    fn with_settings(customize: impl FnOnce(&mut EngineSettings)) -> Self {
        let root = test_root();
        let paths = InstallerPaths::new(root.join("manifests"), root.join("mounts"));
        paths.ensure_base_dirs().expect("must create base dirs");
        fs::create_dir_all(root.join("apps")).expect("must create app dir");
        fs::create_dir_all(root.join("docs")).expect("must create doc dir");

        let locations = Arc::new(
            LocationRegistry::new(vec![InstallationLocation {
                kind: LocationKind::Internal,
                index: 0,
                is_default: true,
                installation_path: root.join("apps"),
                document_path: root.join("docs"),
            }])
            .expect("must build location registry"),
        );
        let registry =
            Arc::new(FileApplicationRegistry::load(&paths).expect("must load registry"));
        let sudo = Arc::new(SudoClient::fallback(SudoServer::new(vec![root.clone()])));

        let mut settings = EngineSettings {
            allow_unsigned: true,
            hardware_id: "hw-test".to_string(),
            ..Default::default()
        };
        customize(&mut settings);

        let (sender, events) = mpsc::channel();
        let engine = TaskEngine::new(
            sudo.clone(),
            locations.clone(),
            registry.clone(),
            paths.clone(),
            settings,
            sender,
        )
        .expect("must create engine");

        Self {
            root,
            paths,
            locations,
            registry,
            sudo,
            engine,
            events,
        }
    }

    fn wait_for_state(&self, task_id: &str, state: TaskState) {
        wait_until(&format!("task {task_id} to reach {}", state.as_str()), || {
            self.engine.task_state(task_id) == Some(state)
        });
    }

    fn install(&self, archive: &Path) -> String {
        let task_id = self
            .engine
            .enqueue_install(&archive.to_string_lossy(), None);
        self.engine.acknowledge(&task_id);
        self.wait_for_state(&task_id, TaskState::Finished);
        task_id
    }

    fn drain_events(&self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn state_changes(events: &[TaskEvent], task_id: &str) -> Vec<TaskState> {
    events
        .iter()
        .filter_map(|event| match event {
            TaskEvent::StateChanged { task_id: id, state } if id == task_id => Some(*state),
            _ => None,
        })
        .collect()
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

struct PackageSpec<'a> {
    id: &'a str,
    version: &'a str,
    files: &'a [(&'a str, &'a [u8])],
    signing_key: Option<&'a SigningKey>,
    digest_override: Option<&'a str>,
}

impl<'a> PackageSpec<'a> {
    fn new(id: &'a str, version: &'a str, files: &'a [(&'a str, &'a [u8])]) -> Self {
        Self {
            id,
            version,
            files,
            signing_key: None,
            digest_override: None,
        }
    }
}

fn make_package(dir: &Path, spec: &PackageSpec) -> PathBuf {
    let pkg = dir.join(format!("pkg-{}-{}", spec.id, spec.version));
    let content = pkg.join("content");
    fs::create_dir_all(&content).expect("must create package content dir");
    for (name, data) in spec.files {
        let path = content.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("must create content subdir");
        }
        fs::write(&path, data).expect("must write content file");
    }

    let digest = match spec.digest_override {
        Some(digest) => digest.to_string(),
        None => crate::fetch::compute_content_digest(&content).expect("must compute digest"),
    };
    let header = format!(
        "application_id = \"{}\"\nversion = \"{}\"\ncontent_sha256 = \"{digest}\"\n",
        spec.id, spec.version
    );
    fs::write(pkg.join("header.toml"), &header).expect("must write header");

    let mut members = vec!["header.toml".to_string(), "content".to_string()];
    if let Some(key) = spec.signing_key {
        let signature = key.sign(header.as_bytes());
        fs::write(pkg.join("header.sig"), hex::encode(signature.to_bytes()))
            .expect("must write signature");
        members.insert(1, "header.sig".to_string());
    }

    let archive = dir.join(format!("{}-{}.tar", spec.id, spec.version));
    let status = Command::new("tar")
        .arg("-cf")
        .arg(&archive)
        .arg("-C")
        .arg(&pkg)
        .args(&members)
        .status()
        .expect("must run tar");
    assert!(status.success(), "tar must succeed");
    archive
}

#[test]
fn install_finishes_and_registers_the_application() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.one", "1.0", &[("bin/app", b"#!/bin/sh\n")]),
    );

    let task_id = fixture
        .engine
        .enqueue_install(&archive.to_string_lossy(), None);
    fixture.wait_for_state(&task_id, TaskState::AwaitingAcknowledge);
    assert_eq!(
        fixture.engine.task_application_id(&task_id).as_deref(),
        Some("com.example.one")
    );

    assert!(fixture.engine.acknowledge(&task_id));
    fixture.wait_for_state(&task_id, TaskState::Finished);

    let record = fixture
        .registry
        .by_id("com.example.one")
        .expect("application must be registered");
    let report = record.report.expect("report must exist");
    assert_eq!(report.installation_location_id, "internal-0");
    assert_eq!(report.hardware_id, "hw-test");

    assert!(fixture.root.join("apps/com.example.one/bin/app").is_file());
    assert!(fixture.root.join("docs/com.example.one").is_dir());
    assert!(fixture.paths.header_path("com.example.one").is_file());

    let on_disk = InstallationReport::parse(
        &fs::read_to_string(fixture.paths.report_path("com.example.one"))
            .expect("must read report"),
    )
    .expect("must parse report");
    assert_eq!(on_disk, report);

    // Staging must be gone once the task is terminal.
    assert!(!fixture.paths.task_staging_dir(&task_id).exists());

    let states = state_changes(&fixture.drain_events(), &task_id);
    assert_eq!(
        states,
        vec![
            TaskState::Executing,
            TaskState::AwaitingAcknowledge,
            TaskState::Installing,
            TaskState::CleaningUp,
            TaskState::Finished,
        ]
    );
}

#[test]
fn pre_acknowledged_install_skips_the_waiting_phase() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.pre", "1.0", &[("data", b"d")]),
    );

    let task_id = fixture
        .engine
        .enqueue_install(&archive.to_string_lossy(), None);
    assert!(fixture.engine.acknowledge(&task_id));
    fixture.wait_for_state(&task_id, TaskState::Finished);
    assert!(fixture.registry.by_id("com.example.pre").is_some());
}

#[test]
fn unsigned_package_fails_when_signatures_are_required() {
    let fixture = Fixture::with_settings(|settings| {
        settings.allow_unsigned = false;
    });
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.unsigned", "1.0", &[("data", b"d")]),
    );

    let task_id = fixture
        .engine
        .enqueue_install(&archive.to_string_lossy(), None);
    fixture.wait_for_state(&task_id, TaskState::Failed);

    let status = fixture.engine.status(&task_id).expect("task must be known");
    let error = status.error.expect("failed task must carry an error");
    assert_eq!(error.code, ErrorCode::Signature);
    assert!(fixture.registry.by_id("com.example.unsigned").is_none());
}

#[test]
fn signed_package_verifies_against_trusted_keys() {
    let key = SigningKey::from_bytes(&[11u8; 32]);
    let public_hex = hex::encode(key.verifying_key().to_bytes());
    let fixture = Fixture::with_settings(move |settings| {
        settings.allow_unsigned = false;
        settings.trusted_keys = vec![public_hex];
    });

    let mut spec = PackageSpec::new("com.example.signed", "2.0", &[("data", b"payload")]);
    spec.signing_key = Some(&key);
    let archive = make_package(&fixture.root, &spec);

    fixture.install(&archive);
    assert!(fixture.registry.by_id("com.example.signed").is_some());
}

#[test]
fn tampered_content_fails_with_signature_error() {
    let fixture = Fixture::new();
    let mut spec = PackageSpec::new("com.example.tampered", "1.0", &[("data", b"d")]);
    spec.digest_override = Some("0000000000000000000000000000000000000000000000000000000000000000");
    let archive = make_package(&fixture.root, &spec);

    let task_id = fixture
        .engine
        .enqueue_install(&archive.to_string_lossy(), None);
    fixture.wait_for_state(&task_id, TaskState::Failed);

    let error = fixture
        .engine
        .status(&task_id)
        .expect("task must be known")
        .error
        .expect("must carry an error");
    assert_eq!(error.code, ErrorCode::Signature);
    assert!(fixture.registry.by_id("com.example.tampered").is_none());
}

#[test]
fn cancel_before_acknowledge_leaves_no_trace() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.canceled", "1.0", &[("data", b"d")]),
    );

    let task_id = fixture
        .engine
        .enqueue_install(&archive.to_string_lossy(), None);
    fixture.wait_for_state(&task_id, TaskState::AwaitingAcknowledge);
    assert!(fixture.engine.cancel(&task_id));
    fixture.wait_for_state(&task_id, TaskState::Failed);

    let error = fixture
        .engine
        .status(&task_id)
        .expect("task must be known")
        .error
        .expect("must carry an error");
    assert_eq!(error.code, ErrorCode::Canceled);

    assert!(fixture.registry.by_id("com.example.canceled").is_none());
    assert!(!fixture.root.join("apps/com.example.canceled").exists());
    assert!(!fixture.paths.app_manifest_dir("com.example.canceled").exists());
    assert!(!fixture.paths.task_staging_dir(&task_id).exists());

    // A task that never entered Installing must not pass through CleaningUp.
    let states = state_changes(&fixture.drain_events(), &task_id);
    assert_eq!(
        states,
        vec![
            TaskState::Executing,
            TaskState::AwaitingAcknowledge,
            TaskState::Failed,
        ]
    );
}

#[test]
fn cancel_past_the_point_of_no_return_is_refused() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.committed", "1.0", &[("data", b"d")]),
    );

    let task_id = fixture.install(&archive);
    assert!(!fixture.engine.cancel(&task_id));
}

#[test]
fn invalid_location_fails_the_task_without_starting_it() {
    let fixture = Fixture::new();
    let task_id = fixture
        .engine
        .enqueue_install("/nonexistent/package.tar", Some("removable-9"));
    fixture.wait_for_state(&task_id, TaskState::Failed);

    let error = fixture
        .engine
        .status(&task_id)
        .expect("task must be known")
        .error
        .expect("must carry an error");
    assert_eq!(error.code, ErrorCode::Package);

    let started = fixture.drain_events().into_iter().any(|event| {
        matches!(&event, TaskEvent::Started { task_id: id } if *id == task_id)
    });
    assert!(!started, "an invalid task must never start");
}

#[test]
fn queued_task_can_be_canceled_synchronously() {
    let fixture = Fixture::new();

    let fifo = fixture.root.join("blocking.fifo");
    let status = Command::new("mkfifo")
        .arg(&fifo)
        .status()
        .expect("must run mkfifo");
    assert!(status.success(), "mkfifo must succeed");

    // The first task blocks opening the fifo, pinning the execution slot.
    let blocked_id = fixture.engine.enqueue_install(&fifo.to_string_lossy(), None);
    let queued_id = fixture
        .engine
        .enqueue_install("/nonexistent/other.tar", None);

    assert_eq!(
        fixture.engine.task_state(&queued_id),
        Some(TaskState::Queued)
    );
    assert!(fixture.engine.cancel(&queued_id));
    assert_eq!(
        fixture.engine.task_state(&queued_id),
        Some(TaskState::Failed)
    );
    let error = fixture
        .engine
        .status(&queued_id)
        .expect("task must be known")
        .error
        .expect("must carry an error");
    assert_eq!(error.code, ErrorCode::Canceled);

    // Unblock the fifo reader so the worker thread can end.
    drop(fs::File::create(&fifo).expect("must open fifo for writing"));
    wait_until("blocked task to terminate", || {
        fixture
            .engine
            .task_state(&blocked_id)
            .is_some_and(|state| state.is_terminal())
    });
}

#[test]
fn awaiting_acknowledge_releases_the_slot_and_installing_stays_exclusive() {
    let fixture = Fixture::new();
    let first = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.first", "1.0", &[("data", b"1")]),
    );
    let second = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.second", "1.0", &[("data", b"2")]),
    );

    let first_id = fixture.engine.enqueue_install(&first.to_string_lossy(), None);
    let second_id = fixture
        .engine
        .enqueue_install(&second.to_string_lossy(), None);

    // With the first task parked on acknowledgement, the second must be able
    // to fetch and park as well.
    fixture.wait_for_state(&first_id, TaskState::AwaitingAcknowledge);
    fixture.wait_for_state(&second_id, TaskState::AwaitingAcknowledge);
    assert_eq!(
        fixture.engine.active_task_ids(),
        vec![first_id.clone(), second_id.clone()]
    );

    assert!(fixture.engine.acknowledge(&first_id));
    assert!(fixture.engine.acknowledge(&second_id));
    fixture.wait_for_state(&first_id, TaskState::Finished);
    fixture.wait_for_state(&second_id, TaskState::Finished);

    let mut installing: BTreeSet<String> = BTreeSet::new();
    for event in fixture.drain_events() {
        if let TaskEvent::StateChanged { task_id, state } = event {
            if state == TaskState::Installing {
                installing.insert(task_id);
                assert!(
                    installing.len() <= 1,
                    "two tasks were in Installing at once"
                );
            } else {
                installing.remove(&task_id);
            }
        }
    }
    assert!(fixture.engine.active_task_ids().is_empty());
}

#[test]
fn installing_an_update_replaces_the_previous_version() {
    let fixture = Fixture::new();
    let v1 = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.update", "1.0", &[("data", b"one")]),
    );
    let v2 = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.update", "1.1", &[("data", b"two")]),
    );

    fixture.install(&v1);
    fixture.install(&v2);

    let installed = fs::read(fixture.root.join("apps/com.example.update/data"))
        .expect("must read installed file");
    assert_eq!(installed, b"two");

    let record = fixture
        .registry
        .by_id("com.example.update")
        .expect("application must be registered");
    assert_eq!(record.header.version, "1.1");
    assert!(!fixture.root.join("apps/com.example.update.old").exists());
}

#[test]
fn removal_deletes_application_documents_and_manifest() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.gone", "1.0", &[("data", b"d")]),
    );
    fixture.install(&archive);

    let task_id = fixture.engine.enqueue_removal("com.example.gone", false, false);
    fixture.wait_for_state(&task_id, TaskState::Finished);

    assert!(fixture.registry.by_id("com.example.gone").is_none());
    assert!(!fixture.root.join("apps/com.example.gone").exists());
    assert!(!fixture.root.join("docs/com.example.gone").exists());
    assert!(!fixture.paths.app_manifest_dir("com.example.gone").exists());

    // Deinstallation has no CleaningUp phase.
    let states = state_changes(&fixture.drain_events(), &task_id);
    assert_eq!(states, vec![TaskState::Executing, TaskState::Finished]);
}

#[test]
fn removal_can_keep_documents() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.docs", "1.0", &[("data", b"d")]),
    );
    fixture.install(&archive);
    fs::write(fixture.root.join("docs/com.example.docs/settings.ini"), b"x")
        .expect("must write document");

    let task_id = fixture.engine.enqueue_removal("com.example.docs", true, false);
    fixture.wait_for_state(&task_id, TaskState::Finished);

    assert!(!fixture.root.join("apps/com.example.docs").exists());
    assert!(fixture
        .root
        .join("docs/com.example.docs/settings.ini")
        .is_file());
}

#[test]
fn removal_of_unknown_application_fails() {
    let fixture = Fixture::new();
    let task_id = fixture
        .engine
        .enqueue_removal("com.example.missing", false, false);
    fixture.wait_for_state(&task_id, TaskState::Failed);

    let error = fixture
        .engine
        .status(&task_id)
        .expect("task must be known")
        .error
        .expect("must carry an error");
    assert_eq!(error.code, ErrorCode::Package);
}

#[test]
fn failed_removal_can_be_retried() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.wedge", "1.0", &[("data", b"d")]),
    );
    fixture.install(&archive);

    // An engine whose privileged client may only touch the manifest
    // directory cannot delete the installed content.
    let restricted = Arc::new(SudoClient::fallback(SudoServer::new(vec![fixture
        .paths
        .manifest_dir()
        .to_path_buf()])));
    let (sender, _events) = mpsc::channel();
    let crippled = TaskEngine::new(
        restricted,
        fixture.locations.clone(),
        fixture.registry.clone(),
        fixture.paths.clone(),
        EngineSettings {
            allow_unsigned: true,
            ..Default::default()
        },
        sender,
    )
    .expect("must create engine");

    let failed_id = crippled.enqueue_removal("com.example.wedge", false, false);
    wait_until("restricted removal to fail", || {
        crippled.task_state(&failed_id) == Some(TaskState::Failed)
    });
    let error = crippled
        .status(&failed_id)
        .expect("task must be known")
        .error
        .expect("must carry an error");
    assert_eq!(error.code, ErrorCode::IO);
    assert!(fixture.registry.by_id("com.example.wedge").is_some());

    // The failed attempt must not leave the application marked as being
    // removed; a capable engine can retry.
    let retry_id = fixture.engine.enqueue_removal("com.example.wedge", false, false);
    fixture.wait_for_state(&retry_id, TaskState::Finished);
    assert!(fixture.registry.by_id("com.example.wedge").is_none());
    assert!(!fixture.root.join("apps/com.example.wedge").exists());
}

fn write_installed_app(fixture: &Fixture, id: &str) {
    let header = format!(
        "application_id = \"{id}\"\nversion = \"1.0\"\ncontent_sha256 = \"ab\"\n"
    );
    fs::create_dir_all(fixture.paths.app_manifest_dir(id)).expect("must create manifest dir");
    fs::write(fixture.paths.header_path(id), header).expect("must write header");
    let report = InstallationReport {
        application_id: id.to_string(),
        installation_location_id: "internal-0".to_string(),
        disk_space_used: 1,
        digest: "ab".to_string(),
        hardware_id: "hw-test".to_string(),
        ..Default::default()
    };
    fs::write(fixture.paths.report_path(id), report.serialize()).expect("must write report");
    fs::create_dir_all(fixture.root.join("apps").join(id)).expect("must create app dir");
    fs::write(fixture.root.join("apps").join(id).join("data"), b"d")
        .expect("must write app file");
    fs::create_dir_all(fixture.root.join("docs").join(id)).expect("must create doc dir");
}

#[test]
fn reconciler_removes_broken_applications_and_orphans() {
    let fixture = Fixture::new();
    write_installed_app(&fixture, "com.example.intact");

    // Broken: manifest entry without a report and without installed content.
    let broken_dir = fixture.paths.app_manifest_dir("com.example.broken");
    fs::create_dir_all(&broken_dir).expect("must create manifest dir");
    fs::write(
        fixture.paths.header_path("com.example.broken"),
        "application_id = \"com.example.broken\"\nversion = \"1.0\"\ncontent_sha256 = \"ab\"\n",
    )
    .expect("must write header");

    // Orphans in every managed directory.
    fs::create_dir_all(fixture.root.join("apps/com.example.ghost")).expect("must create orphan");
    fs::write(fixture.root.join("docs/stray-file"), b"x").expect("must write orphan");
    fs::create_dir_all(fixture.paths.staging_dir().join("task-interrupted"))
        .expect("must create stale staging");
    fs::create_dir_all(fixture.paths.mount_point("com.example.stale"))
        .expect("must create stale mount point");

    let registry = FileApplicationRegistry::load(&fixture.paths).expect("must load registry");
    let reconciler = Reconciler::new(
        &fixture.sudo,
        &fixture.locations,
        &registry,
        &fixture.paths,
    );
    reconciler.run().expect("reconcile must succeed");

    assert!(registry.by_id("com.example.intact").is_some());
    assert!(fixture.root.join("apps/com.example.intact/data").is_file());

    assert!(registry.by_id("com.example.broken").is_none());
    assert!(!broken_dir.exists());
    assert!(!fixture.root.join("apps/com.example.ghost").exists());
    assert!(!fixture.root.join("docs/stray-file").exists());
    assert!(!fixture.paths.staging_dir().exists());
    assert!(!fixture.paths.mount_point("com.example.stale").exists());
}

#[test]
fn reconciler_is_idempotent() {
    let fixture = Fixture::new();
    write_installed_app(&fixture, "com.example.stable");
    fs::create_dir_all(fixture.root.join("apps/leftover")).expect("must create orphan");

    let registry = FileApplicationRegistry::load(&fixture.paths).expect("must load registry");
    let reconciler = Reconciler::new(
        &fixture.sudo,
        &fixture.locations,
        &registry,
        &fixture.paths,
    );
    reconciler.run().expect("first reconcile must succeed");
    let after_first = snapshot_tree(&fixture.root);

    reconciler.run().expect("second reconcile must succeed");
    assert_eq!(snapshot_tree(&fixture.root), after_first);
}

fn snapshot_tree(root: &Path) -> Vec<PathBuf> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).expect("must list dir") {
            let entry = entry.expect("must list dir");
            entries.push(entry.path());
            if entry.path().is_dir() {
                pending.push(entry.path());
            }
        }
    }
    entries.sort();
    entries
}

#[test]
fn activation_of_internally_installed_application_fails() {
    let fixture = Fixture::new();
    let archive = make_package(
        &fixture.root,
        &PackageSpec::new("com.example.internal", "1.0", &[("data", b"d")]),
    );
    fixture.install(&archive);

    let task_id = fixture.engine.enqueue_activation("com.example.internal", true);
    fixture.wait_for_state(&task_id, TaskState::Failed);

    let error = fixture
        .engine
        .status(&task_id)
        .expect("task must be known")
        .error
        .expect("must carry an error");
    assert_eq!(error.code, ErrorCode::Package);
    assert!(error.message.contains("not installed to a removable location"));
}

#[test]
fn mount_table_parses_escaped_paths() {
    let raw = "/dev/sda1 / ext4 rw 0 0\n\
               /dev/loop7 /run/media/usb\\040stick vfat ro 0 0\n";
    let table = MountTable::parse(raw);

    assert!(table.is_mount_point(Path::new("/")));
    assert!(table.is_mount_point(Path::new("/run/media/usb stick")));
    assert_eq!(
        table.device_for(Path::new("/run/media/usb stick")),
        Some("/dev/loop7")
    );
    assert!(!table.is_mount_point(Path::new("/run/media")));
}

#[test]
fn location_registry_requires_exactly_one_default() {
    let location = |index: u32, is_default: bool| InstallationLocation {
        kind: LocationKind::Internal,
        index,
        is_default,
        installation_path: PathBuf::from("/srv/apps"),
        document_path: PathBuf::from("/srv/docs"),
    };

    let err = LocationRegistry::new(vec![location(0, false)])
        .expect_err("zero defaults must be rejected");
    assert!(err.to_string().contains("exactly one"));

    let err = LocationRegistry::new(vec![location(0, true), location(1, true)])
        .expect_err("two defaults must be rejected");
    assert!(err.to_string().contains("exactly one"));

    let registry =
        LocationRegistry::new(vec![location(0, true), location(1, false)])
            .expect("must build registry");
    assert_eq!(registry.default_location().id(), "internal-0");
    assert!(!registry.by_id("removable-0").is_valid());
    assert_eq!(registry.by_id("internal-1").index, 1);
}

struct MemoryRegistry {
    entries: Mutex<BTreeMap<String, ApplicationRecord>>,
}

impl MemoryRegistry {
    fn with_uids(uids: &[u32]) -> Self {
        let mut entries = BTreeMap::new();
        for (index, uid) in uids.iter().enumerate() {
            let id = format!("com.example.app{index}");
            entries.insert(
                id.clone(),
                ApplicationRecord {
                    header: PackageHeader {
                        application_id: id.clone(),
                        version: "1.0".to_string(),
                        content_sha256: "ab".to_string(),
                        ..Default::default()
                    },
                    report: Some(InstallationReport {
                        application_id: id,
                        installation_location_id: "internal-0".to_string(),
                        disk_space_used: 1,
                        digest: "ab".to_string(),
                        user_id: Some(*uid),
                        ..Default::default()
                    }),
                },
            );
        }
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl ApplicationRegistry for MemoryRegistry {
    fn applications(&self) -> Vec<ApplicationRecord> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn by_id(&self, application_id: &str) -> Option<ApplicationRecord> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(application_id)
            .cloned()
    }

    fn register(&self, record: &ApplicationRecord, _raw_header: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(record.header.application_id.clone(), record.clone());
        Ok(())
    }

    fn starting_removal(&self, application_id: &str) -> bool {
        self.entries
            .lock()
            .expect("lock poisoned")
            .contains_key(application_id)
    }

    fn canceled_removal(&self, application_id: &str) -> bool {
        self.entries
            .lock()
            .expect("lock poisoned")
            .contains_key(application_id)
    }

    fn finished_install(&self, application_id: &str) -> bool {
        self.entries
            .lock()
            .expect("lock poisoned")
            .remove(application_id)
            .is_some()
    }
}

#[test]
fn user_id_allocation_picks_the_first_unused_uid() {
    let separation = UserIdSeparation {
        min_user_id: 1000,
        max_user_id: 1003,
        common_group_id: 900,
    };

    let registry = MemoryRegistry::with_uids(&[1000, 1002]);
    let uid = find_unused_user_id(&separation, &registry).expect("must allocate uid");
    assert_eq!(uid, 1001);

    let registry = MemoryRegistry::with_uids(&[1000, 1001, 1002, 1003]);
    let err =
        find_unused_user_id(&separation, &registry).expect_err("exhausted range must fail");
    assert!(err.to_string().contains("no unused user-id"));
}

#[test]
fn disk_usage_reports_nonzero_totals() {
    let root = test_root();
    let usage = disk_usage(&root).expect("must query disk usage");
    assert!(usage.total_bytes > 0);
    assert!(usage.free_bytes <= usage.total_bytes);

    let _ = fs::remove_dir_all(&root);
}
