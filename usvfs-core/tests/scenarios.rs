// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The six literal end-to-end scenarios: each walks the same primitives a
//! hooked process would call (`link_file`/`link_directory_static`,
//! `reroute`/`reroute_new`, `add_file`/`remove_from_tree`), checked against
//! real files under `tempfile` instead of a live `GetFileAttributes` call,
//! since the tree and rerouter logic they exercise is itself platform
//! independent.

use usvfs_core::context::Parameters;
use usvfs_core::path::{self, CwdResolver};
use usvfs_core::tree::LINKFLAG_CREATETARGET;
use usvfs_core::{reroute, reroute_new, Context};

#[test]
fn scenario_1_basic_file_link() {
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("notepad.exe");
    std::fs::write(&real, b"binary").unwrap();

    let ctx = Context::isolated(Parameters {
        instance_name: "scenario-1".to_string(),
        ..Default::default()
    })
    .unwrap();
    ctx.link_file(&real.to_string_lossy(), r"C:\np.exe").unwrap();

    let result = reroute(&ctx.tables.main, r"C:\np.exe", &CwdResolver);
    assert!(result.was_rerouted);
    let metadata = std::fs::metadata(&result.result).unwrap();
    assert!(!metadata.is_dir());
}

#[test]
fn scenario_2_canonicalization_under_link() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("Logs");
    std::fs::create_dir_all(logs.join("a").join("b").join("c")).unwrap();

    let ctx = Context::isolated(Parameters {
        instance_name: "scenario-2".to_string(),
        ..Default::default()
    })
    .unwrap();
    ctx.link_directory_static(&logs.to_string_lossy(), r"C:\logs", LINKFLAG_CREATETARGET)
        .unwrap();

    let messy = r"C:\.\not/../logs\.\a\.\b\.\c\..\.\..\.\..\";
    let result = reroute(&ctx.tables.main, messy, &CwdResolver);
    assert!(result.was_rerouted);
    let metadata = std::fs::metadata(&result.result).unwrap();
    assert!(metadata.is_dir());
}

#[test]
fn scenario_3_link_rejects_nonexistent_parent() {
    let ctx = Context::isolated(Parameters {
        instance_name: "scenario-3".to_string(),
        ..Default::default()
    })
    .unwrap();
    let result = ctx.link_file(r"C:\windows\notepad.exe", r"c:\this_directory_shouldnt_exist\np.exe");
    assert!(result.is_err());
}

#[test]
fn scenario_4_overwrite_routes_to_existing_physical_not_copy_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let source_mod4 = dir.path().join("source").join("mod4").join("mfolder4");
    std::fs::create_dir_all(&source_mod4).unwrap();

    let ctx = Context::isolated(Parameters {
        instance_name: "scenario-4".to_string(),
        ..Default::default()
    })
    .unwrap();
    ctx.link_directory_static(&source_mod4.to_string_lossy(), r"C:\mfolder4", 0)
        .unwrap();

    let result = reroute(&ctx.tables.main, r"C:\mfolder4\mfileoverwrite.txt", &CwdResolver);
    std::fs::write(path::to_native_path(&result.result), b"X").unwrap();

    let written = std::fs::read(source_mod4.join("mfileoverwrite.txt")).unwrap();
    assert_eq!(written, b"X");
    assert!(!dir.path().join("overwrite").join("mfolder4").join("mfileoverwrite.txt").exists());
}

#[test]
fn scenario_5_create_target_capture() {
    let dir = tempfile::tempdir().unwrap();
    let overwrite = dir.path().join("source").join("overwrite");
    std::fs::create_dir_all(&overwrite).unwrap();

    let ctx = Context::isolated(Parameters {
        instance_name: "scenario-5".to_string(),
        ..Default::default()
    })
    .unwrap();
    ctx.link_directory_static(&overwrite.to_string_lossy(), r"C:\mount", LINKFLAG_CREATETARGET)
        .unwrap();

    let result = reroute_new(&ctx.tables.main, r"C:\mount\new\file.txt", &CwdResolver).unwrap();
    assert!(result.was_rerouted);
    std::fs::write(path::to_native_path(&result.result), b"Y").unwrap();
    assert_eq!(std::fs::read(overwrite.join("new").join("file.txt")).unwrap(), b"Y");

    ctx.tables.main.add_file(r"C:\mount\new\file.txt", &result.result).unwrap();
    let node = ctx.tables.main.find_node(r"C:\mount\new\file.txt").unwrap();
    assert_eq!(ctx.tables.main.data(node).link_target.as_deref(), Some(result.result.as_str()));
}

#[test]
fn scenario_6_move_capture() {
    let dir = tempfile::tempdir().unwrap();
    let overwrite = dir.path().join("source").join("overwrite");
    std::fs::create_dir_all(&overwrite).unwrap();

    let ctx = Context::isolated(Parameters {
        instance_name: "scenario-6".to_string(),
        ..Default::default()
    })
    .unwrap();
    ctx.link_directory_static(&overwrite.to_string_lossy(), r"C:\mount", LINKFLAG_CREATETARGET)
        .unwrap();

    let created = reroute_new(&ctx.tables.main, r"C:\mount\a.txt", &CwdResolver).unwrap();
    std::fs::write(path::to_native_path(&created.result), b"a").unwrap();
    let a_node = ctx.tables.main.add_file(r"C:\mount\a.txt", &created.result).unwrap();

    let moved = reroute_new(&ctx.tables.main, r"C:\mount\b.txt", &CwdResolver).unwrap();
    std::fs::rename(path::to_native_path(&created.result), path::to_native_path(&moved.result)).unwrap();
    ctx.tables.main.remove_from_tree(a_node).unwrap();
    let b_node = ctx.tables.main.add_file(r"C:\mount\b.txt", &moved.result).unwrap();

    assert!(ctx.tables.main.find_node(r"C:\mount\a.txt").is_none());
    let b_data = ctx.tables.main.data(b_node);
    assert!(b_data.link_target.as_deref().unwrap().ends_with("b.txt"));
    assert!(b_data.link_target.unwrap().contains("overwrite"));
}
