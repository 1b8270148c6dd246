// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Exercises the dispatcher, directory-enum merging, and process-injection
//! decision logic together, the way a single hooked `CreateFile` followed by
//! a `FindFirstFile` on its parent directory would in a real host process.
//! None of this touches a live Win32 loader, so it runs on any host.

use usvfs_core::context::Parameters;
use usvfs_core::path::CwdResolver;
use usvfs_core::Context;
use usvfs_hooks::{create_process, dispatcher, directory_enum};

fn fresh_ctx(name: &str) -> Context {
    Context::isolated(Parameters {
        instance_name: name.to_string(),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn linked_file_is_reachable_both_by_open_and_by_directory_listing() {
    let ctx = fresh_ctx("pipeline-open-and-list");
    ctx.link_file(r"C:\real\mods\overhaul.dll", r"C:\game\mods\overhaul.dll")
        .unwrap();

    let open = dispatcher::open_file(&ctx, r"C:\game\mods\overhaul.dll", &CwdResolver);
    assert!(open.was_rerouted);
    assert_eq!(open.result, r"C:\real\mods\overhaul.dll");

    let listing = dispatcher::search_files(&ctx, r"C:\game\mods", &CwdResolver);
    assert!(!listing.was_rerouted, "C:\\game\\mods has no link of its own, only a virtual child");

    let real_siblings = vec!["readme.txt".to_string()];
    let merged = directory_enum::merge_entries(&ctx, r"C:\game\mods", &real_siblings);
    assert_eq!(merged, vec!["overhaul.dll", "readme.txt"]);
}

#[test]
fn spawned_child_splices_the_rerouted_binary_and_is_marked_for_injection() {
    let ctx = fresh_ctx("pipeline-spawn");
    ctx.link_file(r"C:\real\launcher.exe", r"C:\game\launcher.exe").unwrap();

    let plan = create_process::route_create_process(&ctx, None, r"C:\game\launcher.exe --windowed", &CwdResolver);
    assert_eq!(plan.command_line, r"C:\real\launcher.exe --windowed");
    assert!(plan.inject);
}

#[test]
fn reentrant_dispatch_never_reroutes_twice() {
    let ctx = fresh_ctx("pipeline-reentrant");
    ctx.link_file(r"C:\real\a.txt", r"C:\game\a.txt").unwrap();

    let first = dispatcher::open_file(&ctx, r"C:\game\a.txt", &CwdResolver);
    assert!(first.was_rerouted);

    let (_guard, _active) = usvfs_core::mutex_group::enter(usvfs_core::MutexGroup::OpenFile);
    let nested = dispatcher::open_file(&ctx, r"C:\game\a.txt", &CwdResolver);
    assert!(!nested.was_rerouted);
}
