// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! `CreateProcess` family handling: resolving which binary is actually
//! being launched when `lpApplicationName` is null (ported from the
//! original's `getBinaryName`), splicing a rerouted path back into
//! `lpCommandLine` without disturbing the rest of the argument string, and
//! deciding that every injected child starts suspended so the DLL can be
//! loaded before any of its own code runs.

use usvfs_core::mutex_group::{self, MutexGroup};
use usvfs_core::path::FullPathResolver;
use usvfs_core::{reroute, Context, Reroute};

/// Extract the first whitespace- or quote-delimited token of a Windows
/// command line, the same rule `CreateProcess` itself uses to find the
/// binary when `lpApplicationName` is null.
pub fn parse_first_token(command_line: &str) -> Option<&str> {
    let trimmed = command_line.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix('"') {
        let end = rest.find('"')?;
        Some(&rest[..end])
    } else {
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        Some(&trimmed[..end])
    }
}

/// `getBinaryName`: prefer an explicit `lpApplicationName`, falling back to
/// the command line's first token. The original additionally probes the
/// filesystem (appending `.exe`, searching `PATH`) when neither resolves to
/// an existing file; that disk-touching half of the fallback lives in
/// `hooks_win.rs`, which is the only place that can legitimately ask the
/// real, un-hooked filesystem.
pub fn binary_name(application_name: Option<&str>, command_line: &str) -> Option<String> {
    if let Some(app) = application_name {
        if !app.is_empty() {
            return Some(app.to_string());
        }
    }
    parse_first_token(command_line).map(str::to_string)
}

/// Replace `lpCommandLine`'s first token with `new_binary_path`, preserving
/// every argument after it byte-for-byte and re-quoting only if the new
/// path itself needs it.
pub fn splice_command_line(original_command_line: &str, new_binary_path: &str) -> String {
    let trimmed = original_command_line.trim_start();
    let rest = if let Some(body) = trimmed.strip_prefix('"') {
        match body.find('"') {
            Some(end) => &body[end + 1..],
            None => "",
        }
    } else {
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        &trimmed[end..]
    };
    if new_binary_path.contains(' ') && !new_binary_path.starts_with('"') {
        format!("\"{new_binary_path}\"{rest}")
    } else {
        format!("{new_binary_path}{rest}")
    }
}

/// A disabled scaffold (ported unused, per the original): process names an
/// integration may want to exclude from injection entirely (launchers that
/// immediately re-exec themselves, for instance). `Context::create` accepts
/// a `process_blacklist` list, but no `CreateProcess` hook path consults
/// this function yet - the original ships the same check permanently
/// disabled, pending a decision on how an integration would populate it.
#[allow(dead_code)]
fn is_blacklisted(binary_name: &str, blacklist: &[String]) -> bool {
    blacklist.iter().any(|entry| entry.eq_ignore_ascii_case(binary_name))
}

/// The outcome of rerouting a `CreateProcess` call: the (possibly
/// rewritten) application name and command line to hand to the real API,
/// plus whether injection should run at all for this launch.
pub struct CreateProcessPlan {
    pub application_name: Option<String>,
    pub command_line: String,
    pub inject: bool,
}

/// Route a `CreateProcess(Internal)W` call: reroute whichever of
/// `lpApplicationName`/the command line's binary names an existing virtual
/// link, and mark the launch for suspended-start injection whenever that
/// happened, so the child sees the same redirection tree as its parent.
pub fn route_create_process(
    ctx: &Context,
    application_name: Option<&str>,
    command_line: &str,
    resolver: &dyn FullPathResolver,
) -> CreateProcessPlan {
    let (_guard, active) = mutex_group::enter(MutexGroup::CreateProcess);
    if !active {
        return CreateProcessPlan {
            application_name: application_name.map(str::to_string),
            command_line: command_line.to_string(),
            inject: false,
        };
    }

    let Some(binary) = binary_name(application_name, command_line) else {
        return CreateProcessPlan {
            application_name: application_name.map(str::to_string),
            command_line: command_line.to_string(),
            inject: true,
        };
    };

    let Reroute {
        result, was_rerouted, ..
    } = reroute(&ctx.tables.main, &binary, resolver);

    if !was_rerouted {
        return CreateProcessPlan {
            application_name: application_name.map(str::to_string),
            command_line: command_line.to_string(),
            inject: true,
        };
    }

    let new_application_name = application_name.map(|_| result.clone());
    let new_command_line = if application_name.is_some() {
        command_line.to_string()
    } else {
        splice_command_line(command_line, &result)
    };

    CreateProcessPlan {
        application_name: new_application_name,
        command_line: new_command_line,
        inject: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usvfs_core::context::Parameters;
    use usvfs_core::path::CwdResolver;

    fn fresh_ctx(name: &str) -> Context {
        Context::isolated(Parameters {
            instance_name: name.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn parses_quoted_first_token() {
        assert_eq!(
            parse_first_token(r#""C:\Program Files\x\a.exe" --flag"#),
            Some(r"C:\Program Files\x\a.exe")
        );
    }

    #[test]
    fn parses_unquoted_first_token() {
        assert_eq!(parse_first_token(r"C:\a.exe --flag"), Some(r"C:\a.exe"));
    }

    #[test]
    fn binary_name_prefers_explicit_application_name() {
        assert_eq!(
            binary_name(Some(r"C:\a.exe"), r"ignored --flag"),
            Some(r"C:\a.exe".to_string())
        );
    }

    #[test]
    fn binary_name_falls_back_to_command_line() {
        assert_eq!(binary_name(None, r"C:\a.exe --flag"), Some(r"C:\a.exe".to_string()));
    }

    #[test]
    fn splice_preserves_trailing_arguments() {
        let spliced = splice_command_line(r#""C:\old\a.exe" --flag value"#, r"D:\new\a.exe");
        assert_eq!(spliced, r"D:\new\a.exe --flag value");
    }

    #[test]
    fn splice_requotes_when_new_path_has_spaces() {
        let spliced = splice_command_line(r"C:\old\a.exe --flag", r"D:\new dir\a.exe");
        assert_eq!(spliced, r#""D:\new dir\a.exe" --flag"#);
    }

    #[test]
    fn route_create_process_splices_rerouted_binary_from_command_line() {
        let ctx = fresh_ctx("createprocess-splice");
        ctx.link_file(r"D:\real\notepad.exe", r"C:\np.exe").unwrap();
        let plan = route_create_process(&ctx, None, r"C:\np.exe --flag", &CwdResolver);
        assert!(plan.inject);
        assert_eq!(plan.command_line, r"D:\real\notepad.exe --flag");
        assert!(plan.application_name.is_none());
    }

    #[test]
    fn route_create_process_rewrites_explicit_application_name() {
        let ctx = fresh_ctx("createprocess-appname");
        ctx.link_file(r"D:\real\notepad.exe", r"C:\np.exe").unwrap();
        let plan = route_create_process(&ctx, Some(r"C:\np.exe"), r"np.exe --flag", &CwdResolver);
        assert_eq!(plan.application_name.as_deref(), Some(r"D:\real\notepad.exe"));
        assert_eq!(plan.command_line, r"np.exe --flag");
    }

    #[test]
    fn blacklist_check_matches_case_insensitively() {
        let list = vec!["launcher.exe".to_string()];
        assert!(is_blacklisted("LAUNCHER.EXE", &list));
        assert!(!is_blacklisted("game.exe", &list));
    }
}
