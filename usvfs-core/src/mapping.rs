// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! The virtual-mapping file format (spec §6): a small line-oriented
//! language for describing a batch of links to apply at startup, so a host
//! integration doesn't have to hand-call `link_file`/`link_directory_static`
//! for every entry.
//!
//! ```text
//! # mod "Better Inventory" overlay
//! mapdircreate C:\Game\saves
//!     D:\mods\better-inventory\saves
//!
//! mapdir C:\Game\data
//!     D:\mods\better-inventory\data
//!     D:\mods\ui-overhaul\data
//!
//! mapfile C:\Game\bin\config.ini
//!     D:\mods\better-inventory\config.ini
//! ```
//!
//! A directive line starts in column 0; one or more indented lines below it
//! list the real source paths to link under that destination, applied in
//! file order so a later source wins on a name collision (matching
//! [`crate::tree::Tree`]'s replace-on-collision insert). `#` starts a
//! comment that runs to the end of the line; blank lines are ignored
//! anywhere.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::tree::{LINKFLAG_CREATETARGET, LINKFLAG_RECURSIVE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Directive {
    Dir,
    DirCreate,
    File,
}

impl Directive {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "mapdir" => Some(Directive::Dir),
            "mapdircreate" => Some(Directive::DirCreate),
            "mapfile" => Some(Directive::File),
            _ => None,
        }
    }
}

/// One parsed directive: link `sources` (in order) under `dest`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub directive: &'static str,
    pub dest: String,
    pub sources: Vec<String>,
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Parse mapping-file text into a list of entries, without applying them -
/// split out from [`apply`] so the diagnostic CLI can print what a file
/// would do before running it.
pub fn parse(text: &str) -> Result<Vec<Entry>> {
    let mut entries: Vec<Entry> = Vec::new();
    let mut current: Option<Entry> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let stripped = strip_comment(raw_line);
        if stripped.trim().is_empty() {
            continue;
        }

        let is_indented = raw_line.starts_with(' ') || raw_line.starts_with('\t');
        if is_indented {
            let source = stripped.trim();
            let Some(entry) = current.as_mut() else {
                return Err(Error::MappingSyntax {
                    line: line_no,
                    message: "source path given before any mapdir/mapdircreate/mapfile directive"
                        .to_string(),
                });
            };
            entry.sources.push(source.to_string());
            continue;
        }

        if let Some(finished) = current.take() {
            entries.push(finished);
        }

        let mut words = stripped.trim().splitn(2, char::is_whitespace);
        let keyword = words.next().unwrap_or_default();
        let Some(directive) = Directive::parse(keyword) else {
            return Err(Error::MappingSyntax {
                line: line_no,
                message: format!("unknown directive '{keyword}'"),
            });
        };
        let dest = words.next().unwrap_or_default().trim();
        if dest.is_empty() {
            return Err(Error::MappingSyntax {
                line: line_no,
                message: format!("{keyword} requires a destination path"),
            });
        }

        current = Some(Entry {
            directive: match directive {
                Directive::Dir => "mapdir",
                Directive::DirCreate => "mapdircreate",
                Directive::File => "mapfile",
            },
            dest: dest.to_string(),
            sources: Vec::new(),
        });
    }
    if let Some(finished) = current.take() {
        entries.push(finished);
    }

    for entry in &entries {
        if entry.sources.is_empty() {
            return Err(Error::MappingSyntax {
                line: 0,
                message: format!("{} {} has no source paths", entry.directive, entry.dest),
            });
        }
        if entry.directive == "mapfile" && entry.sources.len() > 1 {
            return Err(Error::MappingSyntax {
                line: 0,
                message: format!("mapfile {} names more than one source", entry.dest),
            });
        }
    }

    Ok(entries)
}

/// Parse and apply a mapping file's directives against `ctx`'s redirection
/// tables, in file order.
pub fn apply(ctx: &Context, text: &str) -> Result<()> {
    for entry in parse(text)? {
        match entry.directive {
            "mapfile" => {
                ctx.link_file(&entry.sources[0], &entry.dest)?;
            }
            "mapdir" => {
                for source in &entry.sources {
                    ctx.link_directory_static(source, &entry.dest, LINKFLAG_RECURSIVE)?;
                }
            }
            "mapdircreate" => {
                for source in &entry.sources {
                    ctx.link_directory_static(
                        source,
                        &entry.dest,
                        LINKFLAG_RECURSIVE | LINKFLAG_CREATETARGET,
                    )?;
                }
            }
            other => unreachable!("unhandled directive {other}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_mapfile_entry() {
        let entries = parse("mapfile C:\\Game\\bin\\config.ini\n    D:\\mods\\a\\config.ini\n").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].directive, "mapfile");
        assert_eq!(entries[0].dest, r"C:\Game\bin\config.ini");
        assert_eq!(entries[0].sources, vec![r"D:\mods\a\config.ini"]);
    }

    #[test]
    fn multiple_sources_merge_under_one_mapdir() {
        let text = "mapdir C:\\Game\\data\n    D:\\mods\\a\\data\n    D:\\mods\\b\\data\n";
        let entries = parse(text).unwrap();
        assert_eq!(entries[0].sources.len(), 2);
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let text = "# a comment\n\nmapfile C:\\x # trailing comment\n    D:\\y\n\n# trailing\n";
        let entries = parse(text).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dest, "C:\\x");
    }

    #[test]
    fn unknown_directive_is_a_syntax_error() {
        let err = parse("bogus C:\\x\n    D:\\y\n").unwrap_err();
        assert!(matches!(err, Error::MappingSyntax { line: 1, .. }));
    }

    #[test]
    fn source_before_any_directive_is_a_syntax_error() {
        let err = parse("    D:\\y\n").unwrap_err();
        assert!(matches!(err, Error::MappingSyntax { line: 1, .. }));
    }

    #[test]
    fn mapfile_with_multiple_sources_is_rejected() {
        let err = parse("mapfile C:\\x\n    D:\\a\n    D:\\b\n").unwrap_err();
        assert!(matches!(err, Error::MappingSyntax { .. }));
    }

    #[test]
    fn directive_without_destination_is_rejected() {
        let err = parse("mapdir\n    D:\\a\n").unwrap_err();
        assert!(matches!(err, Error::MappingSyntax { line: 1, .. }));
    }

    #[test]
    fn apply_links_entries_into_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ini"), b"hi").unwrap();
        let source = dir.path().join("config.ini").to_string_lossy().into_owned();
        let text = format!("mapfile C:\\config.ini\n    {source}\n");

        let ctx = Context::isolated(crate::context::Parameters {
            instance_name: "mapping-test".to_string(),
            ..Default::default()
        })
        .unwrap();
        apply(&ctx, &text).unwrap();
        assert!(ctx.tables.main.find_node(r"C:\config.ini").is_some());
    }
}
