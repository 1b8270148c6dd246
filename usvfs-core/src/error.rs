// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

use std::io;

/// Errors surfaced by the core engine.
///
/// Per the error-handling design: path-syntax problems and tree misses are
/// not represented here at all (they show up as `Reroute::was_rerouted ==
/// false`, not as `Err`). Only conditions that a caller must react to -
/// exhausted shared storage, a malformed mapping file, a link that targets
/// a nonexistent parent - are errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The shared-memory arena backing a `Tree` has no room left for another
    /// node or string. The arena never reclaims detached-node storage (see
    /// DESIGN.md), so long-running hosts should size the region generously.
    #[error("redirection tree storage exhausted (capacity {capacity} bytes)")]
    ArenaFull { capacity: usize },

    /// A link's destination parent directory does not exist in the tree and
    /// was not created implicitly. Mirrors `VirtualLinkFile` returning
    /// `false` on a nonexistent parent (spec scenario 3).
    #[error("link destination parent does not exist: {0}")]
    NoSuchParent(String),

    /// A `link_directory_static` source does not exist on disk.
    #[error("link source does not exist: {0}")]
    NoSuchSource(String),

    #[error("malformed virtual-mapping file at line {line}: {message}")]
    MappingSyntax { line: usize, message: String },

    #[error("process injection failed: {0}")]
    Injection(String),

    #[error("path exceeds the maximum representable length")]
    PathTooLong,
}

pub type Result<T> = std::result::Result<T, Error>;
