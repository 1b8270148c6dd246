// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Platform-agnostic engine logic for the userspace virtual filesystem:
//! path canonicalization (C1), the redirection tree (C2), the rerouter
//! (C3), process-wide shared state (C5), and the virtual-mapping file
//! format. The Windows-specific hook dispatcher (C4) and injection control
//! plane (C6) live in `usvfs-hooks`, which depends on this crate.

pub mod context;
pub mod error;
pub mod mapping;
pub mod mutex_group;
pub mod path;
pub mod reroute;
pub mod tree;

pub use context::{Context, CrashDumpsType, LogLevel, Parameters, RedirectionTables};
pub use error::{Error, Result};
pub use mutex_group::MutexGroup;
pub use reroute::{reroute, reroute_new, should_force_copy_allowed, Reroute};
pub use tree::{NodeData, NodeHandle, Tree};
