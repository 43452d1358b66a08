//! Converts MapReduce application names to actual application code.
//!
//! The master names the application of a job in the job's `code` field;
//! the worker's execution thread resolves it here.
//!
//! ```
//! let wc = workload::named("wc").unwrap();
//! ```

use anyhow::{bail, Result};
use common::Workload;

pub mod grep;
pub mod vertex_degree;
pub mod wc;

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" => Some(Workload {
            map_fn: wc::map,
            reduce_fn: wc::reduce,
        }),
        "grep" => Some(Workload {
            map_fn: grep::map,
            reduce_fn: grep::reduce,
        }),
        "vertex-degree" => Some(Workload {
            map_fn: vertex_degree::map,
            reduce_fn: vertex_degree::reduce,
        }),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no application with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("The workload `{name}` is not a known workload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_names() {
        assert!(try_named("wc").is_some());
        assert!(try_named("grep").is_some());
        assert!(try_named("vertex-degree").is_some());
        assert!(named("matrix").is_err());
    }
}
