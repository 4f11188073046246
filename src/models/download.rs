//! Download tracking types: the project/version identity parsed out of a
//! resource key, and the event reported to the accounting backend.

use serde::Serialize;
use std::collections::HashMap;

/// Project and version a downloaded file belongs to.
///
/// Derived from keys shaped like `data/<project_id>/versions/<version_id>/<file>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub project_id: String,
    pub version_id: String,
}

impl ResourceIdentity {
    /// Parse the identity out of a resource key.
    ///
    /// The project id is the segment right after the first `data` segment and
    /// the version id the segment right after the first `versions` segment.
    /// Returns `None` when either anchor is missing or has nothing after it.
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.split('/').collect();

        let project_id = segment_after(&segments, "data")?;
        let version_id = segment_after(&segments, "versions")?;

        Some(Self {
            project_id: project_id.to_string(),
            version_id: version_id.to_string(),
        })
    }
}

fn segment_after<'a>(segments: &[&'a str], anchor: &str) -> Option<&'a str> {
    let index = segments.iter().position(|segment| *segment == anchor)?;
    segments
        .get(index + 1)
        .copied()
        .filter(|segment| !segment.is_empty())
}

/// Body of the `PATCH /admin/_count-download` call.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DownloadEvent {
    /// Absolute URL the client requested.
    pub url: String,
    pub project_id: String,
    pub version_name: String,
    /// Client IP as reported by the edge header, `127.0.0.1` when absent.
    pub ip: String,
    /// Every inbound request header, flattened.
    pub headers: HashMap<String, String>,
}
