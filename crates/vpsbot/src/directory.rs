//! User directory used to resolve legacy `name#discriminator` owners.

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use vps_store::{StaticResolver, UserId};

/// Load the directory file. Missing or corrupt files yield an empty
/// directory, which leaves legacy lines unmigrated until the next start.
pub fn load(path: &Path) -> StaticResolver {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<HashMap<String, UserId>>(&content) {
            Ok(entries) => {
                debug!(path = %path.display(), count = entries.len(), "loaded user directory");
                StaticResolver::new(entries)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt user directory, ignoring");
                StaticResolver::default()
            }
        },
        Err(_) => {
            debug!(path = %path.display(), "no user directory");
            StaticResolver::default()
        }
    }
}
