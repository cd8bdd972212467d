//! Typed view of the `Create` options map.

use std::collections::HashMap;
use std::hash::BuildHasher;

use tracing::warn;

/// Option key overriding the backing cloud volume id.
pub const VOLUME_ID_OPTION: &str = "volume_id";

/// Option key naming the service tag to resolve a volume by.
pub const SERVICE_OPTION: &str = "service";

/// Options accepted by `Create`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateOptions {
    /// Explicit backing cloud volume id.
    pub volume_id: Option<String>,
    /// Service tag passed to the cloud volume lookup.
    pub service: Option<String>,
}

impl CreateOptions {
    /// Builds options from the untyped request map.
    ///
    /// Blank values count as absent. Unrecognised keys are ignored and
    /// logged.
    #[must_use]
    pub fn from_map<H: BuildHasher>(options: &HashMap<String, String, H>) -> Self {
        let mut parsed = Self::default();
        let mut entries = options.iter().collect::<Vec<_>>();
        entries.sort();

        for (key, value) in entries {
            match key.as_str() {
                VOLUME_ID_OPTION => parsed.volume_id = non_blank(value),
                SERVICE_OPTION => parsed.service = non_blank(value),
                other => warn!(option = other, "ignoring unrecognised create option"),
            }
        }
        parsed
    }

    /// Options carrying only an explicit volume id.
    #[must_use]
    pub fn with_volume_id(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: Some(volume_id.into()),
            service: None,
        }
    }

    /// Options carrying only a service tag.
    #[must_use]
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            volume_id: None,
            service: Some(service.into()),
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn recognised_keys_are_parsed() {
        let options = CreateOptions::from_map(&map(&[("volume_id", "vol-1"), ("service", "db")]));
        assert_eq!(options.volume_id.as_deref(), Some("vol-1"));
        assert_eq!(options.service.as_deref(), Some("db"));
    }

    #[rstest]
    #[case(&[("size", "10"), ("fstype", "xfs")])]
    #[case(&[("volume_id", "  ")])]
    #[case(&[])]
    fn other_input_yields_empty_options(#[case] pairs: &[(&str, &str)]) {
        assert_eq!(CreateOptions::from_map(&map(pairs)), CreateOptions::default());
    }
}
