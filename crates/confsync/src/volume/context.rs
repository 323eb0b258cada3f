//! Volume context parsing and templating.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use confsync_common::{ConfsyncError, ConfsyncResult};

/// Context key holding the configuration source.
pub const URI_KEY: &str = "uri";

/// Context key holding the refresh interval.
pub const UPDATE_INTERVAL_KEY: &str = "updateInterval";

/// Opening delimiter of a template variable key.
const VAR_OPEN: &str = "${";

/// Closing delimiter of a template variable key.
const VAR_CLOSE: &str = "}";

/// Parsed volume context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeContext {
    /// Configuration source.
    pub uri: String,
    /// How often the worker refreshes the data directory.
    pub update_interval: Option<Duration>,
    /// Template variables, keyed by name without delimiters.
    pub variables: BTreeMap<String, String>,
}

impl VolumeContext {
    /// Rebuild the flat parameter map this context was parsed from.
    #[must_use]
    pub fn to_parameters(&self) -> HashMap<String, String> {
        let mut parameters = HashMap::with_capacity(self.variables.len() + 2);
        parameters.insert(URI_KEY.to_string(), self.uri.clone());
        if let Some(interval) = self.update_interval {
            parameters.insert(
                UPDATE_INTERVAL_KEY.to_string(),
                humantime::format_duration(interval).to_string(),
            );
        }
        for (name, value) in &self.variables {
            parameters.insert(format!("{VAR_OPEN}{name}{VAR_CLOSE}"), value.clone());
        }
        parameters
    }

    /// Expand `$name` and `${name}` references inside variable values.
    pub fn expand_variables<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for value in self.variables.values_mut() {
            *value = expand(value, &lookup);
        }
    }
}

/// Parse a raw context map.
pub fn read_volume_context(parameters: &HashMap<String, String>) -> ConfsyncResult<VolumeContext> {
    let uri = parameters
        .get(URI_KEY)
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| ConfsyncError::invalid_argument("uri is required"))?
        .clone();

    let update_interval = match parameters.get(UPDATE_INTERVAL_KEY) {
        Some(raw) if !raw.is_empty() => Some(humantime::parse_duration(raw).map_err(|e| {
            ConfsyncError::invalid_argument(format!("updateInterval invalid value: {e}"))
        })?),
        _ => None,
    };

    let variables = parameters
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(VAR_OPEN)
                .and_then(|k| k.strip_suffix(VAR_CLOSE))
                .map(|name| (name.to_string(), value.clone()))
        })
        .collect();

    Ok(VolumeContext {
        uri,
        update_interval,
        variables,
    })
}

/// Shell-style expansion. Unknown names expand to nothing; a `$` that does
/// not start a reference is kept as is.
fn expand<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len > 0 {
                out.push_str(&lookup(&after[..len]).unwrap_or_default());
                rest = &after[len..];
                continue;
            }
        }

        out.push('$');
        rest = after;
    }
    out.push_str(rest);
    out
}
