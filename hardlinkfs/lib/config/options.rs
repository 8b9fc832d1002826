use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{HardlinksError, HardlinksResult};

use super::{INIT_LAYER_SUFFIX, READONLY_MOUNTS_OPTION};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration of a hardlinks driver instance.
///
/// The configuration is usually parsed from the `key=value` option strings handed to the driver
/// at initialization, but it can also be loaded from TOML or built directly.
///
/// ## Options
///
/// * `hardlinks.readonly_mounts` - When `true`, layers are bind mounted read-only, except for
///   layers whose id ends with `-init`. Defaults to `false`.
///
/// ## Examples
///
/// ```
/// use hardlinkfs::config::DriverConfig;
///
/// let config = DriverConfig::from_options(&["hardlinks.readonly_mounts=true"]).unwrap();
/// assert!(config.get_readonly_mounts());
///
/// let config = DriverConfig::builder().build();
/// assert!(!config.get_readonly_mounts());
/// ```
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters,
)]
#[serde(default)]
#[getset(get_copy = "pub with_prefix")]
pub struct DriverConfig {
    /// Whether bind mounts of non-init layers are read-only.
    #[builder(default)]
    readonly_mounts: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DriverConfig {
    /// Parses driver options of the form `key=value`.
    ///
    /// ## Errors
    ///
    /// Returns [`HardlinksError::InvalidOption`] if an option is malformed, unknown, or has a value
    /// of the wrong type.
    pub fn from_options(options: &[impl AsRef<str>]) -> HardlinksResult<Self> {
        let mut config = Self::default();

        for option in options {
            let option = option.as_ref();
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| HardlinksError::InvalidOption(option.to_string()))?;

            match key.trim().to_lowercase().as_str() {
                READONLY_MOUNTS_OPTION => {
                    config.readonly_mounts = value.trim().parse::<bool>().map_err(|_| {
                        HardlinksError::InvalidOption(format!(
                            "{READONLY_MOUNTS_OPTION} expects a boolean, got {value:?}"
                        ))
                    })?;
                }
                _ => return Err(HardlinksError::InvalidOption(option.to_string())),
            }
        }

        Ok(config)
    }

    /// Loads the configuration from a TOML document.
    pub fn from_toml(source: &str) -> HardlinksResult<Self> {
        toml::from_str(source).map_err(HardlinksError::custom)
    }

    /// Returns the bind mount options to use for the given layer.
    pub fn mount_options(&self, id: &str) -> &'static str {
        if self.readonly_mounts && !id.ends_with(INIT_LAYER_SUFFIX) {
            "bind,ro"
        } else {
            "bind"
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
