use std::{collections::HashMap, path::PathBuf};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    config::{IdMap, DRIVER_NAME},
    HardlinksError, HardlinksResult,
};

use super::Driver;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Constructs a driver from a home directory, driver options, UID maps and GID maps.
pub type DriverInitFn = fn(
    PathBuf,
    Vec<String>,
    Vec<IdMap>,
    Vec<IdMap>,
) -> BoxFuture<'static, HardlinksResult<Box<dyn Driver>>>;

/// A table of driver constructors keyed by driver name.
///
/// ## Examples
///
/// ```no_run
/// use hardlinkfs::driver::{ProtoDriver, Registry};
///
/// # async fn example() -> anyhow::Result<()> {
/// let registry = Registry::with_defaults();
/// let driver = registry
///     .get_driver("hardlinks", "/var/lib/hardlinks", &[], vec![], vec![])
///     .await?;
/// assert_eq!(driver.name(), "hardlinks");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Registry {
    drivers: HashMap<String, DriverInitFn>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the hardlinks driver registered under `"hardlinks"`.
    pub fn with_defaults() -> Self {
        let mut drivers = HashMap::new();
        drivers.insert(DRIVER_NAME.to_string(), init_hardlinks as DriverInitFn);
        Self { drivers }
    }

    /// Registers a driver constructor under `name`.
    ///
    /// ## Errors
    ///
    /// Returns [`HardlinksError::DriverAlreadyRegistered`] if `name` is taken.
    pub fn register(&mut self, name: impl Into<String>, init: DriverInitFn) -> HardlinksResult<()> {
        let name = name.into();
        if self.drivers.contains_key(&name) {
            return Err(HardlinksError::DriverAlreadyRegistered(name));
        }

        tracing::debug!("Registered driver {}", name);
        self.drivers.insert(name, init);
        Ok(())
    }

    /// Returns the registered driver names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Constructs the driver registered under `name`.
    ///
    /// ## Errors
    ///
    /// Returns [`HardlinksError::DriverNotRegistered`] for unknown names, or whatever the driver
    /// constructor fails with.
    pub async fn get_driver(
        &self,
        name: &str,
        home: impl Into<PathBuf>,
        options: &[String],
        uid_maps: Vec<IdMap>,
        gid_maps: Vec<IdMap>,
    ) -> HardlinksResult<Box<dyn Driver>> {
        let init = self
            .drivers
            .get(name)
            .ok_or_else(|| HardlinksError::DriverNotRegistered(name.to_string()))?;

        init(home.into(), options.to_vec(), uid_maps, gid_maps).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn init_hardlinks(
    home: PathBuf,
    options: Vec<String>,
    uid_maps: Vec<IdMap>,
    gid_maps: Vec<IdMap>,
) -> BoxFuture<'static, HardlinksResult<Box<dyn Driver>>> {
    async move {
        let driver = super::init(home, &options, uid_maps, gid_maps).await?;
        Ok(Box::new(driver) as Box<dyn Driver>)
    }
    .boxed()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
