use std::{fmt, str::FromStr};

use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::{HardlinksError, HardlinksResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A contiguous range of container IDs mapped onto host IDs.
///
/// ## Format
/// An ID map is written as `container_id:host_id:size`, so `0:100000:65536` maps container IDs
/// `0..65536` onto host IDs `100000..165536`.
///
/// ## Examples
///
/// ```
/// use hardlinkfs::config::IdMap;
///
/// let map = "0:100000:65536".parse::<IdMap>().unwrap();
/// assert_eq!(map.to_host(0), Some(100000));
/// assert_eq!(map.to_host(65536), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// The first ID inside the container.
    pub container_id: u32,

    /// The host ID the first container ID maps to.
    pub host_id: u32,

    /// The number of IDs in the range.
    pub size: u32,
}

/// The UID and GID mapping tables a driver applies to the files it creates.
///
/// Empty tables mean no remapping: created files keep the ownership of the running process and
/// extracted files keep the ownership recorded in the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct IdMappings {
    /// UID ranges.
    uids: Vec<IdMap>,

    /// GID ranges.
    gids: Vec<IdMap>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IdMap {
    /// Creates a new ID map.
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Translates a container ID into a host ID, if the ID falls inside this range.
    pub fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

impl IdMappings {
    /// Creates new mapping tables.
    pub fn new(uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        Self { uids, gids }
    }

    /// Returns `true` if neither UIDs nor GIDs are remapped.
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    /// Translates a container UID into a host UID.
    pub fn to_host_uid(&self, uid: u32) -> HardlinksResult<u32> {
        to_host(&self.uids, uid, "uid")
    }

    /// Translates a container GID into a host GID.
    pub fn to_host_gid(&self, gid: u32) -> HardlinksResult<u32> {
        to_host(&self.gids, gid, "gid")
    }

    /// Returns the host UID and GID that container root maps to.
    ///
    /// Returns `None` when no mappings are configured, in which case directories are created with
    /// the ownership of the running process.
    pub fn root_pair(&self) -> HardlinksResult<Option<(u32, u32)>> {
        if self.is_empty() {
            return Ok(None);
        }

        Ok(Some((self.to_host_uid(0)?, self.to_host_gid(0)?)))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn to_host(maps: &[IdMap], id: u32, kind: &str) -> HardlinksResult<u32> {
    if maps.is_empty() {
        return Ok(id);
    }

    maps.iter()
        .find_map(|map| map.to_host(id))
        .ok_or_else(|| {
            HardlinksError::InvalidIdMapping(format!("container {kind} {id} is not mapped"))
        })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for IdMap {
    type Err = HardlinksError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split(':').map(str::trim).collect::<Vec<_>>();
        let &[container_id, host_id, size] = parts.as_slice() else {
            return Err(HardlinksError::InvalidIdMapping(s.to_string()));
        };

        let parse = |value: &str| {
            value
                .parse::<u32>()
                .map_err(|_| HardlinksError::InvalidIdMapping(s.to_string()))
        };

        let map = IdMap::new(parse(container_id)?, parse(host_id)?, parse(size)?);
        if map.size == 0 {
            return Err(HardlinksError::InvalidIdMapping(s.to_string()));
        }

        Ok(map)
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
